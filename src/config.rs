//! Client configuration: resolver list, parent zone, retry policy, and
//! the cryptographic material needed to bootstrap a session.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};

fn default_port() -> u16 {
    53
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_wait_ms() -> u64 {
    200
}

fn default_query_timeout_ms() -> u64 {
    2000
}

fn default_force_base32() -> bool {
    false
}

/// Resolver config collaborator: an ordered list of resolver endpoints, a
/// port, and retry knobs, normally loaded from the platform. Here it is
/// loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fully-qualified parent zone the controller is authoritative for.
    pub parent: String,

    /// Resolver IP addresses, without port.
    pub resolvers: Vec<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_force_base32")]
    pub force_base32: bool,

    /// Controller's long-term X25519 public key, hex-encoded (64 chars).
    pub server_public_key_hex: String,

    /// Shared TOTP seed, hex-encoded.
    pub totp_secret_hex: String,
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| TunnelError::Config(e.to_string()))
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).map_err(|e| TunnelError::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validates structural invariants that `serde` alone cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.resolvers.is_empty() {
            return Err(TunnelError::Config("no resolvers configured".to_string()));
        }
        if self.parent.trim().is_empty() {
            return Err(TunnelError::Config("parent zone must not be empty".to_string()));
        }
        let key_bytes = hex::decode(self.server_public_key_hex.trim())
            .map_err(|e| TunnelError::Config(format!("server_public_key_hex: {e}")))?;
        if key_bytes.len() != 32 {
            return Err(TunnelError::Config(
                "server_public_key_hex must decode to 32 bytes".to_string(),
            ));
        }
        hex::decode(self.totp_secret_hex.trim())
            .map_err(|e| TunnelError::Config(format!("totp_secret_hex: {e}")))?;
        Ok(())
    }

    pub fn resolver_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.resolvers
            .iter()
            .map(|addr| format!("{addr}:{}", self.port))
            .map(|s| {
                s.parse::<SocketAddr>()
                    .map_err(|_| TunnelError::Config(format!("invalid resolver address: {s}")))
            })
            .collect()
    }

    pub fn server_public_key(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(self.server_public_key_hex.trim())
            .map_err(|e| TunnelError::Config(format!("server_public_key_hex: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| TunnelError::Config("server_public_key_hex must be 32 bytes".to_string()))
    }

    pub fn totp_secret(&self) -> Result<Vec<u8>> {
        hex::decode(self.totp_secret_hex.trim())
            .map_err(|e| TunnelError::Config(format!("totp_secret_hex: {e}")))
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientConfig {
        ClientConfig {
            parent: "c2.example.".to_string(),
            resolvers: vec!["198.51.100.1".to_string(), "198.51.100.2".to_string()],
            port: 53,
            retry_count: 3,
            retry_wait_ms: 200,
            query_timeout_ms: 2000,
            force_base32: false,
            server_public_key_hex: "11".repeat(32),
            totp_secret_hex: "deadbeef".to_string(),
        }
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_resolvers() {
        let mut cfg = sample();
        cfg.resolvers.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_short_public_key() {
        let mut cfg = sample();
        cfg.server_public_key_hex = "11".repeat(16);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolver_addrs_combines_host_and_port() {
        let cfg = sample();
        let addrs = cfg.resolver_addrs().unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].port(), 53);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = sample();
        let serialized = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ClientConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.parent, cfg.parent);
        assert_eq!(parsed.resolvers, cfg.resolvers);
    }
}
