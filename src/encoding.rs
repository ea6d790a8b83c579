//! DNS-safe byte/ASCII encoders.
//!
//! Two alphabets are available: a case-insensitive 32-symbol alphabet that
//! survives any resolver (including ones that lowercase labels), and a
//! denser 58-symbol alphabet that only survives resolvers which preserve
//! case end-to-end. Both encoders produce output containing no `.`, so the
//! result is always safe to split into labels.

use data_encoding::{Encoding, Specification};
use std::sync::OnceLock;

/// Injective byte→ASCII mapping legal inside a DNS label.
pub trait Encoder: Send + Sync {
    /// Human-readable name, used for logging and metadata.
    fn name(&self) -> &'static str;

    /// Encode `data` into label-legal ASCII.
    fn encode(&self, data: &[u8]) -> String;

    /// Decode label-legal ASCII back into bytes.
    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, EncodingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("malformed encoded payload")]
    Malformed,
}

fn base32_spec() -> Encoding {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.padding = None;
    spec.encoding().expect("static base32 spec is valid")
}

static BASE32_DNS_CELL: OnceLock<Encoding> = OnceLock::new();

fn base32_dns() -> &'static Encoding {
    BASE32_DNS_CELL.get_or_init(base32_spec)
}

/// Case-insensitive 32-symbol encoder, always available.
pub struct Base32Encoder;

impl Encoder for Base32Encoder {
    fn name(&self) -> &'static str {
        "base32"
    }

    fn encode(&self, data: &[u8]) -> String {
        base32_dns().encode(data)
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let lowered: Vec<u8> = data.iter().map(u8::to_ascii_lowercase).collect();
        base32_dns()
            .decode(&lowered)
            .map_err(|_| EncodingError::Malformed)
    }
}

/// Case-sensitive 58-symbol encoder; excludes `-`, `0`, `O`, `I`, `l`.
///
/// `bs58`'s default (Bitcoin) alphabet already excludes exactly those
/// characters, so no custom alphabet table is needed.
pub struct Base58Encoder;

impl Encoder for Base58Encoder {
    fn name(&self) -> &'static str {
        "base58"
    }

    fn encode(&self, data: &[u8]) -> String {
        bs58::encode(data).into_string()
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, EncodingError> {
        bs58::decode(data)
            .into_vec()
            .map_err(|_| EncodingError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn base32_round_trips_random_bytes() {
        let enc = Base32Encoder;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut buf = vec![0u8; 1 + (rng.next_u32() as usize % 64)];
            rng.fill_bytes(&mut buf);
            let encoded = enc.encode(&buf);
            assert!(encoded.chars().all(|c| c != '.'));
            let decoded = enc.decode(encoded.as_bytes()).unwrap();
            assert_eq!(decoded, buf);
        }
    }

    #[test]
    fn base58_round_trips_random_bytes() {
        let enc = Base58Encoder;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut buf = vec![0u8; 1 + (rng.next_u32() as usize % 64)];
            rng.fill_bytes(&mut buf);
            let encoded = enc.encode(&buf);
            assert!(encoded.chars().all(|c| c != '.'));
            let decoded = enc.decode(encoded.as_bytes()).unwrap();
            assert_eq!(decoded, buf);
        }
    }

    #[test]
    fn base58_alphabet_excludes_ambiguous_characters() {
        let enc = Base58Encoder;
        let encoded = enc.encode(b"the quick brown fox jumps over a lazy dog 0123456789");
        for bad in ['0', 'O', 'I', 'l', '-'] {
            assert!(!encoded.contains(bad), "base58 output contained {bad}");
        }
    }
}
