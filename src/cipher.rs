//! The AEAD session cipher and the ECC hybrid encryption used once during
//! the handshake to deliver the session key to the controller.

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::{Result, TunnelError};

/// `encrypt(plaintext) -> ciphertext`, `decrypt(ciphertext) -> plaintext`.
/// Authenticated; authentication failure surfaces as
/// [`TunnelError::InvalidResponse`].
pub trait CipherContext: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 AEAD context keyed by the session's symmetric key.
/// The nonce is generated fresh per call and prepended to the ciphertext.
pub struct ChaCha20Poly1305Context {
    cipher: ChaCha20Poly1305,
}

impl ChaCha20Poly1305Context {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }
}

impl CipherContext for ChaCha20Poly1305Context {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TunnelError::InvalidResponse)?;
        let mut out = nonce.to_vec();
        out.append(&mut sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < 12 {
            return Err(TunnelError::InvalidResponse);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, sealed)
            .map_err(|_| TunnelError::InvalidResponse)
    }
}

/// `encrypt_to_server(bytes) -> bytes`, used once during `init` to deliver
/// the freshly generated session key to the controller's long-term public
/// key.
pub trait EccEncryptor: Send + Sync {
    fn encrypt_to_server(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// Minimal ECIES-style hybrid scheme: an ephemeral X25519 key agreement
/// against the controller's static public key, a BLAKE2s-derived
/// symmetric key, and a ChaCha20-Poly1305 seal. The wire format is
/// `ephemeral_public(32) || nonce(12) || ciphertext`.
pub struct X25519HybridEncryptor {
    server_public_key: PublicKey,
}

impl X25519HybridEncryptor {
    pub fn new(server_public_key: [u8; 32]) -> Self {
        Self {
            server_public_key: PublicKey::from(server_public_key),
        }
    }

    fn derive_key(shared_secret: &x25519_dalek::SharedSecret) -> [u8; 32] {
        let mut hasher = Blake2s256::new();
        hasher.update(shared_secret.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }
}

impl EccEncryptor for X25519HybridEncryptor {
    fn encrypt_to_server(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(&self.server_public_key);
        let key = Self::derive_key(&shared);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| TunnelError::InvalidResponse)?;

        let mut out = Vec::with_capacity(32 + 12 + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}
