// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-crypto
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Envelope encryption of the assembled per-order environment map to an
//! age-style X25519 recipient key, producing the `secrets.enc.json`
//! ciphertext the repackager ships in every execution archive.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;

/// Errors from envelope encryption/decryption.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A base64 field in a [`Keypair`] or [`EnvelopeCiphertext`] did not decode.
    #[error("invalid base64 in {field}: {source}")]
    Base64 {
        /// Which field failed to decode.
        field: &'static str,
        /// Underlying decode error.
        #[source]
        source: base64::DecodeError,
    },
    /// A decoded key was not exactly 32 bytes.
    #[error("{field} must decode to 32 bytes, got {len}")]
    BadKeyLength {
        /// Which field was malformed.
        field: &'static str,
        /// The length actually observed.
        len: usize,
    },
    /// AES-GCM encryption failed.
    #[error("envelope encryption failed")]
    EncryptFailed,
    /// AES-GCM decryption failed (wrong key or corrupt ciphertext).
    #[error("envelope decryption failed")]
    DecryptFailed,
    /// The decrypted plaintext was not valid JSON mapping strings to strings.
    #[error("decrypted payload is not a valid env map: {0}")]
    MalformedPlaintext(#[from] serde_json::Error),
}

/// A freshly generated X25519 keypair, base64-encoded for transport/storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    /// Base64-encoded public (recipient) key.
    pub public: String,
    /// Base64-encoded private key. Never embedded in the archive; the
    /// caller persists it in the secret store.
    pub private: String,
}

/// Generate a fresh X25519 keypair using the OS RNG.
pub fn generate_keypair() -> Keypair {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Keypair {
        public: b64_encode(public.as_bytes()),
        private: b64_encode(&secret.to_bytes()),
    }
}

/// The JSON ciphertext shape written as `secrets.enc.json`.
///
/// An ephemeral X25519 keypair is generated per encryption; the shared
/// secret from `ephemeral_secret.diffie_hellman(recipient_public)` derives
/// an AES-256-GCM key via SHA-256, so only the recipient's private key can
/// recover the plaintext.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnvelopeCiphertext {
    /// Base64-encoded recipient public key the payload was encrypted to.
    pub recipient: String,
    /// Base64-encoded ephemeral public key generated for this encryption.
    pub ephemeral_public: String,
    /// Base64-encoded AES-GCM nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext (including the GCM authentication tag).
    pub ciphertext: String,
}

fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn b64_decode(field: &'static str, s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|source| CryptoError::Base64 { field, source })
}

fn decode_key(field: &'static str, s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = b64_decode(field, s)?;
    if bytes.len() != 32 {
        return Err(CryptoError::BadKeyLength {
            field,
            len: bytes.len(),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn derive_symmetric_key(shared_secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Encrypt an environment map to `recipient_public_b64`, producing the
/// ciphertext JSON shape stored alongside an order's execution archive.
pub fn encrypt_env(
    env: &BTreeMap<String, String>,
    recipient_public_b64: &str,
) -> Result<EnvelopeCiphertext, CryptoError> {
    let recipient_bytes = decode_key("recipient", recipient_public_b64)?;
    let recipient_public = PublicKey::from(recipient_bytes);

    let mut ephemeral_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut ephemeral_bytes);
    let ephemeral_secret = StaticSecret::from(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);

    let shared = ephemeral_secret.diffie_hellman(&recipient_public);
    let key_bytes = derive_symmetric_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::EncryptFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(env).map_err(CryptoError::MalformedPlaintext)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| CryptoError::EncryptFailed)?;

    Ok(EnvelopeCiphertext {
        recipient: recipient_public_b64.to_string(),
        ephemeral_public: b64_encode(ephemeral_public.as_bytes()),
        nonce: b64_encode(&nonce_bytes),
        ciphertext: b64_encode(&ciphertext),
    })
}

/// Decrypt an [`EnvelopeCiphertext`] with the recipient's private key,
/// recovering the original environment map.
pub fn decrypt_env(
    envelope: &EnvelopeCiphertext,
    recipient_private_b64: &str,
) -> Result<BTreeMap<String, String>, CryptoError> {
    let private_bytes = decode_key("private", recipient_private_b64)?;
    let recipient_secret = StaticSecret::from(private_bytes);

    let ephemeral_bytes = decode_key("ephemeral_public", &envelope.ephemeral_public)?;
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let shared = recipient_secret.diffie_hellman(&ephemeral_public);
    let key_bytes = derive_symmetric_key(shared.as_bytes());
    let cipher = Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| CryptoError::DecryptFailed)?;

    let nonce_bytes = b64_decode("nonce", &envelope.nonce)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext_bytes = b64_decode("ciphertext", &envelope.ciphertext)?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext_bytes.as_ref())
        .map_err(|_| CryptoError::DecryptFailed)?;

    let env = serde_json::from_slice(&plaintext)?;
    Ok(env)
}
