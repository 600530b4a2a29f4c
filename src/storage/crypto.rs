//! AES-256-GCM sealing shared by the credential vault and encrypted backups.
//!
//! Sealed output is `nonce (12 bytes) || ciphertext || tag`. Associated data
//! binds a blob to its context (owning user, backup id and chunk index), so a
//! blob moved to another context fails to open.

use std::fmt;
use std::num::NonZeroU32;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, pbkdf2};
use thiserror::Error;

/// Key length for AES-256.
pub const KEY_LEN: usize = 32;

/// Salt length used for password-derived keys.
pub const SALT_LEN: usize = 16;

/// PBKDF2 rounds for password-derived keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Errors from sealing and opening.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed")]
    KeyGeneration,

    #[error("invalid key material")]
    InvalidKey,

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed: wrong key or corrupted data")]
    Open,
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// An AEAD key ready to seal and open.
pub struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    /// Builds a cipher from 32 raw key bytes.
    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey);
        }
        let unbound = UnboundKey::new(&AES_256_GCM, bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Derives a cipher from a password and salt with PBKDF2-HMAC-SHA256.
    pub fn derive(password: &str, salt: &[u8]) -> Result<Self> {
        if password.is_empty() {
            return Err(CryptoError::KeyGeneration);
        }
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or(CryptoError::KeyGeneration)?;
        let mut key = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            password.as_bytes(),
            &mut key,
        );
        Self::from_key_bytes(&key)
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Seal)?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Decrypts output of [`Cipher::seal`] made with the same key and `aad`.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::Open);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Open)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), &mut in_out)
            .map_err(|_| CryptoError::Open)?;
        Ok(plaintext.to_vec())
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(AES-256-GCM, key redacted)")
    }
}

/// Fresh random key bytes.
pub fn generate_key() -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| CryptoError::KeyGeneration)?;
    Ok(key)
}

/// Fresh random salt for [`Cipher::derive`].
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CryptoError::KeyGeneration)?;
    Ok(salt)
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    digest::digest(&digest::SHA256, data)
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        Cipher::from_key_bytes(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn seal_then_open() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"hunter2", b"user-1").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"hunter2");
        assert_eq!(cipher.open(&sealed, b"user-1").unwrap(), b"hunter2");
    }

    #[test]
    fn nonces_differ_per_seal() {
        let cipher = test_cipher();
        let a = cipher.seal(b"same", b"").unwrap();
        let b = cipher.seal(b"same", b"").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_aad_fails_to_open() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"secret", b"user-1").unwrap();
        assert!(matches!(cipher.open(&sealed, b"user-2"), Err(CryptoError::Open)));
    }

    #[test]
    fn tampering_is_detected() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"secret", b"").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed, b"").is_err());
        assert!(cipher.open(&[0u8; 4], b"").is_err());
    }

    #[test]
    fn derived_keys_depend_on_password() {
        let salt = [1u8; SALT_LEN];
        let sealed = Cipher::derive("correct horse", &salt)
            .unwrap()
            .seal(b"backup", b"b-1")
            .unwrap();

        let same = Cipher::derive("correct horse", &salt).unwrap();
        assert_eq!(same.open(&sealed, b"b-1").unwrap(), b"backup");
        let wrong = Cipher::derive("battery staple", &salt).unwrap();
        assert!(wrong.open(&sealed, b"b-1").is_err());
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            Cipher::derive("", &[0u8; SALT_LEN]),
            Err(CryptoError::KeyGeneration)
        ));
    }

    #[test]
    fn invalid_key_length() {
        assert!(matches!(
            Cipher::from_key_bytes(&[0u8; 16]),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn debug_redacts_key() {
        assert!(!format!("{:?}", test_cipher()).contains('7'));
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
