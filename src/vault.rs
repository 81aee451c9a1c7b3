//! Credential Vault: envelope-encrypts and decrypts credentials at rest.
//!
//! A single process-wide master key, configured once at startup, derives a
//! per-secret data key via PBKDF2-SHA256. The algorithm tag is fixed and
//! matched exactly — there is no fallback to a weaker scheme, and no second
//! algorithm is supported (spec §9).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

/// The single supported algorithm tag. Any other value on a stored bundle is
/// rejected outright; there is deliberately no version-negotiation path.
pub const ALGORITHM_TAG: &str = "AES-256-GCM/PBKDF2-SHA256/100000";

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Errors the Vault can raise. None of these ever carry plaintext.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("no master key configured for this process")]
    MasterKeyMissing,

    #[error("ciphertext failed authentication")]
    BadCiphertext,

    #[error("unknown or unsupported algorithm tag")]
    UnknownAlgorithm,
}

/// A ciphertext bundle. `Debug` is hand-written to guarantee the ciphertext
/// bytes are never printed as a UTF-8-looking string by accident (invariant:
/// secret confinement).
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedSecret {
    pub algorithm: String,
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub kdf_iterations: u32,
}

impl std::fmt::Debug for EncryptedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSecret")
            .field("algorithm", &self.algorithm)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("salt_len", &self.salt.len())
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Holder of the process-wide master key plus the encrypt/decrypt
/// operations. Constructed once by the runtime and shared behind an `Arc`.
pub struct Vault {
    master_key: Option<Zeroizing<[u8; 32]>>,
}

impl Vault {
    pub fn new(master_key: Option<[u8; 32]>) -> Self {
        Self {
            master_key: master_key.map(Zeroizing::new),
        }
    }

    fn derive_data_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let master_key = self.master_key.as_ref().ok_or(VaultError::MasterKeyMissing)?;
        let mut data_key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(master_key.as_ref(), salt, PBKDF2_ITERATIONS, &mut *data_key);
        Ok(data_key)
    }

    /// Encrypts `plaintext`, returning a bundle tagged with [`ALGORITHM_TAG`].
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, VaultError> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = vec![0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let data_key = self.derive_data_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(data_key.as_ref())
            .expect("32-byte key always valid for AES-256-GCM");

        let mut plaintext_buf = Zeroizing::new(plaintext.as_bytes().to_vec());
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext_buf.as_ref())
            .map_err(|_| VaultError::BadCiphertext)?;
        plaintext_buf.iter_mut().for_each(|b| *b = 0);

        Ok(EncryptedSecret {
            algorithm: ALGORITHM_TAG.to_string(),
            salt,
            nonce: nonce_bytes,
            ciphertext,
            kdf_iterations: PBKDF2_ITERATIONS,
        })
    }

    /// Decrypts `bundle`, returning the plaintext. The returned value lives
    /// only on the caller's stack for the duration of the session-open path;
    /// callers must not retain it beyond that.
    pub fn decrypt(&self, bundle: &EncryptedSecret) -> Result<Zeroizing<String>, VaultError> {
        if bundle.algorithm != ALGORITHM_TAG {
            return Err(VaultError::UnknownAlgorithm);
        }

        let data_key = self.derive_data_key(&bundle.salt)?;
        let cipher = Aes256Gcm::new_from_slice(data_key.as_ref())
            .expect("32-byte key always valid for AES-256-GCM");

        let nonce = Nonce::from_slice(&bundle.nonce);
        let plaintext = cipher
            .decrypt(nonce, bundle.ciphertext.as_ref())
            .map_err(|_| VaultError::BadCiphertext)?;

        let text = String::from_utf8(plaintext).map_err(|_| VaultError::BadCiphertext)?;
        Ok(Zeroizing::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_with_key() -> Vault {
        Vault::new(Some([7u8; 32]))
    }

    #[test]
    fn round_trips_plaintext() {
        let vault = vault_with_key();
        let bundle = vault.encrypt("correct horse battery staple").unwrap();
        assert_eq!(bundle.algorithm, ALGORITHM_TAG);
        let plain = vault.decrypt(&bundle).unwrap();
        assert_eq!(plain.as_str(), "correct horse battery staple");
    }

    #[test]
    fn missing_master_key_fails_encrypt_and_decrypt() {
        let vault = Vault::new(None);
        match vault.encrypt("x") {
            Err(VaultError::MasterKeyMissing) => {}
            other => panic!("expected MasterKeyMissing, got {other:?}"),
        }
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let vault = vault_with_key();
        let mut bundle = vault.encrypt("hunter2").unwrap();
        let last = bundle.ciphertext.len() - 1;
        bundle.ciphertext[last] ^= 0xFF;
        match vault.decrypt(&bundle) {
            Err(VaultError::BadCiphertext) => {}
            other => panic!("expected BadCiphertext, got {other:?}"),
        }
    }

    #[test]
    fn unknown_algorithm_tag_is_rejected() {
        let vault = vault_with_key();
        let mut bundle = vault.encrypt("hunter2").unwrap();
        bundle.algorithm = "AES-128-CBC/MD5/1000".to_string();
        match vault.decrypt(&bundle) {
            Err(VaultError::UnknownAlgorithm) => {}
            other => panic!("expected UnknownAlgorithm, got {other:?}"),
        }
    }

    #[test]
    fn debug_repr_never_contains_plaintext_or_raw_ciphertext_bytes() {
        let vault = vault_with_key();
        let secret = "do-not-leak-me-1234";
        let bundle = vault.encrypt(secret).unwrap();
        let debug_repr = format!("{:?}", bundle);
        assert!(!debug_repr.contains(secret));
        // ciphertext bytes are summarized by length, never emitted verbatim
        assert!(!debug_repr.contains(&format!("{:?}", bundle.ciphertext)));
    }

    #[test]
    fn wrong_master_key_fails_to_decrypt() {
        let vault_a = Vault::new(Some([1u8; 32]));
        let vault_b = Vault::new(Some([2u8; 32]));
        let bundle = vault_a.encrypt("secret-value").unwrap();
        match vault_b.decrypt(&bundle) {
            Err(VaultError::BadCiphertext) => {}
            other => panic!("expected BadCiphertext, got {other:?}"),
        }
    }
}
