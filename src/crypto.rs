//! Cryptographic primitives for the protected KV store
//!
//! This module provides XChaCha20-Poly1305 authenticated encryption for
//! record values and RSA-OAEP wrapping of data encryption keys under the
//! key encryption key loaded from a certificate / private key pair.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, StoreError};

/// XChaCha20-Poly1305 key size in bytes (256 bits)
pub const AEAD_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size in bytes (192 bits)
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size in bytes (128 bits)
pub const AEAD_TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AEAD key
    pub fn generate() -> Self {
        let mut key = vec![0u8; AEAD_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption (24 bytes for XChaCha20-Poly1305)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Create a new EncryptedData container
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }
}

/// XChaCha20-Poly1305 cipher wrapper
pub struct XChaChaCipher;

impl XChaChaCipher {
    /// Encrypt plaintext using XChaCha20-Poly1305.
    ///
    /// A fresh random 24-byte nonce is drawn per call; the returned
    /// ciphertext carries the 16-byte Poly1305 tag appended.
    pub fn encrypt(key: &SecureKey, plaintext: &[u8]) -> Result<EncryptedData> {
        if key.len() != AEAD_KEY_SIZE {
            return Err(StoreError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AEAD_KEY_SIZE,
                key.len()
            )));
        }

        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| StoreError::Crypto(format!("Cipher init error: {e}")))?;

        let mut nonce_bytes = [0u8; AEAD_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::Crypto("Encryption error".into()))?;

        Ok(EncryptedData::new(nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using XChaCha20-Poly1305.
    ///
    /// Fails on any authentication mismatch without reporting a position.
    pub fn decrypt(key: &SecureKey, encrypted: &EncryptedData) -> Result<Vec<u8>> {
        if key.len() != AEAD_KEY_SIZE {
            return Err(StoreError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AEAD_KEY_SIZE,
                key.len()
            )));
        }

        if encrypted.nonce.len() != AEAD_NONCE_SIZE {
            return Err(StoreError::Crypto(format!(
                "Invalid nonce size: expected {}, got {}",
                AEAD_NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }

        let cipher = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| StoreError::Crypto(format!("Cipher init error: {e}")))?;

        let nonce = XNonce::from_slice(&encrypted.nonce);

        cipher
            .decrypt(nonce, encrypted.ciphertext.as_slice())
            .map_err(|_| StoreError::Crypto("Decryption failed: authentication error".into()))
    }
}

/// The key encryption key: an RSA key pair used to wrap and unwrap data
/// encryption keys at rest.
///
/// The public half comes from an X.509 certificate; the private half from a
/// PEM-encoded RSA private key (PKCS#8 or PKCS#1). Neither half is mutated
/// after loading.
pub struct KeyEncryptionKey {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyEncryptionKey {
    /// Load the key pair from a certificate PEM and a private key PEM.
    ///
    /// Both files must exist and parse, otherwise loading fails.
    pub fn load(cert_file: &Path, key_file: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_file).map_err(|e| {
            StoreError::Crypto(format!("failed to read {}: {e}", cert_file.display()))
        })?;
        let key_pem = std::fs::read_to_string(key_file).map_err(|e| {
            StoreError::Crypto(format!("failed to read {}: {e}", key_file.display()))
        })?;

        let cert = Certificate::from_pem(&cert_pem).map_err(|e| {
            StoreError::Crypto(format!(
                "failed to parse x509 certificate in {}: {e}",
                cert_file.display()
            ))
        })?;
        let spki_der = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| {
                StoreError::Crypto(format!(
                    "failed to extract public key from {}: {e}",
                    cert_file.display()
                ))
            })?;
        let public = RsaPublicKey::from_public_key_der(&spki_der).map_err(|e| {
            StoreError::Crypto(format!(
                "certificate in {} does not carry an RSA public key: {e}",
                cert_file.display()
            ))
        })?;

        let private = RsaPrivateKey::from_pkcs8_pem(&key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key_pem))
            .map_err(|e| {
                StoreError::Crypto(format!(
                    "failed to parse RSA private key in {}: {e}",
                    key_file.display()
                ))
            })?;

        Ok(Self { public, private })
    }

    /// Build the key pair directly from an RSA private key, deriving the
    /// public half. Intended for embedders and tests that generate key
    /// material at runtime.
    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { public, private }
    }

    /// Wrap (encrypt) key material under the public key with RSA-OAEP
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| StoreError::Crypto(format!("RSA-OAEP wrap failed: {e}")))
    }

    /// Unwrap (decrypt) wrapped key material with the private key
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<SecureKey> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map(SecureKey::new)
            .map_err(|e| StoreError::Crypto(format!("RSA-OAEP unwrap failed: {e}")))
    }
}

impl std::fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyEncryptionKey([REDACTED])")
    }
}

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SecureKey::generate();
        let plaintext = b"value worth protecting";

        let encrypted = XChaChaCipher::encrypt(&key, plaintext).unwrap();
        assert_eq!(encrypted.nonce.len(), AEAD_NONCE_SIZE);
        assert_eq!(encrypted.ciphertext.len(), plaintext.len() + AEAD_TAG_SIZE);
        assert_ne!(&encrypted.ciphertext[..plaintext.len()], plaintext);

        let decrypted = XChaChaCipher::decrypt(&key, &encrypted).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = SecureKey::generate();
        let a = XChaChaCipher::encrypt(&key, b"same input").unwrap();
        let b = XChaChaCipher::encrypt(&key, b"same input").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key = SecureKey::generate();
        let other = SecureKey::generate();
        let encrypted = XChaChaCipher::encrypt(&key, b"secret").unwrap();
        assert!(XChaChaCipher::decrypt(&other, &encrypted).is_err());
    }

    #[test]
    fn test_ciphertext_tamper_detected() {
        let key = SecureKey::generate();
        let encrypted = XChaChaCipher::encrypt(&key, b"integrity protected").unwrap();

        for i in 0..encrypted.ciphertext.len() {
            let mut tampered = encrypted.clone();
            tampered.ciphertext[i] ^= 0x01;
            assert!(
                XChaChaCipher::decrypt(&key, &tampered).is_err(),
                "bit flip at ciphertext byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_nonce_tamper_detected() {
        let key = SecureKey::generate();
        let encrypted = XChaChaCipher::encrypt(&key, b"nonce critical").unwrap();

        for i in 0..encrypted.nonce.len() {
            let mut tampered = encrypted.clone();
            tampered.nonce[i] ^= 0x01;
            assert!(
                XChaChaCipher::decrypt(&key, &tampered).is_err(),
                "bit flip at nonce byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_bad_nonce_length_rejected() {
        let key = SecureKey::generate();
        let mut encrypted = XChaChaCipher::encrypt(&key, b"data").unwrap();
        encrypted.nonce.truncate(12);
        assert!(XChaChaCipher::decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_bad_key_length_rejected() {
        let short = SecureKey::new(vec![0u8; 16]);
        assert!(XChaChaCipher::encrypt(&short, b"data").is_err());
    }

    #[test]
    fn test_kek_wrap_unwrap_round_trip() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let kek = KeyEncryptionKey::from_private_key(private);

        let dek = SecureKey::generate();
        let wrapped = kek.wrap(dek.as_bytes()).unwrap();
        assert_ne!(wrapped.as_slice(), dek.as_bytes());

        let unwrapped = kek.unwrap_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_kek_unwrap_garbage_fails() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let kek = KeyEncryptionKey::from_private_key(private);
        let garbage = generate_random_bytes(256);
        assert!(kek.unwrap_key(&garbage).is_err());
    }

    #[test]
    fn test_kek_load_missing_files() {
        let missing = std::env::temp_dir().join("does-not-exist.pem");
        assert!(KeyEncryptionKey::load(&missing, &missing).is_err());
    }

    #[test]
    fn test_secure_key_debug_redacted() {
        let key = SecureKey::generate();
        assert_eq!(format!("{key:?}"), "SecureKey([REDACTED])");
    }

    #[test]
    fn test_random_bytes_length_and_variation() {
        let a = generate_random_bytes(AEAD_KEY_SIZE);
        let b = generate_random_bytes(AEAD_KEY_SIZE);
        assert_eq!(a.len(), AEAD_KEY_SIZE);
        assert_ne!(a, b);
    }
}
