//! Field-level encryption for upstream API keys.
//!
//! Ciphertexts are stored as `enc:v1:` + base64(nonce || ciphertext || tag) so
//! encrypted values are detectable in the store. Decrypting a value without
//! the prefix returns it unchanged, which keeps pre-encryption rows readable.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Prefix marking a value as an encrypted field.
pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;
// nonce + GCM tag
const MIN_CIPHERTEXT_LEN: usize = NONCE_LEN + 16;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
	#[error("invalid encryption key: {0}")]
	InvalidKey(String),
	#[error("encryption failed")]
	Encryption,
	#[error("decryption failed")]
	Decryption,
	#[error("ciphertext too short: {0} bytes")]
	CiphertextTooShort(usize),
}

/// A 256-bit key, zeroized on drop. Never appears in Debug output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self(bytes)
	}

	/// Parse a base64-encoded 32 byte key, as carried in `ENCRYPTION_KEY`.
	pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
		let raw = B64
			.decode(s.trim())
			.map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
		let bytes: [u8; 32] = raw
			.try_into()
			.map_err(|_| CryptoError::InvalidKey("key must be exactly 32 bytes".to_string()))?;
		Ok(Self(bytes))
	}

	pub fn generate() -> Self {
		let key = Aes256Gcm::generate_key(OsRng);
		let mut bytes = [0u8; 32];
		bytes.copy_from_slice(&key);
		Self(bytes)
	}
}

impl std::fmt::Debug for EncryptionKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "EncryptionKey(<redacted>)")
	}
}

/// Capability for encrypting sensitive fields before they reach the store.
pub trait FieldEncryptor: Send + Sync {
	fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
	fn decrypt(&self, value: &str) -> Result<String, CryptoError>;
	/// Whether this encryptor actually protects data at rest.
	fn is_active(&self) -> bool;
}

/// AES-256-GCM encryptor; the production variant.
pub struct AesFieldEncryptor {
	key: EncryptionKey,
}

impl AesFieldEncryptor {
	pub fn new(key: EncryptionKey) -> Self {
		Self { key }
	}
}

impl FieldEncryptor for AesFieldEncryptor {
	fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key.0));
		let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
		let ciphertext = cipher
			.encrypt(&nonce, plaintext.as_bytes())
			.map_err(|_| CryptoError::Encryption)?;
		let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
		combined.extend_from_slice(&nonce);
		combined.extend_from_slice(&ciphertext);
		Ok(format!("{CIPHERTEXT_PREFIX}{}", B64.encode(combined)))
	}

	fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
		let Some(encoded) = value.strip_prefix(CIPHERTEXT_PREFIX) else {
			// Not a ciphertext; legacy plaintext rows pass through.
			return Ok(value.to_string());
		};
		let combined = B64.decode(encoded).map_err(|_| CryptoError::Decryption)?;
		if combined.len() < MIN_CIPHERTEXT_LEN {
			return Err(CryptoError::CiphertextTooShort(combined.len()));
		}
		let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
		let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key.0));
		let plaintext = cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| CryptoError::Decryption)?;
		String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
	}

	fn is_active(&self) -> bool {
		true
	}
}

/// Pass-through encryptor for deployments without a configured key.
/// Refused at startup when `REQUIRE_ENCRYPTION_KEY` is set.
pub struct NullEncryptor;

impl FieldEncryptor for NullEncryptor {
	fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
		Ok(plaintext.to_string())
	}

	fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
		if value.starts_with(CIPHERTEXT_PREFIX) {
			// An encrypted row cannot be read without the key.
			return Err(CryptoError::Decryption);
		}
		Ok(value.to_string())
	}

	fn is_active(&self) -> bool {
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		for plaintext in ["", "sk-abc123", "arbitrary \u{1F512} bytes"] {
			let ct = enc.encrypt(plaintext).unwrap();
			assert!(ct.starts_with(CIPHERTEXT_PREFIX));
			assert_eq!(enc.decrypt(&ct).unwrap(), plaintext);
		}
	}

	#[test]
	fn fresh_nonce_per_encryption() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		let a = enc.encrypt("same input").unwrap();
		let b = enc.encrypt("same input").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn unprefixed_value_passes_through() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		assert_eq!(enc.decrypt("sk-legacy-plaintext").unwrap(), "sk-legacy-plaintext");
	}

	#[test]
	fn wrong_key_fails() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		let other = AesFieldEncryptor::new(EncryptionKey::generate());
		let ct = enc.encrypt("secret").unwrap();
		assert!(other.decrypt(&ct).is_err());
	}

	#[test]
	fn tampered_ciphertext_fails() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		let ct = enc.encrypt("secret").unwrap();
		let mut raw = B64.decode(ct.strip_prefix(CIPHERTEXT_PREFIX).unwrap()).unwrap();
		raw[NONCE_LEN] ^= 0xff;
		let tampered = format!("{CIPHERTEXT_PREFIX}{}", B64.encode(raw));
		assert!(enc.decrypt(&tampered).is_err());
	}

	#[test]
	fn null_encryptor_rejects_ciphertext() {
		let enc = AesFieldEncryptor::new(EncryptionKey::generate());
		let ct = enc.encrypt("secret").unwrap();
		assert!(NullEncryptor.decrypt(&ct).is_err());
		assert_eq!(NullEncryptor.decrypt("plain").unwrap(), "plain");
	}

	#[test]
	fn key_from_base64_rejects_wrong_length() {
		assert!(EncryptionKey::from_base64(&B64.encode([0u8; 16])).is_err());
		assert!(EncryptionKey::from_base64(&B64.encode([0u8; 32])).is_ok());
	}
}
