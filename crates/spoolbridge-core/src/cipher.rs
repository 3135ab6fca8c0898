//! # Device Transport Cipher
//!
//! AES-256-GCM encryption of Device request/response bodies with a
//! password-derived key.
//!
//! ## Wire Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Envelope Layout                                   │
//! │                                                                         │
//! │  HTTP body = base64( nonce ‖ ciphertext ‖ tag )                        │
//! │                                                                         │
//! │  ┌──────────────┬──────────────────────────┬──────────────────┐        │
//! │  │ 12-byte nonce│     N-byte ciphertext    │  16-byte GCM tag │        │
//! │  └──────────────┴──────────────────────────┴──────────────────┘        │
//! │                                                                         │
//! │  Key = PBKDF2-HMAC-SHA256(security_key, KDF_SALT, KDF_ITERATIONS)      │
//! │                                                                         │
//! │  KDF_SALT and KDF_ITERATIONS are part of the wire contract: both       │
//! │  are baked into the Device firmware and MUST match it byte-for-byte.   │
//! │  They are constants, not configuration.                                 │
//! │                                                                         │
//! │  Nonces come from the OS cryptographic RNG. Reusing a nonce under      │
//! │  the same key breaks GCM, so nonces are never derived or counted.      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CipherError;

// =============================================================================
// Protocol Constants
// =============================================================================

/// PBKDF2 salt matching the Device firmware.
pub const KDF_SALT: &[u8] = b"example_salt";

/// PBKDF2 iteration count matching the Device firmware.
pub const KDF_ITERATIONS: u32 = 10_000;

/// GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Shortest possible decoded envelope: a nonce plus a tag over an empty
/// plaintext.
const MIN_ENVELOPE_LEN: usize = NONCE_LEN + TAG_LEN;

// =============================================================================
// Key Derivation
// =============================================================================

/// Derives the 32-byte AES key from the user-supplied security key.
pub fn derive_key(security_key: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(security_key.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut key);
    key
}

// =============================================================================
// Device Cipher
// =============================================================================

/// Symmetric cipher bound to one derived key.
///
/// Derivation runs once at construction; `encrypt`/`decrypt` are cheap and
/// synchronous after that.
#[derive(Clone)]
pub struct DeviceCipher {
    cipher: Aes256Gcm,
}

impl DeviceCipher {
    /// Creates a cipher from the 7-character security key.
    pub fn new(security_key: &str) -> Self {
        let key = derive_key(security_key);
        DeviceCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypts a plaintext body into a base64 envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Seal)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(envelope))
    }

    /// Decrypts a base64 envelope back into plaintext.
    ///
    /// Returns [`CipherError::Format`] for structural problems (bad base64,
    /// too short) and [`CipherError::Auth`] for tag mismatches. Neither is
    /// retryable.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CipherError> {
        let raw = BASE64
            .decode(envelope.trim())
            .map_err(|e| CipherError::Format(format!("invalid base64: {e}")))?;

        if raw.len() < MIN_ENVELOPE_LEN {
            return Err(CipherError::Format(format!(
                "envelope is {} bytes, need at least {MIN_ENVELOPE_LEN}",
                raw.len()
            )));
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CipherError::Auth)?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Format("plaintext is not valid UTF-8".into()))
    }
}

impl std::fmt::Debug for DeviceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug output.
        f.debug_struct("DeviceCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_trip() {
        let cipher = DeviceCipher::new("abc1234");
        for plaintext in ["", "hello", "späti näöl ❄", &"x".repeat(4096)] {
            let envelope = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let envelope = DeviceCipher::new("abc1234").encrypt("secret").unwrap();
        let other = DeviceCipher::new("abc1235");
        assert_eq!(other.decrypt(&envelope), Err(CipherError::Auth));
    }

    #[test]
    fn test_tampered_envelope_fails_auth() {
        let cipher = DeviceCipher::new("abc1234");
        let envelope = cipher.encrypt("secret payload").unwrap();

        let mut raw = BASE64.decode(&envelope).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert_eq!(cipher.decrypt(&tampered), Err(CipherError::Auth));
    }

    #[test]
    fn test_short_envelope_is_format_error() {
        let cipher = DeviceCipher::new("abc1234");
        let short = BASE64.encode([0u8; MIN_ENVELOPE_LEN - 1]);
        assert!(matches!(cipher.decrypt(&short), Err(CipherError::Format(_))));
    }

    #[test]
    fn test_garbage_base64_is_format_error() {
        let cipher = DeviceCipher::new("abc1234");
        assert!(matches!(
            cipher.decrypt("!!! not base64 !!!"),
            Err(CipherError::Format(_))
        ));
    }

    #[test]
    fn test_nonces_are_unique() {
        let cipher = DeviceCipher::new("abc1234");
        let mut nonces = HashSet::new();
        for _ in 0..1000 {
            let envelope = cipher.encrypt("same plaintext").unwrap();
            let raw = BASE64.decode(envelope).unwrap();
            nonces.insert(raw[..NONCE_LEN].to_vec());
        }
        assert_eq!(nonces.len(), 1000);
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        assert_eq!(derive_key("abc1234"), derive_key("abc1234"));
        assert_ne!(derive_key("abc1234"), derive_key("abc1235"));
    }
}
