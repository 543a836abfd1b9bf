//! Storage key hierarchy.
//!
//! ```text
//! PIN, hardware salt, storage salt, removable-media salt
//!     └─ PBKDF2-HMAC-SHA256 ─> KEK (32) + KEIV (12)
//!            └─ ChaCha20-Poly1305 wrap ─> DEK (32)
//! ```
//!
//! The DEK encrypts protected records. The Poly1305 tag over the wrapped
//! key doubles as the PIN verification code: a wrong PIN fails to unwrap.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::{StorageError, StorageResult};

/// Data encryption key length.
pub const DEK_LEN: usize = 32;
/// Per-envelope random salt mixed into the KEK derivation.
pub const STORAGE_SALT_LEN: usize = 16;
/// Hardware salt length.
pub const HARDWARE_SALT_LEN: usize = 32;
/// Removable-media salt length.
pub const EXTERNAL_SALT_LEN: usize = 32;

const KEK_LEN: usize = 32;
const KEIV_LEN: usize = 12;
const ENVELOPE_VERSION: u32 = 1;

/// Keys that unlock protected records. Present only while unlocked.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StorageKeys {
    dek: [u8; DEK_LEN],
}

impl StorageKeys {
    pub(crate) fn generate() -> Self {
        let mut keys = Self { dek: [0u8; DEK_LEN] };
        OsRng.fill_bytes(&mut keys.dek);
        keys
    }

    pub(crate) const fn dek(&self) -> &[u8; DEK_LEN] {
        &self.dek
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let dek: [u8; DEK_LEN] = bytes.try_into().ok()?;
        Some(Self { dek })
    }
}

impl fmt::Debug for StorageKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKeys(<redacted>)")
    }
}

/// Key-encryption key derived from the PIN.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Kek {
    key: [u8; KEK_LEN],
    iv: [u8; KEIV_LEN],
}

impl Kek {
    /// Derives the KEK and KEIV with PBKDF2-HMAC-SHA256.
    ///
    /// The PBKDF2 salt is `hardware_salt || storage_salt || external_salt`,
    /// the last part only when second-factor protection is enabled.
    #[must_use]
    pub fn derive(
        pin: &[u8],
        hardware_salt: &[u8; HARDWARE_SALT_LEN],
        storage_salt: &[u8],
        external_salt: Option<&[u8; EXTERNAL_SALT_LEN]>,
        iterations: u32,
    ) -> Self {
        let mut salt = Zeroizing::new(Vec::with_capacity(
            HARDWARE_SALT_LEN + storage_salt.len() + EXTERNAL_SALT_LEN,
        ));
        salt.extend_from_slice(hardware_salt);
        salt.extend_from_slice(storage_salt);
        if let Some(external_salt) = external_salt {
            salt.extend_from_slice(external_salt);
        }

        let mut out = Zeroizing::new([0u8; KEK_LEN + KEIV_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(pin, &salt, iterations, out.as_mut_slice());

        let mut kek = Self {
            key: [0u8; KEK_LEN],
            iv: [0u8; KEIV_LEN],
        };
        kek.key.copy_from_slice(&out[..KEK_LEN]);
        kek.iv.copy_from_slice(&out[KEK_LEN..]);
        kek
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEK_LEN] {
        &self.key
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}

impl fmt::Debug for Kek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Kek(<redacted>)")
    }
}

/// Persisted wrapping of the storage keys.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct KeyEnvelope {
    pub(crate) version: u32,
    pub(crate) iterations: u32,
    pub(crate) storage_salt: Vec<u8>,
    pub(crate) wrapped_keys: Vec<u8>,
    pub(crate) pin_set: bool,
    pub(crate) sd_auth_key: Option<Vec<u8>>,
}

impl KeyEnvelope {
    /// Wraps `keys` under a KEK derived from `pin` and a fresh storage salt.
    pub(crate) fn seal(
        keys: &StorageKeys,
        pin: &[u8],
        hardware_salt: &[u8; HARDWARE_SALT_LEN],
        external_salt: Option<&[u8; EXTERNAL_SALT_LEN]>,
        sd_auth_key: Option<Vec<u8>>,
        iterations: u32,
    ) -> StorageResult<Self> {
        let mut storage_salt = vec![0u8; STORAGE_SALT_LEN];
        OsRng.fill_bytes(&mut storage_salt);
        let kek = Kek::derive(pin, hardware_salt, &storage_salt, external_salt, iterations);
        let wrapped_keys = kek
            .cipher()
            .encrypt(Nonce::from_slice(&kek.iv), keys.dek.as_slice())
            .map_err(|err| StorageError::Crypto(err.to_string()))?;
        Ok(Self {
            version: ENVELOPE_VERSION,
            iterations,
            storage_salt,
            wrapped_keys,
            pin_set: !pin.is_empty(),
            sd_auth_key,
        })
    }

    /// Derives the KEK this envelope was sealed under, given the right inputs.
    pub(crate) fn derive_kek(
        &self,
        pin: &[u8],
        hardware_salt: &[u8; HARDWARE_SALT_LEN],
        external_salt: Option<&[u8; EXTERNAL_SALT_LEN]>,
    ) -> Kek {
        Kek::derive(
            pin,
            hardware_salt,
            &self.storage_salt,
            external_salt,
            self.iterations,
        )
    }

    /// Unwraps the storage keys. `None` means the KEK is wrong.
    pub(crate) fn open(&self, kek: &Kek) -> Option<StorageKeys> {
        let plaintext = Zeroizing::new(
            kek.cipher()
                .decrypt(Nonce::from_slice(&kek.iv), self.wrapped_keys.as_slice())
                .ok()?,
        );
        StorageKeys::from_bytes(&plaintext)
    }

    pub(crate) fn serialize(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    pub(crate) fn deserialize(bytes: &[u8]) -> StorageResult<Self> {
        let envelope: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::UnsupportedEnvelopeVersion(envelope.version));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: [u8; HARDWARE_SALT_LEN] = [9u8; HARDWARE_SALT_LEN];

    #[test]
    fn test_envelope_opens_with_right_pin_only() {
        let keys = StorageKeys::generate();
        let envelope = KeyEnvelope::seal(&keys, b"1234", &HW, None, None, 8).expect("seal");
        assert!(envelope.pin_set);

        let kek = envelope.derive_kek(b"1234", &HW, None);
        let opened = envelope.open(&kek).expect("open");
        assert_eq!(opened.dek(), keys.dek());

        let wrong = envelope.derive_kek(b"1235", &HW, None);
        assert!(envelope.open(&wrong).is_none());
    }

    #[test]
    fn test_external_salt_is_required_once_mixed_in() {
        let keys = StorageKeys::generate();
        let salt = [7u8; EXTERNAL_SALT_LEN];
        let envelope =
            KeyEnvelope::seal(&keys, b"1234", &HW, Some(&salt), None, 8).expect("seal");
        assert!(envelope
            .open(&envelope.derive_kek(b"1234", &HW, None))
            .is_none());
        assert!(envelope
            .open(&envelope.derive_kek(b"1234", &HW, Some(&salt)))
            .is_some());
    }

    #[test]
    fn test_empty_pin_marks_pin_unset() {
        let keys = StorageKeys::generate();
        let envelope = KeyEnvelope::seal(&keys, b"", &HW, None, None, 8).expect("seal");
        assert!(!envelope.pin_set);
    }

    #[test]
    fn test_envelope_round_trip() {
        let keys = StorageKeys::generate();
        let envelope =
            KeyEnvelope::seal(&keys, b"1", &HW, None, Some(vec![1; 16]), 8).expect("seal");
        let bytes = envelope.serialize().expect("serialize");
        let decoded = KeyEnvelope::deserialize(&bytes).expect("deserialize");
        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.iterations, 8);
        assert_eq!(decoded.storage_salt, envelope.storage_salt);
        assert_eq!(decoded.sd_auth_key, Some(vec![1; 16]));
    }

    #[test]
    fn test_envelope_version_mismatch() {
        let keys = StorageKeys::generate();
        let mut envelope = KeyEnvelope::seal(&keys, b"", &HW, None, None, 8).expect("seal");
        envelope.version = ENVELOPE_VERSION + 1;
        let bytes = envelope.serialize().expect("serialize");
        match KeyEnvelope::deserialize(&bytes) {
            Err(StorageError::UnsupportedEnvelopeVersion(version)) => {
                assert_eq!(version, ENVELOPE_VERSION + 1);
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_debug_is_redacted() {
        let keys = StorageKeys::generate();
        assert_eq!(format!("{keys:?}"), "StorageKeys(<redacted>)");
    }
}
