//! Removable-media second factor.
//!
//! When enabled, a 32-byte salt stored on the removable medium is mixed into
//! the KEK derivation, so the PIN alone cannot unlock storage. The file is
//! `salt || tag` where `tag = HMAC-SHA256(auth_key, salt)[..16]` and
//! `auth_key` lives in the key envelope on the device. The file sits in a
//! [`DurableSlot`] so regenerating it survives power loss.

use std::fmt;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CoreError, CoreResult};
use crate::platform::RemovableMedium;
use crate::slot::{DurableSlot, SlotLoad};
use crate::storage::keys::EXTERNAL_SALT_LEN;
use crate::storage::StorageError;

/// Length of the salt authentication key.
pub const AUTH_KEY_LEN: usize = 16;
/// Length of the truncated salt tag.
pub const TAG_LEN: usize = 16;

const SALT_FILE: &str = "salt";

/// I/O on the removable medium is retryable, never device corruption.
fn medium_io(err: StorageError) -> CoreError {
    CoreError::MediumIo(err.to_string())
}

/// Removable-media salt.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Salt([u8; EXTERNAL_SALT_LEN]);

impl Salt {
    /// Generates a fresh random salt.
    #[must_use]
    pub fn generate() -> Self {
        let mut salt = [0u8; EXTERNAL_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Wraps existing bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; EXTERNAL_SALT_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw salt bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; EXTERNAL_SALT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Salt(<redacted>)")
    }
}

impl PartialEq for Salt {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for Salt {}

/// Key authenticating the salt file.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SaltAuthKey([u8; AUTH_KEY_LEN]);

impl SaltAuthKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; AUTH_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Parses a stored key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FirmwareError`] if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> CoreResult<Self> {
        let key: [u8; AUTH_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CoreError::firmware("salt auth key has wrong length"))?;
        Ok(Self(key))
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SaltAuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SaltAuthKey(<redacted>)")
    }
}

/// Truncated HMAC tag of a salt.
#[derive(Debug, Clone, Copy)]
pub struct SaltTag([u8; TAG_LEN]);

impl SaltTag {
    /// Computes `HMAC-SHA256(auth_key, salt)[..16]`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FirmwareError`] if the MAC cannot be keyed.
    pub fn compute(auth_key: &SaltAuthKey, salt: &Salt) -> CoreResult<Self> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&auth_key.0)
            .map_err(|err| CoreError::firmware(err.to_string()))?;
        mac.update(&salt.0);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        Ok(Self(tag))
    }

    /// Constant-time comparison against a stored tag.
    #[must_use]
    pub fn verify(&self, stored: &[u8]) -> bool {
        self.0[..].ct_eq(stored).into()
    }

    /// Raw tag bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }
}

/// Reads, stages and commits the salt file for one device.
pub struct SaltMixer {
    medium: Arc<dyn RemovableMedium>,
    device_dir: String,
}

impl SaltMixer {
    /// Creates a mixer for `/<product>/device_<id>/`.
    ///
    /// The device id is lower-cased so the path is stable across readers.
    #[must_use]
    pub fn new(medium: Arc<dyn RemovableMedium>, product: &str, device_id: &str) -> Self {
        Self {
            medium,
            device_dir: format!("/{product}/device_{}", device_id.to_lowercase()),
        }
    }

    fn slot(&self) -> DurableSlot<'_, dyn RemovableMedium> {
        DurableSlot::remove_then_rename(
            self.medium.as_ref(),
            format!("{}/{SALT_FILE}", self.device_dir),
        )
    }

    /// Path of the committed salt file.
    #[must_use]
    pub fn salt_path(&self) -> String {
        format!("{}/{SALT_FILE}", self.device_dir)
    }

    fn ensure_present(&self) -> CoreResult<()> {
        if self.medium.is_present() {
            Ok(())
        } else {
            Err(CoreError::MediumUnavailable)
        }
    }

    /// Loads the authenticated salt.
    ///
    /// Returns `Ok(None)` when second-factor protection is disabled
    /// (`auth_key` is `None`). Otherwise the committed file is tried first;
    /// if it is missing or fails verification, a verifying staged file is
    /// promoted and returned.
    ///
    /// # Errors
    ///
    /// - [`CoreError::MediumUnavailable`] if no medium is inserted
    /// - [`CoreError::WrongMedium`] if neither file authenticates
    /// - [`CoreError::MediumIo`] if the medium cannot be read
    pub fn load_salt(&self, auth_key: Option<&SaltAuthKey>) -> CoreResult<Option<Salt>> {
        let Some(auth_key) = auth_key else {
            return Ok(None);
        };
        self.ensure_present()?;

        let decode = |bytes: &[u8]| -> Option<Salt> {
            if bytes.len() != EXTERNAL_SALT_LEN + TAG_LEN {
                return None;
            }
            let (salt, tag) = bytes.split_at(EXTERNAL_SALT_LEN);
            let salt = Salt(salt.try_into().ok()?);
            SaltTag::compute(auth_key, &salt)
                .ok()?
                .verify(tag)
                .then_some(salt)
        };
        // Only a missing or bad primary lets the staged copy win.
        let prefer_staged = |_: &Salt, primary: Option<&Salt>| primary.is_none();

        match self
            .slot()
            .load(decode, prefer_staged, false)
            .map_err(medium_io)?
        {
            SlotLoad::Committed(salt) => Ok(Some(salt)),
            SlotLoad::Recovered(salt) => {
                log::info!("completed interrupted salt regeneration");
                Ok(Some(salt))
            }
            SlotLoad::Empty | SlotLoad::Unverified => {
                log::warn!("salt on removable medium does not authenticate");
                Err(CoreError::WrongMedium)
            }
        }
    }

    /// Writes `salt || tag` to the staged path only.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MediumIo`] if the write does not read back
    /// intact, or [`CoreError::MediumUnavailable`] if the medium is missing.
    pub fn stage(&self, salt: &Salt, tag: &SaltTag) -> CoreResult<()> {
        self.ensure_present()?;
        self.medium
            .create_dir_all(&self.device_dir)
            .map_err(medium_io)?;
        let mut bytes = Vec::with_capacity(EXTERNAL_SALT_LEN + TAG_LEN);
        bytes.extend_from_slice(&salt.0);
        bytes.extend_from_slice(&tag.0);
        let result = self.slot().stage(&bytes);
        bytes.zeroize();
        result.map_err(medium_io)?;
        Ok(())
    }

    /// Replaces the committed salt with the staged one.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium is missing or nothing is staged.
    pub fn commit(&self) -> CoreResult<()> {
        self.ensure_present()?;
        self.slot().promote().map_err(medium_io)?;
        Ok(())
    }

    /// Deletes the committed salt.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium is missing or the file cannot be
    /// removed.
    pub fn remove(&self) -> CoreResult<()> {
        self.ensure_present()?;
        self.slot().remove_primary().map_err(medium_io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MemoryMedium;

    fn setup() -> (Arc<MemoryMedium>, SaltMixer) {
        let medium = Arc::new(MemoryMedium::new());
        let mixer = SaltMixer::new(medium.clone(), "cerberus", "ABC123");
        (medium, mixer)
    }

    fn provision(mixer: &SaltMixer, auth_key: &SaltAuthKey) -> Salt {
        let salt = Salt::generate();
        let tag = SaltTag::compute(auth_key, &salt).expect("tag");
        mixer.stage(&salt, &tag).expect("stage");
        mixer.commit().expect("commit");
        salt
    }

    #[test]
    fn test_paths_use_lowercase_device_id() {
        let (medium, mixer) = setup();
        let auth_key = SaltAuthKey::generate();
        provision(&mixer, &auth_key);
        assert_eq!(mixer.salt_path(), "/cerberus/device_abc123/salt");
        assert!(medium.contains("/cerberus/device_abc123/salt"));
        assert!(!medium.contains("/cerberus/device_abc123/salt.new"));
    }

    #[test]
    fn test_disabled_returns_none() {
        let (_medium, mixer) = setup();
        assert!(mixer.load_salt(None).expect("load").is_none());
    }

    #[test]
    fn test_load_committed_salt() {
        let (_medium, mixer) = setup();
        let auth_key = SaltAuthKey::generate();
        let salt = provision(&mixer, &auth_key);
        assert_eq!(mixer.load_salt(Some(&auth_key)).expect("load"), Some(salt));
    }

    #[test]
    fn test_interrupted_regeneration_completes_on_load() {
        let (medium, mixer) = setup();
        let old_key = SaltAuthKey::generate();
        provision(&mixer, &old_key);

        let new_key = SaltAuthKey::generate();
        let new_salt = Salt::generate();
        let tag = SaltTag::compute(&new_key, &new_salt).expect("tag");
        mixer.stage(&new_salt, &tag).expect("stage");
        // Power lost before commit.

        assert_eq!(
            mixer.load_salt(Some(&new_key)).expect("load"),
            Some(new_salt.clone())
        );
        assert!(!medium.contains("/cerberus/device_abc123/salt.new"));
        assert_eq!(mixer.load_salt(Some(&new_key)).expect("reload"), Some(new_salt));
    }

    #[test]
    fn test_valid_primary_wins_over_stale_stage() {
        let (medium, mixer) = setup();
        let auth_key = SaltAuthKey::generate();
        let salt = provision(&mixer, &auth_key);
        let other = Salt::generate();
        let tag = SaltTag::compute(&auth_key, &other).expect("tag");
        mixer.stage(&other, &tag).expect("stage");

        assert_eq!(mixer.load_salt(Some(&auth_key)).expect("load"), Some(salt));
        assert!(medium.contains("/cerberus/device_abc123/salt.new"));
    }

    #[test]
    fn test_wrong_medium() {
        let (_medium, mixer) = setup();
        provision(&mixer, &SaltAuthKey::generate());
        match mixer.load_salt(Some(&SaltAuthKey::generate())) {
            Err(CoreError::WrongMedium) => {}
            Err(err) => panic!("unexpected error: {err}"),
            Ok(salt) => panic!("expected error, got {salt:?}"),
        }
    }

    #[test]
    fn test_empty_medium_is_wrong_medium() {
        let (_medium, mixer) = setup();
        assert!(matches!(
            mixer.load_salt(Some(&SaltAuthKey::generate())),
            Err(CoreError::WrongMedium)
        ));
    }

    #[test]
    fn test_truncated_file_is_wrong_medium() {
        let (medium, mixer) = setup();
        let auth_key = SaltAuthKey::generate();
        provision(&mixer, &auth_key);
        let mut bytes = medium.get("/cerberus/device_abc123/salt").expect("salt");
        bytes.truncate(40);
        medium.insert("/cerberus/device_abc123/salt", bytes);
        assert!(matches!(
            mixer.load_salt(Some(&auth_key)),
            Err(CoreError::WrongMedium)
        ));
    }

    #[test]
    fn test_missing_medium() {
        let (medium, mixer) = setup();
        medium.set_present(false);
        assert!(matches!(
            mixer.load_salt(Some(&SaltAuthKey::generate())),
            Err(CoreError::MediumUnavailable)
        ));
    }

    #[test]
    fn test_medium_io_failures_are_retryable() {
        let (medium, mixer) = setup();
        let auth_key = SaltAuthKey::generate();
        let salt = Salt::generate();
        let tag = SaltTag::compute(&auth_key, &salt).expect("tag");

        medium.tear_next_write(3);
        match mixer.stage(&salt, &tag) {
            Err(err @ CoreError::MediumIo(_)) => {
                assert_eq!(err.class(), crate::ErrorClass::Medium);
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(()) => panic!("expected error"),
        }

        mixer.stage(&salt, &tag).expect("stage");
        medium.fail_next_rename();
        assert!(matches!(mixer.commit(), Err(CoreError::MediumIo(_))));
    }

    #[test]
    fn test_remove_deletes_primary() {
        let (medium, mixer) = setup();
        provision(&mixer, &SaltAuthKey::generate());
        mixer.remove().expect("remove");
        assert!(!medium.contains("/cerberus/device_abc123/salt"));
    }

    #[test]
    fn test_tag_is_truncated_hmac() {
        let auth_key = SaltAuthKey::from_slice(&[1u8; AUTH_KEY_LEN]).expect("key");
        let salt = Salt::from_bytes([2u8; EXTERNAL_SALT_LEN]);
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&[1u8; AUTH_KEY_LEN]).expect("mac");
        mac.update(&[2u8; EXTERNAL_SALT_LEN]);
        let full = mac.finalize().into_bytes();
        let tag = SaltTag::compute(&auth_key, &salt).expect("tag");
        assert_eq!(&tag.as_bytes()[..], &full[..TAG_LEN]);
    }
}
