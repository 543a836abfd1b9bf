//! Process-wide security context.
//!
//! Created once at boot from the device secret and passed explicitly to every
//! component. It holds the hardware salt, the unwrapped storage keys while
//! unlocked, and the session state. [`SecurityContext::teardown`] (or drop)
//! zeroizes all of it.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{CoreError, CoreResult};
use crate::session::SessionState;
use crate::storage::keys::{StorageKeys, HARDWARE_SALT_LEN};

const HARDWARE_SALT_DOMAIN: &[u8] = b"cerberus:hardware-salt:v1";
const HARDWARE_SALT_INFO: &[u8] = b"storage-kek";

/// Security state shared by the storage, PIN and session components.
pub struct SecurityContext {
    hardware_salt: Option<Zeroizing<[u8; HARDWARE_SALT_LEN]>>,
    keys: Option<StorageKeys>,
    session: SessionState,
}

impl SecurityContext {
    /// Initializes the context from the device-unique secret.
    ///
    /// The session starts locked.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FirmwareError`] if the secret is empty.
    pub fn boot(device_secret: &[u8]) -> CoreResult<Self> {
        if device_secret.is_empty() {
            return Err(CoreError::firmware("device secret is missing"));
        }
        let hkdf = Hkdf::<Sha256>::new(Some(HARDWARE_SALT_DOMAIN), device_secret);
        let mut hardware_salt = Zeroizing::new([0u8; HARDWARE_SALT_LEN]);
        hkdf.expand(HARDWARE_SALT_INFO, hardware_salt.as_mut_slice())
            .map_err(|err| CoreError::firmware(err.to_string()))?;
        log::debug!("security context initialized");
        Ok(Self {
            hardware_salt: Some(hardware_salt),
            keys: None,
            session: SessionState::default(),
        })
    }

    /// Zeroizes all secrets. The context is unusable afterwards.
    pub fn teardown(&mut self) {
        self.keys = None;
        self.hardware_salt = None;
        self.session = SessionState::default();
        log::debug!("security context torn down");
    }

    /// Whether the context has been booted and not torn down.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.hardware_salt.is_some()
    }

    /// Whether storage keys are loaded and the session is unlocked.
    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.keys.is_some() && !self.session.locked
    }

    /// Current session state.
    #[must_use]
    pub const fn session(&self) -> &SessionState {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub(crate) fn hardware_salt(&self) -> CoreResult<&[u8; HARDWARE_SALT_LEN]> {
        self.hardware_salt
            .as_deref()
            .ok_or(CoreError::NotInitialized)
    }

    pub(crate) const fn storage_keys(&self) -> Option<&StorageKeys> {
        if self.session.locked {
            None
        } else {
            self.keys.as_ref()
        }
    }

    /// Installs unwrapped keys and marks the session unlocked at `now_ms`.
    pub(crate) fn install_keys(&mut self, keys: StorageKeys, now_ms: u64) {
        self.keys = Some(keys);
        self.session.locked = false;
        self.session.last_activity_ms = now_ms;
    }

    /// Drops the storage keys and marks the session locked.
    pub(crate) fn clear_keys(&mut self) {
        self.keys = None;
        self.session.locked = true;
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("active", &self.is_active())
            .field("unlocked", &self.is_unlocked())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
