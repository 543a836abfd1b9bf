//! Device facade.
//!
//! [`Device`] owns the [`SecurityContext`] and wires the storage engine, PIN
//! manager, session lock, salt mixer and attestation service together. Host
//! requests enter through [`Device::dispatch`] or one of the operation
//! methods, each of which samples the auto-lock timer first.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::attestation::{AttestationService, AuthenticityProof};
use crate::config::SecurityConfig;
use crate::context::SecurityContext;
use crate::error::{CoreError, CoreResult};
use crate::fields::{FieldTable, FieldValue};
use crate::pin::{Pin, PinManager};
use crate::platform::{
    BootloaderState, Clock, ConfirmationPrompt, ConfirmationRequest, Decision, RemovableMedium,
    SecureElement, SlotMedium,
};
use crate::salt::{Salt, SaltAuthKey, SaltMixer, SaltTag};
use crate::session::{Authorization, OperationKind, SessionLock};
use crate::storage::{StorageEngine, StorageKey};
use crate::task::{ProgressObserver, Scheduler};

/// Application namespace for device settings.
pub const DEVICE_APP: u8 = 0x01;
/// Persisted auto-lock delay, `u32` little-endian. Readable while locked.
pub const AUTO_LOCK_DELAY_KEY: StorageKey = StorageKey::public(DEVICE_APP, 0x01);

const DEVICE_ID_DOMAIN: &[u8] = b"cerberus:device-id:v1";
const DEVICE_ID_LEN: usize = 12;

/// Hardware and UI services the device runs on.
#[derive(Clone)]
pub struct Platform {
    /// Internal flash holding the record store.
    pub storage: Arc<dyn SlotMedium>,
    /// Removable medium for the second factor.
    pub removable: Arc<dyn RemovableMedium>,
    /// Monotonic clock.
    pub clock: Arc<dyn Clock>,
    /// Secure element with the attestation key.
    pub secure_element: Arc<dyn SecureElement>,
    /// Bootloader lock state.
    pub bootloader: Arc<dyn BootloaderState>,
    /// Confirmation UI.
    pub prompt: Arc<dyn ConfirmationPrompt>,
}

/// Device status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features(FieldTable);

impl Features {
    /// Looks up a field by name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownField`] for names not in the report.
    pub fn field(&self, name: &str) -> CoreResult<&FieldValue> {
        self.0.get(name)
    }

    /// The underlying table.
    #[must_use]
    pub const fn table(&self) -> &FieldTable {
        &self.0
    }
}

/// The security core of one device.
pub struct Device {
    config: SecurityConfig,
    ctx: SecurityContext,
    storage: Arc<StorageEngine>,
    pins: PinManager,
    session: SessionLock,
    salts: SaltMixer,
    attestation: AttestationService,
    clock: Arc<dyn Clock>,
    bootloader: Arc<dyn BootloaderState>,
    prompt: Arc<dyn ConfirmationPrompt>,
    device_id: String,
}

fn derive_device_id(device_secret: &[u8]) -> String {
    let digest = Sha256::new()
        .chain_update(DEVICE_ID_DOMAIN)
        .chain_update(device_secret)
        .finalize();
    hex::encode_upper(&digest[..DEVICE_ID_LEN])
}

impl Device {
    /// Boots the core: derives the hardware salt, recovers and initializes
    /// storage and restores the persisted auto-lock delay. The session
    /// starts locked.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the device secret
    /// is missing or storage cannot be opened.
    pub fn boot(config: SecurityConfig, platform: Platform, device_secret: &[u8]) -> CoreResult<Self> {
        config.validate()?;
        let ctx = SecurityContext::boot(device_secret)?;
        let storage = Arc::new(StorageEngine::open(platform.storage)?);
        storage.initialize(&ctx, config.pin_kdf_iterations)?;

        let device_id = derive_device_id(device_secret);
        let mut device = Self {
            pins: PinManager::new(storage.clone(), &config),
            session: SessionLock::new(platform.clock.clone(), config.default_lock_delay_ms),
            salts: SaltMixer::new(platform.removable, &config.product, &device_id),
            attestation: AttestationService::new(
                platform.secure_element,
                platform.bootloader.clone(),
                &config,
            ),
            clock: platform.clock,
            bootloader: platform.bootloader,
            prompt: platform.prompt,
            config,
            ctx,
            storage,
            device_id,
        };
        device.restore_lock_delay()?;
        log::info!("device {} booted", device.device_id);
        Ok(device)
    }

    fn restore_lock_delay(&mut self) -> CoreResult<()> {
        let Some(bytes) = self.storage.read(&self.ctx, AUTO_LOCK_DELAY_KEY)? else {
            return Ok(());
        };
        let Ok(bytes) = <[u8; 4]>::try_from(bytes.as_slice()) else {
            log::warn!("ignoring malformed auto-lock delay record");
            return Ok(());
        };
        if let Err(err) = self
            .session
            .set_lock_delay(&mut self.ctx, Some(u32::from_le_bytes(bytes)))
        {
            log::warn!("ignoring stored auto-lock delay: {err}");
        }
        Ok(())
    }

    /// Device identifier, upper-case hex.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The security context.
    #[must_use]
    pub const fn context(&self) -> &SecurityContext {
        &self.ctx
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SecurityConfig {
        &self.config
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Dispatch boundary for one host operation.
    ///
    /// Samples the auto-lock timer and records activity. A locked device
    /// without a PIN unlocks itself here; otherwise operations that need an
    /// unlocked session get [`Authorization::PinRequired`].
    ///
    /// # Errors
    ///
    /// Returns an error if the implicit empty-PIN unlock fails.
    pub fn dispatch(&mut self, kind: OperationKind) -> CoreResult<Authorization> {
        if kind == OperationKind::LockDevice {
            self.lock();
            return Ok(Authorization::Granted);
        }
        let authorization = self.session.dispatch(&mut self.ctx, kind);
        if authorization == Authorization::PinRequired
            && !self.pins.has_pin()?
            && !self.pins.wipe_pending()?
        {
            self.unlock(&Pin::empty(), None)?;
            return Ok(Authorization::Granted);
        }
        Ok(authorization)
    }

    fn authorize(&mut self, kind: OperationKind) -> CoreResult<()> {
        match self.dispatch(kind)? {
            Authorization::Granted => Ok(()),
            Authorization::PinRequired => Err(CoreError::process("PIN required")),
        }
    }

    /// Current removable-media salt, `None` when the second factor is off.
    fn current_salt(&self) -> CoreResult<Option<Salt>> {
        let envelope = self.storage.load_envelope()?;
        let auth_key = envelope
            .sd_auth_key
            .as_deref()
            .map(SaltAuthKey::from_slice)
            .transpose()?;
        self.salts.load_salt(auth_key.as_ref())
    }

    /// Verifies `pin` and unlocks the session.
    ///
    /// # Errors
    ///
    /// - [`CoreError::WrongPin`] or [`CoreError::PinExhausted`] on failure
    /// - [`CoreError::WrongMedium`] or [`CoreError::MediumUnavailable`] if
    ///   the second factor cannot be read
    /// - [`CoreError::ActionCancelled`] if the backoff wait is aborted
    pub fn unlock(&mut self, pin: &Pin, observer: Option<&mut dyn ProgressObserver>) -> CoreResult<()> {
        let salt = self.current_salt()?;
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        let verified = scheduler.run(self.pins.verify(&mut self.ctx, pin, salt.as_ref()))?;
        self.session.unlock(&mut self.ctx, verified.into_keys());
        Ok(())
    }

    /// Locks the session.
    pub fn lock(&mut self) {
        self.session.lock(&mut self.ctx);
    }

    /// Whether the session is unlocked. Samples the auto-lock timer.
    pub fn is_unlocked(&mut self) -> bool {
        self.session.evaluate(&mut self.ctx);
        self.ctx.is_unlocked()
    }

    /// Sets the auto-lock delay and persists it. `None` restores the default.
    ///
    /// The session only picks up the new delay once the record is written.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if the device is locked or the
    /// delay is out of range, or a storage error if the record cannot be
    /// written. The previous value is kept in every case.
    pub fn apply_settings(&mut self, auto_lock_delay_ms: Option<u32>) -> CoreResult<()> {
        self.authorize(OperationKind::ApplySettings)?;
        SessionLock::check_lock_delay(auto_lock_delay_ms)?;
        match auto_lock_delay_ms {
            Some(delay_ms) => {
                self.storage
                    .write(&self.ctx, AUTO_LOCK_DELAY_KEY, &delay_ms.to_le_bytes())?;
            }
            None => {
                self.storage.delete(&self.ctx, AUTO_LOCK_DELAY_KEY)?;
            }
        }
        self.session.set_lock_delay(&mut self.ctx, auto_lock_delay_ms)
    }

    /// Effective auto-lock delay.
    #[must_use]
    pub fn lock_delay_ms(&self) -> u32 {
        self.session.lock_delay_ms(&self.ctx)
    }

    // =========================================================================
    // PIN and wipe code
    // =========================================================================

    /// Replaces the PIN. An empty `new` removes PIN protection.
    ///
    /// # Errors
    ///
    /// Returns the verification errors for `old`, or
    /// [`CoreError::ProcessError`] if `new` equals the wipe code.
    pub fn change_pin(
        &mut self,
        old: &Pin,
        new: &Pin,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        self.authorize(OperationKind::ChangePin)?;
        let salt = self.current_salt()?;
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        let keys = self
            .pins
            .change_pin(&mut scheduler, &mut self.ctx, old, new, salt.as_ref())?;
        self.session.unlock(&mut self.ctx, keys);
        Ok(())
    }

    /// Sets the wipe code, or clears it with `None`.
    ///
    /// # Errors
    ///
    /// Returns the verification errors for `pin`, or
    /// [`CoreError::ProcessError`] if no PIN is set or the code equals it.
    pub fn set_wipe_code(
        &mut self,
        pin: &Pin,
        code: Option<&Pin>,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        self.authorize(OperationKind::ChangeWipeCode)?;
        if code.is_some_and(|code| !code.is_empty()) && !self.pins.has_pin()? {
            return Err(CoreError::process("set a PIN before setting a wipe code"));
        }
        let salt = self.current_salt()?;
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        let verified = scheduler.run(self.pins.verify(&mut self.ctx, pin, salt.as_ref()))?;
        self.pins.set_wipe_code(pin, code)?;
        self.session.unlock(&mut self.ctx, verified.into_keys());
        Ok(())
    }

    /// Performs the wipe left pending after the PIN attempt limit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if no wipe is pending.
    pub fn confirm_wipe(&mut self) -> CoreResult<()> {
        self.pins.confirm_wipe(&mut self.ctx)
    }

    /// Factory reset after user confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ActionCancelled`] if the user declines.
    pub fn wipe(&mut self) -> CoreResult<()> {
        self.dispatch(OperationKind::WipeDevice)?;
        let request = ConfirmationRequest {
            title: "Wipe device",
            body: "All data will be erased.".to_string(),
        };
        if self.prompt.confirm(&request) == Decision::Cancelled {
            return Err(CoreError::ActionCancelled);
        }
        self.storage.wipe(&mut self.ctx, self.config.pin_kdf_iterations)?;
        self.ctx.session_mut().lock_delay_ms = None;
        Ok(())
    }

    // =========================================================================
    // Removable-media second factor
    // =========================================================================

    fn sd_protection_enabled(&self) -> CoreResult<bool> {
        Ok(self.storage.load_envelope()?.sd_auth_key.is_some())
    }

    /// Generates a salt on the removable medium and mixes it into the KEK.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if protection is already enabled,
    /// the verification errors for `pin`, or medium errors.
    pub fn enable_sd_protection(
        &mut self,
        pin: &Pin,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        self.authorize(OperationKind::SdProtect)?;
        if self.sd_protection_enabled()? {
            return Err(CoreError::process("SD card protection already enabled"));
        }
        self.rotate_salt(pin, None, observer)?;
        log::info!("SD card protection enabled");
        Ok(())
    }

    /// Replaces the salt on the removable medium.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if protection is not enabled,
    /// the verification errors for `pin`, or medium errors.
    pub fn refresh_sd_protection(
        &mut self,
        pin: &Pin,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        self.authorize(OperationKind::SdProtect)?;
        if !self.sd_protection_enabled()? {
            return Err(CoreError::process("SD card protection not enabled"));
        }
        let current = self.current_salt()?;
        self.rotate_salt(pin, current.as_ref(), observer)?;
        log::info!("SD card protection refreshed");
        Ok(())
    }

    /// Stage, rewrap, commit. A crash between rewrap and commit leaves a
    /// staged salt that authenticates under the new key, which the next
    /// [`SaltMixer::load_salt`] promotes.
    fn rotate_salt(
        &mut self,
        pin: &Pin,
        current: Option<&Salt>,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        let keys = scheduler
            .run(self.pins.verify(&mut self.ctx, pin, current))?
            .into_keys();

        let salt = Salt::generate();
        let auth_key = SaltAuthKey::generate();
        let tag = SaltTag::compute(&auth_key, &salt)?;
        self.salts.stage(&salt, &tag)?;
        self.pins
            .rewrap(&self.ctx, &keys, pin, Some(&salt), Some(&auth_key))?;
        self.salts.commit()?;
        self.session.unlock(&mut self.ctx, keys);
        Ok(())
    }

    /// Removes the salt from the KEK derivation and deletes it from the
    /// removable medium.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if protection is not enabled,
    /// the verification errors for `pin`, or medium errors.
    pub fn disable_sd_protection(
        &mut self,
        pin: &Pin,
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<()> {
        self.authorize(OperationKind::SdProtect)?;
        if !self.sd_protection_enabled()? {
            return Err(CoreError::process("SD card protection not enabled"));
        }
        let current = self.current_salt()?;
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        let keys = scheduler
            .run(self.pins.verify(&mut self.ctx, pin, current.as_ref()))?
            .into_keys();
        self.pins.rewrap(&self.ctx, &keys, pin, None, None)?;
        if let Err(err) = self.salts.remove() {
            log::warn!("could not remove salt from removable medium: {err}");
        }
        self.session.unlock(&mut self.ctx, keys);
        log::info!("SD card protection disabled");
        Ok(())
    }

    // =========================================================================
    // Attestation
    // =========================================================================

    /// Signs `challenge` with the attestation key after user confirmation.
    ///
    /// # Errors
    ///
    /// See [`AttestationService::authenticate`].
    pub fn authenticate(
        &mut self,
        challenge: &[u8],
        observer: Option<&mut dyn ProgressObserver>,
    ) -> CoreResult<AuthenticityProof> {
        self.authorize(OperationKind::AuthenticateDevice)?;
        let mut scheduler = Scheduler::new(self.clock.as_ref()).with_observer(observer);
        self.attestation
            .authenticate(&mut scheduler, self.prompt.as_ref(), challenge)
    }

    // =========================================================================
    // Records and status
    // =========================================================================

    /// Reads an application record.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::read`].
    pub fn read(&mut self, key: StorageKey) -> CoreResult<Option<Vec<u8>>> {
        self.dispatch(OperationKind::ReadRecord)?;
        Ok(self.storage.read(&self.ctx, key)?)
    }

    /// Writes an application record.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::write`].
    pub fn write(&mut self, key: StorageKey, value: &[u8]) -> CoreResult<()> {
        self.dispatch(OperationKind::WriteRecord)?;
        Ok(self.storage.write(&self.ctx, key, value)?)
    }

    /// Deletes an application record.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::delete`].
    pub fn delete(&mut self, key: StorageKey) -> CoreResult<bool> {
        self.dispatch(OperationKind::WriteRecord)?;
        Ok(self.storage.delete(&self.ctx, key)?)
    }

    /// Status report. Does not count as user activity.
    ///
    /// # Errors
    ///
    /// Returns an error if the PIN counter or key envelope cannot be read.
    pub fn features(&mut self) -> CoreResult<Features> {
        self.session.dispatch(&mut self.ctx, OperationKind::GetFeatures);
        let table = FieldTable::new()
            .with("initialized", self.storage.is_initialized()?)
            .with("unlocked", self.ctx.is_unlocked())
            .with("pin_protection", self.pins.has_pin()?)
            .with("sd_protection", self.sd_protection_enabled()?)
            .with("wipe_code_protection", self.pins.has_wipe_code()?)
            .with("auto_lock_delay_ms", self.session.lock_delay_ms(&self.ctx))
            .with("pin_remaining", self.pins.remaining_attempts()?)
            .with("device_id", self.device_id.clone())
            .with("bootloader_locked", self.bootloader.is_locked());
        Ok(Features(table))
    }

    /// Zeroizes every secret and shuts the core down.
    pub fn power_off(mut self) {
        self.ctx.teardown();
        log::info!("device {} powered off", self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{
        FixedBootloader, MemoryMedium, MemorySecureElement, MockClock, ScriptedPrompt,
    };

    struct Rig {
        flash: Arc<MemoryMedium>,
        sd: Arc<MemoryMedium>,
        clock: Arc<MockClock>,
        platform: Platform,
    }

    fn rig() -> Rig {
        let flash = Arc::new(MemoryMedium::new());
        let sd = Arc::new(MemoryMedium::new());
        let clock = Arc::new(MockClock::new(1_000));
        let platform = Platform {
            storage: flash.clone(),
            removable: sd.clone(),
            clock: clock.clone(),
            secure_element: Arc::new(MemorySecureElement::new(vec![0x30, 0x00])),
            bootloader: Arc::new(FixedBootloader::new(true)),
            prompt: Arc::new(ScriptedPrompt::always(Decision::Confirmed)),
        };
        Rig {
            flash,
            sd,
            clock,
            platform,
        }
    }

    fn config() -> SecurityConfig {
        SecurityConfig {
            pin_kdf_iterations: 8,
            ..SecurityConfig::default()
        }
    }

    fn boot(rig: &Rig) -> Device {
        Device::boot(config(), rig.platform.clone(), b"device-secret").expect("boot")
    }

    fn pin(value: &str) -> Pin {
        Pin::new(value).expect("pin")
    }

    #[test]
    fn test_pinless_device_unlocks_on_dispatch() {
        let rig = rig();
        let mut device = boot(&rig);
        assert!(!device.context().is_unlocked());
        assert_eq!(
            device.dispatch(OperationKind::SignTx).expect("dispatch"),
            Authorization::Granted
        );
        assert!(device.is_unlocked());
    }

    #[test]
    fn test_pin_protected_device_requires_pin() {
        let rig = rig();
        let mut device = boot(&rig);
        device
            .change_pin(&Pin::empty(), &pin("1234"), None)
            .expect("set pin");
        device.lock();
        assert_eq!(
            device.dispatch(OperationKind::SignTx).expect("dispatch"),
            Authorization::PinRequired
        );
        assert!(matches!(
            device.unlock(&pin("0000"), None),
            Err(CoreError::WrongPin { .. })
        ));
        device.unlock(&pin("1234"), None).expect("unlock");
        assert_eq!(
            device.dispatch(OperationKind::SignTx).expect("dispatch"),
            Authorization::Granted
        );
    }

    #[test]
    fn test_lock_delay_persists_across_boot() {
        let rig = rig();
        let mut device = boot(&rig);
        device.apply_settings(Some(30_000)).expect("apply");
        assert!(matches!(
            device.apply_settings(Some(9_999)),
            Err(CoreError::ProcessError(_))
        ));
        assert_eq!(device.lock_delay_ms(), 30_000);
        device.power_off();

        let device = boot(&rig);
        assert_eq!(device.lock_delay_ms(), 30_000);
        assert!(rig.flash.contains("/store/8101"));
    }

    #[test]
    fn test_sd_protection_lifecycle() {
        let rig = rig();
        let mut device = boot(&rig);
        device
            .change_pin(&Pin::empty(), &pin("1234"), None)
            .expect("set pin");
        device.enable_sd_protection(&pin("1234"), None).expect("enable");
        let salt_path = format!(
            "/cerberus/device_{}/salt",
            device.device_id().to_lowercase()
        );
        assert!(rig.sd.contains(&salt_path));

        device.lock();
        rig.sd.set_present(false);
        assert!(matches!(
            device.unlock(&pin("1234"), None),
            Err(CoreError::MediumUnavailable)
        ));
        rig.sd.set_present(true);
        device.unlock(&pin("1234"), None).expect("unlock with medium");

        device.refresh_sd_protection(&pin("1234"), None).expect("refresh");
        device.lock();
        device.unlock(&pin("1234"), None).expect("unlock after refresh");

        device.disable_sd_protection(&pin("1234"), None).expect("disable");
        assert!(!rig.sd.contains(&salt_path));
        device.lock();
        rig.sd.set_present(false);
        device.unlock(&pin("1234"), None).expect("unlock without medium");
    }

    #[test]
    fn test_wrong_medium_is_reported() {
        let rig = rig();
        let mut device = boot(&rig);
        device.enable_sd_protection(&Pin::empty(), None).expect("enable");
        let salt_path = format!(
            "/cerberus/device_{}/salt",
            device.device_id().to_lowercase()
        );
        rig.sd.corrupt(&salt_path, 0);
        device.lock();
        assert!(matches!(
            device.unlock(&Pin::empty(), None),
            Err(CoreError::WrongMedium)
        ));
    }

    #[test]
    fn test_features_report() {
        let rig = rig();
        let mut device = boot(&rig);
        let features = device.features().expect("features");
        assert_eq!(features.field("unlocked").expect("field"), &FieldValue::Bool(false));
        assert_eq!(
            features.field("auto_lock_delay_ms").expect("field").as_u32(),
            Some(600_000)
        );
        assert_eq!(features.field("pin_remaining").expect("field").as_u32(), Some(16));
        assert_eq!(
            features.field("device_id").expect("field").as_text(),
            Some(device.device_id())
        );
        assert!(matches!(
            features.field("label"),
            Err(CoreError::UnknownField(_))
        ));
    }

    #[test]
    fn test_features_do_not_keep_session_alive() {
        let rig = rig();
        let mut device = boot(&rig);
        device.dispatch(OperationKind::GetAddress).expect("dispatch");
        device.apply_settings(Some(10_000)).expect("apply");
        for _ in 0..110 {
            rig.clock.advance(100);
            device.features().expect("features");
        }
        assert!(!device.context().is_unlocked());
    }

    #[test]
    fn test_wipe_requires_confirmation() {
        let mut rig = rig();
        let prompt = Arc::new(ScriptedPrompt::always(Decision::Confirmed));
        prompt.push(Decision::Cancelled);
        rig.platform.prompt = prompt;
        let mut device = boot(&rig);
        device
            .change_pin(&Pin::empty(), &pin("1234"), None)
            .expect("set pin");

        assert!(matches!(device.wipe(), Err(CoreError::ActionCancelled)));
        assert!(device.pins.has_pin().expect("has pin"));
        device.wipe().expect("wipe");
        assert!(!device.pins.has_pin().expect("has pin"));
    }

    #[test]
    fn test_wipe_code_requires_pin() {
        let rig = rig();
        let mut device = boot(&rig);
        assert!(matches!(
            device.set_wipe_code(&Pin::empty(), Some(&pin("9999")), None),
            Err(CoreError::ProcessError(_))
        ));
    }

    #[test]
    fn test_device_id_is_stable_hex() {
        let a = derive_device_id(b"secret");
        assert_eq!(a, derive_device_id(b"secret"));
        assert_ne!(a, derive_device_id(b"other"));
        assert_eq!(a.len(), DEVICE_ID_LEN * 2);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
