//! PIN verification with a persisted attempt counter.
//!
//! The failure counter is incremented and read back *before* the KEK is
//! derived, so cutting power mid-attempt still counts the attempt. Before an
//! attempt with `n` recorded failures the user waits `2^n - 1` seconds; the
//! wait is driven by the [`Scheduler`] and can be aborted by the user up to
//! the moment the counter is touched.

mod wipe_code;

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::config::{SecurityConfig, WipePolicy};
use crate::context::SecurityContext;
use crate::error::{CoreError, CoreResult};
use crate::salt::{Salt, SaltAuthKey};
use crate::storage::keys::{Kek, KeyEnvelope, StorageKeys};
use crate::storage::{StorageEngine, WIPE_CODE_KEY};
use crate::task::{Progress, Scheduler, Step, Task};

use wipe_code::WipeCode;

/// Longest accepted PIN, in bytes.
pub const MAX_PIN_LEN: usize = 50;

/// A user PIN. The empty PIN means "no PIN set".
pub struct Pin(SecretString);

impl Pin {
    /// Wraps a PIN entered by the user.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if the PIN is longer than
    /// [`MAX_PIN_LEN`] bytes.
    pub fn new(pin: impl Into<String>) -> CoreResult<Self> {
        let pin: String = pin.into();
        if pin.len() > MAX_PIN_LEN {
            return Err(CoreError::process(format!(
                "PIN must be at most {MAX_PIN_LEN} characters"
            )));
        }
        Ok(Self(SecretString::from(pin)))
    }

    /// The empty PIN.
    #[must_use]
    pub fn empty() -> Self {
        Self(SecretString::from(String::new()))
    }

    /// Whether this is the empty PIN.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes().ct_eq(other.as_bytes()).into()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// Result of a successful verification.
pub struct Verified {
    kek: Kek,
    keys: StorageKeys,
}

impl Verified {
    /// KEK derived from the PIN and salts.
    #[must_use]
    pub const fn kek(&self) -> &Kek {
        &self.kek
    }

    pub(crate) fn into_keys(self) -> StorageKeys {
        let Self { keys, .. } = self;
        keys
    }
}

impl fmt::Debug for Verified {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Verified(<redacted>)")
    }
}

/// Counts failed attempts and unwraps the storage keys.
pub struct PinManager {
    storage: Arc<StorageEngine>,
    max_attempts: u32,
    iterations: u32,
    wipe_policy: WipePolicy,
    backoff_poll_ms: u64,
}

impl PinManager {
    /// Creates a manager over `storage` with the limits in `config`.
    #[must_use]
    pub fn new(storage: Arc<StorageEngine>, config: &SecurityConfig) -> Self {
        Self {
            storage,
            max_attempts: config.max_pin_attempts,
            iterations: config.pin_kdf_iterations,
            wipe_policy: config.wipe_policy,
            backoff_poll_ms: config.backoff_poll_ms,
        }
    }

    /// Wait before an attempt with `failures` recorded failures:
    /// `2^failures - 1` seconds.
    #[must_use]
    pub fn backoff_ms(failures: u32) -> u64 {
        let seconds = 1u64
            .checked_shl(failures)
            .map_or(u64::MAX, |pow| pow - 1);
        seconds.saturating_mul(1000)
    }

    /// Persisted failure count.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    pub fn failures(&self) -> CoreResult<u32> {
        Ok(self.storage.pin_failures()?)
    }

    /// Attempts left before the wipe policy applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    pub fn remaining_attempts(&self) -> CoreResult<u32> {
        Ok(self.max_attempts.saturating_sub(self.failures()?))
    }

    /// Whether a non-empty PIN protects storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the key envelope cannot be read.
    pub fn has_pin(&self) -> CoreResult<bool> {
        if !self.storage.is_initialized()? {
            return Ok(false);
        }
        Ok(self.storage.load_envelope()?.pin_set)
    }

    /// Whether the attempt limit was reached and a confirmed wipe is due.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    pub fn wipe_pending(&self) -> CoreResult<bool> {
        Ok(self.failures()? >= self.max_attempts)
    }

    /// Builds a verification task for `pin`.
    ///
    /// `external_salt` must be the current removable-media salt when
    /// second-factor protection is enabled.
    pub fn verify<'a>(
        &'a self,
        ctx: &'a mut SecurityContext,
        pin: &'a Pin,
        external_salt: Option<&'a Salt>,
    ) -> VerifyPin<'a> {
        VerifyPin {
            manager: self,
            ctx,
            pin,
            external_salt,
            phase: Phase::Start,
        }
    }

    /// Verifies `old` and rewraps the storage keys under `new`, keeping the
    /// second-factor configuration. Returns the unlocked keys.
    ///
    /// # Errors
    ///
    /// - the errors of [`VerifyPin`] for `old`
    /// - [`CoreError::ProcessError`] if `new` equals the wipe code
    pub fn change_pin(
        &self,
        scheduler: &mut Scheduler<'_, '_>,
        ctx: &mut SecurityContext,
        old: &Pin,
        new: &Pin,
        external_salt: Option<&Salt>,
    ) -> CoreResult<StorageKeys> {
        let keys = scheduler.run(self.verify(ctx, old, external_salt))?.into_keys();
        if !new.is_empty() && self.matches_wipe_code(new)? {
            return Err(CoreError::process("the new PIN must differ from the wipe code"));
        }
        let sd_auth_key = self.storage.load_envelope()?.sd_auth_key;
        self.seal(ctx, &keys, new, external_salt, sd_auth_key)?;
        log::info!("PIN changed");
        Ok(keys)
    }

    /// Rewraps `keys` under `pin` and an optional salt, recording
    /// `sd_auth_key` in the same envelope write.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is torn down or the write fails.
    pub(crate) fn rewrap(
        &self,
        ctx: &SecurityContext,
        keys: &StorageKeys,
        pin: &Pin,
        external_salt: Option<&Salt>,
        sd_auth_key: Option<&SaltAuthKey>,
    ) -> CoreResult<()> {
        self.seal(
            ctx,
            keys,
            pin,
            external_salt,
            sd_auth_key.map(|key| key.as_bytes().to_vec()),
        )
    }

    fn seal(
        &self,
        ctx: &SecurityContext,
        keys: &StorageKeys,
        pin: &Pin,
        external_salt: Option<&Salt>,
        sd_auth_key: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        let envelope = KeyEnvelope::seal(
            keys,
            pin.as_bytes(),
            ctx.hardware_salt()?,
            external_salt.map(Salt::as_bytes),
            sd_auth_key,
            self.iterations,
        )?;
        self.storage.store_envelope(&envelope)?;
        Ok(())
    }

    /// Sets or clears (`None` or empty) the wipe code.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if the code equals `pin`.
    pub fn set_wipe_code(&self, pin: &Pin, code: Option<&Pin>) -> CoreResult<()> {
        match code.filter(|code| !code.is_empty()) {
            None => {
                self.storage.delete_reserved(WIPE_CODE_KEY)?;
                log::info!("wipe code removed");
            }
            Some(code) if code == pin => {
                return Err(CoreError::process("the wipe code must differ from the PIN"));
            }
            Some(code) => {
                let record = WipeCode::seal(code.as_bytes())?;
                self.storage.write_reserved(WIPE_CODE_KEY, &record.encode())?;
                log::info!("wipe code set");
            }
        }
        Ok(())
    }

    /// Whether a wipe code is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn has_wipe_code(&self) -> CoreResult<bool> {
        Ok(self.storage.read_reserved(WIPE_CODE_KEY)?.is_some())
    }

    fn matches_wipe_code(&self, pin: &Pin) -> CoreResult<bool> {
        match self.storage.read_reserved(WIPE_CODE_KEY)? {
            Some(bytes) => WipeCode::decode(&bytes)?.matches(pin.as_bytes()),
            None => Ok(false),
        }
    }

    /// Performs the wipe left pending by [`WipePolicy::RequireConfirmation`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if no wipe is pending.
    pub fn confirm_wipe(&self, ctx: &mut SecurityContext) -> CoreResult<()> {
        if !self.wipe_pending()? {
            return Err(CoreError::process("no wipe is pending"));
        }
        self.wipe(ctx)
    }

    fn wipe(&self, ctx: &mut SecurityContext) -> CoreResult<()> {
        log::warn!("PIN attempt limit reached, wiping storage");
        self.erase(ctx)
    }

    /// Wipes storage. The persisted auto-lock delay goes with it, so the
    /// session falls back to the default.
    fn erase(&self, ctx: &mut SecurityContext) -> CoreResult<()> {
        self.storage.wipe(ctx, self.iterations)?;
        ctx.session_mut().lock_delay_ms = None;
        Ok(())
    }

    fn exhausted(&self, ctx: &mut SecurityContext) -> CoreError {
        match self.wipe_policy {
            WipePolicy::Immediate => match self.wipe(ctx) {
                Ok(()) => CoreError::PinExhausted { wiped: true },
                Err(err) => err,
            },
            WipePolicy::RequireConfirmation => CoreError::PinExhausted { wiped: false },
        }
    }
}

enum Phase {
    Start,
    Backoff { waited_ms: u64, total_ms: u64 },
    Attempt,
    Finished,
}

/// Step machine for one PIN attempt. Run it with [`Scheduler::run`].
pub struct VerifyPin<'a> {
    manager: &'a PinManager,
    ctx: &'a mut SecurityContext,
    pin: &'a Pin,
    external_salt: Option<&'a Salt>,
    phase: Phase,
}

impl VerifyPin<'_> {
    fn start(&mut self) -> CoreResult<Step<Verified>> {
        let failures = self.manager.failures()?;
        if failures >= self.manager.max_attempts {
            return Err(self.manager.exhausted(self.ctx));
        }
        let total_ms = PinManager::backoff_ms(failures);
        if total_ms == 0 {
            self.phase = Phase::Attempt;
            return Ok(Step::Yield(Progress::with_message(0, "Verifying PIN")));
        }
        log::info!("PIN backoff of {total_ms} ms after {failures} failures");
        self.phase = Phase::Backoff {
            waited_ms: 0,
            total_ms,
        };
        Ok(Step::Yield(Progress::with_message(0, "Wrong PIN, please wait")))
    }

    fn attempt(&mut self) -> CoreResult<Step<Verified>> {
        let manager = self.manager;
        let storage = manager.storage.as_ref();

        if manager.matches_wipe_code(self.pin)? {
            log::warn!("wipe code entered");
            manager.erase(self.ctx)?;
            return Err(CoreError::WipeCodeEntered);
        }

        let failures = storage.pin_failures()?;
        let attempt = failures
            .checked_add(1)
            .ok_or_else(|| CoreError::firmware("PIN counter overflow"))?;
        storage.set_pin_failures(attempt)?;
        if storage.pin_failures()? != attempt {
            return Err(CoreError::firmware("PIN counter did not advance"));
        }

        let envelope = storage.load_envelope()?;
        let kek = envelope.derive_kek(
            self.pin.as_bytes(),
            self.ctx.hardware_salt()?,
            self.external_salt.map(Salt::as_bytes),
        );
        if let Some(keys) = envelope.open(&kek) {
            storage.set_pin_failures(0)?;
            log::debug!("PIN verified");
            return Ok(Step::Done(Verified { kek, keys }));
        }

        if attempt >= manager.max_attempts {
            return Err(manager.exhausted(self.ctx));
        }
        let remaining = manager.max_attempts - attempt;
        log::info!("wrong PIN, {remaining} attempts remaining");
        Err(CoreError::WrongPin { remaining })
    }
}

impl Task for VerifyPin<'_> {
    type Output = Verified;

    fn step(&mut self) -> CoreResult<Step<Verified>> {
        match self.phase {
            Phase::Start => self.start(),
            Phase::Backoff {
                waited_ms,
                total_ms,
            } => {
                if waited_ms >= total_ms {
                    self.phase = Phase::Attempt;
                    return Ok(Step::Yield(Progress::with_message(1000, "Verifying PIN")));
                }
                let ms = self.manager.backoff_poll_ms.min(total_ms - waited_ms);
                let waited_ms = waited_ms + ms;
                self.phase = Phase::Backoff {
                    waited_ms,
                    total_ms,
                };
                Ok(Step::Sleep {
                    ms,
                    progress: Progress::ratio(waited_ms, total_ms),
                })
            }
            Phase::Attempt => {
                self.phase = Phase::Finished;
                self.attempt()
            }
            Phase::Finished => Err(CoreError::process("PIN attempt already finished")),
        }
    }

    fn cancellable(&self) -> bool {
        matches!(self.phase, Phase::Start | Phase::Backoff { .. })
    }
}
