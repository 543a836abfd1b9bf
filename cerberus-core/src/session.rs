//! Session lock state machine.
//!
//! ```text
//!            verify(pin) ok
//!   Locked ─────────────────> Unlocked
//!     ^                          │
//!     └── lock() / idle > delay ─┘   (reboot always starts Locked)
//! ```
//!
//! The idle timer is only sampled when an operation is dispatched. Queries
//! that merely identify the device do not count as activity, so a host
//! polling them cannot keep the session alive.

use std::sync::Arc;

use crate::config::{MAX_LOCK_DELAY_MS, MIN_LOCK_DELAY_MS};
use crate::context::SecurityContext;
use crate::error::{CoreError, CoreResult};
use crate::platform::Clock;
use crate::storage::keys::StorageKeys;

/// Session fields kept in the [`SecurityContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// Whether sensitive operations need a PIN.
    pub locked: bool,
    /// Clock time of the last qualifying operation.
    pub last_activity_ms: u64,
    /// User-selected auto-lock delay. `None` means the default.
    pub lock_delay_ms: Option<u32>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            locked: true,
            last_activity_ms: 0,
            lock_delay_ms: None,
        }
    }
}

/// Lock state as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LockState {
    /// Sensitive operations need a PIN.
    Locked,
    /// Sensitive operations are permitted.
    Unlocked,
}

/// Host operations, as far as the session lock cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum OperationKind {
    /// Session handshake.
    Initialize,
    /// Device identity and status query.
    GetFeatures,
    /// Liveness check.
    Ping,
    /// Abort of the pending operation.
    Cancel,
    /// Explicit lock request.
    LockDevice,
    /// Address derivation and display.
    GetAddress,
    /// Public key export.
    GetPublicKey,
    /// Transaction signing.
    SignTx,
    /// Message signing.
    SignMessage,
    /// Settings change, including the auto-lock delay.
    ApplySettings,
    /// PIN change.
    ChangePin,
    /// Wipe code change.
    ChangeWipeCode,
    /// Removable-media second factor management.
    SdProtect,
    /// Device attestation.
    AuthenticateDevice,
    /// Factory reset.
    WipeDevice,
    /// Application record read. Per-key access rules apply in storage.
    ReadRecord,
    /// Application record write or delete.
    WriteRecord,
}

impl OperationKind {
    /// Whether dispatching this operation counts as user activity.
    #[must_use]
    pub const fn refreshes_activity(self) -> bool {
        !matches!(
            self,
            Self::Initialize | Self::GetFeatures | Self::Ping | Self::Cancel | Self::LockDevice
        )
    }

    /// Whether this operation needs an unlocked session.
    #[must_use]
    pub const fn requires_unlock(self) -> bool {
        matches!(
            self,
            Self::GetAddress
                | Self::GetPublicKey
                | Self::SignTx
                | Self::SignMessage
                | Self::ApplySettings
                | Self::ChangePin
                | Self::ChangeWipeCode
                | Self::SdProtect
        )
    }
}

/// Dispatcher verdict for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// The operation may proceed.
    Granted,
    /// The user must enter the PIN first.
    PinRequired,
}

/// Drives [`SessionState`] transitions.
pub struct SessionLock {
    clock: Arc<dyn Clock>,
    default_delay_ms: u32,
}

impl SessionLock {
    /// Creates a session lock using `default_delay_ms` when no delay is set.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, default_delay_ms: u32) -> Self {
        Self {
            clock,
            default_delay_ms,
        }
    }

    /// Current lock state.
    #[must_use]
    pub const fn state(&self, ctx: &SecurityContext) -> LockState {
        if ctx.is_unlocked() {
            LockState::Unlocked
        } else {
            LockState::Locked
        }
    }

    /// Effective auto-lock delay.
    #[must_use]
    pub fn lock_delay_ms(&self, ctx: &SecurityContext) -> u32 {
        ctx.session().lock_delay_ms.unwrap_or(self.default_delay_ms)
    }

    /// The user-selected delay, `None` when the default applies.
    #[must_use]
    pub const fn configured_lock_delay_ms(&self, ctx: &SecurityContext) -> Option<u32> {
        ctx.session().lock_delay_ms
    }

    /// Checks that `delay_ms` is an acceptable auto-lock delay.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if `delay_ms` lies outside
    /// `10_000..=536_870_911`.
    pub fn check_lock_delay(delay_ms: Option<u32>) -> CoreResult<()> {
        match delay_ms {
            Some(delay_ms) if !(MIN_LOCK_DELAY_MS..=MAX_LOCK_DELAY_MS).contains(&delay_ms) => {
                Err(CoreError::process(format!(
                    "auto-lock delay must be between {MIN_LOCK_DELAY_MS} and {MAX_LOCK_DELAY_MS} ms"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Sets the auto-lock delay. `None` restores the default.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if `delay_ms` lies outside
    /// `10_000..=536_870_911`; the previous value is kept.
    pub fn set_lock_delay(&self, ctx: &mut SecurityContext, delay_ms: Option<u32>) -> CoreResult<()> {
        Self::check_lock_delay(delay_ms)?;
        ctx.session_mut().lock_delay_ms = delay_ms;
        log::info!("auto-lock delay set to {} ms", self.lock_delay_ms(ctx));
        Ok(())
    }

    /// Enters `Unlocked` with freshly verified storage keys.
    pub(crate) fn unlock(&self, ctx: &mut SecurityContext, keys: StorageKeys) {
        ctx.install_keys(keys, self.clock.now_ms());
        log::info!("session unlocked");
    }

    /// Enters `Locked` and drops the storage keys.
    pub fn lock(&self, ctx: &mut SecurityContext) {
        if ctx.is_unlocked() {
            log::info!("session locked");
        }
        ctx.clear_keys();
    }

    /// Milliseconds since the last qualifying operation.
    #[must_use]
    pub fn idle_ms(&self, ctx: &SecurityContext) -> u64 {
        self.clock
            .now_ms()
            .saturating_sub(ctx.session().last_activity_ms)
    }

    /// Locks the session if it has been idle longer than the delay.
    /// Returns whether this call locked it.
    pub fn evaluate(&self, ctx: &mut SecurityContext) -> bool {
        if !ctx.is_unlocked() {
            return false;
        }
        let idle_ms = self.idle_ms(ctx);
        if idle_ms > u64::from(self.lock_delay_ms(ctx)) {
            log::info!("auto-lock after {idle_ms} ms idle");
            self.lock(ctx);
            return true;
        }
        false
    }

    /// Dispatch boundary: samples the idle timer, records activity and
    /// decides whether `kind` may run.
    pub fn dispatch(&self, ctx: &mut SecurityContext, kind: OperationKind) -> Authorization {
        self.evaluate(ctx);
        if ctx.is_unlocked() && kind.refreshes_activity() {
            ctx.session_mut().last_activity_ms = self.clock.now_ms();
        }
        if kind.requires_unlock() && !ctx.is_unlocked() {
            log::debug!("{kind} requires PIN entry");
            Authorization::PinRequired
        } else {
            Authorization::Granted
        }
    }
}
