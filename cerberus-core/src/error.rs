use thiserror::Error;

use crate::storage::StorageError;

/// Result type used across the security core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure codes reported to the host over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum FailureCode {
    /// The entered PIN did not unlock storage.
    WrongPin,
    /// The removable medium does not carry this device's salt.
    WrongMedium,
    /// The request is not allowed in the current device state.
    ProcessError,
    /// The device has not been initialized.
    NotInitialized,
    /// Device-provisioned data is malformed.
    FirmwareError,
    /// The user declined a confirmation prompt.
    ActionCancelled,
    /// The PIN attempt limit has been reached.
    PinExhausted,
}

/// Recovery class of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorClass {
    /// Bad user input. Recoverable; wrong PINs count toward the backoff.
    User,
    /// Wrong or missing removable medium. Recoverable, no backoff.
    Medium,
    /// Stored or provisioned data failed verification.
    Corruption,
    /// Disallowed by the current state; nothing was changed.
    Process,
    /// Custodied secrets were destroyed or are about to be.
    Fatal,
}

/// Error outputs from the security core.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum CoreError {
    /// The PIN was wrong. `remaining` attempts are left before the limit.
    #[error("wrong_pin: {remaining} attempts remaining")]
    WrongPin {
        /// Attempts left before the limit is reached.
        remaining: u32,
    },
    /// The PIN attempt limit has been reached.
    #[error("pin_exhausted: wiped={wiped}")]
    PinExhausted {
        /// Whether storage has already been wiped.
        wiped: bool,
    },
    /// The wipe code was entered at the PIN prompt and storage was wiped.
    #[error("wipe_code_entered")]
    WipeCodeEntered,
    /// The salt on the removable medium does not authenticate.
    #[error("wrong_medium")]
    WrongMedium,
    /// Second-factor protection is enabled but no medium is inserted.
    #[error("medium_unavailable")]
    MediumUnavailable,
    /// Reading or writing the removable medium failed. The user may retry.
    #[error("medium_io: {0}")]
    MediumIo(String),
    /// The request is not allowed in the current state.
    #[error("process_error: {0}")]
    ProcessError(String),
    /// The device or security context has not been initialized.
    #[error("not_initialized")]
    NotInitialized,
    /// Device-provisioned data (certificates, counters) is malformed.
    #[error("firmware_error: {0}")]
    FirmwareError(String),
    /// The user declined a confirmation or aborted a wait.
    #[error("action_cancelled")]
    ActionCancelled,
    /// A field table lookup used a name that is not in the table.
    #[error("unknown_field: {0}")]
    UnknownField(String),
    /// Failure raised by the record store.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CoreError {
    /// Shorthand for [`CoreError::ProcessError`].
    pub fn process(message: impl Into<String>) -> Self {
        Self::ProcessError(message.into())
    }

    /// Shorthand for [`CoreError::FirmwareError`].
    pub fn firmware(message: impl Into<String>) -> Self {
        Self::FirmwareError(message.into())
    }

    /// Returns how the caller is expected to recover from this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::WrongPin { .. } | Self::UnknownField(_) => ErrorClass::User,
            Self::WrongMedium | Self::MediumUnavailable | Self::MediumIo(_) => ErrorClass::Medium,
            Self::FirmwareError(_) => ErrorClass::Corruption,
            Self::ProcessError(_) | Self::NotInitialized | Self::ActionCancelled => {
                ErrorClass::Process
            }
            Self::PinExhausted { .. } | Self::WipeCodeEntered => ErrorClass::Fatal,
            Self::Storage(err) => err.class(),
        }
    }

    /// Returns the failure code reported to the host.
    #[must_use]
    pub const fn failure_code(&self) -> FailureCode {
        match self {
            Self::WrongPin { .. } => FailureCode::WrongPin,
            Self::PinExhausted { .. } | Self::WipeCodeEntered => FailureCode::PinExhausted,
            Self::WrongMedium => FailureCode::WrongMedium,
            Self::MediumUnavailable
            | Self::MediumIo(_)
            | Self::ProcessError(_)
            | Self::UnknownField(_) => FailureCode::ProcessError,
            Self::NotInitialized => FailureCode::NotInitialized,
            Self::FirmwareError(_) => FailureCode::FirmwareError,
            Self::ActionCancelled => FailureCode::ActionCancelled,
            Self::Storage(err) => match err.class() {
                ErrorClass::Corruption | ErrorClass::Fatal => FailureCode::FirmwareError,
                ErrorClass::User | ErrorClass::Medium | ErrorClass::Process => {
                    FailureCode::ProcessError
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_pin_is_user_error() {
        let err = CoreError::WrongPin { remaining: 3 };
        assert_eq!(err.class(), ErrorClass::User);
        assert_eq!(err.failure_code(), FailureCode::WrongPin);
    }

    #[test]
    fn test_exhaustion_is_distinct_from_wrong_pin() {
        let err = CoreError::PinExhausted { wiped: true };
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_ne!(err.failure_code(), FailureCode::WrongPin);
    }

    #[test]
    fn test_storage_integrity_surfaces_as_corruption() {
        let err = CoreError::from(StorageError::Integrity("0x0101".to_string()));
        assert_eq!(err.class(), ErrorClass::Corruption);
        assert_eq!(err.failure_code(), FailureCode::FirmwareError);
    }

    #[test]
    fn test_locked_storage_is_process_error() {
        let err = CoreError::from(StorageError::Locked);
        assert_eq!(err.class(), ErrorClass::Process);
        assert_eq!(err.failure_code(), FailureCode::ProcessError);
    }

    #[test]
    fn test_removable_medium_io_is_recoverable() {
        let err = CoreError::MediumIo("power lost during write".to_string());
        assert_eq!(err.class(), ErrorClass::Medium);
        assert_eq!(err.failure_code(), FailureCode::ProcessError);
    }

    #[test]
    fn test_failure_code_names() {
        let name: &'static str = FailureCode::ActionCancelled.into();
        assert_eq!(name, "ActionCancelled");
        assert_eq!(FailureCode::WrongMedium.to_string(), "WrongMedium");
    }
}
