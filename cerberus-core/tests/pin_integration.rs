//! PIN backoff, exhaustion policies and the wipe code.

mod common;

use cerberus_core::pin::PinManager;
use cerberus_core::session::{Authorization, OperationKind};
use cerberus_core::storage::StorageKey;
use cerberus_core::task::ProgressLog;
use cerberus_core::{CoreError, ErrorClass, FailureCode, WipePolicy};

const SEED: StorageKey = StorageKey::new(0x02, 0x01);

#[test]
fn test_backoff_persists_across_power_cycles() {
    let rig = common::TestRig::new();
    let mut device = rig.boot_with_pin("1234");
    device.lock();

    for expected_remaining in [15, 14, 13] {
        match device.unlock(&common::pin("0000"), None) {
            Err(CoreError::WrongPin { remaining }) => assert_eq!(remaining, expected_remaining),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(()) => panic!("wrong PIN accepted"),
        }
        // Pull the plug after every attempt.
        device.power_off();
        device = rig.boot();
    }

    let features = device.features().expect("features");
    assert_eq!(features.field("pin_remaining").expect("field").as_u32(), Some(13));

    let slept_before = rig.clock.slept_ms();
    device.unlock(&common::pin("1234"), None).expect("unlock");
    assert_eq!(
        rig.clock.slept_ms() - slept_before,
        PinManager::backoff_ms(3)
    );
    let features = device.features().expect("features");
    assert_eq!(features.field("pin_remaining").expect("field").as_u32(), Some(16));
}

#[test]
fn test_backoff_progress_is_reported_and_abortable() {
    let rig = common::TestRig::new();
    let mut device = rig.boot_with_pin("1234");
    device.lock();
    let _ = device.unlock(&common::pin("0000"), None);
    let _ = device.unlock(&common::pin("0000"), None);

    let mut log = ProgressLog {
        abort_after: Some(5),
        ..ProgressLog::default()
    };
    let result = device.unlock(&common::pin("1234"), Some(&mut log));
    assert!(matches!(result, Err(CoreError::ActionCancelled)));
    assert!(log.reports.windows(2).all(|w| w[0].permille <= w[1].permille));

    // The aborted attempt was not counted.
    let features = device.features().expect("features");
    assert_eq!(features.field("pin_remaining").expect("field").as_u32(), Some(14));
}

#[test]
fn test_exhaustion_wipes_immediately() {
    let rig = common::TestRig::with_policy(WipePolicy::Immediate, 3);
    let mut device = rig.boot_with_pin("1234");
    device.write(SEED, b"seed").expect("write");
    device.lock();

    let _ = device.unlock(&common::pin("1"), None);
    let _ = device.unlock(&common::pin("2"), None);
    let err = device
        .unlock(&common::pin("3"), None)
        .expect_err("limit reached");
    assert!(matches!(err, CoreError::PinExhausted { wiped: true }));
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(err.failure_code(), FailureCode::PinExhausted);

    let features = device.features().expect("features");
    assert_eq!(features.field("pin_protection").expect("field").as_bool(), Some(false));
    assert_eq!(
        device.dispatch(OperationKind::GetAddress).expect("dispatch"),
        Authorization::Granted
    );
    assert_eq!(device.read(SEED).expect("read"), None);
}

#[test]
fn test_exhaustion_with_confirmation_policy() {
    let rig = common::TestRig::with_policy(WipePolicy::RequireConfirmation, 2);
    let mut device = rig.boot_with_pin("1234");
    device.lock();

    let _ = device.unlock(&common::pin("1"), None);
    assert!(matches!(
        device.unlock(&common::pin("2"), None),
        Err(CoreError::PinExhausted { wiped: false })
    ));
    device.power_off();

    let mut device = rig.boot();
    assert!(matches!(
        device.unlock(&common::pin("1234"), None),
        Err(CoreError::PinExhausted { wiped: false })
    ));
    // Nothing unlocks implicitly while the wipe is pending.
    assert_eq!(
        device.dispatch(OperationKind::SignTx).expect("dispatch"),
        Authorization::PinRequired
    );
    device.confirm_wipe().expect("confirm");
    assert_eq!(
        device.dispatch(OperationKind::SignTx).expect("dispatch"),
        Authorization::Granted
    );
}

#[test]
fn test_wipe_code_at_pin_prompt() {
    let rig = common::TestRig::new();
    let mut device = rig.boot_with_pin("1234");
    device
        .set_wipe_code(&common::pin("1234"), Some(&common::pin("0852")), None)
        .expect("set wipe code");
    assert_eq!(
        device
            .features()
            .expect("features")
            .field("wipe_code_protection")
            .expect("field")
            .as_bool(),
        Some(true)
    );
    assert!(matches!(
        device.change_pin(&common::pin("1234"), &common::pin("0852"), None),
        Err(CoreError::ProcessError(_))
    ));
    device.lock();

    assert!(matches!(
        device.unlock(&common::pin("0852"), None),
        Err(CoreError::WipeCodeEntered)
    ));
    let features = device.features().expect("features");
    assert_eq!(features.field("pin_protection").expect("field").as_bool(), Some(false));
}

#[test]
fn test_change_pin_requires_old_pin() {
    let rig = common::TestRig::new();
    let mut device = rig.boot_with_pin("1234");
    assert!(matches!(
        device.change_pin(&common::pin("9999"), &common::pin("5678"), None),
        Err(CoreError::WrongPin { .. })
    ));
    device
        .change_pin(&common::pin("1234"), &common::pin("5678"), None)
        .expect("change");
    device.lock();
    assert!(device.unlock(&common::pin("1234"), None).is_err());
    device.unlock(&common::pin("5678"), None).expect("new pin");
}
