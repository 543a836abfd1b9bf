//! Common test utilities shared across integration tests.

#![allow(dead_code, missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use cerberus_core::pin::Pin;
use cerberus_core::platform::memory::{
    FixedBootloader, MemoryMedium, MemorySecureElement, MockClock, ScriptedPrompt,
};
use cerberus_core::platform::Decision;
use cerberus_core::{Device, Platform, SecurityConfig, WipePolicy};
use uuid::Uuid;

/// Device secret every rig boots with.
pub const DEVICE_SECRET: &[u8] = b"integration-device-secret";

/// Two certificates: a short-form leaf and a long-form root.
pub fn certificate_chain() -> Vec<u8> {
    let mut chain = vec![0x30, 0x04, 0xDE, 0xAD, 0xBE, 0xEF];
    chain.extend_from_slice(&[0x30, 0x82, 0x01, 0x00]);
    chain.extend_from_slice(&[0x11; 0x100]);
    chain
}

/// Shared platform doubles. Media outlive the devices booted over them.
pub struct TestRig {
    pub flash: Arc<MemoryMedium>,
    pub sd: Arc<MemoryMedium>,
    pub clock: Arc<MockClock>,
    pub secure_element: Arc<MemorySecureElement>,
    pub bootloader: Arc<FixedBootloader>,
    pub prompt: Arc<ScriptedPrompt>,
    pub config: SecurityConfig,
}

impl TestRig {
    /// Rig with the default policy and 16 PIN attempts.
    pub fn new() -> Self {
        Self::with_policy(WipePolicy::Immediate, 16)
    }

    /// Rig with a custom wipe policy and attempt limit.
    pub fn with_policy(wipe_policy: WipePolicy, max_pin_attempts: u32) -> Self {
        Self {
            flash: Arc::new(MemoryMedium::new()),
            sd: Arc::new(MemoryMedium::new()),
            clock: Arc::new(MockClock::new(1_000)),
            secure_element: Arc::new(MemorySecureElement::new(certificate_chain())),
            bootloader: Arc::new(FixedBootloader::new(true)),
            prompt: Arc::new(ScriptedPrompt::always(Decision::Confirmed)),
            config: SecurityConfig {
                pin_kdf_iterations: 16,
                max_pin_attempts,
                wipe_policy,
                ..SecurityConfig::default()
            },
        }
    }

    /// Platform handles over this rig's doubles.
    pub fn platform(&self) -> Platform {
        Platform {
            storage: self.flash.clone(),
            removable: self.sd.clone(),
            clock: self.clock.clone(),
            secure_element: self.secure_element.clone(),
            bootloader: self.bootloader.clone(),
            prompt: self.prompt.clone(),
        }
    }

    /// Boots a device over this rig's media. Booting twice simulates a
    /// power cycle.
    pub fn boot(&self) -> Device {
        Device::boot(self.config.clone(), self.platform(), DEVICE_SECRET).expect("boot")
    }

    /// Boots and sets `pin`, leaving the device unlocked.
    pub fn boot_with_pin(&self, pin: &str) -> Device {
        let mut device = self.boot();
        device
            .change_pin(&Pin::empty(), &Pin::new(pin).expect("pin"), None)
            .expect("set pin");
        device
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a PIN, panicking on invalid input.
pub fn pin(value: &str) -> Pin {
    Pin::new(value).expect("pin")
}

/// Unique directory under the system temp dir.
pub fn temp_root() -> PathBuf {
    std::env::temp_dir().join(format!("cerberus-it-{}", Uuid::new_v4()))
}

/// Removes a directory created by [`temp_root`].
pub fn cleanup(root: &PathBuf) {
    let _ = std::fs::remove_dir_all(root);
}
