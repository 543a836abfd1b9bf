#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

//! Secure storage and session security core for the Cerberus signing device.
//!
//! - [`storage`]: encrypted, authenticated key-value records that survive
//!   power loss
//! - [`salt`]: optional second factor kept on removable media
//! - [`pin`]: PIN verification with a persisted, throttled attempt counter
//! - [`session`]: lock state and auto-lock on inactivity
//! - [`attestation`]: challenge signing with the secure-element key
//!
//! [`Device`] wires these together over a [`Platform`].

pub mod attestation;
pub mod config;
pub mod context;
pub mod device;
pub mod fields;
pub mod logger;
pub mod pin;
pub mod platform;
pub mod salt;
pub mod session;
pub mod slot;
pub mod storage;
pub mod task;

mod error;
pub use error::*;

pub use config::{SecurityConfig, WipePolicy};
pub use device::{Device, Features, Platform};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("cerberus_core");
