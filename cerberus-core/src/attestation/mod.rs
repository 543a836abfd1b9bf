//! Device authenticity proof.
//!
//! The host sends a challenge; the device signs
//! `SHA256(cs(len(header)) || header || cs(len(challenge)) || challenge)`
//! with its secure-element attestation key and returns the signature
//! together with the certificate chain that vouches for that key.

mod der;

use std::sync::Arc;

use sha2::{Digest, Sha256};

pub use der::split_certificates;

use crate::config::SecurityConfig;
use crate::error::{CoreError, CoreResult};
use crate::platform::{
    BootloaderState, ConfirmationPrompt, ConfirmationRequest, Decision, SecureElement,
    SecureElementError,
};
use crate::task::{Progress, Scheduler, Step, Task};

/// Domain separation header of the signed digest.
pub const CHALLENGE_HEADER: &[u8] = b"AuthenticateDevice:";

const PROGRESS_FRAMES: u16 = 20;
const PROGRESS_STEP: u16 = 50;

/// Appends `n` in Bitcoin compact-size encoding.
#[allow(clippy::cast_possible_truncation)]
pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => out.push(n as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xFF);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

/// Digest signed in answer to `challenge`.
#[must_use]
pub fn build_challenge_digest(header: &[u8], challenge: &[u8]) -> [u8; 32] {
    let mut prefix = Vec::with_capacity(9);
    let mut hasher = Sha256::new();
    write_compact_size(&mut prefix, header.len() as u64);
    hasher.update(&prefix);
    hasher.update(header);
    prefix.clear();
    write_compact_size(&mut prefix, challenge.len() as u64);
    hasher.update(&prefix);
    hasher.update(challenge);
    hasher.finalize().into()
}

/// Signature plus the certificates of the signing key, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct AuthenticityProof {
    /// DER certificates, leaf first.
    pub certificates: Vec<Vec<u8>>,
    /// Secure element signature over the challenge digest.
    pub signature: Vec<u8>,
}

/// Produces [`AuthenticityProof`]s.
pub struct AttestationService {
    secure_element: Arc<dyn SecureElement>,
    bootloader: Arc<dyn BootloaderState>,
    key_slot: u8,
    cert_slot: u8,
    frame_ms: u64,
}

impl AttestationService {
    /// Creates the service with the slots and frame interval in `config`.
    #[must_use]
    pub fn new(
        secure_element: Arc<dyn SecureElement>,
        bootloader: Arc<dyn BootloaderState>,
        config: &SecurityConfig,
    ) -> Self {
        Self {
            secure_element,
            bootloader,
            key_slot: config.attestation_key_slot,
            cert_slot: config.attestation_cert_slot,
            frame_ms: config.progress_frame_ms,
        }
    }

    /// Signs `digest` with the attestation key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ProcessError`] if the key slot is inaccessible
    /// and [`CoreError::FirmwareError`] if the secure element fails.
    pub fn sign(&self, digest: &[u8; 32]) -> CoreResult<Vec<u8>> {
        self.secure_element
            .sign(self.key_slot, digest)
            .map_err(|err| match err {
                SecureElementError::SigningInaccessible => {
                    CoreError::process("Signing inaccessible.")
                }
                SecureElementError::Device(message) => CoreError::FirmwareError(message),
            })
    }

    /// Reads and splits the certificate chain.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FirmwareError`] if the chain cannot be read or
    /// is malformed.
    pub fn certificate_chain(&self) -> CoreResult<Vec<Vec<u8>>> {
        let chain = self
            .secure_element
            .certificate(self.cert_slot)
            .map_err(|err| CoreError::firmware(err.to_string()))?;
        split_certificates(&chain)
    }

    /// Runs the full authentication flow for `challenge`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ProcessError`] if the bootloader is unlocked or the
    ///   key is inaccessible
    /// - [`CoreError::ActionCancelled`] if the user declines
    /// - [`CoreError::FirmwareError`] for a malformed certificate chain
    pub fn authenticate(
        &self,
        scheduler: &mut Scheduler<'_, '_>,
        prompt: &dyn ConfirmationPrompt,
        challenge: &[u8],
    ) -> CoreResult<AuthenticityProof> {
        if !self.bootloader.is_locked() {
            return Err(CoreError::process(
                "Cannot authenticate since bootloader is unlocked.",
            ));
        }
        let request = ConfirmationRequest {
            title: "Authenticate device",
            body: "Allow the connected host to check this device's authenticity?".to_string(),
        };
        if prompt.confirm(&request) == Decision::Cancelled {
            return Err(CoreError::ActionCancelled);
        }
        let digest = build_challenge_digest(CHALLENGE_HEADER, challenge);
        log::debug!("attestation digest {}", hex::encode(digest));
        scheduler.run(Authenticate {
            service: self,
            phase: Phase::Begin(digest),
        })
    }
}

enum Phase {
    Begin([u8; 32]),
    Sign([u8; 32]),
    Animate { frame: u16, proof: AuthenticityProof },
    Complete(AuthenticityProof),
    Done,
}

struct Authenticate<'a> {
    service: &'a AttestationService,
    phase: Phase,
}

impl Authenticate<'_> {
    fn animate(&mut self, frame: u16, proof: AuthenticityProof) -> Step<AuthenticityProof> {
        if self.service.frame_ms == 0 || frame >= PROGRESS_FRAMES {
            self.phase = Phase::Complete(proof);
            return Step::Yield(Progress::new(1000));
        }
        self.phase = Phase::Animate {
            frame: frame + 1,
            proof,
        };
        Step::Sleep {
            ms: self.service.frame_ms,
            progress: Progress::new(frame * PROGRESS_STEP),
        }
    }
}

impl Task for Authenticate<'_> {
    type Output = AuthenticityProof;

    fn step(&mut self) -> CoreResult<Step<AuthenticityProof>> {
        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Begin(digest) => {
                self.phase = Phase::Sign(digest);
                Ok(Step::Yield(Progress::with_message(0, "Checking authenticity")))
            }
            Phase::Sign(digest) => {
                let signature = self.service.sign(&digest)?;
                let certificates = self.service.certificate_chain()?;
                log::info!("device authenticated with {} certificates", certificates.len());
                let proof = AuthenticityProof {
                    certificates,
                    signature,
                };
                Ok(self.animate(1, proof))
            }
            Phase::Animate { frame, proof } => Ok(self.animate(frame, proof)),
            Phase::Complete(proof) => Ok(Step::Done(proof)),
            Phase::Done => Err(CoreError::process("attestation already finished")),
        }
    }
}
