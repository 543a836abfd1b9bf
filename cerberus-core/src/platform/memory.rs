//! In-memory implementations of platform traits.
//!
//! These implementations are NOT secure for production use. They back the
//! host emulator and the unit and integration tests, and support fault
//! injection (torn writes, failing renames) for crash simulation.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::storage::{StorageError, StorageResult};

use super::{
    BootloaderState, Clock, ConfirmationPrompt, ConfirmationRequest, Decision,
    RemovableMedium, SecureElement, SecureElementError, SlotMedium,
};

// =============================================================================
// Memory Medium
// =============================================================================

#[derive(Default)]
struct Faults {
    /// Next write keeps only this many bytes and then fails.
    tear_next_write: Option<usize>,
    /// Next rename fails without touching either file.
    fail_next_rename: bool,
}

/// In-memory slot medium with fault injection.
///
/// Files survive as long as the medium does, so sharing one instance across
/// two engine instances simulates a reboot.
pub struct MemoryMedium {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    faults: Mutex<Faults>,
    present: AtomicBool,
}

impl MemoryMedium {
    /// Creates an empty, present medium.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            present: AtomicBool::new(true),
        }
    }

    /// Makes the next write persist only its first `keep` bytes and fail,
    /// as if power was lost mid-write.
    pub fn tear_next_write(&self, keep: usize) {
        self.faults.lock().expect("faults mutex").tear_next_write = Some(keep);
    }

    /// Makes the next rename fail.
    pub fn fail_next_rename(&self) {
        self.faults.lock().expect("faults mutex").fail_next_rename = true;
    }

    /// Inserts or replaces a file directly.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .expect("files mutex")
            .insert(path.to_string(), bytes);
    }

    /// Returns a copy of the file at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().expect("files mutex").get(path).cloned()
    }

    /// Returns whether `path` exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().expect("files mutex").contains_key(path)
    }

    /// Flips one byte of the file at `path`.
    pub fn corrupt(&self, path: &str, offset: usize) {
        if let Some(bytes) = self.files.lock().expect("files mutex").get_mut(path) {
            if let Some(byte) = bytes.get_mut(offset) {
                *byte ^= 0xFF;
            }
        }
    }

    /// Returns every stored path.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.files.lock().expect("files mutex").keys().cloned().collect()
    }

    fn move_file(&self, from: &str, to: &str, overwrite: bool) -> StorageResult<()> {
        self.check_present()?;
        let fail = std::mem::take(
            &mut self
                .faults
                .lock()
                .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?
                .fail_next_rename,
        );
        if fail {
            return Err(StorageError::Medium("power lost before rename".to_string()));
        }
        let mut files = self
            .files
            .lock()
            .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?;
        if !overwrite && files.contains_key(to) {
            return Err(StorageError::Medium(format!("{to} already exists")));
        }
        let bytes = files
            .remove(from)
            .ok_or_else(|| StorageError::Medium(format!("{from} not found")))?;
        files.insert(to.to_string(), bytes);
        Ok(())
    }

    /// Simulates inserting or ejecting the medium.
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    fn check_present(&self) -> StorageResult<()> {
        if self.present.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Medium("medium not present".to_string()))
        }
    }
}

impl Default for MemoryMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotMedium for MemoryMedium {
    fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_present()?;
        Ok(self.get(path))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> StorageResult<()> {
        self.check_present()?;
        let torn = self
            .faults
            .lock()
            .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?
            .tear_next_write
            .take();
        let mut files = self
            .files
            .lock()
            .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?;
        match torn {
            Some(keep) => {
                let keep = keep.min(bytes.len());
                files.insert(path.to_string(), bytes[..keep].to_vec());
                Err(StorageError::Medium("power lost during write".to_string()))
            }
            None => {
                files.insert(path.to_string(), bytes.to_vec());
                Ok(())
            }
        }
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.move_file(from, to, false)
    }

    fn replace(&self, from: &str, to: &str) -> StorageResult<()> {
        self.move_file(from, to, true)
    }

    fn remove(&self, path: &str) -> StorageResult<bool> {
        self.check_present()?;
        Ok(self
            .files
            .lock()
            .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?
            .remove(path)
            .is_some())
    }

    fn list(&self, dir: &str) -> StorageResult<Vec<String>> {
        self.check_present()?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self
            .files
            .lock()
            .map_err(|_| StorageError::Medium("mutex poisoned".to_string()))?;
        Ok(files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|name| !name.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn create_dir_all(&self, _dir: &str) -> StorageResult<()> {
        self.check_present()
    }
}

impl RemovableMedium for MemoryMedium {
    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Mock Clock
// =============================================================================

/// Manually advanced clock. Sleeping advances time instantly.
pub struct MockClock {
    now_ms: AtomicU64,
    slept_ms: AtomicU64,
}

impl MockClock {
    /// Creates a clock starting at `start_ms`.
    #[must_use]
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            slept_ms: AtomicU64::new(0),
        }
    }

    /// Moves time forward without counting it as sleep.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Total time spent in [`Clock::sleep_ms`].
    #[must_use]
    pub fn slept_ms(&self) -> u64 {
        self.slept_ms.load(Ordering::SeqCst)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
        self.slept_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

// =============================================================================
// Memory Secure Element
// =============================================================================

/// Secure element double.
///
/// **FOR TESTING ONLY**: "signatures" are HMAC-SHA256 tags under a fixed
/// key, which lets tests check which digest was signed.
pub struct MemorySecureElement {
    key: [u8; 32],
    chain: Vec<u8>,
    accessible: AtomicBool,
}

impl MemorySecureElement {
    /// Creates a secure element holding `chain` as its certificate slot.
    #[must_use]
    pub fn new(chain: Vec<u8>) -> Self {
        Self {
            key: [0x5A; 32],
            chain,
            accessible: AtomicBool::new(true),
        }
    }

    /// Makes the signing slot refuse requests.
    pub fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::SeqCst);
    }

    /// Returns whether `signature` was produced over `digest` by this element.
    #[must_use]
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(digest);
        mac.verify_slice(signature).is_ok()
    }
}

impl SecureElement for MemorySecureElement {
    fn sign(&self, _key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>, SecureElementError> {
        if !self.accessible.load(Ordering::SeqCst) {
            return Err(SecureElementError::SigningInaccessible);
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|err| SecureElementError::Device(err.to_string()))?;
        mac.update(digest);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn certificate(&self, _cert_slot: u8) -> Result<Vec<u8>, SecureElementError> {
        Ok(self.chain.clone())
    }
}

// =============================================================================
// Bootloader and prompt doubles
// =============================================================================

/// Bootloader state toggled by tests.
pub struct FixedBootloader {
    locked: AtomicBool,
}

impl FixedBootloader {
    /// Creates a bootloader reporting `locked`.
    #[must_use]
    pub const fn new(locked: bool) -> Self {
        Self {
            locked: AtomicBool::new(locked),
        }
    }

    /// Changes the reported lock state.
    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }
}

impl BootloaderState for FixedBootloader {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

/// Prompt that answers from a script, falling back to a default decision.
pub struct ScriptedPrompt {
    script: Mutex<VecDeque<Decision>>,
    fallback: Decision,
    shown: Mutex<Vec<ConfirmationRequest>>,
}

impl ScriptedPrompt {
    /// Creates a prompt that always answers `fallback`.
    #[must_use]
    pub fn always(fallback: Decision) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            shown: Mutex::new(Vec::new()),
        }
    }

    /// Queues `decision` as the answer to the next prompt.
    pub fn push(&self, decision: Decision) {
        self.script.lock().expect("script mutex").push_back(decision);
    }

    /// Returns every request shown so far.
    #[must_use]
    pub fn shown(&self) -> Vec<ConfirmationRequest> {
        self.shown.lock().expect("shown mutex").clone()
    }
}

impl ConfirmationPrompt for ScriptedPrompt {
    fn confirm(&self, request: &ConfirmationRequest) -> Decision {
        if let Ok(mut shown) = self.shown.lock() {
            shown.push(request.clone());
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torn_write_keeps_prefix() {
        let medium = MemoryMedium::new();
        medium.tear_next_write(3);
        assert!(medium.write("/a/b", &[1, 2, 3, 4, 5]).is_err());
        assert_eq!(medium.get("/a/b"), Some(vec![1, 2, 3]));
        medium.write("/a/b", &[9]).expect("write");
        assert_eq!(medium.get("/a/b"), Some(vec![9]));
    }

    #[test]
    fn test_rename_refuses_existing_target() {
        let medium = MemoryMedium::new();
        medium.insert("/x", vec![1]);
        medium.insert("/y", vec![2]);
        assert!(medium.rename("/x", "/y").is_err());
        assert_eq!(medium.get("/x"), Some(vec![1]));
    }

    #[test]
    fn test_replace_overwrites_target() {
        let medium = MemoryMedium::new();
        medium.insert("/x", vec![1]);
        medium.insert("/y", vec![2]);
        medium.replace("/x", "/y").expect("replace");
        assert!(!medium.contains("/x"));
        assert_eq!(medium.get("/y"), Some(vec![1]));

        medium.insert("/x", vec![3]);
        medium.fail_next_rename();
        assert!(medium.replace("/x", "/y").is_err());
        assert_eq!(medium.get("/y"), Some(vec![1]));
    }

    #[test]
    fn test_list_is_not_recursive() {
        let medium = MemoryMedium::new();
        medium.insert("/store/0101", vec![]);
        medium.insert("/store/0101.new", vec![]);
        medium.insert("/store/deep/0202", vec![]);
        let mut names = medium.list("/store").expect("list");
        names.sort();
        assert_eq!(names, vec!["0101".to_string(), "0101.new".to_string()]);
    }

    #[test]
    fn test_absent_medium_rejects_io() {
        let medium = MemoryMedium::new();
        medium.set_present(false);
        assert!(!medium.is_present());
        assert!(medium.read("/a").is_err());
    }

    #[test]
    fn test_secure_element_signature_verifies() {
        let se = MemorySecureElement::new(Vec::new());
        let digest = [7u8; 32];
        let signature = se.sign(0, &digest).expect("sign");
        assert!(se.verify(&digest, &signature));
        assert!(!se.verify(&[8u8; 32], &signature));
        se.set_accessible(false);
        assert!(matches!(
            se.sign(0, &digest),
            Err(SecureElementError::SigningInaccessible)
        ));
    }
}
