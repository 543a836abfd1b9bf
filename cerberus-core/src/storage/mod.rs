//! Encrypted, authenticated key-value storage.
//!
//! Every record lives in its own [`DurableSlot`] under [`STORE_DIR`] and is
//! wrapped in a self-verifying [`Frame`]. Protected records are additionally
//! sealed with ChaCha20-Poly1305 under the data encryption key, which is only
//! available while the [`SecurityContext`] is unlocked.
//!
//! Opening the engine runs recovery: verified shadows that are newer than
//! their committed record are promoted, everything else staged is discarded.

mod error;
pub mod keys;
pub mod record;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use record::{StorageKey, FLAGS_WRITE, FLAG_PUBLIC, MAX_VALUE_LEN, RESERVED_APP};

use crate::context::SecurityContext;
use crate::platform::SlotMedium;
use crate::slot::{DurableSlot, Frame, SlotLoad, STAGED_SUFFIX};

use keys::{KeyEnvelope, StorageKeys};

/// Directory holding one slot per record.
pub const STORE_DIR: &str = "/store";

/// PIN failure counter, `u32` little-endian.
pub(crate) const PIN_COUNTER_KEY: StorageKey = StorageKey::new(RESERVED_APP, 0x01);
/// CBOR [`KeyEnvelope`].
pub(crate) const KEY_ENVELOPE_KEY: StorageKey = StorageKey::new(RESERVED_APP, 0x02);
/// Wipe code salt and tag.
pub(crate) const WIPE_CODE_KEY: StorageKey = StorageKey::new(RESERVED_APP, 0x03);

fn newest(staged: &Frame, primary: Option<&Frame>) -> bool {
    primary.is_none_or(|primary| staged.generation > primary.generation)
}

/// Record store over a [`SlotMedium`].
pub struct StorageEngine {
    medium: Arc<dyn SlotMedium>,
}

impl StorageEngine {
    /// Opens the store and recovers interrupted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be listed or a recovery step
    /// fails. Records that fail verification are left in place and reported
    /// on read.
    pub fn open(medium: Arc<dyn SlotMedium>) -> StorageResult<Self> {
        let engine = Self { medium };
        engine.recover()?;
        Ok(engine)
    }

    fn slot(&self, key: StorageKey) -> DurableSlot<'_, dyn SlotMedium> {
        DurableSlot::new(
            self.medium.as_ref(),
            format!("{STORE_DIR}/{}", key.file_name()),
        )
    }

    fn recover(&self) -> StorageResult<()> {
        let keys: BTreeSet<StorageKey> = self
            .medium
            .list(STORE_DIR)?
            .iter()
            .filter_map(|name| {
                StorageKey::parse_file_name(name.strip_suffix(STAGED_SUFFIX).unwrap_or(name))
            })
            .collect();
        for key in keys {
            match self.load_frame(key)? {
                SlotLoad::Recovered(frame) => {
                    log::info!("recovered record {key} at generation {}", frame.generation);
                }
                SlotLoad::Unverified => log::error!("record {key} failed verification"),
                SlotLoad::Committed(_) | SlotLoad::Empty => {}
            }
        }
        Ok(())
    }

    fn load_frame(&self, key: StorageKey) -> StorageResult<SlotLoad<Frame>> {
        self.slot(key).load(
            |bytes| Frame::decode(bytes).filter(|frame| frame.key == key.raw()),
            newest,
            true,
        )
    }

    fn read_payload(&self, key: StorageKey) -> StorageResult<Option<Vec<u8>>> {
        match self.load_frame(key)? {
            SlotLoad::Committed(frame) | SlotLoad::Recovered(frame) => Ok(Some(frame.payload)),
            SlotLoad::Empty => Ok(None),
            SlotLoad::Unverified => Err(StorageError::Integrity(key.to_string())),
        }
    }

    fn write_payload(&self, key: StorageKey, payload: Vec<u8>) -> StorageResult<()> {
        let generation = match self.load_frame(key)? {
            SlotLoad::Committed(frame) | SlotLoad::Recovered(frame) => frame.generation + 1,
            SlotLoad::Empty | SlotLoad::Unverified => 1,
        };
        let frame = Frame {
            key: key.raw(),
            generation,
            payload,
        };
        self.slot(key).write(&frame.encode())
    }

    /// Stages a record without promoting it, as if power was lost between
    /// the read-back and the swap.
    #[cfg(test)]
    pub(crate) fn stage_only(&self, key: StorageKey, payload: Vec<u8>) -> StorageResult<()> {
        let generation = match self.load_frame(key)? {
            SlotLoad::Committed(frame) | SlotLoad::Recovered(frame) => frame.generation + 1,
            SlotLoad::Empty | SlotLoad::Unverified => 1,
        };
        let frame = Frame {
            key: key.raw(),
            generation,
            payload,
        };
        self.slot(key).stage(&frame.encode())
    }

    fn check_user_key(key: StorageKey) -> StorageResult<()> {
        if key.is_reserved() {
            return Err(StorageError::ReservedKey(key.raw()));
        }
        Ok(())
    }

    // =========================================================================
    // Record API
    // =========================================================================

    /// Reads a record. Returns `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// - [`StorageError::ReservedKey`] for keys in the core namespace
    /// - [`StorageError::Locked`] for protected keys while locked
    /// - [`StorageError::Integrity`] if the record does not authenticate
    pub fn read(&self, ctx: &SecurityContext, key: StorageKey) -> StorageResult<Option<Vec<u8>>> {
        Self::check_user_key(key)?;
        if key.is_public() {
            return self.read_payload(key);
        }
        let keys = ctx.storage_keys().ok_or(StorageError::Locked)?;
        self.read_payload(key)?
            .map(|sealed| record::open(keys.dek(), key, &sealed))
            .transpose()
    }

    /// Writes a record atomically.
    ///
    /// # Errors
    ///
    /// - [`StorageError::ReservedKey`] for keys in the core namespace
    /// - [`StorageError::ValueTooLarge`] above [`MAX_VALUE_LEN`]
    /// - [`StorageError::Locked`] while locked, unless the key carries
    ///   [`FLAGS_WRITE`]
    pub fn write(&self, ctx: &SecurityContext, key: StorageKey, value: &[u8]) -> StorageResult<()> {
        Self::check_user_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(StorageError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
        let keys = ctx.storage_keys();
        if keys.is_none() && !key.is_writable_locked() {
            return Err(StorageError::Locked);
        }
        let payload = match keys {
            Some(keys) if !key.is_public() => record::seal(keys.dek(), key, value)?,
            _ => value.to_vec(),
        };
        self.write_payload(key, payload)
    }

    /// Deletes a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Same access rules as [`Self::write`].
    pub fn delete(&self, ctx: &SecurityContext, key: StorageKey) -> StorageResult<bool> {
        Self::check_user_key(key)?;
        if ctx.storage_keys().is_none() && !key.is_writable_locked() {
            return Err(StorageError::Locked);
        }
        let slot = self.slot(key);
        let staged = slot.discard_staged()?;
        Ok(slot.remove_primary()? || staged)
    }

    /// Sets a public counter to `count`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotPublic`] for protected keys, plus the
    /// errors of [`Self::write`].
    pub fn set_counter(&self, ctx: &SecurityContext, key: StorageKey, count: u32) -> StorageResult<()> {
        if !key.is_public() {
            return Err(StorageError::NotPublic(key.raw()));
        }
        self.write(ctx, key, &count.to_le_bytes())
    }

    /// Increments a public counter and returns the new value.
    ///
    /// A missing counter starts at zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the stored value is not a
    /// counter or would overflow, plus the errors of [`Self::set_counter`].
    pub fn next_counter(&self, ctx: &SecurityContext, key: StorageKey) -> StorageResult<u32> {
        if !key.is_public() {
            return Err(StorageError::NotPublic(key.raw()));
        }
        let next = match self.read(ctx, key)? {
            None => 0,
            Some(bytes) => decode_u32(key, &bytes)?
                .checked_add(1)
                .ok_or_else(|| StorageError::corrupted(format!("counter {key} overflow")))?,
        };
        self.set_counter(ctx, key, next)?;
        Ok(next)
    }

    // =========================================================================
    // Core namespace
    // =========================================================================

    pub(crate) fn read_reserved(&self, key: StorageKey) -> StorageResult<Option<Vec<u8>>> {
        debug_assert!(key.is_reserved());
        self.read_payload(key)
    }

    pub(crate) fn write_reserved(&self, key: StorageKey, payload: &[u8]) -> StorageResult<()> {
        debug_assert!(key.is_reserved());
        self.write_payload(key, payload.to_vec())
    }

    pub(crate) fn delete_reserved(&self, key: StorageKey) -> StorageResult<()> {
        debug_assert!(key.is_reserved());
        self.slot(key).remove()
    }

    /// Whether a key envelope exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope record does not verify.
    pub fn is_initialized(&self) -> StorageResult<bool> {
        Ok(self.read_reserved(KEY_ENVELOPE_KEY)?.is_some())
    }

    pub(crate) fn load_envelope(&self) -> StorageResult<KeyEnvelope> {
        let bytes = self
            .read_reserved(KEY_ENVELOPE_KEY)?
            .ok_or(StorageError::NotInitialized)?;
        KeyEnvelope::deserialize(&bytes)
    }

    pub(crate) fn store_envelope(&self, envelope: &KeyEnvelope) -> StorageResult<()> {
        self.write_reserved(KEY_ENVELOPE_KEY, &envelope.serialize()?)
    }

    /// Persisted PIN failure count.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if storage is initialized but the
    /// counter is missing or malformed.
    pub fn pin_failures(&self) -> StorageResult<u32> {
        match self.read_reserved(PIN_COUNTER_KEY)? {
            Some(bytes) => decode_u32(PIN_COUNTER_KEY, &bytes),
            None if self.is_initialized()? => {
                Err(StorageError::corrupted("PIN counter is missing"))
            }
            None => Ok(0),
        }
    }

    pub(crate) fn set_pin_failures(&self, failures: u32) -> StorageResult<()> {
        self.write_reserved(PIN_COUNTER_KEY, &failures.to_le_bytes())
    }

    /// Creates fresh keys wrapped under the empty PIN, unless storage is
    /// already initialized. Returns whether anything was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is torn down or a write fails.
    pub fn initialize(&self, ctx: &SecurityContext, iterations: u32) -> StorageResult<bool> {
        if self.is_initialized()? {
            return Ok(false);
        }
        let hardware_salt = ctx
            .hardware_salt()
            .map_err(|_| StorageError::NotInitialized)?;
        let keys = StorageKeys::generate();
        let envelope = KeyEnvelope::seal(&keys, b"", hardware_salt, None, None, iterations)?;
        // The counter must exist before the envelope marks storage initialized.
        self.set_pin_failures(0)?;
        self.store_envelope(&envelope)?;
        log::info!("storage initialized");
        Ok(true)
    }

    /// Destroys every record and re-initializes with fresh keys and no PIN.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be removed or re-initialization
    /// fails.
    pub fn wipe(&self, ctx: &mut SecurityContext, iterations: u32) -> StorageResult<()> {
        ctx.clear_keys();
        // Envelope first so a partial wipe can never leave old keys usable.
        self.delete_reserved(KEY_ENVELOPE_KEY)?;
        for name in self.medium.list(STORE_DIR)? {
            self.medium.remove(&format!("{STORE_DIR}/{name}"))?;
        }
        log::warn!("storage wiped");
        self.initialize(ctx, iterations)?;
        Ok(())
    }
}

fn decode_u32(key: StorageKey, bytes: &[u8]) -> StorageResult<u32> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| StorageError::corrupted(format!("{key} is not a counter")))?;
    Ok(u32::from_le_bytes(bytes))
}
