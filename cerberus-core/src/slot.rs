//! Durable atomic slots.
//!
//! A slot is a pair of files on a [`SlotMedium`]: the committed `primary`
//! and a shadow `primary.new`. Every update writes the shadow, reads it back
//! to verify it, then swaps it into place. A power loss at any point leaves
//! either the old primary, the verified shadow, or both;
//! [`DurableSlot::load`] decides which one wins.
//!
//! Records swap with [`SlotMedium::replace`], so a failed swap leaves the
//! committed record as it was. The removable-media salt swaps by removing
//! the primary and renaming the shadow, and relies on the next load to
//! finish a swap cut short.
//!
//! The salt verifies frames with its HMAC tag; records use [`Frame`].

use sha2::{Digest, Sha256};

use crate::platform::SlotMedium;
use crate::storage::{StorageError, StorageResult};

/// Suffix of the shadow file.
pub const STAGED_SUFFIX: &str = ".new";

/// Result of resolving a slot.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotLoad<T> {
    /// Neither file exists.
    Empty,
    /// The committed file verified and is current.
    Committed(T),
    /// A verified shadow was promoted during this load.
    Recovered(T),
    /// Files exist but none of them verifies.
    Unverified,
}

/// How the shadow takes the place of the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swap {
    /// Single atomic replacing rename.
    Replace,
    /// Remove the primary, then rename the shadow.
    RemoveThenRename,
}

/// A committed file plus its shadow on one medium.
pub struct DurableSlot<'m, M: SlotMedium + ?Sized> {
    medium: &'m M,
    primary: String,
    staged: String,
    swap: Swap,
}

impl<'m, M: SlotMedium + ?Sized> DurableSlot<'m, M> {
    /// Creates a slot whose committed file lives at `primary` and is swapped
    /// with an atomic replacing rename.
    pub fn new(medium: &'m M, primary: impl Into<String>) -> Self {
        Self::with_swap(medium, primary.into(), Swap::Replace)
    }

    /// Creates a slot that swaps by removing the primary before renaming the
    /// shadow, for media without a replacing rename.
    pub fn remove_then_rename(medium: &'m M, primary: impl Into<String>) -> Self {
        Self::with_swap(medium, primary.into(), Swap::RemoveThenRename)
    }

    fn with_swap(medium: &'m M, primary: String, swap: Swap) -> Self {
        let staged = format!("{primary}{STAGED_SUFFIX}");
        Self {
            medium,
            primary,
            staged,
            swap,
        }
    }

    /// Path of the committed file.
    #[must_use]
    pub fn primary_path(&self) -> &str {
        &self.primary
    }

    /// Path of the shadow file.
    #[must_use]
    pub fn staged_path(&self) -> &str {
        &self.staged
    }

    /// Writes `bytes` to the shadow and reads it back.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the read-back differs.
    pub fn stage(&self, bytes: &[u8]) -> StorageResult<()> {
        self.medium.write(&self.staged, bytes)?;
        match self.medium.read(&self.staged)? {
            Some(written) if written == bytes => Ok(()),
            _ => Err(StorageError::Medium(format!(
                "read-back of {} does not match",
                self.staged
            ))),
        }
    }

    /// Swaps the shadow into place.
    ///
    /// A replacing slot renames the shadow over the primary in one step. A
    /// remove-then-rename slot removes the primary first (a missing primary
    /// is fine), so a failed rename leaves only the shadow behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the shadow is missing or the rename fails.
    pub fn promote(&self) -> StorageResult<()> {
        match self.swap {
            Swap::Replace => self.medium.replace(&self.staged, &self.primary),
            Swap::RemoveThenRename => {
                self.medium.remove(&self.primary)?;
                self.medium.rename(&self.staged, &self.primary)
            }
        }
    }

    /// Stages, verifies and promotes `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. On a replacing slot the prior
    /// committed value is then still current: a shadow left by a failed
    /// swap is discarded so a later load cannot promote it.
    pub fn write(&self, bytes: &[u8]) -> StorageResult<()> {
        self.stage(bytes)?;
        if let Err(err) = self.promote() {
            if self.swap == Swap::Replace {
                if let Err(discard) = self.discard_staged() {
                    log::warn!("could not discard {}: {discard}", self.staged);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the shadow. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the shadow cannot be removed.
    pub fn discard_staged(&self) -> StorageResult<bool> {
        self.medium.remove(&self.staged)
    }

    /// Removes the committed file only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    pub fn remove_primary(&self) -> StorageResult<bool> {
        self.medium.remove(&self.primary)
    }

    /// Removes both files.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be removed.
    pub fn remove(&self) -> StorageResult<()> {
        self.medium.remove(&self.staged)?;
        self.medium.remove(&self.primary)?;
        Ok(())
    }

    /// Resolves the slot, promoting the shadow when it should win.
    ///
    /// `decode` verifies raw bytes and returns `None` for anything that does
    /// not authenticate. `prefer_staged` is asked whether a verified shadow
    /// should replace the (possibly unverified) primary. When
    /// `discard_losing_shadow` is set, a shadow that loses or fails to verify
    /// is deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails.
    pub fn load<T, D, P>(
        &self,
        decode: D,
        prefer_staged: P,
        discard_losing_shadow: bool,
    ) -> StorageResult<SlotLoad<T>>
    where
        D: Fn(&[u8]) -> Option<T>,
        P: Fn(&T, Option<&T>) -> bool,
    {
        let primary_bytes = self.medium.read(&self.primary)?;
        let primary = primary_bytes.as_deref().and_then(&decode);
        let staged_bytes = self.medium.read(&self.staged)?;
        let staged = staged_bytes.as_deref().and_then(&decode);

        if let Some(staged) = staged {
            if prefer_staged(&staged, primary.as_ref()) {
                log::info!("promoting staged copy {}", self.staged);
                self.promote()?;
                return Ok(SlotLoad::Recovered(staged));
            }
        }
        if staged_bytes.is_some() && discard_losing_shadow {
            log::debug!("discarding staged copy {}", self.staged);
            self.discard_staged()?;
        }

        Ok(match (primary, primary_bytes.is_some(), staged_bytes.is_some()) {
            (Some(value), _, _) => SlotLoad::Committed(value),
            (None, false, false) => SlotLoad::Empty,
            (None, false, true) if discard_losing_shadow => SlotLoad::Empty,
            (None, _, _) => SlotLoad::Unverified,
        })
    }
}

// =============================================================================
// Record frames
// =============================================================================

const FRAME_MAGIC: [u8; 4] = *b"CBRF";
const FRAME_HEADER_LEN: usize = 4 + 2 + 8 + 4;
const FRAME_DIGEST_LEN: usize = 32;

/// Self-verifying envelope for a persisted record.
///
/// Layout: `magic(4) | key(2, LE) | generation(8, LE) | len(4, LE) |
/// payload | SHA-256 of everything before it`. A torn write fails the length
/// or digest check and decodes to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Record key this frame belongs to.
    pub key: u16,
    /// Strictly increasing per key across commits.
    pub generation: u64,
    /// Record body.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serializes the frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let len = u32::try_from(self.payload.len()).unwrap_or(u32::MAX);
        let mut out =
            Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len() + FRAME_DIGEST_LEN);
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&self.key.to_le_bytes());
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        out
    }

    /// Parses and verifies a frame.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAME_HEADER_LEN + FRAME_DIGEST_LEN || bytes[..4] != FRAME_MAGIC {
            return None;
        }
        let key = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
        let generation = u64::from_le_bytes(bytes[6..14].try_into().ok()?);
        let len = u32::from_le_bytes(bytes[14..18].try_into().ok()?) as usize;
        if bytes.len() != FRAME_HEADER_LEN + len + FRAME_DIGEST_LEN {
            return None;
        }
        let (body, digest) = bytes.split_at(FRAME_HEADER_LEN + len);
        if Sha256::digest(body).as_slice() != digest {
            return None;
        }
        Some(Self {
            key,
            generation,
            payload: body[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}
