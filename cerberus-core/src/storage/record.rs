//! Record keys and the authenticated encryption of protected values.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};

use super::error::{StorageError, StorageResult};

/// App flag: record is stored unencrypted and readable while locked.
pub const FLAG_PUBLIC: u8 = 0x80;
/// App flags: record is public and also writable while locked.
pub const FLAGS_WRITE: u8 = 0xC0;
/// App namespace reserved for the core itself.
pub const RESERVED_APP: u8 = 0x00;

/// Nonce length of a protected record.
pub const NONCE_LEN: usize = 12;
/// Poly1305 tag length of a protected record.
pub const TAG_LEN: usize = 16;
/// Largest value a single record can hold.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize - NONCE_LEN - TAG_LEN;

/// Two-byte record key: `app << 8 | id`.
///
/// The two high bits of `app` carry [`FLAG_PUBLIC`] and [`FLAGS_WRITE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey(u16);

impl StorageKey {
    /// Builds a protected key.
    #[must_use]
    pub const fn new(app: u8, id: u8) -> Self {
        Self(((app as u16) << 8) | id as u16)
    }

    /// Builds a public key in `app`.
    #[must_use]
    pub const fn public(app: u8, id: u8) -> Self {
        Self::new(app | FLAG_PUBLIC, id)
    }

    /// Builds a public key in `app` that may be written while locked.
    #[must_use]
    pub const fn writable_locked(app: u8, id: u8) -> Self {
        Self::new(app | FLAGS_WRITE, id)
    }

    /// Wraps a raw key.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw two-byte key.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// App byte including flags.
    #[must_use]
    pub const fn app(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Id within the app.
    #[must_use]
    pub const fn id(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Whether the value is stored unencrypted.
    #[must_use]
    pub const fn is_public(self) -> bool {
        self.app() & FLAG_PUBLIC != 0
    }

    /// Whether the value may be written while storage is locked.
    #[must_use]
    pub const fn is_writable_locked(self) -> bool {
        self.app() & FLAGS_WRITE == FLAGS_WRITE
    }

    /// Whether the key lies in the namespace reserved for the core.
    #[must_use]
    pub const fn is_reserved(self) -> bool {
        self.app() & !FLAGS_WRITE == RESERVED_APP
    }

    pub(crate) fn file_name(self) -> String {
        format!("{:04x}", self.0)
    }

    pub(crate) fn parse_file_name(name: &str) -> Option<Self> {
        if name.len() != 4 {
            return None;
        }
        u16::from_str_radix(name, 16).ok().map(Self)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Encrypts `plaintext` under `dek`, binding it to `key`.
///
/// Output layout: `nonce(12) | ciphertext | tag(16)`.
pub(crate) fn seal(dek: &[u8; 32], key: StorageKey, plaintext: &[u8]) -> StorageResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(dek));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &key.raw().to_le_bytes(),
            },
        )
        .map_err(|err| StorageError::Crypto(err.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a protected record, rejecting anything whose tag does not verify.
pub(crate) fn open(dek: &[u8; 32], key: StorageKey, sealed: &[u8]) -> StorageResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(StorageError::Integrity(key.to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(dek));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &key.raw().to_le_bytes(),
            },
        )
        .map_err(|_| StorageError::Integrity(key.to_string()))
}
