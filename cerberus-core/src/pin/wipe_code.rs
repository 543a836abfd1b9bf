//! Wipe code record: `tag || salt`, where
//! `tag = HMAC-SHA256(salt, code)[..8]` and `salt` is 8 random bytes.

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{CoreError, CoreResult};
use crate::storage::StorageError;

const WIPE_CODE_SALT_LEN: usize = 8;
const WIPE_CODE_TAG_LEN: usize = 8;

pub(crate) struct WipeCode {
    tag: [u8; WIPE_CODE_TAG_LEN],
    salt: [u8; WIPE_CODE_SALT_LEN],
}

impl WipeCode {
    pub(crate) fn seal(code: &[u8]) -> CoreResult<Self> {
        let mut salt = [0u8; WIPE_CODE_SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let tag = Self::tag(&salt, code)?;
        Ok(Self { tag, salt })
    }

    fn tag(salt: &[u8], code: &[u8]) -> CoreResult<[u8; WIPE_CODE_TAG_LEN]> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salt)
            .map_err(|err| CoreError::firmware(err.to_string()))?;
        mac.update(code);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; WIPE_CODE_TAG_LEN];
        tag.copy_from_slice(&digest[..WIPE_CODE_TAG_LEN]);
        Ok(tag)
    }

    pub(crate) fn matches(&self, code: &[u8]) -> CoreResult<bool> {
        let candidate = Self::tag(&self.salt, code)?;
        Ok(candidate.ct_eq(&self.tag).into())
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(WIPE_CODE_TAG_LEN + WIPE_CODE_SALT_LEN);
        bytes.extend_from_slice(&self.tag);
        bytes.extend_from_slice(&self.salt);
        bytes
    }

    pub(crate) fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != WIPE_CODE_TAG_LEN + WIPE_CODE_SALT_LEN {
            return Err(StorageError::corrupted("wipe code record has the wrong length").into());
        }
        let (tag, salt) = bytes.split_at(WIPE_CODE_TAG_LEN);
        let mut record = Self {
            tag: [0u8; WIPE_CODE_TAG_LEN],
            salt: [0u8; WIPE_CODE_SALT_LEN],
        };
        record.tag.copy_from_slice(tag);
        record.salt.copy_from_slice(salt);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_only_the_sealed_code() {
        let record = WipeCode::seal(b"9999").expect("seal");
        assert!(record.matches(b"9999").expect("mac"));
        assert!(!record.matches(b"9998").expect("mac"));
        assert!(!record.matches(b"").expect("mac"));
    }

    #[test]
    fn test_encode_decode() {
        let record = WipeCode::seal(b"4321").expect("seal");
        let bytes = record.encode();
        assert_eq!(bytes.len(), 16);
        let decoded = WipeCode::decode(&bytes).expect("decode");
        assert!(decoded.matches(b"4321").expect("mac"));
    }

    #[test]
    fn test_salts_differ_between_seals() {
        let a = WipeCode::seal(b"1111").expect("seal").encode();
        let b = WipeCode::seal(b"1111").expect("seal").encode();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bad_length_is_corruption() {
        match WipeCode::decode(&[0u8; 15]) {
            Err(CoreError::Storage(StorageError::Corrupted(_))) => {}
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
