//! Splits a concatenated DER certificate chain.
//!
//! Only the outer `SEQUENCE` header of each certificate is parsed; the
//! contents are returned untouched.

use crate::error::{CoreError, CoreResult};

const SEQUENCE_TAG: u8 = 0x30;
const MAX_LENGTH_BYTES: usize = 4;

/// Reads a DER length at `*offset` and advances past it.
///
/// Short form is a single byte below `0x80`. Long form is `0x80 | n`
/// followed by `n` big-endian bytes, `1 <= n <= 4`.
pub(crate) fn read_length(bytes: &[u8], offset: &mut usize) -> CoreResult<usize> {
    let first = *bytes
        .get(*offset)
        .ok_or_else(|| CoreError::firmware("Device certificate is truncated."))?;
    *offset += 1;
    if first < 0x80 {
        return Ok(usize::from(first));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 || count > MAX_LENGTH_BYTES {
        return Err(CoreError::firmware("Device certificate has an invalid length."));
    }
    let end = offset
        .checked_add(count)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| CoreError::firmware("Device certificate is truncated."))?;
    let length = bytes[*offset..end]
        .iter()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
    *offset = end;
    Ok(length)
}

/// Splits `chain` into individual certificates, leaf first.
///
/// # Errors
///
/// Returns [`CoreError::FirmwareError`] if the chain is empty, a certificate
/// does not start with a `SEQUENCE` tag, or a length runs past the end.
pub fn split_certificates(chain: &[u8]) -> CoreResult<Vec<Vec<u8>>> {
    if chain.is_empty() {
        return Err(CoreError::firmware("Device certificate is missing."));
    }
    let mut certificates = Vec::new();
    let mut offset = 0;
    while offset < chain.len() {
        let begin = offset;
        if chain[offset] != SEQUENCE_TAG {
            return Err(CoreError::firmware("Device certificate is corrupted."));
        }
        offset += 1;
        let body = read_length(chain, &mut offset)?;
        let end = offset
            .checked_add(body)
            .filter(|end| *end <= chain.len())
            .ok_or_else(|| CoreError::firmware("Device certificate is truncated."))?;
        certificates.push(chain[begin..end].to_vec());
        offset = end;
    }
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn cert(body_len: usize) -> Vec<u8> {
        let mut out = vec![SEQUENCE_TAG];
        match body_len {
            0..=0x7F => out.push(u8::try_from(body_len).expect("short")),
            0x80..=0xFF => out.extend_from_slice(&[0x81, u8::try_from(body_len).expect("u8")]),
            _ => {
                let len = u16::try_from(body_len).expect("u16");
                out.push(0x82);
                out.extend_from_slice(&len.to_be_bytes());
            }
        }
        out.extend((0..body_len).map(|i| (i % 200) as u8));
        out
    }

    #[test_case(&[0x05], 5 ; "short form")]
    #[test_case(&[0x81, 0x80], 128 ; "one length byte")]
    #[test_case(&[0x82, 0x01, 0x00], 256 ; "two length bytes")]
    #[test_case(&[0x84, 0x00, 0x01, 0x00, 0x00], 65_536 ; "four length bytes")]
    fn test_read_length(bytes: &[u8], expected: usize) {
        let mut offset = 0;
        assert_eq!(read_length(bytes, &mut offset).expect("length"), expected);
        assert_eq!(offset, bytes.len());
    }

    #[test_case(&[0x80] ; "indefinite")]
    #[test_case(&[0x85, 1, 2, 3, 4, 5] ; "too many length bytes")]
    #[test_case(&[0x82, 0x01] ; "truncated length")]
    #[test_case(&[] ; "empty")]
    fn test_read_length_rejects(bytes: &[u8]) {
        let mut offset = 0;
        assert!(matches!(
            read_length(bytes, &mut offset),
            Err(CoreError::FirmwareError(_))
        ));
    }

    #[test]
    fn test_splits_chain_in_order() {
        let leaf = cert(10);
        let intermediate = cert(200);
        let root = cert(600);
        let chain = [leaf.clone(), intermediate.clone(), root.clone()].concat();
        let certificates = split_certificates(&chain).expect("split");
        assert_eq!(certificates, vec![leaf, intermediate, root]);
    }

    #[test]
    fn test_bad_tag_is_corrupted() {
        let mut chain = cert(10);
        chain.extend_from_slice(&[0x31, 0x00]);
        match split_certificates(&chain) {
            Err(CoreError::FirmwareError(message)) => {
                assert_eq!(message, "Device certificate is corrupted.");
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_truncated_certificate() {
        let mut chain = cert(300);
        chain.truncate(chain.len() - 1);
        assert!(matches!(
            split_certificates(&chain),
            Err(CoreError::FirmwareError(_))
        ));
    }

    #[test]
    fn test_empty_chain() {
        assert!(matches!(
            split_certificates(&[]),
            Err(CoreError::FirmwareError(_))
        ));
    }
}
