//! Continuation-flag framing for the proximity transport.
//!
//! Every transport unit is `[flag, payload...]`. Flag `1` means more units
//! follow; flag `0` marks the last unit of a message.

use crate::error::{MdocError, MdocResult};

pub const FLAG_MORE: u8 = 1;
pub const FLAG_LAST: u8 = 0;

/// Largest message a `Reassembler` accepts unless configured otherwise.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Split `message` into units carrying at most `chunk_size` payload bytes each.
///
/// An empty message still produces one (final) unit.
pub fn fragment(message: &[u8], chunk_size: usize) -> MdocResult<Vec<Vec<u8>>> {
    if chunk_size == 0 {
        return Err(MdocError::Transport("chunk size must be at least 1".into()));
    }
    if message.is_empty() {
        return Ok(vec![vec![FLAG_LAST]]);
    }
    let count = message.len().div_ceil(chunk_size);
    Ok(message
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, chunk)| {
            let mut unit = Vec::with_capacity(chunk.len() + 1);
            unit.push(if i + 1 == count { FLAG_LAST } else { FLAG_MORE });
            unit.extend_from_slice(chunk);
            unit
        })
        .collect())
}

/// Accumulates units until a final one arrives.
///
/// A rejected unit leaves the partial message untouched.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    units: usize,
    max_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            units: 0,
            max_size,
        }
    }

    /// Add one unit. Returns the complete message when `unit` is final.
    pub fn push(&mut self, unit: &[u8]) -> MdocResult<Option<Vec<u8>>> {
        let (flag, payload) = unit
            .split_first()
            .ok_or_else(|| MdocError::MalformedEnvelope("empty transport unit".into()))?;
        if *flag != FLAG_MORE && *flag != FLAG_LAST {
            return Err(MdocError::MalformedEnvelope(format!(
                "invalid continuation flag {:#04x}",
                flag
            )));
        }
        let size = self.buffer.len() + payload.len();
        if size > self.max_size {
            tracing::warn!(size, max = self.max_size, "reassembled message too large");
            return Err(MdocError::MalformedEnvelope(format!(
                "message exceeds {} bytes",
                self.max_size
            )));
        }
        self.buffer.extend_from_slice(payload);
        self.units += 1;
        if *flag == FLAG_MORE {
            return Ok(None);
        }
        tracing::trace!(units = self.units, bytes = self.buffer.len(), "message reassembled");
        self.units = 0;
        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    pub fn is_empty(&self) -> bool {
        self.units == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(units: &[Vec<u8>]) -> Vec<u8> {
        let mut r = Reassembler::new();
        let mut out = None;
        for (i, unit) in units.iter().enumerate() {
            out = r.push(unit).unwrap();
            assert_eq!(out.is_some(), i + 1 == units.len());
        }
        out.unwrap()
    }

    #[test]
    fn test_recovers_message_for_all_lengths_and_chunk_sizes() {
        let message: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        for len in [0usize, 1, 2, 7, 64, 255, 256, 300] {
            for chunk in [1usize, 2, 3, 20, 185, 512] {
                let units = fragment(&message[..len], chunk).unwrap();
                assert_eq!(units.len(), len.div_ceil(chunk).max(1));
                assert!(units.iter().all(|u| u.len() <= chunk + 1));
                assert_eq!(reassemble(&units), &message[..len]);
            }
        }
    }

    #[test]
    fn test_flags() {
        let units = fragment(b"abcde", 2).unwrap();
        assert_eq!(
            units,
            vec![b"\x01ab".to_vec(), b"\x01cd".to_vec(), b"\x00e".to_vec()]
        );
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(fragment(b"x", 0).is_err());
    }

    #[test]
    fn test_malformed_units() {
        let mut r = Reassembler::new();
        assert!(matches!(r.push(&[]), Err(MdocError::MalformedEnvelope(_))));
        assert!(matches!(r.push(&[7, 1]), Err(MdocError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_rejected_unit_leaves_no_payload_behind() {
        let mut r = Reassembler::new();
        assert!(r.push(&[7, 1]).is_err());
        assert!(r.is_empty());
        assert_eq!(r.push(&[0, 2]).unwrap(), Some(vec![2]));

        assert_eq!(r.push(&[1, 3]).unwrap(), None);
        assert!(r.push(&[9, 4]).is_err());
        assert_eq!(r.push(&[0, 5]).unwrap(), Some(vec![3, 5]));
    }

    #[test]
    fn test_message_size_capped() {
        let mut r = Reassembler::with_max_size(4);
        assert_eq!(r.push(&[1, 1, 2]).unwrap(), None);
        assert!(matches!(
            r.push(&[1, 3, 4, 5]),
            Err(MdocError::MalformedEnvelope(_))
        ));
        // exactly at the cap is accepted
        assert_eq!(r.push(&[0, 3, 4]).unwrap(), Some(vec![1, 2, 3, 4]));
        assert!(matches!(
            Reassembler::with_max_size(2).push(&[0, 1, 2, 3]),
            Err(MdocError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_reuse_after_complete() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(&[0, 1, 2]).unwrap(), Some(vec![1, 2]));
        assert!(r.is_empty());
        assert_eq!(r.push(&[1, 3]).unwrap(), None);
        assert_eq!(r.push(&[0, 4]).unwrap(), Some(vec![3, 4]));
    }
}
