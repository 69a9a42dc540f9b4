#![forbid(unsafe_code)]
//! Run-length byte differ for same-size page images.
//!
//! A diff is a sequence of segments, each `u32 skip | u32 len | len bytes`
//! (little-endian). `skip` counts unchanged bytes since the end of the previous
//! segment. The encoding ends implicitly at the end of the buffer; an empty diff
//! means the images are identical.

use crate::types::{PenumbraError, Result};

const WORD: usize = 8;
const SEGMENT_HEADER_LEN: usize = 8;
/// Equal runs up to this length are folded into the surrounding segment.
const MERGE_GAP: usize = SEGMENT_HEADER_LEN;

/// Encoded difference between two page images.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PageDiff {
    bytes: Vec<u8>,
    size: usize,
}

impl PageDiff {
    /// Encoded segment bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the diff and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Length of the encoding in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the images were identical.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Page size the diff was computed over.
    pub fn page_size(&self) -> usize {
        self.size
    }

    /// Returns `true` when the encoding is materially smaller than the raw page.
    ///
    /// Callers store the full page image when this is `false`.
    pub fn is_diff(&self) -> bool {
        self.bytes.len() + self.size / 8 < self.size
    }
}

fn check_len(buf: &[u8], size: usize) -> Result<()> {
    if buf.len() < size {
        return Err(PenumbraError::Invalid("buffer shorter than diff size"));
    }
    if u32::try_from(size).is_err() {
        return Err(PenumbraError::Invalid("diff size exceeds u32"));
    }
    Ok(())
}

/// Returns merged `[start, end)` ranges where `old` and `new` differ.
fn changed_ranges(old: &[u8], new: &[u8]) -> Vec<(usize, usize)> {
    let len = new.len();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < len {
        if i + WORD <= len && old[i..i + WORD] == new[i..i + WORD] {
            i += WORD;
            continue;
        }
        if old[i] == new[i] {
            i += 1;
            continue;
        }
        let start = i;
        while i < len && old[i] != new[i] {
            i += 1;
        }
        match ranges.last_mut() {
            Some(last) if start - last.1 <= MERGE_GAP => last.1 = i,
            _ => ranges.push((start, i)),
        }
    }
    ranges
}

fn encode(new: &[u8], ranges: &[(usize, usize)], size: usize) -> PageDiff {
    let payload: usize = ranges.iter().map(|(s, e)| e - s).sum();
    let mut bytes = Vec::with_capacity(payload + ranges.len() * SEGMENT_HEADER_LEN);
    let mut prev_end = 0usize;
    for &(start, end) in ranges {
        bytes.extend_from_slice(&((start - prev_end) as u32).to_le_bytes());
        bytes.extend_from_slice(&((end - start) as u32).to_le_bytes());
        bytes.extend_from_slice(&new[start..end]);
        prev_end = end;
    }
    PageDiff { bytes, size }
}

/// Computes the diff that turns the first `size` bytes of `old` into `new`.
pub fn compute_diff(old: &[u8], new: &[u8], size: usize) -> Result<PageDiff> {
    check_len(old, size)?;
    check_len(new, size)?;
    let ranges = changed_ranges(&old[..size], &new[..size]);
    Ok(encode(&new[..size], &ranges, size))
}

/// Computes the diff of `new` against an all-zero page.
pub fn compute_new(new: &[u8], size: usize) -> Result<PageDiff> {
    check_len(new, size)?;
    let zeros = vec![0u8; size];
    let ranges = changed_ranges(&zeros, &new[..size]);
    Ok(encode(&new[..size], &ranges, size))
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

/// Replays `diff` onto `destination`; bytes outside the segments are untouched.
pub fn apply(destination: &mut [u8], diff: &[u8], size: usize) -> Result<()> {
    check_len(destination, size)?;
    let mut cursor = 0usize;
    let mut pos = 0usize;
    while cursor < diff.len() {
        if diff.len() - cursor < SEGMENT_HEADER_LEN {
            return Err(PenumbraError::Corruption("diff segment header truncated"));
        }
        let skip = read_u32(diff, cursor) as usize;
        let len = read_u32(diff, cursor + 4) as usize;
        cursor += SEGMENT_HEADER_LEN;
        let start = pos
            .checked_add(skip)
            .ok_or(PenumbraError::Corruption("diff offset overflow"))?;
        let end = start
            .checked_add(len)
            .ok_or(PenumbraError::Corruption("diff offset overflow"))?;
        if end > size {
            return Err(PenumbraError::Corruption("diff writes past page end"));
        }
        if diff.len() - cursor < len {
            return Err(PenumbraError::Corruption("diff segment payload truncated"));
        }
        destination[start..end].copy_from_slice(&diff[cursor..cursor + len]);
        cursor += len;
        pos = end;
    }
    Ok(())
}
