//! Delta Engine
//!
//! Binary patches between successive bundles. The updater only relies on
//! `apply(base, compute(base, target)) == target`; [`GdiffEngine`] is the
//! implementation used by both the publishing tool and the client.
//!
//! ## Patch format (GDIFF)
//!
//! ```text
//! magic:    d1 ff d1 ff
//! version:  04
//! commands: 0          end of patch
//!           1..=246    DATA, that many literal bytes follow
//!           247        DATA, u16 length
//!           248        DATA, i32 length
//!           249..=255  COPY from base, (offset, length) widths:
//!                      (u16,u8) (u16,u16) (u16,i32) (i32,u8) (i32,u16) (i32,i32) (i64,i32)
//! ```
//!
//! All integers are big-endian.

use std::collections::HashMap;
use thiserror::Error;

const MAGIC: [u8; 4] = [0xd1, 0xff, 0xd1, 0xff];
const FORMAT_VERSION: u8 = 4;

const EOF: u8 = 0;
const DATA_MAX_INLINE: u8 = 246;
const DATA_USHORT: u8 = 247;
const DATA_INT: u8 = 248;
const COPY_USHORT_UBYTE: u8 = 249;
const COPY_USHORT_USHORT: u8 = 250;
const COPY_USHORT_INT: u8 = 251;
const COPY_INT_UBYTE: u8 = 252;
const COPY_INT_USHORT: u8 = 253;
const COPY_INT_INT: u8 = 254;
const COPY_LONG_INT: u8 = 255;

/// Matches shorter than this are emitted as literal data
const DEFAULT_BLOCK_SIZE: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeltaError {
    #[error("not a GDIFF patch")]
    BadMagic,

    #[error("unsupported GDIFF version {0}")]
    UnsupportedVersion(u8),

    #[error("patch truncated at offset {0}")]
    Truncated(usize),

    #[error("copy of {length} bytes at {offset} exceeds base of {base_len} bytes")]
    CopyOutOfRange {
        offset: u64,
        length: u64,
        base_len: usize,
    },

    #[error("negative length or offset in patch at {0}")]
    Negative(usize),

    #[error("unexpected data after end of patch at offset {0}")]
    TrailingData(usize),
}

/// Computes and applies binary patches
pub trait DeltaEngine: Send + Sync {
    fn compute(&self, base: &[u8], target: &[u8]) -> Vec<u8>;

    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, DeltaError>;
}

/// Block-matching GDIFF encoder/decoder
#[derive(Debug, Clone)]
pub struct GdiffEngine {
    block_size: usize,
}

impl Default for GdiffEngine {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl GdiffEngine {
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }
}

impl DeltaEngine for GdiffEngine {
    fn compute(&self, base: &[u8], target: &[u8]) -> Vec<u8> {
        let block = self.block_size;
        let mut index: HashMap<&[u8], usize> = HashMap::new();
        let mut offset = 0;
        while offset + block <= base.len() {
            index.entry(&base[offset..offset + block]).or_insert(offset);
            offset += block;
        }

        let mut writer = PatchWriter::new();
        let mut pending_from = 0;
        let mut pos = 0;
        while pos + block <= target.len() {
            match index.get(&target[pos..pos + block]) {
                Some(&base_offset) => {
                    let mut length = block;
                    while base_offset + length < base.len()
                        && pos + length < target.len()
                        && base[base_offset + length] == target[pos + length]
                    {
                        length += 1;
                    }
                    writer.data(&target[pending_from..pos]);
                    writer.copy(base_offset as u64, length as u64);
                    pos += length;
                    pending_from = pos;
                }
                None => pos += 1,
            }
        }
        writer.data(&target[pending_from..]);
        writer.finish()
    }

    fn apply(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let mut reader = PatchReader { patch, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(DeltaError::BadMagic);
        }
        let version = reader.u8()?;
        if version != FORMAT_VERSION {
            return Err(DeltaError::UnsupportedVersion(version));
        }

        let mut out = Vec::with_capacity(base.len());
        loop {
            let command = reader.u8()?;
            match command {
                EOF => break,
                1..=DATA_MAX_INLINE => out.extend_from_slice(reader.take(command as usize)?),
                DATA_USHORT => {
                    let length = reader.u16()? as usize;
                    out.extend_from_slice(reader.take(length)?);
                }
                DATA_INT => {
                    let raw = reader.i32()? as i64;
                    let length = reader.non_negative(raw)? as usize;
                    out.extend_from_slice(reader.take(length)?);
                }
                _ => {
                    let (offset, length) = match command {
                        COPY_USHORT_UBYTE => (reader.u16()? as i64, reader.u8()? as i64),
                        COPY_USHORT_USHORT => (reader.u16()? as i64, reader.u16()? as i64),
                        COPY_USHORT_INT => (reader.u16()? as i64, reader.i32()? as i64),
                        COPY_INT_UBYTE => (reader.i32()? as i64, reader.u8()? as i64),
                        COPY_INT_USHORT => (reader.i32()? as i64, reader.u16()? as i64),
                        COPY_INT_INT => (reader.i32()? as i64, reader.i32()? as i64),
                        _ => (reader.i64()?, reader.i32()? as i64),
                    };
                    let offset = reader.non_negative(offset)?;
                    let length = reader.non_negative(length)?;
                    let end = offset
                        .checked_add(length)
                        .filter(|end| *end <= base.len() as u64)
                        .ok_or(DeltaError::CopyOutOfRange {
                            offset,
                            length,
                            base_len: base.len(),
                        })?;
                    out.extend_from_slice(&base[offset as usize..end as usize]);
                }
            }
        }

        if reader.pos != patch.len() {
            return Err(DeltaError::TrailingData(reader.pos));
        }
        Ok(out)
    }
}

struct PatchWriter {
    buf: Vec<u8>,
}

impl PatchWriter {
    fn new() -> Self {
        let mut buf = MAGIC.to_vec();
        buf.push(FORMAT_VERSION);
        Self { buf }
    }

    fn data(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let chunk = bytes.len().min(i32::MAX as usize);
            if chunk <= DATA_MAX_INLINE as usize {
                self.buf.push(chunk as u8);
            } else if chunk <= u16::MAX as usize {
                self.buf.push(DATA_USHORT);
                self.buf.extend_from_slice(&(chunk as u16).to_be_bytes());
            } else {
                self.buf.push(DATA_INT);
                self.buf.extend_from_slice(&(chunk as i32).to_be_bytes());
            }
            self.buf.extend_from_slice(&bytes[..chunk]);
            bytes = &bytes[chunk..];
        }
    }

    fn copy(&mut self, offset: u64, mut length: u64) {
        let mut offset = offset;
        while length > 0 {
            let chunk = length.min(i32::MAX as u64);
            self.copy_one(offset, chunk);
            offset += chunk;
            length -= chunk;
        }
    }

    fn copy_one(&mut self, offset: u64, length: u64) {
        let short_offset = offset <= u16::MAX as u64;
        let int_offset = offset <= i32::MAX as u64;
        if short_offset {
            let offset = (offset as u16).to_be_bytes();
            if length <= u8::MAX as u64 {
                self.buf.push(COPY_USHORT_UBYTE);
                self.buf.extend_from_slice(&offset);
                self.buf.push(length as u8);
            } else if length <= u16::MAX as u64 {
                self.buf.push(COPY_USHORT_USHORT);
                self.buf.extend_from_slice(&offset);
                self.buf.extend_from_slice(&(length as u16).to_be_bytes());
            } else {
                self.buf.push(COPY_USHORT_INT);
                self.buf.extend_from_slice(&offset);
                self.buf.extend_from_slice(&(length as i32).to_be_bytes());
            }
        } else if int_offset {
            let offset = (offset as i32).to_be_bytes();
            if length <= u8::MAX as u64 {
                self.buf.push(COPY_INT_UBYTE);
                self.buf.extend_from_slice(&offset);
                self.buf.push(length as u8);
            } else if length <= u16::MAX as u64 {
                self.buf.push(COPY_INT_USHORT);
                self.buf.extend_from_slice(&offset);
                self.buf.extend_from_slice(&(length as u16).to_be_bytes());
            } else {
                self.buf.push(COPY_INT_INT);
                self.buf.extend_from_slice(&offset);
                self.buf.extend_from_slice(&(length as i32).to_be_bytes());
            }
        } else {
            self.buf.push(COPY_LONG_INT);
            self.buf.extend_from_slice(&(offset as i64).to_be_bytes());
            self.buf.extend_from_slice(&(length as i32).to_be_bytes());
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf.push(EOF);
        self.buf
    }
}

struct PatchReader<'a> {
    patch: &'a [u8],
    pos: usize,
}

impl<'a> PatchReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DeltaError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.patch.len())
            .ok_or(DeltaError::Truncated(self.pos))?;
        let bytes = &self.patch[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DeltaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DeltaError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DeltaError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DeltaError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DeltaError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn non_negative(&self, value: i64) -> Result<u64, DeltaError> {
        u64::try_from(value).map_err(|_| DeltaError::Negative(self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(base: &[u8], target: &[u8]) -> Vec<u8> {
        let engine = GdiffEngine::default();
        let patch = engine.compute(base, target);
        let out = engine.apply(base, &patch).unwrap();
        assert_eq!(out, target);
        patch
    }

    fn pseudo_random(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_empty_and_single_byte() {
        round_trip(b"", b"");
        round_trip(b"", b"x");
        round_trip(b"x", b"");
        round_trip(b"x", b"y");
        round_trip(b"x", b"x");
    }

    #[test]
    fn test_one_leading_byte_changed() {
        let mut base = vec![0u8; 2048];
        base[0] = 1;
        let mut target = base.clone();
        target[0] = 2;
        let patch = round_trip(&base, &target);
        assert!(patch.len() < 64, "patch was {} bytes", patch.len());
    }

    #[test]
    fn test_unrelated_inputs() {
        round_trip(&pseudo_random(5000, 1), &pseudo_random(7000, 2));
    }

    #[test]
    fn test_insertions_and_deletions() {
        let base = pseudo_random(100_000, 7);
        let mut target = base[..30_000].to_vec();
        target.extend_from_slice(b"inserted in the middle");
        target.extend_from_slice(&base[40_000..]);
        target.extend_from_slice(&pseudo_random(300, 9));
        let patch = round_trip(&base, &target);
        assert!(patch.len() < 2_000);
    }

    #[test]
    fn test_large_literal_runs() {
        round_trip(b"", &pseudo_random(70_000, 3));
    }

    #[test]
    fn test_rejects_bad_header() {
        let engine = GdiffEngine::default();
        assert_eq!(engine.apply(b"", b"nope!"), Err(DeltaError::BadMagic));
        assert_eq!(
            engine.apply(b"", &[0xd1, 0xff, 0xd1, 0xff, 3, 0]),
            Err(DeltaError::UnsupportedVersion(3))
        );
        assert_eq!(engine.apply(b"", &[0xd1]), Err(DeltaError::Truncated(0)));
    }

    #[test]
    fn test_rejects_copy_past_base() {
        let engine = GdiffEngine::default();
        let patch = [0xd1, 0xff, 0xd1, 0xff, 4, COPY_USHORT_UBYTE, 0, 2, 5, EOF];
        assert!(matches!(
            engine.apply(b"abc", &patch),
            Err(DeltaError::CopyOutOfRange { offset: 2, length: 5, base_len: 3 })
        ));
    }

    #[test]
    fn test_int_length_data_command() {
        let engine = GdiffEngine::default();
        let mut patch = vec![0xd1, 0xff, 0xd1, 0xff, 4, DATA_INT];
        patch.extend_from_slice(&3i32.to_be_bytes());
        patch.extend_from_slice(b"xyz");
        patch.push(EOF);
        assert_eq!(engine.apply(b"", &patch).unwrap(), b"xyz".to_vec());

        let mut negative = vec![0xd1, 0xff, 0xd1, 0xff, 4, DATA_INT];
        negative.extend_from_slice(&(-1i32).to_be_bytes());
        negative.push(EOF);
        assert!(matches!(engine.apply(b"", &negative), Err(DeltaError::Negative(_))));
    }

    #[test]
    fn test_rejects_missing_eof_and_trailing_bytes() {
        let engine = GdiffEngine::default();
        let mut patch = engine.compute(b"", b"abc");
        patch.pop();
        assert!(matches!(engine.apply(b"", &patch), Err(DeltaError::Truncated(_))));

        let mut patch = engine.compute(b"", b"abc");
        patch.push(1);
        assert!(matches!(engine.apply(b"", &patch), Err(DeltaError::TrailingData(_))));
    }
}
