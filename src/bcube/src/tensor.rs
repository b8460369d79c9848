use std::ops::Range;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TensorError {
    #[error("Buffer of {len} bytes is not a multiple of the {elem} byte element size")]
    Misaligned { len: usize, elem: usize },
    #[error("Fragment [{offset}, {end}) lies outside a buffer of {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Element-wise `dst += src` over little-endian encoded buffers.
    pub fn sum_into(&self, dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        let elem = self.size();
        for (d, s) in dst.chunks_exact_mut(elem).zip(src.chunks_exact(elem)) {
            match self {
                DataType::U8 => d[0] = d[0].wrapping_add(s[0]),
                DataType::I32 => {
                    let v = LittleEndian::read_i32(d).wrapping_add(LittleEndian::read_i32(s));
                    LittleEndian::write_i32(d, v);
                }
                DataType::I64 => {
                    let v = LittleEndian::read_i64(d).wrapping_add(LittleEndian::read_i64(s));
                    LittleEndian::write_i64(d, v);
                }
                DataType::F32 => {
                    let v = LittleEndian::read_f32(d) + LittleEndian::read_f32(s);
                    LittleEndian::write_f32(d, v);
                }
                DataType::F64 => {
                    let v = LittleEndian::read_f64(d) + LittleEndian::read_f64(s);
                    LittleEndian::write_f64(d, v);
                }
            }
        }
    }
}

/// A named tensor handed over by the host. The core only reads it.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: DataType,
    pub data: Arc<[u8]>,
}

impl TensorEntry {
    pub fn new<S: Into<String>>(
        name: S,
        dtype: DataType,
        data: Arc<[u8]>,
    ) -> Result<Self, TensorError> {
        if data.len() % dtype.size() != 0 {
            return Err(TensorError::Misaligned {
                len: data.len(),
                elem: dtype.size(),
            });
        }
        Ok(TensorEntry {
            name: name.into(),
            dtype,
            data,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn num_elements(&self) -> usize {
        self.data.len() / self.dtype.size()
    }
}

/// Splits a tensor into `num_blocks` parameter blocks at element granularity.
/// Block `k` covers elements `[k * E / B, (k + 1) * E / B)`, so sizes differ by at most one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub num_elements: usize,
    pub elem_size: usize,
    pub num_blocks: usize,
}

impl BlockLayout {
    pub fn new(num_elements: usize, elem_size: usize, num_blocks: usize) -> Self {
        assert!(num_blocks > 0);
        BlockLayout {
            num_elements,
            elem_size,
            num_blocks,
        }
    }

    pub fn for_tensor(tensor: &TensorEntry, num_blocks: usize) -> Self {
        Self::new(tensor.num_elements(), tensor.dtype.size(), num_blocks)
    }

    #[inline]
    fn element_boundary(&self, block: usize) -> usize {
        block * self.num_elements / self.num_blocks
    }

    #[inline]
    pub fn byte_offset(&self, block: usize) -> usize {
        self.element_boundary(block) * self.elem_size
    }

    /// Byte range of blocks `[first, first + count)`.
    pub fn byte_range(&self, first: usize, count: usize) -> Range<usize> {
        self.byte_offset(first)..self.byte_offset(first + count)
    }

    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.num_elements * self.elem_size
    }

    pub fn check(&self, range: &Range<usize>, len: usize) -> Result<(), TensorError> {
        if range.start > range.end || range.end > len {
            Err(TensorError::OutOfBounds {
                offset: range.start,
                end: range.end,
                len,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_covers_buffer_without_gaps() {
        let layout = BlockLayout::new(75, 4, 18);
        let mut next = 0;
        for b in 0..18 {
            let r = layout.byte_range(b, 1);
            assert_eq!(r.start, next);
            assert_eq!(r.len() % 4, 0);
            next = r.end;
        }
        assert_eq!(next, 300);
        assert_eq!(layout.byte_range(0, 18), 0..300);
    }

    #[test]
    fn even_split() {
        let layout = BlockLayout::new(300, 1, 3);
        assert_eq!(layout.byte_range(1, 1), 100..200);
        assert_eq!(layout.byte_range(1, 2), 100..300);
    }

    #[test]
    fn sum_f32_and_i64() {
        let mut dst = [0u8; 8];
        LittleEndian::write_f32(&mut dst[..4], 1.5);
        LittleEndian::write_f32(&mut dst[4..], -2.0);
        let mut src = [0u8; 8];
        LittleEndian::write_f32(&mut src[..4], 2.5);
        LittleEndian::write_f32(&mut src[4..], 4.0);
        DataType::F32.sum_into(&mut dst, &src);
        assert_eq!(LittleEndian::read_f32(&dst[..4]), 4.0);
        assert_eq!(LittleEndian::read_f32(&dst[4..]), 2.0);

        let mut dst = 40i64.to_le_bytes();
        DataType::I64.sum_into(&mut dst, &2i64.to_le_bytes());
        assert_eq!(i64::from_le_bytes(dst), 42);
    }

    #[test]
    fn misaligned_tensor_rejected() {
        let data: Arc<[u8]> = vec![0u8; 6].into();
        assert_eq!(
            TensorEntry::new("w", DataType::F32, data).unwrap_err(),
            TensorError::Misaligned { len: 6, elem: 4 }
        );
    }
}
