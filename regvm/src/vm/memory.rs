use crate::bytecode::Width;

use super::{VmError, VmResult};

pub const SEGMENT_ALIGN: usize = 8;

pub fn align8(value: usize) -> usize {
    value.div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN
}

/// Segment offsets of an arena laid out as `[stack][data][text]`.
///
/// Every segment start and every global starts on an 8-byte boundary. Addresses handed to scripts
/// and natives are offsets from the arena start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub stack_size: usize,
    pub data_base: usize,
    pub data_size: usize,
    pub text_base: usize,
    pub text_size: usize,
    pub global_offsets: Vec<usize>,
}

impl Layout {
    pub fn new(
        stack_size: usize,
        global_sizes: impl IntoIterator<Item = usize>,
        text_size: usize,
    ) -> Self {
        let data_base = align8(stack_size);
        let mut cursor = data_base;
        let mut global_offsets = Vec::new();
        for size in global_sizes {
            global_offsets.push(cursor);
            cursor += align8(size);
        }
        let text_base = align8(cursor);
        Self {
            stack_size,
            data_base,
            data_size: text_base - data_base,
            text_base,
            text_size,
            global_offsets,
        }
    }

    pub fn total_size(&self) -> usize {
        self.text_base + self.text_size
    }

    pub fn text_end(&self) -> usize {
        self.text_base + self.text_size
    }

    pub fn in_text(&self, address: u64) -> bool {
        address >= self.text_base as u64 && address < self.text_end() as u64
    }
}

/// The engine arena.
///
/// # Hazards
///
/// With `checked == false` (module built without `$safemode`, host did not force safe mode) the
/// scalar load and store paths do not validate addresses. A script that touches memory outside the
/// arena in that mode has no defined outcome: the engine reports no fault, and because the arena is
/// an ordinary Rust buffer the host thread panics. Only run untrusted bytecode in safe mode.
/// `slice` and `slice_mut`, used by natives and the host, are always checked.
pub struct Memory {
    bytes: Vec<u8>,
    checked: bool,
}

impl Memory {
    pub fn new(size: usize, checked: bool) -> Self {
        Self {
            bytes: vec![0; size],
            checked,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn load(&self, address: u64, width: Width) -> VmResult<u64> {
        let start = self.start(address, width.bytes())?;
        let mut raw = [0u8; 8];
        raw[..width.bytes()].copy_from_slice(&self.bytes[start..start + width.bytes()]);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn store(&mut self, address: u64, width: Width, value: u64) -> VmResult<()> {
        let start = self.start(address, width.bytes())?;
        let raw = value.to_le_bytes();
        self.bytes[start..start + width.bytes()].copy_from_slice(&raw[..width.bytes()]);
        Ok(())
    }

    pub fn slice(&self, address: u64, len: usize) -> VmResult<&[u8]> {
        let range = self.checked_range(address, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, address: u64, len: usize) -> VmResult<&mut [u8]> {
        let range = self.checked_range(address, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Bytes from `address` up to (not including) the next NUL, or to the arena end.
    pub fn c_str(&self, address: u64) -> VmResult<&[u8]> {
        let start = self.checked_range(address, 0)?.start;
        let tail = &self.bytes[start..];
        let end = tail.iter().position(|byte| *byte == 0).unwrap_or(tail.len());
        Ok(&tail[..end])
    }

    pub fn fill(&mut self, start: usize, bytes: &[u8]) {
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn zero(&mut self, start: usize, len: usize) {
        self.bytes[start..start + len].fill(0);
    }

    fn start(&self, address: u64, len: usize) -> VmResult<usize> {
        if self.checked {
            Ok(self.checked_range(address, len)?.start)
        } else {
            Ok(address as usize)
        }
    }

    fn checked_range(&self, address: u64, len: usize) -> VmResult<std::ops::Range<usize>> {
        let out_of_bounds = || VmError::OutOfBoundsAccess {
            address,
            len,
            arena: self.bytes.len(),
        };
        let start = usize::try_from(address).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.bytes.len() {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}
