//! Segmented guest memory
//!
//! One [`SegmentedMemory`] backs one loaded module for its whole lifetime.
//! Segments are added by the loader and never removed. Code segments carry a
//! decoded-instruction cache that is a pure function of their byte contents:
//! any write into a code segment discards the overlapping entries.
//!
//! All offset arithmetic wraps modulo the 64 KiB segment size, matching
//! real-mode behavior: a word written at `0xFFFF` stores its high byte at
//! offset `0x0000` of the same segment.

use crate::consts::{MAX_INSTRUCTION_LEN, SEGMENT_SIZE};
use crate::error::{ExecResult, Fault};
use crate::far_ptr::FarPtr;
use crate::relocation::{RelocationRecord, RelocationTarget};

use hashbrown::HashMap;
use iced_x86::{Decoder, DecoderOptions, Instruction};
use std::sync::{Arc, Mutex, MutexGuard};

/// What a segment holds, from the NE segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SegmentKind {
    /// Executable code; fetches decode and cache instructions.
    Code,
    /// Initialized data.
    Data,
    /// Zero-initialized data or stack space.
    Stack,
}

/// A decoded instruction plus the byte offset of its immediate field.
///
/// The immediate offset lets the operand reader answer relocation
/// redirection queries (`CS:IP + immediateOffset`) without re-decoding.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    /// The decoder's instruction record. Its `ip16()` is the byte offset of
    /// the instruction within its segment.
    pub instruction: Instruction,
    /// Offset of the first immediate within the instruction bytes, if any.
    pub immediate_offset: Option<u8>,
}

/// One real-mode segment.
#[derive(Debug, Clone)]
pub struct Segment {
    selector: u16,
    kind: SegmentKind,
    bytes: Box<[u8]>,
    /// Decode cache indexed by byte offset; present only for code segments
    /// and only after the first fetch.
    cache: Option<Vec<Option<Decoded>>>,
}

impl Segment {
    fn new(selector: u16, kind: SegmentKind, data: &[u8]) -> Self {
        assert!(
            data.len() <= SEGMENT_SIZE,
            "segment {selector:#06x} larger than 64 KiB"
        );
        let mut bytes = vec![0u8; SEGMENT_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            selector,
            kind,
            bytes: bytes.into_boxed_slice(),
            cache: None,
        }
    }

    /// Selector this segment is mapped under.
    pub fn selector(&self) -> u16 {
        self.selector
    }

    /// Code, data, or stack.
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// The raw segment image. Decode-path reads go through here and see the
    /// on-disk relocation sentinels.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn write(&mut self, offset: u16, data: &[u8]) {
        let mut cursor = offset;
        for b in data {
            self.bytes[cursor as usize] = *b;
            cursor = cursor.wrapping_add(1);
        }
        if self.kind == SegmentKind::Code {
            let end = offset as usize + data.len();
            self.invalidate(offset, data.len());
            if end > SEGMENT_SIZE {
                // The write wrapped; the head of the segment changed too.
                self.invalidate(0, end - SEGMENT_SIZE);
            }
        }
    }

    /// Discard cached instructions overlapping `offset..offset + len`.
    ///
    /// An instruction starting up to `MAX_INSTRUCTION_LEN - 1` bytes before
    /// the write can span into it, so the scan starts that far back.
    fn invalidate(&mut self, offset: u16, len: usize) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        let start = (offset as usize).saturating_sub(MAX_INSTRUCTION_LEN - 1);
        let end = (offset as usize).saturating_add(len).min(SEGMENT_SIZE);
        for slot in start..end {
            let overlaps = cache[slot]
                .map(|d| slot + d.instruction.len() > offset as usize)
                .unwrap_or(false);
            if overlaps || slot >= offset as usize {
                cache[slot] = None;
            }
        }
    }

    fn decode_all(&mut self) {
        let mut cache = vec![None; SEGMENT_SIZE];
        let mut decoder = Decoder::with_ip(16, &self.bytes, 0, DecoderOptions::NONE);
        while decoder.can_decode() {
            let position = decoder.position();
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                continue;
            }
            let offsets = decoder.get_constant_offsets(&instruction);
            cache[position] = Some(Decoded {
                instruction,
                immediate_offset: offsets
                    .has_immediate()
                    .then(|| offsets.immediate_offset() as u8),
            });
        }
        self.cache = Some(cache);
    }

    /// Decode one instruction at `offset`, bypassing and backfilling the
    /// cache. Used when control lands between linear decode boundaries.
    fn decode_one(&mut self, offset: u16) -> ExecResult<Decoded> {
        let mut decoder = Decoder::with_ip(
            16,
            &self.bytes[offset as usize..],
            u64::from(offset),
            DecoderOptions::NONE,
        );
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            let end = (offset as usize + 6).min(SEGMENT_SIZE);
            return Err(Fault::Decode {
                location: FarPtr::new(self.selector, offset),
                bytes: self.bytes[offset as usize..end].to_vec(),
            });
        }
        let offsets = decoder.get_constant_offsets(&instruction);
        let decoded = Decoded {
            instruction,
            immediate_offset: offsets
                .has_immediate()
                .then(|| offsets.immediate_offset() as u8),
        };
        if let Some(cache) = self.cache.as_mut() {
            cache[offset as usize] = Some(decoded);
        }
        Ok(decoded)
    }
}

/// The segment table, relocation index, and named-variable allocator of one
/// guest module.
#[derive(Debug, Default)]
pub struct SegmentedMemory {
    segments: HashMap<u16, Segment>,
    relocations: HashMap<(u16, u16), RelocationTarget>,
    variables: HashMap<String, FarPtr>,
    default_data_segment: Option<u16>,
    stack_segment: Option<u16>,
    variable_segment: Option<u16>,
    variable_cursor: u16,
}

impl SegmentedMemory {
    /// Empty memory image; the loader populates it with `add_segment`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` under `selector` and index its relocation records.
    ///
    /// The image is padded to the full 64 KiB so offset arithmetic can wrap.
    /// The first data segment added becomes the module's default data
    /// segment; the first stack segment becomes its stack segment.
    ///
    /// # Panics
    ///
    /// If the selector is already mapped or the image exceeds 64 KiB.
    pub fn add_segment(
        &mut self,
        selector: u16,
        kind: SegmentKind,
        bytes: &[u8],
        relocations: Vec<RelocationRecord>,
    ) {
        let segment = Segment::new(selector, kind, bytes);
        assert!(
            self.segments.insert(selector, segment).is_none(),
            "segment {selector:#06x} already mapped"
        );
        for record in relocations {
            self.relocations
                .insert((selector, record.offset), record.target);
        }
        match kind {
            SegmentKind::Data if self.default_data_segment.is_none() => {
                self.default_data_segment = Some(selector);
            }
            SegmentKind::Stack if self.stack_segment.is_none() => {
                self.stack_segment = Some(selector);
            }
            _ => (),
        }
    }

    /// Map a zero-initialized segment of `size` bytes under `selector` and
    /// make it the target of [`SegmentedMemory::allocate_variable`].
    pub fn add_variable_segment(&mut self, selector: u16, size: u16) {
        self.add_segment(selector, SegmentKind::Data, &vec![0u8; size as usize], vec![]);
        self.variable_segment = Some(selector);
        self.variable_cursor = 0;
    }

    /// Bump-allocate `size` bytes of named storage and return its far
    /// pointer. Repeated calls with the same name return the original
    /// allocation.
    ///
    /// A variable segment is created on demand at the next free selector if
    /// the loader never mapped one.
    ///
    /// # Panics
    ///
    /// If the variable segment is exhausted.
    pub fn allocate_variable(&mut self, name: &str, size: u16) -> FarPtr {
        if let Some(existing) = self.variables.get(name) {
            return *existing;
        }
        let selector = match self.variable_segment {
            Some(selector) => selector,
            None => {
                let selector = self.next_free_selector();
                self.add_variable_segment(selector, u16::MAX);
                selector
            }
        };
        let offset = self.variable_cursor;
        let aligned = size.checked_add(size & 1).expect("variable segment exhausted");
        self.variable_cursor = offset
            .checked_add(aligned)
            .expect("variable segment exhausted");
        let ptr = FarPtr::new(selector, offset);
        self.variables.insert(name.to_owned(), ptr);
        ptr
    }

    fn next_free_selector(&self) -> u16 {
        (1..u16::MAX)
            .find(|selector| !self.segments.contains_key(selector))
            .expect("selector space exhausted")
    }

    /// The module's default data segment, if a data segment was mapped.
    pub fn default_data_segment(&self) -> Option<u16> {
        self.default_data_segment
    }

    /// The module's stack segment, if a stack segment was mapped.
    pub fn stack_segment(&self) -> Option<u16> {
        self.stack_segment
    }

    /// Look up a mapped segment.
    pub fn segment(&self, selector: u16) -> ExecResult<&Segment> {
        self.segments
            .get(&selector)
            .ok_or(Fault::SegmentNotMapped(selector))
    }

    fn segment_mut(&mut self, selector: u16) -> ExecResult<&mut Segment> {
        self.segments
            .get_mut(&selector)
            .ok_or(Fault::SegmentNotMapped(selector))
    }

    /// Read one byte.
    pub fn get_byte(&self, selector: u16, offset: u16) -> ExecResult<u8> {
        Ok(self.segment(selector)?.bytes[offset as usize])
    }

    /// Write one byte, discarding any overlapping decoded instructions.
    pub fn set_byte(&mut self, selector: u16, offset: u16, value: u8) -> ExecResult<()> {
        self.segment_mut(selector)?.write(offset, &[value]);
        Ok(())
    }

    /// Read a little-endian word, wrapping at the segment end.
    pub fn get_word(&self, selector: u16, offset: u16) -> ExecResult<u16> {
        let segment = self.segment(selector)?;
        let lo = segment.bytes[offset as usize];
        let hi = segment.bytes[offset.wrapping_add(1) as usize];
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Write a little-endian word, wrapping at the segment end.
    pub fn set_word(&mut self, selector: u16, offset: u16, value: u16) -> ExecResult<()> {
        self.segment_mut(selector)?.write(offset, &value.to_le_bytes());
        Ok(())
    }

    /// Read a little-endian dword, wrapping at the segment end.
    pub fn get_dword(&self, selector: u16, offset: u16) -> ExecResult<u32> {
        let segment = self.segment(selector)?;
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = segment.bytes[offset.wrapping_add(i as u16) as usize];
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Write a little-endian dword, wrapping at the segment end.
    pub fn set_dword(&mut self, selector: u16, offset: u16, value: u32) -> ExecResult<()> {
        self.segment_mut(selector)?.write(offset, &value.to_le_bytes());
        Ok(())
    }

    /// Bulk write, wrapping at the segment end.
    pub fn write_bytes(&mut self, selector: u16, offset: u16, data: &[u8]) -> ExecResult<()> {
        self.segment_mut(selector)?.write(offset, data);
        Ok(())
    }

    /// Bulk read, wrapping at the segment end.
    pub fn read_bytes(&self, selector: u16, offset: u16, len: usize) -> ExecResult<Vec<u8>> {
        let segment = self.segment(selector)?;
        Ok((0..len)
            .map(|i| segment.bytes[offset.wrapping_add(i as u16) as usize])
            .collect())
    }

    /// The relocation record registered at `selector:offset`, if any.
    pub fn relocation_at(&self, selector: u16, offset: u16) -> Option<RelocationTarget> {
        self.relocations.get(&(selector, offset)).copied()
    }

    /// The decoded instruction starting at `selector:offset`.
    ///
    /// The first fetch from a code segment decodes the whole image into the
    /// per-segment cache; later fetches are lookups. An offset between
    /// linear decode boundaries (a computed jump target) decodes on demand
    /// and backfills.
    pub fn instruction_at(&mut self, selector: u16, offset: u16) -> ExecResult<Decoded> {
        let segment = self.segment_mut(selector)?;
        if segment.cache.is_none() {
            segment.decode_all();
        }
        let cached = segment
            .cache
            .as_ref()
            .and_then(|cache| cache[offset as usize]);
        match cached {
            Some(decoded) => Ok(decoded),
            None => segment.decode_one(offset),
        }
    }
}

/// Shared handle to one module's memory image.
///
/// Every execution unit of a module and every host callback sees the same
/// image through clones of this handle. Interior mutability is scoped to the
/// call site: the lock is taken per access and never held across a host
/// callback, so callbacks are free to re-enter guest code on the same image.
#[derive(Debug, Clone, Default)]
pub struct SharedMemory {
    inner: Arc<Mutex<SegmentedMemory>>,
}

impl SharedMemory {
    /// Wrap a populated memory image for sharing.
    pub fn new(memory: SegmentedMemory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(memory)),
        }
    }

    /// Lock the image for a compound operation.
    ///
    /// Do not hold the guard across a host callback or a nested guest entry.
    pub fn lock(&self) -> MutexGuard<'_, SegmentedMemory> {
        self.inner.lock().expect("poisoned")
    }

    /// Read one byte.
    pub fn byte(&self, selector: u16, offset: u16) -> ExecResult<u8> {
        self.lock().get_byte(selector, offset)
    }

    /// Write one byte.
    pub fn set_byte(&self, selector: u16, offset: u16, value: u8) -> ExecResult<()> {
        self.lock().set_byte(selector, offset, value)
    }

    /// Read a word.
    pub fn word(&self, selector: u16, offset: u16) -> ExecResult<u16> {
        self.lock().get_word(selector, offset)
    }

    /// Write a word.
    pub fn set_word(&self, selector: u16, offset: u16, value: u16) -> ExecResult<()> {
        self.lock().set_word(selector, offset, value)
    }

    /// Read a dword.
    pub fn dword(&self, selector: u16, offset: u16) -> ExecResult<u32> {
        self.lock().get_dword(selector, offset)
    }

    /// Write a dword.
    pub fn set_dword(&self, selector: u16, offset: u16, value: u32) -> ExecResult<()> {
        self.lock().set_dword(selector, offset, value)
    }

    /// Bulk write.
    pub fn write_bytes(&self, selector: u16, offset: u16, data: &[u8]) -> ExecResult<()> {
        self.lock().write_bytes(selector, offset, data)
    }

    /// Bulk read.
    pub fn read_bytes(&self, selector: u16, offset: u16, len: usize) -> ExecResult<Vec<u8>> {
        self.lock().read_bytes(selector, offset, len)
    }

    /// The relocation record at `selector:offset`, if any.
    pub fn relocation_at(&self, selector: u16, offset: u16) -> Option<RelocationTarget> {
        self.lock().relocation_at(selector, offset)
    }

    /// The decoded instruction starting at `selector:offset`.
    pub fn instruction_at(&self, selector: u16, offset: u16) -> ExecResult<Decoded> {
        self.lock().instruction_at(selector, offset)
    }
}

impl From<SegmentedMemory> for SharedMemory {
    fn from(memory: SegmentedMemory) -> Self {
        Self::new(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(bytes: &[u8]) -> SegmentedMemory {
        let mut memory = SegmentedMemory::new();
        memory.add_segment(1, SegmentKind::Code, bytes, vec![]);
        memory
    }

    #[test]
    fn word_access_wraps_within_the_segment() {
        let mut memory = code(&[]);
        memory.set_word(1, 0xFFFF, 0xABCD).unwrap();
        assert_eq!(memory.get_byte(1, 0xFFFF).unwrap(), 0xCD);
        assert_eq!(memory.get_byte(1, 0x0000).unwrap(), 0xAB);
        assert_eq!(memory.get_word(1, 0xFFFF).unwrap(), 0xABCD);
    }

    #[test]
    fn unmapped_selector_faults() {
        let memory = code(&[]);
        assert!(matches!(
            memory.get_byte(7, 0),
            Err(Fault::SegmentNotMapped(7))
        ));
    }

    #[test]
    fn linear_decode_caches_every_boundary() {
        // mov ax, 0x1234; push ax; pop ax; ret
        let mut memory = code(&[0xB8, 0x34, 0x12, 0x50, 0x58, 0xC3]);
        let first = memory.instruction_at(1, 0).unwrap();
        assert_eq!(first.instruction.len(), 3);
        let push = memory.instruction_at(1, 3).unwrap();
        assert_eq!(push.instruction.mnemonic(), iced_x86::Mnemonic::Push);
        let ret = memory.instruction_at(1, 5).unwrap();
        assert_eq!(ret.instruction.mnemonic(), iced_x86::Mnemonic::Ret);
    }

    #[test]
    fn code_write_invalidates_overlapping_entries() {
        // mov ax, 0x1234; nop
        let mut memory = code(&[0xB8, 0x34, 0x12, 0x90]);
        assert_eq!(memory.instruction_at(1, 0).unwrap().instruction.len(), 3);
        // Rewrite the immediate: the cached mov must be re-decoded, the nop
        // after it must survive.
        memory.set_word(1, 1, 0x5678).unwrap();
        let reloaded = memory.instruction_at(1, 0).unwrap();
        assert_eq!(reloaded.instruction.immediate16(), 0x5678);
        assert_eq!(
            memory.instruction_at(1, 3).unwrap().instruction.mnemonic(),
            iced_x86::Mnemonic::Nop
        );
    }

    #[test]
    fn mid_instruction_fetch_decodes_on_demand() {
        // mov ax, 0x9090: offsets 1..3 hold nop bytes a jump could target.
        let mut memory = code(&[0xB8, 0x90, 0x90, 0xC3]);
        memory.instruction_at(1, 0).unwrap();
        let landed = memory.instruction_at(1, 1).unwrap();
        assert_eq!(landed.instruction.mnemonic(), iced_x86::Mnemonic::Nop);
    }

    #[test]
    fn variable_allocation_is_deduplicated_and_aligned() {
        let mut memory = SegmentedMemory::new();
        let a = memory.allocate_variable("CHANNEL", 3);
        let b = memory.allocate_variable("STATUS", 2);
        assert_eq!(memory.allocate_variable("CHANNEL", 3), a);
        assert_eq!(a.segment, b.segment);
        assert_eq!(b.offset, 4, "3-byte allocation rounds up to a word");
    }

    #[test]
    fn relocation_index_is_queryable() {
        let mut memory = SegmentedMemory::new();
        memory.add_segment(
            2,
            SegmentKind::Code,
            &[0x9A, 0xFF, 0xFF, 0xFF, 0xFF],
            vec![RelocationRecord::new(
                1,
                RelocationTarget::ImportOrdinal { module: 3, ordinal: 42 },
            )],
        );
        let target = memory.relocation_at(2, 1).unwrap();
        assert_eq!(target.word(), 42);
        assert_eq!(target.selector(), 3);
        assert_eq!(memory.relocation_at(2, 2), None);
    }
}
