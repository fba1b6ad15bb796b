//! Trace entries and the pointer-bump fast path used by probes to append them.
//!
//! # Entry Format
//!
//! A trace is a flat sequence of fixed-width, 24-byte records stored in native endianness. Every
//! record starts with a tag identifying its kind, followed by a flag byte and two 64-bit
//! parameters whose meaning depends on the kind.
//!
//! ```text
//!  0               4       5       6               8                              16                              24
//!  +---------------+-------+-------+---------------+-------------------------------+-------------------------------+
//!  |      kind     | flags |  pad  |   reserved    |            param1             |            param2             |
//!  +---------------+-------+-------+---------------+-------------------------------+-------------------------------+
//! ```
//!
//! | Kind             | Tag | Flags                                   | param1       | param2            |
//! |------------------|-----|-----------------------------------------|--------------|-------------------|
//! | `MemoryRead`     | 1   | 0                                       | instruction  | effective address |
//! | `MemoryWrite`    | 2   | 0                                       | instruction  | effective address |
//! | `AllocSize`      | 3   | 0                                       | size         | 0                 |
//! | `AllocReturn`    | 4   | 0                                       | 0            | returned address  |
//! | `FreeAddress`    | 5   | 0                                       | 0            | freed address     |
//! | `Branch`         | 6   | bit 0: taken, bits 1-2: [`BranchKind`]  | source       | target            |
//! | `StackPointer`   | 7   | 0: minimum, 1: maximum                  | value        | 0                 |
//! | `TestcaseMarker` | 8   | 0: start, 1: end                        | testcase id  | 0                 |
//!
//! # Fast Path
//!
//! Probes never look up the trace buffer themselves. The address of the next free entry and the
//! end of the buffer are kept in two scratch registers of the traced thread and are passed
//! directly to [`insert`] and [`check_buffer_full`]. A null `next` pointer means the thread is not
//! traced and every probe becomes a no-op.

use bitfield::bitfield;

/// Number of free entries that must remain in the buffer after a record is appended. When fewer
/// remain, the buffer is flushed before the next record can be written.
pub const BUFFER_FULL_MARGIN: usize = 2;

// -----------------------------------------------------------------------------------------------
// Entry kinds
// -----------------------------------------------------------------------------------------------

/// The different kinds of trace entry.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u32)]
pub enum EntryKind {
    MemoryRead = 1,
    MemoryWrite = 2,
    AllocSize = 3,
    AllocReturn = 4,
    FreeAddress = 5,
    Branch = 6,
    StackPointer = 7,
    TestcaseMarker = 8,
}

impl EntryKind {
    /// Converts a raw tag into an entry kind.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::MemoryRead),
            2 => Some(Self::MemoryWrite),
            3 => Some(Self::AllocSize),
            4 => Some(Self::AllocReturn),
            5 => Some(Self::FreeAddress),
            6 => Some(Self::Branch),
            7 => Some(Self::StackPointer),
            8 => Some(Self::TestcaseMarker),
            _ => None,
        }
    }
}

/// The type of control transfer stored in a [`EntryKind::Branch`] entry.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum BranchKind {
    Jump = 1,
    Call = 2,
    Return = 3,
}

impl BranchKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Jump),
            2 => Some(Self::Call),
            3 => Some(Self::Return),
            _ => None,
        }
    }
}

bitfield! {
    /// Flag byte of a branch entry.
    ///
    ///  - **Taken**: the control transfer happened
    ///  - **Kind**: raw [`BranchKind`] value
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct BranchFlags(u8);
    impl Debug;
    pub get_taken, set_taken: 0;
    pub get_kind, set_kind: 2, 1;
}

impl BranchFlags {
    /// Builds the flag byte of a branch entry.
    pub fn with(kind: BranchKind, taken: bool) -> Self {
        let mut flags = BranchFlags(0);
        flags.set_taken(taken);
        flags.set_kind(kind as u8);
        flags
    }

    /// Returns the control transfer type, if the raw bits are valid.
    pub fn kind(&self) -> Option<BranchKind> {
        BranchKind::from_bits(self.get_kind())
    }
}

/// Flag value of a [`EntryKind::StackPointer`] entry.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum StackPointerKind {
    Min = 0,
    Max = 1,
}

/// Flag value of a [`EntryKind::TestcaseMarker`] entry.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum MarkerKind {
    Start = 0,
    End = 1,
}

// -----------------------------------------------------------------------------------------------
// Trace entry
// -----------------------------------------------------------------------------------------------

/// A single trace record, laid out exactly as it is written to disk.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
#[repr(C)]
pub struct TraceEntry {
    /// Raw [`EntryKind`] tag.
    pub kind: u32,
    /// Kind-specific flags.
    pub flags: u8,
    _pad: u8,
    _reserved: u16,
    /// First parameter.
    pub param1: u64,
    /// Second parameter.
    pub param2: u64,
}

impl TraceEntry {
    /// Size of an entry in bytes.
    pub const SIZE: usize = std::mem::size_of::<TraceEntry>();

    /// Creates a raw entry.
    pub fn new(kind: EntryKind, flags: u8, param1: u64, param2: u64) -> Self {
        Self {
            kind: kind as u32,
            flags,
            _pad: 0,
            _reserved: 0,
            param1,
            param2,
        }
    }

    pub fn memory_read(ip: u64, ea: u64) -> Self {
        Self::new(EntryKind::MemoryRead, 0, ip, ea)
    }

    pub fn memory_write(ip: u64, ea: u64) -> Self {
        Self::new(EntryKind::MemoryWrite, 0, ip, ea)
    }

    /// A jump or call from `src` to `dst`.
    pub fn branch(src: u64, dst: u64, taken: bool, is_call: bool) -> Self {
        let kind = if is_call {
            BranchKind::Call
        } else {
            BranchKind::Jump
        };
        Self::new(
            EntryKind::Branch,
            BranchFlags::with(kind, taken).0,
            src,
            dst,
        )
    }

    /// A return from `src` to `dst`. Returns are always taken.
    pub fn ret(src: u64, dst: u64) -> Self {
        Self::new(
            EntryKind::Branch,
            BranchFlags::with(BranchKind::Return, true).0,
            src,
            dst,
        )
    }

    pub fn alloc_size(size: u64) -> Self {
        Self::new(EntryKind::AllocSize, 0, size, 0)
    }

    pub fn alloc_return(addr: u64) -> Self {
        Self::new(EntryKind::AllocReturn, 0, 0, addr)
    }

    pub fn free_address(addr: u64) -> Self {
        Self::new(EntryKind::FreeAddress, 0, 0, addr)
    }

    pub fn stack_pointer(kind: StackPointerKind, value: u64) -> Self {
        Self::new(EntryKind::StackPointer, kind as u8, value, 0)
    }

    /// Testcase ids are the target's `int`, stored sign-extended.
    pub fn testcase_start(id: i32) -> Self {
        Self::new(EntryKind::TestcaseMarker, MarkerKind::Start as u8, id as i64 as u64, 0)
    }

    pub fn testcase_end(id: i32) -> Self {
        Self::new(EntryKind::TestcaseMarker, MarkerKind::End as u8, id as i64 as u64, 0)
    }

    /// Returns the kind of the entry, if its tag is valid.
    pub fn entry_kind(&self) -> Option<EntryKind> {
        EntryKind::from_tag(self.kind)
    }

    /// Returns the raw bytes of the entry.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.kind.to_ne_bytes());
        bytes[4] = self.flags;
        bytes[5] = self._pad;
        bytes[6..8].copy_from_slice(&self._reserved.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.param1.to_ne_bytes());
        bytes[16..24].copy_from_slice(&self.param2.to_ne_bytes());
        bytes
    }

    /// Reinterprets raw bytes as an entry. The tag is not validated.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_ne_bytes([bytes[o], bytes[o + 1]]);
        let u32_at = |o: usize| {
            let mut b = [0; 4];
            b.copy_from_slice(&bytes[o..o + 4]);
            u32::from_ne_bytes(b)
        };
        let u64_at = |o: usize| {
            let mut b = [0; 8];
            b.copy_from_slice(&bytes[o..o + 8]);
            u64::from_ne_bytes(b)
        };
        Self {
            kind: u32_at(0),
            flags: bytes[4],
            _pad: bytes[5],
            _reserved: u16_at(6),
            param1: u64_at(8),
            param2: u64_at(16),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Fast path
// -----------------------------------------------------------------------------------------------

/// Writes `entry` at `next` and returns the address of the following slot.
///
/// # Safety
///
/// `next` must point into a live trace buffer with at least one free slot, which
/// [`check_buffer_full`] guarantees when probes are sequenced as an entry write followed by a
/// full check.
#[inline(always)]
pub unsafe fn insert(next: *mut TraceEntry, entry: TraceEntry) -> *mut TraceEntry {
    next.write(entry);
    next.add(1)
}

/// Returns `true` when `next` is a live buffer pointer and fewer than [`BUFFER_FULL_MARGIN`]
/// entries remain before `end`.
#[inline(always)]
pub fn check_buffer_full(next: *const TraceEntry, end: *const TraceEntry) -> bool {
    !next.is_null() && next >= end.wrapping_sub(BUFFER_FULL_MARGIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_entry_layout() {
        assert_eq!(TraceEntry::SIZE, 24);
        assert_eq!(std::mem::align_of::<TraceEntry>(), 8);
        let e = TraceEntry::memory_read(0x401000, 0x7fff_0000);
        let b = e.to_bytes();
        assert_eq!(&b[0..4], &1u32.to_ne_bytes());
        assert_eq!(&b[4..8], &[0, 0, 0, 0]);
        assert_eq!(&b[8..16], &0x401000u64.to_ne_bytes());
        assert_eq!(&b[16..24], &0x7fff_0000u64.to_ne_bytes());
        assert_eq!(TraceEntry::from_bytes(&b), e);
    }

    #[test]
    fn trace_branch_flags() {
        let e = TraceEntry::branch(0x10, 0x20, false, false);
        assert_eq!(e.flags, 0b010);
        let e = TraceEntry::branch(0x10, 0x20, true, true);
        assert_eq!(e.flags, 0b101);
        let e = TraceEntry::ret(0x10, 0x20);
        assert_eq!(e.flags, 0b111);
        let flags = BranchFlags(e.flags);
        assert!(flags.get_taken());
        assert_eq!(flags.kind(), Some(BranchKind::Return));
        assert_eq!(BranchFlags(0).kind(), None);
    }

    #[test]
    fn trace_markers() {
        assert_eq!(TraceEntry::testcase_start(7).flags, 0);
        assert_eq!(TraceEntry::testcase_end(7).flags, 1);
        assert_eq!(
            TraceEntry::stack_pointer(StackPointerKind::Max, 0x1000).flags,
            1
        );
        assert_eq!(
            TraceEntry::testcase_end(7).entry_kind(),
            Some(EntryKind::TestcaseMarker)
        );
        assert_eq!(EntryKind::from_tag(0), None);
        assert_eq!(EntryKind::from_tag(9), None);
    }

    #[test]
    fn trace_insert_and_full_check() {
        let mut buf = [TraceEntry::default(); 6];
        let begin = buf.as_mut_ptr();
        let end = begin.wrapping_add(buf.len());
        let mut next = begin;
        for i in 0..3 {
            next = unsafe { insert(next, TraceEntry::alloc_size(i)) };
            assert!(!check_buffer_full(next, end));
        }
        next = unsafe { insert(next, TraceEntry::alloc_size(3)) };
        // Two slots left.
        assert!(check_buffer_full(next, end));
        assert_eq!(buf[3].param1, 3);
        assert!(!check_buffer_full(std::ptr::null(), end));
    }
}
