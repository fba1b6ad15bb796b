//! Decodes trace files written by the tracer.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use rhexdump as rh;

use crate::error::*;
use crate::trace::*;

/// Typed view of a [`TraceEntry`].
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Event {
    MemoryRead { ip: u64, ea: u64 },
    MemoryWrite { ip: u64, ea: u64 },
    AllocSize { size: u64 },
    AllocReturn { addr: u64 },
    Free { addr: u64 },
    Branch { src: u64, dst: u64, taken: bool, kind: BranchKind },
    StackPointer { kind: StackPointerKind, value: u64 },
    TestcaseStart { id: i32 },
    TestcaseEnd { id: i32 },
}

impl TraceEntry {
    /// Decodes the entry. Returns `None` if the tag or the flags are invalid.
    pub fn event(&self) -> Option<Event> {
        let (p1, p2) = (self.param1, self.param2);
        let event = match self.entry_kind()? {
            EntryKind::MemoryRead => Event::MemoryRead { ip: p1, ea: p2 },
            EntryKind::MemoryWrite => Event::MemoryWrite { ip: p1, ea: p2 },
            EntryKind::AllocSize => Event::AllocSize { size: p1 },
            EntryKind::AllocReturn => Event::AllocReturn { addr: p2 },
            EntryKind::FreeAddress => Event::Free { addr: p2 },
            EntryKind::Branch => {
                let flags = BranchFlags(self.flags);
                Event::Branch {
                    src: p1,
                    dst: p2,
                    taken: flags.get_taken(),
                    kind: flags.kind()?,
                }
            }
            EntryKind::StackPointer => Event::StackPointer {
                kind: match self.flags {
                    0 => StackPointerKind::Min,
                    1 => StackPointerKind::Max,
                    _ => return None,
                },
                value: p1,
            },
            EntryKind::TestcaseMarker => match self.flags {
                0 => Event::TestcaseStart { id: p1 as i32 },
                1 => Event::TestcaseEnd { id: p1 as i32 },
                _ => return None,
            },
        };
        Some(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::MemoryRead { ip, ea } => write!(f, "MemRead  {:#x} -> {:#x}", ip, ea),
            Event::MemoryWrite { ip, ea } => write!(f, "MemWrite {:#x} -> {:#x}", ip, ea),
            Event::AllocSize { size } => write!(f, "AllocSize {:#x}", size),
            Event::AllocReturn { addr } => write!(f, "AllocRet  {:#x}", addr),
            Event::Free { addr } => write!(f, "Free      {:#x}", addr),
            Event::Branch {
                src,
                dst,
                taken,
                kind,
            } => write!(
                f,
                "{:?} {:#x} -> {:#x}{}",
                kind,
                src,
                dst,
                if *taken { "" } else { " (not taken)" }
            ),
            Event::StackPointer { kind, value } => write!(f, "StackPointer {:?} {:#x}", kind, value),
            Event::TestcaseStart { id } => write!(f, "TestcaseStart {}", id),
            Event::TestcaseEnd { id } => write!(f, "TestcaseEnd {}", id),
        }
    }
}

/// Iterates over the entries of a trace.
pub struct TraceReader<R> {
    inner: R,
    offset: u64,
    failed: bool,
}

impl TraceReader<BufReader<File>> {
    /// Opens the trace file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> TraceReader<R> {
    /// Reads entries from an arbitrary reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            failed: false,
        }
    }

    /// Reads all remaining entries and decodes them.
    pub fn events(self) -> Result<Vec<Event>> {
        self.map(|e| e.map(|(_, ev)| ev)).collect()
    }

    /// Reads the next record. Returns `Ok(None)` at the end of the trace.
    fn read_entry(&mut self) -> Result<Option<(TraceEntry, Event)>> {
        let mut bytes = [0; TraceEntry::SIZE];
        let mut read = 0;
        while read < bytes.len() {
            match self.inner.read(&mut bytes[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e)?,
            }
        }
        match read {
            0 => return Ok(None),
            n if n < TraceEntry::SIZE => return Err(TraceError::Truncated(self.offset))?,
            _ => {}
        }
        let entry = TraceEntry::from_bytes(&bytes);
        let event = entry.event().ok_or_else(|| TraceError::InvalidEntry {
            offset: self.offset,
            dump: rh::hexdump_offset(&bytes, self.offset as u32),
        })?;
        self.offset += TraceEntry::SIZE as u64;
        Ok(Some((entry, event)))
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<(TraceEntry, Event)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(entries: &[TraceEntry]) -> Vec<u8> {
        entries.iter().flat_map(|e| e.to_bytes()).collect()
    }

    #[test]
    fn reader_decodes_entries() {
        let entries = [
            TraceEntry::testcase_start(4),
            TraceEntry::memory_write(0x1000, 0x2000),
            TraceEntry::branch(0x1004, 0x1010, false, false),
            TraceEntry::ret(0x1010, 0x1008),
            TraceEntry::stack_pointer(StackPointerKind::Min, 0x7000),
            TraceEntry::testcase_end(4),
        ];
        let data = bytes(&entries);
        let events = TraceReader::new(data.as_slice()).events().unwrap();
        assert_eq!(
            events,
            vec![
                Event::TestcaseStart { id: 4 },
                Event::MemoryWrite {
                    ip: 0x1000,
                    ea: 0x2000
                },
                Event::Branch {
                    src: 0x1004,
                    dst: 0x1010,
                    taken: false,
                    kind: BranchKind::Jump
                },
                Event::Branch {
                    src: 0x1010,
                    dst: 0x1008,
                    taken: true,
                    kind: BranchKind::Return
                },
                Event::StackPointer {
                    kind: StackPointerKind::Min,
                    value: 0x7000
                },
                Event::TestcaseEnd { id: 4 },
            ]
        );
    }

    #[test]
    fn reader_invalid_and_truncated() {
        let mut data = bytes(&[TraceEntry::alloc_size(1)]);
        data.extend_from_slice(&[0xff; TraceEntry::SIZE]);
        let mut reader = TraceReader::new(data.as_slice());
        assert!(reader.next().unwrap().is_ok());
        match reader.next() {
            Some(Err(Error::Trace(TraceError::InvalidEntry { offset, dump }))) => {
                assert_eq!(offset, TraceEntry::SIZE as u64);
                assert!(!dump.is_empty());
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert!(reader.next().is_none());

        let data = bytes(&[TraceEntry::alloc_size(1)]);
        let reader = TraceReader::new(&data[..TraceEntry::SIZE - 4]);
        assert_eq!(
            reader.events(),
            Err(Error::Trace(TraceError::Truncated(0)))
        );
    }
}
