//! Per-thread trace buffer and the slow path that flushes it to trace files.
//!
//! # Output Files
//!
//! Entries are appended by probes to a [`TraceBuffer`] and only reach the disk when the buffer is
//! full, when a testcase starts or ends, or when the traced thread exits. The file they end up in
//! depends on the state of the [`TraceWriter`]:
//!
//! ```text
//!                 testcase_start(n)                 testcase_end()
//!   +--------+  -------------------->  +-------------+  ------------->  +------+
//!   | Prefix |                         | Testcase(n) |                  | Idle |
//!   +--------+                         +-------------+  <-------------  +------+
//!  <prefix>_prefix.trace            <prefix>_t<n>.trace  testcase_start   (discarded)
//! ```
//!
//! A `testcase_end()` received in the `Prefix` state flushes and closes the prefix trace.
//!
//! Each testcase file starts with a start marker and ends with an end marker carrying the same
//! testcase id. When a testcase file is complete, `t\t<path>` is printed on the standard output so
//! that the driver feeding testcases to the target can pick it up.

use std::alloc;
use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::ptr::NonNull;

use crate::config::*;
use crate::error::*;
use crate::host::*;
use crate::trace::*;

// -----------------------------------------------------------------------------------------------
// Trace buffer
// -----------------------------------------------------------------------------------------------

/// A contiguous, zero-initialized allocation of trace entries.
#[derive(Debug)]
pub struct TraceBuffer {
    ptr: NonNull<TraceEntry>,
    len: usize,
}

impl TraceBuffer {
    /// Allocates a buffer holding `len` entries.
    pub fn new(len: usize) -> Result<Self> {
        if len < BUFFER_FULL_MARGIN + 2 {
            return Err(ConfigError::BufferTooSmall(len))?;
        }
        let layout = alloc::Layout::array::<TraceEntry>(len)?;
        // SAFETY: the layout has a non-zero size since `len` was checked above.
        let ptr = unsafe { alloc::alloc_zeroed(layout) } as *mut TraceEntry;
        let ptr = NonNull::new(ptr).ok_or(TraceError::OutOfMemory)?;
        Ok(Self { ptr, len })
    }

    /// Address of the first entry.
    pub fn begin(&self) -> *mut TraceEntry {
        self.ptr.as_ptr()
    }

    /// Address one past the last entry.
    pub fn end(&self) -> *mut TraceEntry {
        self.ptr.as_ptr().wrapping_add(self.len)
    }

    /// Number of entries the buffer can hold.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no entry, which never happens for a valid buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the index of the slot `ptr` points to. `ptr` may be equal to [`Self::end`].
    pub fn index_of(&self, ptr: *const TraceEntry) -> Result<usize> {
        let begin = self.begin() as usize;
        let addr = ptr as usize;
        if addr < begin || addr > self.end() as usize || (addr - begin) % TraceEntry::SIZE != 0 {
            return Err(TraceError::PointerOutOfBounds(addr as u64))?;
        }
        Ok((addr - begin) / TraceEntry::SIZE)
    }

    /// Returns the entries stored in `[begin, last)`.
    pub fn entries(&self, last: *const TraceEntry) -> Result<&[TraceEntry]> {
        let count = self.index_of(last)?;
        // SAFETY: `count` entries starting at `begin` are inside the allocation, which was
        // zero-initialized.
        Ok(unsafe { std::slice::from_raw_parts(self.begin(), count) })
    }

    /// Returns the raw bytes of the entries stored in `[begin, last)`.
    pub fn as_bytes(&self, last: *const TraceEntry) -> Result<&[u8]> {
        let entries = self.entries(last)?;
        // SAFETY: `TraceEntry` is `repr(C)` with explicit padding fields, so every byte of the
        // slice is initialized.
        Ok(unsafe {
            std::slice::from_raw_parts(
                entries.as_ptr() as *const u8,
                entries.len() * TraceEntry::SIZE,
            )
        })
    }
}

impl Drop for TraceBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = alloc::Layout::array::<TraceEntry>(self.len) {
            // SAFETY: the pointer was allocated with the same layout in `TraceBuffer::new`.
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, layout) };
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Trace writer
// -----------------------------------------------------------------------------------------------

/// Where flushed entries currently go.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Output {
    /// Before the first testcase.
    Prefix,
    /// Inside the testcase with the given id.
    Testcase(i32),
    /// Between two testcases. Flushed entries are discarded.
    Idle,
}

thread_local!(
    /// The writer of the traced thread. Only the main thread ever installs one.
    static WRITER: RefCell<Option<TraceWriter>> = RefCell::new(None);
);

/// Owner of the traced thread's buffer and output file.
#[derive(Debug)]
pub struct TraceWriter {
    /// Output path prefix.
    prefix: String,
    /// Entries waiting to be flushed.
    buffer: TraceBuffer,
    /// Current output state.
    output: Output,
    /// Currently opened file and its path.
    file: Option<(File, PathBuf)>,
    /// Prints completed testcase files on stdout if `true`.
    notify: bool,
}

impl TraceWriter {
    /// Creates a writer and opens the prefix trace if it is enabled.
    pub fn new(config: &Config) -> Result<Self> {
        let mut writer = Self {
            prefix: config.output_prefix.clone(),
            buffer: TraceBuffer::new(config.buffer_entries)?,
            output: Output::Idle,
            file: None,
            notify: config.testcase_notifications,
        };
        if config.prefix_trace {
            let path = PathBuf::from(format!("{}_prefix.trace", writer.prefix));
            writer.file = Some((File::create(&path)?, path));
            writer.output = Output::Prefix;
        }
        Ok(writer)
    }

    /// Returns the path of the trace file for testcase `id`.
    pub fn testcase_path(&self, id: i32) -> PathBuf {
        PathBuf::from(format!("{}_t{}.trace", self.prefix, id))
    }

    pub fn begin(&self) -> *mut TraceEntry {
        self.buffer.begin()
    }

    pub fn end(&self) -> *mut TraceEntry {
        self.buffer.end()
    }

    pub fn output(&self) -> Output {
        self.output
    }

    /// Path of the file entries are currently flushed to.
    pub fn current_path(&self) -> Option<&PathBuf> {
        self.file.as_ref().map(|(_, p)| p)
    }

    /// Writes the entries in `[begin, last)` to the current output and returns `begin`. Entries
    /// are dropped if there is no output.
    pub fn write_buffer_to_file(&mut self, last: *mut TraceEntry) -> Result<*mut TraceEntry> {
        let bytes = self.buffer.as_bytes(last)?;
        if let Some((file, _)) = self.file.as_mut() {
            file.write_all(bytes)?;
        } else if !bytes.is_empty() {
            tracing::debug!("discarding {} entries outside of a testcase", bytes.len() / TraceEntry::SIZE);
        }
        Ok(self.buffer.begin())
    }

    /// Flushes the buffer if it is full. Returns the updated `next` pointer.
    pub fn flush_if_full(
        &mut self,
        next: *mut TraceEntry,
        end: *mut TraceEntry,
        tid: ThreadId,
    ) -> Result<*mut TraceEntry> {
        if tid != MAIN_THREAD || next.is_null() || !check_buffer_full(next, end) {
            return Ok(next);
        }
        self.write_buffer_to_file(next)
    }

    /// Starts testcase `id`: the pending entries go to the previous output, which is closed, and a
    /// new trace file starting with a start marker is opened. Returns the updated `next` pointer.
    pub fn testcase_start(&mut self, id: i32, next: *mut TraceEntry) -> Result<*mut TraceEntry> {
        let next = if let Output::Testcase(current) = self.output {
            tracing::warn!(
                "Testcase {} started while testcase {} is still running, ending it",
                id,
                current
            );
            self.testcase_end(next)?
        } else {
            self.write_buffer_to_file(next)?
        };
        self.close();
        let path = self.testcase_path(id);
        self.file = Some((File::create(&path)?, path));
        self.output = Output::Testcase(id);
        // SAFETY: `next` is `begin` and the buffer has room for more than one entry.
        Ok(unsafe { insert(next, TraceEntry::testcase_start(id)) })
    }

    /// Ends the current testcase: an end marker is appended, the buffer flushed and the file
    /// closed. Returns the updated `next` pointer, which is `begin`.
    pub fn testcase_end(&mut self, next: *mut TraceEntry) -> Result<*mut TraceEntry> {
        let id = match self.output {
            Output::Testcase(id) => id,
            Output::Prefix => {
                tracing::warn!("Testcase end received before any testcase, closing the prefix trace");
                let begin = self.write_buffer_to_file(next)?;
                self.close();
                return Ok(begin);
            }
            Output::Idle => {
                tracing::warn!("Testcase end received outside of a testcase, ignoring");
                self.buffer.index_of(next)?;
                return Ok(self.buffer.begin());
            }
        };
        if self.buffer.index_of(next)? >= self.buffer.len() {
            return Err(TraceError::PointerOutOfBounds(next as u64))?;
        }
        // SAFETY: `next` was checked to be a free slot of the buffer.
        let last = unsafe { insert(next, TraceEntry::testcase_end(id)) };
        let begin = self.write_buffer_to_file(last)?;
        if let Some((mut file, path)) = self.file.take() {
            file.flush()?;
            if self.notify {
                println!("t\t{}", path.display());
            }
            tracing::debug!("Testcase {} written to {}", id, path.display());
        }
        self.output = Output::Idle;
        Ok(begin)
    }

    /// Writes everything that is left when the traced thread exits. A running testcase is ended
    /// with an end marker.
    pub fn finish(&mut self, next: *mut TraceEntry) -> Result<()> {
        if let Output::Testcase(id) = self.output {
            tracing::warn!("Thread exited during testcase {}, closing its trace", id);
            self.testcase_end(next)?;
        } else if !next.is_null() {
            self.write_buffer_to_file(next)?;
        }
        self.close();
        Ok(())
    }

    fn close(&mut self) {
        if let Some((mut file, path)) = self.file.take() {
            if let Err(e) = file.flush() {
                tracing::error!("could not flush {}: {}", path.display(), e);
            }
        }
        if self.output == Output::Prefix {
            self.output = Output::Idle;
        }
    }

    // -------------------------------------------------------------------------------------------
    // Thread-local slot

    /// Installs `writer` as the current thread's writer, replacing any previous one.
    pub fn install(writer: TraceWriter) {
        WRITER.with(|w| *w.borrow_mut() = Some(writer));
    }

    /// Removes and returns the current thread's writer.
    pub fn take() -> Option<TraceWriter> {
        WRITER.with(|w| w.borrow_mut().take())
    }

    /// Runs `f` with the current thread's writer. Returns `None` if the thread has no writer.
    pub fn with_current<R>(f: impl FnOnce(&mut TraceWriter) -> Result<R>) -> Option<Result<R>> {
        WRITER.with(|w| w.borrow_mut().as_mut().map(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_prefix(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("leaktrace-writer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name).to_string_lossy().into_owned()
    }

    fn config(name: &str, entries: usize, prefix_trace: bool) -> Config {
        Config::builder(tmp_prefix(name))
            .buffer_entries(entries)
            .prefix_trace(prefix_trace)
            .testcase_notifications(false)
            .build()
            .unwrap()
    }

    #[test]
    fn writer_buffer_bounds() {
        let buffer = TraceBuffer::new(16).unwrap();
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.end() as usize - buffer.begin() as usize, 16 * TraceEntry::SIZE);
        assert_eq!(buffer.index_of(buffer.begin()), Ok(0));
        assert_eq!(buffer.index_of(buffer.end()), Ok(16));
        assert!(buffer.index_of(buffer.end().wrapping_add(1)).is_err());
        assert!(buffer.index_of((buffer.begin() as usize + 3) as *const _).is_err());
        assert!(buffer.entries(buffer.begin()).unwrap().is_empty());
        assert_eq!(
            TraceBuffer::new(3).unwrap_err(),
            Error::Config(ConfigError::BufferTooSmall(3))
        );
    }

    #[test]
    fn writer_end_in_prefix_keeps_entries() {
        let c = config("end_in_prefix", 16, true);
        let mut w = TraceWriter::new(&c).unwrap();
        let mut next = w.begin();
        for size in [0x10, 0x20, 0x30] {
            next = unsafe { insert(next, TraceEntry::alloc_size(size)) };
        }
        next = w.testcase_end(next).unwrap();
        assert_eq!(next, w.begin());
        assert_eq!(w.output(), Output::Idle);
        assert!(w.current_path().is_none());
        w.finish(next).unwrap();
        let prefix = std::fs::read(format!("{}_prefix.trace", c.output_prefix)).unwrap();
        assert_eq!(prefix.len(), 3 * TraceEntry::SIZE);
    }

    #[test]
    fn writer_testcase_files() {
        let c = config("testcase", 16, true);
        let mut w = TraceWriter::new(&c).unwrap();
        assert_eq!(w.output(), Output::Prefix);
        let mut next = w.begin();
        next = unsafe { insert(next, TraceEntry::alloc_size(0x20)) };
        next = w.testcase_start(3, next).unwrap();
        assert_eq!(w.output(), Output::Testcase(3));
        assert_eq!(next, w.begin().wrapping_add(1));
        next = unsafe { insert(next, TraceEntry::memory_read(1, 2)) };
        next = w.testcase_end(next).unwrap();
        assert_eq!(next, w.begin());
        assert_eq!(w.output(), Output::Idle);

        let prefix = std::fs::read(format!("{}_prefix.trace", c.output_prefix)).unwrap();
        assert_eq!(prefix.len(), TraceEntry::SIZE);
        let data = std::fs::read(w.testcase_path(3)).unwrap();
        assert_eq!(data.len(), 3 * TraceEntry::SIZE);
        let mut first = [0; TraceEntry::SIZE];
        first.copy_from_slice(&data[..TraceEntry::SIZE]);
        assert_eq!(TraceEntry::from_bytes(&first), TraceEntry::testcase_start(3));
        let mut last = [0; TraceEntry::SIZE];
        last.copy_from_slice(&data[2 * TraceEntry::SIZE..]);
        assert_eq!(TraceEntry::from_bytes(&last), TraceEntry::testcase_end(3));
    }

    #[test]
    fn writer_unmatched_end_and_nested_start() {
        let c = config("nested", 16, false);
        let mut w = TraceWriter::new(&c).unwrap();
        assert_eq!(w.output(), Output::Idle);
        let next = unsafe { insert(w.begin(), TraceEntry::alloc_size(1)) };
        assert_eq!(w.testcase_end(next), Ok(w.begin()));
        let next = w.testcase_start(1, w.begin()).unwrap();
        let next = w.testcase_start(2, next).unwrap();
        let next = w.testcase_end(next).unwrap();
        w.finish(next).unwrap();
        let first = std::fs::read(w.testcase_path(1)).unwrap();
        assert_eq!(first.len(), 2 * TraceEntry::SIZE);
        let second = std::fs::read(w.testcase_path(2)).unwrap();
        assert_eq!(second.len(), 2 * TraceEntry::SIZE);
    }

    #[test]
    fn writer_flush_if_full() {
        let c = config("flush", 8, false);
        let mut w = TraceWriter::new(&c).unwrap();
        let end = w.end();
        let mut next = w.testcase_start(9, w.begin()).unwrap();
        while !check_buffer_full(next, end) {
            next = unsafe { insert(next, TraceEntry::free_address(0x1000)) };
        }
        assert_eq!(w.flush_if_full(next, end, 1), Ok(next));
        assert_eq!(
            w.flush_if_full(std::ptr::null_mut(), end, MAIN_THREAD),
            Ok(std::ptr::null_mut())
        );
        assert_eq!(w.flush_if_full(next, end, MAIN_THREAD), Ok(w.begin()));
        w.finish(w.begin()).unwrap();
        let data = std::fs::read(w.testcase_path(9)).unwrap();
        assert_eq!(data.len(), 7 * TraceEntry::SIZE);
    }
}
