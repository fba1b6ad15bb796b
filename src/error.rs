//! Contains all error types that can be returned by this crate.

use std::alloc;
use std::error;
use std::fmt;
use std::io;

/// Convenient `Result` type for custom errors.
pub type Result<T> = std::result::Result<T, Error>;

// -----------------------------------------------------------------------------------------------
// Errors - General
// -----------------------------------------------------------------------------------------------

/// Main error structure which is just a simple wrapper for all errors that can be returned by the
/// tracer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Configuration-related errors.
    Config(ConfigError),
    /// Hook-related errors.
    Hook(HookError),
    /// Image-related errors.
    Image(ImageError),
    /// Trace-related errors.
    Trace(TraceError),
    /// An I/O error occured while reading or writing trace artifacts.
    Io(String),
    /// Generic user-defined errors.
    Generic(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "[Config error] {}", e),
            Error::Hook(e) => write!(f, "[Hook error] {}", e),
            Error::Image(e) => write!(f, "[Image error] {}", e),
            Error::Trace(e) => write!(f, "[Trace error] {}", e),
            Error::Io(e) => write!(f, "[I/O error] {}", e),
            Error::Generic(e) => write!(f, "[Error] {}", e),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<HookError> for Error {
    fn from(error: HookError) -> Self {
        Error::Hook(error)
    }
}

impl From<ImageError> for Error {
    fn from(error: ImageError) -> Self {
        Error::Image(error)
    }
}

impl From<TraceError> for Error {
    fn from(error: TraceError) -> Self {
        Error::Trace(error)
    }
}

impl From<alloc::LayoutError> for Error {
    fn from(error: alloc::LayoutError) -> Self {
        Error::Trace(TraceError::LayoutError(error))
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(format!("{}", error))
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Config(ConfigError::InvalidPattern(format!("{}", error)))
    }
}

impl From<capstone::Error> for Error {
    fn from(error: capstone::Error) -> Self {
        Error::Hook(HookError::Disassembly(format!("{}", error)))
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Config
// -----------------------------------------------------------------------------------------------

/// Configuration-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The tool's command line could not be parsed.
    InvalidArguments(String),
    /// The CPU model level is not one of the supported ones.
    InvalidCpuModel(u32),
    /// The trace buffer cannot hold a full probe sequence.
    BufferTooSmall(usize),
    /// An interesting image pattern could not be compiled.
    InvalidPattern(String),
    /// The allocator ABI name is unknown.
    UnknownAllocatorAbi(String),
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidArguments(e) => write!(f, "invalid arguments: {}", e),
            ConfigError::InvalidCpuModel(l) => write!(f, "invalid cpu model level ({})", l),
            ConfigError::BufferTooSmall(n) => {
                write!(f, "trace buffer is too small ({} entries)", n)
            }
            ConfigError::InvalidPattern(e) => write!(f, "invalid image pattern: {}", e),
            ConfigError::UnknownAllocatorAbi(a) => write!(f, "unknown allocator abi: {}", a),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Hook
// -----------------------------------------------------------------------------------------------

/// Hook-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HookError {
    /// The host could not reserve another scratch register.
    NoScratchRegister,
    /// The instrumentation point is not supported for this routine probe.
    InvalidInstrumentationPoint(u64),
    /// Code could not be disassembled.
    Disassembly(String),
    /// User-defined hook error.
    Generic(String),
}

impl error::Error for HookError {}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::NoScratchRegister => write!(f, "no scratch register left on the host"),
            HookError::InvalidInstrumentationPoint(a) => {
                write!(f, "invalid instrumentation point ({:#x})", a)
            }
            HookError::Disassembly(e) => write!(f, "disassembly failed: {}", e),
            HookError::Generic(e) => write!(f, "{}", e),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Image
// -----------------------------------------------------------------------------------------------

/// Image-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageError {
    /// No loaded image contains the basic block at this address.
    UnattributedBbl(u64),
    /// The image bounds are inverted.
    InvalidRange(u64, u64),
}

impl error::Error for ImageError {}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::UnattributedBbl(a) => {
                write!(f, "cannot resolve image of basic block {:#x}", a)
            }
            ImageError::InvalidRange(l, h) => write!(f, "invalid image range {:#x}..{:#x}", l, h),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Errors - Trace
// -----------------------------------------------------------------------------------------------

/// Trace-related errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TraceError {
    /// Wrapper for `alloc::LayoutError`.
    LayoutError(alloc::LayoutError),
    /// The trace buffer could not be allocated.
    OutOfMemory,
    /// A buffer pointer handed back by a probe does not belong to the thread's buffer.
    PointerOutOfBounds(u64),
    /// A record could not be decoded. Stores the file offset and a hexdump of the record.
    InvalidEntry { offset: u64, dump: String },
    /// The trace file ends in the middle of a record.
    Truncated(u64),
}

impl error::Error for TraceError {}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::LayoutError(e) => write!(f, "layout error: {}", e),
            TraceError::OutOfMemory => write!(f, "could not allocate the trace buffer"),
            TraceError::PointerOutOfBounds(p) => {
                write!(f, "buffer pointer out of bounds: {:#x}", p)
            }
            TraceError::InvalidEntry { offset, dump } => {
                write!(f, "invalid trace entry at offset {:#x}\n{}", offset, dump)
            }
            TraceError::Truncated(o) => write!(f, "truncated trace entry at offset {:#x}", o),
        }
    }
}
