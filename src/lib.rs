//! Dynamic binary instrumentation tracer for x86-64 side-channel leakage analysis.
//!
//! `leaktrace` records, for the main thread of a target process, a stream of micro-events that
//! may leak secrets through side channels: memory accesses, control-flow transfers, heap
//! allocations and frees. The target splits its execution into *testcases* (e.g. one per secret
//! input) and every testcase gets its own trace file, so that an offline analysis can compare them
//! and find the instructions whose behaviour depends on the input.
//!
//! ## Tracer Internals & Usage
//!
//! The tracer is not a DBI runtime. It is driven by a host runtime that exposes the capabilities
//! described in the [`host`] module and calls the [`Tracer`](core::Tracer) callbacks. It is
//! recommended to read the documentation in the following order.
//!
//! 1. [Host Capabilities](host)
//! 2. [Trace Format](trace)
//! 3. [Trace Buffer and Output Files](writer)
//! 4. [Probes](probes)
//! 5. [Instrumentation Planning](planner)
//!     1. [Instruction Metadata](insn)
//!     2. [Images](image)
//! 6. [Routine Hooks](hooks)
//! 7. [CPU Model and RDRAND Override](cpu)
//! 8. [Tracer Callbacks](core::Tracer)
//! 9. [Config](config::Config)
//! 10. [Reading Traces](reader)
//!
//! ## Getting Started
//!
//! ### Command Line
//!
//! The host forwards the tool's arguments to [`Tracer::init`](core::Tracer::init):
//!
//! ```console
//! -o <prefix>   prefix of the output files (default: out)
//! -i <list>     interesting images, separated by semicolons (default: .exe)
//! -c <level>    CPU model: 0 = Default, 1 = Pentium3, 2 = Merom, 3 = Westmere, 4 = Ivybridge
//! -r <value>    constant RDRAND output, decimal or 0x-prefixed hexadecimal
//! -a <abi>      allocator routines to hook: windows-heap or libc
//! -b <entries>  trace buffer size (default: 16384)
//! --no-prefix   discard the entries recorded before the first testcase
//! -q            do not announce completed testcases on stdout
//! ```
//!
//! Logging goes to stderr and can be tuned with the `RUST_LOG` environment variable.
//!
//! ### Target Side
//!
//! The target announces testcases and its stack bounds by calling the following functions, which
//! must be exported and must not be inlined:
//!
//! ```c
//! __declspec(dllexport) __declspec(noinline) void PinNotifyTestcaseStart(int id) { }
//! __declspec(dllexport) __declspec(noinline) void PinNotifyTestcaseEnd(void) { }
//! __declspec(dllexport) __declspec(noinline) void PinNotifyStackPointer(uintptr_t min, uintptr_t max) { }
//! ```
//!
//! ### Output Files
//!
//! * `<prefix>_images.log`: every loaded image with its address range;
//! * `<prefix>_prefix.trace`: entries recorded before the first testcase;
//! * `<prefix>_t<id>.trace`: entries of testcase `<id>`.
//!
//! Completed testcase traces are announced on stdout with a `t\t<path>` line. Trace files can be
//! decoded with [`TraceReader`](reader::TraceReader).
//!
//! You can also have a look at the integration tests in `tests/`, which drive the tracer with a
//! mock host.

pub mod config;
pub mod core;
pub mod cpu;
pub mod error;
pub mod hooks;
pub mod host;
pub mod image;
pub mod insn;
pub mod planner;
pub mod probes;
pub mod reader;
pub mod trace;
pub mod writer;
