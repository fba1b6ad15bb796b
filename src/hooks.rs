//! Installs routine hooks when an image is loaded.
//!
//! # Notification Routines
//!
//! The target communicates with the tracer by calling empty functions it exports. They do
//! nothing when the target runs natively, but the tracer hooks their entry point:
//!
//! ```c
//! void PinNotifyTestcaseStart(int id);                    // opens the trace of testcase `id`
//! void PinNotifyTestcaseEnd(void);                        // closes the current trace
//! void PinNotifyStackPointer(uintptr_t min, uintptr_t max); // records the stack bounds
//! ```
//!
//! # Allocator Routines
//!
//! Heap allocations are traced by hooking the allocator functions selected by the
//! [`AllocatorAbi`]. The size of an allocation is recorded when the allocator is entered and the
//! returned address when it returns, so allocators must be entered with `call` and left with
//! `ret`. Allocators reached through a tail call will miss their return entry.

use std::fmt;
use std::str::FromStr;

use crate::error::*;
use crate::host::*;
use crate::probes::*;
use crate::trace::*;

/// Name of the routine marking the start of a testcase.
pub const TESTCASE_START: &str = "PinNotifyTestcaseStart";
/// Name of the routine marking the end of a testcase.
pub const TESTCASE_END: &str = "PinNotifyTestcaseEnd";
/// Name of the routine announcing the bounds of the stack.
pub const STACK_POINTER: &str = "PinNotifyStackPointer";

// -----------------------------------------------------------------------------------------------
// Allocators
// -----------------------------------------------------------------------------------------------

/// An allocator routine and where its arguments are found.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum AllocatorRoutine {
    /// Allocation routine, whose size is recorded by `size`.
    Alloc { name: &'static str, size: Record },
    /// Deallocation routine, whose address is argument `addr_arg`.
    Free { name: &'static str, addr_arg: usize },
}

impl AllocatorRoutine {
    pub fn name(&self) -> &'static str {
        match self {
            AllocatorRoutine::Alloc { name, .. } | AllocatorRoutine::Free { name, .. } => *name,
        }
    }
}

static WINDOWS_HEAP: [AllocatorRoutine; 2] = [
    AllocatorRoutine::Alloc {
        name: "RtlAllocateHeap",
        size: Record::AllocSize { arg: 2 },
    },
    AllocatorRoutine::Free {
        name: "RtlFreeHeap",
        addr_arg: 2,
    },
];

static LIBC: [AllocatorRoutine; 3] = [
    AllocatorRoutine::Alloc {
        name: "malloc",
        size: Record::AllocSize { arg: 0 },
    },
    AllocatorRoutine::Alloc {
        name: "calloc",
        size: Record::CallocSize {
            count_arg: 0,
            size_arg: 1,
        },
    },
    AllocatorRoutine::Free {
        name: "free",
        addr_arg: 0,
    },
];

/// Sets of allocator routines that can be hooked.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum AllocatorAbi {
    /// `RtlAllocateHeap` and `RtlFreeHeap` from `ntdll.dll`.
    WindowsHeap,
    /// `malloc`, `calloc` and `free` from the C library.
    Libc,
}

impl AllocatorAbi {
    /// Returns the routines hooked for this ABI.
    pub fn routines(&self) -> &'static [AllocatorRoutine] {
        match self {
            AllocatorAbi::WindowsHeap => &WINDOWS_HEAP,
            AllocatorAbi::Libc => &LIBC,
        }
    }
}

impl Default for AllocatorAbi {
    fn default() -> Self {
        if cfg!(windows) {
            AllocatorAbi::WindowsHeap
        } else {
            AllocatorAbi::Libc
        }
    }
}

impl FromStr for AllocatorAbi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "windows-heap" => Ok(AllocatorAbi::WindowsHeap),
            "libc" => Ok(AllocatorAbi::Libc),
            _ => Err(ConfigError::UnknownAllocatorAbi(s.to_string()))?,
        }
    }
}

impl fmt::Display for AllocatorAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorAbi::WindowsHeap => write!(f, "windows-heap"),
            AllocatorAbi::Libc => write!(f, "libc"),
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Image hooks
// -----------------------------------------------------------------------------------------------

/// Installs the notification and allocator hooks of loaded images.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ImageHooks {
    /// Buffer pointer scratch registers.
    pub regs: BufferRegs,
    /// Allocator routines to hook.
    pub abi: AllocatorAbi,
}

impl ImageHooks {
    pub fn new(regs: BufferRegs, abi: AllocatorAbi) -> Self {
        Self { regs, abi }
    }

    /// Hooks every known routine exported by `image`. Returns the number of probes inserted.
    pub fn install<H: Host + ?Sized>(&self, host: &mut H, image: &ImageInfo) -> Result<usize> {
        let regs = self.regs;
        let mut count = 0;

        if let Some(rtn) = self.find(host, image, TESTCASE_START) {
            let action = Action::TestcaseStart { id_arg: 0, regs };
            host.insert_routine_probe(rtn, Probe::new(IPoint::Before, action))?;
            count += 1;
        }
        if let Some(rtn) = self.find(host, image, TESTCASE_END) {
            let action = Action::TestcaseEnd { regs };
            host.insert_routine_probe(rtn, Probe::new(IPoint::Before, action))?;
            count += 1;
        }
        if let Some(rtn) = self.find(host, image, STACK_POINTER) {
            for (kind, arg) in [(StackPointerKind::Min, 0), (StackPointerKind::Max, 1)] {
                count += self.record(host, rtn, IPoint::Before, Record::StackPointer { kind, arg })?;
            }
        }

        for routine in self.abi.routines() {
            let rtn = match self.find(host, image, routine.name()) {
                Some(rtn) => rtn,
                None => continue,
            };
            match *routine {
                AllocatorRoutine::Alloc { size, .. } => {
                    count += self.record(host, rtn, IPoint::Before, size)?;
                    count += self.record(host, rtn, IPoint::After, Record::AllocReturn)?;
                }
                AllocatorRoutine::Free { addr_arg, .. } => {
                    count += self.record(
                        host,
                        rtn,
                        IPoint::Before,
                        Record::FreeAddress { arg: addr_arg },
                    )?;
                }
            }
        }
        Ok(count)
    }

    fn find<H: Host + ?Sized>(&self, host: &mut H, image: &ImageInfo, name: &str) -> Option<Routine> {
        let rtn = host.find_routine(image, name);
        match rtn {
            Some(Routine(addr)) => {
                tracing::info!("{}() instrumented in '{}' at {:#x}", name, image.name, addr)
            }
            None => tracing::debug!("{}() not found in '{}'", name, image.name),
        }
        rtn
    }

    /// Inserts a record probe and its flush check on a routine.
    fn record<H: Host + ?Sized>(
        &self,
        host: &mut H,
        rtn: Routine,
        point: IPoint,
        record: Record,
    ) -> Result<usize> {
        host.insert_routine_probe(rtn, Probe::record(point, record, self.regs))?;
        host.insert_routine_probe(rtn, Probe::flush(point, self.regs))?;
        Ok(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::insn::*;

    struct Symbols {
        names: Vec<&'static str>,
        probes: Vec<(Routine, Probe)>,
    }

    impl Host for Symbols {
        fn claim_scratch_reg(&mut self) -> Option<Reg> {
            None
        }
        fn insert_probe(&mut self, _: &Ins, _: Probe) {}
        fn find_routine(&mut self, image: &ImageInfo, name: &str) -> Option<Routine> {
            self.names
                .iter()
                .position(|n| *n == name)
                .map(|i| Routine(image.low + i as u64 * 0x10))
        }
        fn insert_routine_probe(&mut self, rtn: Routine, probe: Probe) -> Result<()> {
            if probe.point == IPoint::TakenBranch {
                return Err(HookError::InvalidInstrumentationPoint(rtn.0))?;
            }
            self.probes.push((rtn, probe));
            Ok(())
        }
    }

    fn hooks(abi: AllocatorAbi) -> ImageHooks {
        ImageHooks::new(
            BufferRegs {
                next: Reg::Scratch(0),
                end: Reg::Scratch(1),
            },
            abi,
        )
    }

    #[test]
    fn hooks_allocator_abi_names() {
        assert_eq!("libc".parse::<AllocatorAbi>(), Ok(AllocatorAbi::Libc));
        assert_eq!(
            "Windows-Heap".parse::<AllocatorAbi>(),
            Ok(AllocatorAbi::WindowsHeap)
        );
        assert_eq!(
            "jemalloc".parse::<AllocatorAbi>(),
            Err(Error::Config(ConfigError::UnknownAllocatorAbi(
                "jemalloc".to_string()
            )))
        );
        assert_eq!(AllocatorAbi::WindowsHeap.to_string(), "windows-heap");
    }

    #[test]
    fn hooks_libc_image() {
        let mut host = Symbols {
            names: vec!["malloc", "calloc", "realloc", "free"],
            probes: vec![],
        };
        let image = ImageInfo::new("libc.so.6", 0x1000, 0x2000);
        let count = hooks(AllocatorAbi::Libc).install(&mut host, &image).unwrap();
        // malloc: 4, calloc: 4, free: 2.
        assert_eq!(count, 10);
        assert_eq!(host.probes.len(), 10);
        let after: Vec<_> = host
            .probes
            .iter()
            .filter(|(_, p)| p.point == IPoint::After)
            .map(|(r, _)| *r)
            .collect();
        assert_eq!(after, vec![Routine(0x1000), Routine(0x1000), Routine(0x1010), Routine(0x1010)]);
        assert!(host.probes.iter().all(|(r, _)| *r != Routine(0x1020)));
    }

    #[test]
    fn hooks_notification_routines() {
        let mut host = Symbols {
            names: vec![TESTCASE_START, TESTCASE_END, STACK_POINTER, "RtlFreeHeap"],
            probes: vec![],
        };
        let image = ImageInfo::new("target.exe", 0x400000, 0x500000);
        let h = hooks(AllocatorAbi::WindowsHeap);
        assert_eq!(h.install(&mut host, &image), Ok(8));
        assert_eq!(
            host.probes[0].1.action,
            Action::TestcaseStart {
                id_arg: 0,
                regs: h.regs
            }
        );
        assert_eq!(host.probes[0].1.predicate, None);
        assert_eq!(
            host.probes[6].1.action,
            Action::Record {
                record: Record::FreeAddress { arg: 2 },
                regs: h.regs
            }
        );

        // Images without any known symbol are left alone.
        let mut host = Symbols {
            names: vec![],
            probes: vec![],
        };
        assert_eq!(h.install(&mut host, &image), Ok(0));
    }
}
