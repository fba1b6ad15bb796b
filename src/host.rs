//! Capabilities the tracer expects from the dynamic binary instrumentation runtime.
//!
//! The tracer does not discover basic blocks, rewrite code or manage thread contexts itself.
//! These are provided by a host runtime through two traits:
//!
//!  * [`Host`] is used while code is being instrumented (image loads, basic block
//!    materialization). It reserves scratch registers, resolves symbols and inserts probes.
//!  * [`ExecContext`] is handed to a [`Probe`] when it fires. It exposes the
//!    register file of the running thread and the values the runtime evaluates for the
//!    instrumented instruction (effective addresses, branch targets, function arguments).
//!
//! ```text
//!   +--------------+   image load / BBL    +--------------+   Probe values   +-------------+
//!   | Host runtime | --------------------> |    Tracer    | ---------------> |    Host     |
//!   +--------------+                       +--------------+                  +-------------+
//!          |                                                                        |
//!          |  probe fires on the target thread: Probe::fire(&mut ExecContext)       |
//!          +------------------------------------------------------------------------+
//! ```

use crate::error::*;
use crate::insn::*;
use crate::probes::*;

/// Identifier of a thread, as numbered by the host. The first thread of the process is `0`.
pub type ThreadId = u32;

/// The only thread whose events are recorded.
pub const MAIN_THREAD: ThreadId = 0;

/// Registers of the x86-64 thread context the tracer reads or writes.
///
/// `Scratch` registers are slots reserved by the host for the tracer's own use. Their content is
/// preserved across the target's code and they are zero when a thread starts.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Scratch(u16),
}

impl Reg {
    /// General purpose registers, in encoding order.
    pub const GPRS: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Resolves an assembler register name (`rax`, `eax`, `ax`, `r9d`, `r10w`, ...) into the
    /// 64-bit register it belongs to and the width of the access in bytes.
    ///
    /// 8-bit registers are not handled since none of the instructions rewritten by the tracer
    /// can target them.
    pub fn from_name(name: &str) -> Option<GprRef> {
        const LEGACY: [(&str, &str, &str); 8] = [
            ("rax", "eax", "ax"),
            ("rcx", "ecx", "cx"),
            ("rdx", "edx", "dx"),
            ("rbx", "ebx", "bx"),
            ("rsp", "esp", "sp"),
            ("rbp", "ebp", "bp"),
            ("rsi", "esi", "si"),
            ("rdi", "edi", "di"),
        ];
        let name = name.to_ascii_lowercase();
        for (idx, (q, d, w)) in LEGACY.iter().enumerate() {
            let size = match name.as_str() {
                n if n == *q => 8,
                n if n == *d => 4,
                n if n == *w => 2,
                _ => continue,
            };
            return Some(GprRef::new(Self::GPRS[idx], size));
        }
        // r8 to r15, with their `d` and `w` suffixed variants.
        let digits = name.strip_prefix('r')?;
        let (num, size) = if let Some(n) = digits.strip_suffix('d') {
            (n, 4)
        } else if let Some(n) = digits.strip_suffix('w') {
            (n, 2)
        } else {
            (digits, 8)
        };
        match num.parse::<usize>() {
            Ok(n @ 8..=15) => Some(GprRef::new(Self::GPRS[n], size)),
            _ => None,
        }
    }
}

/// A general purpose register accessed with a given width.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct GprRef {
    /// The full 64-bit register.
    pub reg: Reg,
    /// Access width in bytes (2, 4 or 8).
    pub size: u8,
}

impl GprRef {
    /// Creates a new register reference.
    pub fn new(reg: Reg, size: u8) -> Self {
        Self { reg, size }
    }

    /// Writes `value` to the register with x86-64 partial register semantics: 64-bit writes
    /// replace the register, 32-bit writes zero-extend and 16-bit writes merge into the low
    /// word.
    pub fn write<C: ExecContext + ?Sized>(&self, ctx: &mut C, value: u64) {
        let value = match self.size {
            8 => value,
            4 => value as u32 as u64,
            _ => (ctx.reg(self.reg) & !0xffff) | (value & 0xffff),
        };
        ctx.set_reg(self.reg, value);
    }
}

/// Location of a probe relative to the instruction or routine it is attached to.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum IPoint {
    /// Before the instruction executes (or at the routine's entry point).
    Before,
    /// After the instruction on its fall-through path (or when the routine returns).
    After,
    /// After a control transfer was taken, before the first instruction of the target.
    TakenBranch,
}

/// Information delivered by the host when an image is loaded.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ImageInfo {
    /// Full path or name of the image.
    pub name: String,
    /// Lowest address mapped by the image.
    pub low: u64,
    /// Highest address mapped by the image (inclusive).
    pub high: u64,
}

impl ImageInfo {
    /// Creates a new image descriptor.
    pub fn new(name: impl Into<String>, low: u64, high: u64) -> Self {
        Self {
            name: name.into(),
            low,
            high,
        }
    }
}

/// Handle to a routine found by [`Host::find_routine`]. Wraps the routine's entry address.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Routine(pub u64);

/// Instrumentation-time capabilities of the host runtime.
pub trait Host {
    /// Reserves a thread-context register for the tracer. Returns `None` when the runtime ran
    /// out of them.
    fn claim_scratch_reg(&mut self) -> Option<Reg>;

    /// Attaches `probe` to the instruction `ins` at `probe.point`.
    ///
    /// Probes attached to the same instruction and point must fire in insertion order. When the
    /// probe has a predicate, the host should evaluate it inline and only call into the action
    /// when it holds (see [`Probe::predicate`] and [`Probe::action`]).
    fn insert_probe(&mut self, ins: &Ins, probe: Probe);

    /// Looks up the routine named `name` in `image`.
    fn find_routine(&mut self, image: &ImageInfo, name: &str) -> Option<Routine>;

    /// Attaches `probe` to a routine: [`IPoint::Before`] fires at its entry point,
    /// [`IPoint::After`] when it returns.
    fn insert_routine_probe(&mut self, routine: Routine, probe: Probe) -> Result<()>;
}

/// Run-time view of the thread executing an instrumented instruction.
pub trait ExecContext {
    /// Host identifier of the current thread.
    fn thread_id(&self) -> ThreadId;

    /// Reads a register of the thread context.
    fn reg(&self, reg: Reg) -> u64;

    /// Writes a register of the thread context.
    fn set_reg(&mut self, reg: Reg, value: u64);

    /// Address of the instruction the probe is attached to. For probes fired at
    /// [`IPoint::TakenBranch`] this is still the branch itself, while `reg(Reg::Rip)` holds the
    /// target.
    fn inst_ptr(&self) -> u64;

    /// Target of the branch or call the probe is attached to.
    fn branch_target(&self) -> u64;

    /// Whether the branch the probe is attached to will be taken.
    fn branch_taken(&self) -> bool;

    /// Effective address of the `operand`-th memory read (0 or 1) of the instruction.
    fn memory_read_ea(&self, operand: usize) -> u64;

    /// Effective address of the memory write of the instruction.
    fn memory_write_ea(&self) -> u64;

    /// Value of the `index`-th argument of the routine, read at its entry point.
    fn func_arg(&self, index: usize) -> u64;

    /// Value returned by the routine, read when it returns.
    fn return_value(&self) -> u64 {
        self.reg(Reg::Rax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_register_names() {
        assert_eq!(Reg::from_name("rax"), Some(GprRef::new(Reg::Rax, 8)));
        assert_eq!(Reg::from_name("EDX"), Some(GprRef::new(Reg::Rdx, 4)));
        assert_eq!(Reg::from_name("si"), Some(GprRef::new(Reg::Rsi, 2)));
        assert_eq!(Reg::from_name("r9"), Some(GprRef::new(Reg::R9, 8)));
        assert_eq!(Reg::from_name("r12d"), Some(GprRef::new(Reg::R12, 4)));
        assert_eq!(Reg::from_name("r15w"), Some(GprRef::new(Reg::R15, 2)));
        assert_eq!(Reg::from_name("r16"), None);
        assert_eq!(Reg::from_name("xmm0"), None);
        assert_eq!(Reg::from_name("al"), None);
    }
}
