//! Probes inserted by the planner and the hook installer, and what they do when they fire.
//!
//! A [`Probe`] is plain data: an instrumentation point, an optional [`Predicate`] and an
//! [`Action`]. Hosts are free to compile predicates inline and only call [`Probe::fire`] (or
//! [`Action::run`]) when they hold.
//!
//! Recording probes always come in pairs:
//!
//! ```text
//!   if EntryValid(next)      then Record  -> writes one entry at `next`, returns `next + 1`
//!   if BufferFull(next, end) then Flush   -> writes the buffer to disk, returns `begin`
//! ```
//!
//! The first predicate is `false` for threads that are not traced, since their `next` scratch
//! register is null. The second one keeps the flush call off the common path.

use crate::cpu::*;
use crate::error::*;
use crate::host::*;
use crate::trace::*;
use crate::writer::*;

/// Scratch registers holding the traced thread's buffer pointers.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct BufferRegs {
    /// Address of the next free entry.
    pub next: Reg,
    /// Address one past the last entry.
    pub end: Reg,
}

impl BufferRegs {
    fn next<C: ExecContext + ?Sized>(&self, ctx: &C) -> *mut TraceEntry {
        ctx.reg(self.next) as *mut TraceEntry
    }

    fn end<C: ExecContext + ?Sized>(&self, ctx: &C) -> *mut TraceEntry {
        ctx.reg(self.end) as *mut TraceEntry
    }

    fn set_next<C: ExecContext + ?Sized>(&self, ctx: &mut C, next: *mut TraceEntry) {
        ctx.set_reg(self.next, next as u64);
    }
}

/// Conditions evaluated before an action runs.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Predicate {
    /// The `next` pointer is not null.
    EntryValid { next: Reg },
    /// The buffer has fewer than [`BUFFER_FULL_MARGIN`] free entries left.
    BufferFull { next: Reg, end: Reg },
}

impl Predicate {
    pub fn eval<C: ExecContext + ?Sized>(&self, ctx: &C) -> bool {
        match self {
            Predicate::EntryValid { next } => ctx.reg(*next) != 0,
            Predicate::BufferFull { next, end } => check_buffer_full(
                ctx.reg(*next) as *const TraceEntry,
                ctx.reg(*end) as *const TraceEntry,
            ),
        }
    }
}

/// Entries a probe can record, and where their values come from.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Record {
    /// A jump or a call to the runtime branch target. Calls are always taken.
    Branch { is_call: bool },
    /// A return. The target is the instruction pointer after the transfer.
    Ret,
    /// A read through the `operand`-th memory read operand.
    MemoryRead { operand: usize },
    MemoryWrite,
    /// Allocation size passed as argument `arg`.
    AllocSize { arg: usize },
    /// Allocation size computed as the product of two arguments.
    CallocSize { count_arg: usize, size_arg: usize },
    /// Address returned by an allocator.
    AllocReturn,
    /// Address passed as argument `arg` to a deallocator.
    FreeAddress { arg: usize },
    /// Stack bound passed as argument `arg`.
    StackPointer { kind: StackPointerKind, arg: usize },
}

impl Record {
    /// Builds the entry from the current execution context.
    pub fn entry<C: ExecContext + ?Sized>(&self, ctx: &C) -> TraceEntry {
        match *self {
            Record::Branch { is_call } => TraceEntry::branch(
                ctx.inst_ptr(),
                ctx.branch_target(),
                is_call || ctx.branch_taken(),
                is_call,
            ),
            Record::Ret => TraceEntry::ret(ctx.inst_ptr(), ctx.reg(Reg::Rip)),
            Record::MemoryRead { operand } => {
                TraceEntry::memory_read(ctx.inst_ptr(), ctx.memory_read_ea(operand))
            }
            Record::MemoryWrite => TraceEntry::memory_write(ctx.inst_ptr(), ctx.memory_write_ea()),
            Record::AllocSize { arg } => TraceEntry::alloc_size(ctx.func_arg(arg)),
            Record::CallocSize {
                count_arg,
                size_arg,
            } => TraceEntry::alloc_size(ctx.func_arg(count_arg).wrapping_mul(ctx.func_arg(size_arg))),
            Record::AllocReturn => TraceEntry::alloc_return(ctx.return_value()),
            Record::FreeAddress { arg } => TraceEntry::free_address(ctx.func_arg(arg)),
            Record::StackPointer { kind, arg } => TraceEntry::stack_pointer(kind, ctx.func_arg(arg)),
        }
    }
}

/// What a probe does when it fires.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum Action {
    /// Appends an entry to the buffer.
    Record { record: Record, regs: BufferRegs },
    /// Writes the buffer to disk if it is full.
    Flush { regs: BufferRegs },
    /// Saves the `CPUID` inputs before the instruction executes.
    SaveCpuidInput { eax: Reg, ecx: Reg },
    /// Replaces the `CPUID` outputs, using the inputs saved in `eax` and `ecx`.
    RewriteCpuid { model: CpuModel, eax: Reg, ecx: Reg },
    /// Replaces the `RDRAND` output.
    RewriteRdrand { dest: GprRef, value: u64 },
    /// Starts the testcase whose id is the routine argument `id_arg`.
    TestcaseStart { id_arg: usize, regs: BufferRegs },
    /// Ends the current testcase.
    TestcaseEnd { regs: BufferRegs },
}

impl Action {
    /// Runs the action on the thread described by `ctx`.
    pub fn run<C: ExecContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        match *self {
            Action::Record { record, regs } => {
                let next = regs.next(ctx);
                if next.is_null() {
                    return Ok(());
                }
                if next >= regs.end(ctx) {
                    return Err(TraceError::PointerOutOfBounds(next as u64))?;
                }
                let entry = record.entry(ctx);
                // SAFETY: `next` is a non-null pointer below the buffer's end. The flush probe
                // following every record keeps at least one free slot.
                let next = unsafe { insert(next, entry) };
                regs.set_next(ctx, next);
            }
            Action::Flush { regs } => {
                let (next, end, tid) = (regs.next(ctx), regs.end(ctx), ctx.thread_id());
                if tid != MAIN_THREAD || next.is_null() {
                    return Ok(());
                }
                if let Some(next) = TraceWriter::with_current(|w| w.flush_if_full(next, end, tid))
                    .transpose()?
                {
                    regs.set_next(ctx, next);
                }
            }
            Action::SaveCpuidInput { eax, ecx } => {
                ctx.set_reg(eax, ctx.reg(Reg::Rax) & 0xffff_ffff);
                ctx.set_reg(ecx, ctx.reg(Reg::Rcx) & 0xffff_ffff);
            }
            Action::RewriteCpuid { model, eax, ecx } => {
                if model != CpuModel::Default {
                    let mut out = CpuidRegs::read(ctx);
                    change_cpuid(model, ctx.reg(eax) as u32, ctx.reg(ecx) as u32, &mut out);
                    out.write(ctx);
                }
            }
            Action::RewriteRdrand { dest, value } => rewrite_rdrand(ctx, dest, value),
            Action::TestcaseStart { id_arg, regs } => {
                let next = regs.next(ctx);
                if next.is_null() {
                    tracing::debug!("Testcase start on untraced thread #{}", ctx.thread_id());
                    return Ok(());
                }
                let id = ctx.func_arg(id_arg) as u32 as i32;
                if let Some(next) =
                    TraceWriter::with_current(|w| w.testcase_start(id, next)).transpose()?
                {
                    regs.set_next(ctx, next);
                }
            }
            Action::TestcaseEnd { regs } => {
                let next = regs.next(ctx);
                if next.is_null() {
                    tracing::debug!("Testcase end on untraced thread #{}", ctx.thread_id());
                    return Ok(());
                }
                if let Some(next) = TraceWriter::with_current(|w| w.testcase_end(next)).transpose()? {
                    regs.set_next(ctx, next);
                }
            }
        }
        Ok(())
    }
}

/// A probe attached to an instruction or a routine.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Probe {
    pub point: IPoint,
    /// The action only runs when the predicate holds.
    pub predicate: Option<Predicate>,
    pub action: Action,
}

impl Probe {
    /// Creates an unconditional probe.
    pub fn new(point: IPoint, action: Action) -> Self {
        Self {
            point,
            predicate: None,
            action,
        }
    }

    /// Makes the probe conditional.
    pub fn when(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Appends `record` when the thread is traced.
    pub fn record(point: IPoint, record: Record, regs: BufferRegs) -> Self {
        Self::new(point, Action::Record { record, regs })
            .when(Predicate::EntryValid { next: regs.next })
    }

    /// Flushes the buffer when it is full.
    pub fn flush(point: IPoint, regs: BufferRegs) -> Self {
        Self::new(point, Action::Flush { regs }).when(Predicate::BufferFull {
            next: regs.next,
            end: regs.end,
        })
    }

    /// Evaluates the predicate and runs the action if it holds.
    pub fn fire<C: ExecContext + ?Sized>(&self, ctx: &mut C) -> Result<()> {
        if let Some(predicate) = &self.predicate {
            if !predicate.eval(ctx) {
                return Ok(());
            }
        }
        self.action.run(ctx)
    }
}
