//! Instruction metadata used by the instrumentation planner.
//!
//! The planner only needs a handful of facts about each instruction (its class, whether it has
//! a segment prefix, how many memory operands it reads or writes, ...). Hosts that already decode
//! instructions can build [`Ins`] values directly, while the others can rely on [`decode`] and
//! [`decode_bbls`], which use capstone.

use capstone::arch::x86::X86OperandType;
use capstone::prelude::*;
use capstone::RegAccessType;

use crate::error::*;
use crate::host::*;

thread_local!(
    /// A per-thread global capstone instance used to disassemble x86-64 instructions.
    pub static CSE: capstone::Capstone = capstone::Capstone::new()
        .x86()
        .mode(capstone::arch::x86::ArchMode::Mode64)
        .detail(true)
        .build()
        .expect("Could not initialize Capstone engine");
);

/// Instruction classes the planner handles differently.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum InsClass {
    /// `push*` and `pop*` (which includes `popcnt`).
    PushPop,
    Lea,
    Cpuid,
    Rdrand,
    Call,
    /// Conditional and unconditional jumps, and loops.
    Branch,
    Ret,
    Other,
}

impl InsClass {
    /// Classifies an instruction from its mnemonic. Prefixes (`rep`, `lock`, `bnd`, ...) are
    /// ignored.
    pub fn from_mnemonic(mnemonic: &str) -> Self {
        let m = base_mnemonic(mnemonic);
        match m.as_str() {
            "cpuid" => Self::Cpuid,
            "rdrand" => Self::Rdrand,
            "lea" => Self::Lea,
            "call" | "lcall" => Self::Call,
            "ret" | "retf" | "retfq" | "iret" | "iretd" | "iretq" => Self::Ret,
            "jmp" | "ljmp" => Self::Branch,
            m if m.starts_with("push") || m.starts_with("pop") => Self::PushPop,
            m if m.starts_with('j') || m.starts_with("loop") => Self::Branch,
            _ => Self::Other,
        }
    }

    /// Returns `true` for instructions that end a basic block.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::Call | Self::Branch | Self::Ret)
    }
}

/// Returns the last word of a mnemonic, lowercased.
fn base_mnemonic(mnemonic: &str) -> String {
    mnemonic
        .split_whitespace()
        .last()
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// An instruction, as seen by the planner.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Ins {
    /// Address of the instruction.
    pub addr: u64,
    /// Size in bytes.
    pub size: usize,
    /// Mnemonic, including prefixes.
    pub mnemonic: String,
    pub class: InsClass,
    /// `true` if the instruction has an `fs` or `gs` segment override prefix.
    pub segment_prefix: bool,
    /// `false` if one of the memory operands has non-standard semantics (string operations with a
    /// repeat prefix, gathers and scatters, `xlat`, `xsave` and friends).
    pub standard_memop: bool,
    /// Number of memory operands read (0 to 2).
    pub memory_reads: u8,
    /// `true` if the instruction writes to memory.
    pub memory_write: bool,
    /// Register written by the instruction, only decoded for `RDRAND`.
    pub dest_reg: Option<GprRef>,
}

impl Ins {
    /// Creates an instruction without memory operands.
    pub fn new(addr: u64, size: usize, mnemonic: &str) -> Self {
        Self {
            addr,
            size,
            mnemonic: mnemonic.to_string(),
            class: InsClass::from_mnemonic(mnemonic),
            segment_prefix: false,
            standard_memop: true,
            memory_reads: 0,
            memory_write: false,
            dest_reg: None,
        }
    }

    pub fn with_reads(mut self, reads: u8) -> Self {
        self.memory_reads = reads.min(2);
        self
    }

    pub fn with_write(mut self) -> Self {
        self.memory_write = true;
        self
    }

    pub fn with_segment_prefix(mut self) -> Self {
        self.segment_prefix = true;
        self
    }

    pub fn with_nonstandard_memop(mut self) -> Self {
        self.standard_memop = false;
        self
    }

    pub fn with_dest(mut self, dest: GprRef) -> Self {
        self.dest_reg = Some(dest);
        self
    }

    /// Address of the next instruction.
    pub fn next_addr(&self) -> u64 {
        self.addr + self.size as u64
    }
}

/// A single-entry, single-exit sequence of instructions.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Bbl {
    pub addr: u64,
    pub insns: Vec<Ins>,
}

impl Bbl {
    /// Creates a basic block starting at the first instruction of `insns`.
    pub fn new(insns: Vec<Ins>) -> Self {
        Self {
            addr: insns.first().map(|i| i.addr).unwrap_or(0),
            insns,
        }
    }
}

// -----------------------------------------------------------------------------------------------
// Decoder
// -----------------------------------------------------------------------------------------------

const STRING_OPS: [&str; 5] = ["movs", "stos", "lods", "cmps", "scas"];

/// Decodes the instructions found in `code`, which is mapped at `addr`. Decoding stops at the
/// first invalid instruction.
pub fn decode(code: &[u8], addr: u64) -> Result<Vec<Ins>> {
    CSE.with(|cs| {
        let insns = cs.disasm_all(code, addr)?;
        insns.iter().map(|i| decode_one(cs, i)).collect()
    })
}

/// Decodes `code` and splits it into basic blocks. A block ends after every call, branch and
/// return.
pub fn decode_bbls(code: &[u8], addr: u64) -> Result<Vec<Bbl>> {
    let mut bbls = vec![];
    let mut current = vec![];
    for ins in decode(code, addr)? {
        let ends = ins.class.is_control_flow();
        current.push(ins);
        if ends {
            bbls.push(Bbl::new(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        bbls.push(Bbl::new(current));
    }
    Ok(bbls)
}

fn decode_one(cs: &Capstone, insn: &capstone::Insn) -> Result<Ins> {
    let mnemonic = insn.mnemonic().unwrap_or("");
    let mut ins = Ins::new(insn.address(), insn.len(), mnemonic);
    let base = base_mnemonic(mnemonic);
    let detail = cs.insn_detail(insn)?;
    let arch = detail.arch_detail();
    let x86 = match arch.x86() {
        Some(x86) => x86,
        None => return Ok(ins),
    };
    // Segment override prefixes are stored in the second prefix slot. Only `fs` and `gs` are
    // honored in 64-bit mode, the other ones are branch hints or `notrack`.
    ins.segment_prefix = matches!(x86.prefix()[1], 0x64 | 0x65);
    let no_access = ins.class == InsClass::Lea
        || base.starts_with("nop")
        || base.starts_with("prefetch")
        || base.starts_with("clflush");
    let mut reads = 0u8;
    let mut xmm_operand = false;
    for (idx, op) in x86.operands().enumerate() {
        match op.op_type {
            X86OperandType::Mem(mem) => {
                if mem.segment().0 != 0 {
                    let seg = cs.reg_name(mem.segment()).unwrap_or_default();
                    ins.segment_prefix |= seg == "fs" || seg == "gs";
                }
                if no_access {
                    continue;
                }
                match op.access {
                    Some(RegAccessType::WriteOnly) => ins.memory_write = true,
                    Some(RegAccessType::ReadWrite) => {
                        reads += 1;
                        ins.memory_write = true;
                    }
                    _ => reads += 1,
                }
            }
            X86OperandType::Reg(reg) => {
                let name = cs.reg_name(reg).unwrap_or_default();
                xmm_operand |= name.starts_with("xmm");
                if idx == 0 && ins.class == InsClass::Rdrand {
                    ins.dest_reg = Reg::from_name(&name);
                }
            }
            _ => {}
        }
    }
    // Returns implicitly read their target from the stack.
    if ins.class == InsClass::Ret {
        reads += 1;
    }
    ins.memory_reads = reads.min(2);
    let rep = matches!(x86.prefix()[0], 0xf2 | 0xf3) || mnemonic.starts_with("rep");
    let string_op = STRING_OPS.iter().any(|s| base.starts_with(s)) && !xmm_operand;
    ins.standard_memop = !((rep && string_op)
        || base.starts_with("xlat")
        || base.contains("gather")
        || base.contains("scatter")
        || base.starts_with("xsave")
        || base.starts_with("xrstor")
        || base.starts_with("fxsave")
        || base.starts_with("fxrstor"));
    Ok(ins)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(code: &[u8]) -> Ins {
        let insns = decode(code, 0x1000).unwrap();
        assert_eq!(insns.len(), 1);
        insns.into_iter().next().unwrap()
    }

    #[test]
    fn insn_classes() {
        assert_eq!(InsClass::from_mnemonic("popcnt"), InsClass::PushPop);
        assert_eq!(InsClass::from_mnemonic("pushfq"), InsClass::PushPop);
        assert_eq!(InsClass::from_mnemonic("jne"), InsClass::Branch);
        assert_eq!(InsClass::from_mnemonic("bnd jmp"), InsClass::Branch);
        assert_eq!(InsClass::from_mnemonic("RET"), InsClass::Ret);
        assert_eq!(InsClass::from_mnemonic("mov"), InsClass::Other);
        assert!(InsClass::Call.is_control_flow());
        assert!(!InsClass::Cpuid.is_control_flow());
    }

    #[test]
    fn insn_decode_memory_operands() {
        // mov eax, dword ptr [rbx]
        let i = one(&[0x8b, 0x03]);
        assert_eq!((i.memory_reads, i.memory_write), (1, false));
        // mov dword ptr [rbx], eax
        let i = one(&[0x89, 0x03]);
        assert_eq!((i.memory_reads, i.memory_write), (0, true));
        // add dword ptr [rbx], eax
        let i = one(&[0x01, 0x03]);
        assert_eq!((i.memory_reads, i.memory_write), (1, true));
        // lea rax, [rbx + rax]
        let i = one(&[0x48, 0x8d, 0x04, 0x03]);
        assert_eq!(i.class, InsClass::Lea);
        assert_eq!((i.memory_reads, i.memory_write), (0, false));
        // ret
        let i = one(&[0xc3]);
        assert_eq!((i.class, i.memory_reads), (InsClass::Ret, 1));
    }

    #[test]
    fn insn_decode_prefixes() {
        // mov rax, qword ptr fs:[0x28]
        let i = one(&[0x64, 0x48, 0x8b, 0x04, 0x25, 0x28, 0x00, 0x00, 0x00]);
        assert!(i.segment_prefix);
        // rep movsq
        let i = one(&[0xf3, 0x48, 0xa5]);
        assert!(!i.standard_memop);
        // movsq without a repeat prefix is a standard operation.
        let i = one(&[0x48, 0xa5]);
        assert!(i.standard_memop);
        assert!(!i.segment_prefix);
        // notrack jmp rax
        let i = one(&[0x3e, 0xff, 0xe0]);
        assert_eq!(i.class, InsClass::Branch);
        assert!(!i.segment_prefix);
        // ds-hinted jne
        let i = one(&[0x3e, 0x75, 0x02]);
        assert_eq!(i.class, InsClass::Branch);
        assert!(!i.segment_prefix);
        // mov eax, dword ptr gs:[rbx]
        assert!(one(&[0x65, 0x8b, 0x03]).segment_prefix);
    }

    #[test]
    fn insn_decode_rdrand() {
        let i = one(&[0x48, 0x0f, 0xc7, 0xf0]);
        assert_eq!(i.class, InsClass::Rdrand);
        assert_eq!(i.dest_reg, Some(GprRef::new(Reg::Rax, 8)));
        let i = one(&[0x0f, 0xc7, 0xf1]);
        assert_eq!(i.dest_reg, Some(GprRef::new(Reg::Rcx, 4)));
        let i = one(&[0x66, 0x0f, 0xc7, 0xf2]);
        assert_eq!(i.dest_reg, Some(GprRef::new(Reg::Rdx, 2)));
        assert_eq!(one(&[0x0f, 0xa2]).class, InsClass::Cpuid);
    }

    #[test]
    fn insn_decode_bbls() {
        // mov eax, [rbx]; je +2; mov [rbx], eax; ret
        let code = [0x8b, 0x03, 0x74, 0x02, 0x89, 0x03, 0xc3];
        let bbls = decode_bbls(&code, 0x400000).unwrap();
        assert_eq!(bbls.len(), 2);
        assert_eq!(bbls[0].addr, 0x400000);
        assert_eq!(bbls[0].insns.len(), 2);
        assert_eq!(bbls[0].insns[1].class, InsClass::Branch);
        assert_eq!(bbls[1].addr, 0x400004);
        assert_eq!(bbls[1].insns[1].class, InsClass::Ret);
        assert_eq!(bbls[1].insns[1].next_addr(), 0x400007);
    }
}
