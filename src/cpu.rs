//! Overrides the CPU features and random numbers observed by the target.
//!
//! # CPU Models
//!
//! Code paths of the target often depend on the features of the CPU it runs on (e.g. AES-NI
//! or AVX implementations of cryptographic primitives). To compare traces recorded on different
//! machines, the result of every `CPUID` instruction can be replaced by the answer of a fixed CPU
//! model. The host CPU should support every feature advertised by the selected model, otherwise
//! the target might execute instructions the machine does not have; [`check_host_superset`] warns
//! about such features.
//!
//! Each model is described by a table of leaves. A lookup of `(leaf, subleaf)` returns:
//!
//!  * the entry matching both `leaf` and `subleaf`;
//!  * otherwise the entry for `leaf` that does not depend on the subleaf;
//!  * otherwise zeros.
//!
//! Like Intel processors, leaves above the model's maximum basic or extended leaf return the data
//! of the highest basic leaf.
//!
//! # Random Numbers
//!
//! `RDRAND` results can be replaced by a fixed value. The instruction is always reported as
//! successful (`CF = 1`), so retry loops run the same number of times on every execution.

use std::fmt;

use bitfield::bitfield;

use crate::error::*;
use crate::host::*;

/// Default value of the fixed `RDRAND` output option. This value disables the override.
pub const RDRAND_SENTINEL: u64 = 0xBADBADBADBADBAD;

// -----------------------------------------------------------------------------------------------
// Models
// -----------------------------------------------------------------------------------------------

/// CPU models that can be emulated through `CPUID`.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum CpuModel {
    /// `CPUID` results are left untouched.
    #[default]
    Default = 0,
    /// Intel Pentium III (Coppermine).
    Pentium3 = 1,
    /// Intel Core 2 (Merom).
    Merom = 2,
    /// Intel Xeon (Westmere-EP).
    Westmere = 3,
    /// Intel Core i7 (Ivy Bridge).
    IvyBridge = 4,
}

impl TryFrom<u32> for CpuModel {
    type Error = Error;

    fn try_from(level: u32) -> Result<Self> {
        match level {
            0 => Ok(Self::Default),
            1 => Ok(Self::Pentium3),
            2 => Ok(Self::Merom),
            3 => Ok(Self::Westmere),
            4 => Ok(Self::IvyBridge),
            l => Err(ConfigError::InvalidCpuModel(l))?,
        }
    }
}

impl fmt::Display for CpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuModel::Default => "Default",
            CpuModel::Pentium3 => "Pentium3",
            CpuModel::Merom => "Merom",
            CpuModel::Westmere => "Westmere",
            CpuModel::IvyBridge => "Ivybridge",
        };
        write!(f, "{}", name)
    }
}

impl CpuModel {
    fn table(&self) -> Option<&'static ModelTable> {
        match self {
            CpuModel::Default => None,
            CpuModel::Pentium3 => Some(&PENTIUM3),
            CpuModel::Merom => Some(&MEROM),
            CpuModel::Westmere => Some(&WESTMERE),
            CpuModel::IvyBridge => Some(&IVYBRIDGE),
        }
    }

    /// Answers `CPUID(leaf, subleaf)` as the model would. Returns `None` for
    /// [`CpuModel::Default`].
    pub fn cpuid(&self, leaf: u32, subleaf: u32) -> Option<CpuidRegs> {
        self.table().map(|t| t.lookup(leaf, subleaf))
    }
}

/// Output registers of a `CPUID` instruction.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidRegs {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }

    /// Reads the low 32 bits of `RAX`, `RBX`, `RCX` and `RDX`.
    pub fn read<C: ExecContext + ?Sized>(ctx: &C) -> Self {
        Self {
            eax: ctx.reg(Reg::Rax) as u32,
            ebx: ctx.reg(Reg::Rbx) as u32,
            ecx: ctx.reg(Reg::Rcx) as u32,
            edx: ctx.reg(Reg::Rdx) as u32,
        }
    }

    /// Writes the registers back, zero-extended to 64 bits.
    pub fn write<C: ExecContext + ?Sized>(&self, ctx: &mut C) {
        ctx.set_reg(Reg::Rax, self.eax as u64);
        ctx.set_reg(Reg::Rbx, self.ebx as u64);
        ctx.set_reg(Reg::Rcx, self.ecx as u64);
        ctx.set_reg(Reg::Rdx, self.edx as u64);
    }
}

/// Replaces the output of a `CPUID` instruction executed with inputs `eax_in` and `ecx_in` by the
/// answer of `model`. Outputs are left untouched for [`CpuModel::Default`].
pub fn change_cpuid(model: CpuModel, eax_in: u32, ecx_in: u32, regs: &mut CpuidRegs) {
    if let Some(out) = model.cpuid(eax_in, ecx_in) {
        *regs = out;
    }
}

// -----------------------------------------------------------------------------------------------
// Leaf tables
// -----------------------------------------------------------------------------------------------

/// A single `CPUID` leaf. `subleaf` is `None` when the output does not depend on `ECX`.
struct Leaf {
    leaf: u32,
    subleaf: Option<u32>,
    regs: CpuidRegs,
}

const fn leaf(leaf: u32, eax: u32, ebx: u32, ecx: u32, edx: u32) -> Leaf {
    Leaf {
        leaf,
        subleaf: None,
        regs: CpuidRegs::new(eax, ebx, ecx, edx),
    }
}

const fn subleaf(leaf: u32, subleaf: u32, eax: u32, ebx: u32, ecx: u32, edx: u32) -> Leaf {
    Leaf {
        leaf,
        subleaf: Some(subleaf),
        regs: CpuidRegs::new(eax, ebx, ecx, edx),
    }
}

/// Pads a brand string with NUL bytes.
const fn brand(name: &str) -> [u8; 48] {
    let bytes = name.as_bytes();
    let mut out = [0; 48];
    let mut i = 0;
    while i < bytes.len() && i < 47 {
        out[i] = bytes[i];
        i += 1;
    }
    out
}

/// Returns one of the three brand string leaves (`0x80000002` to `0x80000004`).
const fn brand_leaf(brand: &[u8; 48], part: u32) -> Leaf {
    const fn word(b: &[u8; 48], o: usize) -> u32 {
        (b[o] as u32) | (b[o + 1] as u32) << 8 | (b[o + 2] as u32) << 16 | (b[o + 3] as u32) << 24
    }
    let o = part as usize * 16;
    leaf(
        0x8000_0002 + part,
        word(brand, o),
        word(brand, o + 4),
        word(brand, o + 8),
        word(brand, o + 12),
    )
}

/// "GenuineIntel", split across `EBX`, `EDX` and `ECX`.
const VENDOR_EBX: u32 = 0x756e_6547;
const VENDOR_EDX: u32 = 0x4965_6e69;
const VENDOR_ECX: u32 = 0x6c65_746e;

struct ModelTable {
    max_basic: u32,
    max_extended: u32,
    leaves: &'static [Leaf],
}

impl ModelTable {
    fn lookup(&self, leaf: u32, subleaf: u32) -> CpuidRegs {
        let leaf = if leaf < 0x8000_0000 {
            leaf.min(self.max_basic)
        } else if leaf > self.max_extended {
            self.max_basic
        } else {
            leaf
        };
        self.leaves
            .iter()
            .find(|l| l.leaf == leaf && l.subleaf == Some(subleaf))
            .or_else(|| {
                self.leaves
                    .iter()
                    .find(|l| l.leaf == leaf && l.subleaf.is_none())
            })
            .map(|l| l.regs)
            .unwrap_or_default()
    }

    /// Feature bits advertised by the model: leaf 1 `ECX`/`EDX` and leaf 7 `EBX`/`ECX`/`EDX`.
    fn features(&self) -> [(&'static str, u32); 5] {
        let l1 = self.lookup(1, 0);
        let l7 = if self.max_basic >= 7 {
            self.lookup(7, 0)
        } else {
            CpuidRegs::default()
        };
        [
            ("leaf 1 ecx", l1.ecx),
            ("leaf 1 edx", l1.edx),
            ("leaf 7 ebx", l7.ebx),
            ("leaf 7 ecx", l7.ecx),
            ("leaf 7 edx", l7.edx),
        ]
    }
}

const MEROM_BRAND: [u8; 48] = brand("Intel(R) Core(TM)2 CPU         T7200  @ 2.00GHz");
const WESTMERE_BRAND: [u8; 48] = brand("Intel(R) Xeon(R) CPU           X5670  @ 2.93GHz");
const IVYBRIDGE_BRAND: [u8; 48] = brand("Intel(R) Core(TM) i7-3770 CPU @ 3.40GHz");

static PENTIUM3: ModelTable = ModelTable {
    max_basic: 0x2,
    max_extended: 0,
    leaves: &[
        leaf(0x0, 0x2, VENDOR_EBX, VENDOR_ECX, VENDOR_EDX),
        leaf(0x1, 0x683, 0, 0, 0x0383_fbff),
        leaf(0x2, 0x0302_0101, 0, 0, 0x0c04_0882),
    ],
};

static MEROM: ModelTable = ModelTable {
    max_basic: 0xa,
    max_extended: 0x8000_0008,
    leaves: &[
        leaf(0x0, 0xa, VENDOR_EBX, VENDOR_ECX, VENDOR_EDX),
        leaf(0x1, 0x6f6, 0x0002_0800, 0xe3bd, 0xbfeb_fbff),
        leaf(0x2, 0x05b0_b101, 0x0056_57f0, 0, 0x2cb4_3049),
        subleaf(0x4, 0, 0x0400_0121, 0x01c0_003f, 0x3f, 0x1),
        subleaf(0x4, 1, 0x0400_0122, 0x01c0_003f, 0x3f, 0x1),
        subleaf(0x4, 2, 0x0400_4143, 0x03c0_003f, 0xfff, 0x1),
        leaf(0x5, 0x40, 0x40, 0x3, 0x0002_2220),
        leaf(0x6, 0x1, 0x2, 0x1, 0),
        leaf(0xa, 0x0728_0202, 0, 0, 0x503),
        leaf(0x8000_0000, 0x8000_0008, 0, 0, 0),
        leaf(0x8000_0001, 0, 0, 0x1, 0x2010_0800),
        brand_leaf(&MEROM_BRAND, 0),
        brand_leaf(&MEROM_BRAND, 1),
        brand_leaf(&MEROM_BRAND, 2),
        leaf(0x8000_0006, 0, 0, 0x1000_8040, 0),
        leaf(0x8000_0008, 0x3024, 0, 0, 0),
    ],
};

static WESTMERE: ModelTable = ModelTable {
    max_basic: 0xb,
    max_extended: 0x8000_0008,
    leaves: &[
        leaf(0x0, 0xb, VENDOR_EBX, VENDOR_ECX, VENDOR_EDX),
        leaf(0x1, 0x206c2, 0x0020_0800, 0x029e_e3ff, 0xbfeb_fbff),
        leaf(0x2, 0x5503_5a01, 0x00f0_b2ff, 0, 0x00ca_0000),
        subleaf(0x4, 0, 0x1c00_4121, 0x01c0_003f, 0x3f, 0),
        subleaf(0x4, 1, 0x1c00_4122, 0x00c0_003f, 0x7f, 0),
        subleaf(0x4, 2, 0x1c00_4143, 0x01c0_003f, 0x1ff, 0),
        subleaf(0x4, 3, 0x1c03_c163, 0x02c0_003f, 0x2fff, 0x2),
        leaf(0x5, 0x40, 0x40, 0x3, 0x1120),
        leaf(0x6, 0x7, 0x2, 0x9, 0),
        leaf(0xa, 0x0730_0403, 0, 0, 0x603),
        subleaf(0xb, 0, 0x1, 0x2, 0x100, 0),
        subleaf(0xb, 1, 0x5, 0xc, 0x201, 0),
        leaf(0x8000_0000, 0x8000_0008, 0, 0, 0),
        leaf(0x8000_0001, 0, 0, 0x1, 0x2c10_0800),
        brand_leaf(&WESTMERE_BRAND, 0),
        brand_leaf(&WESTMERE_BRAND, 1),
        brand_leaf(&WESTMERE_BRAND, 2),
        leaf(0x8000_0006, 0, 0, 0x0100_6040, 0),
        leaf(0x8000_0007, 0, 0, 0, 0x100),
        leaf(0x8000_0008, 0x3028, 0, 0, 0),
    ],
};

static IVYBRIDGE: ModelTable = ModelTable {
    max_basic: 0xd,
    max_extended: 0x8000_0008,
    leaves: &[
        leaf(0x0, 0xd, VENDOR_EBX, VENDOR_ECX, VENDOR_EDX),
        leaf(0x1, 0x306a9, 0x0010_0800, 0x7fba_e3ff, 0xbfeb_fbff),
        leaf(0x2, 0x7603_5a01, 0x00f0_b0ff, 0, 0x00ca_0000),
        subleaf(0x4, 0, 0x1c00_4121, 0x01c0_003f, 0x3f, 0),
        subleaf(0x4, 1, 0x1c00_4122, 0x01c0_003f, 0x3f, 0),
        subleaf(0x4, 2, 0x1c00_4143, 0x01c0_003f, 0x1ff, 0),
        subleaf(0x4, 3, 0x1c03_c163, 0x03c0_003f, 0x1fff, 0x6),
        leaf(0x5, 0x40, 0x40, 0x3, 0x1120),
        leaf(0x6, 0x77, 0x2, 0x9, 0),
        subleaf(0x7, 0, 0, 0x281, 0, 0),
        leaf(0xa, 0x0730_0803, 0, 0, 0x603),
        subleaf(0xb, 0, 0x1, 0x2, 0x100, 0),
        subleaf(0xb, 1, 0x4, 0x8, 0x201, 0),
        subleaf(0xd, 0, 0x7, 0x340, 0x340, 0),
        subleaf(0xd, 1, 0x1, 0, 0, 0),
        subleaf(0xd, 2, 0x100, 0x240, 0, 0),
        leaf(0x8000_0000, 0x8000_0008, 0, 0, 0),
        leaf(0x8000_0001, 0, 0, 0x1, 0x2810_0800),
        brand_leaf(&IVYBRIDGE_BRAND, 0),
        brand_leaf(&IVYBRIDGE_BRAND, 1),
        brand_leaf(&IVYBRIDGE_BRAND, 2),
        leaf(0x8000_0006, 0, 0, 0x0100_6040, 0),
        leaf(0x8000_0007, 0, 0, 0, 0x100),
        leaf(0x8000_0008, 0x3024, 0, 0, 0),
    ],
};

// -----------------------------------------------------------------------------------------------
// Host check
// -----------------------------------------------------------------------------------------------

/// Returns the feature bits `model` advertises but the host CPU lacks, as `(register, bits)`
/// pairs. Always empty for [`CpuModel::Default`] and on non-x86-64 hosts.
pub fn missing_host_features(model: CpuModel) -> Vec<(&'static str, u32)> {
    let table = match model.table() {
        Some(t) => t,
        None => return vec![],
    };
    let host = host_features();
    table
        .features()
        .iter()
        .zip(host.iter())
        .filter_map(|((name, wanted), have)| {
            let missing = wanted & !have;
            if missing != 0 {
                Some((*name, missing))
            } else {
                None
            }
        })
        .collect()
}

/// Logs a warning for every feature of `model` the host CPU does not support.
pub fn check_host_superset(model: CpuModel) {
    for (name, bits) in missing_host_features(model) {
        tracing::warn!(
            "CPU model {} advertises features missing on this host ({}: {:#010x})",
            model,
            name,
            bits
        );
    }
}

#[cfg(target_arch = "x86_64")]
// `__cpuid` is a safe function on recent toolchains.
#[allow(unused_unsafe)]
fn host_features() -> [u32; 5] {
    use std::arch::x86_64::{CpuidResult, __cpuid, __cpuid_count};
    // SAFETY: `CPUID` is always available on x86-64.
    let (max, l1) = unsafe { (__cpuid(0).eax, __cpuid(1)) };
    let l7 = if max >= 7 {
        // SAFETY: leaf 7 is supported, as checked above.
        unsafe { __cpuid_count(7, 0) }
    } else {
        CpuidResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        }
    };
    [l1.ecx, l1.edx, l7.ebx, l7.ecx, l7.edx]
}

#[cfg(not(target_arch = "x86_64"))]
fn host_features() -> [u32; 5] {
    [u32::MAX; 5]
}

// -----------------------------------------------------------------------------------------------
// RDRAND
// -----------------------------------------------------------------------------------------------

bitfield! {
    /// Arithmetic flags of the `RFLAGS` register.
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct Rflags(u64);
    impl Debug;
    pub get_cf, set_cf: 0;
    pub get_pf, set_pf: 2;
    pub get_af, set_af: 4;
    pub get_zf, set_zf: 6;
    pub get_sf, set_sf: 7;
    pub get_of, set_of: 11;
}

/// Replaces the result of an `RDRAND` instruction writing `dest` by `value` and reports it as
/// successful.
pub fn rewrite_rdrand<C: ExecContext + ?Sized>(ctx: &mut C, dest: GprRef, value: u64) {
    dest.write(ctx, value);
    let mut flags = Rflags(ctx.reg(Reg::Rflags));
    flags.set_cf(true);
    flags.set_pf(false);
    flags.set_af(false);
    flags.set_zf(false);
    flags.set_sf(false);
    flags.set_of(false);
    ctx.set_reg(Reg::Rflags, flags.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_model_levels() {
        assert_eq!(CpuModel::try_from(0), Ok(CpuModel::Default));
        assert_eq!(CpuModel::try_from(4), Ok(CpuModel::IvyBridge));
        assert_eq!(
            CpuModel::try_from(5),
            Err(Error::Config(ConfigError::InvalidCpuModel(5)))
        );
    }

    #[test]
    fn cpu_default_is_untouched() {
        let mut regs = CpuidRegs::new(1, 2, 3, 4);
        change_cpuid(CpuModel::Default, 1, 0, &mut regs);
        assert_eq!(regs, CpuidRegs::new(1, 2, 3, 4));
        assert!(missing_host_features(CpuModel::Default).is_empty());
    }

    #[test]
    fn cpu_host_superset() {
        let advertised = IVYBRIDGE.features();
        for (name, bits) in missing_host_features(CpuModel::IvyBridge) {
            assert_ne!(bits, 0);
            let (_, wanted) = advertised.iter().find(|(n, _)| *n == name).unwrap();
            assert_eq!(bits & !wanted, 0);
        }
    }

    #[test]
    fn cpu_vendor_and_signature() {
        for model in [
            CpuModel::Pentium3,
            CpuModel::Merom,
            CpuModel::Westmere,
            CpuModel::IvyBridge,
        ] {
            let l0 = model.cpuid(0, 0).unwrap();
            let mut vendor = vec![];
            vendor.extend_from_slice(&l0.ebx.to_le_bytes());
            vendor.extend_from_slice(&l0.edx.to_le_bytes());
            vendor.extend_from_slice(&l0.ecx.to_le_bytes());
            assert_eq!(vendor, b"GenuineIntel");
        }
        assert_eq!(CpuModel::Westmere.cpuid(1, 0).unwrap().eax, 0x206c2);
        // No RDRAND before Ivy Bridge.
        assert_eq!(CpuModel::Westmere.cpuid(1, 0).unwrap().ecx & (1 << 30), 0);
        assert_ne!(CpuModel::IvyBridge.cpuid(1, 0).unwrap().ecx & (1 << 30), 0);
    }

    #[test]
    fn cpu_leaf_lookup() {
        let m = CpuModel::IvyBridge;
        // Subleaf-specific entries.
        assert_eq!(m.cpuid(4, 3).unwrap().ecx, 0x1fff);
        assert_eq!(m.cpuid(4, 4).unwrap(), CpuidRegs::default());
        // Subleaf-independent entries ignore ECX.
        assert_eq!(m.cpuid(1, 0x1234), m.cpuid(1, 0));
        // Out of range leaves return the highest basic leaf.
        assert_eq!(m.cpuid(0x20, 0), m.cpuid(0xd, 0));
        assert_eq!(m.cpuid(0x8000_0010, 0), m.cpuid(0xd, 0));
        assert_eq!(CpuModel::Pentium3.cpuid(0x8000_0000, 0), CpuModel::Pentium3.cpuid(2, 0));
        // Missing leaves below the maximum are zeros.
        assert_eq!(m.cpuid(0x3, 0).unwrap(), CpuidRegs::default());
    }

    #[test]
    fn cpu_brand_string() {
        let m = CpuModel::IvyBridge;
        let mut brand = vec![];
        for l in 0x8000_0002..=0x8000_0004 {
            let r = m.cpuid(l, 0).unwrap();
            for v in [r.eax, r.ebx, r.ecx, r.edx] {
                brand.extend_from_slice(&v.to_le_bytes());
            }
        }
        let end = brand.iter().position(|b| *b == 0).unwrap();
        assert_eq!(
            std::str::from_utf8(&brand[..end]).unwrap(),
            "Intel(R) Core(TM) i7-3770 CPU @ 3.40GHz"
        );
    }

    #[test]
    fn cpu_rflags_bits() {
        let mut flags = Rflags(0xfff);
        flags.set_cf(false);
        flags.set_of(false);
        assert_eq!(flags.0, 0x7fe);
    }
}
