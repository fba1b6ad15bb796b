//! Decides which probes are inserted for each basic block.
//!
//! # Planning Rules
//!
//! Instructions of a basic block are visited in order and the first matching rule applies:
//!
//!  1. instructions with a segment override prefix are ignored;
//!  2. `push*` and `pop*` instructions are ignored;
//!  3. `lea` is ignored;
//!  4. `CPUID` saves its inputs before execution and gets its outputs rewritten after;
//!  5. `RDRAND` gets its output rewritten after execution, if a fixed value is configured;
//!  6. calls record a taken branch to the runtime target before execution;
//!  7. jumps record a branch, taken or not, before execution;
//!  8. returns record a branch to the new instruction pointer when the transfer is taken, then
//!     go on with the next rule;
//!  9. in interesting images only, memory reads and writes through standard memory operands are
//!     recorded before execution.
//!
//! Control-flow is recorded in every image, so that the call stack of the target can be rebuilt
//! even when it goes through uninteresting libraries.
//!
//! Every recording probe is followed by a buffer-full check at the same point.

use crate::cpu::*;
use crate::error::*;
use crate::host::*;
use crate::image::*;
use crate::insn::*;
use crate::probes::*;

/// Inserts probes into basic blocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Planner {
    /// Buffer pointer scratch registers.
    pub regs: BufferRegs,
    /// Scratch register saving the `CPUID` input `EAX`.
    pub cpuid_eax: Reg,
    /// Scratch register saving the `CPUID` input `ECX`.
    pub cpuid_ecx: Reg,
    /// CPU model answered to `CPUID`.
    pub cpu_model: CpuModel,
    /// Value returned by `RDRAND`, if it is overridden.
    pub fixed_random: Option<u64>,
}

impl Planner {
    /// Instruments the basic blocks of a trace. Blocks that do not belong to a known image are
    /// skipped. Returns the number of probes inserted.
    pub fn instrument_trace<H: Host + ?Sized>(
        &self,
        host: &mut H,
        images: &Images,
        bbls: &[Bbl],
    ) -> usize {
        bbls.iter()
            .map(|bbl| match images.image_of(bbl.addr) {
                Some(image) => self.instrument_bbl(host, bbl, image.interesting),
                None => {
                    tracing::error!("{}", Error::from(ImageError::UnattributedBbl(bbl.addr)));
                    0
                }
            })
            .sum()
    }

    /// Instruments a single basic block. Returns the number of probes inserted.
    pub fn instrument_bbl<H: Host + ?Sized>(
        &self,
        host: &mut H,
        bbl: &Bbl,
        interesting: bool,
    ) -> usize {
        let mut count = 0;
        for ins in bbl.insns.iter() {
            if ins.segment_prefix {
                continue;
            }
            match ins.class {
                InsClass::PushPop | InsClass::Lea => continue,
                InsClass::Cpuid => {
                    host.insert_probe(
                        ins,
                        Probe::new(
                            IPoint::Before,
                            Action::SaveCpuidInput {
                                eax: self.cpuid_eax,
                                ecx: self.cpuid_ecx,
                            },
                        ),
                    );
                    host.insert_probe(
                        ins,
                        Probe::new(
                            IPoint::After,
                            Action::RewriteCpuid {
                                model: self.cpu_model,
                                eax: self.cpuid_eax,
                                ecx: self.cpuid_ecx,
                            },
                        ),
                    );
                    count += 2;
                    continue;
                }
                InsClass::Rdrand if self.fixed_random.is_some() => {
                    match (ins.dest_reg, self.fixed_random) {
                        (Some(dest), Some(value)) => {
                            host.insert_probe(
                                ins,
                                Probe::new(IPoint::After, Action::RewriteRdrand { dest, value }),
                            );
                            count += 1;
                        }
                        _ => tracing::warn!(
                            "Unknown RDRAND destination at {:#x}, output not replaced",
                            ins.addr
                        ),
                    }
                    continue;
                }
                InsClass::Call => {
                    count += self.record(host, ins, IPoint::Before, Record::Branch { is_call: true });
                    continue;
                }
                InsClass::Branch => {
                    count +=
                        self.record(host, ins, IPoint::Before, Record::Branch { is_call: false });
                    continue;
                }
                InsClass::Ret => {
                    count += self.record(host, ins, IPoint::TakenBranch, Record::Ret);
                }
                _ => {}
            }
            if !interesting || !ins.standard_memop {
                continue;
            }
            for operand in 0..ins.memory_reads.min(2) as usize {
                count += self.record(host, ins, IPoint::Before, Record::MemoryRead { operand });
            }
            if ins.memory_write {
                count += self.record(host, ins, IPoint::Before, Record::MemoryWrite);
            }
        }
        count
    }

    /// Inserts a record probe followed by a flush check. Returns the number of probes inserted.
    fn record<H: Host + ?Sized>(
        &self,
        host: &mut H,
        ins: &Ins,
        point: IPoint,
        record: Record,
    ) -> usize {
        host.insert_probe(ins, Probe::record(point, record, self.regs));
        host.insert_probe(ins, Probe::flush(point, self.regs));
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        probes: Vec<(u64, Probe)>,
    }

    impl Host for Recorder {
        fn claim_scratch_reg(&mut self) -> Option<Reg> {
            None
        }
        fn insert_probe(&mut self, ins: &Ins, probe: Probe) {
            self.probes.push((ins.addr, probe));
        }
        fn find_routine(&mut self, _: &ImageInfo, _: &str) -> Option<Routine> {
            None
        }
        fn insert_routine_probe(&mut self, _: Routine, _: Probe) -> Result<()> {
            Ok(())
        }
    }

    fn planner(fixed_random: Option<u64>) -> Planner {
        Planner {
            regs: BufferRegs {
                next: Reg::Scratch(0),
                end: Reg::Scratch(1),
            },
            cpuid_eax: Reg::Scratch(2),
            cpuid_ecx: Reg::Scratch(3),
            cpu_model: CpuModel::Default,
            fixed_random,
        }
    }

    #[test]
    fn planner_skipped_instructions() {
        let bbl = Bbl::new(vec![
            Ins::new(0x10, 1, "push").with_write(),
            Ins::new(0x11, 1, "pop").with_reads(1),
            Ins::new(0x12, 4, "popcnt").with_reads(1),
            Ins::new(0x16, 4, "lea"),
            Ins::new(0x1a, 9, "mov").with_reads(1).with_segment_prefix(),
            Ins::new(0x23, 3, "rep movsq")
                .with_reads(1)
                .with_write()
                .with_nonstandard_memop(),
        ]);
        let mut host = Recorder::default();
        assert_eq!(planner(None).instrument_bbl(&mut host, &bbl, true), 0);
        assert!(host.probes.is_empty());
    }

    #[test]
    fn planner_memory_only_in_interesting_images() {
        let bbl = Bbl::new(vec![
            Ins::new(0x10, 3, "add").with_reads(2).with_write(),
            Ins::new(0x13, 1, "ret").with_reads(1),
        ]);
        let p = planner(None);
        let mut host = Recorder::default();
        assert_eq!(p.instrument_bbl(&mut host, &bbl, true), 10);
        let points: Vec<_> = host.probes.iter().map(|(a, p)| (*a, p.point)).collect();
        assert_eq!(points[6], (0x13, IPoint::TakenBranch));
        assert_eq!(points[8], (0x13, IPoint::Before));
        assert_eq!(
            host.probes[8].1.action,
            Action::Record {
                record: Record::MemoryRead { operand: 0 },
                regs: p.regs
            }
        );

        let mut host = Recorder::default();
        assert_eq!(p.instrument_bbl(&mut host, &bbl, false), 2);
        assert_eq!(
            host.probes[0].1.action,
            Action::Record {
                record: Record::Ret,
                regs: p.regs
            }
        );
        assert_eq!(
            host.probes[1].1.predicate,
            Some(Predicate::BufferFull {
                next: p.regs.next,
                end: p.regs.end
            })
        );
    }

    #[test]
    fn planner_cpuid_and_rdrand() {
        let rdrand = Ins::new(0x12, 4, "rdrand").with_dest(GprRef::new(Reg::Rax, 8));
        let bbl = Bbl::new(vec![Ins::new(0x10, 2, "cpuid"), rdrand]);
        let mut host = Recorder::default();
        assert_eq!(planner(None).instrument_bbl(&mut host, &bbl, false), 2);
        let mut host = Recorder::default();
        assert_eq!(planner(Some(7)).instrument_bbl(&mut host, &bbl, false), 3);
        assert_eq!(
            host.probes[2].1,
            Probe::new(
                IPoint::After,
                Action::RewriteRdrand {
                    dest: GprRef::new(Reg::Rax, 8),
                    value: 7
                }
            )
        );
    }

    #[test]
    fn planner_unattributed_bbl() {
        let mut images = Images::new(&[".exe"]).unwrap();
        images
            .register(&ImageInfo::new("a.exe", 0x1000, 0x1fff))
            .unwrap();
        let bbls = [
            Bbl::new(vec![Ins::new(0x1000, 5, "call")]),
            Bbl::new(vec![Ins::new(0x9000, 5, "call")]),
        ];
        let mut host = Recorder::default();
        assert_eq!(planner(None).instrument_trace(&mut host, &images, &bbls), 2);
    }
}
