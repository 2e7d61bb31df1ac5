//! Random instruction sequences.

use std::collections::VecDeque;

use rand::Rng;

use crate::isa::{Format, Operands, Spec, WORD};
use crate::resource::{Claim, ClaimItem, ClaimSpec, Namespace, ResourceId};

use super::float::set_fprs_plan;
use super::loadgpr::load_gpr_plan;
use super::{GenData, InstrItem, SeqCtx, Sequence};

/// Fallback operand pool when no claim was injected (engine-driven use).
const FALLBACK_GPRS: [u8; 4] = [5, 6, 7, 28];

/// How often the register refresh prologue is re-emitted.
const REFRESH_PERIOD: usize = 100;

fn pick<T: Copy>(rng: &mut rand::rngs::StdRng, pool: &[T]) -> T {
    pool[rng.gen_range(0..pool.len())]
}

fn sample_imm(rng: &mut rand::rngs::StdRng, spec: &Spec) -> i64 {
    match spec.format {
        Format::I => rng.gen_range(-2048i64..2048),
        Format::Shift => {
            if spec.flags & WORD != 0 {
                rng.gen_range(0i64..32)
            } else {
                rng.gen_range(0i64..64)
            }
        }
        Format::U => rng.gen_range(0i64..(1 << 20)),
        _ => 0,
    }
}

/// Base-ISA arithmetic and logic instructions with operands drawn from the
/// claimed registers. Loads, stores, branches, CSR and privileged forms are
/// never produced.
pub struct RandomSafeInstrs {
    length: usize,
    produced: usize,
    regs: Vec<u8>,
    queue: VecDeque<GenData>,
}

impl RandomSafeInstrs {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            produced: 0,
            regs: FALLBACK_GPRS.to_vec(),
            queue: VecDeque::new(),
        }
    }
}

impl Sequence for RandomSafeInstrs {
    fn name(&self) -> &'static str {
        "RandomSafeInstrs"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(4)
    }

    fn set_claim(&mut self, claim: &Claim) {
        let gprs = claim.exclusive_gprs();
        if !gprs.is_empty() {
            self.regs = gprs;
        }
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        let name = self.name();
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.produced >= self.length {
                return None;
            }
            if self.produced % REFRESH_PERIOD == 0 {
                // Re-seed the working registers with fresh values.
                for reg in self.regs.clone() {
                    let value = match ctx.rng.gen_range(0u32..3) {
                        0 => ctx.rng.gen::<u64>(),
                        1 => 0,
                        _ => 0xDEAD_BEEF,
                    };
                    self.queue
                        .extend(load_gpr_plan(ctx.catalog, reg, value, name));
                }
            }
            self.produced += 1;

            let safe = ctx.catalog.forms_where(|s| s.is_safe());
            let spec = pick(ctx.rng, &safe);
            let ops = Operands {
                rd: pick(ctx.rng, &self.regs),
                rs1: pick(ctx.rng, &self.regs),
                rs2: pick(ctx.rng, &self.regs),
                imm: sample_imm(ctx.rng, spec),
            };
            self.queue.push_back(GenData::Instr(InstrItem::new(
                spec,
                ops,
                name,
                crate::isa::asm(ctx.catalog, spec, ops),
            )));
        }
    }
}

/// Random float arithmetic with a periodic FPR refresh prologue.
pub struct RandomFloatInstrs {
    length: usize,
    produced: usize,
    queue: VecDeque<GenData>,
}

impl RandomFloatInstrs {
    pub fn new(length: usize) -> Self {
        Self {
            length,
            produced: 0,
            queue: VecDeque::new(),
        }
    }
}

impl Sequence for RandomFloatInstrs {
    fn name(&self) -> &'static str {
        "RandomFloatInstrs"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(1))],
            shared: vec![ClaimItem::Any {
                namespace: Namespace::Fpr,
                count: 32,
            }],
        }
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        let name = self.name();
        loop {
            if let Some(item) = self.queue.pop_front() {
                return Some(item);
            }
            if self.produced >= self.length {
                return None;
            }
            if self.produced % REFRESH_PERIOD == 0 {
                if let Some(plan) = set_fprs_plan(ctx, 0.5, name) {
                    self.queue.extend(plan);
                }
            }
            self.produced += 1;

            let floats = ctx
                .catalog
                .forms_where(|s| s.is_float() && !s.is_load());
            let spec = pick(ctx.rng, &floats);
            let ops = Operands {
                rd: ctx.rng.gen_range(0..32),
                rs1: ctx.rng.gen_range(0..32),
                rs2: ctx.rng.gen_range(0..32),
                imm: 0,
            };
            self.queue.push_back(GenData::Instr(InstrItem::new(
                spec,
                ops,
                name,
                crate::isa::asm(ctx.catalog, spec, ops),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::isa::Catalog;
    use crate::layout::AddressMap;
    use crate::memory::MemoryStore;
    use crate::model::ExecutionState;
    use crate::resource::{Reserver, ResourceSpace};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn drain(seq: &mut dyn Sequence, n_max: usize) -> Vec<GenData> {
        let catalog = Catalog::new();
        let cfg = MemoryConfig::default_config();
        let mut store = MemoryStore::new(AddressMap::from_config(&cfg).unwrap());
        let mut rng = StdRng::seed_from_u64(3);
        let state = ExecutionState::new();
        let mut reserver = Reserver::new(ResourceSpace::for_catalog(&catalog));
        let mut out = Vec::new();
        for _ in 0..n_max {
            let mut ctx = SeqCtx {
                rng: &mut rng,
                store: &mut store,
                state: &state,
                catalog: &catalog,
                reserver: &mut reserver,
                pc: 0x8000_0000,
            };
            match seq.next(&mut ctx) {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    #[test]
    fn safe_instrs_avoid_unsafe_forms() {
        let mut seq = RandomSafeInstrs::new(50);
        let items = drain(&mut seq, 10_000);
        assert!(items.len() >= 50);
        for item in &items {
            let GenData::Instr(instr) = item else {
                panic!("safe sequence produced a non-instruction item");
            };
            assert!(
                instr.spec.is_safe() || instr.seq == "RandomSafeInstrs",
                "unexpected form {}",
                instr.spec.mnemonic
            );
            assert!(!instr.spec.is_load());
            assert!(!instr.spec.is_store());
            assert!(!instr.spec.is_branch());
            assert!(!instr.spec.is_jump());
            assert!(!instr.spec.is_csr());
        }
    }

    #[test]
    fn safe_instrs_write_only_claimed_or_fallback_registers() {
        let mut seq = RandomSafeInstrs::new(30);
        let items = drain(&mut seq, 10_000);
        for item in items {
            let GenData::Instr(instr) = item else { continue };
            if instr.spec.has_gpr_dest() {
                assert!(
                    FALLBACK_GPRS.contains(&instr.ops.rd) || instr.ops.rd == 0,
                    "wrote unclaimed x{}",
                    instr.ops.rd
                );
            }
        }
    }

    #[test]
    fn sequences_are_finite() {
        let mut seq = RandomSafeInstrs::new(5);
        let items = drain(&mut seq, 10_000);
        // refresh prologue plus five random instructions, then exhaustion
        assert!(items.len() < 100);
    }
}
