//! Relative branch and absolute jump sequences.

use std::collections::VecDeque;

use log::debug;
use rand::Rng;

use crate::isa::{Op, Operands, Spec};
use crate::resource::{Claim, ClaimSpec};

use super::loadgpr::load_gpr_plan;
use super::{GenData, InstrItem, SeqCtx, Sequence};

/// Reservation window for a branch landing pad.
const TARGET_WINDOW: u64 = 64;

const BRANCHES: [Op; 6] = [Op::Beq, Op::Bne, Op::Blt, Op::Bge, Op::Bltu, Op::Bgeu];

/// Comparand values forcing the chosen direction. Small non-negative values
/// keep signed and unsigned comparisons in agreement.
fn comparands(rng: &mut rand::rngs::StdRng, spec: &Spec, taken: bool) -> (u64, u64) {
    let v = rng.gen_range(0u64..1000);
    let delta = rng.gen_range(1u64..100);
    match (spec.mnemonic, taken) {
        ("beq", true) => (v, v),
        ("beq", false) => (v, v + delta),
        ("bne", true) => (v, v + delta),
        ("bne", false) => (v, v),
        ("blt", true) | ("bltu", true) => (v, v + delta),
        ("blt", false) | ("bltu", false) => (v + delta, v),
        ("bge", true) | ("bgeu", true) => (v + delta, v),
        _ => (v, v + delta),
    }
}

enum Stage {
    Init,
    Setup,
    Branch,
    Done,
}

/// A conditional branch with a pre-reserved in-range landing pad. The
/// comparand registers are loaded first so the direction is known.
pub struct RelativeBranching {
    stage: Stage,
    queue: VecDeque<GenData>,
    claim: Option<Claim>,
    branch: Option<(&'static Spec, u8, u8)>,
    target: Option<u64>,
}

impl RelativeBranching {
    pub fn new() -> Self {
        Self {
            stage: Stage::Init,
            queue: VecDeque::new(),
            claim: None,
            branch: None,
            target: None,
        }
    }

    fn regs(&self) -> (u8, u8) {
        match &self.claim {
            Some(c) => match c.exclusive_gprs().as_slice() {
                [a, b, ..] => (*a, *b),
                _ => (5, 6),
            },
            None => (5, 6),
        }
    }
}

impl Default for RelativeBranching {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for RelativeBranching {
    fn name(&self) -> &'static str {
        "RelativeBranching"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(2)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        loop {
            match self.stage {
                Stage::Init => {
                    let op = BRANCHES[ctx.rng.gen_range(0..BRANCHES.len())];
                    let spec = ctx.catalog.spec(op);
                    let (rs1, rs2) = self.regs();
                    let taken = ctx.rng.gen_bool(0.5);
                    let (v1, v2) = comparands(ctx.rng, spec, taken);
                    let name = self.name();
                    self.queue = load_gpr_plan(ctx.catalog, rs1, v1, name).into();
                    self.queue
                        .extend(load_gpr_plan(ctx.catalog, rs2, v2, name));
                    self.branch = Some((spec, rs1, rs2));
                    self.stage = Stage::Setup;
                }
                Stage::Setup => {
                    if let Some(item) = self.queue.pop_front() {
                        return Some(item);
                    }
                    // The branch will sit at the current PC; its landing pad
                    // must not cover the branch itself.
                    let (spec, ..) = self.branch?;
                    let pc = ctx.pc;
                    let (min_off, max_off) = spec.offset_range()?;
                    let mut target =
                        ctx.store
                            .find_free_code(ctx.rng, TARGET_WINDOW, 4, Some(pc), Some((min_off, max_off)));
                    if let Some(t) = target {
                        if t <= pc && pc < t + TARGET_WINDOW {
                            target = ctx.store.find_free_code(
                                ctx.rng,
                                TARGET_WINDOW,
                                4,
                                Some(pc),
                                Some((4, max_off)),
                            );
                        }
                    }
                    let Some(target) = target else {
                        debug!("{}: no in-range landing pad", self.name());
                        self.stage = Stage::Done;
                        return None;
                    };
                    self.target = Some(target);
                    self.stage = Stage::Branch;
                    return Some(GenData::Reserve {
                        addr: target,
                        size: TARGET_WINDOW,
                    });
                }
                Stage::Branch => {
                    self.stage = Stage::Done;
                    let (spec, rs1, rs2) = self.branch?;
                    let target = self.target?;
                    let offset = target.wrapping_sub(ctx.pc) as i64;
                    let ops = Operands {
                        rd: 0,
                        rs1,
                        rs2,
                        imm: offset,
                    };
                    return Some(GenData::Instr(InstrItem::new(
                        spec,
                        ops,
                        self.name(),
                        crate::isa::asm(ctx.catalog, spec, ops),
                    )));
                }
                Stage::Done => return None,
            }
        }
    }
}

/// An indirect jump through a claim-owned register preloaded with a freshly
/// allocated code address.
pub struct AbsoluteBranching {
    claim: Option<Claim>,
    queue: VecDeque<GenData>,
    started: bool,
}

impl AbsoluteBranching {
    pub fn new() -> Self {
        Self {
            claim: None,
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for AbsoluteBranching {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for AbsoluteBranching {
    fn name(&self) -> &'static str {
        "AbsoluteBranching"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(1)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let name = self.name();
            // Enough room that the address expansion below cannot be split
            // by a relocate, which would corrupt the preloaded target.
            if ctx.store.free_space_at(ctx.pc) < 96 {
                debug!("{name}: not enough room before the next boundary");
                return None;
            }
            let base = self
                .claim
                .as_ref()
                .and_then(|c| c.exclusive_gprs().first().copied())
                .unwrap_or(5);
            // Forward-only window so the target cannot cover this sequence's
            // own upcoming instructions.
            let Some(target) = ctx.store.allocate_code(
                ctx.rng,
                TARGET_WINDOW,
                4,
                Some(ctx.pc),
                Some((TARGET_WINDOW as i64, 1 << 20)),
            ) else {
                debug!("{name}: no room for a jump target");
                return None;
            };
            let mut queue: VecDeque<GenData> =
                load_gpr_plan(ctx.catalog, base, target, name).into();
            let spec = ctx.catalog.spec(Op::Jalr);
            let ops = Operands {
                rd: 0,
                rs1: base,
                imm: 0,
                ..Default::default()
            };
            queue.push_back(GenData::Instr(InstrItem::new(
                spec,
                ops,
                name,
                format!("jalr x0, x{base}, 0"),
            )));
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::isa::{Catalog, Format};
    use crate::layout::AddressMap;
    use crate::memory::MemoryStore;
    use crate::model::ExecutionState;
    use crate::resource::{Reserver, ResourceSpace};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        catalog: Catalog,
        store: MemoryStore,
        rng: StdRng,
        state: ExecutionState,
        reserver: Reserver,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = Catalog::new();
            let cfg = MemoryConfig::default_config();
            let store = MemoryStore::new(AddressMap::from_config(&cfg).unwrap());
            let reserver = Reserver::new(ResourceSpace::for_catalog(&catalog));
            Self {
                catalog,
                store,
                rng: StdRng::seed_from_u64(21),
                state: ExecutionState::new(),
                reserver,
            }
        }

        fn drain(&mut self, seq: &mut dyn Sequence, pc: u64) -> Vec<GenData> {
            let claim = self
                .reserver
                .request(&seq.resource_requests())
                .unwrap()
                .unwrap();
            seq.set_claim(&claim);
            let mut items = Vec::new();
            loop {
                let mut ctx = SeqCtx {
                    rng: &mut self.rng,
                    store: &mut self.store,
                    state: &self.state,
                    catalog: &self.catalog,
                    reserver: &mut self.reserver,
                    pc,
                };
                match seq.next(&mut ctx) {
                    Some(item) => items.push(item),
                    None => break,
                }
            }
            items
        }
    }

    #[test]
    fn relative_branching_reserves_an_in_range_target() {
        let mut fx = Fixture::new();
        let mut seq = RelativeBranching::new();
        let pc = 0x8000_1000;
        let items = fx.drain(&mut seq, pc);

        let mut reserved = None;
        let mut branch = None;
        for item in &items {
            match item {
                GenData::Reserve { addr, .. } => reserved = Some(*addr),
                GenData::Instr(instr) if matches!(instr.spec.format, Format::B) => {
                    branch = Some(instr.clone())
                }
                _ => {}
            }
        }
        let target = reserved.expect("landing pad reserved");
        let branch = branch.expect("branch emitted");
        assert_eq!(pc.wrapping_add(branch.ops.imm as u64), target);
        assert!(branch.ops.imm.abs() <= 4096);
        // landing pad never covers the branch itself
        assert!(!(target <= pc && pc < target + TARGET_WINDOW));
    }

    #[test]
    fn absolute_branching_preloads_a_forward_target() {
        let mut fx = Fixture::new();
        let mut seq = AbsoluteBranching::new();
        let pc = 0x8000_1000;
        let items = fx.drain(&mut seq, pc);
        let GenData::Instr(last) = items.last().expect("items produced") else {
            panic!("expected an instruction");
        };
        assert_eq!(last.spec.mnemonic, "jalr");
        assert_eq!(last.ops.rd, 0);
        // the preloading plan writes the same register the jump reads
        let base = last.ops.rs1;
        assert!(items.iter().any(|item| {
            matches!(item, GenData::Instr(i) if i.spec.has_gpr_dest() && i.ops.rd == base)
        }));
    }
}

