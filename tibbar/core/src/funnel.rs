//! Funnels compose child producers into a single item stream.
//!
//! A funnel is itself a [`Sequence`], so funnels nest. For direct sequence
//! children the funnel owns the reservation lifecycle: the child's claim is
//! requested immediately before its first item, the child is skipped while
//! the request cannot be met (and dropped after too many failures), and the
//! claim is released when the child is exhausted. Nested funnels request
//! nothing themselves; their own children reserve when they start.

use log::{error, warn};

use crate::resource::Claim;
use crate::seq::{GenData, SeqCtx, Sequence};

/// Consecutive failed reservation attempts before a child is dropped.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

enum ChildClaim {
    Pending,
    /// Admitted; `None` when the child requested nothing.
    Held(Option<Claim>),
}

struct Child {
    seq: Box<dyn Sequence>,
    claim: ChildClaim,
    attempts: u32,
}

impl Child {
    fn new(seq: Box<dyn Sequence>) -> Self {
        Self {
            seq,
            claim: ChildClaim::Pending,
            attempts: 0,
        }
    }

    fn release(mut self, ctx: &mut SeqCtx<'_>) {
        if let ChildClaim::Held(Some(claim)) = std::mem::replace(&mut self.claim, ChildClaim::Pending)
        {
            ctx.reserver.release(claim);
        }
    }
}

enum Admission {
    Ready,
    Skip,
    Drop,
}

fn admit(child: &mut Child, ctx: &mut SeqCtx<'_>, max_attempts: u32) -> Admission {
    if matches!(child.claim, ChildClaim::Held(_)) {
        return Admission::Ready;
    }
    let spec = child.seq.resource_requests();
    if spec.is_empty() {
        child.claim = ChildClaim::Held(None);
        return Admission::Ready;
    }
    match ctx.reserver.request(&spec) {
        Err(err) => {
            error!("dropping {}: {err}", child.seq.name());
            Admission::Drop
        }
        Ok(None) => {
            child.attempts += 1;
            if child.attempts >= max_attempts {
                warn!(
                    "dropping {} after {} failed reservation attempts",
                    child.seq.name(),
                    child.attempts
                );
                Admission::Drop
            } else {
                Admission::Skip
            }
        }
        Ok(Some(claim)) => {
            child.seq.set_claim(&claim);
            child.claim = ChildClaim::Held(Some(claim));
            Admission::Ready
        }
    }
}

/// Drains each child fully, in the order added. A child whose reservation
/// cannot be met yet is passed over and retried on later pulls.
pub struct SimpleFunnel {
    children: Vec<Child>,
    max_attempts: u32,
}

impl SimpleFunnel {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn add(&mut self, seq: Box<dyn Sequence>) {
        self.children.push(Child::new(seq));
    }

    pub fn with(mut self, seq: Box<dyn Sequence>) -> Self {
        self.add(seq);
        self
    }
}

impl Default for SimpleFunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for SimpleFunnel {
    fn name(&self) -> &'static str {
        "SimpleFunnel"
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        'scan: loop {
            if self.children.is_empty() {
                return None;
            }
            let mut skipped = false;
            let mut i = 0;
            while i < self.children.len() {
                match admit(&mut self.children[i], ctx, self.max_attempts) {
                    Admission::Drop => {
                        self.children.remove(i).release(ctx);
                        continue 'scan;
                    }
                    Admission::Skip => {
                        skipped = true;
                        i += 1;
                        continue;
                    }
                    Admission::Ready => {}
                }
                match self.children[i].seq.next(ctx) {
                    Some(item) => return Some(item),
                    None => {
                        self.children.remove(i).release(ctx);
                        continue 'scan;
                    }
                }
            }
            if !skipped {
                return None;
            }
            // Every remaining child was skipped; their attempt counters
            // guarantee this loop ends in drops if nothing frees up.
        }
    }
}

/// Advances children one item per round in a fixed rotation; exhausted
/// children are dropped, blocked children are skipped for the round.
pub struct RoundRobinFunnel {
    children: Vec<Child>,
    idx: usize,
    max_attempts: u32,
}

impl RoundRobinFunnel {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            idx: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn add(&mut self, seq: Box<dyn Sequence>) {
        self.children.push(Child::new(seq));
    }

    pub fn with(mut self, seq: Box<dyn Sequence>) -> Self {
        self.add(seq);
        self
    }
}

impl Default for RoundRobinFunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for RoundRobinFunnel {
    fn name(&self) -> &'static str {
        "RoundRobinFunnel"
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        while !self.children.is_empty() {
            if self.idx >= self.children.len() {
                self.idx = 0;
            }
            match admit(&mut self.children[self.idx], ctx, self.max_attempts) {
                Admission::Drop => {
                    self.children.remove(self.idx).release(ctx);
                    continue;
                }
                Admission::Skip => {
                    self.idx = (self.idx + 1) % self.children.len();
                    continue;
                }
                Admission::Ready => {}
            }
            match self.children[self.idx].seq.next(ctx) {
                Some(item) => {
                    self.idx = (self.idx + 1) % self.children.len();
                    return Some(item);
                }
                None => {
                    self.children.remove(self.idx).release(ctx);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::isa::{Catalog, Op, Operands};
    use crate::layout::AddressMap;
    use crate::memory::MemoryStore;
    use crate::model::ExecutionState;
    use crate::resource::{Claim, ClaimItem, ClaimSpec, Reserver, ResourceId, ResourceSpace};
    use crate::seq::InstrItem;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Emits `count` nops tagged with a label; optionally claims a register.
    struct Emit {
        label: &'static str,
        count: usize,
        spec: ClaimSpec,
    }

    impl Emit {
        fn new(label: &'static str, count: usize) -> Self {
            Self {
                label,
                count,
                spec: ClaimSpec::default(),
            }
        }

        fn claiming(label: &'static str, count: usize, gpr: u8) -> Self {
            Self {
                label,
                count,
                spec: ClaimSpec {
                    exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(gpr))],
                    shared: Vec::new(),
                },
            }
        }
    }

    impl Sequence for Emit {
        fn name(&self) -> &'static str {
            self.label
        }

        fn resource_requests(&self) -> ClaimSpec {
            self.spec.clone()
        }

        fn set_claim(&mut self, _claim: &Claim) {}

        fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
            if self.count == 0 {
                return None;
            }
            self.count -= 1;
            Some(GenData::Instr(InstrItem::new(
                ctx.catalog.spec(Op::Addi),
                Operands::default(),
                self.label,
                "nop".into(),
            )))
        }
    }

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
                rng: StdRng::seed_from_u64(9),
                state: ExecutionState::new(),
                reserver,
            }
        }

        fn drain(&mut self, funnel: &mut dyn Sequence) -> Vec<&'static str> {
            let mut labels = Vec::new();
            loop {
                let mut ctx = SeqCtx {
                    rng: &mut self.rng,
                    store: &mut self.store,
                    state: &self.state,
                    catalog: &self.catalog,
                    reserver: &mut self.reserver,
                    pc: 0x8000_0000,
                };
                match funnel.next(&mut ctx) {
                    Some(GenData::Instr(instr)) => labels.push(instr.seq),
                    Some(_) => {}
                    None => break,
                }
            }
            labels
        }
    }

    #[test]
    fn simple_funnel_drains_in_order() {
        let mut fx = Fixture::new();
        let mut funnel = SimpleFunnel::new()
            .with(Box::new(Emit::new("a", 3)))
            .with(Box::new(Emit::new("b", 2)));
        let labels = fx.drain(&mut funnel);
        assert_eq!(labels, vec!["a", "a", "a", "b", "b"]);
    }

    #[test]
    fn round_robin_rotates_fairly() {
        let mut fx = Fixture::new();
        let mut funnel = RoundRobinFunnel::new()
            .with(Box::new(Emit::new("a", 3)))
            .with(Box::new(Emit::new("b", 3)))
            .with(Box::new(Emit::new("c", 3)));
        let labels = fx.drain(&mut funnel);
        assert_eq!(
            labels,
            vec!["a", "b", "c", "a", "b", "c", "a", "b", "c"]
        );
    }

    #[test]
    fn conflicting_claims_admit_only_one_child() {
        let mut fx = Fixture::new();
        let mut funnel = RoundRobinFunnel::new()
            .with(Box::new(Emit::claiming("a", 5, 5)))
            .with(Box::new(Emit::claiming("b", 5, 5)));
        let labels = fx.drain(&mut funnel);
        assert_eq!(labels.iter().filter(|l| **l == "a").count(), 5);
        assert_eq!(labels.iter().filter(|l| **l == "b").count(), 0);
    }

    #[test]
    fn invalid_resource_drops_the_child() {
        let mut fx = Fixture::new();
        let mut funnel = RoundRobinFunnel::new()
            .with(Box::new(Emit::claiming("bad", 5, 0)))
            .with(Box::new(Emit::new("ok", 2)));
        let labels = fx.drain(&mut funnel);
        assert_eq!(labels, vec!["ok", "ok"]);
    }

    #[test]
    fn claims_are_released_on_exhaustion() {
        let mut fx = Fixture::new();
        let mut funnel = SimpleFunnel::new().with(Box::new(Emit::claiming("a", 2, 7)));
        let labels = fx.drain(&mut funnel);
        assert_eq!(labels.len(), 2);
        // register 7 is free again
        let spec = ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(7))],
            shared: Vec::new(),
        };
        assert!(fx.reserver.request(&spec).unwrap().is_some());
    }

    #[test]
    fn nested_funnels_compose() {
        let mut fx = Fixture::new();
        let inner = RoundRobinFunnel::new()
            .with(Box::new(Emit::new("x", 2)))
            .with(Box::new(Emit::new("y", 2)));
        let mut outer = SimpleFunnel::new()
            .with(Box::new(Emit::new("pre", 1)))
            .with(Box::new(inner));
        let labels = fx.drain(&mut outer);
        assert_eq!(labels, vec!["pre", "x", "y", "x", "y"]);
    }
}
