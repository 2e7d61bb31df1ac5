//! Load and store sequences over the linear data region.

use std::collections::VecDeque;

use log::debug;
use rand::Rng;

use crate::isa::Operands;
use crate::resource::{Claim, ClaimSpec};

use super::loadgpr::load_gpr_plan;
use super::{DataItem, GenData, InstrItem, SeqCtx, Sequence};

fn claimed_pair(claim: &Option<Claim>) -> (u8, u8) {
    match claim {
        Some(c) => {
            let gprs = c.exclusive_gprs();
            match gprs.as_slice() {
                [a, b, ..] => (*a, *b),
                [a] => (*a, *a),
                [] => (5, 6),
            }
        }
        None => (5, 6),
    }
}

/// One load whose base register points at a freshly allocated, pre-populated
/// data cell.
pub struct Load {
    claim: Option<Claim>,
    queue: VecDeque<GenData>,
    started: bool,
}

impl Load {
    pub fn new() -> Self {
        Self {
            claim: None,
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for Load {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for Load {
    fn name(&self) -> &'static str {
        "Load"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(2)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let name = self.name();
            let loads = ctx
                .catalog
                .forms_where(|s| s.is_load() && !s.is_float());
            let spec = loads[ctx.rng.gen_range(0..loads.len())];
            let (base, dest) = claimed_pair(&self.claim);

            let size = spec.access_bytes as u64;
            let Some(cell) = ctx.store.allocate_data(size.max(8), 8) else {
                debug!("Load: data region exhausted");
                return None;
            };
            let mask = if size >= 8 {
                u64::MAX
            } else {
                (1u64 << (size * 8)) - 1
            };
            let value = ctx.rng.gen::<u64>() & mask;

            let mut queue = VecDeque::new();
            queue.push_back(GenData::Data(DataItem {
                addr: cell,
                bytes: value.to_le_bytes()[..size as usize].to_vec(),
                seq: name,
                comment: format!("cell for {} at {cell:#x}", spec.mnemonic),
            }));
            queue.extend(load_gpr_plan(ctx.catalog, base, cell, name));
            let ops = Operands {
                rd: dest,
                rs1: base,
                imm: 0,
                ..Default::default()
            };
            queue.push_back(GenData::Instr(InstrItem::new(
                spec,
                ops,
                name,
                crate::isa::asm(ctx.catalog, spec, ops),
            )));
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

/// One store of a known value into a freshly allocated data cell.
pub struct Store {
    claim: Option<Claim>,
    queue: VecDeque<GenData>,
    started: bool,
}

impl Store {
    pub fn new() -> Self {
        Self {
            claim: None,
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for Store {
    fn name(&self) -> &'static str {
        "Store"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(2)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let name = self.name();
            let stores = ctx.catalog.forms_where(|s| s.is_store());
            let spec = stores[ctx.rng.gen_range(0..stores.len())];
            let (base, data) = claimed_pair(&self.claim);

            let size = spec.access_bytes as u64;
            let Some(cell) = ctx.store.allocate_data(size.max(8), 8) else {
                debug!("Store: data region exhausted");
                return None;
            };
            let value = ctx.rng.gen::<u64>();

            let mut queue: VecDeque<GenData> =
                load_gpr_plan(ctx.catalog, base, cell, name).into();
            queue.extend(load_gpr_plan(ctx.catalog, data, value, name));
            let ops = Operands {
                rd: 0,
                rs1: base,
                rs2: data,
                imm: 0,
            };
            queue.push_back(GenData::Instr(InstrItem::new(
                spec,
                ops,
                name,
                crate::isa::asm(ctx.catalog, spec, ops),
            )));
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

/// A load with base `x0` and an offset that misses every configured bank,
/// guaranteeing a load access fault into the trap handler.
pub struct LoadException {
    claim: Option<Claim>,
    emitted: bool,
}

impl LoadException {
    pub fn new() -> Self {
        Self {
            claim: None,
            emitted: false,
        }
    }
}

impl Default for LoadException {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for LoadException {
    fn name(&self) -> &'static str {
        "LoadException"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(1)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        let loads = ctx
            .catalog
            .forms_where(|s| s.is_load() && !s.is_float());
        let spec = loads[ctx.rng.gen_range(0..loads.len())];
        let dest = claimed_pair(&self.claim).0;

        // Base x0 makes the access address equal to the offset; pick one
        // that is not mapped by any bank.
        let mut offset = 0i64;
        for _ in 0..16 {
            let cand = ctx.rng.gen_range(1i64..2048) & !7;
            if cand != 0 && ctx.store.read(cand as u64, spec.access_bytes).is_err() {
                offset = cand;
                break;
            }
        }
        if offset == 0 {
            debug!("LoadException: no unmapped offset below 2 KiB");
            return None;
        }

        let ops = Operands {
            rd: dest,
            rs1: 0,
            imm: offset,
            ..Default::default()
        };
        Some(GenData::Instr(InstrItem::new(
            spec,
            ops,
            self.name(),
            format!("{} (faulting)", crate::isa::asm(ctx.catalog, spec, ops)),
        )))
    }
}
