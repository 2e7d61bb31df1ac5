//! Register setup and the program start / end / relocate sequences.

use std::collections::VecDeque;

use log::{debug, error};
use rand::Rng;

use crate::isa::{csr, Op, Operands};
use crate::resource::{ClaimItem, ClaimSpec, Namespace, ResourceId};

use super::float::set_fprs_plan;
use super::loadgpr::load_gpr_plan;
use super::{GenData, InstrItem, SeqCtx, Sequence};

/// Scratch register used by the engine-driven sequences (start, end,
/// relocate). Funnel-managed sequences must claim their registers instead.
const SCRATCH: u8 = 1;

const STACK_POINTER: u8 = 2;

/// Build a plan setting x1..x31 to random, zero or sentinel values.
pub fn set_gprs_plan(ctx: &mut SeqCtx<'_>, random_values: bool, seq: &'static str) -> Vec<GenData> {
    let mut out = Vec::new();
    for reg in 1..32u8 {
        let value = if random_values {
            match ctx.rng.gen_range(0u32..3) {
                0 => ctx.rng.gen::<u64>(),
                1 => 0,
                _ => 0xDEAD_BEEF,
            }
        } else {
            0xDEAD_BEEF
        };
        out.extend(load_gpr_plan(ctx.catalog, reg, value, seq));
    }
    out
}

/// Set every GPR to a known value.
pub struct SetGprs {
    random_values: bool,
    queue: VecDeque<GenData>,
    started: bool,
}

impl SetGprs {
    pub fn new(random_values: bool) -> Self {
        Self {
            random_values,
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Sequence for SetGprs {
    fn name(&self) -> &'static str {
        "SetGPRs"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec {
            exclusive: Vec::new(),
            shared: vec![ClaimItem::Any {
                namespace: Namespace::Gpr,
                count: 31,
            }],
        }
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            self.queue = set_gprs_plan(ctx, self.random_values, self.name()).into();
        }
        self.queue.pop_front()
    }
}

/// Set every FPR from a freshly allocated value pool.
pub struct SetFprs {
    p_f64: f64,
    queue: VecDeque<GenData>,
    started: bool,
}

impl SetFprs {
    pub fn new(p_f64: f64) -> Self {
        Self {
            p_f64,
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Sequence for SetFprs {
    fn name(&self) -> &'static str {
        "SetFPRs"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(SCRATCH))],
            shared: vec![ClaimItem::Any {
                namespace: Namespace::Fpr,
                count: 32,
            }],
        }
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            match set_fprs_plan(ctx, self.p_f64, self.name()) {
                Some(plan) => self.queue = plan.into(),
                None => debug!("SetFPRs: data region exhausted"),
            }
        }
        self.queue.pop_front()
    }
}

/// Program prologue: install the trap handler, point mtvec at it and
/// initialize the stack pointer.
///
/// The handler advances mepc past the faulting instruction and returns:
/// `csrrs x1, mepc` / `addi x1, x1, 4` / `csrrw mepc, x1` / `mret`.
pub struct DefaultProgramStart {
    queue: VecDeque<GenData>,
    started: bool,
}

impl DefaultProgramStart {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for DefaultProgramStart {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for DefaultProgramStart {
    fn name(&self) -> &'static str {
        "DefaultProgramStart"
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let Some(handler) = ctx.store.allocate_code(ctx.rng, 40, 8, None, None) else {
                error!("no space for the trap handler");
                return None;
            };
            ctx.store.set_trap_handler(handler);

            let catalog = ctx.catalog;
            let name = self.name();
            let mut queue: VecDeque<GenData> =
                load_gpr_plan(catalog, SCRATCH, handler, name).into();
            queue.push_back(GenData::Instr(InstrItem::new(
                catalog.spec(Op::Csrrw),
                Operands {
                    rd: 0,
                    rs1: SCRATCH,
                    imm: csr::MTVEC as i64,
                    ..Default::default()
                },
                name,
                format!("csrrw x0, mtvec, x{SCRATCH}"),
            )));

            let handler_body = [
                (
                    catalog.spec(Op::Csrrs),
                    Operands {
                        rd: SCRATCH,
                        rs1: 0,
                        imm: csr::MEPC as i64,
                        ..Default::default()
                    },
                    format!("csrrs x{SCRATCH}, mepc, x0"),
                ),
                (
                    catalog.spec(Op::Addi),
                    Operands {
                        rd: SCRATCH,
                        rs1: SCRATCH,
                        imm: 4,
                        ..Default::default()
                    },
                    format!("addi x{SCRATCH}, x{SCRATCH}, 4"),
                ),
                (
                    catalog.spec(Op::Csrrw),
                    Operands {
                        rd: 0,
                        rs1: SCRATCH,
                        imm: csr::MEPC as i64,
                        ..Default::default()
                    },
                    format!("csrrw x0, mepc, x{SCRATCH}"),
                ),
                (catalog.spec(Op::Mret), Operands::default(), "mret".into()),
            ];
            for (i, (spec, ops, comment)) in handler_body.into_iter().enumerate() {
                queue.push_back(GenData::Instr(
                    InstrItem::new(spec, ops, "TrapHandler", comment).at(handler + i as u64 * 4),
                ));
            }

            let (_, data_hi) = ctx.store.data_region();
            let stack_top = data_hi & !15;
            queue.extend(load_gpr_plan(catalog, STACK_POINTER, stack_top, name));

            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

/// Program epilogue: materialize the exit address, jump to it and park on a
/// branch-to-self placed exactly at the exit address.
pub struct DefaultProgramEnd {
    queue: VecDeque<GenData>,
    started: bool,
}

impl DefaultProgramEnd {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for DefaultProgramEnd {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for DefaultProgramEnd {
    fn name(&self) -> &'static str {
        "DefaultProgramEnd"
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let Some((_, hi)) = ctx.store.exit_region() else {
                error!("end sequence started without an exit region");
                return None;
            };
            let exit_addr = hi - 4;
            let catalog = ctx.catalog;
            let name = self.name();
            let mut queue: VecDeque<GenData> =
                load_gpr_plan(catalog, SCRATCH, exit_addr, name).into();
            queue.push_back(GenData::Instr(InstrItem::new(
                catalog.spec(Op::Jalr),
                Operands {
                    rd: 0,
                    rs1: SCRATCH,
                    imm: 0,
                    ..Default::default()
                },
                name,
                format!("jalr x0, x{SCRATCH}, 0"),
            )));
            queue.push_back(GenData::Instr(
                InstrItem::new(
                    catalog.spec(Op::Jal),
                    Operands::default(),
                    name,
                    "jal x0, 0".into(),
                )
                .at(exit_addr),
            ));
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

/// Jump to a fresh code block when the current one runs out of room.
///
/// Prefers a direct `jal` into an in-range free block; falls back to
/// materializing an absolute target and `jalr`.
pub struct DefaultRelocate {
    queue: VecDeque<GenData>,
    started: bool,
}

impl DefaultRelocate {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for DefaultRelocate {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for DefaultRelocate {
    fn name(&self) -> &'static str {
        "Relocate"
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            let catalog = ctx.catalog;
            let name = self.name();
            let pc = ctx.pc;
            let free = ctx.store.free_space_at(pc);
            let jal_range = catalog.spec(Op::Jal).offset_range();

            let direct = ctx
                .store
                .allocate_code(ctx.rng, 100, 8, Some(pc), jal_range);
            let target = match direct.or_else(|| {
                ctx.store.allocate_code(ctx.rng, 100, 8, Some(pc), None)
            }) {
                Some(t) => t,
                None => {
                    error!("relocate: no free code block left");
                    return None;
                }
            };

            let plan = load_gpr_plan(catalog, SCRATCH, target, name);
            let indirect_bytes = (plan.len() as u64 + 1) * 4;
            let in_jal_range = jal_range.is_some_and(|(lo, hi)| {
                let offset = target.wrapping_sub(pc) as i64;
                (lo..=hi).contains(&offset)
            });

            // Prefer the single-word direct jump; the indirect form needs
            // room for the whole scratch-register expansion.
            if in_jal_range && target != pc && (indirect_bytes > free || ctx.rng.gen_bool(0.95)) {
                let offset = target.wrapping_sub(pc) as i64;
                self.queue.push_back(GenData::Instr(InstrItem::new(
                    catalog.spec(Op::Jal),
                    Operands {
                        rd: 0,
                        imm: offset,
                        ..Default::default()
                    },
                    name,
                    format!("jal x0, {offset}"),
                )));
                return self.queue.pop_front();
            }
            if indirect_bytes > free {
                error!("relocate: {free} bytes left at {pc:#x}, need {indirect_bytes}");
                return None;
            }

            let mut queue: VecDeque<GenData> = plan.into();
            let room = (free / 4).saturating_sub(queue.len() as u64 + 1);
            for _ in 0..ctx.rng.gen_range(0..=4u64.min(room)) {
                queue.push_back(GenData::Instr(InstrItem::new(
                    catalog.spec(Op::Addi),
                    Operands::default(),
                    name,
                    "nop".into(),
                )));
            }
            queue.push_back(GenData::Instr(InstrItem::new(
                catalog.spec(Op::Jalr),
                Operands {
                    rd: 0,
                    rs1: SCRATCH,
                    imm: 0,
                    ..Default::default()
                },
                name,
                format!("jalr x0, x{SCRATCH}, 0"),
            )));
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}
