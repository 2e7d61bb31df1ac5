//! The generation engine.
//!
//! One loop interleaves three activities: placing the next produced item at
//! the model's PC, stepping the functional model over already-placed code,
//! and splicing in the relocate sequence when the current region runs out of
//! room. Generation ends when the model parks on a branch-to-self inside the
//! exit region (or wherever one was reached naturally).

use std::collections::VecDeque;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MemoryConfig;
use crate::emit::Emitter;
use crate::isa::{self, Catalog, Op, Operands, Trap};
use crate::layout::AddressMap;
use crate::memory::MemoryStore;
use crate::model::{self, ExecutionState};
use crate::resource::{Reserver, ResourceSpace};
use crate::seq::{GenData, SeqCtx, Sequence};
use crate::suites::Generator;
use crate::{Result, TibbarError};

/// Room required to splice a worst-case relocate emission (13 instructions).
pub const RELOCATE_WINDOW: u64 = 13 * 4;

/// Reserved window for the end sequence; the exit address is its last slot.
pub const EXIT_REGION_BYTES: u64 = 64;

/// Reserved window at the boot address. Large enough that the prologue's
/// scratch-register expansions are never interrupted by a relocate.
pub const BOOT_WINDOW: u64 = 128;

/// Room the end sequence needs before it may start outside the exit region.
const END_WINDOW: u64 = 48;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    Main,
    Ending,
}

pub struct Tibbar {
    seed: u64,
    rng: StdRng,
    catalog: Catalog,
    config: MemoryConfig,
    store: MemoryStore,
    state: ExecutionState,
    reserver: Reserver,
    boot_address: u64,
    exit_address: Option<u64>,
    pub max_instructions: u64,
    pub max_code_bytes: u64,
    placed_instructions: u64,
    placed_code_bytes: u64,
}

impl Tibbar {
    pub fn new(seed: u64, config: MemoryConfig) -> Result<Self> {
        let catalog = Catalog::new();
        let map = AddressMap::from_config(&config)?;
        let mut store = MemoryStore::new(map);
        let mut rng = StdRng::seed_from_u64(seed);
        let reserver = Reserver::new(ResourceSpace::for_catalog(&catalog));

        let boot_address = Self::choose_boot(&config, &store, &mut rng)?;
        store.reserve_code_at(boot_address, BOOT_WINDOW)?;
        let exit_lo = Self::choose_exit(&store, &mut rng)?;
        store.set_exit_region(exit_lo, exit_lo + EXIT_REGION_BYTES);
        info!(
            "boot {boot_address:#x}, exit region [{exit_lo:#x}, {:#x})",
            exit_lo + EXIT_REGION_BYTES
        );

        let max_code_bytes = store.map().code.size;
        let mut state = ExecutionState::new();
        state.pc = boot_address;

        Ok(Self {
            seed,
            rng,
            catalog,
            config,
            store,
            state,
            reserver,
            boot_address,
            exit_address: None,
            max_instructions: 100_000,
            max_code_bytes,
            placed_instructions: 0,
            placed_code_bytes: 0,
        })
    }

    fn choose_boot(config: &MemoryConfig, store: &MemoryStore, rng: &mut StdRng) -> Result<u64> {
        let code = store.map().code;
        if let Some(offset) = config.boot {
            let boot = (code.base + offset) & !7;
            if !store.check_region_empty(boot, BOOT_WINDOW) {
                return Err(TibbarError::Config(format!(
                    "configured boot {boot:#x} has no room for the boot window"
                )));
            }
            return Ok(boot);
        }
        for _ in 0..256 {
            let span = code.size.saturating_sub(BOOT_WINDOW);
            let cand = (code.base + rng.gen_range(0..=span)) & !7;
            if cand != 0 && store.check_region_empty(cand, BOOT_WINDOW) {
                return Ok(cand);
            }
        }
        Err(TibbarError::Config(
            "unable to choose a boot address inside the code bank".into(),
        ))
    }

    fn choose_exit(store: &MemoryStore, rng: &mut StdRng) -> Result<u64> {
        let code = store.map().code;
        for _ in 0..256 {
            let span = code.size.saturating_sub(EXIT_REGION_BYTES);
            let cand = (code.base + rng.gen_range(0..=span)) & !7;
            if cand != 0 && store.check_region_empty(cand, EXIT_REGION_BYTES) {
                return Ok(cand);
            }
        }
        Err(TibbarError::Config(
            "unable to choose an exit region inside the code bank".into(),
        ))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn boot_address(&self) -> u64 {
        self.boot_address
    }

    pub fn exit_address(&self) -> Option<u64> {
        self.exit_address
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn placed_instructions(&self) -> u64 {
        self.placed_instructions
    }

    fn seq_ctx(&mut self) -> SeqCtx<'_> {
        SeqCtx {
            pc: self.state.pc,
            rng: &mut self.rng,
            store: &mut self.store,
            state: &self.state,
            catalog: &self.catalog,
            reserver: &mut self.reserver,
        }
    }

    /// Generate the whole stream.
    pub fn create_test(&mut self, gen: &mut Generator) -> Result<()> {
        info!("creating test (seed {})", self.seed);
        let mut phase = Phase::Start;
        let mut end_started = false;
        let mut relocate: Option<Box<dyn Sequence>> = None;
        let mut gen_hung = 0u32;
        let mut model_hung = 0u32;
        let mut recent: VecDeque<u64> = VecDeque::with_capacity(128);
        let mut cycle_repeats = 0u32;

        loop {
            let pc = self.state.pc;
            if phase != Phase::Ending && self.store.in_exit_region(pc) {
                debug!("pc {pc:#x} entered the exit region");
                phase = Phase::Ending;
            }
            if phase != Phase::Ending
                && (self.placed_instructions >= self.max_instructions
                    || self.placed_code_bytes >= self.max_code_bytes)
            {
                info!("work ceiling reached, driving the stream to exit");
                phase = Phase::Ending;
            }

            if self.store.is_placed(pc) {
                let out = model::step(&mut self.state, &mut self.store);
                match out.trap {
                    Some(trap) => self.apply_trap(out.pc_before, trap)?,
                    None => {
                        let next = self.state.pc;
                        if !self.store.map().contains_code(next, 4) {
                            let (spec, ops, _) = self
                                .store
                                .instruction_at(out.pc_before)
                                .ok_or_else(|| TibbarError::EngineHung("lost placement".into()))?;
                            return Err(TibbarError::ControlFlowEscape {
                                from: out.pc_before,
                                to: next,
                                instr: isa::asm(&self.catalog, spec, ops),
                            });
                        }
                        if next == out.pc_before {
                            // Parked on a branch-to-self: the test is done.
                            self.exit_address = Some(next);
                            info!("stream parked at {next:#x}");
                            break;
                        }
                    }
                }

                if recent.contains(&self.state.pc) {
                    cycle_repeats += 1;
                    if cycle_repeats > 100 {
                        return Err(TibbarError::EngineHung(format!(
                            "generated code loops without reaching exit (pc {:#x}); try another seed",
                            self.state.pc
                        )));
                    }
                } else {
                    cycle_repeats = 0;
                }
                if recent.len() == 128 {
                    recent.pop_front();
                }
                recent.push_back(self.state.pc);
                model_hung += 1;
                gen_hung = 0;
                if model_hung > 1000 {
                    return Err(TibbarError::EngineHung(format!(
                        "model ran {model_hung} steps without new placements (pc {:#x})",
                        self.state.pc
                    )));
                }
            } else {
                recent.clear();
                cycle_repeats = 0;
                match self.pull(gen, &mut phase, &mut relocate, &mut end_started)? {
                    Some(item) => self.place(item)?,
                    None => {
                        return Err(TibbarError::EngineHung(format!(
                            "no producer could fill pc {pc:#x}"
                        )))
                    }
                }
                gen_hung += 1;
                model_hung = 0;
                if gen_hung > 200 {
                    return Err(TibbarError::EngineHung(
                        "producers yielded many items without the model advancing".into(),
                    ));
                }
            }
        }

        // Reserved branch targets that control flow never reached still need
        // instructions for the placement invariant; land a nop on each.
        for target in self.store.unfilled_targets() {
            warn!("backfilling unreached branch target {target:#x}");
            self.store.place_instruction(
                target,
                self.catalog.spec(Op::Addi),
                Operands::default(),
                "Backfill",
                "nop".into(),
            )?;
            self.placed_instructions += 1;
            self.placed_code_bytes += 4;
        }

        info!(
            "generated {} instructions ({} code bytes)",
            self.placed_instructions, self.placed_code_bytes
        );
        Ok(())
    }

    /// Next item from the active producer chain: a live relocate sequence
    /// first, then the phase's sequence, advancing phases on exhaustion.
    fn pull(
        &mut self,
        gen: &mut Generator,
        phase: &mut Phase,
        relocate: &mut Option<Box<dyn Sequence>>,
        end_started: &mut bool,
    ) -> Result<Option<GenData>> {
        let pc = self.state.pc;
        loop {
            if let Some(seq) = relocate.as_mut() {
                let mut ctx = self.seq_ctx();
                match seq.next(&mut ctx) {
                    Some(item) => return Ok(Some(item)),
                    None => {
                        *relocate = None;
                        continue;
                    }
                }
            }

            // Relocate when room runs low. Once the end sequence has begun
            // its scratch-register expansion must not be interrupted, so the
            // room for it is checked up front instead.
            let needed = match phase {
                Phase::Ending if *end_started => 0,
                Phase::Ending => RELOCATE_WINDOW.max(END_WINDOW),
                _ => RELOCATE_WINDOW,
            };
            if needed > 0
                && !self.store.in_exit_region(pc)
                && self.store.free_space_at(pc) <= needed
            {
                debug!("low space at {pc:#x}, splicing relocate");
                let mut seq = (gen.relocate)();
                let mut ctx = self.seq_ctx();
                match seq.next(&mut ctx) {
                    Some(item) => {
                        *relocate = Some(seq);
                        return Ok(Some(item));
                    }
                    None => {
                        return Err(TibbarError::OutOfSpace {
                            region: "code",
                            needed: RELOCATE_WINDOW,
                        })
                    }
                }
            }

            let producer: &mut Box<dyn Sequence> = match phase {
                Phase::Start => &mut gen.start,
                Phase::Main => &mut gen.main,
                Phase::Ending => &mut gen.end,
            };
            let mut ctx = self.seq_ctx();
            if let Some(item) = producer.next(&mut ctx) {
                if matches!(phase, Phase::Ending) {
                    *end_started = true;
                }
                return Ok(Some(item));
            }
            match phase {
                Phase::Start => {
                    if self.store.trap_handler().is_none() {
                        return Err(TibbarError::EngineHung(
                            "start sequence did not install a trap handler".into(),
                        ));
                    }
                    debug!("prologue complete");
                    *phase = Phase::Main;
                }
                Phase::Main => {
                    info!("main funnel exhausted, driving the stream to exit");
                    *phase = Phase::Ending;
                }
                Phase::Ending => return Ok(None),
            }
        }
    }

    fn place(&mut self, item: GenData) -> Result<()> {
        match item {
            GenData::Instr(instr) => {
                let addr = instr.addr.unwrap_or(self.state.pc);
                self.store
                    .place_instruction(addr, instr.spec, instr.ops, instr.seq, instr.comment)?;
                self.placed_instructions += 1;
                self.placed_code_bytes += 4;
            }
            GenData::Data(data) => {
                self.store
                    .place_data(data.addr, data.bytes, data.seq, data.comment)?;
            }
            GenData::Reserve { addr, size } => {
                self.store.reserve_code_at(addr, size)?;
            }
        }
        Ok(())
    }

    /// Machine-trap semantics: record the fault and redirect to mtvec.
    fn apply_trap(&mut self, pc_before: u64, trap: Trap) -> Result<()> {
        use crate::isa::csr;

        let mtvec = self.state.csr(csr::MTVEC);
        if mtvec == 0 {
            return Err(TibbarError::UnhandledTrap {
                pc: pc_before,
                cause: trap.cause,
            });
        }
        debug!(
            "trap {} at {pc_before:#x} -> handler {mtvec:#x}",
            trap.cause.identifier()
        );
        self.state.set_csr(csr::MEPC, pc_before);
        self.state.set_csr(csr::MCAUSE, trap.cause.code());
        self.state.set_csr(csr::MTVAL, trap.tval);
        self.state.pc = mtvec & !3;
        Ok(())
    }

    pub fn emitter(&self) -> Emitter<'_> {
        Emitter {
            store: &self.store,
            config: &self.config,
            boot: self.boot_address,
            exit: self.exit_address,
            handler: self.store.trap_handler(),
        }
    }
}
