//! Functional execution state and the single-step model.

use std::collections::BTreeMap;

use crate::isa::{self, Trap, TrapCause};
use crate::memory::MemoryStore;

/// Architectural state walked by the engine.
///
/// `x0` reads as zero and ignores writes. CSRs are sparse; unset addresses
/// read as zero.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub pc: u64,
    gpr: [u64; 32],
    fpr: [u64; 32],
    csr: BTreeMap<u16, u64>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            pc: 0,
            gpr: [0; 32],
            fpr: [0; 32],
            csr: BTreeMap::new(),
        }
    }

    pub fn gpr(&self, index: u8) -> u64 {
        if index == 0 {
            0
        } else {
            self.gpr[index as usize & 31]
        }
    }

    pub fn set_gpr(&mut self, index: u8, value: u64) {
        if index != 0 {
            self.gpr[index as usize & 31] = value;
        }
    }

    pub fn fpr(&self, index: u8) -> u64 {
        self.fpr[index as usize & 31]
    }

    pub fn set_fpr(&mut self, index: u8, value: u64) {
        self.fpr[index as usize & 31] = value;
    }

    pub fn csr(&self, address: u16) -> u64 {
        self.csr.get(&address).copied().unwrap_or(0)
    }

    pub fn set_csr(&mut self, address: u16, value: u64) {
        self.csr.insert(address, value);
    }
}

/// Result of one model step.
#[derive(Copy, Clone, Debug)]
pub struct StepOutcome {
    pub pc_before: u64,
    pub pc_after: u64,
    pub trap: Option<Trap>,
}

/// Execute the instruction placed at `state.pc`.
///
/// An unplaced fetch address raises an instruction access fault instead of
/// advancing. On a trap the state (including `pc`) is untouched; the caller
/// owns the redirect to the handler.
pub fn step(state: &mut ExecutionState, mem: &mut MemoryStore) -> StepOutcome {
    let pc_before = state.pc;
    let Some((spec, ops, _)) = mem.instruction_at(pc_before) else {
        return StepOutcome {
            pc_before,
            pc_after: pc_before,
            trap: Some(Trap {
                cause: TrapCause::InstructionAccessFault,
                tval: pc_before,
            }),
        };
    };
    let trap = isa::exec::execute(spec, ops, state, mem);
    StepOutcome {
        pc_before,
        pc_after: state.pc,
        trap,
    }
}
