//! Sequences: lazy, finite producers of generated items.
//!
//! A sequence is an explicit state machine pulled one item at a time. It
//! declares its register needs up front ([`Sequence::resource_requests`]),
//! receives its [`Claim`] before the first item, and consults the memory
//! store and execution state read-mostly through the per-call [`SeqCtx`].

pub mod branch;
pub mod defaults;
pub mod float;
pub mod hazard;
pub mod ldst;
pub mod loadgpr;
pub mod random;

use rand::rngs::StdRng;

use crate::isa::{Catalog, Operands, Spec};
use crate::memory::MemoryStore;
use crate::model::ExecutionState;
use crate::resource::{Claim, ClaimSpec, Reserver};

/// Everything a sequence may consult between yields.
pub struct SeqCtx<'a> {
    pub rng: &'a mut StdRng,
    pub store: &'a mut MemoryStore,
    pub state: &'a ExecutionState,
    pub catalog: &'a Catalog,
    pub reserver: &'a mut Reserver,
    /// PC the next positionless instruction will be placed at.
    pub pc: u64,
}

/// An instruction to place, at the current PC unless `addr` is set.
#[derive(Clone, Debug)]
pub struct InstrItem {
    pub spec: &'static Spec,
    pub ops: Operands,
    pub addr: Option<u64>,
    pub seq: &'static str,
    pub comment: String,
}

impl InstrItem {
    pub fn new(spec: &'static Spec, ops: Operands, seq: &'static str, comment: String) -> Self {
        Self {
            spec,
            ops,
            addr: None,
            seq,
            comment,
        }
    }

    pub fn at(mut self, addr: u64) -> Self {
        self.addr = Some(addr);
        self
    }
}

/// Bytes for the data region, at an address the sequence already allocated.
#[derive(Clone, Debug)]
pub struct DataItem {
    pub addr: u64,
    pub bytes: Vec<u8>,
    pub seq: &'static str,
    pub comment: String,
}

/// One generated item.
#[derive(Clone, Debug)]
pub enum GenData {
    Instr(InstrItem),
    Data(DataItem),
    /// Pre-reserve a code range that a later branch will target.
    Reserve { addr: u64, size: u64 },
}

pub trait Sequence {
    fn name(&self) -> &'static str;

    /// Register needs; granted atomically before the first item.
    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::default()
    }

    /// Injected by the funnel after a successful reservation.
    fn set_claim(&mut self, _claim: &Claim) {}

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData>;
}
