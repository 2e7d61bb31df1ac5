//! Tibbar generates directed-random RISC-V instruction streams.
//!
//! The engine interleaves four collaborators: a [`memory::MemoryStore`] that
//! tracks what has been placed where, a functional [`model`] that walks the
//! placed code to decide which PC needs the next item, [`seq::Sequence`]
//! producers composed through [`funnel`]s that decide what to place, and a
//! [`resource::Reserver`] that lets independent sequences interleave without
//! register conflicts. The [`engine::Tibbar`] loop drives them until the
//! stream parks on a branch-to-self in the exit region, then [`emit`] renders
//! the result as assembly suitable for a bare-metal testbench.

pub mod config;
pub mod emit;
pub mod engine;
pub mod funnel;
pub mod isa;
pub mod layout;
pub mod memory;
pub mod model;
pub mod resource;
pub mod seq;
pub mod suites;

use thiserror::Error;

pub use engine::Tibbar;
pub use suites::Generator;

pub type Result<T> = std::result::Result<T, TibbarError>;

#[derive(Debug, Error)]
pub enum TibbarError {
    #[error("invalid resource request: {0}")]
    InvalidResource(String),
    #[error("out of space in {region} region (need {needed:#x} bytes)")]
    OutOfSpace { region: &'static str, needed: u64 },
    #[error("placement conflict at {addr:#x}: range already holds {existing}")]
    PlacementConflict { addr: u64, existing: String },
    #[error("branch target {addr:#x} lies outside the configured code bank")]
    UnplacedTarget { addr: u64 },
    #[error("trap {cause:?} at pc {pc:#x} before a handler was installed")]
    UnhandledTrap { pc: u64, cause: isa::TrapCause },
    #[error("control flow escaped the code bank: pc {from:#x} -> {to:#x} ({instr})")]
    ControlFlowEscape { from: u64, to: u64, instr: String },
    #[error("{0}")]
    EngineHung(String),
    #[error("memory config error: {0}")]
    Config(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
