//! Named test suites.
//!
//! A suite bundles the start / main / relocate / end producers the engine
//! drives. The main funnel compositions mirror what each suite is meant to
//! stress; lengths are drawn from the engine RNG so the whole run stays a
//! function of the seed.

use rand::Rng;

use crate::engine::Tibbar;
use crate::funnel::SimpleFunnel;
use crate::seq::branch::RelativeBranching;
use crate::seq::defaults::{
    DefaultProgramEnd, DefaultProgramStart, DefaultRelocate, SetFprs, SetGprs,
};
use crate::seq::float::{FloatDivSqrt, StressMultiFprSource, StressSingleFprSource};
use crate::seq::hazard::Hazards;
use crate::seq::ldst::{Load, LoadException, Store};
use crate::seq::random::{RandomFloatInstrs, RandomSafeInstrs};
use crate::seq::Sequence;
use crate::{Result, TibbarError};

pub const SUITE_NAMES: [&str; 7] = [
    "simple",
    "ldst",
    "ldst_exception",
    "rel_branching",
    "hazard",
    "float",
    "stress_float",
];

/// The producers one generation run is driven by.
pub struct Generator {
    pub start: Box<dyn Sequence>,
    pub main: Box<dyn Sequence>,
    pub end: Box<dyn Sequence>,
    pub relocate: Box<dyn Fn() -> Box<dyn Sequence>>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("start", &self.start.name())
            .field("main", &self.main.name())
            .field("end", &self.end.name())
            .finish()
    }
}

impl Generator {
    fn with_main(main: SimpleFunnel) -> Self {
        Self {
            start: Box::new(DefaultProgramStart::new()),
            main: Box::new(main),
            end: Box::new(DefaultProgramEnd::new()),
            relocate: Box::new(|| Box::new(DefaultRelocate::new())),
        }
    }
}

/// Build a registered suite. Unknown names list the registry.
pub fn build(name: &str, engine: &mut Tibbar) -> Result<Generator> {
    let mut main = SimpleFunnel::new();
    match name {
        "simple" => {
            for _ in 0..25 {
                let length = engine.rng_mut().gen_range(1..=100);
                main.add(Box::new(RandomSafeInstrs::new(length)));
                main.add(Box::new(RelativeBranching::new()));
            }
        }
        "ldst" => {
            for _ in 0..25 {
                for _ in 0..20 {
                    main.add(Box::new(Load::new()));
                    main.add(Box::new(Store::new()));
                }
            }
        }
        "ldst_exception" => {
            for _ in 0..25 {
                for _ in 0..50 {
                    main.add(Box::new(LoadException::new()));
                    main.add(Box::new(Store::new()));
                }
                main.add(Box::new(RelativeBranching::new()));
            }
        }
        "rel_branching" => {
            for _ in 0..100 {
                let length = engine.rng_mut().gen_range(1..=5);
                main.add(Box::new(RandomSafeInstrs::new(length)));
                for _ in 0..10 {
                    main.add(Box::new(RelativeBranching::new()));
                }
            }
        }
        "hazard" => {
            for _ in 0..25 {
                main.add(Box::new(SetGprs::new(true)));
                main.add(Box::new(RandomSafeInstrs::new(10)));
                main.add(Box::new(Hazards::new()));
                for _ in 0..10 {
                    main.add(Box::new(Load::new()));
                    main.add(Box::new(Store::new()));
                }
            }
        }
        "float" => {
            main.add(Box::new(SetFprs::new(0.5)));
            for _ in 0..25 {
                let length = engine.rng_mut().gen_range(50..=200);
                main.add(Box::new(RandomFloatInstrs::new(length)));
                main.add(Box::new(RelativeBranching::new()));
            }
        }
        "stress_float" => {
            for _ in 0..10 {
                main.add(Box::new(StressSingleFprSource::new()));
                main.add(Box::new(StressMultiFprSource::new()));
            }
            main.add(Box::new(FloatDivSqrt::new()));
        }
        other => {
            return Err(TibbarError::Config(format!(
                "unknown generator '{other}'; registered suites: {}",
                SUITE_NAMES.join(", ")
            )))
        }
    }
    Ok(Generator::with_main(main))
}
