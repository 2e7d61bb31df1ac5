//! Float value generation and float stress sequences.
//!
//! [`FloatGen`] produces f32/f64 bit patterns with weighted exponent and
//! mantissa bands so sweeps hit subnormals, near-overflow values, NaNs and
//! infinities. Single-precision patterns are NaN-boxed most of the time.

use std::collections::VecDeque;

use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::isa::{Operands, Spec, DOUBLE};
use crate::resource::{ClaimItem, ClaimSpec, Namespace, ResourceId};

use super::loadgpr::load_gpr_plan;
use super::{DataItem, GenData, InstrItem, SeqCtx, Sequence};

const SINGLE_EXP_W: u32 = 8;
const SINGLE_MANT_W: u32 = 23;
const DOUBLE_EXP_W: u32 = 11;
const DOUBLE_MANT_W: u32 = 52;

const BOXED: u64 = 0xFFFF_FFFF_0000_0000;

/// Value magnitude band for exponent / mantissa sampling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Band {
    Max,
    NearMax,
    Large,
    Medium,
    Small,
    NearMin,
    Min,
}

pub const BANDS: [Band; 7] = [
    Band::Max,
    Band::NearMax,
    Band::Large,
    Band::Medium,
    Band::Small,
    Band::NearMin,
    Band::Min,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Nan,
    Inf,
    Num,
}

fn pack(sign: u64, exponent: u64, mantissa: u64, f64sel: bool) -> u64 {
    if f64sel {
        (sign << 63)
            | ((exponent & ((1 << DOUBLE_EXP_W) - 1)) << DOUBLE_MANT_W)
            | (mantissa & ((1 << DOUBLE_MANT_W) - 1))
    } else {
        (sign << 31)
            | ((exponent & ((1 << SINGLE_EXP_W) - 1)) << SINGLE_MANT_W)
            | (mantissa & ((1 << SINGLE_MANT_W) - 1))
    }
}

fn rand_range(rng: &mut StdRng, lo: u64, hi: u64) -> u64 {
    if lo >= hi {
        lo
    } else {
        rng.gen_range(lo..hi)
    }
}

/// Weighted float bit-pattern generator.
pub struct FloatGen {
    pub p_negative: f64,
    pub p_boxed: f64,
}

impl Default for FloatGen {
    fn default() -> Self {
        Self::new()
    }
}

impl FloatGen {
    pub fn new() -> Self {
        Self {
            p_negative: 0.5,
            p_boxed: 0.95,
        }
    }

    /// Fully randomized pattern: NaN/Inf/finite weighted 1/1/10, all bands.
    pub fn gen_any(&self, rng: &mut StdRng, p_f64: f64) -> u64 {
        let f64sel = rng.gen_bool(p_f64.clamp(0.0, 1.0));
        let negative = rng.gen_bool(self.p_negative);
        let kind = match rng.gen_range(0u32..12) {
            0 => Kind::Nan,
            1 => Kind::Inf,
            _ => Kind::Num,
        };
        let exp_band = weighted_band(rng);
        let mant_band = weighted_band(rng);
        self.sample(rng, f64sel, negative, kind, exp_band, mant_band)
    }

    /// Finite number with pinned sign and bands; used by the stress matrix.
    pub fn gen_num(
        &self,
        rng: &mut StdRng,
        f64sel: bool,
        negative: bool,
        exp_band: Band,
        mant_band: Band,
    ) -> u64 {
        self.sample(rng, f64sel, negative, Kind::Num, exp_band, mant_band)
    }

    fn sample(
        &self,
        rng: &mut StdRng,
        f64sel: bool,
        negative: bool,
        kind: Kind,
        exp_band: Band,
        mant_band: Band,
    ) -> u64 {
        let (exp_w, mant_w) = if f64sel {
            (DOUBLE_EXP_W, DOUBLE_MANT_W)
        } else {
            (SINGLE_EXP_W, SINGLE_MANT_W)
        };
        let exp_25 = 1u64 << (exp_w - 2);
        let exp_75 = (1u64 << (exp_w - 1)) + exp_25;
        let exp_special = (1u64 << exp_w) - 1;
        let exp_max = exp_special - 1;
        let mant_25 = 1u64 << (mant_w - 2);
        let mant_75 = (1u64 << (mant_w - 1)) + mant_25;
        let mant_max = (1u64 << mant_w) - 1;
        let mant_quiet = 1u64 << (mant_w - 1);

        let exponent = match kind {
            Kind::Nan | Kind::Inf => exp_special,
            Kind::Num => match exp_band {
                Band::Min => 0,
                Band::NearMin => rand_range(rng, 1, 4),
                Band::Small => rand_range(rng, 4, exp_25),
                Band::Medium => rand_range(rng, exp_25, exp_75),
                Band::Large => rand_range(rng, exp_75, exp_max - 3),
                Band::NearMax => rand_range(rng, exp_max - 3, exp_max),
                Band::Max => exp_max,
            },
        };

        let mantissa = match kind {
            Kind::Inf => 0,
            _ => match mant_band {
                Band::Min => {
                    if kind == Kind::Nan {
                        mant_quiet
                    } else {
                        0
                    }
                }
                Band::NearMin => rand_range(rng, 1, 8),
                Band::Small => rand_range(rng, 8, mant_25),
                Band::Medium => rand_range(rng, mant_25, mant_75),
                Band::Large => rand_range(rng, mant_75, mant_max - 7),
                Band::NearMax => rand_range(rng, mant_max - 7, mant_max),
                Band::Max => mant_max,
            },
        };

        let mut bits = pack(negative as u64, exponent, mantissa, f64sel);
        if !f64sel && rng.gen_bool(self.p_boxed) {
            bits = (bits & 0xFFFF_FFFF) | BOXED;
        }
        bits
    }
}

fn weighted_band(rng: &mut StdRng) -> Band {
    // Weights 1/2/5/5/5/2/1 in BANDS order.
    match rng.gen_range(0u32..21) {
        0 => Band::Max,
        1..=2 => Band::NearMax,
        3..=7 => Band::Large,
        8..=12 => Band::Medium,
        13..=17 => Band::Small,
        18..=19 => Band::NearMin,
        _ => Band::Min,
    }
}

fn fpr_claim() -> ClaimSpec {
    ClaimSpec {
        exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(1))],
        shared: vec![ClaimItem::Any {
            namespace: Namespace::Fpr,
            count: 32,
        }],
    }
}

/// Pool base register used by every FPR setup prologue.
const POOL_BASE: u8 = 1;

/// Allocate a value pool and build the `fld` prologue filling all 32 FPRs.
/// `None` when the data region is exhausted.
pub fn set_fprs_plan(
    ctx: &mut SeqCtx<'_>,
    p_f64: f64,
    seq: &'static str,
) -> Option<Vec<GenData>> {
    let gen = FloatGen::new();
    let base = ctx.store.allocate_data(32 * 8, 8)?;
    let mut out = load_gpr_plan(ctx.catalog, POOL_BASE, base, seq);
    for i in 0..32u8 {
        let bits = gen.gen_any(ctx.rng, p_f64);
        let offset = i as u64 * 8;
        out.push(GenData::Data(DataItem {
            addr: base + offset,
            bytes: bits.to_le_bytes().to_vec(),
            seq,
            comment: format!("f{i} value {bits:#018x}"),
        }));
        out.push(GenData::Instr(InstrItem::new(
            ctx.catalog.spec(crate::isa::Op::Fld),
            Operands {
                rd: i,
                rs1: POOL_BASE,
                imm: offset as i64,
                ..Default::default()
            },
            seq,
            format!("fld f{i}, {offset}(x{POOL_BASE})"),
        )));
    }
    Some(out)
}

fn is_double(spec: &Spec) -> bool {
    spec.flags & DOUBLE != 0
}

/// Stress float forms with exactly one FPR source across a polarity and
/// exponent/mantissa band matrix.
pub struct StressSingleFprSource {
    queue: VecDeque<GenData>,
    started: bool,
}

impl StressSingleFprSource {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for StressSingleFprSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for StressSingleFprSource {
    fn name(&self) -> &'static str {
        "StressSingleFprSource"
    }

    fn resource_requests(&self) -> ClaimSpec {
        fpr_claim()
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            self.queue = build_stress(ctx, self.name(), false)?.into();
        }
        self.queue.pop_front()
    }
}

/// Stress float forms with two FPR sources: one swept across the band
/// matrix, the other loaded with a random pattern.
pub struct StressMultiFprSource {
    queue: VecDeque<GenData>,
    started: bool,
}

impl StressMultiFprSource {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for StressMultiFprSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for StressMultiFprSource {
    fn name(&self) -> &'static str {
        "StressMultiFprSource"
    }

    fn resource_requests(&self) -> ClaimSpec {
        fpr_claim()
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        if !self.started {
            self.started = true;
            self.queue = build_stress(ctx, self.name(), true)?.into();
        }
        self.queue.pop_front()
    }
}

fn build_stress(
    ctx: &mut SeqCtx<'_>,
    seq: &'static str,
    multi_source: bool,
) -> Option<Vec<GenData>> {
    let gen = FloatGen::new();
    let catalog = ctx.catalog;
    let forms = catalog.forms_where(|s| {
        if multi_source {
            s.fpr_source_count() >= 1
        } else {
            s.fpr_source_count() == 1
        }
    });
    if forms.is_empty() {
        return None;
    }
    let spec = forms[ctx.rng.gen_range(0..forms.len())];
    let f64sel = is_double(spec);
    let dest = ctx.rng.gen_range(0..32u8);
    let srcs: Vec<u8> = (0..spec.fpr_source_count())
        .map(|_| ctx.rng.gen_range(0..32u8))
        .collect();
    let stressed = ctx.rng.gen_range(0..srcs.len());

    // Polarity x exponent band x mantissa band, one slot per sweep point
    // plus one per non-stressed source.
    let sweep = 2 * BANDS.len() * BANDS.len();
    let slots = (sweep + srcs.len()) as u64;
    let base = match ctx.store.allocate_data(slots * 8, 8) {
        Some(base) => base,
        None => {
            debug!("{seq}: data region exhausted");
            return None;
        }
    };

    let mut out = load_gpr_plan(catalog, POOL_BASE, base, seq);
    let mut offset = 0u64;
    let load = |out: &mut Vec<GenData>, reg: u8, bits: u64, offset: &mut u64| {
        out.push(GenData::Data(DataItem {
            addr: base + *offset,
            bytes: bits.to_le_bytes().to_vec(),
            seq,
            comment: format!("f{reg} value {bits:#018x}"),
        }));
        out.push(GenData::Instr(InstrItem::new(
            catalog.spec(crate::isa::Op::Fld),
            Operands {
                rd: reg,
                rs1: POOL_BASE,
                imm: *offset as i64,
                ..Default::default()
            },
            seq,
            format!("fld f{reg}, {}(x{POOL_BASE})", offset),
        )));
        *offset += 8;
    };

    for (i, reg) in srcs.iter().enumerate() {
        if i != stressed {
            let bits = gen.gen_any(ctx.rng, if f64sel { 1.0 } else { 0.0 });
            load(&mut out, *reg, bits, &mut offset);
        }
    }

    let ops = Operands {
        rd: dest,
        rs1: srcs[0],
        rs2: srcs.get(1).copied().unwrap_or(0),
        imm: 0,
    };
    for negative in [false, true] {
        for exp_band in BANDS {
            for mant_band in BANDS {
                let bits = gen.gen_num(ctx.rng, f64sel, negative, exp_band, mant_band);
                load(&mut out, srcs[stressed], bits, &mut offset);
                out.push(GenData::Instr(InstrItem::new(
                    spec,
                    ops,
                    seq,
                    crate::isa::asm(catalog, spec, ops),
                )));
            }
        }
    }
    Some(out)
}

/// fdiv / fsqrt sweeps over the full FPR file after a SetFPRs prologue.
pub struct FloatDivSqrt {
    queue: VecDeque<GenData>,
    started: bool,
}

impl FloatDivSqrt {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            started: false,
        }
    }
}

impl Default for FloatDivSqrt {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for FloatDivSqrt {
    fn name(&self) -> &'static str {
        "FloatDivSqrt"
    }

    fn resource_requests(&self) -> ClaimSpec {
        fpr_claim()
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        use crate::isa::Op;
        if !self.started {
            self.started = true;
            let choices = [Op::FdivS, Op::FdivD, Op::FsqrtS, Op::FsqrtD];
            let op = choices[ctx.rng.gen_range(0..choices.len())];
            let spec = ctx.catalog.spec(op);
            let p_f64 = if is_double(spec) { 1.0 } else { 0.0 };
            let Some(plan) = set_fprs_plan(ctx, p_f64, self.name()) else {
                debug!("{}: data region exhausted", self.name());
                return None;
            };
            let mut queue: VecDeque<GenData> = plan.into();
            let dest = ctx.rng.gen_range(0..32u8);
            if spec.fpr_source_count() == 1 {
                for src in 0..32u8 {
                    let ops = Operands {
                        rd: dest,
                        rs1: src,
                        ..Default::default()
                    };
                    queue.push_back(GenData::Instr(InstrItem::new(
                        spec,
                        ops,
                        self.name(),
                        crate::isa::asm(ctx.catalog, spec, ops),
                    )));
                }
            } else {
                for src1 in 0..32u8 {
                    for src2 in 0..32u8 {
                        let ops = Operands {
                            rd: dest,
                            rs1: src1,
                            rs2: src2,
                            imm: 0,
                        };
                        queue.push_back(GenData::Instr(InstrItem::new(
                            spec,
                            ops,
                            self.name(),
                            crate::isa::asm(ctx.catalog, spec, ops),
                        )));
                    }
                }
            }
            self.queue = queue;
        }
        self.queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn finite_patterns_stay_inside_their_bands() {
        let gen = FloatGen::new();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let bits = gen.gen_num(&mut rng, true, false, Band::Medium, Band::Small);
            let exponent = (bits >> DOUBLE_MANT_W) & 0x7FF;
            assert!(exponent >= (1 << (DOUBLE_EXP_W - 2)));
            assert!(exponent < (1 << (DOUBLE_EXP_W - 1)) + (1 << (DOUBLE_EXP_W - 2)));
            // finite by construction
            assert_ne!(exponent, 0x7FF);
            assert_eq!(bits >> 63, 0);
        }
    }

    #[test]
    fn max_band_is_the_largest_finite_exponent() {
        let gen = FloatGen::new();
        let mut rng = StdRng::seed_from_u64(7);
        let bits = gen.gen_num(&mut rng, false, true, Band::Max, Band::Min);
        let exponent = (bits >> SINGLE_MANT_W) & 0xFF;
        assert_eq!(exponent, 0xFE);
        assert_eq!((bits >> 31) & 1, 1);
    }

    #[test]
    fn singles_are_nan_boxed_when_requested() {
        let gen = FloatGen {
            p_negative: 0.0,
            p_boxed: 1.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let bits = gen.gen_num(&mut rng, false, false, Band::Medium, Band::Medium);
        assert_eq!(bits & BOXED, BOXED);
    }
}
