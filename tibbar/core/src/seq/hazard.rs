//! Read-after-write hazard pairs.

use rand::Rng;

use crate::isa::{Format, Operands};
use crate::resource::{Claim, ClaimSpec};

use super::{GenData, InstrItem, SeqCtx, Sequence};

/// Two adjacent instructions sharing one GPR: the first writes it, the
/// second reads it.
pub struct Hazards {
    claim: Option<Claim>,
    emitted: u8,
    reader: Option<GenData>,
}

impl Hazards {
    pub fn new() -> Self {
        Self {
            claim: None,
            emitted: 0,
            reader: None,
        }
    }
}

impl Default for Hazards {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequence for Hazards {
    fn name(&self) -> &'static str {
        "Hazards"
    }

    fn resource_requests(&self) -> ClaimSpec {
        ClaimSpec::exclusive_gprs(1)
    }

    fn set_claim(&mut self, claim: &Claim) {
        self.claim = Some(claim.clone());
    }

    fn next(&mut self, ctx: &mut SeqCtx<'_>) -> Option<GenData> {
        match self.emitted {
            0 => {
                self.emitted = 1;
                let name = self.name();
                let hazard_reg = self
                    .claim
                    .as_ref()
                    .and_then(|c| c.exclusive_gprs().first().copied())
                    .unwrap_or(5);

                let writers = ctx
                    .catalog
                    .forms_where(|s| s.is_safe() && s.has_gpr_dest());
                let readers = ctx.catalog.forms_where(|s| {
                    s.is_safe() && matches!(s.format, Format::R | Format::I | Format::Shift)
                });
                let writer = writers[ctx.rng.gen_range(0..writers.len())];
                let reader = readers[ctx.rng.gen_range(0..readers.len())];

                let writer_ops = Operands {
                    rd: hazard_reg,
                    rs1: hazard_reg,
                    rs2: hazard_reg,
                    imm: match writer.format {
                        Format::I => ctx.rng.gen_range(-2048i64..2048),
                        Format::Shift => ctx.rng.gen_range(0i64..32),
                        Format::U => ctx.rng.gen_range(0i64..(1 << 20)),
                        _ => 0,
                    },
                };
                let reader_ops = Operands {
                    rd: hazard_reg,
                    rs1: hazard_reg,
                    rs2: hazard_reg,
                    imm: match reader.format {
                        Format::I => ctx.rng.gen_range(-2048i64..2048),
                        Format::Shift => ctx.rng.gen_range(0i64..32),
                        _ => 0,
                    },
                };
                self.reader = Some(GenData::Instr(InstrItem::new(
                    reader,
                    reader_ops,
                    name,
                    crate::isa::asm(ctx.catalog, reader, reader_ops),
                )));
                Some(GenData::Instr(InstrItem::new(
                    writer,
                    writer_ops,
                    name,
                    crate::isa::asm(ctx.catalog, writer, writer_ops),
                )))
            }
            1 => {
                self.emitted = 2;
                self.reader.take()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::isa::Catalog;
    use crate::layout::AddressMap;
    use crate::memory::MemoryStore;
    use crate::model::ExecutionState;
    use crate::resource::{Reserver, ResourceSpace};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn pair_shares_the_hazard_register() {
        let catalog = Catalog::new();
        let cfg = MemoryConfig::default_config();
        let mut store = MemoryStore::new(AddressMap::from_config(&cfg).unwrap());
        let mut rng = StdRng::seed_from_u64(3);
        let state = ExecutionState::new();
        let mut reserver = Reserver::new(ResourceSpace::for_catalog(&catalog));

        let mut seq = Hazards::new();
        let claim = reserver.request(&seq.resource_requests()).unwrap().unwrap();
        seq.set_claim(&claim);

        let mut items = Vec::new();
        loop {
            let mut ctx = SeqCtx {
                rng: &mut rng,
                store: &mut store,
                state: &state,
                catalog: &catalog,
                reserver: &mut reserver,
                pc: 0x8000_0000,
            };
            match seq.next(&mut ctx) {
                Some(item) => items.push(item),
                None => break,
            }
        }
        assert_eq!(items.len(), 2);
        let GenData::Instr(writer) = &items[0] else {
            panic!("expected instruction")
        };
        let GenData::Instr(reader) = &items[1] else {
            panic!("expected instruction")
        };
        let hazard = claim.exclusive_gprs()[0];
        assert_eq!(writer.ops.rd, hazard);
        assert!(reader.spec.gpr_sources(reader.ops).contains(&hazard));
    }
}
