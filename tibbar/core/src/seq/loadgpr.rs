//! Scalar materialization: load an arbitrary 64-bit constant into a GPR
//! through a `lui`/`addiw`/`slli`/`addi` expansion.

use crate::isa::{Catalog, Op, Operands};

use super::{GenData, InstrItem};

/// Sign-replicate `val` from `bit` upward.
fn sext_bit(val: u64, bit: u32) -> u64 {
    if bit >= 63 {
        return val;
    }
    let low_mask = (1u64 << (bit + 1)) - 1;
    if (val >> bit) & 1 == 1 {
        val | !low_mask
    } else {
        val & low_mask
    }
}

/// Items that leave `value` in `rd`. Empty for `rd == x0`.
pub fn load_gpr_plan(
    catalog: &Catalog,
    rd: u8,
    value: u64,
    seq: &'static str,
) -> Vec<GenData> {
    let mut out = Vec::new();
    if rd != 0 {
        emit(catalog, rd, value, seq, &mut out);
    }
    out
}

fn emit(catalog: &Catalog, rd: u8, value: u64, seq: &'static str, out: &mut Vec<GenData>) {
    if value == sext_bit(value, 31) {
        // Fits lui + addiw.
        let u20 = (value.wrapping_add(0x800) >> 12) & 0xF_FFFF;
        let l12 = sext_bit(value, 11) as i64;
        let mut src = 0u8;
        if u20 != 0 {
            out.push(GenData::Instr(InstrItem::new(
                catalog.spec(Op::Lui),
                Operands {
                    rd,
                    imm: u20 as i64,
                    ..Default::default()
                },
                seq,
                format!("lui x{rd}, {u20:#x}"),
            )));
            src = rd;
        }
        if l12 != 0 || u20 == 0 {
            out.push(GenData::Instr(InstrItem::new(
                catalog.spec(Op::Addiw),
                Operands {
                    rd,
                    rs1: src,
                    imm: l12,
                    ..Default::default()
                },
                seq,
                format!("addiw x{rd}, x{src}, {l12}"),
            )));
        }
        return;
    }

    // Split: materialize the upper part, shift it into position, patch the
    // low 12 bits.
    let l12 = sext_bit(value, 11) as i64;
    let u52 = value.wrapping_add(0x800) >> 12;
    debug_assert!(u52 != 0);
    let shamt = 12 + u52.trailing_zeros();
    let upper = sext_bit(u52 >> (shamt - 12), 64 - shamt);
    emit(catalog, rd, upper, seq, out);
    out.push(GenData::Instr(InstrItem::new(
        catalog.spec(Op::Slli),
        Operands {
            rd,
            rs1: rd,
            imm: shamt as i64,
            ..Default::default()
        },
        seq,
        format!("slli x{rd}, x{rd}, {shamt}"),
    )));
    if l12 != 0 {
        out.push(GenData::Instr(InstrItem::new(
            catalog.spec(Op::Addi),
            Operands {
                rd,
                rs1: rd,
                imm: l12,
                ..Default::default()
            },
            seq,
            format!("addi x{rd}, x{rd}, {l12}"),
        )));
    }
}
