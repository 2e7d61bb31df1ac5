//! End-to-end generation runs against the suite registry.

use tibbar_core::config::MemoryConfig;
use tibbar_core::memory::PlacementKind;
use tibbar_core::{suites, Tibbar};

fn run(name: &str, seed: u64, config: MemoryConfig) -> Tibbar {
    let mut engine = Tibbar::new(seed, config).expect("engine setup");
    let mut generator = suites::build(name, &mut engine).expect("known suite");
    engine.create_test(&mut generator).expect("generation");
    engine
}

fn run_default(name: &str, seed: u64) -> Tibbar {
    run(name, seed, MemoryConfig::default_config())
}

#[test]
fn simple_suite_reaches_exit_inside_the_code_bank() {
    let engine = run_default("simple", 42);
    let boot = engine.boot_address();
    let exit = engine.exit_address().expect("stream parked");
    assert!((0x8000_0000..0x8004_0000).contains(&boot));
    assert!((0x8000_0000..0x8004_0000).contains(&exit));
    assert_ne!(exit, 0);
    assert_ne!(exit, boot);

    assert!(engine.placed_instructions() > 0);

    let asm = engine.emitter().assembly();
    assert!(asm.contains("# Load address: 0x80000000"));
    assert!(asm.contains("# RAM size: 0x40000"));
    assert!(asm.contains("# Data region: 0x80040000"));
    assert!(asm.contains(&format!("# Boot: {boot:#x}")));
    assert!(asm.contains(&format!("# Exit: {exit:#x}")));
    assert!(asm.contains("_start:"));
    assert!(asm.contains("_exit:"));
}

#[test]
fn generation_is_deterministic_per_seed() {
    let a = run_default("simple", 42).emitter().assembly();
    let b = run_default("simple", 42).emitter().assembly();
    assert_eq!(a, b);
    let c = run_default("simple", 43).emitter().assembly();
    assert_ne!(a, c);
}

#[test]
fn placements_are_disjoint_after_a_run() {
    let engine = run_default("ldst", 1);
    let mut ranges: Vec<(u64, u64)> = engine
        .store()
        .placements()
        .map(|(addr, p)| (addr, addr + p.byte_size()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "overlapping placements: {:#x?} and {:#x?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn ldst_suite_keeps_data_in_the_data_region() {
    let engine = run_default("ldst", 1);
    let (data_lo, data_hi) = engine.store().data_region();
    let mut loads = 0;
    let mut stores = 0;
    let mut cells = 0;
    for (addr, placement) in engine.store().placements() {
        match &placement.kind {
            PlacementKind::Data { bytes } => {
                cells += 1;
                assert!(addr >= data_lo && addr + bytes.len() as u64 <= data_hi);
            }
            PlacementKind::Instruction { spec, ops, .. } => {
                if placement.seq == "Load" && spec.is_load() {
                    loads += 1;
                    // base register comes from the claim; the access offset
                    // is always zero so the base must hold the cell address
                    assert_eq!(ops.imm, 0);
                }
                if placement.seq == "Store" && spec.is_store() {
                    stores += 1;
                    assert_eq!(ops.imm, 0);
                }
            }
        }
    }
    assert!(loads > 0, "no loads placed");
    assert!(stores > 0, "no stores placed");
    assert!(cells > 0, "no data cells placed");
}

#[test]
fn ldst_exception_suite_places_faulting_loads_and_a_handler() {
    let engine = run_default("ldst_exception", 7);
    let handler = engine.store().trap_handler().expect("handler installed");
    assert!(engine.store().is_placed(handler));

    let mut faulting = 0;
    for (_, placement) in engine.store().placements() {
        if let PlacementKind::Instruction { spec, ops, .. } = &placement.kind {
            if placement.seq == "LoadException" && spec.is_load() {
                assert_eq!(ops.rs1, 0, "faulting load must use x0 as base");
                assert_ne!(ops.imm, 0, "faulting load needs a non-zero offset");
                faulting += 1;
            }
        }
    }
    assert!(faulting > 0, "no faulting loads placed");
}

#[test]
fn hazard_suite_produces_adjacent_dependent_pairs() {
    let engine = run_default("hazard", 3);
    let mut pairs = 0;
    for (addr, placement) in engine.store().placements() {
        let PlacementKind::Instruction { spec, ops, .. } = &placement.kind else {
            continue;
        };
        if placement.seq != "Hazards" || !spec.has_gpr_dest() || ops.rd == 0 {
            continue;
        }
        if let Some(next) = engine.store().instruction_at(addr + 4) {
            let (next_spec, next_ops, _) = next;
            if next_spec.gpr_sources(next_ops).contains(&ops.rd) {
                pairs += 1;
            }
        }
    }
    assert!(pairs >= 1, "no read-after-write pairs found");
}

#[test]
fn unified_bank_with_configured_boot_starts_at_the_base() {
    let config = MemoryConfig::from_yaml_str(
        r#"
memory:
  banks:
    - name: ram
      base: 0x80000000
      size: 0x100000
      code: true
      data: true
      access: rwx
  boot: 0
"#,
    )
    .unwrap();
    let engine = run("ldst", 5, config);
    assert_eq!(engine.boot_address(), 0x8000_0000);

    let asm = engine.emitter().assembly();
    assert!(!asm.contains("# Data region:"));

    // data lives in the reserve carved from the top of the bank
    let (data_lo, data_hi) = engine.store().data_region();
    assert_eq!(data_hi, 0x8010_0000);
    assert_eq!(data_lo, 0x8010_0000 - 0x4_0000);
    for (addr, placement) in engine.store().placements() {
        if placement.is_data() {
            assert!(addr >= data_lo);
        }
    }
}

#[test]
fn float_suites_complete() {
    run_default("float", 11);
    run_default("stress_float", 13);
    run_default("rel_branching", 2);
}

#[test]
fn unknown_suite_is_a_config_error() {
    let mut engine = Tibbar::new(42, MemoryConfig::default_config()).unwrap();
    let err = suites::build("nope", &mut engine).unwrap_err();
    assert!(err.to_string().contains("unknown generator"));
    assert!(err.to_string().contains("simple"));
}

#[test]
fn branch_targets_are_placed_at_generation_end() {
    let engine = run_default("rel_branching", 9);
    for (addr, placement) in engine.store().placements() {
        if let PlacementKind::Instruction { spec, ops, .. } = &placement.kind {
            if let Some(target) = tibbar_core::isa::branch_target(spec, *ops, addr) {
                assert!(
                    engine.store().instruction_at(target).is_some(),
                    "target {target:#x} of branch at {addr:#x} was never filled"
                );
            }
        }
    }
    assert!(engine.store().unfilled_targets().is_empty());
}

#[test]
fn debug_yaml_reconstructs_the_run() {
    let engine = run_default("simple", 42);
    let yaml = engine.emitter().debug_yaml().unwrap();
    assert!(yaml.contains("load_addr:"));
    assert!(yaml.contains("0x80000000"));
    assert!(yaml.contains("boot_address:"));
    assert!(yaml.contains("memory_banks:"));
    assert!(yaml.contains("kind: instruction"));
}

#[test]
fn linker_script_matches_the_banks() {
    let engine = run_default("simple", 42);
    let ld = engine.emitter().linker_script();
    assert!(ld.contains("OUTPUT_ARCH(riscv)"));
    assert!(ld.contains("ENTRY(_start)"));
    assert!(ld.contains("CODE (rx) : ORIGIN = 0x80000000, LENGTH = 0x40000"));
    assert!(ld.contains("DATA (rw) : ORIGIN = 0x80040000, LENGTH = 0x40000"));
    assert!(ld.contains("__stack_top = ORIGIN(DATA) + LENGTH(DATA);"));
}
