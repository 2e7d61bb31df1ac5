//! Output rendering: assembly text, linker script and the debug dump.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::config::MemoryConfig;
use crate::isa::{self, Catalog, Format};
use crate::memory::{MemoryStore, PlacementKind};
use crate::Result;

/// Renders a finished memory store.
pub struct Emitter<'a> {
    pub store: &'a MemoryStore,
    pub config: &'a MemoryConfig,
    pub boot: u64,
    pub exit: Option<u64>,
    pub handler: Option<u64>,
}

impl Emitter<'_> {
    /// The assembly file: commented header, `.text` with one instruction per
    /// line (absolute address in a trailing comment), `.data` for placed
    /// bytes. Section offsets are bank-relative so the linker script can
    /// position each section at its bank base.
    pub fn assembly(&self) -> String {
        let catalog = Catalog::new();
        let map = self.store.map();
        let mut lines: Vec<String> = Vec::new();

        lines.push("# Tibbar - RISC-V instruction stream".into());
        lines.push(
            "# Assemble with: riscv64-unknown-elf-as -march=rv64gc -o test.o test.S".into(),
        );
        lines.push(String::new());
        lines.push(format!("# Load address: {:#x}", map.code.base));
        lines.push(format!("# RAM size: {:#x}", map.code.size));
        if !map.unified {
            lines.push(format!(
                "# Data region: {:#x}, size {:#x}",
                map.data.base, map.data.size
            ));
        }
        lines.push(format!("# Boot: {:#x}", self.boot));
        if let Some(exit) = self.exit {
            lines.push(format!("# Exit: {exit:#x}"));
        }
        lines.push(String::new());
        lines.push("  .globl _start".into());
        lines.push(String::new());

        // Branch targets that actually hold an instruction get labels.
        let mut labels: BTreeSet<u64> = BTreeSet::new();
        for (addr, placement) in self.store.placements() {
            if let PlacementKind::Instruction { spec, ops, .. } = &placement.kind {
                if let Some(target) = isa::branch_target(spec, *ops, addr) {
                    if self.store.is_placed(target) {
                        labels.insert(target);
                    }
                }
            }
        }

        lines.push("  .section .text".into());
        lines.push("  .align 2".into());
        lines.push(String::new());
        let mut location = 0u64;
        for (addr, placement) in self.store.placements() {
            let PlacementKind::Instruction { spec, ops, .. } = &placement.kind else {
                continue;
            };
            let offset = addr - map.code.base;
            if offset > location {
                lines.push(format!("  .org {offset:#010x}"));
            }
            location = offset + 4;

            if addr == self.boot {
                lines.push("_start:".into());
            }
            if self.exit == Some(addr) {
                lines.push("  .globl _exit".into());
                lines.push("_exit:".into());
            }
            if labels.contains(&addr) {
                lines.push(format!(".L_tgt_{addr:x}:"));
            }

            let mut text = isa::asm(&catalog, spec, *ops);
            if matches!(spec.format, Format::B | Format::J) {
                if let Some(target) = isa::branch_target(spec, *ops, addr) {
                    if labels.contains(&target) {
                        if let Some(pos) = text.rfind(", ") {
                            text.truncate(pos + 2);
                            text.push_str(&format!(".L_tgt_{target:x}"));
                        }
                    }
                }
            }
            lines.push(format!("  {text}  # {addr:#018x}"));
        }
        lines.push(String::new());

        let data: Vec<_> = self
            .store
            .placements()
            .filter(|(_, p)| p.is_data())
            .collect();
        if !data.is_empty() {
            lines.push("  .section .data".into());
            lines.push("  .align 8".into());
            lines.push(String::new());
            let mut location = 0u64;
            for (addr, placement) in data {
                let PlacementKind::Data { bytes } = &placement.kind else {
                    continue;
                };
                let offset = addr - map.data.base;
                if offset > location {
                    lines.push(format!("  .org {offset:#010x}"));
                }
                location = offset + bytes.len() as u64;
                lines.push(format!("  {}  # {addr:#018x}", data_directive(bytes)));
            }
            lines.push(String::new());
        }

        lines.join("\n") + "\n"
    }

    /// Linker script matching the configured banks. In unified mode the
    /// carved data reserve becomes its own memory region so `.data` section
    /// offsets stay bank-relative.
    pub fn linker_script(&self) -> String {
        let map = self.store.map();
        let code_len = if map.unified {
            map.data.base - map.code.base
        } else {
            map.code.size
        };
        let mut lines: Vec<String> = Vec::new();
        lines.push("/* Auto-generated by Tibbar. */".into());
        lines.push("OUTPUT_ARCH(riscv)".into());
        lines.push("ENTRY(_start)".into());
        lines.push(String::new());
        lines.push("MEMORY".into());
        lines.push("{".into());
        lines.push(format!(
            "    CODE ({}) : ORIGIN = {:#x}, LENGTH = {:#x}",
            map.code_access.as_str(),
            map.code.base,
            code_len
        ));
        lines.push(format!(
            "    DATA ({}) : ORIGIN = {:#x}, LENGTH = {:#x}",
            if map.data_access.writable() { "rw" } else { "r" },
            map.data.base,
            map.data.size
        ));
        lines.push("}".into());
        lines.push(String::new());
        lines.push("PHDRS".into());
        lines.push("{".into());
        lines.push("    text PT_LOAD FLAGS(5);".into());
        lines.push("    data PT_LOAD FLAGS(6);".into());
        lines.push("}".into());
        lines.push(String::new());
        lines.push("SECTIONS".into());
        lines.push("{".into());
        lines.push("    .text : { *(.text .text.*) } > CODE :text".into());
        lines.push("    .rodata : { *(.rodata .rodata.*) } > CODE :text".into());
        lines.push("    .data : { *(.data .data.*) } > DATA :data".into());
        lines.push("    .bss : { *(.bss .bss.*) *(COMMON) } > DATA :data".into());
        lines.push("    __stack_top = ORIGIN(DATA) + LENGTH(DATA);".into());
        lines.push("}".into());
        lines.join("\n") + "\n"
    }

    /// YAML dump of the run: addresses, banks and the full placement map.
    pub fn debug_yaml(&self) -> Result<String> {
        let catalog = Catalog::new();
        let map = self.store.map();
        let mut memory = BTreeMap::new();
        for (addr, placement) in self.store.placements() {
            let item = match &placement.kind {
                PlacementKind::Instruction { spec, ops, encoding } => ItemDump {
                    kind: "instruction",
                    seq: placement.seq.to_string(),
                    comment: placement.comment.clone(),
                    byte_size: 4,
                    encoding: Some(format!("{encoding:#010x}")),
                    asm: Some(isa::asm(&catalog, spec, *ops)),
                    bytes: None,
                },
                PlacementKind::Data { bytes } => ItemDump {
                    kind: "data",
                    seq: placement.seq.to_string(),
                    comment: placement.comment.clone(),
                    byte_size: bytes.len() as u64,
                    encoding: None,
                    asm: None,
                    bytes: Some(bytes.iter().map(|b| format!("{b:#04x}")).collect()),
                },
            };
            memory.insert(format!("0x{addr:016x}"), item);
        }

        let dump = DebugDump {
            load_addr: format!("{:#x}", map.code.base),
            ram_size: format!("{:#x}", map.code.size),
            boot_address: format!("{:#x}", self.boot),
            exit_address: self.exit.map(|a| format!("{a:#x}")),
            exception_address: self.handler.map(|a| format!("{a:#x}")),
            data_region: format!("{:#x}", map.data.base),
            memory_banks: self
                .config
                .banks
                .iter()
                .map(|b| BankDump {
                    name: b.name.clone(),
                    base: format!("{:#x}", b.base),
                    size: format!("{:#x}", b.size),
                    code: b.code,
                    data: b.data,
                    access: b.access.as_str(),
                })
                .collect(),
            memory,
        };
        Ok(serde_yaml::to_string(&dump)?)
    }
}

fn data_directive(bytes: &[u8]) -> String {
    let mut value = 0u64;
    for (i, b) in bytes.iter().enumerate().take(8) {
        value |= (*b as u64) << (8 * i);
    }
    match bytes.len() {
        1 => format!(".byte {value:#04x}"),
        2 => format!(".half {value:#06x}"),
        4 => format!(".word {value:#010x}"),
        8 => format!(".dword {value:#018x}"),
        _ => {
            let list: Vec<String> = bytes.iter().map(|b| format!("{b:#04x}")).collect();
            format!(".byte {}", list.join(", "))
        }
    }
}

#[derive(Serialize)]
struct DebugDump {
    load_addr: String,
    ram_size: String,
    boot_address: String,
    exit_address: Option<String>,
    exception_address: Option<String>,
    data_region: String,
    memory_banks: Vec<BankDump>,
    memory: BTreeMap<String, ItemDump>,
}

#[derive(Serialize)]
struct BankDump {
    name: String,
    base: String,
    size: String,
    code: bool,
    data: bool,
    access: &'static str,
}

#[derive(Serialize)]
struct ItemDump {
    kind: &'static str,
    seq: String,
    comment: String,
    byte_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    asm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<Vec<String>>,
}
