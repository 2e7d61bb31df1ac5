//! Address layout: banks, access modes and the code/data segment map.

use crate::config::MemoryConfig;
use crate::{Result, TibbarError};

/// Bank access mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Rx,
    Rw,
    Rwx,
}

impl Access {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rx" => Some(Access::Rx),
            "rw" => Some(Access::Rw),
            "rwx" => Some(Access::Rwx),
            _ => None,
        }
    }

    pub fn readable(self) -> bool {
        true
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Rw | Access::Rwx)
    }

    pub fn executable(self) -> bool {
        matches!(self, Access::Rx | Access::Rwx)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Access::Rx => "rx",
            Access::Rw => "rw",
            Access::Rwx => "rwx",
        }
    }
}

/// One contiguous absolute-address range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub size: u64,
}

impl Segment {
    pub fn hi(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && addr.checked_add(size).is_some_and(|end| end <= self.hi())
    }

    pub fn offset_of(&self, addr: u64) -> u64 {
        addr - self.base
    }
}

/// Code segment plus optional data segment, with their access modes.
///
/// In unified mode the data segment is carved from the top `data_reserve`
/// bytes of the code bank and overlaps the code segment's address range.
#[derive(Clone, Debug)]
pub struct AddressMap {
    pub code: Segment,
    pub code_access: Access,
    pub data: Segment,
    pub data_access: Access,
    pub unified: bool,
}

impl AddressMap {
    pub fn from_config(cfg: &MemoryConfig) -> Result<Self> {
        let code_bank = cfg.code_bank();
        let code = Segment {
            base: code_bank.base,
            size: code_bank.size,
        };

        if let Some(data_bank) = cfg.data_bank() {
            return Ok(Self {
                code,
                code_access: code_bank.access,
                data: Segment {
                    base: data_bank.base,
                    size: data_bank.size,
                },
                data_access: data_bank.access,
                unified: false,
            });
        }

        // Unified mode: data reserve at the upper end of the code bank.
        let base = code.hi().saturating_sub(cfg.data_reserve) & !7;
        if base <= code.base {
            return Err(TibbarError::Config(format!(
                "data reserve {:#x} leaves no code space in bank '{}'",
                cfg.data_reserve, code_bank.name
            )));
        }
        Ok(Self {
            code,
            code_access: code_bank.access,
            data: Segment {
                base,
                size: code.hi() - base,
            },
            data_access: code_bank.access,
            unified: true,
        })
    }

    pub fn contains_code(&self, addr: u64, size: u64) -> bool {
        self.code.contains(addr, size)
    }

    pub fn contains_data(&self, addr: u64, size: u64) -> bool {
        self.data.contains(addr, size)
    }

    pub fn readable(&self, addr: u64, size: u64) -> bool {
        self.contains_code(addr, size) || self.contains_data(addr, size)
    }

    pub fn writable(&self, addr: u64, size: u64) -> bool {
        if self.contains_data(addr, size) {
            return self.data_access.writable();
        }
        self.contains_code(addr, size) && self.code_access.writable()
    }

    pub fn executable(&self, addr: u64, size: u64) -> bool {
        self.contains_code(addr, size) && self.code_access.executable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    #[test]
    fn separate_banks_map_both_segments() {
        let cfg = MemoryConfig::default_config();
        let map = AddressMap::from_config(&cfg).unwrap();
        assert!(!map.unified);
        assert_eq!(map.code.base, 0x8000_0000);
        assert_eq!(map.code.hi(), 0x8004_0000);
        assert_eq!(map.data.base, 0x8004_0000);
        assert!(map.executable(0x8000_0000, 4));
        assert!(!map.writable(0x8000_0000, 4));
        assert!(map.writable(0x8004_0000, 8));
        assert!(!map.readable(0x0, 4));
    }

    #[test]
    fn unified_bank_carves_data_reserve() {
        let yaml = r#"
memory:
  banks:
    - name: ram
      base: 0x80000000
      size: 0x100000
      code: true
      data: true
      access: rwx
"#;
        let cfg = MemoryConfig::from_yaml_str(yaml).unwrap();
        let map = AddressMap::from_config(&cfg).unwrap();
        assert!(map.unified);
        assert_eq!(map.data.base, 0x8010_0000 - 0x4_0000);
        assert_eq!(map.data.hi(), 0x8010_0000);
        // the carved tail is writable through the bank's rwx access
        assert!(map.writable(map.data.base, 8));
        assert!(map.executable(0x8000_0000, 4));
    }

    #[test]
    fn segment_bounds() {
        let seg = Segment {
            base: 0x1000,
            size: 0x100,
        };
        assert!(seg.contains(0x1000, 4));
        assert!(seg.contains(0x10FC, 4));
        assert!(!seg.contains(0x10FD, 4));
        assert!(!seg.contains(0xFFF, 1));
        assert_eq!(seg.offset_of(0x1010), 0x10);
    }
}
