//! Memory layout configuration.
//!
//! The YAML shape is `memory: { banks: [...], data_reserve, boot }`. Bank
//! `base`/`size` and the `boot` offset accept plain integers or `"0x…"`
//! strings. Validation happens after parse so every diagnostic names the
//! offending bank or field.

use std::path::Path;

use serde::Deserialize;

use crate::layout::Access;
use crate::{Result, TibbarError};

pub const DEFAULT_DATA_RESERVE: u64 = 256 * 1024;

/// One configured bank, validated.
#[derive(Clone, Debug)]
pub struct Bank {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub code: bool,
    pub data: bool,
    pub access: Access,
}

/// Validated memory configuration.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub banks: Vec<Bank>,
    pub data_reserve: u64,
    /// Boot offset into the code region; absent means randomize.
    pub boot: Option<u64>,
}

impl MemoryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TibbarError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
            .map_err(|e| TibbarError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|e| TibbarError::Config(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Built-in layout used when no config file is given: a 256 KiB code
    /// bank and a 256 KiB data bank directly above it.
    pub fn default_config() -> Self {
        Self {
            banks: vec![
                Bank {
                    name: "ram".into(),
                    base: 0x8000_0000,
                    size: 0x4_0000,
                    code: true,
                    data: false,
                    access: Access::Rx,
                },
                Bank {
                    name: "data".into(),
                    base: 0x8004_0000,
                    size: 0x4_0000,
                    code: false,
                    data: true,
                    access: Access::Rw,
                },
            ],
            data_reserve: DEFAULT_DATA_RESERVE,
            boot: None,
        }
    }

    pub fn code_bank(&self) -> &Bank {
        // validate() guarantees exactly one
        self.banks
            .iter()
            .find(|b| b.code)
            .unwrap_or(&self.banks[0])
    }

    pub fn data_bank(&self) -> Option<&Bank> {
        self.banks.iter().find(|b| b.data && !b.code)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let mut banks = Vec::with_capacity(raw.memory.banks.len());
        for (i, b) in raw.memory.banks.into_iter().enumerate() {
            let name = b.name.unwrap_or_else(|| format!("bank{i}"));
            let access_str = b.access.unwrap_or_else(|| "rwx".into());
            let access = Access::parse(&access_str.trim().to_lowercase()).ok_or_else(|| {
                TibbarError::Config(format!(
                    "bank '{name}': access must be rx, rw or rwx (got '{access_str}')"
                ))
            })?;
            banks.push(Bank {
                name,
                base: b.base.0,
                size: b.size.0,
                code: b.code,
                data: b.data,
                access,
            });
        }

        let mut data_reserve = raw.memory.data_reserve.map(|v| v.0).unwrap_or(0);
        if data_reserve == 0 {
            data_reserve = DEFAULT_DATA_RESERVE;
        }

        let cfg = Self {
            banks,
            data_reserve,
            boot: raw.memory.boot.map(|v| v.0),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(TibbarError::Config(msg));

        if self.banks.is_empty() {
            return err("at least one bank is required".into());
        }
        for b in &self.banks {
            if b.size == 0 {
                return err(format!("bank '{}' has zero size", b.name));
            }
            if b.base.checked_add(b.size).is_none() {
                return err(format!("bank '{}' wraps the address space", b.name));
            }
        }

        let code_banks: Vec<_> = self.banks.iter().filter(|b| b.code).collect();
        match code_banks.len() {
            0 => return err("exactly one bank must have code: true".into()),
            1 => {}
            n => return err(format!("expected one code bank, found {n}")),
        }
        let code = code_banks[0];
        if !code.access.executable() {
            return err(format!(
                "code bank '{}' must have executable access (rx or rwx)",
                code.name
            ));
        }

        let data_banks: Vec<_> = self.banks.iter().filter(|b| b.data && !b.code).collect();
        if data_banks.len() > 1 {
            return err(format!("expected at most one data bank, found {}", data_banks.len()));
        }
        match data_banks.first() {
            Some(d) => {
                if !d.access.writable() {
                    return err(format!(
                        "data bank '{}' must have writable access (rw or rwx)",
                        d.name
                    ));
                }
            }
            None => {
                // Unified mode: the data reserve is carved from the code
                // bank, so stores must be legal there.
                if !code.access.writable() {
                    return err(format!(
                        "bank '{}' carries code and data but lacks write access (need rwx)",
                        code.name
                    ));
                }
                if self.data_reserve >= code.size {
                    return err(format!(
                        "data_reserve {:#x} does not fit inside bank '{}' ({:#x} bytes)",
                        self.data_reserve, code.name, code.size
                    ));
                }
            }
        }

        if let Some(boot) = self.boot {
            if boot >= code.size {
                return err(format!(
                    "boot offset {boot:#x} is outside the code bank ({:#x} bytes)",
                    code.size
                ));
            }
        }
        Ok(())
    }
}

/// Integer that accepts `0x…` strings as well as plain numbers.
#[derive(Copy, Clone, Debug)]
struct HexInt(u64);

impl<'de> Deserialize<'de> for HexInt {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct Visitor;

        impl serde::de::Visitor<'_> for Visitor {
            type Value = HexInt;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an unsigned integer or a \"0x…\" string")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<HexInt, E> {
                Ok(HexInt(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<HexInt, E> {
                u64::try_from(v)
                    .map(HexInt)
                    .map_err(|_| E::custom("negative value"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<HexInt, E> {
                let t = v.trim();
                let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => t.parse(),
                };
                parsed.map(HexInt).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    memory: RawMemory,
}

#[derive(Debug, Deserialize)]
struct RawMemory {
    #[serde(default)]
    banks: Vec<RawBank>,
    data_reserve: Option<HexInt>,
    boot: Option<HexInt>,
}

#[derive(Debug, Deserialize)]
struct RawBank {
    name: Option<String>,
    base: HexInt,
    size: HexInt,
    #[serde(default)]
    code: bool,
    #[serde(default)]
    data: bool,
    access: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_strings_and_integers() {
        let cfg = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - name: ram
      base: "0x80000000"
      size: 1048576
      code: true
      data: true
      access: rwx
  data_reserve: "0x10000"
  boot: 0
"#,
        )
        .unwrap();
        assert_eq!(cfg.banks.len(), 1);
        assert_eq!(cfg.banks[0].base, 0x8000_0000);
        assert_eq!(cfg.banks[0].size, 0x10_0000);
        assert_eq!(cfg.data_reserve, 0x1_0000);
        assert_eq!(cfg.boot, Some(0));
    }

    #[test]
    fn rejects_missing_code_bank() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: d, base: 0, size: 4096, data: true, access: rw }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("code"));
    }

    #[test]
    fn rejects_two_code_banks() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: a, base: 0x1000, size: 4096, code: true, access: rx }
    - { name: b, base: 0x8000, size: 4096, code: true, access: rx }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("one code bank"));
    }

    #[test]
    fn rejects_bad_access_string() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: a, base: 0x1000, size: 4096, code: true, access: rwz }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("access"));
    }

    #[test]
    fn rejects_unified_bank_without_write_access() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: a, base: 0x1000, size: 0x100000, code: true, access: rx }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rwx"));
    }

    #[test]
    fn rejects_oversized_data_reserve() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: a, base: 0x1000, size: 0x8000, code: true, data: true, access: rwx }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("data_reserve"));
    }

    #[test]
    fn rejects_boot_outside_code_bank() {
        let err = MemoryConfig::from_yaml_str(
            r#"
memory:
  banks:
    - { name: a, base: 0x1000, size: 0x100000, code: true, data: true, access: rwx }
  boot: 0x200000
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("boot"));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = MemoryConfig::default_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.code_bank().base, 0x8000_0000);
        assert_eq!(cfg.data_bank().unwrap().base, 0x8004_0000);
    }
}
