//! Absolute-address memory store for instruction and data placement.
//!
//! Placements are append-only and byte-immutable. The store tracks merged
//! used ranges for allocation, a byte-level shadow image for the execution
//! model, reserved branch targets awaiting code, and the exit region.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rand::rngs::StdRng;
use rand::Rng;

use crate::isa::{self, Operands, Spec, Trap, TrapCause};
use crate::layout::AddressMap;
use crate::{Result, TibbarError};

/// Content placed at one address.
#[derive(Debug)]
pub struct Placement {
    pub kind: PlacementKind,
    pub seq: &'static str,
    pub comment: String,
}

#[derive(Debug)]
pub enum PlacementKind {
    Instruction {
        spec: &'static Spec,
        ops: Operands,
        encoding: u32,
    },
    Data {
        bytes: Vec<u8>,
    },
}

impl Placement {
    pub fn byte_size(&self) -> u64 {
        match &self.kind {
            PlacementKind::Instruction { .. } => 4,
            PlacementKind::Data { bytes } => bytes.len() as u64,
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self.kind, PlacementKind::Data { .. })
    }
}

pub struct MemoryStore {
    map: AddressMap,
    placements: BTreeMap<u64, Placement>,
    /// Merged allocation ranges, sorted by start.
    used: Vec<(u64, u64)>,
    bytes: BTreeMap<u64, u8>,
    data_next: u64,
    exit_region: Option<(u64, u64)>,
    trap_handler: Option<u64>,
    reserved_targets: BTreeSet<u64>,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

impl MemoryStore {
    pub fn new(map: AddressMap) -> Self {
        let data_next = map.data.base;
        let mut store = Self {
            map,
            placements: BTreeMap::new(),
            used: Vec::new(),
            bytes: BTreeMap::new(),
            data_next,
            exit_region: None,
            trap_handler: None,
            reserved_targets: BTreeSet::new(),
        };
        if store.map.unified {
            // Keep the code allocator out of the carved data reserve.
            let (lo, hi) = (store.map.data.base, store.map.data.hi());
            store.insert_used(lo, hi);
        }
        store
    }

    pub fn map(&self) -> &AddressMap {
        &self.map
    }

    fn insert_used(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.used.push((start, end));
        self.used.sort_unstable_by_key(|r| r.0);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.used.len());
        for &(s, e) in &self.used {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.used = merged;
    }

    fn overlaps_used(&self, addr: u64, size: u64) -> bool {
        let end = addr + size;
        let idx = self.used.partition_point(|r| r.0 < end);
        idx > 0 && self.used[idx - 1].1 > addr
    }

    /// True iff the range is inside a mapped region and free of allocations.
    pub fn check_region_empty(&self, addr: u64, size: u64) -> bool {
        (self.map.contains_code(addr, size) || self.map.contains_data(addr, size))
            && !self.overlaps_used(addr, size)
    }

    /// Free gap candidates in the code region, optionally restricted to a
    /// displacement window around `pc_hint`.
    fn code_candidates(
        &self,
        min_size: u64,
        align: u64,
        pc_hint: Option<u64>,
        within: Option<(i64, i64)>,
    ) -> Vec<u64> {
        let mut lo = self.map.code.base;
        let mut hi = self.map.code.hi();
        if let (Some(pc), Some((min_off, max_off))) = (pc_hint, within) {
            lo = lo.max(pc.saturating_add_signed(min_off));
            hi = hi.min(pc.saturating_add_signed(max_off).saturating_add(1));
        }
        if hi < lo + min_size {
            return Vec::new();
        }

        let mut candidates: Vec<u64> = Vec::new();
        let push = |cand: u64, candidates: &mut Vec<u64>| {
            if !candidates.contains(&cand) {
                candidates.push(cand);
            }
        };
        let consider = |gap_lo: u64, gap_hi: u64, candidates: &mut Vec<u64>| {
            if gap_hi < gap_lo + min_size {
                return;
            }
            let cand_lo = align_up(gap_lo, align);
            let cand_hi = gap_hi - min_size;
            if cand_lo > cand_hi {
                return;
            }
            push(cand_lo, candidates);
            if let Some(pc) = pc_hint {
                let near = align_up(pc.clamp(cand_lo, cand_hi), align);
                if (cand_lo..=cand_hi).contains(&near) {
                    push(near, candidates);
                }
            }
        };

        let mut gap_lo = lo;
        for &(s, e) in &self.used {
            if s >= hi {
                break;
            }
            if e <= gap_lo {
                continue;
            }
            consider(gap_lo, s.min(hi), &mut candidates);
            gap_lo = gap_lo.max(e);
        }
        if gap_lo < hi {
            consider(gap_lo, hi, &mut candidates);
        }
        candidates
    }

    /// Pick a free code block without marking it used.
    pub fn find_free_code(
        &self,
        rng: &mut StdRng,
        min_size: u64,
        align: u64,
        pc_hint: Option<u64>,
        within: Option<(i64, i64)>,
    ) -> Option<u64> {
        let mut candidates = self.code_candidates(min_size, align, pc_hint, within);
        if candidates.is_empty() {
            return None;
        }
        match pc_hint {
            None => Some(candidates[rng.gen_range(0..candidates.len())]),
            Some(pc) => {
                candidates.sort_by_key(|c| c.abs_diff(pc));
                let near = &candidates[..candidates.len().min(64)];
                Some(near[rng.gen_range(0..near.len())])
            }
        }
    }

    /// Find a free code block and mark it used.
    pub fn allocate_code(
        &mut self,
        rng: &mut StdRng,
        min_size: u64,
        align: u64,
        pc_hint: Option<u64>,
        within: Option<(i64, i64)>,
    ) -> Option<u64> {
        let base = self.find_free_code(rng, min_size, align, pc_hint, within)?;
        self.insert_used(base, base + min_size);
        Some(base)
    }

    /// Bump allocation inside the data region.
    pub fn allocate_data(&mut self, size: u64, align: u64) -> Option<u64> {
        let addr = align_up(self.data_next, align);
        let end = addr.checked_add(size)?;
        if end > self.map.data.hi() {
            return None;
        }
        self.data_next = end;
        Some(addr)
    }

    /// Pre-reserve a code range that a later branch will target.
    pub fn reserve_code_at(&mut self, addr: u64, size: u64) -> Result<()> {
        if !self.map.contains_code(addr, size.max(4)) {
            return Err(TibbarError::UnplacedTarget { addr });
        }
        self.reserved_targets.insert(addr);
        self.insert_used(addr, addr + size.max(4));
        Ok(())
    }

    fn conflict_at(&self, addr: u64, size: u64) -> Option<(u64, &Placement)> {
        let end = addr + size;
        self.placements
            .range(..end)
            .next_back()
            .filter(|(s, p)| **s + p.byte_size() > addr)
            .map(|(s, p)| (*s, p))
    }

    pub fn place_instruction(
        &mut self,
        addr: u64,
        spec: &'static Spec,
        ops: Operands,
        seq: &'static str,
        comment: String,
    ) -> Result<u32> {
        if addr % 4 != 0 {
            return Err(TibbarError::PlacementConflict {
                addr,
                existing: "misaligned instruction address".into(),
            });
        }
        if !self.map.executable(addr, 4) {
            return Err(TibbarError::PlacementConflict {
                addr,
                existing: "non-executable range".into(),
            });
        }
        if let Some((s, p)) = self.conflict_at(addr, 4) {
            return Err(TibbarError::PlacementConflict {
                addr,
                existing: format!("{}:{} at {s:#x}", p.seq, p.comment),
            });
        }

        let encoding = isa::encode(spec, ops);
        debug!("placing [{addr:#x}] {comment} ({encoding:#010x})");

        if let Some(target) = isa::branch_target(spec, ops, addr) {
            if !self.map.contains_code(target, 4) {
                return Err(TibbarError::UnplacedTarget { addr: target });
            }
            if !self.placements.contains_key(&target) {
                self.reserved_targets.insert(target);
                if !self.overlaps_used(target, 4) {
                    self.insert_used(target, target + 4);
                }
            } else if target != addr {
                debug!("branch target {target:#x} already holds an instruction");
            }
        }

        for (i, b) in encoding.to_le_bytes().iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
        self.placements.insert(
            addr,
            Placement {
                kind: PlacementKind::Instruction {
                    spec,
                    ops,
                    encoding,
                },
                seq,
                comment,
            },
        );
        self.insert_used(addr, addr + 4);
        self.reserved_targets.remove(&addr);
        Ok(encoding)
    }

    pub fn place_data(
        &mut self,
        addr: u64,
        bytes: Vec<u8>,
        seq: &'static str,
        comment: String,
    ) -> Result<()> {
        let size = bytes.len() as u64;
        if size == 0 || !self.map.contains_data(addr, size) {
            return Err(TibbarError::PlacementConflict {
                addr,
                existing: "outside the data region".into(),
            });
        }
        if let Some((s, p)) = self.conflict_at(addr, size) {
            return Err(TibbarError::PlacementConflict {
                addr,
                existing: format!("{}:{} at {s:#x}", p.seq, p.comment),
            });
        }
        debug!("placing data [{addr:#x}] {comment} ({size} bytes)");
        for (i, b) in bytes.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
        self.placements.insert(
            addr,
            Placement {
                kind: PlacementKind::Data { bytes },
                seq,
                comment,
            },
        );
        Ok(())
    }

    /// Model-facing read; honors bank permissions.
    pub fn read(&self, addr: u64, size: u8) -> std::result::Result<u64, Trap> {
        if !self.map.readable(addr, size as u64) {
            return Err(Trap {
                cause: TrapCause::LoadAccessFault,
                tval: addr,
            });
        }
        let mut value = 0u64;
        for i in 0..size as u64 {
            let b = self.bytes.get(&(addr + i)).copied().unwrap_or(0);
            value |= (b as u64) << (8 * i);
        }
        Ok(value)
    }

    /// Model-facing write; honors bank permissions.
    pub fn write(&mut self, addr: u64, value: u64, size: u8) -> std::result::Result<(), Trap> {
        if !self.map.writable(addr, size as u64) {
            return Err(Trap {
                cause: TrapCause::StoreAccessFault,
                tval: addr,
            });
        }
        for i in 0..size as u64 {
            self.bytes.insert(addr + i, (value >> (8 * i)) as u8);
        }
        Ok(())
    }

    pub fn is_placed(&self, addr: u64) -> bool {
        self.placements.contains_key(&addr)
    }

    pub fn instruction_at(&self, addr: u64) -> Option<(&'static Spec, Operands, u32)> {
        match self.placements.get(&addr).map(|p| &p.kind) {
            Some(PlacementKind::Instruction {
                spec,
                ops,
                encoding,
            }) => Some((*spec, *ops, *encoding)),
            _ => None,
        }
    }

    /// Bytes from `pc` to the next blocking boundary: the next placement,
    /// the exit region, the carved data reserve, or the end of the bank.
    pub fn free_space_at(&self, pc: u64) -> u64 {
        if !self.map.contains_code(pc, 1) {
            return 0;
        }
        if let Some((s, p)) = self.placements.range(..=pc).next_back() {
            if s + p.byte_size() > pc {
                return 0;
            }
        }
        let mut boundary = self.map.code.hi();
        if let Some((addr, _)) = self.placements.range(pc..).next() {
            boundary = boundary.min(*addr);
        }
        if let Some((lo, _)) = self.exit_region {
            if lo >= pc {
                boundary = boundary.min(lo);
            }
        }
        if self.map.unified && self.map.data.base >= pc {
            boundary = boundary.min(self.map.data.base);
        }
        boundary - pc
    }

    pub fn set_exit_region(&mut self, lo: u64, hi: u64) {
        self.insert_used(lo, hi);
        self.exit_region = Some((lo, hi));
    }

    pub fn exit_region(&self) -> Option<(u64, u64)> {
        self.exit_region
    }

    pub fn in_exit_region(&self, addr: u64) -> bool {
        self.exit_region
            .is_some_and(|(lo, hi)| addr >= lo && addr < hi)
    }

    pub fn set_trap_handler(&mut self, addr: u64) {
        self.trap_handler = Some(addr);
    }

    pub fn trap_handler(&self) -> Option<u64> {
        self.trap_handler
    }

    pub fn data_region(&self) -> (u64, u64) {
        (self.map.data.base, self.map.data.hi())
    }

    pub fn placements(&self) -> impl Iterator<Item = (u64, &Placement)> {
        self.placements.iter().map(|(a, p)| (*a, p))
    }

    /// Reserved branch targets that never received an instruction.
    pub fn unfilled_targets(&self) -> Vec<u64> {
        self.reserved_targets
            .iter()
            .copied()
            .filter(|t| !self.placements.contains_key(t))
            .collect()
    }
}
