//! Register-resource reservation for interleaving sequences safely.
//!
//! Every resource is in exactly one pool state: unassigned, exclusively held
//! or shared (reference counted). Requests are all-or-nothing; a request
//! that cannot be met leaves the pool untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::isa::Catalog;
use crate::{Result, TibbarError};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Namespace {
    Gpr,
    Fpr,
    Csr,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Gpr => f.write_str("GPR"),
            Namespace::Fpr => f.write_str("FPR"),
            Namespace::Csr => f.write_str("CSR"),
        }
    }
}

/// Concrete reference to one reservable resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: Namespace,
    pub index: u32,
}

impl ResourceId {
    pub fn gpr(index: u8) -> Self {
        Self {
            namespace: Namespace::Gpr,
            index: index as u32,
        }
    }

    pub fn fpr(index: u8) -> Self {
        Self {
            namespace: Namespace::Fpr,
            index: index as u32,
        }
    }

    pub fn csr(address: u16) -> Self {
        Self {
            namespace: Namespace::Csr,
            index: address as u32,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.namespace, self.index)
    }
}

/// One requested item: a concrete resource or an any-N slot the reserver
/// resolves.
#[derive(Copy, Clone, Debug)]
pub enum ClaimItem {
    Concrete(ResourceId),
    Any { namespace: Namespace, count: usize },
}

/// Resource needs of one sequence.
#[derive(Clone, Debug, Default)]
pub struct ClaimSpec {
    pub exclusive: Vec<ClaimItem>,
    pub shared: Vec<ClaimItem>,
}

impl ClaimSpec {
    pub fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }

    pub fn exclusive_gprs(count: usize) -> Self {
        Self {
            exclusive: vec![ClaimItem::Any {
                namespace: Namespace::Gpr,
                count,
            }],
            shared: Vec::new(),
        }
    }
}

/// An atomic grant. Holders read their registers out of the ordered sets.
#[derive(Clone, Debug, Default)]
pub struct Claim {
    pub exclusive: BTreeSet<ResourceId>,
    pub shared: BTreeSet<ResourceId>,
}

impl Claim {
    /// Exclusive GPR indices, ascending.
    pub fn exclusive_gprs(&self) -> Vec<u8> {
        self.exclusive
            .iter()
            .filter(|r| r.namespace == Namespace::Gpr)
            .map(|r| r.index as u8)
            .collect()
    }
}

/// The reservable universe: everything the architecture allows a sequence to
/// own. GPR 0 and read-only CSRs are excluded.
#[derive(Clone, Debug)]
pub struct ResourceSpace {
    by_namespace: BTreeMap<Namespace, BTreeSet<ResourceId>>,
    forbidden: BTreeSet<ResourceId>,
}

impl ResourceSpace {
    pub fn for_catalog(catalog: &Catalog) -> Self {
        let mut by_namespace: BTreeMap<Namespace, BTreeSet<ResourceId>> = BTreeMap::new();
        by_namespace.insert(
            Namespace::Gpr,
            (1..32).map(ResourceId::gpr).collect(),
        );
        by_namespace.insert(
            Namespace::Fpr,
            (0..32).map(ResourceId::fpr).collect(),
        );
        let mut forbidden = BTreeSet::new();
        forbidden.insert(ResourceId::gpr(0));
        let mut csrs = BTreeSet::new();
        for def in catalog.csrs() {
            if def.writable {
                csrs.insert(ResourceId::csr(def.address));
            } else {
                forbidden.insert(ResourceId::csr(def.address));
            }
        }
        by_namespace.insert(Namespace::Csr, csrs);
        Self {
            by_namespace,
            forbidden,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.by_namespace.values().flatten().copied()
    }

    pub fn namespace(&self, ns: Namespace) -> impl Iterator<Item = ResourceId> + '_ {
        self.by_namespace.get(&ns).into_iter().flatten().copied()
    }

    pub fn is_forbidden(&self, id: ResourceId) -> bool {
        self.forbidden.contains(&id) || !self.by_namespace.get(&id.namespace).is_some_and(|s| s.contains(&id))
    }
}

/// Centralized reservation shared by all sequences of a run.
pub struct Reserver {
    space: ResourceSpace,
    unassigned: BTreeSet<ResourceId>,
    exclusive: BTreeSet<ResourceId>,
    shared_refcount: BTreeMap<ResourceId, u32>,
}

impl Reserver {
    pub fn new(space: ResourceSpace) -> Self {
        let unassigned = space.all().collect();
        Self {
            space,
            unassigned,
            exclusive: BTreeSet::new(),
            shared_refcount: BTreeMap::new(),
        }
    }

    pub fn reservable(&self, ns: Namespace) -> Vec<ResourceId> {
        self.space.namespace(ns).collect()
    }

    /// All-or-nothing grant. `Ok(None)` means capacity exhaustion this round;
    /// an architecturally forbidden item is an error.
    pub fn request(&mut self, spec: &ClaimSpec) -> Result<Option<Claim>> {
        for item in spec.exclusive.iter().chain(&spec.shared) {
            if let ClaimItem::Concrete(id) = item {
                if self.space.is_forbidden(*id) {
                    return Err(TibbarError::InvalidResource(format!(
                        "{id} cannot be reserved"
                    )));
                }
            }
        }

        let mut exclusive = BTreeSet::new();
        for item in &spec.exclusive {
            match item {
                ClaimItem::Concrete(id) => {
                    if !self.unassigned.contains(id) || exclusive.contains(id) {
                        return Ok(None);
                    }
                    exclusive.insert(*id);
                }
                ClaimItem::Any { namespace, count } => {
                    let picked: Vec<_> = self
                        .space
                        .namespace(*namespace)
                        .filter(|id| self.unassigned.contains(id) && !exclusive.contains(id))
                        .take(*count)
                        .collect();
                    if picked.len() < *count {
                        return Ok(None);
                    }
                    exclusive.extend(picked);
                }
            }
        }

        let blocked = |id: &ResourceId, exclusive: &BTreeSet<ResourceId>| {
            self.exclusive.contains(id) || exclusive.contains(id)
        };
        let mut shared = BTreeSet::new();
        for item in &spec.shared {
            match item {
                ClaimItem::Concrete(id) => {
                    if blocked(id, &exclusive) {
                        return Ok(None);
                    }
                    shared.insert(*id);
                }
                ClaimItem::Any { namespace, count } => {
                    let picked: Vec<_> = self
                        .space
                        .namespace(*namespace)
                        .filter(|id| !blocked(id, &exclusive) && !shared.contains(id))
                        .take(*count)
                        .collect();
                    if picked.len() < *count {
                        return Ok(None);
                    }
                    shared.extend(picked);
                }
            }
        }

        for id in &exclusive {
            self.unassigned.remove(id);
            self.exclusive.insert(*id);
        }
        for id in &shared {
            let count = self.shared_refcount.entry(*id).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.unassigned.remove(id);
            }
        }

        Ok(Some(Claim { exclusive, shared }))
    }

    pub fn release(&mut self, claim: Claim) {
        for id in claim.exclusive {
            self.exclusive.remove(&id);
            self.unassigned.insert(id);
        }
        for id in claim.shared {
            if let Some(count) = self.shared_refcount.get_mut(&id) {
                *count -= 1;
                if *count == 0 {
                    self.shared_refcount.remove(&id);
                    self.unassigned.insert(id);
                }
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, usize, usize) {
        (
            self.unassigned.len(),
            self.exclusive.len(),
            self.shared_refcount.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::csr;

    fn reserver() -> Reserver {
        Reserver::new(ResourceSpace::for_catalog(&Catalog::new()))
    }

    fn concrete_gpr(index: u8) -> ClaimSpec {
        ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::gpr(index))],
            shared: Vec::new(),
        }
    }

    #[test]
    fn exclusive_conflicts_return_none() {
        let mut r = reserver();
        let claim = r.request(&concrete_gpr(5)).unwrap().unwrap();
        assert!(claim.exclusive.contains(&ResourceId::gpr(5)));
        assert!(r.request(&concrete_gpr(5)).unwrap().is_none());
        r.release(claim);
        assert!(r.request(&concrete_gpr(5)).unwrap().is_some());
    }

    #[test]
    fn gpr0_is_invalid() {
        let mut r = reserver();
        let err = r.request(&concrete_gpr(0)).unwrap_err();
        assert!(matches!(err, TibbarError::InvalidResource(_)));
    }

    #[test]
    fn read_only_csr_is_invalid() {
        let mut r = reserver();
        let spec = ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::csr(csr::MHARTID))],
            shared: Vec::new(),
        };
        assert!(matches!(
            r.request(&spec),
            Err(TibbarError::InvalidResource(_))
        ));
        // writable CSRs reserve fine
        let spec = ClaimSpec {
            exclusive: vec![ClaimItem::Concrete(ResourceId::csr(csr::MSCRATCH))],
            shared: Vec::new(),
        };
        assert!(r.request(&spec).unwrap().is_some());
    }

    #[test]
    fn failed_requests_leave_pool_unchanged() {
        let mut r = reserver();
        let held = r.request(&concrete_gpr(7)).unwrap().unwrap();
        let before = r.snapshot();
        // second item cannot be satisfied, so the first must not stick
        let spec = ClaimSpec {
            exclusive: vec![
                ClaimItem::Concrete(ResourceId::gpr(8)),
                ClaimItem::Concrete(ResourceId::gpr(7)),
            ],
            shared: Vec::new(),
        };
        assert!(r.request(&spec).unwrap().is_none());
        assert_eq!(r.snapshot(), before);
        // gpr 8 is still free
        assert!(r.request(&concrete_gpr(8)).unwrap().is_some());
        r.release(held);
    }

    #[test]
    fn shared_refcount_releases_at_zero() {
        let mut r = reserver();
        let spec = ClaimSpec {
            exclusive: Vec::new(),
            shared: vec![ClaimItem::Concrete(ResourceId::gpr(3))],
        };
        let a = r.request(&spec).unwrap().unwrap();
        let b = r.request(&spec).unwrap().unwrap();
        // shared holders block exclusive use
        assert!(r.request(&concrete_gpr(3)).unwrap().is_none());
        r.release(a);
        assert!(r.request(&concrete_gpr(3)).unwrap().is_none());
        r.release(b);
        assert!(r.request(&concrete_gpr(3)).unwrap().is_some());
    }

    #[test]
    fn exclusive_blocks_shared() {
        let mut r = reserver();
        let held = r.request(&concrete_gpr(4)).unwrap().unwrap();
        let spec = ClaimSpec {
            exclusive: Vec::new(),
            shared: vec![ClaimItem::Concrete(ResourceId::gpr(4))],
        };
        assert!(r.request(&spec).unwrap().is_none());
        r.release(held);
        assert!(r.request(&spec).unwrap().is_some());
    }

    #[test]
    fn reservable_excludes_forbidden_resources() {
        let r = reserver();
        let gprs = r.reservable(Namespace::Gpr);
        assert_eq!(gprs.len(), 31);
        assert!(!gprs.contains(&ResourceId::gpr(0)));
        let csrs = r.reservable(Namespace::Csr);
        assert!(csrs.contains(&ResourceId::csr(csr::MEPC)));
        assert!(!csrs.contains(&ResourceId::csr(csr::MHARTID)));
    }

    #[test]
    fn any_slots_resolve_deterministically() {
        let mut r = reserver();
        let claim = r.request(&ClaimSpec::exclusive_gprs(3)).unwrap().unwrap();
        assert_eq!(claim.exclusive_gprs(), vec![1, 2, 3]);
        let claim2 = r.request(&ClaimSpec::exclusive_gprs(2)).unwrap().unwrap();
        assert_eq!(claim2.exclusive_gprs(), vec![4, 5]);
    }

    #[test]
    fn any_slot_capacity_exhaustion_is_none() {
        let mut r = reserver();
        let _all = r.request(&ClaimSpec::exclusive_gprs(31)).unwrap().unwrap();
        assert!(r.request(&ClaimSpec::exclusive_gprs(1)).unwrap().is_none());
    }
}
