//! Reference-counted set of allocations that must be resident when the
//! command list executes.

use std::collections::HashMap;

use tracing::trace;

use super::{Allocation, AllocationId};

#[derive(Debug, Default)]
pub struct ResidencyContainer {
    entries: HashMap<AllocationId, (Allocation, u32)>,
}

impl ResidencyContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to `allocation`.
    pub fn add(&mut self, allocation: Allocation) {
        let entry = self.entries.entry(allocation.id).or_insert((allocation, 0));
        entry.1 += 1;
        trace!(id = allocation.id.0, refs = entry.1, "residency add");
    }

    /// Drop one reference; the allocation leaves the set at zero.
    /// Removing an absent allocation is a no-op.
    pub fn remove(&mut self, allocation: &Allocation) {
        if let Some(entry) = self.entries.get_mut(&allocation.id) {
            entry.1 -= 1;
            trace!(id = allocation.id.0, refs = entry.1, "residency remove");
            if entry.1 == 0 {
                self.entries.remove(&allocation.id);
            }
        }
    }

    /// Replace `old` by `new`, touching the set only when they differ.
    pub fn swap(&mut self, old: Option<&Allocation>, new: Option<&Allocation>) {
        if old.map(|a| a.id) == new.map(|a| a.id) {
            return;
        }
        if let Some(old) = old {
            self.remove(old);
        }
        if let Some(new) = new {
            self.add(*new);
        }
    }

    pub fn contains(&self, allocation: &Allocation) -> bool {
        self.entries.contains_key(&allocation.id)
    }

    pub fn ref_count(&self, allocation: &Allocation) -> u32 {
        self.entries.get(&allocation.id).map_or(0, |e| e.1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resident allocations, in id order.
    pub fn allocations(&self) -> Vec<Allocation> {
        let mut out: Vec<Allocation> = self.entries.values().map(|e| e.0).collect();
        out.sort_by_key(|a| a.id);
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationKind;

    fn alloc(id: u32) -> Allocation {
        Allocation {
            id: AllocationId(id),
            kind: AllocationKind::Buffer,
            gpu_address: 0x1000 * id as u64,
            size: 64,
        }
    }

    #[test]
    fn test_refcount_add_remove() {
        let mut r = ResidencyContainer::new();
        let a = alloc(1);
        r.add(a);
        r.add(a);
        assert_eq!(r.ref_count(&a), 2);
        assert_eq!(r.len(), 1);
        r.remove(&a);
        assert!(r.contains(&a));
        r.remove(&a);
        assert!(!r.contains(&a));
        assert!(r.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut r = ResidencyContainer::new();
        r.remove(&alloc(3));
        assert!(r.is_empty());
    }

    #[test]
    fn test_swap_same_allocation_untouched() {
        let mut r = ResidencyContainer::new();
        let a = alloc(1);
        r.add(a);
        r.swap(Some(&a), Some(&a));
        assert_eq!(r.ref_count(&a), 1);
    }

    #[test]
    fn test_swap_replaces() {
        let mut r = ResidencyContainer::new();
        let a = alloc(1);
        let b = alloc(2);
        r.swap(None, Some(&a));
        r.swap(Some(&a), Some(&b));
        assert!(!r.contains(&a));
        assert_eq!(r.ref_count(&b), 1);
        assert_eq!(r.allocations(), vec![b]);
        r.swap(Some(&b), None);
        assert!(r.is_empty());
    }
}
