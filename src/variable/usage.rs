//! Usage ledger: where each physical copy of a variable lives.

use crate::memory::{CpuAddress, Heap};

/// A patch location inside one heap.
///
/// Sites recorded while building the command stream are `Bound` to the
/// CPU address they were written at. Sites rebuilt from a serialized
/// container are `Unbound` heap offsets, resolved against the heap's
/// current base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchSite {
    Unbound(usize),
    Bound(CpuAddress),
}

impl PatchSite {
    pub fn resolve(&self, heap: &Heap) -> CpuAddress {
        match *self {
            Self::Unbound(offset) => heap.address_of(offset),
            Self::Bound(addr) => addr,
        }
    }

    /// Heap-relative offset, if the site lies in `heap`.
    pub fn heap_offset(&self, heap: &Heap) -> Option<usize> {
        match *self {
            Self::Unbound(offset) => Some(offset),
            Self::Bound(addr) => heap.offset_of(addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSite {
    pub site: PatchSite,
    pub patch_size: usize,
}

impl UsageSite {
    pub fn new(site: PatchSite, patch_size: usize) -> Self {
        Self { site, patch_size }
    }
}

/// Every recorded site of one variable, per heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usages {
    pub command_buffer: Vec<UsageSite>,
    pub indirect: Vec<UsageSite>,
    pub surface_state: Vec<UsageSite>,
}

impl Usages {
    pub fn is_empty(&self) -> bool {
        self.command_buffer.is_empty() && self.indirect.is_empty() && self.surface_state.is_empty()
    }

    pub fn len(&self) -> usize {
        self.command_buffer.len() + self.indirect.len() + self.surface_state.len()
    }
}

/// One piece of a chunked value and the usage entries that hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateValueChunk {
    pub source_offset: usize,
    pub size: usize,
    /// Index into `Usages::indirect`.
    pub heap_usage: Option<usize>,
    /// Index into `Usages::command_buffer`.
    pub cmd_buffer_usage: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HeapKind, RegionId};

    #[test]
    fn test_resolve_bound_and_unbound() {
        let heap = Heap::new(HeapKind::IndirectObject, RegionId(3), 64, 256, 0x1000);
        let unbound = PatchSite::Unbound(8);
        assert_eq!(unbound.resolve(&heap), CpuAddress::new(RegionId(3), 72));
        assert_eq!(unbound.heap_offset(&heap), Some(8));

        let bound = PatchSite::Bound(CpuAddress::new(RegionId(3), 100));
        assert_eq!(bound.resolve(&heap), CpuAddress::new(RegionId(3), 100));
        assert_eq!(bound.heap_offset(&heap), Some(36));
    }

    #[test]
    fn test_usages_len() {
        let mut u = Usages::default();
        assert!(u.is_empty());
        u.indirect.push(UsageSite::new(PatchSite::Unbound(0), 8));
        u.command_buffer.push(UsageSite::new(PatchSite::Unbound(4), 8));
        assert_eq!(u.len(), 2);
    }
}
