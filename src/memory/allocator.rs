//! Device allocation handles and the allocator collaborator.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{MclError, Result};

use super::GpuAddress;

/// First GPU address handed out by [`AllocationTable`].
const GPU_VA_BASE: GpuAddress = 0x0000_0001_0000_0000;

/// Every allocation starts on a 64 KiB boundary.
const GPU_VA_ALIGNMENT: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub u32);

/// What an allocation backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationKind {
    CommandBuffer,
    KernelIsa,
    IndirectObjectHeap,
    SurfaceStateHeap,
    Constants,
    Buffer,
    Event,
    DeviceCounter,
}

/// A handle to a device allocation. Cheap to copy; the allocator owns the
/// underlying memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub id: AllocationId,
    pub kind: AllocationKind,
    pub gpu_address: GpuAddress,
    pub size: usize,
}

impl Allocation {
    /// Whether `address` lies inside this allocation.
    pub fn contains(&self, address: GpuAddress) -> bool {
        address >= self.gpu_address && address < self.gpu_address + self.size as u64
    }
}

/// Result of resolving a host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPointer {
    pub device_address: GpuAddress,
    pub allocation: Allocation,
}

/// Memory-management collaborator of a command list.
pub trait Allocator: Send + Sync {
    /// Map a host pointer to its device address and backing allocation.
    fn resolve(&self, host_ptr: u64) -> Result<ResolvedPointer>;

    /// Create a fresh allocation of `size` bytes.
    fn allocate(&self, kind: AllocationKind, size: usize) -> Result<Allocation>;
}

#[derive(Debug, Default)]
struct TableState {
    next_id: u32,
    next_gpu: GpuAddress,
    host_ranges: Vec<(u64, Allocation)>,
}

impl TableState {
    fn new_allocation(&mut self, kind: AllocationKind, size: usize) -> Allocation {
        if self.next_gpu == 0 {
            self.next_gpu = GPU_VA_BASE;
        }
        self.next_id += 1;
        let allocation = Allocation {
            id: AllocationId(self.next_id),
            kind,
            gpu_address: self.next_gpu,
            size,
        };
        let span = (size as u64).max(1);
        self.next_gpu += span.div_ceil(GPU_VA_ALIGNMENT) * GPU_VA_ALIGNMENT;
        allocation
    }
}

/// Reference allocator: a bump allocator over a flat GPU virtual range plus
/// a table of registered host ranges.
#[derive(Debug, Default)]
pub struct AllocationTable {
    state: Mutex<TableState>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `size` bytes of host memory starting at `host_base` as a
    /// new device allocation. Pointers inside the range resolve to it.
    pub fn register_host_range(
        &self,
        host_base: u64,
        size: usize,
        kind: AllocationKind,
    ) -> Allocation {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let allocation = state.new_allocation(kind, size);
        state.host_ranges.push((host_base, allocation));
        debug!(
            host_base = format_args!("0x{:x}", host_base),
            gpu = format_args!("0x{:x}", allocation.gpu_address),
            size,
            "registered host range"
        );
        allocation
    }

    /// Number of allocations handed out so far.
    pub fn n_allocations(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id as usize
    }
}

impl Allocator for AllocationTable {
    fn resolve(&self, host_ptr: u64) -> Result<ResolvedPointer> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (base, allocation) = state
            .host_ranges
            .iter()
            .find(|(base, a)| host_ptr >= *base && host_ptr < *base + a.size as u64)
            .copied()
            .ok_or(MclError::AllocationResolution(host_ptr))?;
        let device_address = allocation.gpu_address + (host_ptr - base);
        trace!(
            host_ptr = format_args!("0x{:x}", host_ptr),
            device_address = format_args!("0x{:x}", device_address),
            "resolved host pointer"
        );
        Ok(ResolvedPointer {
            device_address,
            allocation,
        })
    }

    fn allocate(&self, kind: AllocationKind, size: usize) -> Result<Allocation> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.new_allocation(kind, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_distinct_aligned_ranges() {
        let table = AllocationTable::new();
        let a = table.allocate(AllocationKind::Buffer, 100).unwrap();
        let b = table.allocate(AllocationKind::Buffer, 0x2_0001).unwrap();
        let c = table.allocate(AllocationKind::Buffer, 1).unwrap();
        assert_eq!(a.gpu_address, GPU_VA_BASE);
        assert_eq!(b.gpu_address, GPU_VA_BASE + 0x1_0000);
        assert_eq!(c.gpu_address, GPU_VA_BASE + 0x4_0000);
        assert_ne!(a.id, b.id);
        assert_eq!(table.n_allocations(), 3);
    }

    #[test]
    fn test_resolve_inside_registered_range() {
        let table = AllocationTable::new();
        let alloc = table.register_host_range(0x7000_0000, 4096, AllocationKind::Buffer);
        let r = table.resolve(0x7000_0010).unwrap();
        assert_eq!(r.allocation, alloc);
        assert_eq!(r.device_address, alloc.gpu_address + 0x10);
        assert!(alloc.contains(r.device_address));
    }

    #[test]
    fn test_resolve_unmapped_pointer_fails() {
        let table = AllocationTable::new();
        table.register_host_range(0x7000_0000, 16, AllocationKind::Buffer);
        let err = table.resolve(0x7000_0010).unwrap_err();
        assert!(matches!(err, MclError::AllocationResolution(0x7000_0010)));
    }
}
