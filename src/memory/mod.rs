//! Host-side model of the memory a command list records into.
//!
//! Every heap of a command list (command stream, instruction heap,
//! indirect-object heap, surface-state heap, constants) lives in a byte
//! region of [`DeviceMemory`]. A region is backed by one [`Allocation`]
//! handed out by the [`Allocator`], which gives it a GPU base address.
//! Patching a variable is a plain byte write into one of these regions.

pub mod allocator;
pub mod residency;

pub use allocator::{
    Allocation, AllocationId, AllocationKind, AllocationTable, Allocator, ResolvedPointer,
};
pub use residency::ResidencyContainer;

use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::variable::usage::PatchSite;

/// Device-visible address.
pub type GpuAddress = u64;

// ---------------------------------------------------------------------------
// Addresses and regions
// ---------------------------------------------------------------------------

/// Index of a byte region inside [`DeviceMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u16);

/// A resolved CPU-side location: a byte offset inside one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuAddress {
    pub region: RegionId,
    pub offset: usize,
}

impl CpuAddress {
    pub fn new(region: RegionId, offset: usize) -> Self {
        Self { region, offset }
    }

    /// Address `n` bytes further into the same region.
    pub fn add(self, n: usize) -> Self {
        Self {
            region: self.region,
            offset: self.offset + n,
        }
    }
}

#[derive(Debug)]
struct Region {
    bytes: Vec<u8>,
    allocation: Allocation,
}

/// All byte regions owned by one command list.
#[derive(Debug, Default)]
pub struct DeviceMemory {
    regions: Vec<Region>,
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a zero-filled region of `size` bytes backed by `allocation`.
    pub fn add_region(&mut self, allocation: Allocation, size: usize) -> RegionId {
        let id = RegionId(self.regions.len() as u16);
        self.regions.push(Region {
            bytes: vec![0u8; size],
            allocation,
        });
        id
    }

    /// Number of regions.
    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    /// Backing allocation of a region.
    pub fn allocation(&self, id: RegionId) -> Option<&Allocation> {
        self.regions.get(id.0 as usize).map(|r| &r.allocation)
    }

    /// Full contents of a region.
    pub fn region_bytes(&self, id: RegionId) -> Option<&[u8]> {
        self.regions.get(id.0 as usize).map(|r| r.bytes.as_slice())
    }

    /// Borrow `len` bytes at `addr`.
    pub fn read(&self, addr: CpuAddress, len: usize) -> Result<&[u8]> {
        let out_of_bounds = MclError::OutOfBounds {
            offset: addr.offset,
            len,
        };
        let region = self.regions.get(addr.region.0 as usize).ok_or(out_of_bounds)?;
        region
            .bytes
            .get(addr.offset..addr.offset + len)
            .ok_or(MclError::OutOfBounds {
                offset: addr.offset,
                len,
            })
    }

    /// Copy `bytes` to `addr`.
    pub fn write(&mut self, addr: CpuAddress, bytes: &[u8]) -> Result<()> {
        let len = bytes.len();
        let region = self
            .regions
            .get_mut(addr.region.0 as usize)
            .ok_or(MclError::OutOfBounds {
                offset: addr.offset,
                len,
            })?;
        let dst = region
            .bytes
            .get_mut(addr.offset..addr.offset + len)
            .ok_or(MclError::OutOfBounds {
                offset: addr.offset,
                len,
            })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    pub fn read_u32(&self, addr: CpuAddress) -> Result<u32> {
        let b = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, addr: CpuAddress) -> Result<u64> {
        let b = self.read(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, addr: CpuAddress, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: CpuAddress, value: u64) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}

// ---------------------------------------------------------------------------
// Heaps
// ---------------------------------------------------------------------------

/// The heaps a command list records into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeapKind {
    CommandStream,
    Instruction,
    IndirectObject,
    SurfaceState,
    Constants,
}

impl HeapKind {
    pub fn allocation_kind(self) -> AllocationKind {
        match self {
            Self::CommandStream => AllocationKind::CommandBuffer,
            Self::Instruction => AllocationKind::KernelIsa,
            Self::IndirectObject => AllocationKind::IndirectObjectHeap,
            Self::SurfaceState => AllocationKind::SurfaceStateHeap,
            Self::Constants => AllocationKind::Constants,
        }
    }
}

/// A linear heap living inside one region, starting at `base`.
#[derive(Debug, Clone)]
pub struct Heap {
    kind: HeapKind,
    region: RegionId,
    base: usize,
    used: usize,
    capacity: usize,
    gpu_base: GpuAddress,
}

impl Heap {
    pub fn new(
        kind: HeapKind,
        region: RegionId,
        base: usize,
        capacity: usize,
        gpu_base: GpuAddress,
    ) -> Self {
        Self {
            kind,
            region,
            base,
            used: 0,
            capacity,
            gpu_base,
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    /// CPU address of the heap start.
    pub fn cpu_base(&self) -> CpuAddress {
        CpuAddress::new(self.region, self.base)
    }

    /// GPU address of the heap start.
    pub fn gpu_base(&self) -> GpuAddress {
        self.gpu_base
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// GPU address of the first unused byte.
    pub fn end_gpu_address(&self) -> GpuAddress {
        self.gpu_base + self.used as u64
    }

    /// CPU address of heap offset `offset`.
    pub fn address_of(&self, offset: usize) -> CpuAddress {
        self.cpu_base().add(offset)
    }

    /// GPU address of heap offset `offset`.
    pub fn gpu_address_of(&self, offset: usize) -> GpuAddress {
        self.gpu_base + offset as u64
    }

    /// Heap offset of a CPU address, if it lies inside this heap.
    pub fn offset_of(&self, addr: CpuAddress) -> Option<usize> {
        if addr.region != self.region || addr.offset < self.base {
            return None;
        }
        let offset = addr.offset - self.base;
        (offset <= self.capacity).then_some(offset)
    }

    /// Reserve `size` bytes and return the heap offset of the reservation.
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if size > self.available() {
            return Err(MclError::OutOfSpace {
                heap: self.kind,
                requested: size,
                available: self.available(),
            });
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }

    /// Advance `used` to the next multiple of `alignment` (a power of two).
    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        let aligned = align_up(self.used, alignment);
        self.get_space(aligned - self.used).map(|_| ())
    }

    /// Mark `used` bytes as consumed (decoder restoring a serialized heap).
    pub(crate) fn set_used(&mut self, used: usize) -> Result<()> {
        if used > self.capacity {
            return Err(MclError::OutOfSpace {
                heap: self.kind,
                requested: used,
                available: self.capacity,
            });
        }
        self.used = used;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandContainer
// ---------------------------------------------------------------------------

/// Memory plus the heaps carved out of it.
#[derive(Debug)]
pub struct CommandContainer {
    pub memory: DeviceMemory,
    pub cs: Heap,
    pub ih: Heap,
    pub ioh: Heap,
    pub ssh: Heap,
    pub consts: Heap,
}

impl CommandContainer {
    /// Allocate one region per heap through `allocator`.
    pub fn allocate(
        allocator: &dyn Allocator,
        cs_size: usize,
        ih_size: usize,
        ioh_size: usize,
        ssh_size: usize,
        consts_size: usize,
    ) -> Result<Self> {
        let mut memory = DeviceMemory::new();
        let mut make = |kind: HeapKind, size: usize| -> Result<Heap> {
            let allocation = allocator.allocate(kind.allocation_kind(), size)?;
            let region = memory.add_region(allocation, size);
            Ok(Heap::new(kind, region, 0, size, allocation.gpu_address))
        };
        let cs = make(HeapKind::CommandStream, cs_size)?;
        let ih = make(HeapKind::Instruction, ih_size)?;
        let ioh = make(HeapKind::IndirectObject, ioh_size)?;
        let ssh = make(HeapKind::SurfaceState, ssh_size)?;
        let consts = make(HeapKind::Constants, consts_size)?;
        Ok(Self {
            memory,
            cs,
            ih,
            ioh,
            ssh,
            consts,
        })
    }

    pub fn heap(&self, kind: HeapKind) -> &Heap {
        match kind {
            HeapKind::CommandStream => &self.cs,
            HeapKind::Instruction => &self.ih,
            HeapKind::IndirectObject => &self.ioh,
            HeapKind::SurfaceState => &self.ssh,
            HeapKind::Constants => &self.consts,
        }
    }

    pub fn heap_mut(&mut self, kind: HeapKind) -> &mut Heap {
        match kind {
            HeapKind::CommandStream => &mut self.cs,
            HeapKind::Instruction => &mut self.ih,
            HeapKind::IndirectObject => &mut self.ioh,
            HeapKind::SurfaceState => &mut self.ssh,
            HeapKind::Constants => &mut self.consts,
        }
    }

    /// Allocations backing every heap, for the residency container.
    pub fn heap_allocations(&self) -> Vec<Allocation> {
        [&self.cs, &self.ih, &self.ioh, &self.ssh, &self.consts]
            .iter()
            .filter_map(|h| self.memory.allocation(h.region()).copied())
            .collect()
    }

    /// Used bytes of a heap.
    pub fn heap_bytes(&self, kind: HeapKind) -> &[u8] {
        let heap = self.heap(kind);
        self.memory
            .region_bytes(heap.region())
            .map(|b| &b[heap.base..heap.base + heap.used()])
            .unwrap_or(&[])
    }

    /// Resolve a patch site of `kind`'s heap to a CPU address.
    pub fn resolve(&self, kind: HeapKind, site: &PatchSite) -> CpuAddress {
        site.resolve(self.heap(kind))
    }

    /// Write `bytes` at a patch site of `kind`'s heap.
    pub fn patch(&mut self, kind: HeapKind, site: &PatchSite, bytes: &[u8]) -> Result<()> {
        let addr = site.resolve(self.heap(kind));
        self.memory.write(addr, bytes)
    }

    /// Reserve `bytes.len()` bytes in a heap and copy `bytes` there.
    pub fn append(&mut self, kind: HeapKind, bytes: &[u8]) -> Result<usize> {
        let offset = self.heap_mut(kind).get_space(bytes.len())?;
        let addr = self.heap(kind).address_of(offset);
        self.memory.write(addr, bytes)?;
        Ok(offset)
    }
}

/// Round `value` up to a multiple of `alignment` (0 and 1 mean none).
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return value;
    }
    let remainder = value % alignment;
    if remainder == 0 {
        value
    } else {
        value + (alignment - remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(id: u32, gpu: u64) -> Allocation {
        Allocation {
            id: AllocationId(id),
            kind: AllocationKind::CommandBuffer,
            gpu_address: gpu,
            size: 256,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(13, 0), 13);
        assert_eq!(align_up(13, 1), 13);
    }

    #[test]
    fn test_memory_read_write_roundtrip() {
        let mut mem = DeviceMemory::new();
        let r = mem.add_region(allocation(1, 0x1000), 64);
        mem.write_u64(CpuAddress::new(r, 8), 0xdead_beef_cafe).unwrap();
        assert_eq!(mem.read_u64(CpuAddress::new(r, 8)).unwrap(), 0xdead_beef_cafe);
        mem.write_u32(CpuAddress::new(r, 60), 7).unwrap();
        assert_eq!(mem.read_u32(CpuAddress::new(r, 60)).unwrap(), 7);
    }

    #[test]
    fn test_memory_write_out_of_bounds() {
        let mut mem = DeviceMemory::new();
        let r = mem.add_region(allocation(1, 0x1000), 16);
        let err = mem.write(CpuAddress::new(r, 12), &[0u8; 8]).unwrap_err();
        assert!(matches!(err, MclError::OutOfBounds { offset: 12, len: 8 }));
        let err = mem.read(CpuAddress::new(RegionId(9), 0), 1).unwrap_err();
        assert!(matches!(err, MclError::OutOfBounds { .. }));
    }

    #[test]
    fn test_heap_get_space_and_align() {
        let mut heap = Heap::new(HeapKind::IndirectObject, RegionId(0), 0, 128, 0x10_0000);
        assert_eq!(heap.get_space(10).unwrap(), 0);
        heap.align_to(64).unwrap();
        assert_eq!(heap.used(), 64);
        assert_eq!(heap.get_space(64).unwrap(), 64);
        let err = heap.get_space(1).unwrap_err();
        assert!(matches!(
            err,
            MclError::OutOfSpace {
                heap: HeapKind::IndirectObject,
                requested: 1,
                available: 0
            }
        ));
        assert_eq!(heap.end_gpu_address(), 0x10_0000 + 128);
    }

    #[test]
    fn test_heap_offset_of() {
        let heap = Heap::new(HeapKind::CommandStream, RegionId(2), 16, 64, 0);
        assert_eq!(heap.offset_of(CpuAddress::new(RegionId(2), 20)), Some(4));
        assert_eq!(heap.offset_of(CpuAddress::new(RegionId(2), 8)), None);
        assert_eq!(heap.offset_of(CpuAddress::new(RegionId(1), 20)), None);
    }

    #[test]
    fn test_container_append_and_heap_bytes() {
        let table = AllocationTable::new();
        let mut c = CommandContainer::allocate(&table, 64, 64, 64, 64, 64).unwrap();
        let off = c.append(HeapKind::CommandStream, &[1, 2, 3, 4]).unwrap();
        assert_eq!(off, 0);
        assert_eq!(c.heap_bytes(HeapKind::CommandStream), &[1, 2, 3, 4]);
        assert_eq!(c.heap_allocations().len(), 5);
        assert_ne!(c.cs.gpu_base(), c.ioh.gpu_base());
    }
}
