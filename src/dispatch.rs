//! Per-launch dispatch state that group-size, group-count, global-offset
//! and SLM variables push into.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{MclError, Result};
use crate::kernel::KernelDescriptor;
use crate::memory::{align_up, CommandContainer, GpuAddress, HeapKind};
use crate::variable::usage::{PatchSite, UsageSite};
use crate::variable::VarId;
use crate::walker::MutableComputeWalker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatchId(pub u32);

impl DispatchId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// IndirectData
// ---------------------------------------------------------------------------

/// Where a cross-thread byte range physically lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    pub command_buffer: Option<UsageSite>,
    pub indirect: Option<UsageSite>,
}

/// Cross-thread and per-thread data of one dispatch.
///
/// The first `inline_size` bytes of cross-thread data live in the walker's
/// inline block in the command stream; the rest starts at `heap_offset`
/// in the indirect-object heap and is followed by per-thread data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectData {
    inline_offset: Option<usize>,
    inline_size: usize,
    heap_offset: usize,
    cross_thread_size: usize,
    per_thread_offset: usize,
    per_thread_capacity: usize,
}

impl IndirectData {
    pub fn new(
        inline_offset: Option<usize>,
        inline_size: usize,
        heap_offset: usize,
        cross_thread_size: usize,
        per_thread_capacity: usize,
    ) -> Self {
        let inline_size = if inline_offset.is_some() {
            inline_size.min(cross_thread_size)
        } else {
            0
        };
        let heap_ctd = cross_thread_size - inline_size;
        Self {
            inline_offset,
            inline_size,
            heap_offset,
            cross_thread_size,
            per_thread_offset: heap_offset + heap_ctd,
            per_thread_capacity,
        }
    }

    pub fn inline_offset(&self) -> Option<usize> {
        self.inline_offset
    }

    pub fn inline_size(&self) -> usize {
        self.inline_size
    }

    pub fn heap_offset(&self) -> usize {
        self.heap_offset
    }

    pub fn cross_thread_size(&self) -> usize {
        self.cross_thread_size
    }

    /// Cross-thread bytes stored in the heap.
    pub fn heap_cross_thread_size(&self) -> usize {
        self.cross_thread_size - self.inline_size
    }

    pub fn per_thread_offset(&self) -> usize {
        self.per_thread_offset
    }

    pub fn per_thread_capacity(&self) -> usize {
        self.per_thread_capacity
    }

    /// Split `len` bytes at cross-thread offset `ctd_offset` into an
    /// inline part and a heap part, as sites bound to `c`.
    pub fn place(&self, c: &CommandContainer, ctd_offset: usize, len: usize) -> Placement {
        let mut out = Placement::default();
        match self.inline_offset {
            Some(inline) if ctd_offset < self.inline_size => {
                let cs_len = len.min(self.inline_size - ctd_offset);
                out.command_buffer = Some(UsageSite::new(
                    PatchSite::Bound(c.cs.address_of(inline + ctd_offset)),
                    cs_len,
                ));
                if cs_len < len {
                    out.indirect = Some(UsageSite::new(
                        PatchSite::Bound(c.ioh.address_of(self.heap_offset)),
                        len - cs_len,
                    ));
                }
            }
            _ => {
                let heap = self.heap_offset + ctd_offset - self.inline_size;
                out.indirect = Some(UsageSite::new(
                    PatchSite::Bound(c.ioh.address_of(heap)),
                    len,
                ));
            }
        }
        out
    }

    /// Write `bytes` at cross-thread offset `ctd_offset`.
    pub fn write(&self, c: &mut CommandContainer, ctd_offset: usize, bytes: &[u8]) -> Result<()> {
        if ctd_offset + bytes.len() > self.cross_thread_size {
            return Err(MclError::OutOfBounds {
                offset: ctd_offset,
                len: bytes.len(),
            });
        }
        let placed = self.place(c, ctd_offset, bytes.len());
        let mut rest = bytes;
        if let Some(cs) = placed.command_buffer {
            let (head, tail) = rest.split_at(cs.patch_size);
            c.patch(HeapKind::CommandStream, &cs.site, head)?;
            rest = tail;
        }
        if let Some(heap) = placed.indirect {
            c.patch(HeapKind::IndirectObject, &heap.site, rest)?;
        }
        Ok(())
    }

    fn write_dims(&self, c: &mut CommandContainer, offset: Option<u16>, dims: [u32; 3]) -> Result<()> {
        match offset {
            Some(o) => {
                let mut bytes = [0u8; 12];
                for (i, d) in dims.iter().enumerate() {
                    bytes[i * 4..i * 4 + 4].copy_from_slice(&d.to_le_bytes());
                }
                self.write(c, o as usize, &bytes)
            }
            None => Ok(()),
        }
    }

    fn write_per_thread(&self, c: &mut CommandContainer, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.per_thread_capacity {
            return Err(MclError::OutOfSpace {
                heap: HeapKind::IndirectObject,
                requested: bytes.len(),
                available: self.per_thread_capacity,
            });
        }
        let addr = c.ioh.address_of(self.per_thread_offset);
        c.memory.write(addr, bytes)
    }
}

// ---------------------------------------------------------------------------
// Local IDs
// ---------------------------------------------------------------------------

/// Whether local IDs must be generated on the host instead of by the
/// walker. Hardware generation needs power-of-two work-group dimensions.
pub fn requires_local_id_generation(num_channels: u32, group_size: [u32; 3]) -> bool {
    num_channels > 0 && !group_size.iter().all(|d| d.is_power_of_two())
}

/// Bytes of per-thread data one hardware thread needs.
pub fn per_thread_data_size_per_thread(simd_size: u32, grf_size: usize, num_channels: u32) -> usize {
    let channel = align_up(simd_size as usize * 2, grf_size);
    channel * num_channels as usize
}

/// Lay out `u16` local IDs per thread, one GRF-aligned block per channel,
/// walking x fastest.
pub fn generate_local_ids(
    simd_size: u32,
    grf_size: usize,
    num_channels: u32,
    group_size: [u32; 3],
) -> Vec<u8> {
    let simd = simd_size as usize;
    let total = group_size.iter().map(|d| *d as usize).product::<usize>();
    let threads = total.div_ceil(simd);
    let channel_stride = align_up(simd * 2, grf_size);
    let per_thread = per_thread_data_size_per_thread(simd_size, grf_size, num_channels);
    let mut out = vec![0u8; threads * per_thread];
    let (x, y) = (group_size[0] as usize, group_size[1] as usize);
    for t in 0..threads {
        for lane in 0..simd {
            let idx = t * simd + lane;
            if idx >= total {
                break;
            }
            let ids = [idx % x, (idx / x) % y, idx / (x * y)];
            for ch in 0..num_channels as usize {
                let at = t * per_thread + ch * channel_stride + lane * 2;
                out[at..at + 2].copy_from_slice(&(ids[ch] as u16).to_le_bytes());
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Dispatch sizes
// ---------------------------------------------------------------------------

fn overflow(what: &str, detail: String) -> MclError {
    MclError::InvalidArgument(format!("{} overflows 32 bits: {}", what, detail))
}

/// Work items per group.
pub fn total_local_size(group_size: [u32; 3]) -> Result<u32> {
    group_size
        .iter()
        .try_fold(1u32, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| overflow("local work size", format!("{:?}", group_size)))
}

/// Work items per dimension over the whole dispatch.
pub fn global_work_size(group_size: [u32; 3], group_count: [u32; 3]) -> Result<[u32; 3]> {
    let mut out = [0u32; 3];
    for ((o, gs), gc) in out.iter_mut().zip(group_size).zip(group_count) {
        *o = gs
            .checked_mul(gc)
            .ok_or_else(|| overflow("global work size", format!("{:?} x {:?}", group_size, group_count)))?;
    }
    Ok(out)
}

/// SLM argument footprint plus the kernel's inline SLM.
pub fn slm_total_size(slm_args_size: u32, slm_inline_size: u32) -> Result<u32> {
    slm_args_size
        .checked_add(slm_inline_size)
        .ok_or_else(|| overflow("SLM size", format!("{} + {}", slm_args_size, slm_inline_size)))
}

/// Reject dispatch sizes the walker and implicit arguments cannot hold.
pub fn check_dispatch_sizes(
    kernel: &KernelDescriptor,
    group_size: [u32; 3],
    group_count: [u32; 3],
    slm_args_size: u32,
) -> Result<()> {
    total_local_size(group_size)?;
    global_work_size(group_size, group_count)?;
    slm_total_size(slm_args_size, kernel.slm_inline_size)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// DispatchBinding
// ---------------------------------------------------------------------------

/// Variables that drive one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchVariables {
    pub group_size: Option<VarId>,
    pub group_count: Option<VarId>,
    pub global_offset: Option<VarId>,
    pub last_slm: Option<VarId>,
}

#[derive(Debug, Clone)]
pub struct DispatchBinding {
    kernel: Arc<KernelDescriptor>,
    walker: MutableComputeWalker,
    indirect: IndirectData,
    isa_address: GpuAddress,
    grf_size: usize,
    vars: DispatchVariables,

    group_size: [u32; 3],
    group_count: [u32; 3],
    global_offset: [u32; 3],
    total_lws: u32,
    threads_per_group: u32,
    execution_mask: u32,
    local_ids_by_runtime: bool,
    per_thread_data_size: usize,
    slm_total_size: u32,

    commit_group_size: bool,
    commit_group_count: bool,
    commit_slm: bool,
}

impl DispatchBinding {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kernel: Arc<KernelDescriptor>,
        walker: MutableComputeWalker,
        indirect: IndirectData,
        isa_address: GpuAddress,
        grf_size: usize,
        vars: DispatchVariables,
        group_size: [u32; 3],
        group_count: [u32; 3],
        global_offset: [u32; 3],
        slm_args_size: u32,
    ) -> Result<Self> {
        check_dispatch_sizes(&kernel, group_size, group_count, slm_args_size)?;
        let slm_total_size = slm_total_size(slm_args_size, kernel.slm_inline_size)?;
        Ok(Self {
            kernel,
            walker,
            indirect,
            isa_address,
            grf_size,
            vars,
            group_size,
            group_count,
            global_offset,
            total_lws: 1,
            threads_per_group: 0,
            execution_mask: 0,
            local_ids_by_runtime: false,
            per_thread_data_size: 0,
            slm_total_size,
            commit_group_size: false,
            commit_group_count: false,
            commit_slm: false,
        })
    }

    /// Write every walker field and implicit argument of a fresh dispatch.
    pub fn program(&mut self, c: &mut CommandContainer) -> Result<()> {
        self.walker.write_header(c)?;
        let ioh_start = c.ioh.gpu_address_of(self.indirect.heap_offset());
        self.walker.set_indirect_data_start(c, ioh_start)?;
        self.set_group_size(c, self.group_size, false)?;
        self.set_group_count(c, self.group_count, false)?;
        self.set_global_offset(c, self.global_offset)?;
        self.walker.set_slm_size(c, self.slm_total_size)?;
        Ok(())
    }

    pub fn kernel(&self) -> &Arc<KernelDescriptor> {
        &self.kernel
    }

    pub fn walker(&self) -> &MutableComputeWalker {
        &self.walker
    }

    pub fn indirect(&self) -> &IndirectData {
        &self.indirect
    }

    pub fn isa_address(&self) -> GpuAddress {
        self.isa_address
    }

    pub fn variables(&self) -> &DispatchVariables {
        &self.vars
    }

    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    pub fn group_count(&self) -> [u32; 3] {
        self.group_count
    }

    pub fn global_offset(&self) -> [u32; 3] {
        self.global_offset
    }

    pub fn slm_total_size(&self) -> u32 {
        self.slm_total_size
    }

    pub fn threads_per_group(&self) -> u32 {
        self.threads_per_group
    }

    pub fn execution_mask(&self) -> u32 {
        self.execution_mask
    }

    pub fn local_ids_by_runtime(&self) -> bool {
        self.local_ids_by_runtime
    }

    pub fn per_thread_data_size(&self) -> usize {
        self.per_thread_data_size
    }

    pub fn needs_commit(&self) -> bool {
        self.commit_group_size || self.commit_group_count || self.commit_slm
    }

    pub fn global_work_size(&self) -> Result<[u32; 3]> {
        global_work_size(self.group_size, self.group_count)
    }

    pub fn work_dim(&self) -> Result<u32> {
        let gws = self.global_work_size()?;
        Ok(if gws[2] > 1 {
            3
        } else if gws[1] > 1 {
            2
        } else {
            1
        })
    }

    /// Whether `group_size` fits this dispatch's group count.
    pub fn check_group_size(&self, group_size: [u32; 3]) -> Result<()> {
        check_dispatch_sizes(&self.kernel, group_size, self.group_count, 0)
    }

    /// Whether `group_count` fits this dispatch's group size.
    pub fn check_group_count(&self, group_count: [u32; 3]) -> Result<()> {
        global_work_size(self.group_size, group_count).map(|_| ())
    }

    pub fn set_group_size(&mut self, c: &mut CommandContainer, group_size: [u32; 3], stage: bool) -> Result<()> {
        self.check_group_size(group_size)?;
        self.total_lws = total_local_size(group_size)?;
        self.group_size = group_size;

        let channels = self.kernel.num_local_id_channels;
        self.local_ids_by_runtime = requires_local_id_generation(channels, group_size);
        debug!(
            kernel = %self.kernel.name,
            ?group_size,
            total = self.total_lws,
            runtime_local_ids = self.local_ids_by_runtime,
            "dispatch group size"
        );
        if self.local_ids_by_runtime {
            let ids = generate_local_ids(self.kernel.simd_size, self.grf_size, channels, group_size);
            self.indirect.write_per_thread(c, &ids)?;
            self.per_thread_data_size = ids.len();
        } else {
            self.per_thread_data_size = 0;
        }

        let simd = self.kernel.simd_size;
        self.threads_per_group = self.total_lws.div_ceil(simd);
        let remainder = self.total_lws & (simd - 1);
        self.execution_mask = low_bits_mask(if remainder == 0 { simd } else { remainder });

        if stage {
            self.commit_group_size = true;
            return Ok(());
        }
        self.write_group_size(c)?;
        self.write_work_size(c)
    }

    pub fn set_group_count(&mut self, c: &mut CommandContainer, group_count: [u32; 3], stage: bool) -> Result<()> {
        self.check_group_count(group_count)?;
        self.group_count = group_count;
        debug!(kernel = %self.kernel.name, ?group_count, "dispatch group count");
        if stage {
            self.commit_group_count = true;
            return Ok(());
        }
        self.write_group_count(c)?;
        self.write_work_size(c)
    }

    pub fn set_global_offset(&mut self, c: &mut CommandContainer, global_offset: [u32; 3]) -> Result<()> {
        self.global_offset = global_offset;
        debug!(kernel = %self.kernel.name, ?global_offset, "dispatch global offset");
        self.indirect
            .write_dims(c, self.kernel.dispatch_traits.global_work_offset, global_offset)
    }

    /// `slm_args_size` is the aligned footprint of the SLM arguments; the
    /// kernel's inline SLM is added on top.
    pub fn set_slm_size(&mut self, c: &mut CommandContainer, slm_args_size: u32, stage: bool) -> Result<()> {
        self.slm_total_size = slm_total_size(slm_args_size, self.kernel.slm_inline_size)?;
        debug!(kernel = %self.kernel.name, total = self.slm_total_size, "dispatch slm size");
        if stage {
            self.commit_slm = true;
            return Ok(());
        }
        self.walker.set_slm_size(c, self.slm_total_size)
    }

    /// Flush staged changes into the command stream.
    pub fn commit(&mut self, c: &mut CommandContainer) -> Result<()> {
        if !self.needs_commit() {
            return Ok(());
        }
        trace!(kernel = %self.kernel.name, "dispatch commit");
        if self.commit_group_size {
            self.write_group_size(c)?;
        }
        if self.commit_group_count {
            self.write_group_count(c)?;
        }
        if self.commit_group_size || self.commit_group_count {
            self.write_work_size(c)?;
        }
        if self.commit_slm {
            self.walker.set_slm_size(c, self.slm_total_size)?;
        }
        self.commit_group_size = false;
        self.commit_group_count = false;
        self.commit_slm = false;
        Ok(())
    }

    fn write_group_size(&self, c: &mut CommandContainer) -> Result<()> {
        let k = &self.kernel;
        let channels = k.num_local_id_channels;
        if self.local_ids_by_runtime || channels == 0 {
            self.walker.set_generate_local_id(c, false, 0, channels)?;
        } else {
            self.walker.set_generate_local_id(c, true, 0, channels)?;
            self.walker.set_work_group_size(c, self.group_size)?;
        }
        let length = self.indirect.heap_cross_thread_size() + self.per_thread_data_size;
        self.walker.set_indirect_data_length(c, length as u32)?;

        let mut start = self.isa_address;
        if !self.local_ids_by_runtime {
            start += k.skip_per_thread_data_load as u64;
        }
        self.walker.set_kernel_start_address(c, start)?;

        let traits = &k.dispatch_traits;
        self.indirect.write_dims(c, traits.local_work_size, self.group_size)?;
        self.indirect.write_dims(c, traits.local_work_size2, self.group_size)?;
        self.indirect
            .write_dims(c, traits.enqueued_local_work_size, self.group_size)?;

        self.walker.set_threads_per_group(c, self.threads_per_group)?;
        self.walker.set_execution_mask(c, self.execution_mask)
    }

    fn write_group_count(&self, c: &mut CommandContainer) -> Result<()> {
        self.walker.set_group_count(c, self.group_count)?;
        self.indirect
            .write_dims(c, self.kernel.dispatch_traits.num_work_groups, self.group_count)
    }

    fn write_work_size(&self, c: &mut CommandContainer) -> Result<()> {
        let traits = &self.kernel.dispatch_traits;
        self.indirect
            .write_dims(c, traits.global_work_size, self.global_work_size()?)?;
        if let Some(o) = traits.work_dim {
            self.indirect.write(c, o as usize, &self.work_dim()?.to_le_bytes())?;
        }
        Ok(())
    }
}

fn low_bits_mask(n: u32) -> u32 {
    if n >= 32 {
        u32::MAX
    } else {
        (1u32 << n) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fixtures::sample_kernel;
    use crate::memory::AllocationTable;
    use crate::walker::WalkerLayout;

    fn setup() -> (CommandContainer, DispatchBinding) {
        let table = AllocationTable::new();
        let mut c = CommandContainer::allocate(&table, 1024, 256, 4096, 256, 64).unwrap();
        let cs = c.append(HeapKind::CommandStream, &[0u8; 0x80]).unwrap();
        let walker = MutableComputeWalker::new(cs, WalkerLayout::default());
        let k = Arc::new(sample_kernel());
        let ioh = c.heap_mut(HeapKind::IndirectObject).get_space(128 + 1024).unwrap();
        let indirect = IndirectData::new(
            Some(walker.inline_data_offset()),
            32,
            ioh,
            k.cross_thread_data_size,
            1024,
        );
        let mut d = DispatchBinding::new(
            k,
            walker,
            indirect,
            0x4000,
            64,
            DispatchVariables::default(),
            [8, 8, 1],
            [2, 3, 1],
            [0, 0, 0],
            0,
        )
        .unwrap();
        d.program(&mut c).unwrap();
        (c, d)
    }

    fn read_ctd_u32(c: &CommandContainer, d: &DispatchBinding, ctd: usize) -> u32 {
        let ind = d.indirect();
        if ctd < ind.inline_size() {
            c.memory
                .read_u32(c.cs.address_of(ind.inline_offset().unwrap() + ctd))
                .unwrap()
        } else {
            c.memory
                .read_u32(c.ioh.address_of(ind.heap_offset() + ctd - ind.inline_size()))
                .unwrap()
        }
    }

    #[test]
    fn test_place_splits_inline_and_heap() {
        let (c, d) = setup();
        let p = d.indirect().place(&c, 24, 16);
        assert_eq!(p.command_buffer.unwrap().patch_size, 8);
        assert_eq!(p.indirect.unwrap().patch_size, 8);
        let p = d.indirect().place(&c, 40, 8);
        assert!(p.command_buffer.is_none());
        assert_eq!(
            p.indirect.unwrap().site,
            PatchSite::Bound(c.ioh.address_of(d.indirect().heap_offset() + 8))
        );
    }

    #[test]
    fn test_program_writes_work_sizes() {
        let (c, d) = setup();
        // local work size at ctd 64
        assert_eq!(read_ctd_u32(&c, &d, 64), 8);
        // num work groups at ctd 88
        assert_eq!(read_ctd_u32(&c, &d, 92), 3);
        // global work size at ctd 100
        assert_eq!(read_ctd_u32(&c, &d, 100), 16);
        assert_eq!(read_ctd_u32(&c, &d, 104), 24);
        // work dim at ctd 124
        assert_eq!(read_ctd_u32(&c, &d, 124), 2);
        assert_eq!(d.threads_per_group(), 4);
        assert_eq!(d.execution_mask(), 0xffff);
        assert!(!d.local_ids_by_runtime());
    }

    #[test]
    fn test_non_power_of_two_group_generates_local_ids() {
        let (mut c, mut d) = setup();
        d.set_group_size(&mut c, [3, 5, 1], false).unwrap();
        assert!(d.local_ids_by_runtime());
        // 15 lanes in one SIMD16 thread, 3 channels of 64 bytes
        assert_eq!(d.per_thread_data_size(), 3 * 64);
        assert_eq!(d.execution_mask(), (1 << 15) - 1);
        let pt = d.indirect().per_thread_offset();
        let lane = |ch: usize, lane: usize| {
            let addr = c.ioh.address_of(pt + ch * 64 + lane * 2);
            let b = c.memory.read(addr, 2).unwrap();
            u16::from_le_bytes([b[0], b[1]])
        };
        // lane 7 -> (1, 2, 0)
        assert_eq!(lane(0, 7), 1);
        assert_eq!(lane(1, 7), 2);
        assert_eq!(lane(2, 7), 0);
        // kernel start does not skip the per-thread load
        let start = c
            .memory
            .read_u64(c.cs.address_of(d.walker().offset() + 0x20))
            .unwrap();
        assert_eq!(start, 0x4000);
    }

    #[test]
    fn test_staged_group_count_deferred_until_commit() {
        let (mut c, mut d) = setup();
        d.set_group_count(&mut c, [7, 1, 1], true).unwrap();
        assert!(d.needs_commit());
        let gc_offset = d.walker().offset() + 0x10;
        let walker_gc =
            |c: &CommandContainer| c.memory.read_u32(c.cs.address_of(gc_offset)).unwrap();
        assert_eq!(walker_gc(&c), 2);
        d.commit(&mut c).unwrap();
        assert!(!d.needs_commit());
        assert_eq!(walker_gc(&c), 7);
        assert_eq!(read_ctd_u32(&c, &d, 88), 7);
    }

    #[test]
    fn test_per_thread_overflow_reported() {
        let ind = IndirectData::new(None, 0, 0, 16, 8);
        let table = AllocationTable::new();
        let mut c = CommandContainer::allocate(&table, 64, 64, 64, 64, 64).unwrap();
        let err = ind.write_per_thread(&mut c, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, MclError::OutOfSpace { .. }));
    }

    #[test]
    fn test_group_count_overflow_rejected_and_state_kept() {
        let (mut c, mut d) = setup();
        let err = d.set_group_count(&mut c, [1 << 29, 1, 1], false).unwrap_err();
        assert!(matches!(err, MclError::InvalidArgument(_)));
        assert_eq!(d.group_count(), [2, 3, 1]);
        assert_eq!(read_ctd_u32(&c, &d, 100), 16);

        assert!(d.set_group_count(&mut c, [1 << 29, 1, 1], true).is_err());
        assert!(!d.needs_commit());
    }

    #[test]
    fn test_group_size_overflow_rejected() {
        let (mut c, mut d) = setup();
        assert!(d.set_group_size(&mut c, [1 << 16, 1 << 16, 1], false).is_err());
        assert!(d.set_group_size(&mut c, [1 << 31, 1, 1], false).is_err());
        assert_eq!(d.group_size(), [8, 8, 1]);
        assert_eq!(d.threads_per_group(), 4);
    }

    #[test]
    fn test_slm_total_size_overflow_rejected() {
        let (mut c, mut d) = setup();
        let mut k = sample_kernel();
        k.slm_inline_size = 64;
        assert!(check_dispatch_sizes(&k, [8, 8, 1], [1, 1, 1], u32::MAX).is_err());
        assert!(d.set_slm_size(&mut c, u32::MAX, false).is_ok());
        assert_eq!(d.slm_total_size(), u32::MAX);
        assert_eq!(global_work_size([8, 8, 1], [2, 3, 1]).unwrap(), [16, 24, 1]);
    }

    #[test]
    fn test_requires_local_id_generation() {
        assert!(!requires_local_id_generation(3, [8, 4, 1]));
        assert!(requires_local_id_generation(3, [6, 4, 1]));
        assert!(!requires_local_id_generation(0, [6, 4, 1]));
    }
}
