//! The compute-walker (dispatch) command as an opaque descriptor with
//! named field offsets.

use serde::{Deserialize, Serialize};

use crate::commands::{header, OP_COMPUTE_WALKER};
use crate::error::Result;
use crate::memory::{CommandContainer, GpuAddress};

/// Post-sync operation that writes an immediate value.
pub const POST_SYNC_WRITE_IMMEDIATE: u32 = 1;

/// Byte offsets of the walker fields. The defaults describe the reference
/// hardware; other layouts can be supplied through the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerLayout {
    pub size: usize,
    pub indirect_data_length: usize,
    pub indirect_data_start: usize,
    pub group_count: usize,
    pub execution_mask: usize,
    pub kernel_start: usize,
    pub binding_table: usize,
    pub threads_per_group: usize,
    pub slm_size: usize,
    pub local_id_control: usize,
    pub work_group_size: usize,
    pub post_sync_op: usize,
    pub post_sync_address: usize,
    pub post_sync_immediate: usize,
    pub inline_data: usize,
    pub inline_data_size: usize,
}

impl Default for WalkerLayout {
    fn default() -> Self {
        Self {
            size: 0x80,
            indirect_data_length: 0x04,
            indirect_data_start: 0x08,
            group_count: 0x10,
            execution_mask: 0x1c,
            kernel_start: 0x20,
            binding_table: 0x28,
            threads_per_group: 0x2c,
            slm_size: 0x30,
            local_id_control: 0x34,
            work_group_size: 0x38,
            post_sync_op: 0x44,
            post_sync_address: 0x48,
            post_sync_immediate: 0x50,
            inline_data: 0x60,
            inline_data_size: 32,
        }
    }
}

impl WalkerLayout {
    /// Every field must fit inside the command.
    pub fn fits(&self) -> bool {
        let fields = [
            (self.indirect_data_length, 4),
            (self.indirect_data_start, 8),
            (self.group_count, 12),
            (self.execution_mask, 4),
            (self.kernel_start, 8),
            (self.binding_table, 4),
            (self.threads_per_group, 4),
            (self.slm_size, 4),
            (self.local_id_control, 4),
            (self.work_group_size, 12),
            (self.post_sync_op, 4),
            (self.post_sync_address, 8),
            (self.post_sync_immediate, 8),
            (self.inline_data, self.inline_data_size),
        ];
        fields.iter().all(|(off, len)| *off >= 4 && off + len <= self.size)
    }
}

/// A walker recorded at a command-stream offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutableComputeWalker {
    offset: usize,
    layout: WalkerLayout,
}

impl MutableComputeWalker {
    pub fn new(offset: usize, layout: WalkerLayout) -> Self {
        Self { offset, layout }
    }

    /// Command-stream offset of the walker.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn layout(&self) -> &WalkerLayout {
        &self.layout
    }

    /// Command-stream offset of the inline data block.
    pub fn inline_data_offset(&self) -> usize {
        self.offset + self.layout.inline_data
    }

    pub fn inline_data_size(&self) -> usize {
        self.layout.inline_data_size
    }

    /// Command-stream offset of an arbitrary walker field.
    pub fn field_offset(&self, field: usize) -> usize {
        self.offset + field
    }

    fn put_u32(&self, c: &mut CommandContainer, field: usize, v: u32) -> Result<()> {
        let addr = c.cs.address_of(self.offset + field);
        c.memory.write_u32(addr, v)
    }

    fn put_u64(&self, c: &mut CommandContainer, field: usize, v: u64) -> Result<()> {
        let addr = c.cs.address_of(self.offset + field);
        c.memory.write_u64(addr, v)
    }

    fn put_dims(&self, c: &mut CommandContainer, field: usize, v: [u32; 3]) -> Result<()> {
        for (i, d) in v.iter().enumerate() {
            self.put_u32(c, field + i * 4, *d)?;
        }
        Ok(())
    }

    pub fn write_header(&self, c: &mut CommandContainer) -> Result<()> {
        self.put_u32(c, 0, header(OP_COMPUTE_WALKER, self.layout.size))
    }

    pub fn set_indirect_data_length(&self, c: &mut CommandContainer, len: u32) -> Result<()> {
        self.put_u32(c, self.layout.indirect_data_length, len)
    }

    pub fn set_indirect_data_start(&self, c: &mut CommandContainer, gpu: GpuAddress) -> Result<()> {
        self.put_u64(c, self.layout.indirect_data_start, gpu)
    }

    pub fn set_group_count(&self, c: &mut CommandContainer, count: [u32; 3]) -> Result<()> {
        self.put_dims(c, self.layout.group_count, count)
    }

    pub fn set_execution_mask(&self, c: &mut CommandContainer, mask: u32) -> Result<()> {
        self.put_u32(c, self.layout.execution_mask, mask)
    }

    pub fn set_kernel_start_address(&self, c: &mut CommandContainer, gpu: GpuAddress) -> Result<()> {
        self.put_u64(c, self.layout.kernel_start, gpu)
    }

    pub fn set_binding_table_offset(&self, c: &mut CommandContainer, offset: u32) -> Result<()> {
        self.put_u32(c, self.layout.binding_table, offset)
    }

    pub fn set_threads_per_group(&self, c: &mut CommandContainer, n: u32) -> Result<()> {
        self.put_u32(c, self.layout.threads_per_group, n)
    }

    pub fn set_slm_size(&self, c: &mut CommandContainer, bytes: u32) -> Result<()> {
        self.put_u32(c, self.layout.slm_size, bytes)
    }

    /// Bit 0 enables hardware local-ID generation, bits 1..3 the walk
    /// order, bits 4..6 the channel count.
    pub fn set_generate_local_id(
        &self,
        c: &mut CommandContainer,
        enable: bool,
        walk_order: u32,
        channels: u32,
    ) -> Result<()> {
        let v = (enable as u32) | ((walk_order & 0x7) << 1) | ((channels & 0x7) << 4);
        self.put_u32(c, self.layout.local_id_control, v)
    }

    pub fn set_work_group_size(&self, c: &mut CommandContainer, size: [u32; 3]) -> Result<()> {
        self.put_dims(c, self.layout.work_group_size, size)
    }

    pub fn set_post_sync(
        &self,
        c: &mut CommandContainer,
        address: GpuAddress,
        immediate: u64,
    ) -> Result<()> {
        self.put_u32(c, self.layout.post_sync_op, POST_SYNC_WRITE_IMMEDIATE)?;
        self.put_u64(c, self.layout.post_sync_address, address)?;
        self.put_u64(c, self.layout.post_sync_immediate, immediate)
    }

    pub fn set_post_sync_address(&self, c: &mut CommandContainer, address: GpuAddress) -> Result<()> {
        self.put_u64(c, self.layout.post_sync_address, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocationTable, HeapKind};

    #[test]
    fn test_default_layout_fits() {
        assert!(WalkerLayout::default().fits());
        let bad = WalkerLayout {
            inline_data: 0x70,
            ..WalkerLayout::default()
        };
        assert!(!bad.fits());
    }

    #[test]
    fn test_walker_field_writes() {
        let table = AllocationTable::new();
        let mut c = CommandContainer::allocate(&table, 512, 64, 64, 64, 64).unwrap();
        c.append(HeapKind::CommandStream, &[0u8; 16]).unwrap();
        let off = c.append(HeapKind::CommandStream, &[0u8; 0x80]).unwrap();
        let w = MutableComputeWalker::new(off, WalkerLayout::default());
        w.write_header(&mut c).unwrap();
        w.set_group_count(&mut c, [4, 2, 1]).unwrap();
        w.set_slm_size(&mut c, 2048).unwrap();
        w.set_generate_local_id(&mut c, true, 0, 3).unwrap();

        let read = |c: &CommandContainer, field: usize| {
            c.memory.read_u32(c.cs.address_of(off + field)).unwrap()
        };
        assert_eq!(read(&c, 0x10), 4);
        assert_eq!(read(&c, 0x14), 2);
        assert_eq!(read(&c, 0x18), 1);
        assert_eq!(read(&c, 0x30), 2048);
        assert_eq!(read(&c, 0x34), 1 | (3 << 4));
        assert_eq!(w.inline_data_offset(), 16 + 0x60);
    }
}
