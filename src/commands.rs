//! MI-style command encodings and the mutable views over recorded commands.
//!
//! Every command starts with a header dword `opcode << 24 | length_dwords`.
//! An all-zero dword is a NOOP, so no-op'ing a command means zeroing it.

use crate::error::Result;
use crate::memory::{CommandContainer, GpuAddress};

// ---------------------------------------------------------------------------
// Opcodes and sizes
// ---------------------------------------------------------------------------

pub const NOOP: u32 = 0;

pub const OP_SEMAPHORE_WAIT: u8 = 0x1C;
pub const OP_STORE_DATA_IMM: u8 = 0x20;
pub const OP_LOAD_REGISTER_IMM: u8 = 0x22;
pub const OP_BATCH_BUFFER_START: u8 = 0x31;
pub const OP_STATE_BASE_ADDRESS: u8 = 0x61;
pub const OP_COMPUTE_WALKER: u8 = 0x72;

pub const SEMAPHORE_WAIT_SIZE: usize = 24;
pub const LOAD_REGISTER_IMM_SIZE: usize = 12;
pub const STORE_DATA_IMM_SIZE: usize = 20;
pub const BATCH_BUFFER_START_SIZE: usize = 12;
pub const STATE_BASE_ADDRESS_SIZE: usize = 36;
pub const SURFACE_STATE_SIZE: usize = 64;

/// Field offsets inside the fixed-layout commands.
pub const SEMAPHORE_WAIT_VALUE_OFFSET: usize = 8;
pub const SEMAPHORE_WAIT_ADDRESS_OFFSET: usize = 16;
pub const LOAD_REGISTER_IMM_VALUE_OFFSET: usize = 8;
pub const STORE_DATA_IMM_ADDRESS_OFFSET: usize = 4;
pub const BATCH_BUFFER_START_ADDRESS_OFFSET: usize = 4;
pub const SURFACE_STATE_ADDRESS_OFFSET: usize = 0x20;
pub const SURFACE_STATE_SIZE_OFFSET: usize = 0x28;

/// General-purpose registers used to compare a 64-bit counter.
pub const GPR0_LOW: u32 = 0x2600;
pub const GPR0_HIGH: u32 = 0x2604;

/// Semaphore compare operations.
pub const COMPARE_EQUAL: u32 = 4;
pub const COMPARE_GREATER_OR_EQUAL: u32 = 1;
pub const COMPARE_REGISTER_GREATER_OR_EQUAL: u32 = 0x101;

/// Header bit set on a predicated batch-buffer start.
pub const PREDICATE_ENABLE: u32 = 1 << 8;

/// Value a signalled pool event holds.
pub const EVENT_SIGNALED: u64 = 0;

pub fn header(opcode: u8, size: usize) -> u32 {
    ((opcode as u32) << 24) | (size / 4) as u32
}

pub fn opcode_of(header: u32) -> u8 {
    (header >> 24) as u8
}

/// Length in bytes encoded in a header dword.
pub fn length_of(header: u32) -> usize {
    (header & 0xff) as usize * 4
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

pub fn encode_semaphore_wait(
    address: GpuAddress,
    value: u64,
    compare_op: u32,
) -> [u8; SEMAPHORE_WAIT_SIZE] {
    let mut b = [0u8; SEMAPHORE_WAIT_SIZE];
    put_u32(&mut b, 0, header(OP_SEMAPHORE_WAIT, SEMAPHORE_WAIT_SIZE));
    put_u32(&mut b, 4, compare_op);
    put_u64(&mut b, SEMAPHORE_WAIT_VALUE_OFFSET, value);
    put_u64(&mut b, SEMAPHORE_WAIT_ADDRESS_OFFSET, address);
    b
}

pub fn encode_load_register_imm(register: u32, value: u32) -> [u8; LOAD_REGISTER_IMM_SIZE] {
    let mut b = [0u8; LOAD_REGISTER_IMM_SIZE];
    put_u32(&mut b, 0, header(OP_LOAD_REGISTER_IMM, LOAD_REGISTER_IMM_SIZE));
    put_u32(&mut b, 4, register);
    put_u32(&mut b, LOAD_REGISTER_IMM_VALUE_OFFSET, value);
    b
}

pub fn encode_store_data_imm(address: GpuAddress, data: u64) -> [u8; STORE_DATA_IMM_SIZE] {
    let mut b = [0u8; STORE_DATA_IMM_SIZE];
    put_u32(&mut b, 0, header(OP_STORE_DATA_IMM, STORE_DATA_IMM_SIZE));
    put_u64(&mut b, STORE_DATA_IMM_ADDRESS_OFFSET, address);
    put_u64(&mut b, 12, data);
    b
}

pub fn encode_batch_buffer_start(
    address: GpuAddress,
    predicated: bool,
) -> [u8; BATCH_BUFFER_START_SIZE] {
    let mut b = [0u8; BATCH_BUFFER_START_SIZE];
    let mut hdr = header(OP_BATCH_BUFFER_START, BATCH_BUFFER_START_SIZE);
    if predicated {
        hdr |= PREDICATE_ENABLE;
    }
    put_u32(&mut b, 0, hdr);
    put_u64(&mut b, BATCH_BUFFER_START_ADDRESS_OFFSET, address);
    b
}

/// General, instruction, indirect-object and surface-state base addresses.
pub fn encode_state_base_address(bases: [GpuAddress; 4]) -> [u8; STATE_BASE_ADDRESS_SIZE] {
    let mut b = [0u8; STATE_BASE_ADDRESS_SIZE];
    put_u32(&mut b, 0, header(OP_STATE_BASE_ADDRESS, STATE_BASE_ADDRESS_SIZE));
    for (i, base) in bases.iter().enumerate() {
        put_u64(&mut b, 4 + i * 8, *base);
    }
    b
}

/// Offset of the `index`-th base address inside STATE_BASE_ADDRESS.
pub fn state_base_address_field(index: usize) -> usize {
    4 + index * 8
}

/// A stateful buffer surface descriptor.
pub fn encode_surface_state(address: GpuAddress, size: u32) -> [u8; SURFACE_STATE_SIZE] {
    let mut b = [0u8; SURFACE_STATE_SIZE];
    put_u64(&mut b, SURFACE_STATE_ADDRESS_OFFSET, address);
    put_u32(&mut b, SURFACE_STATE_SIZE_OFFSET, size);
    b
}

// ---------------------------------------------------------------------------
// Mutable command views
// ---------------------------------------------------------------------------

/// A SEMAPHORE_WAIT recorded at a command-stream offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableSemaphoreWait {
    offset: usize,
    saved: Option<[u8; SEMAPHORE_WAIT_SIZE]>,
}

impl MutableSemaphoreWait {
    pub fn new(offset: usize) -> Self {
        Self {
            offset,
            saved: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_nooped(&self) -> bool {
        self.saved.is_some()
    }

    /// Original bytes of a NOOP'd command.
    pub fn saved(&self) -> Option<&[u8; SEMAPHORE_WAIT_SIZE]> {
        self.saved.as_ref()
    }

    pub fn set_semaphore_address(&self, c: &mut CommandContainer, address: GpuAddress) -> Result<()> {
        let addr = c.cs.address_of(self.offset + SEMAPHORE_WAIT_ADDRESS_OFFSET);
        c.memory.write_u64(addr, address)
    }

    pub fn set_semaphore_value(&self, c: &mut CommandContainer, value: u64) -> Result<()> {
        let addr = c.cs.address_of(self.offset + SEMAPHORE_WAIT_VALUE_OFFSET);
        c.memory.write_u64(addr, value)
    }

    /// Replace the command by NOOPs, keeping its bytes for [`Self::restore_with_semaphore_address`].
    pub fn noop(&mut self, c: &mut CommandContainer) -> Result<()> {
        let addr = c.cs.address_of(self.offset);
        if self.saved.is_none() {
            let mut saved = [0u8; SEMAPHORE_WAIT_SIZE];
            saved.copy_from_slice(c.memory.read(addr, SEMAPHORE_WAIT_SIZE)?);
            self.saved = Some(saved);
        }
        c.memory.write(addr, &[0u8; SEMAPHORE_WAIT_SIZE])
    }

    pub fn restore_with_semaphore_address(
        &mut self,
        c: &mut CommandContainer,
        address: GpuAddress,
    ) -> Result<()> {
        if let Some(saved) = self.saved.take() {
            let addr = c.cs.address_of(self.offset);
            c.memory.write(addr, &saved)?;
        }
        self.set_semaphore_address(c, address)
    }
}

/// A LOAD_REGISTER_IMM used for qword counter compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableLoadRegisterImm {
    offset: usize,
    saved: Option<[u8; LOAD_REGISTER_IMM_SIZE]>,
}

impl MutableLoadRegisterImm {
    pub fn new(offset: usize) -> Self {
        Self {
            offset,
            saved: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_nooped(&self) -> bool {
        self.saved.is_some()
    }

    pub fn saved(&self) -> Option<&[u8; LOAD_REGISTER_IMM_SIZE]> {
        self.saved.as_ref()
    }

    pub fn set_value(&self, c: &mut CommandContainer, value: u32) -> Result<()> {
        let addr = c.cs.address_of(self.offset + LOAD_REGISTER_IMM_VALUE_OFFSET);
        c.memory.write_u32(addr, value)
    }

    pub fn noop(&mut self, c: &mut CommandContainer) -> Result<()> {
        let addr = c.cs.address_of(self.offset);
        if self.saved.is_none() {
            let mut saved = [0u8; LOAD_REGISTER_IMM_SIZE];
            saved.copy_from_slice(c.memory.read(addr, LOAD_REGISTER_IMM_SIZE)?);
            self.saved = Some(saved);
        }
        c.memory.write(addr, &[0u8; LOAD_REGISTER_IMM_SIZE])
    }

    pub fn restore(&mut self, c: &mut CommandContainer) -> Result<()> {
        match self.saved.take() {
            Some(saved) => {
                let addr = c.cs.address_of(self.offset);
                c.memory.write(addr, &saved)
            }
            None => Ok(()),
        }
    }
}

/// A STORE_DATA_IMM that signals an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutableStoreDataImm {
    offset: usize,
}

impl MutableStoreDataImm {
    pub fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_address(&self, c: &mut CommandContainer, address: GpuAddress) -> Result<()> {
        let addr = c.cs.address_of(self.offset + STORE_DATA_IMM_ADDRESS_OFFSET);
        c.memory.write_u64(addr, address)
    }
}
