//! Mutable variables: named slots whose every physical copy in the
//! recorded command list can be rewritten after recording.

pub mod patch;
pub mod slm;
pub mod usage;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commands::{MutableLoadRegisterImm, MutableSemaphoreWait, MutableStoreDataImm, SURFACE_STATE_SIZE};
use crate::dispatch::{DispatchId, IndirectData};
use crate::error::{MclError, Result};
use crate::event::Event;
use crate::kernel::{AddressSpace, ArgDescriptor};
use crate::memory::{Allocation, CommandContainer, GpuAddress};
use crate::walker::MutableComputeWalker;

pub use patch::{set_value, ArgValue, PatchContext, SET_VALUE_STAGE_COMMIT};
pub use usage::{ImmediateValueChunk, PatchSite, UsageSite, Usages};

/// Index of a variable inside its command list's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableType {
    None,
    Buffer,
    Value,
    GroupSize,
    GroupCount,
    SignalEvent,
    WaitEvent,
    GlobalOffset,
    SlmBuffer,
}

impl VariableType {
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Buffer => 1,
            Self::Value => 2,
            Self::GroupSize => 3,
            Self::GroupCount => 4,
            Self::SignalEvent => 5,
            Self::WaitEvent => 6,
            Self::GlobalOffset => 7,
            Self::SlmBuffer => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::None,
            1 => Self::Buffer,
            2 => Self::Value,
            3 => Self::GroupSize,
            4 => Self::GroupCount,
            5 => Self::SignalEvent,
            6 => Self::WaitEvent,
            7 => Self::GlobalOffset,
            8 => Self::SlmBuffer,
            _ => return None,
        })
    }

    pub fn is_dispatch_property(self) -> bool {
        matches!(self, Self::GroupSize | Self::GroupCount | Self::GlobalOffset)
    }

    /// Size a freshly defined variable of this type starts with.
    pub fn default_size(self) -> usize {
        if self.is_dispatch_property() {
            3 * std::mem::size_of::<u32>()
        } else {
            std::mem::size_of::<u64>()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VariableState {
    Declared,
    Defined,
    Initialized,
}

impl VariableState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Declared),
            1 => Some(Self::Defined),
            2 => Some(Self::Initialized),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableFlags {
    pub temporary: bool,
    pub scalable: bool,
    pub stage_commit: bool,
    pub immediate_value_chunks: bool,
}

impl VariableFlags {
    pub fn bits(&self) -> u8 {
        (self.temporary as u8)
            | (self.scalable as u8) << 1
            | (self.stage_commit as u8) << 2
            | (self.immediate_value_chunks as u8) << 3
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            temporary: bits & 1 != 0,
            scalable: bits & 2 != 0,
            stage_commit: bits & 4 != 0,
            immediate_value_chunks: bits & 8 != 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferValue {
    pub gpu_address: GpuAddress,
    pub allocation: Option<Allocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueState {
    pub chunks: Vec<ImmediateValueChunk>,
    /// Last payload written.
    pub last: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlmValue {
    pub size: u32,
    pub offset: u32,
    pub alignment: u32,
    pub next: Option<VarId>,
}

#[derive(Debug, Clone, Default)]
pub struct EventValue {
    pub event: Option<Arc<Event>>,
    pub allocation: Option<Allocation>,
    pub counter_based: bool,
    /// The wait commands are currently NOOPs.
    pub noop_state: bool,
    /// The event waits on this command list's own counter.
    pub bound_to_list: bool,
    pub counter_allocation: Option<Allocation>,
    pub semaphore_waits: Vec<MutableSemaphoreWait>,
    pub load_register_imms: Vec<MutableLoadRegisterImm>,
    pub store_data_imms: Vec<MutableStoreDataImm>,
    pub walkers: Vec<MutableComputeWalker>,
}

/// Kind-specific state of a variable.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    None,
    Buffer(BufferValue),
    Value(ValueState),
    Dims([u32; 3]),
    Event(EventValue),
    Slm(SlmValue),
}

#[derive(Debug, Clone)]
pub struct Variable {
    name: Option<String>,
    ty: VariableType,
    state: VariableState,
    size: usize,
    flags: VariableFlags,
    temp_size: usize,
    usages: Usages,
    payload: Payload,
    used_in_dispatch: Vec<DispatchId>,
    commit_required: bool,
}

impl Variable {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            ty: VariableType::None,
            state: VariableState::Declared,
            size: 0,
            flags: VariableFlags::default(),
            temp_size: 0,
            usages: Usages::default(),
            payload: Payload::None,
            used_in_dispatch: Vec::new(),
            commit_required: false,
        }
    }

    /// Anonymous buffer variable whose address comes from temporary memory.
    pub fn new_temporary(size: usize, scalable: bool) -> Self {
        let mut var = Self::new(None);
        var.ty = VariableType::Buffer;
        var.state = VariableState::Defined;
        var.size = VariableType::Buffer.default_size();
        var.payload = Payload::Buffer(BufferValue::default());
        var.flags.temporary = true;
        var.flags.scalable = scalable;
        var.temp_size = size;
        var
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn var_type(&self) -> VariableType {
        self.ty
    }

    pub fn state(&self) -> VariableState {
        self.state
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> VariableFlags {
        self.flags
    }

    /// Bytes of temporary memory the variable needs per element.
    pub fn temp_size(&self) -> usize {
        self.temp_size
    }

    pub fn usages(&self) -> &Usages {
        &self.usages
    }

    pub fn usages_mut(&mut self) -> &mut Usages {
        &mut self.usages
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn used_in_dispatch(&self) -> &[DispatchId] {
        &self.used_in_dispatch
    }

    pub fn commit_required(&self) -> bool {
        self.commit_required
    }

    pub(crate) fn set_commit_required(&mut self, v: bool) {
        self.commit_required = v;
    }

    pub(crate) fn set_state(&mut self, state: VariableState) {
        self.state = state;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn flags_mut(&mut self) -> &mut VariableFlags {
        &mut self.flags
    }

    pub fn is_type(&self, ty: VariableType) -> bool {
        self.ty == ty
    }

    /// Assign the variable's type. A type is fixed forever once defined;
    /// binding the same type again is accepted.
    pub fn bind_type(&mut self, ty: VariableType) -> Result<()> {
        if self.state == VariableState::Declared {
            self.ty = ty;
            self.state = VariableState::Defined;
            self.size = ty.default_size();
            self.payload = match ty {
                VariableType::None => Payload::None,
                VariableType::Buffer => Payload::Buffer(BufferValue::default()),
                VariableType::Value => Payload::Value(ValueState::default()),
                VariableType::GroupSize | VariableType::GroupCount | VariableType::GlobalOffset => {
                    Payload::Dims([0; 3])
                }
                VariableType::SignalEvent | VariableType::WaitEvent => {
                    Payload::Event(EventValue::default())
                }
                VariableType::SlmBuffer => Payload::Slm(SlmValue::default()),
            };
            debug!(name = ?self.name, ?ty, "variable defined");
            return Ok(());
        }
        if self.ty != ty {
            return Err(MclError::InvalidArgument(format!(
                "variable {:?} is {:?}, cannot bind as {:?}",
                self.name, self.ty, ty
            )));
        }
        Ok(())
    }

    pub fn add_dispatch(&mut self, id: DispatchId) {
        if !self.used_in_dispatch.contains(&id) {
            self.used_in_dispatch.push(id);
        }
    }

    pub(crate) fn set_dims(&mut self, dims: [u32; 3]) {
        self.payload = Payload::Dims(dims);
    }

    pub fn dims(&self) -> Option<[u32; 3]> {
        match self.payload {
            Payload::Dims(d) => Some(d),
            _ => None,
        }
    }

    pub fn slm(&self) -> Option<&SlmValue> {
        match &self.payload {
            Payload::Slm(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn slm_mut(&mut self) -> Option<&mut SlmValue> {
        match &mut self.payload {
            Payload::Slm(s) => Some(s),
            _ => None,
        }
    }

    pub fn buffer(&self) -> Option<&BufferValue> {
        match &self.payload {
            Payload::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn event(&self) -> Option<&EventValue> {
        match &self.payload {
            Payload::Event(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn event_mut(&mut self) -> Option<&mut EventValue> {
        match &mut self.payload {
            Payload::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&ValueState> {
        match &self.payload {
            Payload::Value(v) => Some(v),
            _ => None,
        }
    }

    fn expect_defined(&self) -> Result<()> {
        if self.state == VariableState::Declared {
            return Err(MclError::InvalidArgument(format!(
                "variable {:?} has no type yet",
                self.name
            )));
        }
        Ok(())
    }

    /// Record the sites a kernel argument occupies in one dispatch.
    ///
    /// `ssh_offset` is the surface-state-heap offset of the dispatch's
    /// binding table; `slm` is the `(size, offset)` assigned to an SLM
    /// argument at launch.
    pub fn add_kernel_arg_usage(
        &mut self,
        arg: &ArgDescriptor,
        indirect: &IndirectData,
        c: &CommandContainer,
        ssh_offset: usize,
        slm: Option<(u32, u32)>,
    ) -> Result<()> {
        self.expect_defined()?;
        match (self.ty, arg) {
            (VariableType::Buffer, ArgDescriptor::Pointer(p))
                if p.address_space != AddressSpace::Local =>
            {
                if let Some(stateless) = p.stateless {
                    let placed = indirect.place(c, stateless as usize, 8);
                    debug!(
                        name = ?self.name,
                        stateless,
                        inline = placed.command_buffer.is_some(),
                        "captured buffer usage"
                    );
                    self.usages.command_buffer.extend(placed.command_buffer);
                    self.usages.indirect.extend(placed.indirect);
                }
                if let Some(bindful) = p.bindful {
                    let offset = ssh_offset + bindful as usize;
                    let site = PatchSite::Bound(c.ssh.address_of(offset));
                    self.usages
                        .surface_state
                        .push(UsageSite::new(site, SURFACE_STATE_SIZE));
                    debug!(name = ?self.name, offset, "captured surface state usage");
                }
                self.size = std::mem::size_of::<u64>();
                Ok(())
            }
            (VariableType::Value, ArgDescriptor::Value(v)) => {
                let chunked = self.flags.immediate_value_chunks;
                let Payload::Value(state) = &mut self.payload else {
                    return Err(MclError::InvalidArgument("value variable without value state".into()));
                };
                if chunked {
                    for e in &v.elements {
                        let placed = indirect.place(c, e.offset as usize, e.size as usize);
                        let chunk = ImmediateValueChunk {
                            source_offset: e.source_offset as usize,
                            size: e.size as usize,
                            heap_usage: placed.indirect.map(|_| self.usages.indirect.len()),
                            cmd_buffer_usage: placed
                                .command_buffer
                                .map(|_| self.usages.command_buffer.len()),
                        };
                        debug!(
                            name = ?self.name,
                            source_offset = e.source_offset,
                            size = e.size,
                            start = e.offset,
                            "captured value chunk"
                        );
                        self.usages.command_buffer.extend(placed.command_buffer);
                        self.usages.indirect.extend(placed.indirect);
                        state.chunks.push(chunk);
                    }
                } else {
                    let extent = v.extent();
                    let start = v
                        .elements
                        .iter()
                        .map(|e| e.offset as usize - (e.source_offset as usize).min(e.offset as usize))
                        .min()
                        .unwrap_or(0);
                    let placed = indirect.place(c, start, extent);
                    debug!(name = ?self.name, start, extent, "captured continuous value");
                    self.usages.command_buffer.extend(placed.command_buffer);
                    self.usages.indirect.extend(placed.indirect);
                }
                self.size = self.size.max(v.extent());
                Ok(())
            }
            (VariableType::SlmBuffer, ArgDescriptor::Pointer(p))
                if p.address_space == AddressSpace::Local =>
            {
                let (size, offset) = slm.unwrap_or((0, 0));
                if let Some(slm_offset) = p.slm_offset {
                    let placed = indirect.place(c, slm_offset as usize, 4);
                    debug!(name = ?self.name, slm_offset, "captured slm usage");
                    self.usages.command_buffer.extend(placed.command_buffer);
                    self.usages.indirect.extend(placed.indirect);
                }
                if let Payload::Slm(s) = &mut self.payload {
                    s.size = size;
                    s.offset = offset;
                    s.alignment = p.required_slm_alignment;
                }
                Ok(())
            }
            (ty, _) => Err(MclError::InvalidArgument(format!(
                "variable {:?} of type {:?} does not match kernel argument",
                self.name, ty
            ))),
        }
    }

    /// Attach a signal event and the commands that reference it.
    pub fn set_as_signal_event(
        &mut self,
        event: &Arc<Event>,
        walker: Option<MutableComputeWalker>,
        store: Option<MutableStoreDataImm>,
    ) -> Result<()> {
        if !self.is_type(VariableType::SignalEvent) {
            return Err(MclError::InvalidArgument(format!(
                "variable {:?} is not a signal event",
                self.name
            )));
        }
        let ev = self
            .event_mut()
            .ok_or_else(|| MclError::InvalidArgument("signal event without event state".into()))?;
        ev.event = Some(Arc::clone(event));
        ev.allocation = event.allocation().copied();
        ev.counter_based = event.is_counter_based();
        ev.walkers.extend(walker);
        ev.store_data_imms.extend(store);
        Ok(())
    }

    /// Attach a wait event and the commands that poll it.
    pub fn set_as_wait_event(
        &mut self,
        event: &Arc<Event>,
        waits: Vec<MutableSemaphoreWait>,
        loads: Vec<MutableLoadRegisterImm>,
        bound_to_list: bool,
    ) -> Result<()> {
        if !self.is_type(VariableType::WaitEvent) {
            return Err(MclError::InvalidArgument(format!(
                "variable {:?} is not a wait event",
                self.name
            )));
        }
        let ev = self
            .event_mut()
            .ok_or_else(|| MclError::InvalidArgument("wait event without event state".into()))?;
        ev.event = Some(Arc::clone(event));
        ev.allocation = event.allocation().copied();
        ev.counter_based = event.is_counter_based();
        ev.bound_to_list = bound_to_list;
        ev.noop_state = bound_to_list;
        ev.counter_allocation = if bound_to_list {
            None
        } else {
            event.counter().map(|c| c.device_counter_allocation)
        };
        ev.semaphore_waits.extend(waits);
        ev.load_register_imms.extend(loads);
        Ok(())
    }

    /// Restore state from a serialized container.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        name: Option<String>,
        ty: VariableType,
        state: VariableState,
        size: usize,
        flags: VariableFlags,
        temp_size: usize,
        usages: Usages,
        payload: Payload,
    ) -> Self {
        Self {
            name,
            ty,
            state,
            size,
            flags,
            temp_size,
            usages,
            payload,
            used_in_dispatch: Vec::new(),
            commit_required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_type_declared_to_defined() {
        let mut v = Variable::new(Some("gs".into()));
        assert_eq!(v.state(), VariableState::Declared);
        v.bind_type(VariableType::GroupSize).unwrap();
        assert_eq!(v.state(), VariableState::Defined);
        assert_eq!(v.size(), 12);
        assert_eq!(v.dims(), Some([0, 0, 0]));

        let mut b = Variable::new(Some("buf".into()));
        b.bind_type(VariableType::Buffer).unwrap();
        assert_eq!(b.size(), 8);
    }

    #[test]
    fn test_bind_type_mismatch_rejected() {
        let mut v = Variable::new(Some("x".into()));
        v.bind_type(VariableType::Value).unwrap();
        assert!(matches!(
            v.bind_type(VariableType::Buffer),
            Err(MclError::InvalidArgument(_))
        ));
        v.bind_type(VariableType::Value).unwrap();
        assert_eq!(v.var_type(), VariableType::Value);
    }

    #[test]
    fn test_bind_type_after_initialized_keeps_type() {
        let mut v = Variable::new(Some("x".into()));
        v.bind_type(VariableType::GroupCount).unwrap();
        v.set_state(VariableState::Initialized);
        v.bind_type(VariableType::GroupCount).unwrap();
        assert_eq!(v.state(), VariableState::Initialized);
        assert!(v.bind_type(VariableType::GroupSize).is_err());
    }

    #[test]
    fn test_temporary_variable_shape() {
        let v = Variable::new_temporary(256, true);
        assert!(v.flags().temporary);
        assert!(v.flags().scalable);
        assert_eq!(v.var_type(), VariableType::Buffer);
        assert_eq!(v.temp_size(), 256);
        assert!(v.name().is_none());
    }

    #[test]
    fn test_flag_bits_roundtrip() {
        let f = VariableFlags {
            temporary: false,
            scalable: true,
            stage_commit: true,
            immediate_value_chunks: false,
        };
        assert_eq!(VariableFlags::from_bits(f.bits()), f);
        assert_eq!(VariableType::from_code(VariableType::SlmBuffer.code()), Some(VariableType::SlmBuffer));
        assert_eq!(VariableType::from_code(42), None);
    }

    #[test]
    fn test_wrong_event_kind_rejected() {
        use crate::memory::{AllocationId, AllocationKind};
        let alloc = Allocation {
            id: AllocationId(1),
            kind: AllocationKind::Event,
            gpu_address: 0x1000,
            size: 64,
        };
        let event = Arc::new(Event::pool_slot(alloc, 0));
        let mut v = Variable::new(Some("ev".into()));
        v.bind_type(VariableType::WaitEvent).unwrap();
        assert!(v.set_as_signal_event(&event, None, None).is_err());
        v.set_as_wait_event(&event, vec![MutableSemaphoreWait::new(0)], Vec::new(), false)
            .unwrap();
        assert_eq!(v.event().unwrap().semaphore_waits.len(), 1);
    }
}
