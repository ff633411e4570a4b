//! The mutable command list: owns the heaps, variables, labels and
//! dispatch bindings, records commands and routes mutations into the
//! patch engine.

mod launch;
mod temp_mem;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::commands::{
    encode_load_register_imm, encode_semaphore_wait, encode_state_base_address, encode_store_data_imm,
    state_base_address_field, MutableLoadRegisterImm, MutableSemaphoreWait, MutableStoreDataImm,
    BATCH_BUFFER_START_ADDRESS_OFFSET, COMPARE_EQUAL, COMPARE_GREATER_OR_EQUAL,
    COMPARE_REGISTER_GREATER_OR_EQUAL, EVENT_SIGNALED, GPR0_HIGH, GPR0_LOW,
};
use crate::config::CommandListConfig;
use crate::dispatch::DispatchBinding;
use crate::error::{MclError, Result};
use crate::event::{Event, InOrderCounter};
use crate::kernel::{AddressSpace, ArgDescriptor, Kernel, KernelDescriptor};
use crate::label::{JumpCondition, Label, LabelId};
use crate::memory::{AllocationKind, Allocator, CommandContainer, HeapKind, ResidencyContainer};
use crate::variable::patch::commit_variables;
use crate::variable::{set_value, ArgValue, PatchContext, VarId, Variable, VariableState, VariableType};
use crate::walker::MutableComputeWalker;

pub use launch::LaunchParams;

/// A kernel whose ISA lives in the instruction heap.
#[derive(Debug, Clone)]
pub struct KernelRecord {
    pub descriptor: Arc<KernelDescriptor>,
    pub isa_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// A STATE_BASE_ADDRESS field.
    BaseAddress,
    /// Any other 64-bit address into one of the list's own heaps.
    Address64,
}

/// A command-stream qword holding a GPU address inside one of our heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressFixup {
    pub kind: FixupKind,
    pub cs_offset: usize,
    pub heap: HeapKind,
}

/// Heaps whose bases STATE_BASE_ADDRESS programs, in field order.
pub const BASE_ADDRESS_HEAPS: [HeapKind; 4] = [
    HeapKind::Constants,
    HeapKind::Instruction,
    HeapKind::IndirectObject,
    HeapKind::SurfaceState,
];

pub struct CommandList {
    config: CommandListConfig,
    allocator: Arc<dyn Allocator>,
    container: CommandContainer,
    variables: Vec<Variable>,
    names: HashMap<String, VarId>,
    labels: Vec<Label>,
    label_names: HashMap<String, LabelId>,
    dispatches: Vec<DispatchBinding>,
    kernels: Vec<KernelRecord>,
    fixups: Vec<AddressFixup>,
    residency: ResidencyContainer,
    commit_list: Vec<VarId>,
    in_order: InOrderCounter,
    temp_element_count: usize,
    closed: bool,
    binary: Option<Vec<u8>>,
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("variables", &self.variables.len())
            .field("labels", &self.labels.len())
            .field("dispatches", &self.dispatches.len())
            .field("cs_used", &self.container.cs.used())
            .field("closed", &self.closed)
            .finish()
    }
}

impl CommandList {
    // -- Construction -------------------------------------------------------

    /// Allocate the heaps and emit the state-base-address preamble.
    pub fn new(config: CommandListConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;
        let container = CommandContainer::allocate(
            allocator.as_ref(),
            config.command_stream_size,
            config.instruction_heap_size,
            config.indirect_heap_size,
            config.surface_state_heap_size,
            config.constants_heap_size,
        )?;
        let mut list = Self::from_parts(config, allocator, container, Parts::default())?;

        let bases = BASE_ADDRESS_HEAPS.map(|h| list.container.heap(h).gpu_base());
        let offset = list
            .container
            .append(HeapKind::CommandStream, &encode_state_base_address(bases))?;
        for (i, heap) in BASE_ADDRESS_HEAPS.iter().enumerate() {
            list.fixups.push(AddressFixup {
                kind: FixupKind::BaseAddress,
                cs_offset: offset + state_base_address_field(i),
                heap: *heap,
            });
        }
        info!(
            cs = list.config.command_stream_size,
            ioh = list.config.indirect_heap_size,
            "command list created"
        );
        Ok(list)
    }

    /// Assemble a list from already-populated state (used by the decoder).
    pub(crate) fn from_parts(
        config: CommandListConfig,
        allocator: Arc<dyn Allocator>,
        container: CommandContainer,
        parts: Parts,
    ) -> Result<Self> {
        let counter = allocator.allocate(AllocationKind::DeviceCounter, 8)?;
        let mut residency = ResidencyContainer::new();
        for a in container.heap_allocations() {
            residency.add(a);
        }
        residency.add(counter);

        let names = parts
            .variables
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.name().map(|n| (n.to_string(), VarId(i as u32))))
            .collect();
        let label_names = parts
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.name().map(|n| (n.to_string(), LabelId(i as u32))))
            .collect();
        let in_order = InOrderCounter {
            allocation: Some(counter),
            qword: config.qword_in_order_counter,
        };
        Ok(Self {
            config,
            allocator,
            container,
            variables: parts.variables,
            names,
            labels: parts.labels,
            label_names,
            dispatches: parts.dispatches,
            kernels: parts.kernels,
            fixups: parts.fixups,
            residency,
            commit_list: Vec::new(),
            in_order,
            temp_element_count: 0,
            closed: parts.closed,
            binary: None,
        })
    }

    /// Rebuild a command list from a container produced by
    /// [`Self::get_native_binary`].
    pub fn load_from_binary(
        bytes: &[u8],
        config: CommandListConfig,
        allocator: Arc<dyn Allocator>,
    ) -> Result<Self> {
        crate::program::decoder::decode(bytes, config, allocator)
    }

    /// The portable container of this list. Encoded once and cached until
    /// the list changes.
    pub fn get_native_binary(&mut self) -> Result<&[u8]> {
        let bytes = match self.binary.take() {
            Some(b) => b,
            None => crate::program::encoder::encode(self)?,
        };
        Ok(self.binary.insert(bytes).as_slice())
    }

    // -- Accessors ----------------------------------------------------------

    pub fn config(&self) -> &CommandListConfig {
        &self.config
    }

    pub fn container(&self) -> &CommandContainer {
        &self.container
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, id: VarId) -> Result<&Variable> {
        self.variables
            .get(id.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown variable {}", id.0)))
    }

    pub fn find_variable(&self, name: &str) -> Option<VarId> {
        self.names.get(name).copied()
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn label(&self, id: LabelId) -> Result<&Label> {
        self.labels
            .get(id.0 as usize)
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown label {}", id.0)))
    }

    pub fn dispatches(&self) -> &[DispatchBinding] {
        &self.dispatches
    }

    pub fn kernels(&self) -> &[KernelRecord] {
        &self.kernels
    }

    pub fn fixups(&self) -> &[AddressFixup] {
        &self.fixups
    }

    pub fn residency(&self) -> &ResidencyContainer {
        &self.residency
    }

    pub fn in_order_counter(&self) -> &InOrderCounter {
        &self.in_order
    }

    /// Variables with staged changes waiting for [`Self::commit_variables`].
    pub fn pending_commits(&self) -> &[VarId] {
        &self.commit_list
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// End recording. Variables stay mutable.
    pub fn close(&mut self) {
        self.closed = true;
        self.binary = None;
        debug!(cs_used = self.container.cs.used(), "command list closed");
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.closed {
            return Err(MclError::InvalidArgument("command list is closed".into()));
        }
        Ok(())
    }

    fn var_mut(&mut self, id: VarId) -> Result<&mut Variable> {
        self.variables
            .get_mut(id.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown variable {}", id.0)))
    }

    fn patch_context(&mut self) -> (&mut Vec<Variable>, PatchContext<'_>) {
        let ctx = PatchContext {
            container: &mut self.container,
            residency: &mut self.residency,
            allocator: self.allocator.as_ref(),
            dispatches: &mut self.dispatches,
            commit_list: &mut self.commit_list,
            in_order: &self.in_order,
            slm_granularity: self.config.slm_granularity,
        };
        (&mut self.variables, ctx)
    }

    // -- Variables ----------------------------------------------------------

    /// Look up a variable by name, creating it in the declared state.
    pub fn get_variable(&mut self, name: &str) -> Result<VarId> {
        if name.is_empty() {
            return Err(MclError::InvalidArgument("variable name is empty".into()));
        }
        if let Some(id) = self.names.get(name) {
            return Ok(*id);
        }
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable::new(Some(name.to_string())));
        self.names.insert(name.to_string(), id);
        self.binary = None;
        debug!(name, id = id.0, "variable declared");
        Ok(id)
    }

    /// Route kernel argument `index` through variable `var`.
    pub fn set_kernel_arg_variable(&mut self, kernel: &mut Kernel, index: usize, var: VarId) -> Result<()> {
        let ty = match kernel.descriptor().argument_at(index)? {
            ArgDescriptor::Pointer(p) if p.address_space == AddressSpace::Local => VariableType::SlmBuffer,
            ArgDescriptor::Pointer(_) => VariableType::Buffer,
            ArgDescriptor::Value(_) => VariableType::Value,
        };
        let chunks = self.config.immediate_value_chunks;
        let v = self.var_mut(var)?;
        let fresh = v.state() == VariableState::Declared;
        v.bind_type(ty)?;
        if fresh && ty == VariableType::Value {
            v.flags_mut().immediate_value_chunks = chunks;
        }
        kernel.set_argument_variable(index, var);
        self.binary = None;
        Ok(())
    }

    pub fn set_kernel_group_size_variable(&mut self, kernel: &mut Kernel, var: VarId) -> Result<()> {
        self.var_mut(var)?.bind_type(VariableType::GroupSize)?;
        kernel.set_group_size_variable(var);
        Ok(())
    }

    /// Write a new value into every recorded copy of `var`.
    pub fn set_variable_value(&mut self, var: VarId, size: usize, flags: u32, value: ArgValue<'_>) -> Result<()> {
        self.binary = None;
        let (vars, mut ctx) = self.patch_context();
        set_value(vars, var, size, flags, value, &mut ctx)
    }

    /// Flush staged dispatch changes.
    pub fn commit_variables(&mut self) -> Result<()> {
        self.binary = None;
        let (vars, mut ctx) = self.patch_context();
        commit_variables(vars, &mut ctx)
    }

    // -- Labels and jumps ---------------------------------------------------

    /// Look up a label by name, creating it unset.
    pub fn get_label(&mut self, name: &str) -> Result<LabelId> {
        if name.is_empty() {
            return Err(MclError::InvalidArgument("label name is empty".into()));
        }
        if let Some(id) = self.label_names.get(name) {
            return Ok(*id);
        }
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(Label::new(Some(name.to_string())));
        self.label_names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn create_label(&mut self) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(Label::new(None));
        id
    }

    pub fn set_label(&mut self, id: LabelId, alignment: usize) -> Result<()> {
        self.ensure_recording()?;
        let label = self
            .labels
            .get_mut(id.0 as usize)
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown label {}", id.0)))?;
        let resolved = label.set(&mut self.container, alignment)?;
        for offset in resolved {
            self.fixups.push(AddressFixup {
                kind: FixupKind::Address64,
                cs_offset: offset + BATCH_BUFFER_START_ADDRESS_OFFSET,
                heap: HeapKind::CommandStream,
            });
        }
        self.binary = None;
        Ok(())
    }

    pub fn append_jump(&mut self, id: LabelId, condition: JumpCondition) -> Result<()> {
        self.ensure_recording()?;
        let label = self
            .labels
            .get_mut(id.0 as usize)
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown label {}", id.0)))?;
        let offset = label.append_jump(&mut self.container, condition)?;
        if label.is_set() {
            self.fixups.push(AddressFixup {
                kind: FixupKind::Address64,
                cs_offset: offset + BATCH_BUFFER_START_ADDRESS_OFFSET,
                heap: HeapKind::CommandStream,
            });
        }
        self.binary = None;
        Ok(())
    }

    // -- Events -------------------------------------------------------------

    /// Emit a wait on `event`, optionally tracked by wait-event variable `var`.
    pub fn append_wait_on_event(&mut self, event: &Arc<Event>, var: Option<VarId>) -> Result<()> {
        self.ensure_recording()?;
        let bound = event.is_counter_based() && self.in_order.owns(event);
        if bound && var.is_none() {
            debug!("wait on own counter skipped");
            return Ok(());
        }

        let mut waits = Vec::new();
        let mut loads = Vec::new();
        match event.counter() {
            Some(counter) => {
                let address = event.wait_address();
                if self.in_order.qword {
                    for (register, half) in [
                        (GPR0_LOW, counter.counter_value as u32),
                        (GPR0_HIGH, (counter.counter_value >> 32) as u32),
                    ] {
                        let offset = self
                            .container
                            .append(HeapKind::CommandStream, &encode_load_register_imm(register, half))?;
                        loads.push(MutableLoadRegisterImm::new(offset));
                    }
                    let offset = self.container.append(
                        HeapKind::CommandStream,
                        &encode_semaphore_wait(address, 0, COMPARE_REGISTER_GREATER_OR_EQUAL),
                    )?;
                    waits.push(MutableSemaphoreWait::new(offset));
                } else {
                    let offset = self.container.append(
                        HeapKind::CommandStream,
                        &encode_semaphore_wait(address, counter.counter_value, COMPARE_GREATER_OR_EQUAL),
                    )?;
                    waits.push(MutableSemaphoreWait::new(offset));
                }
            }
            None => {
                let offset = self.container.append(
                    HeapKind::CommandStream,
                    &encode_semaphore_wait(event.gpu_address(), EVENT_SIGNALED, COMPARE_EQUAL),
                )?;
                waits.push(MutableSemaphoreWait::new(offset));
            }
        }
        if bound {
            for w in waits.iter_mut() {
                w.noop(&mut self.container)?;
            }
            for l in loads.iter_mut() {
                l.noop(&mut self.container)?;
            }
        }
        debug!(
            counter_based = event.is_counter_based(),
            bound,
            waits = waits.len(),
            "wait on event"
        );

        match var {
            Some(id) => {
                let v = self.var_mut(id)?;
                v.bind_type(VariableType::WaitEvent)?;
                let first = check_event_binding(v, event)?;
                v.set_as_wait_event(event, waits, loads, bound)?;
                v.set_state(VariableState::Initialized);
                if first {
                    self.add_event_residency(event, bound);
                }
            }
            None => self.add_event_residency(event, bound),
        }
        self.binary = None;
        Ok(())
    }

    /// Emit a standalone signal of `event` (store-data-immediate).
    pub fn append_signal_event(&mut self, event: &Arc<Event>, var: Option<VarId>) -> Result<()> {
        self.ensure_recording()?;
        let data = event.counter().map_or(EVENT_SIGNALED, |c| c.counter_value);
        let offset = self
            .container
            .append(HeapKind::CommandStream, &encode_store_data_imm(event.wait_address(), data))?;
        debug!(offset, "signal event");
        self.attach_signal(var, event, None, Some(MutableStoreDataImm::new(offset)))?;
        self.binary = None;
        Ok(())
    }

    fn attach_signal(
        &mut self,
        var: Option<VarId>,
        event: &Arc<Event>,
        walker: Option<MutableComputeWalker>,
        store: Option<MutableStoreDataImm>,
    ) -> Result<()> {
        match var {
            Some(id) => {
                let v = self.var_mut(id)?;
                v.bind_type(VariableType::SignalEvent)?;
                let first = check_event_binding(v, event)?;
                v.set_as_signal_event(event, walker, store)?;
                v.set_state(VariableState::Initialized);
                if first {
                    self.add_event_residency(event, false);
                }
            }
            None => self.add_event_residency(event, false),
        }
        Ok(())
    }

    fn add_event_residency(&mut self, event: &Event, bound: bool) {
        if let Some(a) = event.allocation() {
            self.residency.add(*a);
        }
        if let (Some(c), false) = (event.counter(), bound) {
            self.residency.add(c.device_counter_allocation);
        }
    }
}

/// A variable keeps one event across every command it covers. Returns
/// whether this is the variable's first event.
fn check_event_binding(var: &Variable, event: &Arc<Event>) -> Result<bool> {
    match var.event().and_then(|e| e.event.as_ref()) {
        None => Ok(true),
        Some(current) if Arc::ptr_eq(current, event) => Ok(false),
        Some(_) => Err(MclError::InvalidArgument(format!(
            "variable {:?} is already bound to another event",
            var.name()
        ))),
    }
}

/// Decoded state handed to [`CommandList::from_parts`].
#[derive(Debug, Default)]
pub(crate) struct Parts {
    pub variables: Vec<Variable>,
    pub labels: Vec<Label>,
    pub dispatches: Vec<DispatchBinding>,
    pub kernels: Vec<KernelRecord>,
    pub fixups: Vec<AddressFixup>,
    pub closed: bool,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commands::{SEMAPHORE_WAIT_ADDRESS_OFFSET, SEMAPHORE_WAIT_SIZE, SEMAPHORE_WAIT_VALUE_OFFSET};
    use crate::event::CounterInfo;
    use crate::memory::{Allocation, AllocationTable};

    pub(crate) fn new_list() -> (CommandList, Arc<AllocationTable>) {
        let table = Arc::new(AllocationTable::new());
        let list = CommandList::new(CommandListConfig::default(), table.clone()).unwrap();
        (list, table)
    }

    pub(crate) fn counter_event(counter: Allocation, value: u64) -> Arc<Event> {
        Arc::new(Event::counter_based(
            None,
            0,
            CounterInfo {
                device_counter_allocation: counter,
                base_device_address: counter.gpu_address,
                allocation_offset: 0,
                counter_value: value,
                external_memory: false,
            },
        ))
    }

    fn cs_u64(list: &CommandList, offset: usize) -> u64 {
        let c = list.container();
        c.memory.read_u64(c.cs.address_of(offset)).unwrap()
    }

    #[test]
    fn test_new_emits_state_base_address() {
        let (list, _) = new_list();
        assert_eq!(list.fixups().len(), 4);
        let ih_field = list.fixups()[1];
        assert_eq!(ih_field.heap, HeapKind::Instruction);
        assert_eq!(cs_u64(&list, ih_field.cs_offset), list.container().ih.gpu_base());
        // heaps plus the in-order counter
        assert_eq!(list.residency().len(), 6);
    }

    #[test]
    fn test_get_variable_is_get_or_create() {
        let (mut list, _) = new_list();
        let a = list.get_variable("a").unwrap();
        assert_eq!(list.get_variable("a").unwrap(), a);
        let b = list.get_variable("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(list.variables().len(), 2);
        assert_eq!(list.variable(a).unwrap().state(), VariableState::Declared);
        assert!(matches!(list.get_variable(""), Err(MclError::InvalidArgument(_))));
    }

    #[test]
    fn test_jump_before_label_and_double_set() {
        let (mut list, _) = new_list();
        let l = list.get_label("loop").unwrap();
        assert_eq!(list.get_label("loop").unwrap(), l);
        list.append_jump(l, JumpCondition::Predicated).unwrap();
        let jump_fixups = list.fixups().len();
        list.set_label(l, 16).unwrap();
        assert_eq!(list.fixups().len(), jump_fixups + 1);

        let address = list.label(l).unwrap().address().unwrap();
        assert_eq!(address % 16, 0);
        let jump = list.fixups().last().copied().unwrap();
        assert_eq!(cs_u64(&list, jump.cs_offset), address);

        let err = list.set_label(l, 0).unwrap_err();
        assert!(matches!(err, MclError::UnsupportedFeature(_)));
        assert_eq!(list.label(l).unwrap().address(), Some(address));
    }

    #[test]
    fn test_recording_after_close_rejected() {
        let (mut list, _) = new_list();
        let l = list.create_label();
        list.close();
        assert!(list.is_closed());
        assert!(list.set_label(l, 0).is_err());
        assert!(list.append_jump(l, JumpCondition::Always).is_err());
    }

    #[test]
    fn test_pool_wait_event_rebinds_address() {
        let (mut list, table) = new_list();
        let pool = table.register_host_range(0x9000_0000, 4096, AllocationKind::Event);
        let other = table.register_host_range(0xA000_0000, 4096, AllocationKind::Event);
        let w = list.get_variable("wait").unwrap();
        let start = list.container().cs.used();
        list.append_wait_on_event(&Arc::new(Event::pool_slot(pool, 0x40)), Some(w)).unwrap();
        assert_eq!(cs_u64(&list, start + SEMAPHORE_WAIT_ADDRESS_OFFSET), pool.gpu_address + 0x40);
        assert_eq!(list.residency().ref_count(&pool), 1);

        list.set_variable_value(w, 8, 0, ArgValue::Event(Some(Arc::new(Event::pool_slot(other, 8)))))
            .unwrap();
        assert_eq!(cs_u64(&list, start + SEMAPHORE_WAIT_ADDRESS_OFFSET), other.gpu_address + 8);
        assert!(!list.residency().contains(&pool));
        assert!(list.residency().contains(&other));
    }

    #[test]
    fn test_counter_wait_on_own_counter_nooped_then_restored() {
        let (mut list, table) = new_list();
        let own = list.in_order_counter().allocation.unwrap();
        let external = table.register_host_range(0xB000_0000, 64, AllocationKind::DeviceCounter);
        let w = list.get_variable("wait").unwrap();
        let start = list.container().cs.used();

        list.append_wait_on_event(&counter_event(own, 3), Some(w)).unwrap();
        let bytes = |list: &CommandList| {
            let c = list.container();
            c.memory.read(c.cs.address_of(start), SEMAPHORE_WAIT_SIZE).unwrap().to_vec()
        };
        assert_eq!(bytes(&list), vec![0u8; SEMAPHORE_WAIT_SIZE]);
        assert!(list.variable(w).unwrap().event().unwrap().noop_state);

        list.set_variable_value(w, 8, 0, ArgValue::Event(Some(counter_event(external, 9))))
            .unwrap();
        assert_ne!(bytes(&list), vec![0u8; SEMAPHORE_WAIT_SIZE]);
        assert_eq!(cs_u64(&list, start + SEMAPHORE_WAIT_ADDRESS_OFFSET), external.gpu_address);
        assert_eq!(cs_u64(&list, start + SEMAPHORE_WAIT_VALUE_OFFSET), 9);
        assert!(list.residency().contains(&external));

        list.set_variable_value(w, 8, 0, ArgValue::Event(Some(counter_event(own, 4))))
            .unwrap();
        assert_eq!(bytes(&list), vec![0u8; SEMAPHORE_WAIT_SIZE]);
        assert!(!list.residency().contains(&external));
    }

    #[test]
    fn test_signal_event_variable_rejects_second_event() {
        let (mut list, table) = new_list();
        let a = table.register_host_range(0x9000_0000, 64, AllocationKind::Event);
        let s = list.get_variable("sig").unwrap();
        let ev = Arc::new(Event::pool_slot(a, 0));
        list.append_signal_event(&ev, Some(s)).unwrap();
        list.append_signal_event(&ev, Some(s)).unwrap();
        assert_eq!(list.residency().ref_count(&a), 1);
        assert_eq!(list.variable(s).unwrap().event().unwrap().store_data_imms.len(), 2);
        let other = Arc::new(Event::pool_slot(a, 8));
        assert!(list.append_signal_event(&other, Some(s)).is_err());
    }
}
