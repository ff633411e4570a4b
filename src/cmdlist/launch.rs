//! Recording kernel launches.

use std::sync::Arc;

use tracing::{debug, info};

use super::{AddressFixup, CommandList, FixupKind, KernelRecord};
use crate::commands::{encode_surface_state, EVENT_SIGNALED, SURFACE_STATE_SIZE};
use crate::dispatch::{check_dispatch_sizes, DispatchBinding, DispatchId, DispatchVariables, IndirectData};
use crate::error::{MclError, Result};
use crate::event::Event;
use crate::kernel::{AddressSpace, ArgDescriptor, Kernel, KernelDescriptor, PointerArg, ValueArg};
use crate::memory::{GpuAddress, HeapKind};
use crate::variable::slm::{align_slm, assign_chain, slm_end};
use crate::variable::{Payload, VarId, VariableState, VariableType};
use crate::walker::MutableComputeWalker;

/// Per-launch parameters of [`CommandList::append_launch_kernel`].
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub group_count: [u32; 3],
    pub global_offset: [u32; 3],
    pub group_count_variable: Option<VarId>,
    pub global_offset_variable: Option<VarId>,
    /// Event the walker's post-sync signals.
    pub signal_event: Option<Arc<Event>>,
    pub signal_event_variable: Option<VarId>,
}

impl LaunchParams {
    pub fn new(group_count: [u32; 3]) -> Self {
        Self {
            group_count,
            ..Default::default()
        }
    }
}

impl CommandList {
    /// Record one dispatch of `kernel`, capturing a usage for every
    /// argument routed through a variable.
    pub fn append_launch_kernel(&mut self, kernel: &Kernel, params: &LaunchParams) -> Result<DispatchId> {
        self.ensure_recording()?;
        let desc = Arc::clone(kernel.descriptor());
        desc.validate()?;
        let id = DispatchId(self.dispatches.len() as u32);
        let (slm_args_size, last_slm, static_slm) = self.layout_slm(kernel)?;

        let group_size_var = kernel.group_size_variable();
        let group_size = self.dispatch_dims(group_size_var, VariableType::GroupSize, kernel.group_size())?;
        let group_count = self.dispatch_dims(
            params.group_count_variable,
            VariableType::GroupCount,
            params.group_count,
        )?;
        let global_offset = self.dispatch_dims(
            params.global_offset_variable,
            VariableType::GlobalOffset,
            params.global_offset,
        )?;
        check_dispatch_sizes(&desc, group_size, group_count, slm_args_size)?;
        let isa_address = self.ensure_isa(&desc)?;

        let layout = self.config.walker;
        let walker_offset = self
            .container
            .append(HeapKind::CommandStream, &vec![0u8; layout.size])?;
        let walker = MutableComputeWalker::new(walker_offset, layout);

        let (inline_offset, inline_size) = if desc.pass_inline_data {
            (Some(walker.inline_data_offset()), layout.inline_data_size)
        } else {
            (None, 0)
        };
        let heap_ctd = desc
            .cross_thread_data_size
            .saturating_sub(inline_size.min(desc.cross_thread_data_size));
        let per_thread_capacity = if desc.num_local_id_channels > 0 {
            self.config.per_thread_reservation
        } else {
            0
        };
        let ioh = self.container.heap_mut(HeapKind::IndirectObject);
        ioh.align_to(self.config.ioh_alignment)?;
        let heap_offset = ioh.get_space(heap_ctd + per_thread_capacity)?;
        let indirect = IndirectData::new(
            inline_offset,
            inline_size,
            heap_offset,
            desc.cross_thread_data_size,
            per_thread_capacity,
        );
        let binding_table = self.reserve_binding_table(&desc)?;
        debug!(
            kernel = %desc.name,
            walker = walker_offset,
            ioh = heap_offset,
            inline = indirect.inline_size(),
            "launch layout"
        );

        let ssh_base = binding_table.unwrap_or(0);
        for (index, arg) in desc.args.iter().enumerate() {
            match kernel.argument_variable(index) {
                Some(var) => self.capture_variable_arg(var, arg, &indirect, ssh_base)?,
                None => {
                    let slm_offset = static_slm.iter().find(|(i, _)| *i == index).map(|(_, o)| *o);
                    self.write_static_arg(kernel, index, arg, &indirect, ssh_base, slm_offset)?;
                }
            }
        }

        let vars = DispatchVariables {
            group_size: group_size_var,
            group_count: params.group_count_variable,
            global_offset: params.global_offset_variable,
            last_slm,
        };
        let mut binding = DispatchBinding::new(
            Arc::clone(&desc),
            walker,
            indirect,
            isa_address,
            self.config.grf_size,
            vars,
            group_size,
            group_count,
            global_offset,
            slm_args_size,
        )?;
        binding.program(&mut self.container)?;
        if let Some(offset) = binding_table {
            walker.set_binding_table_offset(&mut self.container, offset as u32)?;
        }
        for heap_field in [
            (layout.indirect_data_start, HeapKind::IndirectObject),
            (layout.kernel_start, HeapKind::Instruction),
        ] {
            self.fixups.push(AddressFixup {
                kind: FixupKind::Address64,
                cs_offset: walker.field_offset(heap_field.0),
                heap: heap_field.1,
            });
        }
        for v in [group_size_var, params.group_count_variable, params.global_offset_variable, last_slm]
            .into_iter()
            .flatten()
        {
            self.var_mut(v)?.add_dispatch(id);
        }
        self.dispatches.push(binding);

        if let Some(event) = &params.signal_event {
            if event.allocation().is_some() || event.is_counter_based() {
                let immediate = event.counter().map_or(EVENT_SIGNALED, |c| c.counter_value);
                walker.set_post_sync(&mut self.container, event.wait_address(), immediate)?;
            }
            self.attach_signal(params.signal_event_variable, event, Some(walker), None)?;
        }

        self.binary = None;
        info!(
            kernel = %desc.name,
            dispatch = id.0,
            ?group_size,
            ?group_count,
            slm = slm_args_size,
            "kernel launch recorded"
        );
        Ok(id)
    }

    /// Copy the kernel's ISA into the instruction heap once per kernel.
    fn ensure_isa(&mut self, desc: &Arc<KernelDescriptor>) -> Result<GpuAddress> {
        if let Some(k) = self.kernels.iter().find(|k| k.descriptor == *desc) {
            return Ok(self.container.ih.gpu_address_of(k.isa_offset));
        }
        self.container.ih.align_to(self.config.isa_alignment)?;
        let isa_offset = self.container.append(HeapKind::Instruction, &desc.isa)?;
        debug!(kernel = %desc.name, isa_offset, len = desc.isa.len(), "kernel isa");
        self.kernels.push(KernelRecord {
            descriptor: Arc::clone(desc),
            isa_offset,
        });
        Ok(self.container.ih.gpu_address_of(isa_offset))
    }

    fn reserve_binding_table(&mut self, desc: &KernelDescriptor) -> Result<Option<usize>> {
        let extent = desc
            .args
            .iter()
            .filter_map(|a| match a {
                ArgDescriptor::Pointer(p) => p.bindful,
                ArgDescriptor::Value(_) => None,
            })
            .map(|o| o as usize + SURFACE_STATE_SIZE)
            .max();
        let Some(extent) = extent else {
            return Ok(None);
        };
        let ssh = self.container.heap_mut(HeapKind::SurfaceState);
        ssh.align_to(self.config.binding_table_alignment)?;
        Ok(Some(ssh.get_space(extent)?))
    }

    /// Place the kernel's SLM arguments. Fixed-size arguments come first;
    /// variable-sized ones follow as a chain. Returns the aligned footprint,
    /// the chain's tail, and the offsets of the fixed arguments.
    fn layout_slm(&mut self, kernel: &Kernel) -> Result<(u32, Option<VarId>, Vec<(usize, u32)>)> {
        let granularity = self.config.slm_granularity;
        let mut chain: Vec<(VarId, u32)> = Vec::new();
        let mut fixed = Vec::new();
        let mut fixed_end = 0u32;
        for (index, arg) in kernel.descriptor().args.iter().enumerate() {
            let ArgDescriptor::Pointer(p) = arg else {
                continue;
            };
            if p.address_space != AddressSpace::Local {
                continue;
            }
            match kernel.argument_variable(index) {
                Some(var) => {
                    if chain.iter().any(|(v, _)| *v == var) {
                        return Err(MclError::InvalidArgument(format!(
                            "SLM variable {} appears twice in kernel '{}'",
                            var.0,
                            kernel.descriptor().name
                        )));
                    }
                    let v = self.variable(var)?;
                    if !v.usages().is_empty() || !v.used_in_dispatch().is_empty() {
                        return Err(MclError::UnsupportedFeature(format!(
                            "SLM variable {} is already placed in a dispatch",
                            var.0
                        )));
                    }
                    chain.push((var, p.required_slm_alignment));
                }
                None => {
                    let size = kernel.argument_value(index).map_or(Ok(0), le_u32)?;
                    let offset = align_slm(fixed_end, p.required_slm_alignment)?;
                    fixed.push((index, offset));
                    fixed_end = slm_end(offset, size)?;
                }
            }
        }
        let total = if chain.is_empty() {
            align_slm(fixed_end, granularity)?
        } else {
            assign_chain(&mut self.variables, &chain, fixed_end, granularity)?
        };
        Ok((total, chain.last().map(|(v, _)| *v), fixed))
    }

    fn capture_variable_arg(
        &mut self,
        id: VarId,
        arg: &ArgDescriptor,
        indirect: &IndirectData,
        ssh_base: usize,
    ) -> Result<()> {
        let var = self
            .variables
            .get_mut(id.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown variable {}", id.0)))?;
        let slm = var.slm().map(|s| (s.size, s.offset));
        var.add_kernel_arg_usage(arg, indirect, &self.container, ssh_base, slm)?;

        // Bring the new sites up to date with the current value.
        let c = &mut self.container;
        match (arg, var.payload()) {
            (ArgDescriptor::Pointer(p), Payload::Buffer(b)) if b.allocation.is_some() => {
                let remaining = b
                    .allocation
                    .map(|a| a.size - (b.gpu_address - a.gpu_address) as usize);
                write_pointer(c, indirect, p, ssh_base, b.gpu_address, remaining)?;
            }
            (ArgDescriptor::Value(v), Payload::Value(state)) if var.state() == VariableState::Initialized => {
                write_value(c, indirect, v, &state.last)?;
            }
            (ArgDescriptor::Pointer(p), Payload::Slm(s)) => {
                if let Some(o) = p.slm_offset {
                    indirect.write(c, o as usize, &s.offset.to_le_bytes())?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn write_static_arg(
        &mut self,
        kernel: &Kernel,
        index: usize,
        arg: &ArgDescriptor,
        indirect: &IndirectData,
        ssh_base: usize,
        slm_offset: Option<u32>,
    ) -> Result<()> {
        let bytes = kernel.argument_value(index);
        match arg {
            ArgDescriptor::Pointer(p) if p.address_space == AddressSpace::Local => {
                if let (Some(o), Some(offset)) = (p.slm_offset, slm_offset) {
                    indirect.write(&mut self.container, o as usize, &offset.to_le_bytes())?;
                }
            }
            ArgDescriptor::Pointer(p) => {
                let host = bytes.map_or(Ok(0), le_u64)?;
                if host == 0 {
                    return write_pointer(&mut self.container, indirect, p, ssh_base, 0, None);
                }
                let resolved = self.allocator.resolve(host)?;
                let a = resolved.allocation;
                let remaining = a.size - (resolved.device_address - a.gpu_address) as usize;
                write_pointer(
                    &mut self.container,
                    indirect,
                    p,
                    ssh_base,
                    resolved.device_address,
                    Some(remaining),
                )?;
                self.residency.add(a);
            }
            ArgDescriptor::Value(v) => {
                if let Some(b) = bytes {
                    write_value(&mut self.container, indirect, v, b)?;
                }
            }
        }
        Ok(())
    }

    /// Dimensions a dispatch starts with: the variable's value if it has
    /// one, otherwise `recorded`, which then becomes the variable's cache.
    fn dispatch_dims(&mut self, var: Option<VarId>, ty: VariableType, recorded: [u32; 3]) -> Result<[u32; 3]> {
        let Some(id) = var else {
            return Ok(recorded);
        };
        let v = self.var_mut(id)?;
        v.bind_type(ty)?;
        if v.state() == VariableState::Initialized {
            if let Some(d) = v.dims() {
                return Ok(d);
            }
        }
        v.set_dims(recorded);
        Ok(recorded)
    }
}

fn write_pointer(
    c: &mut crate::memory::CommandContainer,
    indirect: &IndirectData,
    p: &PointerArg,
    ssh_base: usize,
    gpu: GpuAddress,
    surface_size: Option<usize>,
) -> Result<()> {
    if let Some(o) = p.stateless {
        indirect.write(c, o as usize, &gpu.to_le_bytes())?;
    }
    if let (Some(o), Some(size)) = (p.bindful, surface_size) {
        let offset = c.ssh.address_of(ssh_base + o as usize);
        c.memory
            .write(offset, &encode_surface_state(gpu, size.min(u32::MAX as usize) as u32))?;
    }
    Ok(())
}

/// Write each element of a by-value argument that `bytes` covers.
fn write_value(c: &mut crate::memory::CommandContainer, indirect: &IndirectData, v: &ValueArg, bytes: &[u8]) -> Result<()> {
    for e in &v.elements {
        let src = e.source_offset as usize;
        if src >= bytes.len() {
            continue;
        }
        let n = (e.size as usize).min(bytes.len() - src);
        indirect.write(c, e.offset as usize, &bytes[src..src + n])?;
    }
    Ok(())
}

fn le_u32(bytes: &[u8]) -> Result<u32> {
    let b: [u8; 4] = bytes
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| MclError::InvalidArgument(format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(u32::from_le_bytes(b))
}

fn le_u64(bytes: &[u8]) -> Result<u64> {
    let b: [u8; 8] = bytes
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| MclError::InvalidArgument(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_le_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdlist::tests::{counter_event, new_list};
    use crate::commands::SURFACE_STATE_ADDRESS_OFFSET;
    use crate::kernel::fixtures::sample_kernel;
    use crate::memory::AllocationKind;
    use crate::variable::{ArgValue, SET_VALUE_STAGE_COMMIT};

    fn ctd_bytes(list: &CommandList, d: DispatchId, ctd: usize, len: usize) -> Vec<u8> {
        let binding = &list.dispatches()[d.index()];
        let ind = binding.indirect();
        let c = list.container();
        (ctd..ctd + len)
            .map(|o| {
                let addr = if o < ind.inline_size() {
                    c.cs.address_of(ind.inline_offset().unwrap() + o)
                } else {
                    c.ioh.address_of(ind.heap_offset() + o - ind.inline_size())
                };
                c.memory.read(addr, 1).unwrap()[0]
            })
            .collect()
    }

    fn ctd_u64(list: &CommandList, d: DispatchId, ctd: usize) -> u64 {
        u64::from_le_bytes(ctd_bytes(list, d, ctd, 8).try_into().unwrap())
    }

    fn ctd_u32(list: &CommandList, d: DispatchId, ctd: usize) -> u32 {
        u32::from_le_bytes(ctd_bytes(list, d, ctd, 4).try_into().unwrap())
    }

    fn walker_u32(list: &CommandList, d: DispatchId, field: usize) -> u32 {
        let w = list.dispatches()[d.index()].walker();
        let c = list.container();
        c.memory.read_u32(c.cs.address_of(w.field_offset(field))).unwrap()
    }

    fn sample() -> Kernel {
        let mut k = Kernel::new(Arc::new(sample_kernel()));
        k.set_group_size([8, 8, 1]).unwrap();
        k
    }

    #[test]
    fn test_buffer_variable_patched_everywhere_with_single_residency() {
        let (mut list, table) = new_list();
        let first = table.register_host_range(0x7000_0000, 4096, AllocationKind::Buffer);
        let second = table.register_host_range(0x8000_0000, 4096, AllocationKind::Buffer);
        let mut k = sample();
        let buf = list.get_variable("buf").unwrap();
        list.set_kernel_arg_variable(&mut k, 0, buf).unwrap();
        let d0 = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        let d1 = list.append_launch_kernel(&k, &LaunchParams::new([2, 1, 1])).unwrap();
        assert_eq!(list.kernels().len(), 1);

        list.set_variable_value(buf, 8, 0, ArgValue::Pointer(Some(0x7000_0010)))
            .unwrap();
        for d in [d0, d1] {
            assert_eq!(ctd_u64(&list, d, 0), first.gpu_address + 0x10);
        }
        let var = list.variable(buf).unwrap();
        assert_eq!(var.usages().surface_state.len(), 2);
        for u in &var.usages().surface_state {
            let c = list.container();
            let addr = c.resolve(HeapKind::SurfaceState, &u.site).add(SURFACE_STATE_ADDRESS_OFFSET);
            assert_eq!(c.memory.read_u64(addr).unwrap(), first.gpu_address + 0x10);
        }
        assert_eq!(list.residency().ref_count(&first), 1);

        list.set_variable_value(buf, 8, 0, ArgValue::Pointer(Some(0x8000_0000)))
            .unwrap();
        assert_eq!(ctd_u64(&list, d1, 0), second.gpu_address);
        assert!(!list.residency().contains(&first));
        assert_eq!(list.residency().ref_count(&second), 1);
    }

    #[test]
    fn test_buffer_set_before_launch_written_at_launch() {
        let (mut list, table) = new_list();
        let alloc = table.register_host_range(0x7000_0000, 4096, AllocationKind::Buffer);
        let mut k = sample();
        let buf = list.get_variable("buf").unwrap();
        list.set_kernel_arg_variable(&mut k, 0, buf).unwrap();
        list.set_variable_value(buf, 8, 0, ArgValue::Pointer(Some(0x7000_0100)))
            .unwrap();
        let d = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        assert_eq!(ctd_u64(&list, d, 0), alloc.gpu_address + 0x100);
    }

    #[test]
    fn test_value_argument_spans_inline_and_heap() {
        let (mut list, _) = new_list();
        let mut k = sample();
        let val = list.get_variable("val").unwrap();
        list.set_kernel_arg_variable(&mut k, 1, val).unwrap();
        let payload: Vec<u8> = (1..=16).collect();
        list.set_variable_value(val, 16, 0, ArgValue::Bytes(&payload)).unwrap();
        let d = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        assert_eq!(ctd_bytes(&list, d, 24, 16), payload);

        let next: Vec<u8> = (101..=116).collect();
        list.set_variable_value(val, 16, 0, ArgValue::Bytes(&next)).unwrap();
        assert_eq!(ctd_bytes(&list, d, 24, 16), next);

        // 12 bytes: head 8 inline, the heap part takes the payload's last 8
        let short: Vec<u8> = (1..=12).collect();
        list.set_variable_value(val, 12, 0, ArgValue::Bytes(&short)).unwrap();
        let mut expected = next.clone();
        expected[..8].copy_from_slice(&short[..8]);
        expected[8..16].copy_from_slice(&short[4..12]);
        assert_eq!(ctd_bytes(&list, d, 24, 16), expected);
    }

    #[test]
    fn test_slm_chain_sets_walker_footprint() {
        let (mut list, _) = new_list();
        let mut k = sample();
        let a = list.get_variable("slm_a").unwrap();
        let b = list.get_variable("slm_b").unwrap();
        list.set_kernel_arg_variable(&mut k, 2, a).unwrap();
        list.set_kernel_arg_variable(&mut k, 3, b).unwrap();
        list.set_variable_value(a, 100, 0, ArgValue::None).unwrap();
        list.set_variable_value(b, 10, 0, ArgValue::None).unwrap();
        let d = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        let slm_field = list.config().walker.slm_size;

        assert_eq!(ctd_u32(&list, d, 48), 0);
        assert_eq!(ctd_u32(&list, d, 52), 256);
        assert_eq!(walker_u32(&list, d, slm_field), 1024);

        list.set_variable_value(a, 2000, 0, ArgValue::None).unwrap();
        assert_eq!(list.variable(b).unwrap().slm().unwrap().offset, 2048);
        assert_eq!(ctd_u32(&list, d, 52), 2048);
        assert_eq!(walker_u32(&list, d, slm_field), 3072);
    }

    #[test]
    fn test_group_count_unchanged_is_noop_and_stage_commit_defers() {
        let (mut list, _) = new_list();
        let k = sample();
        let gc = list.get_variable("gc").unwrap();
        let params = LaunchParams {
            group_count_variable: Some(gc),
            ..LaunchParams::new([2, 3, 1])
        };
        let d = list.append_launch_kernel(&k, &params).unwrap();
        let field = list.config().walker.group_count;
        assert_eq!(walker_u32(&list, d, field), 2);

        list.set_variable_value(gc, 12, 0, ArgValue::Dims([2, 3, 1])).unwrap();
        assert!(list.pending_commits().is_empty());
        assert_eq!(list.variable(gc).unwrap().dims(), Some([2, 3, 1]));

        list.set_variable_value(gc, 12, SET_VALUE_STAGE_COMMIT, ArgValue::Dims([5, 1, 1]))
            .unwrap();
        assert_eq!(list.pending_commits(), &[gc]);
        assert_eq!(walker_u32(&list, d, field), 2);
        list.commit_variables().unwrap();
        assert!(list.pending_commits().is_empty());
        assert_eq!(walker_u32(&list, d, field), 5);
        // num_work_groups at ctd 88, global size at ctd 100
        assert_eq!(ctd_u32(&list, d, 88), 5);
        assert_eq!(ctd_u32(&list, d, 100), 40);
    }

    #[test]
    fn test_group_count_overflowing_work_size_rejected() {
        let (mut list, _) = new_list();
        let k = sample();
        let gc = list.get_variable("gc").unwrap();
        let params = LaunchParams {
            group_count_variable: Some(gc),
            ..LaunchParams::new([2, 3, 1])
        };
        let d = list.append_launch_kernel(&k, &params).unwrap();
        let field = list.config().walker.group_count;

        let err = list
            .set_variable_value(gc, 12, 0, ArgValue::Dims([1 << 29, 1, 1]))
            .unwrap_err();
        assert!(matches!(err, MclError::InvalidArgument(_)));
        assert_eq!(list.variable(gc).unwrap().dims(), Some([2, 3, 1]));
        assert_eq!(walker_u32(&list, d, field), 2);
        assert_eq!(list.dispatches()[d.index()].group_count(), [2, 3, 1]);
    }

    #[test]
    fn test_launch_with_overflowing_group_count_records_nothing() {
        let (mut list, _) = new_list();
        let k = sample();
        let cs_used = list.container().heap_bytes(HeapKind::CommandStream).len();
        let err = list
            .append_launch_kernel(&k, &LaunchParams::new([u32::MAX, 1, 1]))
            .unwrap_err();
        assert!(matches!(err, MclError::InvalidArgument(_)));
        assert!(list.dispatches().is_empty());
        assert_eq!(list.container().heap_bytes(HeapKind::CommandStream).len(), cs_used);
    }

    #[test]
    fn test_group_size_variable_regenerates_local_ids() {
        let (mut list, _) = new_list();
        let mut k = sample();
        let gs = list.get_variable("gs").unwrap();
        list.set_kernel_group_size_variable(&mut k, gs).unwrap();
        let d = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        assert!(!list.dispatches()[d.index()].local_ids_by_runtime());

        list.set_variable_value(gs, 12, 0, ArgValue::Dims([3, 5, 1])).unwrap();
        let binding = &list.dispatches()[d.index()];
        assert!(binding.local_ids_by_runtime());
        assert_eq!(binding.threads_per_group(), 1);
        assert_eq!(ctd_u32(&list, d, 64), 3);
    }

    #[test]
    fn test_signal_event_programs_post_sync() {
        let (mut list, table) = new_list();
        let counter = table.register_host_range(0xC000_0000, 64, AllocationKind::DeviceCounter);
        let sig = list.get_variable("sig").unwrap();
        let params = LaunchParams {
            signal_event: Some(counter_event(counter, 7)),
            signal_event_variable: Some(sig),
            ..LaunchParams::new([1, 1, 1])
        };
        let d = list.append_launch_kernel(&sample(), &params).unwrap();
        let layout = list.config().walker;
        let w = list.dispatches()[d.index()].walker();
        let c = list.container();
        let addr = c.memory.read_u64(c.cs.address_of(w.field_offset(layout.post_sync_address))).unwrap();
        assert_eq!(addr, counter.gpu_address);
        assert!(list.residency().contains(&counter));
        assert_eq!(list.variable(sig).unwrap().event().unwrap().walkers.len(), 1);
    }

    #[test]
    fn test_static_pointer_argument_resolved_at_launch() {
        let (mut list, table) = new_list();
        let alloc = table.register_host_range(0x7000_0000, 4096, AllocationKind::Buffer);
        let mut k = sample();
        k.set_argument_value(0, &0x7000_0040u64.to_le_bytes()).unwrap();
        let d = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        assert_eq!(ctd_u64(&list, d, 0), alloc.gpu_address + 0x40);
        assert!(list.residency().contains(&alloc));
    }

    #[test]
    fn test_slm_variable_in_two_dispatches_rejected() {
        let (mut list, _) = new_list();
        let mut k = sample();
        let a = list.get_variable("slm").unwrap();
        list.set_kernel_arg_variable(&mut k, 2, a).unwrap();
        list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        let cs_used = list.container().cs.used();
        let err = list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap_err();
        assert!(matches!(err, MclError::UnsupportedFeature(_)));
        // nothing recorded for the rejected launch
        assert_eq!(list.container().cs.used(), cs_used);
        assert_eq!(list.dispatches().len(), 1);

        let mut twice = sample();
        let b = list.get_variable("twice").unwrap();
        list.set_kernel_arg_variable(&mut twice, 2, b).unwrap();
        list.set_kernel_arg_variable(&mut twice, 3, b).unwrap();
        let err = list.append_launch_kernel(&twice, &LaunchParams::new([1, 1, 1])).unwrap_err();
        assert!(matches!(err, MclError::InvalidArgument(_)));
    }
}
