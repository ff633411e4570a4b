//! The patch engine: `set_value` and the per-kind patchers.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{slm, Payload, VarId, Variable, VariableState, VariableType};
use crate::commands::{encode_surface_state, EVENT_SIGNALED};
use crate::dispatch::DispatchBinding;
use crate::error::{MclError, Result};
use crate::event::{Event, InOrderCounter};
use crate::memory::{Allocator, CommandContainer, GpuAddress, HeapKind, ResidencyContainer, ResolvedPointer};

/// `set_value` flag: defer dispatch writes until `commit_variables`.
pub const SET_VALUE_STAGE_COMMIT: u32 = 1 << 0;

/// Everything a patcher may touch beyond the variable itself.
pub struct PatchContext<'a> {
    pub container: &'a mut CommandContainer,
    pub residency: &'a mut ResidencyContainer,
    pub allocator: &'a dyn Allocator,
    pub dispatches: &'a mut [DispatchBinding],
    pub commit_list: &'a mut Vec<VarId>,
    pub in_order: &'a InOrderCounter,
    pub slm_granularity: u32,
}

/// A new value for a variable.
#[derive(Debug, Clone)]
pub enum ArgValue<'a> {
    /// Raw bytes of a by-value argument.
    Bytes(&'a [u8]),
    /// Host pointer of a buffer; `None` unbinds.
    Pointer(Option<u64>),
    Dims([u32; 3]),
    Event(Option<Arc<Event>>),
    /// No payload (SLM variables take their new size from `size`).
    None,
}

fn mismatch(var: &Variable, value: &ArgValue<'_>) -> MclError {
    MclError::InvalidArgument(format!(
        "variable {:?} of type {:?} cannot take {:?}",
        var.name(),
        var.var_type(),
        value
    ))
}

/// Write a new value into every recorded copy of variable `id`.
pub fn set_value(
    vars: &mut [Variable],
    id: VarId,
    size: usize,
    flags: u32,
    value: ArgValue<'_>,
    ctx: &mut PatchContext<'_>,
) -> Result<()> {
    let var = vars
        .get_mut(id.index())
        .ok_or_else(|| MclError::InvalidArgument(format!("unknown variable {}", id.0)))?;
    if var.flags().temporary {
        return Err(MclError::InvalidArgument(
            "temporary variables are assigned through temporary memory".into(),
        ));
    }
    if flags & SET_VALUE_STAGE_COMMIT != 0 {
        var.flags_mut().stage_commit = true;
    }
    let ty = var.var_type();
    if ty != VariableType::Value && ty != VariableType::SlmBuffer && size != var.size() {
        return Err(MclError::InvalidArgument(format!(
            "variable {:?} expects {} bytes, got {}",
            var.name(),
            var.size(),
            size
        )));
    }

    match (ty, &value) {
        (VariableType::Buffer, ArgValue::Pointer(ptr)) => {
            let resolved = match ptr {
                Some(p) => Some(ctx.allocator.resolve(*p)?),
                None => None,
            };
            patch_buffer(var, resolved, ctx)
        }
        (VariableType::Value, ArgValue::Bytes(bytes)) => {
            if bytes.len() < size {
                return Err(MclError::InvalidArgument(format!(
                    "value payload has {} bytes, size says {}",
                    bytes.len(),
                    size
                )));
            }
            patch_value(var, &bytes[..size], ctx)
        }
        (VariableType::GroupSize | VariableType::GroupCount | VariableType::GlobalOffset, ArgValue::Dims(d)) => {
            patch_dims(var, id, *d, ctx)
        }
        (VariableType::SignalEvent, ArgValue::Event(e)) => patch_signal_event(var, e.as_ref(), ctx),
        (VariableType::WaitEvent, ArgValue::Event(e)) => patch_wait_event(var, e.as_ref(), ctx),
        (VariableType::SlmBuffer, _) => slm::set_slm_size(vars, id, size, ctx),
        _ => Err(mismatch(var, &value)),
    }
}

/// Flush every staged variable into its dispatches.
pub fn commit_variables(vars: &mut [Variable], ctx: &mut PatchContext<'_>) -> Result<()> {
    let pending: Vec<VarId> = ctx.commit_list.drain(..).collect();
    for id in pending {
        let var = vars
            .get_mut(id.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown variable {}", id.0)))?;
        for d in var.used_in_dispatch().to_vec() {
            let c = &mut *ctx.container;
            ctx.dispatches
                .get_mut(d.index())
                .ok_or_else(|| MclError::InvalidArgument(format!("unknown dispatch {}", d.0)))?
                .commit(c)?;
        }
        var.set_commit_required(false);
        trace!(var = id.0, "committed");
    }
    Ok(())
}

pub(crate) fn mark_commit(var: &mut Variable, id: VarId, ctx: &mut PatchContext<'_>) {
    if var.flags().stage_commit && !var.commit_required() && !var.used_in_dispatch().is_empty() {
        var.set_commit_required(true);
        ctx.commit_list.push(id);
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Point every site of a buffer variable at `resolved` (or address 0).
pub(crate) fn patch_buffer(
    var: &mut Variable,
    resolved: Option<ResolvedPointer>,
    ctx: &mut PatchContext<'_>,
) -> Result<()> {
    let old_allocation = var.buffer().and_then(|b| b.allocation);
    let (gpu, allocation) = match resolved {
        Some(r) => (r.device_address, Some(r.allocation)),
        None => (0, None),
    };
    debug!(name = ?var.name(), gpu = format_args!("0x{:x}", gpu), "patch buffer");

    let bytes = gpu.to_le_bytes();
    for u in &var.usages().command_buffer {
        ctx.container
            .patch(HeapKind::CommandStream, &u.site, &bytes[..u.patch_size.min(8)])?;
    }
    for u in &var.usages().indirect {
        ctx.container
            .patch(HeapKind::IndirectObject, &u.site, &bytes[..u.patch_size.min(8)])?;
    }
    if let Some(a) = allocation {
        let remaining = a.size as u64 - (gpu - a.gpu_address);
        let surface = encode_surface_state(gpu, remaining.min(u32::MAX as u64) as u32);
        for u in &var.usages().surface_state {
            ctx.container.patch(HeapKind::SurfaceState, &u.site, &surface)?;
        }
    }

    if let Payload::Buffer(b) = var.payload_mut() {
        b.gpu_address = gpu;
        b.allocation = allocation;
    }
    var.set_state(if allocation.is_some() {
        VariableState::Initialized
    } else {
        VariableState::Defined
    });
    ctx.residency.swap(old_allocation.as_ref(), allocation.as_ref());
    Ok(())
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

fn patch_value(var: &mut Variable, value: &[u8], ctx: &mut PatchContext<'_>) -> Result<()> {
    if var.flags().immediate_value_chunks {
        patch_value_chunks(var, value, ctx)?;
    } else {
        patch_value_continuous(var, value, ctx)?;
    }
    if let Payload::Value(v) = var.payload_mut() {
        v.last = value.to_vec();
    }
    var.set_state(VariableState::Initialized);
    Ok(())
}

/// Command-buffer sites hold the head of the value, heap sites the last
/// `patch_size` bytes of the payload.
fn patch_value_continuous(var: &Variable, value: &[u8], ctx: &mut PatchContext<'_>) -> Result<()> {
    let caller = value.len();
    for u in &var.usages().command_buffer {
        let n = u.patch_size.min(caller);
        trace!(name = ?var.name(), n, "patch value head");
        ctx.container.patch(HeapKind::CommandStream, &u.site, &value[..n])?;
    }
    for u in &var.usages().indirect {
        let tail = caller.saturating_sub(u.patch_size);
        trace!(name = ?var.name(), tail, end = caller, "patch value tail");
        ctx.container
            .patch(HeapKind::IndirectObject, &u.site, &value[tail..])?;
    }
    Ok(())
}

fn patch_value_chunks(var: &Variable, value: &[u8], ctx: &mut PatchContext<'_>) -> Result<()> {
    let caller = value.len();
    let chunks = match var.value() {
        Some(v) => &v.chunks,
        None => return Ok(()),
    };
    let usages = var.usages();
    for chunk in chunks {
        if chunk.source_offset >= caller {
            trace!(name = ?var.name(), source_offset = chunk.source_offset, "skip chunk");
            continue;
        }
        let to_copy = chunk.size.min(caller - chunk.source_offset);
        let src = &value[chunk.source_offset..chunk.source_offset + to_copy];

        let cs = chunk.cmd_buffer_usage.and_then(|i| usages.command_buffer.get(i));
        let heap = chunk.heap_usage.and_then(|i| usages.indirect.get(i));

        if let Some(cs) = cs {
            let n = cs.patch_size.min(to_copy);
            ctx.container.patch(HeapKind::CommandStream, &cs.site, &src[..n])?;
        }
        if let Some(heap) = heap {
            // a chunk split across inline data continues at the heap site
            let skip = cs.map_or(0, |c| c.patch_size);
            if to_copy > skip {
                let n = heap.patch_size.min(to_copy - skip);
                ctx.container
                    .patch(HeapKind::IndirectObject, &heap.site, &src[skip..skip + n])?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch properties
// ---------------------------------------------------------------------------

fn patch_dims(var: &mut Variable, id: VarId, dims: [u32; 3], ctx: &mut PatchContext<'_>) -> Result<()> {
    if var.dims() == Some(dims) {
        return Ok(());
    }
    let stage = var.flags().stage_commit;
    let ty = var.var_type();
    for d in var.used_in_dispatch() {
        let binding = ctx
            .dispatches
            .get(d.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown dispatch {}", d.0)))?;
        match ty {
            VariableType::GroupSize => binding.check_group_size(dims)?,
            VariableType::GroupCount => binding.check_group_count(dims)?,
            _ => {}
        }
    }
    for d in var.used_in_dispatch().to_vec() {
        let c = &mut *ctx.container;
        let binding = ctx
            .dispatches
            .get_mut(d.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown dispatch {}", d.0)))?;
        match ty {
            VariableType::GroupSize => binding.set_group_size(c, dims, stage)?,
            VariableType::GroupCount => binding.set_group_count(c, dims, stage)?,
            _ => binding.set_global_offset(c, dims)?,
        }
    }
    if ty != VariableType::GlobalOffset {
        mark_commit(var, id, ctx);
    }
    var.set_dims(dims);
    var.set_state(VariableState::Initialized);
    Ok(())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

fn same_event(a: Option<&Arc<Event>>, b: Option<&Arc<Event>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn patch_signal_event(var: &mut Variable, new: Option<&Arc<Event>>, ctx: &mut PatchContext<'_>) -> Result<()> {
    let new = new.ok_or_else(|| MclError::InvalidArgument("a signal event cannot be unbound".into()))?;
    let name = var.name().map(str::to_string);
    let ev = var
        .event_mut()
        .ok_or_else(|| MclError::InvalidArgument("signal event without event state".into()))?;
    if same_event(ev.event.as_ref(), Some(new)) {
        return Ok(());
    }

    ctx.residency.swap(ev.allocation.as_ref(), new.allocation());
    let old_counter = ev.event.as_ref().and_then(|e| e.counter()).map(|c| c.device_counter_allocation);
    let new_counter = new.counter().map(|c| c.device_counter_allocation);
    ctx.residency.swap(old_counter.as_ref(), new_counter.as_ref());

    if new.allocation().is_some() || new.is_counter_based() {
        let address: GpuAddress = new.wait_address();
        let immediate = new.counter().map_or(EVENT_SIGNALED, |c| c.counter_value);
        debug!(name = ?name, address = format_args!("0x{:x}", address), "patch signal event");
        for sdi in &ev.store_data_imms {
            sdi.set_address(ctx.container, address)?;
        }
        for w in &ev.walkers {
            w.set_post_sync(ctx.container, address, immediate)?;
        }
    }

    ev.event = Some(Arc::clone(new));
    ev.allocation = new.allocation().copied();
    var.set_state(VariableState::Initialized);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterWaitOp {
    Set,
    Noop,
    Restore,
}

fn patch_wait_event(var: &mut Variable, new: Option<&Arc<Event>>, ctx: &mut PatchContext<'_>) -> Result<()> {
    let name = var.name().map(str::to_string);
    let ev = var
        .event_mut()
        .ok_or_else(|| MclError::InvalidArgument("wait event without event state".into()))?;
    if same_event(ev.event.as_ref(), new) {
        return Ok(());
    }

    let mut new_nooped = true;
    let mut new_bound = false;
    let mut new_counter_allocation = None;
    if let Some(n) = new {
        new_nooped = false;
        if let Some(counter) = n.counter() {
            new_bound = ctx.in_order.owns(n);
            if new_bound {
                new_nooped = true;
            } else {
                new_counter_allocation = Some(counter.device_counter_allocation);
            }
        }
    }
    let new_allocation = new.and_then(|n| n.allocation().copied());

    let old_nooped = ev.noop_state;
    let (old_allocation, old_counter_allocation) = if ev.event.is_some() {
        let counter = if ev.counter_based && !ev.bound_to_list {
            ev.counter_allocation
        } else {
            None
        };
        (ev.allocation, counter)
    } else {
        (None, None)
    };
    ctx.residency.swap(old_allocation.as_ref(), new_allocation.as_ref());
    ctx.residency
        .swap(old_counter_allocation.as_ref(), new_counter_allocation.as_ref());

    if ev.counter_based {
        let op = match (old_nooped, new_nooped) {
            (true, false) => Some(CounterWaitOp::Restore),
            (false, true) => Some(CounterWaitOp::Noop),
            (false, false) => Some(CounterWaitOp::Set),
            (true, true) => None,
        };
        if let Some(op) = op {
            debug!(name = ?name, ?op, "patch counter wait event");
            let qword = ctx.in_order.qword;
            update_counter_wait(ev, op, new.map(|n| n.as_ref()), ctx.container, qword)?;
            ev.noop_state = op == CounterWaitOp::Noop;
        }
    } else {
        if let Some(n) = new.filter(|n| n.allocation().is_some()) {
            let address = n.gpu_address();
            debug!(name = ?name, address = format_args!("0x{:x}", address), "patch wait event");
            for sem in ev.semaphore_waits.iter_mut() {
                if old_nooped {
                    sem.restore_with_semaphore_address(ctx.container, address)?;
                } else {
                    sem.set_semaphore_address(ctx.container, address)?;
                }
            }
        }
        if new_nooped {
            for sem in ev.semaphore_waits.iter_mut() {
                sem.noop(ctx.container)?;
            }
        }
        ev.noop_state = new_nooped;
    }

    ev.event = new.cloned();
    ev.allocation = new_allocation;
    ev.bound_to_list = new_bound;
    ev.counter_allocation = new_counter_allocation;
    var.set_state(VariableState::Initialized);
    Ok(())
}

fn update_counter_wait(
    ev: &mut super::EventValue,
    op: CounterWaitOp,
    new: Option<&Event>,
    c: &mut CommandContainer,
    qword: bool,
) -> Result<()> {
    let address = new.map_or(0, |n| n.wait_address());
    let value = new.and_then(|n| n.counter()).map(|c| c.counter_value);
    let program = matches!(op, CounterWaitOp::Set | CounterWaitOp::Restore);

    for sem in ev.semaphore_waits.iter_mut() {
        match op {
            CounterWaitOp::Set => sem.set_semaphore_address(c, address)?,
            CounterWaitOp::Noop => sem.noop(c)?,
            CounterWaitOp::Restore => sem.restore_with_semaphore_address(c, address)?,
        }
        if let (true, false, Some(v)) = (program, qword, value) {
            sem.set_semaphore_value(c, v)?;
        }
    }
    if qword {
        for (i, lri) in ev.load_register_imms.iter_mut().enumerate() {
            match op {
                CounterWaitOp::Noop => lri.noop(c)?,
                CounterWaitOp::Restore => lri.restore(c)?,
                CounterWaitOp::Set => {}
            }
            if let (true, Some(v)) = (program, value) {
                let half = if i % 2 == 0 { v as u32 } else { (v >> 32) as u32 };
                lri.set_value(c, half)?;
            }
        }
    }
    Ok(())
}
