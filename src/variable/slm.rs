//! Shared-local-memory offset chain.
//!
//! The SLM arguments of one kernel are laid out back to back, each at its
//! predecessor's end aligned up to its own alignment. Resizing one
//! variable moves every later one and changes the dispatch footprint.

use tracing::debug;

use super::patch::PatchContext;
use super::{VarId, Variable, VariableState};
use crate::error::{MclError, Result};
use crate::memory::HeapKind;

fn slm_of(vars: &[Variable], id: VarId) -> Result<super::SlmValue> {
    vars.get(id.index())
        .and_then(|v| v.slm().copied())
        .ok_or_else(|| MclError::InvalidArgument(format!("variable {} is not an SLM buffer", id.0)))
}

fn too_large(what: &str, value: u64) -> MclError {
    MclError::InvalidArgument(format!("SLM {} {} does not fit in 32 bits", what, value))
}

/// `value` rounded up to `alignment`, still as a 32-bit SLM offset.
pub fn align_slm(value: u32, alignment: u32) -> Result<u32> {
    let a = alignment.max(1) as u64;
    let aligned = (value as u64).div_ceil(a) * a;
    u32::try_from(aligned).map_err(|_| too_large("offset", aligned))
}

/// End of a buffer at `offset` spanning `size` bytes.
pub fn slm_end(offset: u32, size: u32) -> Result<u32> {
    offset
        .checked_add(size)
        .ok_or_else(|| too_large("end", offset as u64 + size as u64))
}

/// Link `chain` (kernel argument order) and assign initial offsets,
/// starting at `start`. Each entry is `(variable, required alignment)`.
/// Returns the aligned footprint of all SLM arguments.
pub fn assign_chain(vars: &mut [Variable], chain: &[(VarId, u32)], start: u32, granularity: u32) -> Result<u32> {
    let mut placed = Vec::with_capacity(chain.len());
    let mut end = start;
    for (id, alignment) in chain {
        let slm = slm_of(vars, *id)?;
        let offset = align_slm(end, *alignment)?;
        end = slm_end(offset, slm.size)?;
        placed.push(offset);
    }
    let total = align_slm(end, granularity)?;

    for (i, ((id, alignment), offset)) in chain.iter().zip(placed).enumerate() {
        let next = chain.get(i + 1).map(|(n, _)| *n);
        if let Some(slm) = vars[id.index()].slm_mut() {
            slm.alignment = *alignment;
            slm.offset = offset;
            slm.next = next;
        }
    }
    Ok(total)
}

/// Resize an SLM variable and move everything after it.
pub fn set_slm_size(vars: &mut [Variable], id: VarId, size: usize, ctx: &mut PatchContext<'_>) -> Result<()> {
    let size = u32::try_from(size).map_err(|_| too_large("size", size as u64))?;
    let current = slm_of(vars, id)?;
    debug!(var = id.0, new = size, old = current.size, "slm resize");
    if current.size != size {
        let plan = plan_chain(vars, id, size, ctx.slm_granularity)?;
        if let Some(s) = vars[id.index()].slm_mut() {
            s.size = size;
        }
        apply_chain(vars, id, plan, ctx)?;
    }
    vars[id.index()].set_state(VariableState::Initialized);
    Ok(())
}

/// Offsets a resize moves, and the footprint when it reaches the tail.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChainPlan {
    pub moves: Vec<(VarId, u32)>,
    pub footprint: Option<(VarId, u32)>,
}

/// Walk the chain from `from` as if it had `size` bytes, re-aligning
/// successors until an offset stays put. Nothing is written.
pub fn plan_chain(vars: &[Variable], from: VarId, size: u32, granularity: u32) -> Result<ChainPlan> {
    let mut plan = ChainPlan::default();
    let mut cur = from;
    let mut slm = slm_of(vars, from)?;
    slm.size = size;
    loop {
        let end = slm_end(slm.offset, slm.size)?;
        let Some(next) = slm.next else {
            plan.footprint = Some((cur, align_slm(end, granularity)?));
            return Ok(plan);
        };
        if next == from || plan.moves.len() >= vars.len() {
            return Err(MclError::InvalidArgument(format!("SLM chain from variable {} loops", from.0)));
        }
        let mut succ = slm_of(vars, next)?;
        let aligned = align_slm(end, succ.alignment)?;
        debug!(var = next.0, new = aligned, old = succ.offset, "slm offset");
        if aligned == succ.offset {
            return Ok(plan);
        }
        plan.moves.push((next, aligned));
        succ.offset = aligned;
        slm = succ;
        cur = next;
    }
}

fn apply_chain(vars: &mut [Variable], from: VarId, plan: ChainPlan, ctx: &mut PatchContext<'_>) -> Result<()> {
    let stage = slm_stage(vars, from);
    for (id, offset) in plan.moves {
        patch_offset(&vars[id.index()], offset, ctx)?;
        if let Some(s) = vars[id.index()].slm_mut() {
            s.offset = offset;
        }
    }
    let Some((tail, total)) = plan.footprint else {
        return Ok(());
    };
    let var = &mut vars[tail.index()];
    for d in var.used_in_dispatch().to_vec() {
        let c = &mut *ctx.container;
        ctx.dispatches
            .get_mut(d.index())
            .ok_or_else(|| MclError::InvalidArgument(format!("unknown dispatch {}", d.0)))?
            .set_slm_size(c, total, stage)?;
    }
    if stage && !var.commit_required() && !var.used_in_dispatch().is_empty() {
        var.set_commit_required(true);
        ctx.commit_list.push(tail);
    }
    debug!(var = tail.0, total, "slm footprint");
    Ok(())
}

fn slm_stage(vars: &[Variable], id: VarId) -> bool {
    vars.get(id.index()).is_some_and(|v| v.flags().stage_commit)
}

fn patch_offset(var: &Variable, offset: u32, ctx: &mut PatchContext<'_>) -> Result<()> {
    let bytes = offset.to_le_bytes();
    for u in &var.usages().command_buffer {
        ctx.container.patch(HeapKind::CommandStream, &u.site, &bytes)?;
    }
    for u in &var.usages().indirect {
        ctx.container.patch(HeapKind::IndirectObject, &u.site, &bytes)?;
    }
    Ok(())
}
