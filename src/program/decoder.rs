//! Rebuild a command list from a container.
//!
//! Everything is parsed and validated before any heap is allocated, so a
//! rejected container leaves the allocator untouched. Variables come back
//! with unbound (offset-based) patch sites; buffer and event variables are
//! `Defined` again and must be set before the list is executed.

use std::sync::Arc;

use tracing::{debug, info};

use super::{
    optional, read_bytes, read_header, read_i64, read_u16, read_u32, read_u64, read_u8, ContainerHeader,
    KernelTable, Relocation, RelocationKind, SectionKind, Symbol, SymbolKind, DISPATCH_RECORD_SIZE, FLAG_CLOSED,
    NONE, RELOCATION_SIZE, SYMBOL_SIZE,
};
use crate::cmdlist::{AddressFixup, CommandList, FixupKind, KernelRecord, Parts, BASE_ADDRESS_HEAPS};
use crate::commands::{
    MutableLoadRegisterImm, MutableSemaphoreWait, MutableStoreDataImm, BATCH_BUFFER_START_SIZE,
    LOAD_REGISTER_IMM_SIZE, SEMAPHORE_WAIT_SIZE, STORE_DATA_IMM_SIZE,
};
use crate::config::CommandListConfig;
use crate::dispatch::{check_dispatch_sizes, DispatchBinding, DispatchId, DispatchVariables, IndirectData};
use crate::error::{MclError, Result};
use crate::label::Label;
use crate::memory::{Allocator, CommandContainer, HeapKind};
use crate::variable::{
    BufferValue, EventValue, ImmediateValueChunk, Payload, PatchSite, SlmValue, UsageSite, Usages, ValueState,
    VarId, Variable, VariableFlags, VariableState, VariableType,
};
use crate::walker::{MutableComputeWalker, WalkerLayout};

fn bad(msg: impl Into<String>) -> MclError {
    MclError::Decode(msg.into())
}

fn string_at(strtab: &[u8], offset: u32) -> Result<Option<String>> {
    if offset == NONE {
        return Ok(None);
    }
    let tail = strtab
        .get(offset as usize..)
        .ok_or_else(|| bad(format!("string offset {} outside string table", offset)))?;
    let end = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| bad(format!("unterminated string at {}", offset)))?;
    let s = std::str::from_utf8(&tail[..end]).map_err(|e| bad(format!("string at {}: {}", offset, e)))?;
    Ok(Some(s.to_string()))
}

fn read_dims(r: &mut &[u8]) -> Result<[u32; 3]> {
    Ok([read_u32(r)?, read_u32(r)?, read_u32(r)?])
}

fn read_offsets(r: &mut &[u8]) -> Result<Vec<usize>> {
    let n = read_u32(r)? as usize;
    if n > r.len() / 8 {
        return Err(bad(format!("offset list of {} entries overruns its section", n)));
    }
    (0..n).map(|_| Ok(read_u64(r)? as usize)).collect()
}

fn in_section(offset: usize, len: usize, size: usize) -> bool {
    matches!(offset.checked_add(len), Some(end) if end <= size)
}

// ---------------------------------------------------------------------------
// Parsed records
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum VarBody {
    Empty,
    Value(Vec<u8>),
    Dims([u32; 3]),
    Slm(SlmValue),
    Event {
        counter_based: bool,
        semaphore_waits: Vec<usize>,
        load_register_imms: Vec<usize>,
        store_data_imms: Vec<usize>,
        walkers: Vec<usize>,
    },
}

#[derive(Debug)]
struct VarRecord {
    name: Option<String>,
    ty: VariableType,
    state: VariableState,
    flags: VariableFlags,
    size: usize,
    temp_size: usize,
    chunks: Vec<ImmediateValueChunk>,
    body: VarBody,
}

#[derive(Debug)]
struct DispatchRecord {
    kernel: usize,
    group_size: [u32; 3],
    group_count: [u32; 3],
    global_offset: [u32; 3],
    slm_args_size: u32,
    vars: DispatchVariables,
    inline_size: usize,
    per_thread_capacity: usize,
}

#[derive(Debug)]
struct LabelRecord {
    name: Option<String>,
    cs_offset: Option<usize>,
    pending: Vec<usize>,
}

fn parse_symbols(bytes: &[u8]) -> Result<Vec<Symbol>> {
    let mut r = bytes;
    let mut out = Vec::with_capacity(bytes.len() / SYMBOL_SIZE);
    while !r.is_empty() {
        let name = read_u32(&mut r)?;
        let kind = SymbolKind::from_code(read_u8(&mut r)?)?;
        let section = SectionKind::from_code(u32::from(read_u8(&mut r)?))?;
        let _reserved = read_u16(&mut r)?;
        let value = read_u64(&mut r)?;
        let size = read_u64(&mut r)?;
        out.push(Symbol {
            name,
            kind,
            section,
            value,
            size,
        });
    }
    Ok(out)
}

fn parse_relocations(bytes: &[u8]) -> Result<Vec<Relocation>> {
    let mut r = bytes;
    let mut out = Vec::with_capacity(bytes.len() / RELOCATION_SIZE);
    while !r.is_empty() {
        let target = SectionKind::from_code(read_u32(&mut r)?)?;
        let kind = RelocationKind::from_code(read_u32(&mut r)?)?;
        let symbol = read_u32(&mut r)?;
        let _reserved = read_u32(&mut r)?;
        let offset = read_u64(&mut r)?;
        let addend = read_i64(&mut r)?;
        out.push(Relocation {
            target,
            kind,
            symbol,
            offset,
            addend,
        });
    }
    Ok(out)
}

fn parse_variables(bytes: &[u8], strtab: &[u8]) -> Result<Vec<VarRecord>> {
    let mut r = bytes;
    let mut out = Vec::new();
    while !r.is_empty() {
        let name = string_at(strtab, read_u32(&mut r)?)?;
        let ty_code = read_u8(&mut r)?;
        let ty = VariableType::from_code(ty_code).ok_or_else(|| bad(format!("unknown variable type {}", ty_code)))?;
        let state_code = read_u8(&mut r)?;
        let state = VariableState::from_code(state_code)
            .ok_or_else(|| bad(format!("unknown variable state {}", state_code)))?;
        let flags = VariableFlags::from_bits(read_u8(&mut r)?);
        let _reserved = read_u8(&mut r)?;
        let size = read_u32(&mut r)? as usize;
        let temp_size = read_u32(&mut r)? as usize;
        let n_chunks = read_u32(&mut r)? as usize;
        if n_chunks > r.len() / 16 {
            return Err(bad(format!("variable {:?} claims {} value chunks", name, n_chunks)));
        }
        let mut chunks = Vec::with_capacity(n_chunks);
        for _ in 0..n_chunks {
            chunks.push(ImmediateValueChunk {
                source_offset: read_u32(&mut r)? as usize,
                size: read_u32(&mut r)? as usize,
                heap_usage: optional(read_u32(&mut r)?).map(|i| i as usize),
                cmd_buffer_usage: optional(read_u32(&mut r)?).map(|i| i as usize),
            });
        }
        let body = match ty {
            VariableType::Value => {
                let len = read_u32(&mut r)? as usize;
                if len > r.len() {
                    return Err(bad(format!("value of variable {:?} overruns its section", name)));
                }
                VarBody::Value(read_bytes(&mut r, len)?)
            }
            VariableType::GroupSize | VariableType::GroupCount | VariableType::GlobalOffset => {
                VarBody::Dims(read_dims(&mut r)?)
            }
            VariableType::SlmBuffer => VarBody::Slm(SlmValue {
                size: read_u32(&mut r)?,
                offset: read_u32(&mut r)?,
                alignment: read_u32(&mut r)?,
                next: optional(read_u32(&mut r)?).map(VarId),
            }),
            VariableType::SignalEvent | VariableType::WaitEvent => VarBody::Event {
                counter_based: read_u32(&mut r)? != 0,
                semaphore_waits: read_offsets(&mut r)?,
                load_register_imms: read_offsets(&mut r)?,
                store_data_imms: read_offsets(&mut r)?,
                walkers: read_offsets(&mut r)?,
            },
            VariableType::Buffer | VariableType::None => VarBody::Empty,
        };
        out.push(VarRecord {
            name,
            ty,
            state,
            flags,
            size,
            temp_size,
            chunks,
            body,
        });
    }
    Ok(out)
}

fn parse_dispatches(bytes: &[u8]) -> Result<Vec<DispatchRecord>> {
    let mut r = bytes;
    let mut out = Vec::with_capacity(bytes.len() / DISPATCH_RECORD_SIZE);
    let var = |v: u32| optional(v).map(VarId);
    while !r.is_empty() {
        let kernel = read_u32(&mut r)? as usize;
        let group_size = read_dims(&mut r)?;
        let group_count = read_dims(&mut r)?;
        let global_offset = read_dims(&mut r)?;
        let slm_args_size = read_u32(&mut r)?;
        let vars = DispatchVariables {
            group_size: var(read_u32(&mut r)?),
            group_count: var(read_u32(&mut r)?),
            global_offset: var(read_u32(&mut r)?),
            last_slm: var(read_u32(&mut r)?),
        };
        out.push(DispatchRecord {
            kernel,
            group_size,
            group_count,
            global_offset,
            slm_args_size,
            vars,
            inline_size: read_u32(&mut r)? as usize,
            per_thread_capacity: read_u32(&mut r)? as usize,
        });
    }
    Ok(out)
}

fn parse_labels(bytes: &[u8], strtab: &[u8]) -> Result<Vec<LabelRecord>> {
    let mut r = bytes;
    let mut out = Vec::new();
    while !r.is_empty() {
        let name = string_at(strtab, read_u32(&mut r)?)?;
        let set = read_u32(&mut r)? != 0;
        let offset = read_u64(&mut r)?;
        let pending = read_offsets(&mut r)?;
        let cs_offset = match (set, offset) {
            (true, u64::MAX) => return Err(bad(format!("label {:?} is set without an offset", name))),
            (true, o) => Some(o as usize),
            (false, _) => None,
        };
        out.push(LabelRecord {
            name,
            cs_offset,
            pending,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Relocation plan
// ---------------------------------------------------------------------------

/// What the relocations ask the decoder to do, checked against the sections.
#[derive(Debug, Default)]
struct Plan {
    /// `(kind, heap, cs offset, addend)` of every heap address in the stream.
    addresses: Vec<(FixupKind, HeapKind, usize, u64)>,
    usages: Vec<Usages>,
    walkers: Vec<Option<usize>>,
    cross_thread: Vec<Option<usize>>,
}

struct Sizes {
    cs: usize,
    ioh: usize,
    ssh: usize,
}

impl Sizes {
    fn of(&self, kind: SectionKind) -> usize {
        match kind {
            SectionKind::IndirectObject => self.ioh,
            SectionKind::SurfaceState => self.ssh,
            _ => self.cs,
        }
    }
}

fn plan_relocations(
    relocations: &[Relocation],
    symbols: &[Symbol],
    header: &ContainerHeader,
    n_vars: usize,
    n_dispatches: usize,
    walker_size: usize,
) -> Result<Plan> {
    let section_size = |k: SectionKind| header.section(k).map_or(0, |s| s.size as usize);
    let sizes = Sizes {
        cs: section_size(SectionKind::CommandStream),
        ioh: section_size(SectionKind::IndirectObject),
        ssh: section_size(SectionKind::SurfaceState),
    };
    let mut plan = Plan {
        usages: vec![Usages::default(); n_vars],
        walkers: vec![None; n_dispatches],
        cross_thread: vec![None; n_dispatches],
        ..Default::default()
    };

    for (i, r) in relocations.iter().enumerate() {
        let sym = symbols
            .get(r.symbol as usize)
            .ok_or_else(|| bad(format!("relocation {} references missing symbol {}", i, r.symbol)))?;
        if r.target != r.kind.target() {
            return Err(bad(format!(
                "relocation {} ({:?}) targets {}",
                i,
                r.kind,
                r.target.name()
            )));
        }
        let offset = r.offset as usize;
        let target_size = sizes.of(r.target);
        match r.kind {
            RelocationKind::Address64 | RelocationKind::BaseAddress => {
                let (want, fixup) = if r.kind == RelocationKind::Address64 {
                    (SymbolKind::Section, FixupKind::Address64)
                } else {
                    (SymbolKind::BaseAddress, FixupKind::BaseAddress)
                };
                if sym.kind != want {
                    return Err(bad(format!("relocation {} expects a {:?} symbol", i, want)));
                }
                let heap = sym
                    .section
                    .heap()
                    .ok_or_else(|| bad(format!("relocation {} points into {}", i, sym.section.name())))?;
                if fixup == FixupKind::BaseAddress && !BASE_ADDRESS_HEAPS.contains(&heap) {
                    return Err(bad(format!("{} has no base address", sym.section.name())));
                }
                let heap_size = section_size(sym.section);
                if r.addend < 0 || r.addend as u64 > heap_size as u64 {
                    return Err(bad(format!("relocation {} addend {} outside {}", i, r.addend, sym.section.name())));
                }
                if !in_section(offset, 8, target_size) {
                    return Err(MclError::OutOfBounds { offset, len: 8 });
                }
                plan.addresses.push((fixup, heap, offset, r.addend as u64));
            }
            RelocationKind::VarCommandBuffer | RelocationKind::VarIndirect | RelocationKind::VarSurfaceState => {
                if sym.kind != SymbolKind::Variable || sym.value as usize >= n_vars {
                    return Err(bad(format!("relocation {} does not name a variable", i)));
                }
                let patch_size = r.addend;
                if patch_size <= 0 || !in_section(offset, patch_size as usize, target_size) {
                    return Err(bad(format!(
                        "variable site {}+{} outside {}",
                        offset,
                        patch_size,
                        r.target.name()
                    )));
                }
                let site = UsageSite::new(PatchSite::Unbound(offset), patch_size as usize);
                let usages = &mut plan.usages[sym.value as usize];
                match r.kind {
                    RelocationKind::VarCommandBuffer => usages.command_buffer.push(site),
                    RelocationKind::VarIndirect => usages.indirect.push(site),
                    _ => usages.surface_state.push(site),
                }
            }
            RelocationKind::WalkerCommand | RelocationKind::CrossThreadData => {
                if sym.kind != SymbolKind::Dispatch || sym.value as usize >= n_dispatches {
                    return Err(bad(format!("relocation {} does not name a dispatch", i)));
                }
                let d = sym.value as usize;
                let slot = if r.kind == RelocationKind::WalkerCommand {
                    if !in_section(offset, walker_size, target_size) {
                        return Err(MclError::OutOfBounds {
                            offset,
                            len: walker_size,
                        });
                    }
                    &mut plan.walkers[d]
                } else {
                    &mut plan.cross_thread[d]
                };
                if slot.replace(offset).is_some() {
                    return Err(bad(format!("dispatch {} has two {:?} relocations", d, r.kind)));
                }
            }
        }
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

fn check_variables(records: &[VarRecord], usages: &[Usages], cs_size: usize, walker_size: usize) -> Result<()> {
    for (i, (v, u)) in records.iter().zip(usages).enumerate() {
        for ch in &v.chunks {
            let heap_ok = ch.heap_usage.map_or(true, |h| h < u.indirect.len());
            let cmd_ok = ch.cmd_buffer_usage.map_or(true, |c| c < u.command_buffer.len());
            if !heap_ok || !cmd_ok {
                return Err(bad(format!("variable {} has a value chunk without a site", i)));
            }
        }
        match &v.body {
            VarBody::Slm(s) => {
                if let Some(n) = s.next {
                    let linked = records.get(n.index()).is_some_and(|r| {
                        r.ty == VariableType::SlmBuffer
                            && r.state != VariableState::Declared
                            && matches!(r.body, VarBody::Slm(_))
                    });
                    if !linked {
                        return Err(bad(format!("SLM variable {} links to non-SLM variable {}", i, n.0)));
                    }
                }
            }
            VarBody::Event {
                semaphore_waits,
                load_register_imms,
                store_data_imms,
                walkers,
                ..
            } => {
                let groups = [
                    (semaphore_waits, SEMAPHORE_WAIT_SIZE),
                    (load_register_imms, LOAD_REGISTER_IMM_SIZE),
                    (store_data_imms, STORE_DATA_IMM_SIZE),
                    (walkers, walker_size),
                ];
                for (offsets, len) in groups {
                    if let Some(o) = offsets.iter().find(|o| !in_section(**o, len, cs_size)) {
                        return Err(MclError::OutOfBounds { offset: *o, len });
                    }
                }
            }
            _ => {}
        }
    }
    check_slm_chains(records)
}

fn slm_next(record: &VarRecord) -> Option<VarId> {
    match &record.body {
        VarBody::Slm(s) => s.next,
        _ => None,
    }
}

/// Every SLM chain is a simple path: no shared successors and no loops.
fn check_slm_chains(records: &[VarRecord]) -> Result<()> {
    let mut has_pred = vec![false; records.len()];
    for (i, r) in records.iter().enumerate() {
        if let Some(n) = slm_next(r) {
            if std::mem::replace(&mut has_pred[n.index()], true) {
                return Err(bad(format!("SLM variable {} has two predecessors (second is {})", n.0, i)));
            }
        }
    }
    // a loop has no head, so anything not reached from a head is on one
    let mut reached = vec![false; records.len()];
    for head in (0..records.len()).filter(|i| !has_pred[*i]) {
        let mut cur = Some(head);
        while let Some(i) = cur {
            reached[i] = true;
            cur = slm_next(&records[i]).map(VarId::index);
        }
    }
    match reached.iter().position(|r| !r) {
        Some(i) => Err(bad(format!("SLM chain through variable {} loops", i))),
        None => Ok(()),
    }
}

fn build_variable(record: VarRecord, usages: Usages, layout: WalkerLayout) -> Variable {
    let state = match record.ty {
        VariableType::Buffer | VariableType::SignalEvent | VariableType::WaitEvent => {
            record.state.min(VariableState::Defined)
        }
        _ => record.state,
    };
    let payload = match (record.ty, record.body) {
        _ if state == VariableState::Declared => Payload::None,
        (VariableType::Buffer, _) => Payload::Buffer(BufferValue::default()),
        (_, VarBody::Value(last)) => Payload::Value(ValueState {
            chunks: record.chunks,
            last,
        }),
        (_, VarBody::Dims(d)) => Payload::Dims(d),
        (_, VarBody::Slm(s)) => Payload::Slm(s),
        (
            _,
            VarBody::Event {
                counter_based,
                semaphore_waits,
                load_register_imms,
                store_data_imms,
                walkers,
            },
        ) => Payload::Event(EventValue {
            counter_based,
            semaphore_waits: semaphore_waits.into_iter().map(MutableSemaphoreWait::new).collect(),
            load_register_imms: load_register_imms.into_iter().map(MutableLoadRegisterImm::new).collect(),
            store_data_imms: store_data_imms.into_iter().map(MutableStoreDataImm::new).collect(),
            walkers: walkers.into_iter().map(|o| MutableComputeWalker::new(o, layout)).collect(),
            ..Default::default()
        }),
        (_, VarBody::Empty) => Payload::None,
    };
    Variable::restore(
        record.name,
        record.ty,
        state,
        record.size,
        record.flags,
        record.temp_size,
        usages,
        payload,
    )
}

/// Decode `bytes` into a new command list whose heaps come from `allocator`.
pub(crate) fn decode(bytes: &[u8], mut config: CommandListConfig, allocator: Arc<dyn Allocator>) -> Result<CommandList> {
    let header = read_header(bytes)?;
    if let Some(missing) = SectionKind::ALL.iter().find(|k| header.section(**k).is_none()) {
        return Err(bad(format!("missing section {}", missing.name())));
    }
    let section = |k: SectionKind| header.section_bytes(bytes, k);

    let strtab = section(SectionKind::StringTable);
    let symbols = parse_symbols(section(SectionKind::SymbolTable))?;
    let var_records = parse_variables(section(SectionKind::Variables), strtab)?;
    let dispatch_records = parse_dispatches(section(SectionKind::Dispatches))?;
    let label_records = parse_labels(section(SectionKind::Labels), strtab)?;
    let table: KernelTable = serde_json::from_slice(section(SectionKind::Kernels))
        .map_err(|e| bad(format!("kernel table: {}", e)))?;

    config.walker = table.walker;
    config.validate()?;
    let layout = config.walker;

    let cs_size = section(SectionKind::CommandStream).len();
    let ih = section(SectionKind::Instruction);
    let ioh_size = section(SectionKind::IndirectObject).len();

    for kind in [SymbolKind::Variable, SymbolKind::Dispatch] {
        let expected = if kind == SymbolKind::Variable {
            var_records.len()
        } else {
            dispatch_records.len()
        };
        let n = symbols.iter().filter(|s| s.kind == kind).count();
        if n != expected {
            return Err(bad(format!("{} {:?} symbols for {} records", n, kind, expected)));
        }
    }

    let plan = plan_relocations(
        &parse_relocations(section(SectionKind::Relocations))?,
        &symbols,
        &header,
        var_records.len(),
        dispatch_records.len(),
        layout.size,
    )?;
    check_variables(&var_records, &plan.usages, cs_size, layout.size)?;

    let kernel_symbols: Vec<&Symbol> = symbols.iter().filter(|s| s.kind == SymbolKind::Kernel).collect();
    if kernel_symbols.len() != table.kernels.len() {
        return Err(bad(format!(
            "{} kernel symbols for {} kernels",
            kernel_symbols.len(),
            table.kernels.len()
        )));
    }
    let mut kernels = Vec::with_capacity(table.kernels.len());
    for (mut desc, sym) in table.kernels.into_iter().zip(kernel_symbols) {
        let (start, len) = (sym.value as usize, sym.size as usize);
        if !in_section(start, len, ih.len()) {
            return Err(bad(format!("ISA of kernel '{}' outside {}", desc.name, SectionKind::Instruction.name())));
        }
        desc.isa = ih[start..start + len].to_vec();
        desc.validate()?;
        kernels.push(KernelRecord {
            descriptor: Arc::new(desc),
            isa_offset: start,
        });
    }

    let mut placements = Vec::with_capacity(dispatch_records.len());
    for (i, d) in dispatch_records.iter().enumerate() {
        let kernel = kernels
            .get(d.kernel)
            .ok_or_else(|| bad(format!("dispatch {} uses unknown kernel {}", i, d.kernel)))?;
        let desc = &kernel.descriptor;
        let (Some(walker), Some(ctd)) = (plan.walkers[i], plan.cross_thread[i]) else {
            return Err(bad(format!("dispatch {} is missing its walker or cross-thread data", i)));
        };
        check_dispatch_sizes(desc, d.group_size, d.group_count, d.slm_args_size)?;
        let inline_size = if desc.pass_inline_data { layout.inline_data_size } else { 0 };
        if d.inline_size != inline_size {
            return Err(bad(format!("dispatch {} inline size {} != {}", i, d.inline_size, inline_size)));
        }
        let heap_ctd = desc.cross_thread_data_size.saturating_sub(inline_size);
        if !in_section(ctd, heap_ctd + d.per_thread_capacity, ioh_size) {
            return Err(MclError::OutOfBounds {
                offset: ctd,
                len: heap_ctd + d.per_thread_capacity,
            });
        }
        let typed = [
            (d.vars.group_size, VariableType::GroupSize),
            (d.vars.group_count, VariableType::GroupCount),
            (d.vars.global_offset, VariableType::GlobalOffset),
            (d.vars.last_slm, VariableType::SlmBuffer),
        ];
        for (var, ty) in typed {
            if let Some(v) = var {
                if var_records.get(v.index()).map(|r| r.ty) != Some(ty) {
                    return Err(bad(format!("dispatch {} expects variable {} to be {:?}", i, v.0, ty)));
                }
            }
        }
        placements.push((walker, ctd));
    }

    for l in &label_records {
        let set_ok = l.cs_offset.map_or(true, |o| o <= cs_size);
        let jumps_ok = l.pending.iter().all(|o| in_section(*o, BATCH_BUFFER_START_SIZE, cs_size));
        if !set_ok || !jumps_ok {
            return Err(bad(format!("label {:?} outside {}", l.name, SectionKind::CommandStream.name())));
        }
    }

    // Validated; from here on heaps are allocated.
    let capacity = |kind: SectionKind, configured: usize| configured.max(section(kind).len());
    let mut container = CommandContainer::allocate(
        allocator.as_ref(),
        capacity(SectionKind::CommandStream, config.command_stream_size),
        capacity(SectionKind::Instruction, config.instruction_heap_size),
        capacity(SectionKind::IndirectObject, config.indirect_heap_size),
        capacity(SectionKind::SurfaceState, config.surface_state_heap_size),
        capacity(SectionKind::Constants, config.constants_heap_size),
    )?;
    for kind in SectionKind::ALL {
        if let Some(heap) = kind.heap() {
            container.append(heap, section(kind))?;
        }
    }

    let mut fixups = Vec::with_capacity(plan.addresses.len());
    for (kind, heap, cs_offset, addend) in plan.addresses {
        let address = container.heap(heap).gpu_base() + addend;
        container
            .memory
            .write_u64(container.cs.address_of(cs_offset), address)?;
        fixups.push(AddressFixup { kind, cs_offset, heap });
    }

    let mut variables: Vec<Variable> = var_records
        .into_iter()
        .zip(plan.usages)
        .map(|(record, usages)| build_variable(record, usages, layout))
        .collect();

    let mut dispatches = Vec::with_capacity(dispatch_records.len());
    for (i, (d, (walker_offset, ctd))) in dispatch_records.into_iter().zip(placements).enumerate() {
        let kernel = &kernels[d.kernel];
        let desc = Arc::clone(&kernel.descriptor);
        let walker = MutableComputeWalker::new(walker_offset, layout);
        let inline_offset = desc.pass_inline_data.then(|| walker.inline_data_offset());
        let indirect = IndirectData::new(
            inline_offset,
            d.inline_size,
            ctd,
            desc.cross_thread_data_size,
            d.per_thread_capacity,
        );
        let isa_address = container.ih.gpu_address_of(kernel.isa_offset);
        let mut binding = DispatchBinding::new(
            desc,
            walker,
            indirect,
            isa_address,
            config.grf_size,
            d.vars,
            d.group_size,
            d.group_count,
            d.global_offset,
            d.slm_args_size,
        )?;
        binding.program(&mut container)?;
        let id = DispatchId(i as u32);
        for v in [d.vars.group_size, d.vars.group_count, d.vars.global_offset, d.vars.last_slm]
            .into_iter()
            .flatten()
        {
            variables[v.index()].add_dispatch(id);
        }
        debug!(dispatch = i, walker = walker_offset, ctd, "dispatch restored");
        dispatches.push(binding);
    }

    let labels = label_records
        .into_iter()
        .map(|l| {
            let address = l.cs_offset.map(|o| container.cs.gpu_address_of(o));
            Label::restore(l.name, address, l.pending)
        })
        .collect();

    info!(
        bytes = bytes.len(),
        variables = variables.len(),
        dispatches = dispatches.len(),
        kernels = kernels.len(),
        "decoded command list"
    );
    CommandList::from_parts(
        config,
        allocator,
        container,
        Parts {
            variables,
            labels,
            dispatches,
            kernels,
            fixups,
            closed: header.flags & FLAG_CLOSED != 0,
        },
    )
}
