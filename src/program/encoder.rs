//! Serialize a command list into a position-independent container.
//!
//! Heap images are copied verbatim, then every address the list can
//! relocate or rebind is zeroed and described by a relocation: base
//! addresses, jumps, walker heap pointers, buffer-variable sites and the
//! addresses of event-variable commands.

use std::collections::HashMap;

use tracing::{debug, info};

use super::{
    KernelTable, Relocation, RelocationKind, SectionKind, Symbol, SymbolKind, BASE_ADDRESS_SYMBOLS,
    DISPATCH_RECORD_SIZE, FLAG_CLOSED, HEADER_SIZE, MCL_MAGIC, MCL_VERSION, NONE, RELOCATION_SIZE,
    SECTION_ALIGNMENT, SECTION_ENTRY_SIZE, SYMBOL_SIZE,
};
use crate::cmdlist::{CommandList, FixupKind, BASE_ADDRESS_HEAPS};
use crate::commands::{SEMAPHORE_WAIT_ADDRESS_OFFSET, STORE_DATA_IMM_ADDRESS_OFFSET};
use crate::error::{MclError, Result};
use crate::kernel::KernelDescriptor;
use crate::memory::{align_up, CommandContainer, HeapKind};
use crate::variable::{Payload, Variable, VariableType};

const HEAPS: [HeapKind; 5] = [
    HeapKind::CommandStream,
    HeapKind::Instruction,
    HeapKind::IndirectObject,
    HeapKind::SurfaceState,
    HeapKind::Constants,
];

/// Copies of the used part of every heap.
struct Images {
    heaps: Vec<(HeapKind, Vec<u8>)>,
}

impl Images {
    fn capture(c: &CommandContainer) -> Self {
        Self {
            heaps: HEAPS.iter().map(|h| (*h, c.heap_bytes(*h).to_vec())).collect(),
        }
    }

    fn get(&self, heap: HeapKind) -> &[u8] {
        self.heaps
            .iter()
            .find(|(h, _)| *h == heap)
            .map_or(&[][..], |(_, b)| b.as_slice())
    }

    fn get_mut(&mut self, heap: HeapKind) -> Result<&mut Vec<u8>> {
        self.heaps
            .iter_mut()
            .find(|(h, _)| *h == heap)
            .map(|(_, b)| b)
            .ok_or_else(|| MclError::Encode(format!("no image for {:?}", heap)))
    }

    fn put(&mut self, heap: HeapKind, offset: usize, bytes: &[u8]) -> Result<()> {
        let image = self.get_mut(heap)?;
        let dst = image
            .get_mut(offset..offset + bytes.len())
            .ok_or(MclError::OutOfBounds {
                offset,
                len: bytes.len(),
            })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn zero(&mut self, heap: HeapKind, offset: usize, len: usize) -> Result<()> {
        self.put(heap, offset, &vec![0u8; len])
    }

    fn read_u64(&self, heap: HeapKind, offset: usize) -> Result<u64> {
        let b: [u8; 8] = self
            .get(heap)
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or(MclError::OutOfBounds { offset, len: 8 })?;
        Ok(u64::from_le_bytes(b))
    }
}

/// NUL-terminated strings; offset 0 is the empty string.
struct StringTable {
    bytes: Vec<u8>,
    index: HashMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        Self {
            bytes: vec![0],
            index: HashMap::new(),
        }
    }

    fn add(&mut self, s: &str) -> u32 {
        if let Some(offset) = self.index.get(s) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.index.insert(s.to_string(), offset);
        offset
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_opt(out: &mut Vec<u8>, v: Option<u32>) {
    put_u32(out, v.unwrap_or(NONE));
}

fn put_dims(out: &mut Vec<u8>, d: [u32; 3]) {
    for v in d {
        put_u32(out, v);
    }
}

fn put_offsets(out: &mut Vec<u8>, offsets: impl ExactSizeIterator<Item = usize>) {
    put_u32(out, offsets.len() as u32);
    for o in offsets {
        put_u64(out, o as u64);
    }
}

struct Encoder<'a> {
    list: &'a CommandList,
    images: Images,
    strtab: StringTable,
    symbols: Vec<Symbol>,
    relocations: Vec<Relocation>,
}

impl<'a> Encoder<'a> {
    fn symbol(&mut self, name: Option<&str>, kind: SymbolKind, section: SectionKind, value: u64, size: u64) -> u32 {
        let name = name.map_or(NONE, |n| self.strtab.add(n));
        self.symbols.push(Symbol {
            name,
            kind,
            section,
            value,
            size,
        });
        (self.symbols.len() - 1) as u32
    }

    fn relocate(&mut self, kind: RelocationKind, symbol: u32, offset: usize, addend: i64) {
        self.relocations.push(Relocation {
            target: kind.target(),
            kind,
            symbol,
            offset: offset as u64,
            addend,
        });
    }

    /// Section symbols of the heaps plus the base-address symbols.
    fn heap_symbols(&mut self) -> (HashMap<HeapKind, u32>, [u32; 4]) {
        let mut sections = HashMap::new();
        for heap in HEAPS {
            let kind = SectionKind::of_heap(heap);
            let size = self.images.get(heap).len() as u64;
            let sym = self.symbol(Some(kind.name()), SymbolKind::Section, kind, 0, size);
            sections.insert(heap, sym);
        }
        let mut bases = [0u32; 4];
        for (i, heap) in BASE_ADDRESS_HEAPS.iter().enumerate() {
            bases[i] = self.symbol(
                Some(BASE_ADDRESS_SYMBOLS[i]),
                SymbolKind::BaseAddress,
                SectionKind::of_heap(*heap),
                0,
                0,
            );
        }
        (sections, bases)
    }

    fn fixups(&mut self, sections: &HashMap<HeapKind, u32>, bases: &[u32; 4]) -> Result<()> {
        let list = self.list;
        let c = list.container();
        for f in list.fixups() {
            let value = self.images.read_u64(HeapKind::CommandStream, f.cs_offset)?;
            let addend = value.wrapping_sub(c.heap(f.heap).gpu_base()) as i64;
            self.images.zero(HeapKind::CommandStream, f.cs_offset, 8)?;
            let (kind, symbol) = match f.kind {
                FixupKind::BaseAddress => {
                    let i = BASE_ADDRESS_HEAPS
                        .iter()
                        .position(|h| *h == f.heap)
                        .ok_or_else(|| MclError::Encode(format!("{:?} has no base address", f.heap)))?;
                    (RelocationKind::BaseAddress, bases[i])
                }
                FixupKind::Address64 => {
                    let sym = sections
                        .get(&f.heap)
                        .copied()
                        .ok_or_else(|| MclError::Encode(format!("no section symbol for {:?}", f.heap)))?;
                    (RelocationKind::Address64, sym)
                }
            };
            self.relocate(kind, symbol, f.cs_offset, addend);
        }
        Ok(())
    }

    fn variable(&mut self, index: usize, v: &Variable, out: &mut Vec<u8>) -> Result<()> {
        let list = self.list;
        let c = list.container();
        let sym = self.symbol(
            v.name(),
            SymbolKind::Variable,
            SectionKind::Variables,
            index as u64,
            v.size() as u64,
        );
        let sites = [
            (RelocationKind::VarCommandBuffer, HeapKind::CommandStream, &v.usages().command_buffer),
            (RelocationKind::VarIndirect, HeapKind::IndirectObject, &v.usages().indirect),
            (RelocationKind::VarSurfaceState, HeapKind::SurfaceState, &v.usages().surface_state),
        ];
        let zero_sites = v.is_type(VariableType::Buffer);
        for (kind, heap, usages) in sites {
            for u in usages {
                let offset = u.site.heap_offset(c.heap(heap)).ok_or_else(|| {
                    MclError::Encode(format!("variable {:?} has a site outside {:?}", v.name(), heap))
                })?;
                self.relocate(kind, sym, offset, u.patch_size as i64);
                if zero_sites {
                    self.images.zero(heap, offset, u.patch_size)?;
                }
            }
        }
        if let Some(ev) = v.event() {
            let cs = HeapKind::CommandStream;
            for sem in &ev.semaphore_waits {
                if let Some(saved) = sem.saved() {
                    self.images.put(cs, sem.offset(), saved)?;
                }
                self.images.zero(cs, sem.offset() + SEMAPHORE_WAIT_ADDRESS_OFFSET, 8)?;
            }
            for lri in &ev.load_register_imms {
                if let Some(saved) = lri.saved() {
                    self.images.put(cs, lri.offset(), saved)?;
                }
            }
            for sdi in &ev.store_data_imms {
                self.images.zero(cs, sdi.offset() + STORE_DATA_IMM_ADDRESS_OFFSET, 8)?;
            }
            for w in &ev.walkers {
                self.images.zero(cs, w.field_offset(w.layout().post_sync_address), 8)?;
            }
        }

        put_u32(out, v.name().map_or(NONE, |n| self.strtab.add(n)));
        out.extend_from_slice(&[v.var_type().code(), v.state().code(), v.flags().bits(), 0]);
        put_u32(out, v.size() as u32);
        put_u32(out, v.temp_size() as u32);
        let chunks = v.value().map_or(&[][..], |s| s.chunks.as_slice());
        put_u32(out, chunks.len() as u32);
        for ch in chunks {
            put_u32(out, ch.source_offset as u32);
            put_u32(out, ch.size as u32);
            put_opt(out, ch.heap_usage.map(|i| i as u32));
            put_opt(out, ch.cmd_buffer_usage.map(|i| i as u32));
        }
        match v.var_type() {
            VariableType::Value => {
                let last = v.value().map_or(&[][..], |s| s.last.as_slice());
                put_u32(out, last.len() as u32);
                out.extend_from_slice(last);
            }
            VariableType::GroupSize | VariableType::GroupCount | VariableType::GlobalOffset => {
                put_dims(out, v.dims().unwrap_or_default());
            }
            VariableType::SlmBuffer => {
                let s = v.slm().copied().unwrap_or_default();
                put_u32(out, s.size);
                put_u32(out, s.offset);
                put_u32(out, s.alignment);
                put_opt(out, s.next.map(|n| n.0));
            }
            VariableType::SignalEvent | VariableType::WaitEvent => {
                let Payload::Event(ev) = v.payload() else {
                    return Err(MclError::Encode(format!("event variable {:?} without event state", v.name())));
                };
                put_u32(out, ev.counter_based as u32);
                put_offsets(out, ev.semaphore_waits.iter().map(|s| s.offset()));
                put_offsets(out, ev.load_register_imms.iter().map(|l| l.offset()));
                put_offsets(out, ev.store_data_imms.iter().map(|s| s.offset()));
                put_offsets(out, ev.walkers.iter().map(|w| w.offset()));
            }
            VariableType::Buffer | VariableType::None => {}
        }
        Ok(())
    }

    fn dispatches(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let list = self.list;
        for (i, b) in list.dispatches().iter().enumerate() {
            let kernel = list
                .kernels()
                .iter()
                .position(|k| k.descriptor == *b.kernel())
                .ok_or_else(|| MclError::Encode(format!("dispatch {} has no kernel record", i)))?;
            let sym = self.symbol(
                Some(b.kernel().name.as_str()),
                SymbolKind::Dispatch,
                SectionKind::Dispatches,
                i as u64,
                0,
            );
            self.relocate(RelocationKind::WalkerCommand, sym, b.walker().offset(), 0);
            self.relocate(RelocationKind::CrossThreadData, sym, b.indirect().heap_offset(), 0);

            let start = out.len();
            put_u32(out, kernel as u32);
            put_dims(out, b.group_size());
            put_dims(out, b.group_count());
            put_dims(out, b.global_offset());
            put_u32(out, b.slm_total_size() - b.kernel().slm_inline_size);
            let vars = b.variables();
            for v in [vars.group_size, vars.group_count, vars.global_offset, vars.last_slm] {
                put_opt(out, v.map(|v| v.0));
            }
            put_u32(out, b.indirect().inline_size() as u32);
            put_u32(out, b.indirect().per_thread_capacity() as u32);
            debug_assert_eq!(out.len() - start, DISPATCH_RECORD_SIZE);
        }
        Ok(())
    }

    fn kernels(&mut self) -> Result<Vec<u8>> {
        let list = self.list;
        let mut table = KernelTable {
            walker: list.config().walker,
            kernels: Vec::new(),
        };
        for k in list.kernels() {
            self.symbol(
                Some(k.descriptor.name.as_str()),
                SymbolKind::Kernel,
                SectionKind::Instruction,
                k.isa_offset as u64,
                k.descriptor.isa.len() as u64,
            );
            table.kernels.push(KernelDescriptor {
                isa: Vec::new(),
                ..(*k.descriptor).clone()
            });
        }
        serde_json::to_vec(&table).map_err(|e| MclError::Encode(format!("kernel table: {}", e)))
    }

    fn labels(&mut self) -> Vec<u8> {
        let list = self.list;
        let cs_base = list.container().cs.gpu_base();
        let mut out = Vec::new();
        for l in list.labels() {
            put_u32(&mut out, l.name().map_or(NONE, |n| self.strtab.add(n)));
            put_u32(&mut out, l.is_set() as u32);
            put_u64(&mut out, l.address().map_or(u64::MAX, |a| a - cs_base));
            put_offsets(&mut out, l.pending_jumps().iter().copied());
        }
        out
    }
}

/// Encode `list` into a fresh container.
pub(crate) fn encode(list: &CommandList) -> Result<Vec<u8>> {
    let mut enc = Encoder {
        list,
        images: Images::capture(list.container()),
        strtab: StringTable::new(),
        symbols: Vec::new(),
        relocations: Vec::new(),
    };

    let (sections, bases) = enc.heap_symbols();
    enc.fixups(&sections, &bases)?;

    let mut vars = Vec::new();
    for (i, v) in list.variables().iter().enumerate() {
        enc.variable(i, v, &mut vars)?;
    }
    let mut dispatches = Vec::new();
    enc.dispatches(&mut dispatches)?;
    let kernels = enc.kernels()?;
    let labels = enc.labels();

    let mut symtab = Vec::with_capacity(enc.symbols.len() * SYMBOL_SIZE);
    for s in &enc.symbols {
        put_u32(&mut symtab, s.name);
        symtab.push(s.kind.code());
        symtab.push(s.section.code() as u8);
        symtab.extend_from_slice(&0u16.to_le_bytes());
        put_u64(&mut symtab, s.value);
        put_u64(&mut symtab, s.size);
    }
    let mut rela = Vec::with_capacity(enc.relocations.len() * RELOCATION_SIZE);
    for r in &enc.relocations {
        put_u32(&mut rela, r.target.code());
        put_u32(&mut rela, r.kind.code());
        put_u32(&mut rela, r.symbol);
        put_u32(&mut rela, 0);
        put_u64(&mut rela, r.offset);
        rela.extend_from_slice(&r.addend.to_le_bytes());
    }

    let n_symbols = enc.symbols.len();
    let n_relocations = enc.relocations.len();
    let Encoder { images, strtab, .. } = enc;
    let mut body: Vec<(SectionKind, u32, Vec<u8>)> = images
        .heaps
        .into_iter()
        .map(|(heap, bytes)| (SectionKind::of_heap(heap), 0, bytes))
        .collect();
    body.extend([
        (SectionKind::Variables, 0, vars),
        (SectionKind::Dispatches, DISPATCH_RECORD_SIZE as u32, dispatches),
        (SectionKind::Kernels, 0, kernels),
        (SectionKind::Labels, 0, labels),
        (SectionKind::StringTable, 0, strtab.bytes),
        (SectionKind::SymbolTable, SYMBOL_SIZE as u32, symtab),
        (SectionKind::Relocations, RELOCATION_SIZE as u32, rela),
    ]);

    let mut out = Vec::new();
    put_u32(&mut out, MCL_MAGIC);
    put_u32(&mut out, MCL_VERSION);
    put_u32(&mut out, body.len() as u32);
    put_u32(&mut out, if list.is_closed() { FLAG_CLOSED } else { 0 });

    let mut offset = align_up(HEADER_SIZE + body.len() * SECTION_ENTRY_SIZE, SECTION_ALIGNMENT);
    for (kind, entry_size, bytes) in &body {
        put_u32(&mut out, kind.code());
        put_u32(&mut out, *entry_size);
        put_u64(&mut out, offset as u64);
        put_u64(&mut out, bytes.len() as u64);
        debug!(section = kind.name(), offset, size = bytes.len(), "section");
        offset = align_up(offset + bytes.len(), SECTION_ALIGNMENT);
    }
    for (_, _, bytes) in &body {
        out.resize(align_up(out.len(), SECTION_ALIGNMENT), 0);
        out.extend_from_slice(bytes);
    }

    info!(
        bytes = out.len(),
        variables = list.variables().len(),
        dispatches = list.dispatches().len(),
        symbols = n_symbols,
        relocations = n_relocations,
        "encoded command list"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::cmdlist::tests::new_list;
    use crate::cmdlist::LaunchParams;
    use crate::kernel::fixtures::sample_kernel;
    use crate::kernel::Kernel;
    use crate::memory::AllocationKind;
    use crate::program::{read_header, RelocationKind, SectionKind, RELOCATION_SIZE};
    use crate::variable::ArgValue;

    fn sample() -> Kernel {
        let mut k = Kernel::new(Arc::new(sample_kernel()));
        k.set_group_size([8, 8, 1]).unwrap();
        k
    }

    fn rela_kinds(bytes: &[u8]) -> Vec<u32> {
        let h = read_header(bytes).unwrap();
        h.section_bytes(bytes, SectionKind::Relocations)
            .chunks(RELOCATION_SIZE)
            .map(|r| u32::from_le_bytes([r[4], r[5], r[6], r[7]]))
            .collect()
    }

    #[test]
    fn test_base_addresses_zeroed_and_relocated() {
        let (mut list, _) = new_list();
        let fixups = list.fixups().to_vec();
        let bytes = list.get_native_binary().unwrap().to_vec();
        let h = read_header(&bytes).unwrap();
        let cs = h.section_bytes(&bytes, SectionKind::CommandStream);
        for f in fixups {
            assert_eq!(&cs[f.cs_offset..f.cs_offset + 8], &[0u8; 8]);
        }
        let kinds = rela_kinds(&bytes);
        let base = RelocationKind::BaseAddress.code();
        assert_eq!(kinds.iter().filter(|k| **k == base).count(), 4);
    }

    #[test]
    fn test_buffer_sites_zeroed_value_sites_kept() {
        let (mut list, table) = new_list();
        table.register_host_range(0x7000_0000, 4096, AllocationKind::Buffer);
        let mut k = sample();
        let buf = list.get_variable("buf").unwrap();
        let val = list.get_variable("val").unwrap();
        list.set_kernel_arg_variable(&mut k, 0, buf).unwrap();
        list.set_kernel_arg_variable(&mut k, 1, val).unwrap();
        list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();
        list.set_variable_value(buf, 8, 0, ArgValue::Pointer(Some(0x7000_0000)))
            .unwrap();
        list.set_variable_value(val, 16, 0, ArgValue::Bytes(&[7; 16])).unwrap();

        let buf_site = list.variable(buf).unwrap().usages().command_buffer[0].site;
        let val_site = list.variable(val).unwrap().usages().command_buffer[0].site;
        let cs_heap = &list.container().cs;
        let buf_off = buf_site.heap_offset(cs_heap).unwrap();
        let val_off = val_site.heap_offset(cs_heap).unwrap();

        let bytes = list.get_native_binary().unwrap().to_vec();
        let h = read_header(&bytes).unwrap();
        let cs = h.section_bytes(&bytes, SectionKind::CommandStream);
        assert_eq!(&cs[buf_off..buf_off + 8], &[0u8; 8]);
        assert_eq!(&cs[val_off..val_off + 4], &[7, 7, 7, 7]);

        let kinds = rela_kinds(&bytes);
        let walker = RelocationKind::WalkerCommand.code();
        assert_eq!(kinds.iter().filter(|k| **k == walker).count(), 1);
        let ss = RelocationKind::VarSurfaceState.code();
        assert_eq!(kinds.iter().filter(|k| **k == ss).count(), 1);
    }

    #[test]
    fn test_native_binary_cached_until_change() {
        let (mut list, _) = new_list();
        let mut k = sample();
        let val = list.get_variable("val").unwrap();
        list.set_kernel_arg_variable(&mut k, 1, val).unwrap();
        list.append_launch_kernel(&k, &LaunchParams::new([1, 1, 1])).unwrap();

        let first = list.get_native_binary().unwrap().as_ptr();
        let again = list.get_native_binary().unwrap().as_ptr();
        assert_eq!(first, again);
        let before = list.get_native_binary().unwrap().to_vec();

        list.set_variable_value(val, 4, 0, ArgValue::Bytes(&[1, 2, 3, 4])).unwrap();
        let after = list.get_native_binary().unwrap().to_vec();
        assert_ne!(before, after);
    }
}
