//! Portable command-list container: header, section table, sections.

pub mod decoder;
pub mod encoder;

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cmdlist::CommandList;
use crate::config::CommandListConfig;
use crate::error::{MclError, Result};
use crate::kernel::KernelDescriptor;
use crate::memory::{Allocator, HeapKind};
use crate::walker::WalkerLayout;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Container magic: ASCII "MCLB" as a little-endian u32.
pub const MCL_MAGIC: u32 = 0x424C_434D;

pub const MCL_VERSION: u32 = 1;

/// magic, version, section count, flags
pub const HEADER_SIZE: usize = 16;

/// kind, entry size, offset, size
pub const SECTION_ENTRY_SIZE: usize = 24;

pub const SYMBOL_SIZE: usize = 24;
pub const RELOCATION_SIZE: usize = 32;
pub const DISPATCH_RECORD_SIZE: usize = 68;

/// Header flag: the list was closed when encoded.
pub const FLAG_CLOSED: u32 = 1;

/// Absent index / offset.
pub const NONE: u32 = u32::MAX;

/// Sections start on this boundary.
pub const SECTION_ALIGNMENT: usize = 8;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectionKind {
    CommandStream,
    Instruction,
    IndirectObject,
    SurfaceState,
    Constants,
    Variables,
    StringTable,
    SymbolTable,
    Relocations,
    Dispatches,
    Kernels,
    Labels,
}

impl SectionKind {
    pub const ALL: [SectionKind; 12] = [
        Self::CommandStream,
        Self::Instruction,
        Self::IndirectObject,
        Self::SurfaceState,
        Self::Constants,
        Self::Variables,
        Self::StringTable,
        Self::SymbolTable,
        Self::Relocations,
        Self::Dispatches,
        Self::Kernels,
        Self::Labels,
    ];

    pub fn code(self) -> u32 {
        match self {
            Self::CommandStream => 1,
            Self::Instruction => 2,
            Self::IndirectObject => 3,
            Self::SurfaceState => 4,
            Self::Constants => 5,
            Self::Variables => 6,
            Self::StringTable => 7,
            Self::SymbolTable => 8,
            Self::Relocations => 9,
            Self::Dispatches => 10,
            Self::Kernels => 11,
            Self::Labels => 12,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.code() == code)
            .ok_or_else(|| MclError::Decode(format!("unknown section kind {}", code)))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CommandStream => ".cs",
            Self::Instruction => ".ih",
            Self::IndirectObject => ".ioh",
            Self::SurfaceState => ".ssh",
            Self::Constants => ".consts",
            Self::Variables => ".vars",
            Self::StringTable => ".strtab",
            Self::SymbolTable => ".symtab",
            Self::Relocations => ".rela",
            Self::Dispatches => ".dispatch",
            Self::Kernels => ".kernels",
            Self::Labels => ".labels",
        }
    }

    /// The heap a section carries, if it is a heap image.
    pub fn heap(self) -> Option<HeapKind> {
        match self {
            Self::CommandStream => Some(HeapKind::CommandStream),
            Self::Instruction => Some(HeapKind::Instruction),
            Self::IndirectObject => Some(HeapKind::IndirectObject),
            Self::SurfaceState => Some(HeapKind::SurfaceState),
            Self::Constants => Some(HeapKind::Constants),
            _ => None,
        }
    }

    pub fn of_heap(heap: HeapKind) -> Self {
        match heap {
            HeapKind::CommandStream => Self::CommandStream,
            HeapKind::Instruction => Self::Instruction,
            HeapKind::IndirectObject => Self::IndirectObject,
            HeapKind::SurfaceState => Self::SurfaceState,
            HeapKind::Constants => Self::Constants,
        }
    }
}

/// One entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionEntry {
    pub kind: SectionKind,
    /// Size of one fixed-size record, 0 for byte or variable-length sections.
    pub entry_size: u32,
    pub offset: u64,
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Symbols and relocations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    /// Start of a heap section.
    Section,
    /// A STATE_BASE_ADDRESS base (`__gsba`, `__isba`, `__iohba`, `__ssba`).
    BaseAddress,
    /// `value` is the variable index.
    Variable,
    /// `value` is the dispatch index.
    Dispatch,
    /// `value` is the ISA offset in the instruction heap, `size` its length.
    Kernel,
}

impl SymbolKind {
    pub fn code(self) -> u8 {
        match self {
            Self::Section => 0,
            Self::BaseAddress => 1,
            Self::Variable => 2,
            Self::Dispatch => 3,
            Self::Kernel => 4,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Section,
            1 => Self::BaseAddress,
            2 => Self::Variable,
            3 => Self::Dispatch,
            4 => Self::Kernel,
            _ => return Err(MclError::Decode(format!("unknown symbol kind {}", code))),
        })
    }
}

/// Names of the base-address symbols, in STATE_BASE_ADDRESS field order.
pub const BASE_ADDRESS_SYMBOLS: [&str; 4] = ["__gsba", "__isba", "__iohba", "__ssba"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// String-table offset, [`NONE`] for anonymous symbols.
    pub name: u32,
    pub kind: SymbolKind,
    pub section: SectionKind,
    pub value: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelocationKind {
    /// 64-bit address into the symbol's heap: write `base + addend`.
    Address64,
    /// A STATE_BASE_ADDRESS field: write `base + addend`.
    BaseAddress,
    /// Variable site in the command stream; `addend` is the patch size.
    VarCommandBuffer,
    /// Variable site in the indirect-object heap; `addend` is the patch size.
    VarIndirect,
    /// Variable surface state; `addend` is the patch size.
    VarSurfaceState,
    /// Command-stream offset of a dispatch's walker.
    WalkerCommand,
    /// Indirect-object-heap offset of a dispatch's cross-thread data.
    CrossThreadData,
}

impl RelocationKind {
    pub fn code(self) -> u32 {
        match self {
            Self::Address64 => 1,
            Self::BaseAddress => 2,
            Self::VarCommandBuffer => 3,
            Self::VarIndirect => 4,
            Self::VarSurfaceState => 5,
            Self::WalkerCommand => 6,
            Self::CrossThreadData => 7,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => Self::Address64,
            2 => Self::BaseAddress,
            3 => Self::VarCommandBuffer,
            4 => Self::VarIndirect,
            5 => Self::VarSurfaceState,
            6 => Self::WalkerCommand,
            7 => Self::CrossThreadData,
            _ => return Err(MclError::Decode(format!("unknown relocation kind {}", code))),
        })
    }

    /// Section the relocation must target.
    pub fn target(self) -> SectionKind {
        match self {
            Self::Address64 | Self::BaseAddress | Self::VarCommandBuffer | Self::WalkerCommand => {
                SectionKind::CommandStream
            }
            Self::VarIndirect | Self::CrossThreadData => SectionKind::IndirectObject,
            Self::VarSurfaceState => SectionKind::SurfaceState,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub target: SectionKind,
    pub kind: RelocationKind,
    /// Symbol-table index.
    pub symbol: u32,
    pub offset: u64,
    pub addend: i64,
}

/// Contents of the kernels section. ISA bytes live in the instruction heap
/// and are restored through the kernel symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelTable {
    pub walker: WalkerLayout,
    pub kernels: Vec<KernelDescriptor>,
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Parsed container header.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerHeader {
    pub version: u32,
    pub flags: u32,
    pub sections: Vec<SectionEntry>,
}

impl ContainerHeader {
    pub fn section(&self, kind: SectionKind) -> Option<&SectionEntry> {
        self.sections.iter().find(|s| s.kind == kind)
    }

    /// Bytes of section `kind`; absent sections read as empty.
    pub fn section_bytes<'a>(&self, bytes: &'a [u8], kind: SectionKind) -> &'a [u8] {
        match self.section(kind) {
            Some(s) => &bytes[s.offset as usize..(s.offset + s.size) as usize],
            None => &[],
        }
    }
}

/// Read and validate the header and section table of a container.
pub fn read_header(bytes: &[u8]) -> Result<ContainerHeader> {
    let mut r = bytes;
    let magic = read_u32(&mut r)?;
    if magic != MCL_MAGIC {
        return Err(MclError::Decode(format!(
            "bad magic: expected 0x{:08X}, got 0x{:08X}",
            MCL_MAGIC, magic
        )));
    }
    let version = read_u32(&mut r)?;
    if version != MCL_VERSION {
        return Err(MclError::Decode(format!("unsupported version {}", version)));
    }
    let n_sections = read_u32(&mut r)? as usize;
    let flags = read_u32(&mut r)?;
    if n_sections > SectionKind::ALL.len() {
        return Err(MclError::Decode(format!("{} sections is too many", n_sections)));
    }

    let mut sections: Vec<SectionEntry> = Vec::with_capacity(n_sections);
    for _ in 0..n_sections {
        let kind = SectionKind::from_code(read_u32(&mut r)?)?;
        let entry_size = read_u32(&mut r)?;
        let offset = read_u64(&mut r)?;
        let size = read_u64(&mut r)?;
        let in_range = matches!(offset.checked_add(size), Some(end) if end <= bytes.len() as u64);
        if !in_range {
            return Err(MclError::Decode(format!(
                "section {} at {}+{} exceeds container ({} bytes)",
                kind.name(),
                offset,
                size,
                bytes.len()
            )));
        }
        if sections.iter().any(|s| s.kind == kind) {
            return Err(MclError::Decode(format!("duplicate section {}", kind.name())));
        }
        if entry_size != 0 && size % entry_size as u64 != 0 {
            return Err(MclError::Decode(format!(
                "section {} size {} is not a multiple of {}",
                kind.name(),
                size,
                entry_size
            )));
        }
        sections.push(SectionEntry {
            kind,
            entry_size,
            offset,
            size,
        });
    }
    Ok(ContainerHeader {
        version,
        flags,
        sections,
    })
}

/// Map a container file and rebuild the command list it holds.
pub fn load_from_file(
    path: impl AsRef<Path>,
    config: CommandListConfig,
    allocator: Arc<dyn Allocator>,
) -> Result<CommandList> {
    let path = path.as_ref();
    info!("loading command list: {}", path.display());
    let file = File::open(path)?;
    // SAFETY: the file stays open for the lifetime of the map and we only
    // read from it. Concurrent modification by another process is undefined
    // behaviour, which we accept for a read-only loader.
    let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };
    CommandList::load_from_binary(&mmap, config, allocator)
}

// ---------------------------------------------------------------------------
// Binary reader helpers
// ---------------------------------------------------------------------------

fn truncated(what: &str) -> MclError {
    MclError::Decode(format!("truncated {}", what))
}

/// Read a little-endian u8.
pub(crate) fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).map_err(|_| truncated("u8"))?;
    Ok(buf[0])
}

/// Read a little-endian u16.
pub(crate) fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).map_err(|_| truncated("u16"))?;
    Ok(u16::from_le_bytes(buf))
}

/// Read a little-endian u32.
pub(crate) fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(|_| truncated("u32"))?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian u64.
pub(crate) fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| truncated("u64"))?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a little-endian i64.
pub(crate) fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).map_err(|_| truncated("i64"))?;
    Ok(i64::from_le_bytes(buf))
}

/// Read `len` raw bytes.
pub(crate) fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|_| truncated("byte string"))?;
    Ok(buf)
}

/// `u32` index field, [`NONE`] mapping to `None`.
pub(crate) fn optional(v: u32) -> Option<u32> {
    (v != NONE).then_some(v)
}
