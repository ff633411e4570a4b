//! Kernel metadata: argument layout inside cross-thread data and the
//! offsets of the implicit dispatch arguments.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{MclError, Result};
use crate::variable::VarId;

/// Memory space a pointer argument addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSpace {
    Global,
    Constant,
    /// Shared local memory; the argument carries an SLM offset, not an address.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerArg {
    pub address_space: AddressSpace,
    /// Cross-thread offset of the 64-bit stateless address.
    pub stateless: Option<u16>,
    /// Surface-state-heap offset of the buffer's surface descriptor.
    pub bindful: Option<u16>,
    /// Cross-thread offset of the 32-bit SLM offset (local pointers).
    pub slm_offset: Option<u16>,
    pub required_slm_alignment: u32,
}

/// One contiguous piece of a by-value argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueElement {
    /// Cross-thread offset.
    pub offset: u16,
    pub size: u16,
    /// Offset inside the caller's payload.
    pub source_offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueArg {
    pub elements: Vec<ValueElement>,
}

impl ValueArg {
    /// Bytes of caller payload the argument spans.
    pub fn extent(&self) -> usize {
        self.elements
            .iter()
            .map(|e| e.source_offset as usize + e.size as usize)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgDescriptor {
    Pointer(PointerArg),
    Value(ValueArg),
}

impl ArgDescriptor {
    pub fn is_slm(&self) -> bool {
        matches!(self, Self::Pointer(p) if p.address_space == AddressSpace::Local)
    }
}

/// Cross-thread offsets of the implicit arguments a dispatch maintains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchTraits {
    pub local_work_size: Option<u16>,
    pub local_work_size2: Option<u16>,
    pub enqueued_local_work_size: Option<u16>,
    pub num_work_groups: Option<u16>,
    pub global_work_size: Option<u16>,
    pub global_work_offset: Option<u16>,
    pub work_dim: Option<u16>,
}

impl DispatchTraits {
    /// All present `(offset, byte length)` pairs.
    pub fn fields(&self) -> Vec<(u16, usize)> {
        let dims = [
            self.local_work_size,
            self.local_work_size2,
            self.enqueued_local_work_size,
            self.num_work_groups,
            self.global_work_size,
            self.global_work_offset,
        ];
        let mut out: Vec<(u16, usize)> = dims.iter().flatten().map(|o| (*o, 12)).collect();
        if let Some(o) = self.work_dim {
            out.push((o, 4));
        }
        out
    }
}

/// Compiled-kernel metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub name: String,
    pub isa: Vec<u8>,
    pub simd_size: u32,
    pub grf_count: u32,
    pub cross_thread_data_size: usize,
    /// The first cross-thread bytes travel in the walker's inline data.
    pub pass_inline_data: bool,
    pub num_local_id_channels: u32,
    pub skip_per_thread_data_load: u32,
    pub slm_inline_size: u32,
    pub args: Vec<ArgDescriptor>,
    pub dispatch_traits: DispatchTraits,
}

impl KernelDescriptor {
    pub fn argument_at(&self, index: usize) -> Result<&ArgDescriptor> {
        self.args.get(index).ok_or_else(|| {
            MclError::InvalidArgument(format!(
                "kernel '{}' has {} arguments, index {} requested",
                self.name,
                self.args.len(),
                index
            ))
        })
    }

    /// Check that every recorded offset lies inside cross-thread data.
    pub fn validate(&self) -> Result<()> {
        if !self.simd_size.is_power_of_two() {
            return Err(MclError::InvalidArgument(format!(
                "kernel '{}': SIMD size {} is not a power of two",
                self.name, self.simd_size
            )));
        }
        let ctd = self.cross_thread_data_size;
        let check = |what: &str, offset: usize, len: usize| -> Result<()> {
            if offset + len > ctd {
                return Err(MclError::InvalidArgument(format!(
                    "kernel '{}': {} at {}+{} exceeds cross-thread data ({} bytes)",
                    self.name, what, offset, len, ctd
                )));
            }
            Ok(())
        };
        for (i, arg) in self.args.iter().enumerate() {
            match arg {
                ArgDescriptor::Pointer(p) => {
                    if let Some(o) = p.stateless {
                        check(&format!("arg {} address", i), o as usize, 8)?;
                    }
                    if let Some(o) = p.slm_offset {
                        check(&format!("arg {} SLM offset", i), o as usize, 4)?;
                    }
                }
                ArgDescriptor::Value(v) => {
                    for e in &v.elements {
                        check(&format!("arg {} element", i), e.offset as usize, e.size as usize)?;
                    }
                }
            }
        }
        for (o, len) in self.dispatch_traits.fields() {
            check("dispatch trait", o as usize, len)?;
        }
        Ok(())
    }
}

/// A kernel prepared for launching: the descriptor plus which argument
/// slots are driven by variables.
#[derive(Debug, Clone)]
pub struct Kernel {
    descriptor: Arc<KernelDescriptor>,
    arg_variables: Vec<Option<VarId>>,
    arg_values: Vec<Option<Vec<u8>>>,
    group_size: [u32; 3],
    group_size_variable: Option<VarId>,
}

impl Kernel {
    pub fn new(descriptor: Arc<KernelDescriptor>) -> Self {
        let n = descriptor.args.len();
        Self {
            descriptor,
            arg_variables: vec![None; n],
            arg_values: vec![None; n],
            group_size: [1, 1, 1],
            group_size_variable: None,
        }
    }

    pub fn descriptor(&self) -> &Arc<KernelDescriptor> {
        &self.descriptor
    }

    pub fn group_size(&self) -> [u32; 3] {
        self.group_size
    }

    pub fn set_group_size(&mut self, group_size: [u32; 3]) -> Result<()> {
        if group_size.iter().any(|d| *d == 0) {
            return Err(MclError::InvalidArgument(format!(
                "group size {:?} has a zero dimension",
                group_size
            )));
        }
        self.group_size = group_size;
        Ok(())
    }

    /// Fixed bytes for a non-variable argument, written at launch.
    pub fn set_argument_value(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        self.descriptor.argument_at(index)?;
        self.arg_values[index] = Some(bytes.to_vec());
        Ok(())
    }

    pub fn argument_value(&self, index: usize) -> Option<&[u8]> {
        self.arg_values.get(index).and_then(|v| v.as_deref())
    }

    pub fn argument_variable(&self, index: usize) -> Option<VarId> {
        self.arg_variables.get(index).copied().flatten()
    }

    pub(crate) fn set_argument_variable(&mut self, index: usize, var: VarId) {
        self.arg_variables[index] = Some(var);
    }

    pub fn group_size_variable(&self) -> Option<VarId> {
        self.group_size_variable
    }

    pub(crate) fn set_group_size_variable(&mut self, var: VarId) {
        self.group_size_variable = Some(var);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A kernel with a buffer arg at ctd 0, a 16-byte value arg at ctd 24
    /// (straddling 32 bytes of inline data), and two SLM args.
    pub fn sample_kernel() -> KernelDescriptor {
        KernelDescriptor {
            name: "sample".to_string(),
            isa: vec![0xAB; 64],
            simd_size: 16,
            grf_count: 128,
            cross_thread_data_size: 160,
            pass_inline_data: true,
            num_local_id_channels: 3,
            skip_per_thread_data_load: 0x40,
            slm_inline_size: 0,
            args: vec![
                ArgDescriptor::Pointer(PointerArg {
                    address_space: AddressSpace::Global,
                    stateless: Some(0),
                    bindful: Some(0),
                    slm_offset: None,
                    required_slm_alignment: 0,
                }),
                ArgDescriptor::Value(ValueArg {
                    elements: vec![ValueElement {
                        offset: 24,
                        size: 16,
                        source_offset: 0,
                    }],
                }),
                ArgDescriptor::Pointer(PointerArg {
                    address_space: AddressSpace::Local,
                    stateless: None,
                    bindful: None,
                    slm_offset: Some(48),
                    required_slm_alignment: 16,
                }),
                ArgDescriptor::Pointer(PointerArg {
                    address_space: AddressSpace::Local,
                    stateless: None,
                    bindful: None,
                    slm_offset: Some(52),
                    required_slm_alignment: 256,
                }),
            ],
            dispatch_traits: DispatchTraits {
                local_work_size: Some(64),
                local_work_size2: None,
                enqueued_local_work_size: Some(76),
                num_work_groups: Some(88),
                global_work_size: Some(100),
                global_work_offset: Some(112),
                work_dim: Some(124),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_kernel;
    use super::*;

    #[test]
    fn test_argument_at_out_of_range() {
        let k = sample_kernel();
        assert!(k.argument_at(3).is_ok());
        assert!(matches!(k.argument_at(4), Err(MclError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_sample_kernel() {
        sample_kernel().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_overflowing_element() {
        let mut k = sample_kernel();
        k.cross_thread_data_size = 30;
        assert!(k.validate().is_err());
    }

    #[test]
    fn test_value_extent_and_slm_detection() {
        let k = sample_kernel();
        match &k.args[1] {
            ArgDescriptor::Value(v) => assert_eq!(v.extent(), 16),
            _ => panic!("expected value arg"),
        }
        assert!(k.args[2].is_slm());
        assert!(!k.args[0].is_slm());
    }

    #[test]
    fn test_kernel_group_size_rejects_zero() {
        let mut k = Kernel::new(Arc::new(sample_kernel()));
        assert!(k.set_group_size([8, 0, 1]).is_err());
        k.set_group_size([8, 8, 1]).unwrap();
        assert_eq!(k.group_size(), [8, 8, 1]);
    }
}
