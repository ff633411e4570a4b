//! Temporary memory: anonymous buffer variables carved out of one
//! caller-provided allocation.

use tracing::debug;

use super::CommandList;
use crate::error::{MclError, Result};
use crate::memory::{align_up, ResolvedPointer};
use crate::variable::patch::patch_buffer;
use crate::variable::{VarId, Variable};

impl CommandList {
    /// Create an anonymous temporary buffer of `size` bytes, or `size`
    /// bytes per element when `scalable`.
    pub fn create_temp_variable(&mut self, size: usize, scalable: bool) -> Result<VarId> {
        if size == 0 {
            return Err(MclError::InvalidArgument("temporary variable size is zero".into()));
        }
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable::new_temporary(size, scalable));
        self.binary = None;
        debug!(id = id.0, size, scalable, "temporary variable");
        Ok(id)
    }

    pub fn temp_mem_set_element_count(&mut self, count: usize) {
        self.temp_element_count = count;
    }

    pub fn temp_mem_element_count(&self) -> usize {
        self.temp_element_count
    }

    /// Bytes of temporary memory all temporaries need at the current
    /// element count.
    pub fn temp_mem_get_size(&self) -> usize {
        self.temp_layout().last().map_or(0, |(_, offset, size)| offset + size)
    }

    /// Point every temporary at its slice of the allocation behind `host_ptr`.
    pub fn temp_mem_set(&mut self, host_ptr: u64) -> Result<()> {
        let base = self.allocator.resolve(host_ptr)?;
        let required = self.temp_mem_get_size();
        let available = base.allocation.size as u64 - (base.device_address - base.allocation.gpu_address);
        if (required as u64) > available {
            return Err(MclError::InvalidArgument(format!(
                "temporary memory needs {} bytes, {} available",
                required, available
            )));
        }
        let layout = self.temp_layout();
        debug!(
            base = format_args!("0x{:x}", base.device_address),
            variables = layout.len(),
            required,
            "temp mem set"
        );
        self.binary = None;
        let (vars, mut ctx) = self.patch_context();
        for (id, offset, _) in layout {
            let resolved = ResolvedPointer {
                device_address: base.device_address + offset as u64,
                allocation: base.allocation,
            };
            patch_buffer(&mut vars[id.index()], Some(resolved), &mut ctx)?;
        }
        Ok(())
    }

    /// `(variable, offset, aligned size)` of every temporary, in creation order.
    fn temp_layout(&self) -> Vec<(VarId, usize, usize)> {
        let mut out = Vec::new();
        let mut offset = 0;
        for (i, v) in self.variables.iter().enumerate() {
            if !v.flags().temporary {
                continue;
            }
            let size = if v.flags().scalable {
                v.temp_size() * self.temp_element_count
            } else {
                v.temp_size()
            };
            let aligned = align_up(size, self.config.temp_alignment);
            out.push((VarId(i as u32), offset, aligned));
            offset += aligned;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::cmdlist::tests::new_list;
    use crate::error::MclError;
    use crate::memory::AllocationKind;
    use crate::variable::{ArgValue, VariableState};

    #[test]
    fn test_temp_mem_sizing_scales_with_element_count() {
        let (mut list, _) = new_list();
        list.create_temp_variable(100, false).unwrap();
        list.create_temp_variable(64, true).unwrap();
        assert_eq!(list.temp_mem_get_size(), 128);
        list.temp_mem_set_element_count(4);
        assert_eq!(list.temp_mem_get_size(), 128 + 256);
    }

    #[test]
    fn test_temp_mem_set_assigns_sub_addresses() {
        let (mut list, table) = new_list();
        let a = list.create_temp_variable(100, false).unwrap();
        let b = list.create_temp_variable(16, true).unwrap();
        list.temp_mem_set_element_count(2);
        let alloc = table.register_host_range(0x5000_0000, 4096, AllocationKind::Buffer);
        list.temp_mem_set(0x5000_0000).unwrap();

        let va = list.variable(a).unwrap();
        assert_eq!(va.buffer().unwrap().gpu_address, alloc.gpu_address);
        assert_eq!(va.state(), VariableState::Initialized);
        let vb = list.variable(b).unwrap();
        assert_eq!(vb.buffer().unwrap().gpu_address, alloc.gpu_address + 128);
        // one reference per temporary
        assert_eq!(list.residency().ref_count(&alloc), 2);
    }

    #[test]
    fn test_temp_mem_too_small_rejected() {
        let (mut list, table) = new_list();
        list.create_temp_variable(8192, false).unwrap();
        table.register_host_range(0x5000_0000, 4096, AllocationKind::Buffer);
        assert!(matches!(list.temp_mem_set(0x5000_0000), Err(MclError::InvalidArgument(_))));
    }

    #[test]
    fn test_temporary_rejects_direct_set() {
        let (mut list, table) = new_list();
        let t = list.create_temp_variable(64, false).unwrap();
        table.register_host_range(0x5000_0000, 4096, AllocationKind::Buffer);
        let err = list
            .set_variable_value(t, 8, 0, ArgValue::Pointer(Some(0x5000_0000)))
            .unwrap_err();
        assert!(matches!(err, MclError::InvalidArgument(_)));
        assert!(list.create_temp_variable(0, false).is_err());
    }
}
