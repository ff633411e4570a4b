//! Labels and jumps with deferred address resolution.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commands::{encode_batch_buffer_start, BATCH_BUFFER_START_ADDRESS_OFFSET};
use crate::error::{MclError, Result};
use crate::memory::{CommandContainer, GpuAddress, HeapKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpCondition {
    Always,
    /// Taken only when the predicate register is set.
    Predicated,
}

#[derive(Debug, Clone, Default)]
pub struct Label {
    name: Option<String>,
    address: Option<GpuAddress>,
    /// Command-stream offsets of jumps waiting for the address.
    pending: Vec<usize>,
}

impl Label {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            address: None,
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn address(&self) -> Option<GpuAddress> {
        self.address
    }

    pub fn is_set(&self) -> bool {
        self.address.is_some()
    }

    pub fn pending_jumps(&self) -> &[usize] {
        &self.pending
    }

    /// Place the label at the current end of the command stream, padded
    /// with NOOPs to `alignment` (0 for none). Returns the command-stream
    /// offsets of the jumps that were resolved.
    pub fn set(&mut self, c: &mut CommandContainer, alignment: usize) -> Result<Vec<usize>> {
        if self.address.is_some() {
            return Err(MclError::UnsupportedFeature(format!(
                "label {:?} is already set",
                self.name
            )));
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(MclError::UnsupportedAlignment {
                alignment,
                padding: 0,
            });
        }
        let end = c.cs.end_gpu_address();
        let padding = if alignment > 1 {
            let a = alignment as u64;
            (end.div_ceil(a) * a - end) as usize
        } else {
            0
        };
        if padding % 4 != 0 {
            return Err(MclError::UnsupportedAlignment { alignment, padding });
        }
        if padding > 0 {
            c.append(HeapKind::CommandStream, &vec![0u8; padding])?;
        }

        let address = c.cs.end_gpu_address();
        self.address = Some(address);
        debug!(label = ?self.name, address = format_args!("0x{:x}", address), padding, "label set");

        let resolved = std::mem::take(&mut self.pending);
        for offset in &resolved {
            let addr = c.cs.address_of(offset + BATCH_BUFFER_START_ADDRESS_OFFSET);
            c.memory.write_u64(addr, address)?;
        }
        Ok(resolved)
    }

    /// Emit a jump to this label. Returns the command-stream offset of the
    /// jump command.
    pub fn append_jump(&mut self, c: &mut CommandContainer, condition: JumpCondition) -> Result<usize> {
        let predicated = condition == JumpCondition::Predicated;
        let target = self.address.unwrap_or(0);
        let offset = c.append(
            HeapKind::CommandStream,
            &encode_batch_buffer_start(target, predicated),
        )?;
        if self.address.is_none() {
            self.pending.push(offset);
        }
        debug!(label = ?self.name, offset, resolved = self.address.is_some(), "jump");
        Ok(offset)
    }

    /// Rebuild a label from a serialized container.
    pub(crate) fn restore(name: Option<String>, address: Option<GpuAddress>, pending: Vec<usize>) -> Self {
        Self {
            name,
            address,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationTable;

    fn container() -> CommandContainer {
        let table = AllocationTable::new();
        CommandContainer::allocate(&table, 512, 64, 64, 64, 64).unwrap()
    }

    fn jump_target(c: &CommandContainer, offset: usize) -> u64 {
        c.memory
            .read_u64(c.cs.address_of(offset + BATCH_BUFFER_START_ADDRESS_OFFSET))
            .unwrap()
    }

    #[test]
    fn test_jump_before_label_is_resolved() {
        let mut c = container();
        let mut l = Label::new(Some("loop".into()));
        let j = l.append_jump(&mut c, JumpCondition::Predicated).unwrap();
        assert_eq!(jump_target(&c, j), 0);
        let resolved = l.set(&mut c, 0).unwrap();
        assert_eq!(resolved, vec![j]);
        assert_eq!(jump_target(&c, j), l.address().unwrap());
        assert!(l.pending_jumps().is_empty());
    }

    #[test]
    fn test_jump_after_label_written_immediately() {
        let mut c = container();
        let mut l = Label::new(None);
        l.set(&mut c, 0).unwrap();
        let j = l.append_jump(&mut c, JumpCondition::Always).unwrap();
        assert_eq!(jump_target(&c, j), c.cs.gpu_base());
    }

    #[test]
    fn test_double_set_unsupported() {
        let mut c = container();
        let mut l = Label::new(None);
        l.set(&mut c, 0).unwrap();
        let first = l.address();
        c.append(HeapKind::CommandStream, &[0u8; 8]).unwrap();
        let err = l.set(&mut c, 0).unwrap_err();
        assert!(matches!(err, MclError::UnsupportedFeature(_)));
        assert_eq!(l.address(), first);
    }

    #[test]
    fn test_alignment_pads_with_noops() {
        let mut c = container();
        c.append(HeapKind::CommandStream, &[0xFFu8; 12]).unwrap();
        let mut l = Label::new(None);
        l.set(&mut c, 64).unwrap();
        assert_eq!(l.address().unwrap() % 64, 0);
        assert_eq!(c.cs.used(), 64);
        assert!(c.heap_bytes(HeapKind::CommandStream)[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let mut c = container();
        let mut l = Label::new(None);
        let err = l.set(&mut c, 48).unwrap_err();
        assert!(matches!(err, MclError::UnsupportedAlignment { alignment: 48, .. }));

        c.append(HeapKind::CommandStream, &[0u8; 2]).unwrap();
        let err = l.set(&mut c, 8).unwrap_err();
        assert!(matches!(
            err,
            MclError::UnsupportedAlignment {
                alignment: 8,
                padding: 6
            }
        ));
        assert!(!l.is_set());
    }
}
