//! Command-list configuration: heap sizes and hardware constants.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MclError, Result};
use crate::walker::WalkerLayout;

/// Sizing and hardware parameters of a command list.
///
/// Defaults describe the reference hardware. A JSON file may override any
/// subset of fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandListConfig {
    // Heap capacities (bytes)
    pub command_stream_size: usize,
    pub instruction_heap_size: usize,
    pub indirect_heap_size: usize,
    pub surface_state_heap_size: usize,
    pub constants_heap_size: usize,

    /// Alignment of each dispatch's indirect data in the IOH.
    pub ioh_alignment: usize,
    /// Bytes reserved after cross-thread data for runtime-generated local IDs.
    pub per_thread_reservation: usize,
    /// Bytes per general register.
    pub grf_size: usize,
    /// The hardware allocates shared local memory in blocks of this size.
    pub slm_granularity: u32,
    /// Alignment of each temporary variable inside temporary memory.
    pub temp_alignment: usize,
    /// Alignment of each kernel's ISA in the instruction heap.
    pub isa_alignment: usize,
    /// Surface states of one dispatch are aligned to this.
    pub binding_table_alignment: usize,

    /// In-order counter waits compare 64-bit values through a GPR pair.
    pub qword_in_order_counter: bool,
    /// Value variables record one usage per argument element by default.
    pub immediate_value_chunks: bool,

    pub walker: WalkerLayout,
}

impl Default for CommandListConfig {
    fn default() -> Self {
        Self {
            command_stream_size: 64 * 1024,
            instruction_heap_size: 64 * 1024,
            indirect_heap_size: 64 * 1024,
            surface_state_heap_size: 16 * 1024,
            constants_heap_size: 4 * 1024,
            ioh_alignment: 64,
            per_thread_reservation: 4096,
            grf_size: 64,
            slm_granularity: 1024,
            temp_alignment: 64,
            isa_alignment: 64,
            binding_table_alignment: 64,
            qword_in_order_counter: false,
            immediate_value_chunks: false,
            walker: WalkerLayout::default(),
        }
    }
}

impl CommandListConfig {
    /// Load overrides from a JSON file and validate the result.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| MclError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!(path = %path.display(), "loaded command list config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let heaps = [
            ("command_stream_size", self.command_stream_size),
            ("instruction_heap_size", self.instruction_heap_size),
            ("indirect_heap_size", self.indirect_heap_size),
            ("surface_state_heap_size", self.surface_state_heap_size),
        ];
        for (name, size) in heaps {
            if size == 0 {
                return Err(MclError::Config(format!("{} must be non-zero", name)));
            }
        }
        let alignments = [
            ("ioh_alignment", self.ioh_alignment),
            ("grf_size", self.grf_size),
            ("slm_granularity", self.slm_granularity as usize),
            ("temp_alignment", self.temp_alignment),
            ("isa_alignment", self.isa_alignment),
            ("binding_table_alignment", self.binding_table_alignment),
        ];
        for (name, a) in alignments {
            if !a.is_power_of_two() {
                return Err(MclError::Config(format!(
                    "{} must be a power of two, got {}",
                    name, a
                )));
            }
        }
        if !self.walker.fits() {
            return Err(MclError::Config(format!(
                "walker layout has fields outside its {} bytes",
                self.walker.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_is_valid() {
        CommandListConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_overrides_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{ "slm_granularity": 2048, "walker": {{ "inline_data_size": 64, "size": 160 }} }}"#).unwrap();
        let config = CommandListConfig::from_json_file(f.path()).unwrap();
        assert_eq!(config.slm_granularity, 2048);
        assert_eq!(config.walker.inline_data_size, 64);
        assert_eq!(config.walker.kernel_start, WalkerLayout::default().kernel_start);
        assert_eq!(config.grf_size, 64);
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let config = CommandListConfig {
            temp_alignment: 48,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MclError::Config(_))));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ not json").unwrap();
        assert!(matches!(
            CommandListConfig::from_json_file(f.path()),
            Err(MclError::Config(_))
        ));
    }

    #[test]
    fn test_walker_overflow_rejected() {
        let mut config = CommandListConfig::default();
        config.walker.inline_data_size = 128;
        assert!(config.validate().is_err());
    }
}
