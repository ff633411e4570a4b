pub mod error;
pub mod config;
pub mod memory;
pub mod commands;
pub mod walker;
pub mod kernel;
pub mod event;
pub mod variable;
pub mod dispatch;
pub mod label;
pub mod cmdlist;
pub mod program;
pub mod cli;

pub use error::{MclError, Result};
pub use config::CommandListConfig;
pub use cmdlist::{CommandList, LaunchParams};
pub use kernel::{Kernel, KernelDescriptor};
pub use event::Event;
pub use label::{JumpCondition, LabelId};
pub use memory::{Allocation, AllocationTable, Allocator};
pub use variable::{ArgValue, VarId, VariableState, VariableType, SET_VALUE_STAGE_COMMIT};
pub use program::load_from_file;
