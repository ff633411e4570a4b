use thiserror::Error;

use crate::memory::HeapKind;

#[derive(Error, Debug)]
pub enum MclError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Unsupported alignment {alignment} (padding {padding} bytes)")]
    UnsupportedAlignment { alignment: usize, padding: usize },

    #[error("Host pointer 0x{0:x} is not backed by any device allocation")]
    AllocationResolution(u64),

    #[error("Out of space in {heap:?} heap: requested {requested} bytes, {available} available")]
    OutOfSpace {
        heap: HeapKind,
        requested: usize,
        available: usize,
    },

    #[error("Write of {len} bytes at offset {offset} is outside its memory region")]
    OutOfBounds { offset: usize, len: usize },

    #[error("Binary encode error: {0}")]
    Encode(String),

    #[error("Binary decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MclError>;
