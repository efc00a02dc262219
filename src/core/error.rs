use thiserror::Error;

/// Errors produced while decoding, translating or persisting a VDI container.
///
/// Every failure is returned as a value; nothing in this crate aborts the
/// process. [`VdiError::Io`] is never retried internally.
#[derive(Error, Debug)]
pub enum VdiError {
    #[error("corrupt header: {0}")]
    CorruptHeader(&'static str),

    #[error("unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("size mismatch: {block_count} blocks x {block_size} bytes != declared {declared} bytes")]
    SizeMismatch {
        block_count: u32,
        block_size: u32,
        declared: u64,
    },

    #[error("out of range: offset={offset} len={len} limit={limit}")]
    OutOfRange { offset: u64, len: u64, limit: u64 },

    #[error("corrupt allocation table: {0}")]
    CorruptTable(&'static str),

    #[error("allocation exhausted: cannot grow backing store to {required} bytes")]
    AllocationExhausted {
        required: u64,
        #[source]
        source: Option<Box<VdiError>>,
    },

    #[error("block {index} already assigned to slot {slot}")]
    AlreadyAssigned { index: u32, slot: u32 },

    #[error("container is read-only")]
    ReadOnly,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration parse error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VdiError {
    /// Wrap a growth failure, keeping the underlying cause.
    pub(crate) fn exhausted(required: u64, source: Option<VdiError>) -> Self {
        VdiError::AllocationExhausted {
            required,
            source: source.map(Box::new),
        }
    }
}

pub type Result<T> = std::result::Result<T, VdiError>;
