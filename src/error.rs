use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("Data at offset {offset} with size {size} is not available yet")]
    NotAvailable { offset: u64, size: usize },

    #[error("Offset {0} is not aligned to a block boundary")]
    MisalignedOffset(u64),

    #[error("Range at offset {offset} with size {size} exceeds file size {file_size}")]
    OutOfRange { offset: u64, size: usize, file_size: u64 },

    #[error("Read of {0} bytes exceeds the block size")]
    ReadTooLarge(usize),

    #[error("File provider is read-only")]
    ReadOnly,

    #[error("File provider is not open")]
    NotOpen,

    #[error("Checksum is not available for a file that is still being downloaded")]
    ChecksumUnavailable,

    #[error("Chunk {0} is not complete")]
    ChunkIncomplete(u32),

    #[error("Requested size {0} exceeds the chunk size")]
    ChunkTooLarge(u64),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Transfer manager channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl TransferError {
    /// True for failures that only mean "try again later".
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::NotAvailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
