use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, DgcError>;

#[derive(Debug, thiserror::Error)]
pub enum DgcError {
    #[error("DGC is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("state is bound to {expected}, called with {actual}")]
    DTypeMismatch {
        expected: DataType,
        actual: DataType,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("layer {name} has {num_elements} elements, more than a u32 index can address")]
    LayerTooLarge { name: String, num_elements: usize },

    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("unknown configuration key: {0}")]
    UnknownConfigKey(String),

    #[error("invalid value {value:?} for configuration key {key}: {reason}")]
    InvalidConfigValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("device error: {message}")]
    DeviceError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("stream work {label} failed: {reason}")]
    StreamFailed { label: &'static str, reason: String },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl DgcError {
    /// Create a `DeviceError` with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `DeviceError` with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn invalid_value(
        key: &str,
        value: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidConfigValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
