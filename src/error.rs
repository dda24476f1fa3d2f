//! Error taxonomy for the sync subsystem.

/// Everything the transfer, assembly and phase machinery can fail with.
///
/// Recoverable preconditions (receiver not yet identified, bulk channel not
/// yet open) are *not* errors; they are retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("chunk index {index} out of range for transfer {transfer_id} ({total_chunks} chunks)")]
    ChunkOutOfRange {
        transfer_id: String,
        index: u32,
        total_chunks: u32,
    },

    #[error("chunk for transfer {got} while assembling {expected}")]
    TransferMismatch { expected: String, got: String },

    #[error("chunk declares {got} total chunks, transfer {transfer_id} expects {expected}")]
    ChunkCountMismatch {
        transfer_id: String,
        expected: u32,
        got: u32,
    },

    #[error("duplicate begin for transfer {0}")]
    DuplicateBegin(String),

    #[error("transfer must contain at least one chunk")]
    EmptyTransfer,

    #[error("begin for {transfer_id} announces {total_chunks} chunks for {total_size_bytes} bytes")]
    ImplausibleBegin {
        transfer_id: String,
        total_chunks: i64,
        total_size_bytes: i64,
    },

    #[error("reassembled {actual} bytes, transfer announced {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("world codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("asset build failed: {0}")]
    AssetBuild(String),

    #[error("unknown client {0}")]
    UnknownClient(String),

    #[error("bulk channel failed: {0}")]
    BulkChannel(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("frame of {len} bytes exceeds limit {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Protocol violations abort the offending session but are not fatal
    /// to the process.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SyncError::ChunkOutOfRange { .. }
                | SyncError::TransferMismatch { .. }
                | SyncError::ChunkCountMismatch { .. }
                | SyncError::DuplicateBegin(_)
                | SyncError::ImplausibleBegin { .. }
                | SyncError::MalformedFrame(_)
        )
    }
}
