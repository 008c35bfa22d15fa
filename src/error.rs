use thiserror::Error;

/// Crate-wide error type for every fallible operation on a shared-memory
/// primitive.
///
/// `InvariantViolation` and `HeapExhausted` denote states that are
/// impossible under correct use; they are returned rather than panicked so
/// that a worker dispatch loop (out of scope for this crate) can decide how
/// to surface them, but they are never meant to be handled and retried.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    #[error("shared-JSON-buffer heap exhausted after compaction")]
    HeapExhausted,

    #[error("operation attempted on a disposed or moved handle")]
    DisposedHandle,

    #[error("channel closed")]
    ChannelClosed { no_receivers: bool },

    #[error("channel recv observed a null slot while not closed")]
    SpuriousWakeup,

    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    pub fn channel_closed() -> Self {
        SyncError::ChannelClosed { no_receivers: false }
    }

    pub fn channel_closed_no_receivers() -> Self {
        SyncError::ChannelClosed { no_receivers: true }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SyncError::ChannelClosed { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
