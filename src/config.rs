//! In-process construction parameters (spec.md §6).
//!
//! This is not on-disk or environment-driven configuration — per the
//! Non-goals this runtime keeps no persistent state at all — it is purely
//! the handful of construction constants every primitive otherwise repeats
//! at its own call site, analogous to the teacher's `layout.rs` region-size
//! constants.

use crate::channel::{self, Receiver, Sender};
use crate::json::SharedJsonBuffer;

/// Permits released by the last `Sender`/`Receiver` to drop, to guarantee
/// every blocked peer wakes regardless of how many are actually parked
/// (spec.md §9, Open Question 2). Fixed at the theoretical maximum rather
/// than exposed as a tunable: anything smaller risks under-waking a
/// pathologically contended channel, and nothing is gained by the
/// embedding application ever choosing a different value.
pub const CLOSE_WAKE_PERMITS: i32 = i32::MAX;

/// Default bounded-channel capacity (spec.md §4.8.1).
pub const DEFAULT_CHANNEL_CAPACITY: u32 = 32;

/// Default Shared-JSON Buffer arena size.
pub const DEFAULT_SJB_CAPACITY: usize = 1 << 20;

/// Construction parameters for the channel and Shared-JSON Buffer
/// primitives. `Mutex`/`RwLock`/`Semaphore`/`Condvar`/`Barrier` take their
/// capacity directly as a constructor argument and have no further
/// ambient tunable, so they have no presence here.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub channel_capacity: u32,
    pub sjb_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            sjb_capacity: DEFAULT_SJB_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Build a bounded channel using this config's default capacity.
    pub fn bounded_channel(&self, max_message_len: usize) -> (Sender, Receiver) {
        channel::bounded(self.channel_capacity, max_message_len)
    }

    /// Build a Shared-JSON Buffer sized to this config's default capacity.
    pub fn shared_json_buffer(&self) -> SharedJsonBuffer {
        SharedJsonBuffer::with_capacity(self.sjb_capacity)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfigBuilder {
    channel_capacity: Option<u32>,
    sjb_capacity: Option<usize>,
}

impl RuntimeConfigBuilder {
    pub fn channel_capacity(mut self, capacity: u32) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    pub fn sjb_capacity(mut self, capacity: usize) -> Self {
        self.sjb_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        RuntimeConfig {
            channel_capacity: self.channel_capacity.unwrap_or(defaults.channel_capacity),
            sjb_capacity: self.sjb_capacity.unwrap_or(defaults.sjb_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.sjb_capacity, DEFAULT_SJB_CAPACITY);
    }

    #[test]
    fn builder_overrides_only_the_fields_set() {
        let config = RuntimeConfig::builder().channel_capacity(8).build();
        assert_eq!(config.channel_capacity, 8);
        assert_eq!(config.sjb_capacity, DEFAULT_SJB_CAPACITY);
    }

    #[test]
    fn bounded_channel_uses_the_configured_capacity() {
        let config = RuntimeConfig::builder().channel_capacity(2).build();
        let (tx, rx) = config.bounded_channel(16);
        tx.send(b"a").unwrap();
        tx.send(b"b").unwrap();
        drop(tx);
        assert_eq!(rx.recv().unwrap(), b"a");
        assert_eq!(rx.recv().unwrap(), b"b");
    }
}
