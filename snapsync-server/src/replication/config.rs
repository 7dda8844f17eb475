use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Number of transfers that may run at the same time
    pub workers: usize,

    /// Handshake command sent to the replica before streaming
    pub handshake_command: String,

    /// Staging buffer size that triggers a chunk flush (bytes)
    pub chunk_threshold_bytes: usize,

    /// Pending replica output above which iteration pauses (bytes)
    pub backpressure_bytes: usize,

    /// Poll timeout when no event was seen on the previous round (ms)
    pub idle_poll_ms: u64,

    /// Replica connect timeout (ms)
    pub connect_timeout_ms: u64,

    /// How long to wait for the handshake reply (ms)
    pub handshake_timeout_ms: u64,

    /// How long to wait for the replica to acknowledge completion (ms)
    pub ack_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            handshake_command: "sync150".to_string(),
            chunk_threshold_bytes: 10 * 1024,  // 10KB per chunk
            backpressure_bytes: 1024 * 1024,   // 1MB pending output
            idle_poll_ms: 5,
            connect_timeout_ms: 3000,
            handshake_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
        }
    }
}

impl ReplicationConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("Replication requires at least one worker".to_string());
        }
        if self.handshake_command.is_empty() {
            return Err("handshake_command must not be empty".to_string());
        }
        if self.chunk_threshold_bytes == 0 {
            return Err("chunk_threshold_bytes must be greater than zero".to_string());
        }
        if self.backpressure_bytes < self.chunk_threshold_bytes {
            return Err(format!(
                "backpressure_bytes ({}) must be at least chunk_threshold_bytes ({})",
                self.backpressure_bytes, self.chunk_threshold_bytes
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be greater than zero".to_string());
        }

        Ok(())
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` disables the timeout
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms))
    }

    /// `None` disables the timeout
    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }
}
