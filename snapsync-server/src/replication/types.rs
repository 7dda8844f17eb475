use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Aggregate replication state shared by every transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    /// At least one transfer has not been accounted for yet
    InProgress,
    /// Every started or failed transfer has finished
    #[default]
    End,
}

impl ReplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::InProgress => "in_progress",
            ReplicationState::End => "end",
        }
    }
}

/// Replica endpoint a snapshot is pushed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAndPort {
    pub ip: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferReport {
    /// Key/value pairs read from the snapshot
    pub pairs: u64,
    /// Chunks written to the replica
    pub chunks: u64,
    /// Payload bytes across all chunks
    pub payload_bytes: u64,
    /// Rounds skipped because the replica was not draining
    pub throttled_rounds: u64,
    /// Wall time from connect to completion
    pub elapsed: Duration,
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Snapshot is not available, rr_make_snapshot not received or failed")]
    SnapshotUnavailable,

    #[error("Connection to replica {target} failed: {source}")]
    ConnectionFailed {
        target: HostAndPort,
        #[source]
        source: std::io::Error,
    },

    #[error("Handshake with replica failed: {0}")]
    HandshakeFailed(String),

    #[error("Control link broken")]
    ControlLinkBroken,

    #[error("Destination link broken: {0}")]
    DestinationLinkBroken(String),

    #[error("Event source failed: {0}")]
    EventSource(std::io::Error),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;
