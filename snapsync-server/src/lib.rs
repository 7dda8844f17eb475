pub mod config;
pub mod core;
pub mod net;
pub mod protocol;
pub mod replication;
pub mod server;

// Re-export commonly used types
pub use config::ServerConfig;
pub use core::{Engine, MemoryStore, Snapshot, SnapshotHandle};
pub use net::{Link, PollEvents, ReadinessSource};
pub use protocol::{ProtocolError, encode_block, parse_block};
pub use replication::{
    HostAndPort, ReplicationConfig, ReplicationContext, ReplicationError, ReplicationJob,
    ReplicationState, ReplicationStatus, ReplicationWorker, ReplicationWorkerPool, SnapshotFrame,
    StatusCounters, StreamDecoder, TransferReport,
};
pub use server::{AppState, ControlServer, ControlSession};
