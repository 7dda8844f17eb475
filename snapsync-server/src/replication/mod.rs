/// Replication module - full resync of a replica from a store snapshot
///
/// Design follows the SSDB/Redis full sync:
/// - The server freezes a snapshot (rr_make_snapshot)
/// - A worker streams it to one replica per job (rr_transfer_snapshot)
/// - Pairs travel in `mset` chunks using the RDB length encoding
/// - A `complete` token ends the stream
///
/// The transfer loop is single threaded and non-blocking. It watches the
/// coordinator link while pushing chunks to the replica, pauses iteration
/// when the replica falls behind, and records every outcome in the shared
/// `ReplicationStatus`.
pub mod buffer;
pub mod config;
pub mod encoding;
pub mod job;
pub mod pool;
pub mod status;
pub mod stream;
pub mod types;
pub mod worker;

pub use config::ReplicationConfig;
pub use job::{CancelHandle, ReplicationContext, ReplicationJob};
pub use pool::{JobOutcome, ReplicationWorkerPool};
pub use status::{Completion, ReplicationStatus, StatusCounters, TransferGuard};
pub use stream::{MAX_CHUNK_SIZE, SnapshotFrame, StreamDecoder};
pub use types::{HostAndPort, ReplicationError, ReplicationResult, ReplicationState, TransferReport};
pub use worker::{ReplicationWorker, send_error_reply};
