use super::config::ReplicationConfig;
use super::status::ReplicationStatus;
use super::types::HostAndPort;
use crate::core::Engine;
use crate::net::Link;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Server-side state a transfer job runs against
pub struct ReplicationContext {
    pub engine: Arc<dyn Engine>,
    pub status: Arc<ReplicationStatus>,
    pub config: ReplicationConfig,
}

impl ReplicationContext {
    pub fn new(engine: Arc<dyn Engine>, config: ReplicationConfig) -> Self {
        Self {
            engine,
            status: Arc::new(ReplicationStatus::new()),
            config,
        }
    }

    pub fn with_status(
        engine: Arc<dyn Engine>,
        status: Arc<ReplicationStatus>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            engine,
            status,
            config,
        }
    }
}

/// Cooperative cancellation flag shared with a running job
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One snapshot transfer to one replica
///
/// The control link belongs to the job. A worker borrows it for the
/// duration of the transfer and hands it back unless the transfer failed
/// in a way that closed it.
pub struct ReplicationJob {
    pub id: Uuid,
    pub target: HostAndPort,
    pub control: Link,
    pub context: Arc<ReplicationContext>,
    cancel: CancelHandle,
}

impl ReplicationJob {
    pub fn new(target: HostAndPort, control: Link, context: Arc<ReplicationContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            control,
            context,
            cancel: CancelHandle::default(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for ReplicationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationJob")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("control", &self.control)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
