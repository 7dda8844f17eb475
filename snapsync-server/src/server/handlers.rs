use crate::core::{Engine, MemoryStore};
use crate::replication::{ReplicationContext, ReplicationWorkerPool};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Application state shared across control sessions
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub context: Arc<ReplicationContext>,
    pub pool: ReplicationWorkerPool,
    pub append_reply: bool,
    shutdown: AtomicBool,
}

impl AppState {
    pub fn new(
        store: Arc<MemoryStore>,
        context: Arc<ReplicationContext>,
        pool: ReplicationWorkerPool,
        append_reply: bool,
    ) -> Self {
        Self {
            store,
            context,
            pool,
            append_reply,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Stop accepting work: sessions end at their next idle check and
    /// running transfers are cancelled
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pool.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Reply block: a status token followed by its values
pub type Reply = Vec<Bytes>;

fn ok<I: IntoIterator<Item = Bytes>>(values: I) -> Reply {
    std::iter::once(Bytes::from_static(b"ok")).chain(values).collect()
}

fn client_error(message: impl Into<String>) -> Reply {
    vec![
        Bytes::from_static(b"client_error"),
        Bytes::from(message.into()),
    ]
}

fn wrong_args(command: &str) -> Reply {
    client_error(format!("wrong number of arguments for '{}'", command))
}

/// Execute every command except `rr_transfer_snapshot`, which needs the
/// session's link and is run by the session itself
pub fn handle_command(state: &AppState, command: &str, args: &[Bytes]) -> Reply {
    debug!("command {} ({} args)", command, args.len());

    match command {
        "ping" => ok([]),
        "set" => match args {
            [key, value] => {
                state.store.set(key.clone(), value.clone());
                ok([Bytes::from_static(b"1")])
            }
            _ => wrong_args(command),
        },
        "get" => match args {
            [key] => match state.store.get(key) {
                Some(value) => ok([value]),
                None => vec![Bytes::from_static(b"not_found")],
            },
            _ => wrong_args(command),
        },
        "del" => match args {
            [key] => {
                let removed = if state.store.del(key) { "1" } else { "0" };
                ok([Bytes::from_static(removed.as_bytes())])
            }
            _ => wrong_args(command),
        },
        "dbsize" => ok([Bytes::from(state.store.len().to_string())]),
        "rr_make_snapshot" => handle_make_snapshot(state),
        "rr_del_snapshot" => {
            if state.context.status.release_snapshot().is_some() {
                info!("snapshot released");
            }
            ok([])
        }
        "rr_replic_info" => handle_replic_info(state),
        _ => client_error(format!("Unknown Command: {}", command)),
    }
}

fn handle_make_snapshot(state: &AppState) -> Reply {
    let snapshot = state.context.engine.snapshot();
    let keys = snapshot.len();
    if state.context.status.install_snapshot(snapshot).is_some() {
        debug!("previous snapshot replaced");
    }
    info!("snapshot created with {} keys", keys);
    ok([])
}

fn handle_replic_info(state: &AppState) -> Reply {
    let counters = state.context.status.counters();
    ok([
        Bytes::from_static(counters.state.as_str().as_bytes()),
        Bytes::from(counters.started.to_string()),
        Bytes::from(counters.finished.to_string()),
        Bytes::from(counters.failed.to_string()),
        Bytes::from_static(if counters.has_snapshot { b"yes" } else { b"no" }),
    ])
}
