pub mod handlers;
pub mod session;

pub use handlers::{AppState, Reply, handle_command};
pub use session::ControlSession;

use crate::net::Link;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Accepts coordinator connections and hands each to a `ControlSession`
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl ControlServer {
    pub async fn bind(addr: &str, state: Arc<AppState>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Accept loop; runs until the listener fails
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if self.state.is_shutting_down() {
                debug!("refusing {} during shutdown", peer);
                continue;
            }

            let link = match stream.into_std().and_then(Link::from_stream) {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed to set up connection from {}: {}", peer, e);
                    continue;
                }
            };
            debug!("accepted connection from {}", peer);

            let session = ControlSession::new(link, Arc::clone(&self.state), Handle::current());
            tokio::task::spawn_blocking(move || session.run());
        }
    }
}
