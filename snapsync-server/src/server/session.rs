use super::handlers::{AppState, handle_command};
use crate::net::{Link, is_transient};
use crate::replication::{
    HostAndPort, JobOutcome, ReplicationError, ReplicationJob, send_error_reply,
};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// How often an idle session checks for server shutdown
const IDLE_CHECK: Duration = Duration::from_secs(1);

/// One coordinator connection, served on a blocking thread
pub struct ControlSession {
    link: Option<Link>,
    state: Arc<AppState>,
    runtime: Handle,
}

impl ControlSession {
    pub fn new(mut link: Link, state: Arc<AppState>, runtime: Handle) -> Self {
        link.set_append_reply(state.append_reply);
        Self {
            link: Some(link),
            state,
            runtime,
        }
    }

    /// Serve requests until the peer disconnects or the server shuts down
    pub fn run(mut self) {
        if let Some(link) = &self.link {
            if let Err(e) = link.set_read_timeout(Some(IDLE_CHECK)) {
                warn!("failed to set idle timeout on {:?}: {}", link.peer(), e);
            }
        }

        while let Some(request) = self.next_request() {
            let Some((command, args)) = request.split_first() else {
                continue;
            };
            let command = String::from_utf8_lossy(command).to_lowercase();

            if command == "rr_transfer_snapshot" {
                self.transfer(args);
            } else {
                let reply = handle_command(&self.state, &command, args);
                self.reply(reply);
            }
        }

        if let Some(mut link) = self.link.take() {
            debug!("session with {:?} closed", link.peer());
            link.close();
        }
    }

    fn next_request(&mut self) -> Option<Vec<Bytes>> {
        let link = self.link.as_mut()?;

        loop {
            match link.recv() {
                Ok(Some(block)) => return Some(block),
                Ok(None) => {}
                Err(e) => {
                    warn!("bad request from {:?}: {}", link.peer(), e);
                    return None;
                }
            }

            match link.read() {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::TimedOut => {
                    if self.state.is_shutting_down() {
                        return None;
                    }
                }
                Err(e) => {
                    debug!("read from {:?} failed: {}", link.peer(), e);
                    return None;
                }
            }
        }
    }

    fn reply<I, T>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.send(tokens);
        if let Err(e) = link.flush() {
            debug!("reply to {:?} failed: {}", link.peer(), e);
            link.close();
            self.link = None;
        }
    }

    /// `rr_transfer_snapshot ip port`: the link goes with the job and comes
    /// back with its outcome
    fn transfer(&mut self, args: &[Bytes]) {
        let target = match parse_target(args) {
            Ok(target) => target,
            Err(message) => {
                self.reply(["client_error", message.as_str()]);
                return;
            }
        };
        let Some(link) = self.link.take() else {
            return;
        };

        let job = ReplicationJob::new(target.clone(), link, Arc::clone(&self.state.context));
        info!("transfer {} to {} dispatched", job.id, target);

        match self.runtime.block_on(self.state.pool.dispatch(job)) {
            Ok(JobOutcome { job, result }) => {
                let ReplicationJob { mut control, .. } = job;
                if control.is_closed() {
                    return;
                }
                if control.is_noblock() {
                    if let Err(e) = control.noblock(false) {
                        warn!("failed to reset link mode for {:?}: {}", control.peer(), e);
                    }
                }
                match result {
                    Ok(report) => {
                        self.link = Some(control);
                        self.reply([Bytes::from_static(b"ok"), Bytes::from(report.pairs.to_string())]);
                    }
                    // The worker never answered the coordinator on these
                    Err(e @ (ReplicationError::PoolClosed | ReplicationError::WorkerFailed(_))) => {
                        warn!("transfer to {} was not run: {}", target, e);
                        send_error_reply(&mut control);
                        self.link = Some(control);
                    }
                    Err(_) => self.link = Some(control),
                }
            }
            Err(e) => error!("transfer to {} was lost: {}", target, e),
        }
    }
}

fn parse_target(args: &[Bytes]) -> Result<HostAndPort, String> {
    let [ip, port] = args else {
        return Err("wrong number of arguments for 'rr_transfer_snapshot'".to_string());
    };
    let ip = String::from_utf8_lossy(ip).into_owned();
    let port = std::str::from_utf8(port)
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .ok_or_else(|| format!("invalid port {:?}", String::from_utf8_lossy(port)))?;
    Ok(HostAndPort::new(ip, port))
}
