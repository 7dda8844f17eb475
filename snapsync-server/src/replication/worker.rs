use super::buffer::{COMPLETE_TOKEN, append_pair, staging_buffer, write_chunk};
use super::config::ReplicationConfig;
use super::encoding::put_value;
use super::job::{CancelHandle, ReplicationJob};
use super::status::Completion;
use super::types::{ReplicationError, ReplicationResult, TransferReport};
use crate::core::KvIterator;
use crate::net::{Event, Interest, Link, PollEvents, ReadinessSource, Token, is_transient};
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const CONTROL: Token = Token(0);
const DESTINATION: Token = Token(1);

/// Reply sent to the coordinator when a transfer fails
pub const ERROR_REPLY: [&str; 2] = ["error", "rr_transfer_snapshot error"];

/// Extra reply for coordinators that expect an append-style acknowledgement
pub const APPEND_ERROR_REPLY: [&str; 2] = ["check", "0"];

/// Send the transfer error reply on a blocking link
pub fn send_error_reply(link: &mut Link) {
    if link.is_closed() {
        return;
    }

    link.send(ERROR_REPLY);
    link.send_append_res(APPEND_ERROR_REPLY);
    match link.flush() {
        Ok(()) => error!("send rr_transfer_snapshot error to {:?}", link.peer()),
        Err(e) => warn!(
            "failed to send rr_transfer_snapshot error to {:?}: {}",
            link.peer(),
            e
        ),
    }
}

/// Runs snapshot transfer jobs, one at a time
pub struct ReplicationWorker {
    name: String,
}

impl ReplicationWorker {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug!("{} init", name);
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream the server's current snapshot to the job's replica
    pub fn proc(&self, job: &mut ReplicationJob) -> ReplicationResult<TransferReport> {
        self.proc_with(job, PollEvents::new())
    }

    /// Same as [`proc`](Self::proc) with a caller supplied readiness source
    pub fn proc_with<R: ReadinessSource>(
        &self,
        job: &mut ReplicationJob,
        mut events: R,
    ) -> ReplicationResult<TransferReport> {
        let context = Arc::clone(&job.context);
        let target = job.target.clone();
        info!("[{}] send snapshot to {} start (job {})", self.name, target, job.id);

        let Some((snapshot, mut accounting)) = context.status.acquire_snapshot() else {
            error!(
                "[{}] snapshot is missing, maybe rr_make_snapshot not received or failed",
                self.name
            );
            send_error_reply(&mut job.control);
            return Err(ReplicationError::SnapshotUnavailable);
        };
        let iter = context.engine.iterator(b"", b"", -1, &snapshot);

        let dest = match Link::connect(&target, context.config.connect_timeout()) {
            Ok(link) => link,
            Err(source) => {
                error!(
                    "[{}] fail to connect to replica {}: {}",
                    self.name, target, source
                );
                send_error_reply(&mut job.control);
                accounting.finish(Completion::Failed);
                return Err(ReplicationError::ConnectionFailed { target, source });
            }
        };
        accounting.mark_started();

        let cancel = job.cancel_handle();
        let mut session =
            TransferSession::new(&self.name, &mut job.control, dest, iter, &context.config);
        let outcome = session.run(&mut events, &cancel);
        let result = session.conclude(outcome, &mut events);
        let counters = accounting.finish(Completion::Finished);

        match &result {
            Ok(report) => info!(
                "[{}] send snapshot to {} finished: {} pairs in {} chunks, {:?} (state {:?})",
                self.name, target, report.pairs, report.chunks, report.elapsed, counters.state
            ),
            Err(e) => warn!(
                "[{}] send snapshot to {} aborted: {} (state {:?})",
                self.name, target, e, counters.state
            ),
        }

        result
    }
}

/// Why the streaming loop stopped
#[derive(Debug)]
enum Outcome {
    Completed,
    Cancelled,
    ControlLost,
    DestinationLost(String),
    HandshakeFailed(String),
    EventsFailed(io::Error),
}

/// Result of one round of snapshot iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pump {
    /// Replica output above the backpressure ceiling, nothing pulled
    Throttled,
    /// A full chunk was queued, more pairs may follow
    Produced,
    /// Iterator exhausted, output still pending
    Draining,
    /// Iterator exhausted and output flushed
    Done,
}

/// State of one transfer between connect and teardown
struct TransferSession<'a> {
    name: &'a str,
    control: &'a mut Link,
    dest: Link,
    iter: KvIterator<'a>,
    exhausted: bool,
    staging: BytesMut,
    config: &'a ReplicationConfig,
    report: TransferReport,
    fault: Option<String>,
    started: Instant,
}

impl<'a> TransferSession<'a> {
    fn new(
        name: &'a str,
        control: &'a mut Link,
        dest: Link,
        iter: KvIterator<'a>,
        config: &'a ReplicationConfig,
    ) -> Self {
        Self {
            name,
            control,
            dest,
            iter,
            exhausted: false,
            staging: staging_buffer(),
            config,
            report: TransferReport::default(),
            fault: None,
            started: Instant::now(),
        }
    }

    fn handshake(&mut self) -> io::Result<()> {
        self.dest.set_read_timeout(self.config.handshake_timeout())?;
        self.dest.send([self.config.handshake_command.as_str()]);
        let reply = self.dest.response()?;
        debug!(
            "[{}] replica answered {}: {:?}",
            self.name,
            self.config.handshake_command,
            reply.first()
        );

        self.dest.set_read_timeout(None)?;
        self.dest.noblock(true)
    }

    fn run<R: ReadinessSource>(&mut self, events: &mut R, cancel: &CancelHandle) -> Outcome {
        if let Err(e) = self.handshake() {
            return Outcome::HandshakeFailed(e.to_string());
        }

        debug!("[{}] prepare for event loop", self.name);
        if let Err(e) = events.register(self.control.fd(), CONTROL, Interest::READABLE) {
            return Outcome::EventsFailed(e);
        }

        let mut busy = false;
        while !cancel.is_cancelled() {
            let timeout = if busy {
                Duration::ZERO
            } else {
                self.config.idle_poll()
            };

            let ready: Vec<Event> = match events.wait(timeout) {
                Ok(ready) => ready.to_vec(),
                Err(e) => {
                    error!("[{}] events.wait error: {}", self.name, e);
                    return Outcome::EventsFailed(e);
                }
            };

            for event in &ready {
                self.service(event, events);
            }

            if self.control.error() {
                info!("[{}] link to coordinator broken", self.name);
                return Outcome::ControlLost;
            }
            if self.dest.error() {
                info!("[{}] link to replica broken", self.name);
                let reason = self
                    .fault
                    .take()
                    .unwrap_or_else(|| "replica closed the connection".to_string());
                return Outcome::DestinationLost(reason);
            }

            match self.pump(events) {
                Ok(Pump::Done) => return Outcome::Completed,
                Ok(pump) => busy = !ready.is_empty() || pump == Pump::Produced,
                Err(e) => return Outcome::EventsFailed(e),
            }
        }

        info!("[{}] transfer cancelled", self.name);
        Outcome::Cancelled
    }

    fn service<R: ReadinessSource>(&mut self, event: &Event, events: &mut R) {
        let link = match event.token {
            CONTROL => &mut *self.control,
            DESTINATION => &mut self.dest,
            _ => return,
        };

        if let Some(fault) = service_link(link, event, events) {
            self.fault = Some(fault);
        }
    }

    fn pump<R: ReadinessSource>(&mut self, events: &mut R) -> io::Result<Pump> {
        if self.dest.output.len() > self.config.backpressure_bytes {
            self.report.throttled_rounds += 1;
            trace!(
                "[{}] delay for output buffer write slow, {} bytes pending",
                self.name,
                self.dest.output.len()
            );
            return Ok(Pump::Throttled);
        }

        if !self.exhausted {
            loop {
                let Some((key, value)) = self.iter.next() else {
                    break;
                };
                append_pair(&mut self.staging, &key, &value);
                self.report.pairs += 1;

                if self.staging.len() > self.config.chunk_threshold_bytes {
                    self.emit_chunk(events)?;
                    return Ok(Pump::Produced);
                }
            }

            self.exhausted = true;
            debug!(
                "[{}] snapshot iterator exhausted after {} pairs",
                self.name, self.report.pairs
            );
        }

        if !self.staging.is_empty() {
            self.emit_chunk(events)?;
        }

        if self.dest.output.is_empty() {
            Ok(Pump::Done)
        } else {
            trace!("[{}] wait for output buffer empty", self.name);
            Ok(Pump::Draining)
        }
    }

    fn emit_chunk<R: ReadinessSource>(&mut self, events: &mut R) -> io::Result<()> {
        let size = write_chunk(&mut self.dest.output, &mut self.staging);
        self.report.chunks += 1;
        self.report.payload_bytes += size as u64;

        match self.dest.write() {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                debug!("[{}] write to replica failed: {}", self.name, e);
                self.dest.mark_error();
                self.fault = Some(e.to_string());
                return Ok(());
            }
        }

        if !self.dest.output.is_empty() {
            events.register(self.dest.fd(), DESTINATION, Interest::WRITABLE)?;
        }
        Ok(())
    }

    fn complete(&mut self) -> io::Result<()> {
        self.dest.noblock(false)?;
        put_value(&mut self.dest.output, COMPLETE_TOKEN);
        self.dest.flush()?;

        self.dest.set_read_timeout(self.config.ack_timeout())?;
        match self.dest.read() {
            Ok(0) => debug!("[{}] replica closed after complete", self.name),
            Ok(n) => debug!("[{}] replica acknowledged complete ({} bytes)", self.name, n),
            Err(e) => warn!("[{}] no acknowledgement for complete: {}", self.name, e),
        }

        self.dest.close();
        Ok(())
    }

    /// Error reply on the control link, which goes back to blocking mode first
    fn notify_control(&mut self) {
        if let Err(e) = self.control.noblock(false) {
            warn!("[{}] failed to reset control link mode: {}", self.name, e);
        }
        send_error_reply(self.control);
    }

    fn abort_destination(&mut self) {
        self.dest.close();
        self.notify_control();
        self.control.close();
    }

    /// Tear down according to `outcome`; the destination link is closed on every path
    fn conclude<R: ReadinessSource>(
        mut self,
        outcome: Outcome,
        events: &mut R,
    ) -> ReplicationResult<TransferReport> {
        events.deregister(self.dest.fd());
        events.deregister(self.control.fd());
        self.report.elapsed = self.started.elapsed();

        match outcome {
            Outcome::Completed => match self.complete() {
                Ok(()) => Ok(self.report),
                Err(e) => {
                    self.abort_destination();
                    Err(ReplicationError::DestinationLinkBroken(e.to_string()))
                }
            },
            Outcome::ControlLost => {
                self.dest.close();
                self.control.close();
                Err(ReplicationError::ControlLinkBroken)
            }
            Outcome::DestinationLost(reason) => {
                self.abort_destination();
                Err(ReplicationError::DestinationLinkBroken(reason))
            }
            Outcome::HandshakeFailed(reason) => {
                self.abort_destination();
                Err(ReplicationError::HandshakeFailed(reason))
            }
            Outcome::EventsFailed(e) => {
                self.abort_destination();
                Err(ReplicationError::EventSource(e))
            }
            Outcome::Cancelled => {
                self.dest.close();
                self.notify_control();
                Err(ReplicationError::Cancelled)
            }
        }
    }
}

/// Handle one readiness event, returning a description if the link failed
fn service_link<R: ReadinessSource>(
    link: &mut Link,
    event: &Event,
    events: &mut R,
) -> Option<String> {
    if event.readable && !link.error() {
        match link.read() {
            Ok(0) => {
                debug!("fd: {}, read: 0, peer closed", link.fd());
                link.mark_error();
                return Some("peer closed the connection".to_string());
            }
            Ok(_) => {}
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                debug!("fd: {}, read error: {}", link.fd(), e);
                link.mark_error();
                return Some(e.to_string());
            }
        }
    }

    if event.writable && !link.error() {
        if link.output.is_empty() {
            events.clear(link.fd(), Interest::WRITABLE);
            return None;
        }

        match link.write() {
            Ok(0) => {
                debug!("fd: {}, write: 0, peer stopped reading", link.fd());
                link.mark_error();
                return Some("peer stopped accepting data".to_string());
            }
            Ok(_) => {
                if link.output.is_empty() {
                    events.clear(link.fd(), Interest::WRITABLE);
                }
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => {
                debug!("fd: {}, write error: {}", link.fd(), e);
                link.mark_error();
                return Some(e.to_string());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::types::HostAndPort;
    use bytes::Bytes;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected_pair() -> (Link, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let target = HostAndPort::new("127.0.0.1", listener.local_addr().unwrap().port());
        let link = Link::connect(&target, Duration::from_secs(1)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (link, peer)
    }

    fn counting_iter(count: usize, value_size: usize, pulled: Arc<AtomicUsize>) -> KvIterator<'static> {
        Box::new((0..count).map(move |i| {
            pulled.fetch_add(1, Ordering::SeqCst);
            (
                Bytes::from(format!("key_{:05}", i)),
                Bytes::from(vec![b'v'; value_size]),
            )
        }))
    }

    #[test]
    fn test_backpressure_skips_iteration() {
        let (mut control, _coordinator) = connected_pair();
        let (mut dest, _replica) = connected_pair();
        dest.noblock(true).unwrap();

        let pulled = Arc::new(AtomicUsize::new(0));
        let config = ReplicationConfig::default();
        let mut events = PollEvents::new();
        let mut session = TransferSession::new(
            "test",
            &mut control,
            dest,
            counting_iter(100, 512, Arc::clone(&pulled)),
            &config,
        );

        session
            .dest
            .output
            .extend_from_slice(&vec![0u8; config.backpressure_bytes + 1]);
        assert_eq!(session.pump(&mut events).unwrap(), Pump::Throttled);
        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(session.report.throttled_rounds, 1);

        session.dest.output.clear();
        assert_eq!(session.pump(&mut events).unwrap(), Pump::Produced);
        assert!(pulled.load(Ordering::SeqCst) > 0);
        assert!(pulled.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn test_small_snapshot_fits_one_chunk() {
        let (mut control, _coordinator) = connected_pair();
        let (mut dest, _replica) = connected_pair();
        dest.noblock(true).unwrap();

        let pulled = Arc::new(AtomicUsize::new(0));
        let config = ReplicationConfig::default();
        let mut events = PollEvents::new();
        let mut session = TransferSession::new(
            "test",
            &mut control,
            dest,
            counting_iter(5, 100, Arc::clone(&pulled)),
            &config,
        );

        assert_eq!(session.pump(&mut events).unwrap(), Pump::Done);
        assert_eq!(session.report.pairs, 5);
        assert_eq!(session.report.chunks, 1);

        assert_eq!(session.pump(&mut events).unwrap(), Pump::Done);
        assert_eq!(session.report.chunks, 1);
        assert_eq!(pulled.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_chunks_are_cut_at_threshold() {
        let (mut control, _coordinator) = connected_pair();
        let (mut dest, _replica) = connected_pair();
        dest.noblock(true).unwrap();

        let pulled = Arc::new(AtomicUsize::new(0));
        let config = ReplicationConfig::default();
        let mut events = PollEvents::new();
        let mut session = TransferSession::new(
            "test",
            &mut control,
            dest,
            counting_iter(25, 1024, Arc::clone(&pulled)),
            &config,
        );

        let mut rounds = 0;
        loop {
            rounds += 1;
            match session.pump(&mut events).unwrap() {
                Pump::Produced => continue,
                Pump::Done => break,
                other => panic!("unexpected pump result {:?}", other),
            }
        }

        // 10 pairs of ~1KB cross the 10KB threshold, the last 5 are flushed at exhaustion
        assert_eq!(session.report.pairs, 25);
        assert_eq!(session.report.chunks, 3);
        assert_eq!(rounds, 3);
    }

    #[test]
    fn test_writable_event_with_empty_output_clears_interest() {
        let (mut link, _peer) = connected_pair();
        let mut events = PollEvents::new();
        events
            .register(link.fd(), DESTINATION, Interest::WRITABLE)
            .unwrap();

        let event = Event {
            fd: link.fd(),
            token: DESTINATION,
            readable: false,
            writable: true,
        };
        assert_eq!(service_link(&mut link, &event, &mut events), None);
        assert!(!link.error());
        assert_eq!(events.interest(link.fd()), Some(Interest::default()));
    }

    #[test]
    fn test_readable_eof_marks_error() {
        let (mut link, peer) = connected_pair();
        drop(peer);
        let mut events = PollEvents::new();

        let event = Event {
            fd: link.fd(),
            token: CONTROL,
            readable: true,
            writable: false,
        };
        assert!(service_link(&mut link, &event, &mut events).is_some());
        assert!(link.error());
    }
}
