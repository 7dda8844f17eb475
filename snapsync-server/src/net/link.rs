use crate::protocol::{ProtocolError, encode_block, parse_block};
use crate::replication::types::HostAndPort;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 16 * 1024;

/// Returns true for errors that only mean "try again after the next readiness event"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Duplex byte stream with its own input and output buffers
///
/// `read` appends to `input`, `write` drains `output`. The link only
/// remembers failures through its error flag; deciding what to do with a
/// broken link is left to the owner.
pub struct Link {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    pub input: BytesMut,
    pub output: BytesMut,
    error: bool,
    noblock: bool,
    closed: bool,
    append_reply: bool,
}

impl Link {
    /// Connect to `target`, trying every resolved address in turn
    pub fn connect(target: &HostAndPort, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;

        for addr in (target.ip.as_str(), target.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for {}", target),
            )
        }))
    }

    /// Wrap an already connected stream (blocking mode)
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();

        Ok(Self {
            stream,
            peer,
            input: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::with_capacity(READ_CHUNK),
            error: false,
            noblock: false,
            closed: false,
            append_reply: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn mark_error(&mut self) {
        self.error = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_noblock(&self) -> bool {
        self.noblock
    }

    pub fn append_reply(&self) -> bool {
        self.append_reply
    }

    /// Whether error replies on this link carry the extra `check` block
    pub fn set_append_reply(&mut self, enabled: bool) {
        self.append_reply = enabled;
    }

    /// Switch between non-blocking and blocking mode
    pub fn noblock(&mut self, enabled: bool) -> io::Result<()> {
        self.stream.set_nonblocking(enabled)?;
        self.noblock = enabled;
        Ok(())
    }

    /// Bound blocking reads (`None` waits forever)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Read available bytes into `input`
    ///
    /// `Ok(0)` means the peer closed the connection. In non-blocking mode a
    /// `WouldBlock` error is returned when nothing could be read.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    self.input.extend_from_slice(&chunk[..n]);
                    total += n;
                    if !self.noblock || n < chunk.len() {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write as much of `output` as the socket accepts
    ///
    /// In blocking mode this drains `output` completely. `Ok(0)` with pending
    /// output means the peer stopped accepting data.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;

        while !self.output.is_empty() {
            match self.stream.write(&self.output) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.advance(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => break,
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }

    /// Blocking write of the whole output buffer
    pub fn flush(&mut self) -> io::Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.output)?;
        self.output.clear();
        self.stream.flush()
    }

    /// Queue one block on the output buffer
    pub fn send<I, T>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        encode_block(&mut self.output, tokens);
    }

    /// Queue the supplementary reply sent to peers expecting append-style acks
    pub fn send_append_res<I, T>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        if self.append_reply {
            encode_block(&mut self.output, tokens);
        }
    }

    /// Take one complete block from `input` if there is one
    pub fn recv(&mut self) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        parse_block(&mut self.input)
    }

    /// Blocking request/response: flush `output` and wait for one block
    ///
    /// Must be called in blocking mode.
    pub fn response(&mut self) -> io::Result<Vec<Bytes>> {
        self.flush()?;

        loop {
            if let Some(block) = self
                .recv()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            {
                return Ok(block);
            }

            if self.read()? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before a full response",
                ));
            }
        }
    }

    /// Shut the connection down; calling it again is a no-op
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of link {:?} failed: {}", self.peer, e);
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("fd", &self.fd())
            .field("peer", &self.peer)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("error", &self.error)
            .field("noblock", &self.noblock)
            .field("closed", &self.closed)
            .finish()
    }
}
