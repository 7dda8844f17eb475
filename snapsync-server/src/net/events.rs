//! Readiness notification for the transfer loop
//!
//! `ReadinessSource` is the seam between the transfer state machine and the
//! OS multiplexer. `PollEvents` implements it on top of poll(2).

use nix::libc;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Opaque tag returned with every event for a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// Interest set for a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// One readiness notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
}

/// Register/deregister descriptors and wait for readiness with a timeout
pub trait ReadinessSource {
    /// Add `interest` for `fd`, registering it if needed
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Remove `interest` for `fd`; the descriptor stays registered
    fn clear(&mut self, fd: RawFd, interest: Interest);

    /// Forget `fd` entirely
    fn deregister(&mut self, fd: RawFd);

    /// Wait up to `timeout` for readiness. An error is fatal for the caller.
    fn wait(&mut self, timeout: Duration) -> io::Result<&[Event]>;
}

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    token: Token,
    interest: Interest,
}

/// poll(2) backed readiness source
#[derive(Default)]
pub struct PollEvents {
    registrations: Vec<Registration>,
    pollfds: Vec<libc::pollfd>,
    ready: Vec<Event>,
}

impl PollEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.iter().any(|r| r.fd == fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.registrations
            .iter()
            .find(|r| r.fd == fd)
            .map(|r| r.interest)
    }
}

impl ReadinessSource for PollEvents {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid file descriptor",
            ));
        }

        match self.registrations.iter_mut().find(|r| r.fd == fd) {
            Some(reg) => {
                reg.token = token;
                reg.interest.readable |= interest.readable;
                reg.interest.writable |= interest.writable;
            }
            None => self.registrations.push(Registration {
                fd,
                token,
                interest,
            }),
        }
        Ok(())
    }

    fn clear(&mut self, fd: RawFd, interest: Interest) {
        if let Some(reg) = self.registrations.iter_mut().find(|r| r.fd == fd) {
            reg.interest.readable &= !interest.readable;
            reg.interest.writable &= !interest.writable;
        }
    }

    fn deregister(&mut self, fd: RawFd) {
        self.registrations.retain(|r| r.fd != fd);
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<&[Event]> {
        self.ready.clear();
        self.pollfds.clear();

        for reg in self.registrations.iter().filter(|r| !r.interest.is_empty()) {
            let mut events = 0;
            if reg.interest.readable {
                events |= libc::POLLIN;
            }
            if reg.interest.writable {
                events |= libc::POLLOUT;
            }
            self.pollfds.push(libc::pollfd {
                fd: reg.fd,
                events,
                revents: 0,
            });
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // Safety: the pointer and length describe the initialized `pollfds` vector,
        // which is not touched again until poll returns.
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(&self.ready);
            }
            return Err(err);
        }

        for pfd in self.pollfds.iter().filter(|p| p.revents != 0) {
            if pfd.revents & libc::POLLNVAL != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("fd {} is not open", pfd.fd),
                ));
            }

            let Some(reg) = self.registrations.iter().find(|r| r.fd == pfd.fd) else {
                continue;
            };
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0;

            self.ready.push(Event {
                fd: pfd.fd,
                token: reg.token,
                readable: pfd.revents & libc::POLLIN != 0
                    || (failed && reg.interest.readable),
                writable: pfd.revents & libc::POLLOUT != 0
                    || (failed && reg.interest.writable),
            });
        }

        Ok(&self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_times_out_without_events() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut events = PollEvents::new();
        events
            .register(a.as_raw_fd(), Token(1), Interest::READABLE)
            .unwrap();

        let ready = events.wait(Duration::from_millis(5)).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn test_readable_and_writable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut events = PollEvents::new();
        events
            .register(a.as_raw_fd(), Token(7), Interest::READABLE)
            .unwrap();
        b.write_all(b"x").unwrap();

        let ready = events.wait(Duration::from_millis(100)).unwrap().to_vec();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, Token(7));
        assert!(ready[0].readable);
        assert!(!ready[0].writable);

        events
            .register(a.as_raw_fd(), Token(7), Interest::WRITABLE)
            .unwrap();
        let ready = events.wait(Duration::from_millis(100)).unwrap();
        assert!(ready[0].writable);
    }

    #[test]
    fn test_clear_and_deregister() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let mut events = PollEvents::new();
        events
            .register(fd, Token(0), Interest::WRITABLE)
            .unwrap();
        events.register(fd, Token(0), Interest::READABLE).unwrap();
        assert_eq!(
            events.interest(fd),
            Some(Interest {
                readable: true,
                writable: true
            })
        );

        events.clear(fd, Interest::WRITABLE);
        assert_eq!(events.interest(fd), Some(Interest::READABLE));
        assert!(events.wait(Duration::ZERO).unwrap().is_empty());

        events.deregister(fd);
        assert!(!events.is_registered(fd));
    }

    #[test]
    fn test_hangup_reported_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut events = PollEvents::new();
        events
            .register(a.as_raw_fd(), Token(2), Interest::READABLE)
            .unwrap();
        drop(b);

        let ready = events.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
    }
}
