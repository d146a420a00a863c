use polling::{Event, Events, PollMode, Poller};
use std::io;
use std::net::TcpStream;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

//====================================================================================
//            Uniform poll backend (epoll on Linux, kqueue on BSD/macOS)
//====================================================================================

/// Readiness report for one fd. A completion-based backend would synthesize
/// the same record from its completion entries.
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
    pub hangup: bool,
}

/// Thin uniform interface over the platform poller. Sockets are registered
/// level-triggered with the fd as the event key; callers still drain until
/// WouldBlock. All operations are callable from any thread.
pub struct IoPoller {
    poller: Poller,
}

impl IoPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
        })
    }

    /// Register an fd for read readiness. Failure here is fatal for the
    /// connection, not for the reactor.
    pub fn add_read(&self, sock: &TcpStream, fd: RawFd) -> io::Result<()> {
        unsafe {
            self.poller
                .add_with_mode(sock, Event::readable(fd as usize), PollMode::Level)
        }
    }

    /// Upgrade an fd already registered for read to read+write.
    pub fn add_write(&self, fd: RawFd) -> io::Result<()> {
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(source, Event::all(fd as usize), PollMode::Level)
    }

    /// Downgrade back to read-only interest.
    pub fn del_write(&self, fd: RawFd) -> io::Result<()> {
        let source = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(source, Event::readable(fd as usize), PollMode::Level)
    }

    pub fn del(&self, sock: &TcpStream) -> io::Result<()> {
        self.poller.delete(sock)
    }

    /// Block for up to `timeout` and translate backend events into `out`.
    pub fn wait(
        &self,
        scratch: &mut Events,
        out: &mut Vec<IoEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        scratch.clear();
        out.clear();
        self.poller.wait(scratch, timeout)?;
        for ev in scratch.iter() {
            out.push(IoEvent {
                fd: ev.key as RawFd,
                readable: ev.readable,
                writable: ev.writable,
                errored: ev.is_err().unwrap_or(false),
                hangup: ev.is_interrupt(),
            });
        }
        return Ok(out.len());
    }

    /// Wake a blocked `wait`, used by cooperative shutdown.
    pub fn notify(&self) -> io::Result<()> {
        self.poller.notify()
    }
}
