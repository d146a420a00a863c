use crate::conn::Conn;
use crate::dbglog;
use crate::error::WsError;
use crate::logmsg;
use crate::poller::{IoEvent, IoPoller};
use crate::utils;
use polling::Events;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

//====================================================================================
//            EventLoop: one reactor thread over one poll backend
//====================================================================================

/// Poll timeout; bounds how late a read-deadline sweep or a shutdown signal
/// can be observed.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// One reactor: a poll backend plus the connections affined to it. The loop
/// body runs on a single thread; the connection map is a concurrent map only
/// so that accept/dial threads can register new fds.
pub struct EventLoop {
    id: usize,
    poller: IoPoller,
    conns: Mutex<HashMap<RawFd, Arc<Conn>>>,
}

impl EventLoop {
    pub(crate) fn new(id: usize) -> io::Result<Self> {
        Ok(Self {
            id,
            poller: IoPoller::new()?,
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }
    /// Number of connections currently owned by this reactor.
    pub fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn poller(&self) -> &IoPoller {
        &self.poller
    }

    /// Register a connection for read readiness. A failure is fatal for the
    /// connection only; the caller closes it.
    pub(crate) fn add_conn(&self, conn: &Arc<Conn>) -> io::Result<()> {
        let fd = conn.fd();
        self.conns.lock().unwrap().insert(fd, Arc::clone(conn));
        if let Err(err) = self.poller.add_read(conn.sock(), fd) {
            self.conns.lock().unwrap().remove(&fd);
            return Err(err);
        }
        dbglog!("loop-{} added fd {}", self.id, fd);
        return Ok(());
    }

    pub(crate) fn remove_conn(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.conns.lock().unwrap().remove(&fd)
    }

    pub fn get_conn(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.conns.lock().unwrap().get(&fd).cloned()
    }

    pub(crate) fn request_write(&self, fd: RawFd) -> io::Result<()> {
        self.poller.add_write(fd)
    }
    pub(crate) fn end_write(&self, fd: RawFd) -> io::Result<()> {
        self.poller.del_write(fd)
    }

    /// The reactor body. Exits when `stop` is raised, closing whatever
    /// connections remain. No connection error escapes an iteration.
    pub(crate) fn run(&self, stop: &AtomicBool) {
        let mut scratch = Events::new();
        let mut events: Vec<IoEvent> = Vec::new();
        while !stop.load(Ordering::Acquire) {
            match self.poller.wait(&mut scratch, &mut events, Some(POLL_TIMEOUT)) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logmsg!("loop-{} poll error: {}", self.id, err);
                    continue;
                }
            }
            for ev in &events {
                let conn = self.get_conn(ev.fd);
                let Some(conn) = conn else {
                    // already torn down while the event was in flight
                    dbglog!("loop-{} event for removed fd {}", self.id, ev.fd);
                    continue;
                };
                // readable strictly before writable for the same fd
                if ev.readable {
                    conn.read_and_dispatch();
                }
                if ev.writable {
                    conn.flush_or_close();
                }
                if ev.errored || ev.hangup {
                    conn.close_with_error(Some(WsError::Io(io::Error::from(
                        io::ErrorKind::ConnectionReset,
                    ))));
                }
            }
            self.sweep_read_deadlines();
        }
        self.close_remaining();
        logmsg!("loop-{} exited", self.id);
    }

    /// Read deadlines are consulted at poll wake, not enforced mid-wait.
    fn sweep_read_deadlines(&self) {
        let stale: Vec<Arc<Conn>> = {
            let conns = self.conns.lock().unwrap();
            if conns.is_empty() {
                return;
            }
            let now = utils::now_nanos();
            conns
                .values()
                .filter(|c| c.read_deadline_expired(now))
                .cloned()
                .collect()
        };
        for conn in stale {
            logmsg!("loop-{} read timeout on fd {}", self.id, conn.fd());
            conn.close_with_error(Some(WsError::Io(io::Error::from(io::ErrorKind::TimedOut))));
        }
    }

    fn close_remaining(&self) {
        let remaining: Vec<Arc<Conn>> =
            self.conns.lock().unwrap().values().cloned().collect();
        for conn in remaining {
            conn.close_with_error(None);
        }
    }
}
