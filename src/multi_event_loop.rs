use crate::conn::Conn;
use crate::event_loop::EventLoop;
use crate::logmsg;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

//====================================================================================
//            MultiEventLoop: fixed reactor pool with fd affinity
//====================================================================================

/// A fixed pool of reactors. Every connection is routed to the reactor at
/// `fd mod N` for its whole lifetime, so one connection's callbacks are
/// always serialized on the same thread. Stopping is cooperative: each
/// reactor observes the stop flag between poll waits, closes its remaining
/// connections and exits.
pub struct MultiEventLoop {
    loops: Vec<Arc<EventLoop>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    stopcmd: Arc<AtomicBool>,
}

impl MultiEventLoop {
    /// Create `num_loops` reactors (not yet running).
    pub fn new(num_loops: usize) -> io::Result<Arc<Self>> {
        let num_loops = num_loops.max(1);
        let mut loops = Vec::with_capacity(num_loops);
        for i in 0..num_loops {
            loops.push(Arc::new(EventLoop::new(i)?));
        }
        Ok(Arc::new(Self {
            loops,
            threads: Mutex::new(Vec::new()),
            stopcmd: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn num_loops(&self) -> usize {
        self.loops.len()
    }

    /// Connections across all reactors.
    pub fn len(&self) -> usize {
        self.loops.iter().map(|l| l.len()).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn one OS thread per reactor.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return;
        }
        for (i, el) in self.loops.iter().enumerate() {
            let el = Arc::clone(el);
            let stopcmd = Arc::clone(&self.stopcmd);
            let thread = std::thread::Builder::new()
                .name(format!("reactws-loop-{}", i))
                .spawn(move || {
                    el.run(&stopcmd);
                })
                .expect("failed to spawn reactor thread");
            threads.push(thread);
        }
        logmsg!("started {} reactor threads", self.loops.len());
    }

    /// Cooperative drain: raise the stop flag, wake every poller, join.
    pub fn shutdown(&self) {
        self.stopcmd.store(true, Ordering::Release);
        for el in &self.loops {
            let _ = el.poller().notify();
        }
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for t in threads {
            let _ = t.join();
        }
    }

    fn loop_for(&self, fd: RawFd) -> &Arc<EventLoop> {
        &self.loops[fd as usize % self.loops.len()]
    }

    /// Route a freshly upgraded connection to its reactor and register it
    /// for read readiness. Failure is fatal for this connection only.
    pub(crate) fn add(&self, conn: &Arc<Conn>) -> io::Result<()> {
        let el = self.loop_for(conn.fd());
        conn.set_parent(Arc::clone(el));
        el.add_conn(conn)
    }

    /// Look up a connection by fd in its owning reactor.
    pub fn get_conn(&self, fd: RawFd) -> Option<Arc<Conn>> {
        self.loop_for(fd).get_conn(fd)
    }
}

impl Drop for MultiEventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
