use crate::callback::Callback;
use crate::config::Config;
use crate::conn::Conn;
use crate::error::WsError;
use crate::handshake::{build_upgrade_response, parse_upgrade_request, read_headers};
use crate::logmsg;
use crate::multi_event_loop::MultiEventLoop;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

//====================================================================================
//            Accept-and-upgrade front end for the reactor pool
//====================================================================================

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Accepts TCP connections, performs the opening handshake, and hands every
/// upgraded socket to the reactor pool. Speaks only enough HTTP/1.1 for the
/// upgrade itself.
pub struct WsServer {
    listener: TcpListener,
    config: Config,
    callback: Arc<dyn Callback>,
    pool: Arc<MultiEventLoop>,
}

/// Running accept thread; dropping it stops the loop.
pub struct ServerHandle {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl WsServer {
    /// \local_addr  ip:port, e.g. "127.0.0.1:9001"
    pub fn bind(
        local_addr: &str,
        config: Config,
        callback: Arc<dyn Callback>,
        pool: Arc<MultiEventLoop>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(local_addr)?;
        Ok(Self {
            listener,
            config,
            callback,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept thread.
    pub fn start(self) -> io::Result<ServerHandle> {
        let addr = self.listener.local_addr()?;
        self.listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("reactws-accept".to_owned())
            .spawn(move || self.accept_loop(&stop2))?;
        Ok(ServerHandle {
            addr,
            stop,
            thread: Some(thread),
        })
    }

    fn accept_loop(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((sock, addr)) => {
                    if let Err(err) =
                        upgrade_and_register(sock, &self.config, &self.callback, &self.pool)
                    {
                        logmsg!("upgrade from {} failed: {}", addr, err);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_IDLE_SLEEP);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logmsg!("accept error: {}", err);
                    std::thread::sleep(ACCEPT_IDLE_SLEEP);
                }
            }
        }
        logmsg!("accept loop exited");
    }
}

/// Blocking upgrade on the accept thread, then non-blocking registration
/// with the pool. A connection that cannot be registered is torn down; the
/// server keeps accepting.
fn upgrade_and_register(
    mut sock: TcpStream,
    config: &Config,
    callback: &Arc<dyn Callback>,
    pool: &Arc<MultiEventLoop>,
) -> Result<(), WsError> {
    let _ = sock.set_nodelay(config.tcp_no_delay);
    sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(WsError::Io)?;

    let (buf, end) = read_headers(&mut sock)?;
    let request = parse_upgrade_request(&buf[..end])?;
    // advertise the extension if either direction may use it; each flag
    // then binds independently to what was negotiated
    let negotiated =
        request.permessage_deflate && (config.compression || config.decompression);
    let response = build_upgrade_response(&request.accept_key, negotiated);
    sock.write_all(response.as_bytes()).map_err(WsError::Io)?;
    let compression = config.compression && negotiated;
    let decompression = config.decompression && negotiated;

    sock.set_read_timeout(None).map_err(WsError::Io)?;
    sock.set_nonblocking(true).map_err(WsError::Io)?;

    let conn = Conn::new(
        sock,
        false,
        compression,
        decompression,
        config.clone(),
        Arc::clone(callback),
    );
    // Frame bytes the client pipelined behind its request go first.
    conn.preload(&buf[end..]);
    // Register before on_open so a write issued from the callback can arm
    // write readiness; dispatch stays blocked so on_open still precedes
    // any on_message.
    let registered = conn.with_dispatch_blocked(|| -> io::Result<()> {
        pool.add(&conn)?;
        conn.announce_open();
        Ok(())
    });
    if let Err(err) = registered {
        conn.close_with_error(Some(WsError::Io(io::Error::from(err.kind()))));
        return Err(WsError::Io(err));
    }
    conn.dispatch_buffered();
    return Ok(());
}
