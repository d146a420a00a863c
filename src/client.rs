use crate::callback::Callback;
use crate::config::Config;
use crate::conn::Conn;
use crate::error::WsError;
use crate::handshake::{
    build_upgrade_request, gen_sec_websocket_key, parse_upgrade_response, read_headers,
};
use crate::multi_event_loop::MultiEventLoop;
use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

//====================================================================================
//            Client handshake driver: dial, validate, register
//====================================================================================

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed `ws://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub tls: bool,
}

impl WsUrl {
    /// Accepts `ws://host[:port][/path]` and `wss://...` (the latter is
    /// recognized but `dial` rejects it: TLS wrapping is external).
    pub fn parse(url: &str) -> Result<Self, WsError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| WsError::Handshake("missing scheme".to_owned()))?;
        let tls = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(WsError::Handshake(format!(
                    "unsupported scheme: {other}, only ws:// or wss://"
                )))
            }
        };
        let default_port = if tls { 443 } else { 80 };
        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if host_port.is_empty() {
            return Err(WsError::Handshake("missing host".to_owned()));
        }
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| WsError::Handshake(format!("invalid port: {p}")))
        };
        let (host, port) = if let Some(bracket_end) = host_port.find(']') {
            // IPv6 literal, e.g. [::1]:8080
            let host = host_port
                .strip_prefix('[')
                .ok_or_else(|| WsError::Handshake("malformed IPv6 host".to_owned()))?
                [..bracket_end - 1]
                .to_owned();
            match host_port[bracket_end + 1..].strip_prefix(':') {
                Some(p) => (host, parse_port(p)?),
                None => (host, default_port),
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((h, p)) => (h.to_owned(), parse_port(p)?),
                None => (host_port.to_owned(), default_port),
            }
        };
        return Ok(WsUrl {
            host,
            port,
            path: path.to_owned(),
            tls,
        });
    }

    fn host_header(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Connect, run the opening handshake, and register the connection with the
/// reactor pool. `on_open` fires before this returns; handshake errors
/// bubble out and the socket is closed.
pub fn dial(
    url: &str,
    config: Config,
    callback: Arc<dyn Callback>,
    pool: &Arc<MultiEventLoop>,
) -> Result<Arc<Conn>, WsError> {
    let u = WsUrl::parse(url)?;
    if u.tls {
        return Err(WsError::Handshake(
            "wss:// requires an external TLS wrapper".to_owned(),
        ));
    }
    let mut sock = TcpStream::connect((u.host.as_str(), u.port)).map_err(WsError::Io)?;
    let _ = sock.set_nodelay(config.tcp_no_delay);
    sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT))
        .map_err(WsError::Io)?;

    let key = gen_sec_websocket_key();
    let offer_deflate = config.compression && config.decompression;
    let request = build_upgrade_request(&u.host_header(), &u.path, &key, offer_deflate);
    sock.write_all(request.as_bytes()).map_err(WsError::Io)?;

    let (buf, end) = read_headers(&mut sock)?;
    let negotiated = parse_upgrade_response(&buf[..end], &key)?;
    let compression = config.compression && negotiated;
    let decompression = config.decompression && negotiated;

    sock.set_read_timeout(None).map_err(WsError::Io)?;
    sock.set_nonblocking(true).map_err(WsError::Io)?;

    let conn = Conn::new(sock, true, compression, decompression, config, callback);
    // Frame bytes the server pipelined behind its response go first.
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
    return Ok(conn);
}
