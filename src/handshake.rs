use crate::error::WsError;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

//====================================================================================
//            RFC 6455 opening handshake: keys, upgrade request/response
//====================================================================================

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Extension offer sent (and echoed) when compression is enabled.
pub const EXTENSIONS_OFFER: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Largest upgrade request/response we are willing to buffer.
pub(crate) const MAX_HANDSHAKE_SIZE: usize = 16 * 1024;

/// `base64(sha1(key || GUID))` per RFC 6455 §4.2.2.
pub fn compute_accept_key(sec_websocket_key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(sec_websocket_key);
    sha1.update(WS_GUID);
    return BASE64_STANDARD.encode(sha1.finalize());
}

/// Random 16-byte nonce for `Sec-WebSocket-Key`.
pub(crate) fn gen_sec_websocket_key() -> String {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).expect("OS RNG unavailable");
    return BASE64_STANDARD.encode(nonce);
}

/// Offset just past the `\r\n\r\n` terminator, if present.
pub(crate) fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read from a blocking socket until the header terminator. Returns the
/// buffered bytes and the offset past the headers; anything after that
/// offset already belongs to the frame stream.
pub(crate) fn read_headers(sock: &mut impl std::io::Read) -> Result<(Vec<u8>, usize), WsError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = match sock.read(&mut chunk) {
            Ok(0) => {
                return Err(WsError::Handshake(
                    "connection closed during handshake".to_owned(),
                ))
            }
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WsError::Io(err)),
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_headers_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > MAX_HANDSHAKE_SIZE {
            return Err(WsError::Handshake("handshake headers too large".to_owned()));
        }
    }
}

fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Comma-separated header list contains `token` (case-insensitive).
fn contains_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| eq_ignore_case(trim_ascii(part), token))
}

fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = s {
        s = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = s {
        s = rest;
    }
    s
}

/// Whether a `Sec-WebSocket-Extensions` value negotiates permessage-deflate
/// with either no-context-takeover mode.
fn extensions_negotiate_deflate(value: &[u8], require_takeover_param: bool) -> bool {
    for offer in value.split(|&b| b == b',') {
        let mut params = offer.split(|&b| b == b';');
        let Some(name) = params.next() else { continue };
        if !eq_ignore_case(trim_ascii(name), b"permessage-deflate") {
            continue;
        }
        if !require_takeover_param {
            return true;
        }
        for p in params {
            let p = trim_ascii(p);
            if eq_ignore_case(p, b"server_no_context_takeover")
                || eq_ignore_case(p, b"client_no_context_takeover")
            {
                return true;
            }
        }
    }
    return false;
}

/// Validated client upgrade request.
pub(crate) struct UpgradeRequest {
    pub accept_key: String,
    pub permessage_deflate: bool,
}

/// Parse and validate a client's upgrade request (GET, HTTP/1.1,
/// Upgrade/Connection headers, version 13, a key).
pub(crate) fn parse_upgrade_request(buf: &[u8]) -> Result<UpgradeRequest, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(buf)
        .map_err(|e| WsError::Handshake(format!("bad upgrade request: {e}")))?;
    if status.is_partial() {
        return Err(WsError::Handshake("partial upgrade request".to_owned()));
    }
    if req.method != Some("GET") || req.version != Some(1) {
        return Err(WsError::Handshake("upgrade must be GET HTTP/1.1".to_owned()));
    }

    let mut key: Option<&[u8]> = None;
    let mut upgrade_ok = false;
    let mut conn_upgrade = false;
    let mut version13 = false;
    let mut deflate = false;
    for header in req.headers.iter() {
        match header.name.to_ascii_lowercase().as_str() {
            "sec-websocket-key" => key = Some(header.value),
            "upgrade" => upgrade_ok = eq_ignore_case(header.value, b"websocket"),
            "connection" => conn_upgrade = contains_token(header.value, b"upgrade"),
            "sec-websocket-version" => version13 = eq_ignore_case(header.value, b"13"),
            "sec-websocket-extensions" => {
                deflate = deflate || extensions_negotiate_deflate(header.value, false)
            }
            _ => {}
        }
    }
    if !upgrade_ok {
        return Err(WsError::UpgradeFieldValue);
    }
    if !conn_upgrade {
        return Err(WsError::ConnectionFieldValue);
    }
    if !version13 {
        return Err(WsError::Handshake("Sec-WebSocket-Version must be 13".to_owned()));
    }
    let key = key.ok_or_else(|| WsError::Handshake("missing Sec-WebSocket-Key".to_owned()))?;
    return Ok(UpgradeRequest {
        accept_key: compute_accept_key(key),
        permessage_deflate: deflate,
    });
}

/// `101 Switching Protocols` answer to a validated upgrade request.
pub(crate) fn build_upgrade_response(accept_key: &str, with_deflate: bool) -> String {
    let mut rsp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept_key}\r\n"
    );
    if with_deflate {
        rsp.push_str("Sec-WebSocket-Extensions: ");
        rsp.push_str(EXTENSIONS_OFFER);
        rsp.push_str("\r\n");
    }
    rsp.push_str("\r\n");
    return rsp;
}

/// Client upgrade request line + headers.
pub(crate) fn build_upgrade_request(
    host: &str,
    path: &str,
    key: &str,
    offer_deflate: bool,
) -> String {
    let mut req = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n"
    );
    if offer_deflate {
        req.push_str("Sec-WebSocket-Extensions: ");
        req.push_str(EXTENSIONS_OFFER);
        req.push_str("\r\n");
    }
    req.push_str("\r\n");
    return req;
}

/// Validate the server's answer against the key we sent, in the order the
/// errors are defined: status, Upgrade, Connection, accept value. Returns
/// whether permessage-deflate was accepted.
pub(crate) fn parse_upgrade_response(buf: &[u8], sent_key: &str) -> Result<bool, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut rsp = httparse::Response::new(&mut headers);
    let status = rsp
        .parse(buf)
        .map_err(|e| WsError::Handshake(format!("bad upgrade response: {e}")))?;
    if status.is_partial() {
        return Err(WsError::Handshake("partial upgrade response".to_owned()));
    }
    let code = rsp.code.unwrap_or(0);
    if code != 101 {
        return Err(WsError::WrongStatusCode(code));
    }

    let mut upgrade_ok = false;
    let mut conn_upgrade = false;
    let mut accept: Option<Vec<u8>> = None;
    let mut deflate = false;
    for header in rsp.headers.iter() {
        match header.name.to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = eq_ignore_case(header.value, b"websocket"),
            "connection" => conn_upgrade = contains_token(header.value, b"upgrade"),
            "sec-websocket-accept" => accept = Some(header.value.to_vec()),
            "sec-websocket-extensions" => {
                deflate = deflate || extensions_negotiate_deflate(header.value, true)
            }
            _ => {}
        }
    }
    if !upgrade_ok {
        return Err(WsError::UpgradeFieldValue);
    }
    if !conn_upgrade {
        return Err(WsError::ConnectionFieldValue);
    }
    let expected = compute_accept_key(sent_key.as_bytes());
    match accept {
        Some(v) if eq_ignore_case(&v, expected.as_bytes()) => {}
        _ => return Err(WsError::SecWebSocketAccept),
    }
    return Ok(deflate);
}
