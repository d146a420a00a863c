use crate::callback::Callback;
use crate::config::Config;
use crate::deflate::{deflate_no_context_takeover, inflate_no_context_takeover};
use crate::dbglog;
use crate::error::WsError;
use crate::event_loop::EventLoop;
use crate::frame::{
    close_payload, encode_frame, valid_close_code, FrameHeader, Opcode, CLOSE_INVALID_PAYLOAD_DATA,
    CLOSE_PROTOCOL_ERROR, MAX_CONTROL_FRAME_SIZE, MAX_FRAME_HEADER_SIZE,
};
use crate::parser::{FrameParser, ReadBuf};
use crate::utils;
use std::borrow::Cow;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

//====================================================================================
//            Connection: read-and-parse, frame dispatch, write path, close
//====================================================================================

/// In-flight fragmented message. At most one per connection; control frames
/// may interleave while it accumulates.
#[derive(Default)]
struct Fragment {
    opcode: Option<Opcode>,
    rsv1: bool,
    payload: Vec<u8>,
}

/// State touched only by the owning reactor thread.
struct ReadState {
    buf: ReadBuf,
    parser: FrameParser,
    frag: Fragment,
    min_spare: usize,
}

impl ReadState {
    fn new(init_rbuf_size: usize) -> Self {
        Self {
            buf: ReadBuf::new(init_rbuf_size),
            parser: FrameParser::default(),
            frag: Fragment::default(),
            min_spare: init_rbuf_size,
        }
    }
}

/// State shared between user write calls and the reactor's flush path.
/// `wbuf` is non-empty iff the fd is armed for write readiness.
#[derive(Default)]
struct WriteState {
    wbuf: Vec<u8>,
    interested_write: bool,
}

/// One WebSocket connection owned by exactly one reactor (fixed at
/// registration by `fd mod N`). Reads, parsing and callbacks run on that
/// reactor's thread; `write_message` may be called from any thread and is
/// serialized by the write mutex, which the read path never takes.
pub struct Conn {
    sock: TcpStream,
    fd: AtomicI32,
    client: bool,
    compression: bool,
    decompression: bool,
    pub(crate) config: Config,
    callback: Arc<dyn Callback>,
    read: Mutex<ReadState>,
    write: Mutex<WriteState>,
    closed: AtomicBool,
    parent: Mutex<Option<Arc<EventLoop>>>,
    last_read_nanos: AtomicI64,
}

fn random_mask_key() -> u32 {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).expect("OS RNG unavailable");
    u32::from_le_bytes(key)
}

impl Conn {
    pub(crate) fn new(
        sock: TcpStream,
        client: bool,
        compression: bool,
        decompression: bool,
        config: Config,
        callback: Arc<dyn Callback>,
    ) -> Arc<Conn> {
        let fd = sock.as_raw_fd();
        let init_rbuf = config.init_rbuf_size();
        Arc::new(Conn {
            sock,
            fd: AtomicI32::new(fd),
            client,
            compression,
            decompression,
            config,
            callback,
            read: Mutex::new(ReadState::new(init_rbuf)),
            write: Mutex::new(WriteState::default()),
            closed: AtomicBool::new(false),
            parent: Mutex::new(None),
            last_read_nanos: AtomicI64::new(utils::now_nanos()),
        })
    }

    /// Raw socket handle; -1 once the connection is closed.
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.sock.peer_addr()
    }
    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.sock.local_addr()
    }

    pub(crate) fn sock(&self) -> &TcpStream {
        &self.sock
    }
    pub(crate) fn set_parent(&self, el: Arc<EventLoop>) {
        *self.parent.lock().unwrap() = Some(el);
    }
    fn parent(&self) -> Option<Arc<EventLoop>> {
        self.parent.lock().unwrap().clone()
    }
    pub(crate) fn announce_open(self: &Arc<Self>) {
        self.callback.on_open(self);
    }
    /// Run `f` with the read state held: no frame can be dispatched until
    /// registration and `on_open` have completed.
    pub(crate) fn with_dispatch_blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _rs = self.read.lock().unwrap();
        f()
    }
    pub(crate) fn read_deadline_expired(&self, now_nanos: i64) -> bool {
        match self.config.read_timeout {
            Some(t) => {
                now_nanos - self.last_read_nanos.load(Ordering::Relaxed) > t.as_nanos() as i64
            }
            None => false,
        }
    }

    //------------------------------------------------------------------------------
    //            Write path
    //------------------------------------------------------------------------------

    /// Encode and send one message. Text payloads are UTF-8 validated first;
    /// data payloads are deflated when compression was negotiated; client
    /// connections mask with a random key. Bytes that cannot be sent without
    /// blocking are queued and flushed on the next writable event.
    pub fn write_message(self: &Arc<Self>, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WsError::Closed);
        }
        if opcode == Opcode::Text
            && self.config.utf8_check
            && std::str::from_utf8(payload).is_err()
        {
            return Err(WsError::TextNotUTF8);
        }
        let rsv1 = self.compression && !opcode.is_control() && opcode != Opcode::Continuation;
        let deflated;
        let body: &[u8] = if rsv1 {
            deflated = deflate_no_context_takeover(payload)?;
            &deflated
        } else {
            payload
        };
        let mask = if self.client {
            Some(random_mask_key())
        } else {
            None
        };
        let mut out = Vec::with_capacity(body.len() + MAX_FRAME_HEADER_SIZE);
        encode_frame(&mut out, true, rsv1, opcode, body, mask)?;
        match self.send_or_queue(&out) {
            Ok(()) => Ok(()),
            Err(WsError::Io(err)) => {
                let ret = io::Error::from(err.kind());
                self.close_with_error(Some(WsError::Io(err)));
                Err(WsError::Io(ret))
            }
            Err(err) => Err(err),
        }
    }

    fn send_or_queue(self: &Arc<Self>, buf: &[u8]) -> Result<(), WsError> {
        let mut w = self.write.lock().unwrap();
        if w.wbuf.is_empty() {
            return self.write_or_arm(&mut w, buf);
        }
        // bytes are already queued; keep wire order
        let mut pending = std::mem::take(&mut w.wbuf);
        pending.extend_from_slice(buf);
        return self.write_or_arm(&mut w, &pending);
    }

    /// Send as much as the socket takes; stash the remainder in `wbuf` and
    /// request write readiness on WouldBlock. Caller holds the write mutex
    /// with an empty `wbuf`.
    fn write_or_arm(&self, w: &mut WriteState, mut data: &[u8]) -> Result<(), WsError> {
        while !data.is_empty() {
            match (&self.sock).write(data) {
                Ok(0) => {
                    return Err(WsError::Io(io::Error::from(ErrorKind::WriteZero)));
                }
                Ok(n) => data = &data[n..],
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    w.wbuf.extend_from_slice(data);
                    self.arm_write(w);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WsError::Io(err)),
            }
        }
        return Ok(());
    }

    fn arm_write(&self, w: &mut WriteState) {
        if w.interested_write {
            return;
        }
        if let Some(el) = self.parent() {
            match el.request_write(self.fd()) {
                Ok(()) => w.interested_write = true,
                Err(err) => {
                    dbglog!("failed to arm write on fd {}: {}", self.fd(), err);
                }
            }
        }
    }

    fn disarm_write(&self, w: &mut WriteState) {
        if !w.interested_write {
            return;
        }
        if let Some(el) = self.parent() {
            let _ = el.end_write(self.fd());
        }
        w.interested_write = false;
    }

    /// Reactor entry on a writable event: drain `wbuf`; on success drop the
    /// write interest, on a permanent error tear the connection down.
    pub(crate) fn flush_or_close(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let res = {
            let mut w = self.write.lock().unwrap();
            if w.wbuf.is_empty() {
                self.disarm_write(&mut w);
                Ok(())
            } else {
                let pending = std::mem::take(&mut w.wbuf);
                let r = self.write_or_arm(&mut w, &pending);
                if r.is_ok() && w.wbuf.is_empty() {
                    self.disarm_write(&mut w);
                }
                r
            }
        };
        if let Err(err) = res {
            self.close_with_error(Some(err));
        }
    }

    //------------------------------------------------------------------------------
    //            Read path
    //------------------------------------------------------------------------------

    /// Reactor entry on a readable event: drain the socket until WouldBlock,
    /// advancing the parser and dispatching every complete frame.
    pub(crate) fn read_and_dispatch(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let res = {
            let mut rs = self.read.lock().unwrap();
            self.read_loop(&mut rs)
        };
        if let Err(err) = res {
            match err {
                // the dispatcher already sent a close frame and tore down
                WsError::Closed => {}
                err => self.close_with_error(Some(err)),
            }
        }
    }

    /// Parse frames already buffered past the handshake headers, before the
    /// first readable event can fire.
    pub(crate) fn dispatch_buffered(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let res = {
            let mut rs = self.read.lock().unwrap();
            if rs.buf.avail() == 0 {
                Ok(())
            } else {
                self.drain_frames(&mut rs)
            }
        };
        if let Err(err) = res {
            match err {
                WsError::Closed => {}
                err => self.close_with_error(Some(err)),
            }
        }
    }

    pub(crate) fn preload(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.read.lock().unwrap().buf.preload(bytes);
    }

    fn read_loop(self: &Arc<Self>, rs: &mut ReadState) -> Result<(), WsError> {
        loop {
            rs.buf.compact();
            rs.buf.ensure_space(rs.min_spare, rs.parser.expected_payload());
            let n = match (&self.sock).read(rs.buf.writable()) {
                Ok(0) => {
                    return Err(WsError::Io(io::Error::from(ErrorKind::UnexpectedEof)));
                }
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WsError::Io(err)),
            };
            rs.buf.advance_write(n);
            self.last_read_nanos
                .store(utils::now_nanos(), Ordering::Relaxed);
            self.drain_frames(rs)?;
        }
    }

    fn drain_frames(self: &Arc<Self>, rs: &mut ReadState) -> Result<(), WsError> {
        loop {
            let next = {
                let ReadState { buf, parser, .. } = rs;
                parser.next_frame(buf)
            };
            match next {
                Err(err) => return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, err)),
                Ok(None) => return Ok(()),
                Ok(Some((header, range))) => {
                    let ReadState { buf, frag, .. } = rs;
                    let payload = buf.slice(range);
                    self.handle_frame(&header, payload, frag)?;
                }
            }
        }
    }

    //------------------------------------------------------------------------------
    //            Frame dispatch policy
    //------------------------------------------------------------------------------

    fn handle_frame(
        self: &Arc<Self>,
        h: &FrameHeader,
        payload: &[u8],
        frag: &mut Fragment,
    ) -> Result<(), WsError> {
        // rsv1 is legal only on data frames when decompression was
        // negotiated; a continuation inherits the first frame's opcode.
        let op_opt = Opcode::from_u8(h.opcode);
        let policy_op = match (frag.opcode, op_opt) {
            (Some(first), Some(op)) if !op.is_control() => Some(first),
            _ => op_opt,
        };
        let rsv1_ok =
            self.decompression && matches!(policy_op, Some(Opcode::Text | Opcode::Binary));
        if (h.rsv1 && !rsv1_ok) || h.rsv2 || h.rsv3 {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::Rsv123));
        }
        let Some(op) = op_opt else {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::Opcode(h.opcode)));
        };

        if op.is_control() {
            if h.payload_len > MAX_CONTROL_FRAME_SIZE as u64 {
                return Err(self.protocol_error(
                    CLOSE_PROTOCOL_ERROR,
                    WsError::MaxControlFrameSize(h.payload_len as usize),
                ));
            }
            if !h.fin {
                return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::NotBeFragmented));
            }
            return match op {
                Opcode::Close => self.handle_close(payload),
                Opcode::Ping => {
                    if self.config.reply_ping {
                        self.write_message(Opcode::Pong, payload)?;
                    }
                    self.callback.on_message(self, Opcode::Ping, payload);
                    Ok(())
                }
                Opcode::Pong => {
                    if !self.config.ignore_pong {
                        self.callback.on_message(self, Opcode::Pong, payload);
                    }
                    Ok(())
                }
                _ => unreachable!(),
            };
        }

        if frag.opcode.is_none() {
            if op == Opcode::Continuation {
                return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::Opcode(0)));
            }
            if !h.fin {
                // first fragment: copy out of the read buffer before it
                // compacts underneath us.
                frag.opcode = Some(op);
                frag.rsv1 = h.rsv1;
                frag.payload.clear();
                frag.payload.extend_from_slice(payload);
                return Ok(());
            }
            let data: Cow<[u8]> = if h.rsv1 && self.decompression {
                match inflate_no_context_takeover(payload) {
                    Ok(v) => Cow::Owned(v),
                    Err(err) => return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, err)),
                }
            } else {
                Cow::Borrowed(payload)
            };
            if op == Opcode::Text
                && self.config.utf8_check
                && std::str::from_utf8(&data).is_err()
            {
                return Err(
                    self.protocol_error(CLOSE_INVALID_PAYLOAD_DATA, WsError::TextNotUTF8)
                );
            }
            self.callback.on_message(self, op, &data);
            return Ok(());
        }

        // a fragmented message is in flight: only continuations may arrive
        if op != Opcode::Continuation {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::FrameOpcode));
        }
        frag.payload.extend_from_slice(payload);
        if !h.fin {
            return Ok(());
        }
        let first_op = frag.opcode.take().unwrap();
        let compressed = frag.rsv1;
        frag.rsv1 = false;
        let assembled = std::mem::take(&mut frag.payload);
        let data = if compressed && self.decompression {
            match inflate_no_context_takeover(&assembled) {
                Ok(v) => v,
                Err(err) => return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, err)),
            }
        } else {
            assembled
        };
        if first_op == Opcode::Text
            && self.config.utf8_check
            && std::str::from_utf8(&data).is_err()
        {
            return Err(self.protocol_error(CLOSE_INVALID_PAYLOAD_DATA, WsError::TextNotUTF8));
        }
        self.callback.on_message(self, first_op, &data);
        return Ok(());
    }

    fn handle_close(self: &Arc<Self>, payload: &[u8]) -> Result<(), WsError> {
        if payload.is_empty() {
            let _ = self.write_message(Opcode::Close, b"");
            self.close_with_error(None);
            return Err(WsError::Closed);
        }
        if payload.len() == 1 {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::ClosePayloadTooSmall));
        }
        if self.config.utf8_check && std::str::from_utf8(&payload[2..]).is_err() {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::TextNotUTF8));
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if !valid_close_code(code) {
            return Err(self.protocol_error(CLOSE_PROTOCOL_ERROR, WsError::CloseValue(code)));
        }
        let _ = self.write_message(Opcode::Close, payload);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        self.close_with_error(Some(WsError::PeerClose(code, reason)));
        return Err(WsError::Closed);
    }

    /// Answer a violation with a close frame carrying `status`, tear the
    /// connection down with `err`, and hand the read loop its stop signal.
    fn protocol_error(self: &Arc<Self>, status: u16, err: WsError) -> WsError {
        let _ = self.write_message(Opcode::Close, &close_payload(status));
        self.close_with_error(Some(err));
        return WsError::Closed;
    }

    //------------------------------------------------------------------------------
    //            Close discipline
    //------------------------------------------------------------------------------

    /// Idempotent close. `on_close` fires at most once.
    pub fn close(self: &Arc<Self>) {
        self.close_with_error(None);
    }

    /// Teardown order: dequeue from the reactor map, remove from the poll
    /// backend, shut the socket down, clear the reactor handle, then invoke
    /// `on_close` exactly once.
    pub(crate) fn close_with_error(self: &Arc<Self>, err: Option<WsError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        let parent = self.parent.lock().unwrap().clone();
        if let Some(el) = &parent {
            el.remove_conn(fd);
            if let Err(e) = el.poller().del(&self.sock) {
                dbglog!("poller delete of fd {} failed: {}", fd, e);
            }
        }
        let _ = self.sock.shutdown(Shutdown::Both);
        *self.parent.lock().unwrap() = None;
        self.callback.on_close(self, err.as_ref());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::callback::FnCallback;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    enum Event {
        Message(Opcode, Vec<u8>),
        Close(Option<String>),
    }

    fn sock_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (ours, _) = listener.accept().unwrap();
        ours.set_nonblocking(true).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (ours, peer)
    }

    fn test_conn(config: Config) -> (Arc<Conn>, TcpStream, mpsc::Receiver<Event>) {
        let (ours, peer) = sock_pair();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let callback = Arc::new(FnCallback {
            open: None,
            message: Some(Box::new(move |_c, op, payload: &[u8]| {
                tx.send(Event::Message(op, payload.to_vec())).unwrap();
            })),
            close: Some(Box::new(move |_c, err| {
                let _ = tx2.send(Event::Close(err.map(|e| e.to_string())));
            })),
        });
        let conn = Conn::new(ours, false, false, false, config, callback);
        (conn, peer, rx)
    }

    fn feed(conn: &Arc<Conn>, bytes: &[u8]) {
        conn.preload(bytes);
        conn.dispatch_buffered();
    }

    fn read_frame(peer: &mut TcpStream) -> Vec<u8> {
        let mut head = [0u8; 2];
        peer.read_exact(&mut head).unwrap();
        let len = (head[1] & 0x7F) as usize;
        assert!(len <= 125, "test helper only reads short frames");
        let mut payload = vec![0u8; len];
        peer.read_exact(&mut payload).unwrap();
        let mut frame = head.to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    pub fn test_masked_text_dispatch() {
        let (conn, _peer, rx) = test_conn(Config::default());
        feed(
            &conn,
            &[0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58],
        );
        match rx.try_recv().unwrap() {
            Event::Message(op, payload) => {
                assert_eq!(op, Opcode::Text);
                assert_eq!(payload, b"hello");
            }
            _ => panic!("expected message"),
        }
    }

    #[test]
    pub fn test_fragmented_binary_reassembly() {
        let (conn, _peer, rx) = test_conn(Config::default());
        feed(&conn, &[0x02, 0x03, 0x01, 0x02, 0x03]);
        // interleaved ping must not disturb reassembly
        feed(&conn, &[0x89, 0x00]);
        feed(&conn, &[0x80, 0x02, 0x04, 0x05]);
        match rx.try_recv().unwrap() {
            Event::Message(op, _) => assert_eq!(op, Opcode::Ping),
            _ => panic!("expected ping first"),
        }
        match rx.try_recv().unwrap() {
            Event::Message(op, payload) => {
                assert_eq!(op, Opcode::Binary);
                assert_eq!(payload, [0x01, 0x02, 0x03, 0x04, 0x05]);
            }
            _ => panic!("expected binary message"),
        }
    }

    #[test]
    pub fn test_ping_auto_pong() {
        let (conn, mut peer, rx) = test_conn(Config::default().with_reply_ping(true));
        feed(&conn, &[0x89, 0x04, b'p', b'i', b'n', b'g']);
        assert_eq!(read_frame(&mut peer), [0x8A, 0x04, b'p', b'i', b'n', b'g']);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Event::Message(Opcode::Ping, _)
        ));
    }

    #[test]
    pub fn test_pong_ignored() {
        let (conn, _peer, rx) = test_conn(Config::default().with_ignore_pong(true));
        feed(&conn, &[0x8A, 0x02, b'h', b'i']);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    pub fn test_invalid_opcode_closes_1002() {
        let (conn, mut peer, rx) = test_conn(Config::default());
        feed(&conn, &[0x83, 0x00]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        assert!(conn.is_closed());
        match rx.try_recv().unwrap() {
            Event::Close(Some(msg)) => assert!(msg.contains("0x3"), "{msg}"),
            _ => panic!("expected close with error"),
        }
    }

    #[test]
    pub fn test_unexpected_continuation_closes() {
        let (conn, mut peer, _rx) = test_conn(Config::default());
        feed(&conn, &[0x80, 0x01, 0x00]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_oversized_control_frame_rejected() {
        let (conn, mut peer, rx) = test_conn(Config::default());
        // ping with a 126-byte payload needs the 2-byte extended length
        let mut frame = vec![0x89, 126, 0x00, 126];
        frame.extend_from_slice(&[0u8; 126]);
        feed(&conn, &frame);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        match rx.try_recv().unwrap() {
            Event::Close(Some(msg)) => assert!(msg.contains("126"), "{msg}"),
            _ => panic!("expected close"),
        }
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_fragmented_control_frame_rejected() {
        let (conn, mut peer, _rx) = test_conn(Config::default());
        // close frame without fin
        feed(&conn, &[0x08, 0x00]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_close_one_byte_payload_rejected() {
        let (conn, mut peer, rx) = test_conn(Config::default());
        feed(&conn, &[0x88, 0x01, 0x03]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        match rx.try_recv().unwrap() {
            Event::Close(Some(msg)) => assert!(msg.contains("1 byte"), "{msg}"),
            _ => panic!("expected close"),
        }
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_close_reserved_code_rejected() {
        for code in [1004u16, 1005] {
            let (conn, mut peer, rx) = test_conn(Config::default());
            let mut frame = vec![0x88, 0x02];
            frame.extend_from_slice(&code.to_be_bytes());
            feed(&conn, &frame);
            assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
            match rx.try_recv().unwrap() {
                Event::Close(Some(msg)) => assert!(msg.contains(&code.to_string()), "{msg}"),
                _ => panic!("expected close"),
            }
            assert!(conn.is_closed());
        }
    }

    #[test]
    pub fn test_close_echoes_payload() {
        let (conn, mut peer, rx) = test_conn(Config::default());
        feed(&conn, &[0x88, 0x04, 0x03, 0xE8, b'o', b'k']);
        assert_eq!(read_frame(&mut peer), [0x88, 0x04, 0x03, 0xE8, b'o', b'k']);
        match rx.try_recv().unwrap() {
            Event::Close(Some(msg)) => assert!(msg.contains("1000"), "{msg}"),
            _ => panic!("expected close"),
        }
    }

    #[test]
    pub fn test_invalid_utf8_text_closes_1007() {
        let (conn, mut peer, rx) = test_conn(Config::default());
        feed(&conn, &[0x81, 0x02, 0xC3, 0x28]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEF]);
        match rx.try_recv().unwrap() {
            Event::Close(Some(msg)) => assert!(msg.contains("UTF-8"), "{msg}"),
            _ => panic!("expected close"),
        }
    }

    #[test]
    pub fn test_invalid_utf8_on_final_fragment_closes_1007() {
        let (conn, mut peer, _rx) = test_conn(Config::default());
        feed(&conn, &[0x01, 0x01, 0xC3]);
        feed(&conn, &[0x80, 0x01, 0x28]);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEF]);
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_rsv_bits_rejected_without_extension() {
        let (conn, mut peer, _rx) = test_conn(Config::default());
        // rsv1 on text without negotiated decompression
        feed(&conn, &[0xC1, 0x01, b'x']);
        assert_eq!(read_frame(&mut peer), [0x88, 0x02, 0x03, 0xEA]);
        assert!(conn.is_closed());
    }

    #[test]
    pub fn test_write_message_on_closed_conn() {
        let (conn, _peer, rx) = test_conn(Config::default());
        conn.close();
        conn.close(); // idempotent
        assert!(matches!(
            conn.write_message(Opcode::Text, b"hi"),
            Err(WsError::Closed)
        ));
        assert!(matches!(rx.try_recv().unwrap(), Event::Close(None)));
        // exactly once
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.fd(), -1);
    }

    #[test]
    pub fn test_write_message_rejects_invalid_utf8() {
        let (conn, _peer, _rx) = test_conn(Config::default());
        assert!(matches!(
            conn.write_message(Opcode::Text, &[0xC3, 0x28]),
            Err(WsError::TextNotUTF8)
        ));
    }

    #[test]
    pub fn test_compressed_frame_is_inflated_before_dispatch() {
        let (tx, rx) = mpsc::channel();
        let callback = Arc::new(FnCallback {
            open: None,
            message: Some(Box::new(move |_c, op, payload: &[u8]| {
                tx.send(Event::Message(op, payload.to_vec())).unwrap();
            })),
            close: None,
        });
        let (sock, _peer) = sock_pair();
        let conn = Conn::new(sock, false, true, true, Config::default(), callback);
        let deflated =
            crate::deflate::deflate_no_context_takeover(b"compressed hello").unwrap();
        let mut frame = vec![0xC1, deflated.len() as u8];
        frame.extend_from_slice(&deflated);
        feed(&conn, &frame);
        match rx.try_recv().unwrap() {
            Event::Message(op, payload) => {
                assert_eq!(op, Opcode::Text);
                assert_eq!(payload, b"compressed hello");
            }
            _ => panic!("expected message"),
        }
    }
}
