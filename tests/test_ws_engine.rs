#[macro_use(logmsg)]
extern crate reactws;

use reactws::{dial, Config, Conn, FnCallback, MultiEventLoop, Opcode, WsServer};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum Ev {
    Open,
    Msg(Opcode, Vec<u8>),
    Close(Option<String>),
}

fn chan_callback() -> (Arc<FnCallback>, mpsc::Receiver<Ev>) {
    let (tx, rx) = mpsc::channel();
    let (t1, t2, t3) = (tx.clone(), tx.clone(), tx);
    let cb = Arc::new(FnCallback {
        open: Some(Box::new(move |_c: &Arc<Conn>| {
            let _ = t1.send(Ev::Open);
        })),
        message: Some(Box::new(move |_c: &Arc<Conn>, op, payload: &[u8]| {
            let _ = t2.send(Ev::Msg(op, payload.to_vec()));
        })),
        close: Some(Box::new(move |_c: &Arc<Conn>, err| {
            let _ = t3.send(Ev::Close(err.map(|e| e.to_string())));
        })),
    });
    (cb, rx)
}

/// Echo server callback: every data message is written straight back.
fn echo_callback() -> Arc<FnCallback> {
    Arc::new(FnCallback {
        open: None,
        message: Some(Box::new(|conn: &Arc<Conn>, op, payload: &[u8]| {
            if matches!(op, Opcode::Text | Opcode::Binary) {
                let _ = conn.write_message(op, payload);
            }
        })),
        close: None,
    })
}

fn recv_msg(rx: &mpsc::Receiver<Ev>) -> Ev {
    rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for event")
}

#[test]
fn test_echo_roundtrip() {
    let pool = MultiEventLoop::new(2).unwrap();
    pool.start();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default(),
        echo_callback(),
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let (cb, rx) = chan_callback();
    let url = format!("ws://{}", addr);
    let conn = dial(&url, Config::default(), cb, &pool).unwrap();
    assert!(matches!(recv_msg(&rx), Ev::Open));
    // fd-affine lookup goes through the owning reactor
    assert!(pool.get_conn(conn.fd()).is_some());

    conn.write_message(Opcode::Text, "hello".as_bytes()).unwrap();
    conn.write_message(Opcode::Binary, &[0x01, 0x02, 0x03]).unwrap();
    match recv_msg(&rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Text);
            assert_eq!(payload, b"hello");
        }
        other => panic!("expected text echo, got {other:?}"),
    }
    match recv_msg(&rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Binary);
            assert_eq!(payload, [0x01, 0x02, 0x03]);
        }
        other => panic!("expected binary echo, got {other:?}"),
    }

    conn.close();
    conn.close(); // idempotent
    match recv_msg(&rx) {
        Ev::Close(err) => assert!(err.is_none(), "{err:?}"),
        other => panic!("expected close, got {other:?}"),
    }
    // exactly once
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    pool.shutdown();
}

#[test]
fn test_large_message_echo() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default(),
        echo_callback(),
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let (cb, rx) = chan_callback();
    let conn = dial(&format!("ws://{}", addr), Config::default(), cb, &pool).unwrap();
    assert!(matches!(recv_msg(&rx), Ev::Open));

    // 8-byte extended length on the wire; exercises exact buffer growth.
    let big: Vec<u8> = (0..65536 + 7).map(|i| (i % 251) as u8).collect();
    conn.write_message(Opcode::Binary, &big).unwrap();
    match recv_msg(&rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Binary);
            assert_eq!(payload, big);
        }
        other => panic!("expected echo, got {other:?}"),
    }
    conn.close();
    pool.shutdown();
}

#[test]
fn test_compressed_echo_roundtrip() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    let config = Config::default()
        .with_compression(true)
        .with_decompression(true);
    let server = WsServer::bind(
        "127.0.0.1:0",
        config.clone(),
        echo_callback(),
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let (cb, rx) = chan_callback();
    let conn = dial(&format!("ws://{}", addr), config, cb, &pool).unwrap();
    assert!(matches!(recv_msg(&rx), Ev::Open));

    let payload = "compressible compressible compressible".repeat(64);
    conn.write_message(Opcode::Text, payload.as_bytes()).unwrap();
    match recv_msg(&rx) {
        Ev::Msg(op, got) => {
            assert_eq!(op, Opcode::Text);
            assert_eq!(got, payload.as_bytes());
        }
        other => panic!("expected echo, got {other:?}"),
    }
    conn.close();
    pool.shutdown();
}

#[test]
fn test_ping_is_answered_with_pong() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    let (server_cb, _server_rx) = chan_callback();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default().with_reply_ping(true),
        server_cb,
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let (cb, rx) = chan_callback();
    let conn = dial(&format!("ws://{}", addr), Config::default(), cb, &pool).unwrap();
    assert!(matches!(recv_msg(&rx), Ev::Open));

    conn.write_message(Opcode::Ping, b"ping").unwrap();
    match recv_msg(&rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Pong);
            assert_eq!(payload, b"ping");
        }
        other => panic!("expected pong, got {other:?}"),
    }
    conn.close();
    pool.shutdown();
}

//====================================================================================
//            Raw-socket client against the server engine (literal vectors)
//====================================================================================

/// Minimal raw handshake so the wire bytes below are exactly the ones sent.
fn raw_upgrade(addr: std::net::SocketAddr, extra_header: &str) -> (TcpStream, String) {
    let mut sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let req = format!(
        "GET / HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n{extra_header}\r\n"
    );
    sock.write_all(req.as_bytes()).unwrap();
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        sock.read_exact(&mut byte).unwrap();
        buf.push(byte[0]);
        assert!(buf.len() < 4096);
    }
    let rsp = String::from_utf8(buf).unwrap();
    assert!(rsp.starts_with("HTTP/1.1 101"), "{rsp}");
    assert!(rsp.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="), "{rsp}");
    (sock, rsp)
}

fn raw_handshake(addr: std::net::SocketAddr) -> TcpStream {
    raw_upgrade(addr, "").0
}

fn read_short_frame(sock: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 2];
    sock.read_exact(&mut head).unwrap();
    let len = (head[1] & 0x7F) as usize;
    assert!(len <= 125);
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).unwrap();
    let mut frame = head.to_vec();
    frame.extend_from_slice(&payload);
    frame
}

#[test]
fn test_raw_wire_scenarios() {
    let pool = MultiEventLoop::new(2).unwrap();
    pool.start();
    let (server_cb, server_rx) = chan_callback();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default().with_reply_ping(true),
        server_cb,
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let mut sock = raw_handshake(addr);
    assert!(matches!(recv_msg(&server_rx), Ev::Open));

    // masked "hello" (RFC 6455 sample)
    sock.write_all(&[0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58])
        .unwrap();
    match recv_msg(&server_rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Text);
            assert_eq!(payload, b"hello");
        }
        other => panic!("expected text, got {other:?}"),
    }

    // fragmented binary with an interleaved ping
    sock.write_all(&[0x02, 0x03, 0x01, 0x02, 0x03]).unwrap();
    sock.write_all(&[0x89, 0x04, b'p', b'i', b'n', b'g']).unwrap();
    sock.write_all(&[0x80, 0x02, 0x04, 0x05]).unwrap();
    // engine pongs the ping with the same payload
    assert_eq!(
        read_short_frame(&mut sock),
        [0x8A, 0x04, b'p', b'i', b'n', b'g']
    );
    match recv_msg(&server_rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Ping);
            assert_eq!(payload, b"ping");
        }
        other => panic!("expected ping, got {other:?}"),
    }
    match recv_msg(&server_rx) {
        Ev::Msg(op, payload) => {
            assert_eq!(op, Opcode::Binary);
            assert_eq!(payload, [0x01, 0x02, 0x03, 0x04, 0x05]);
        }
        other => panic!("expected reassembled binary, got {other:?}"),
    }

    // reserved opcode 3 is a protocol violation: Close(1002) comes back
    sock.write_all(&[0x83, 0x00]).unwrap();
    assert_eq!(read_short_frame(&mut sock), [0x88, 0x02, 0x03, 0xEA]);
    match recv_msg(&server_rx) {
        Ev::Close(Some(msg)) => assert!(msg.contains("0x3"), "{msg}"),
        other => panic!("expected close with protocol error, got {other:?}"),
    }
    pool.shutdown();
}

#[test]
fn test_server_decompression_only_does_not_compress_replies() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    // server inflates inbound frames but must leave its own replies alone
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default().with_decompression(true),
        echo_callback(),
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let (mut sock, rsp) = raw_upgrade(
        addr,
        "Sec-WebSocket-Extensions: permessage-deflate; client_no_context_takeover\r\n",
    );
    assert!(rsp.contains("permessage-deflate"), "{rsp}");

    sock.write_all(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
        .unwrap();
    // the echo must come back uncompressed: fin|text with rsv1 clear
    assert_eq!(
        read_short_frame(&mut sock),
        [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']
    );
    pool.shutdown();
}

#[test]
fn test_peer_close_handshake() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    let (server_cb, server_rx) = chan_callback();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default(),
        server_cb,
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let mut sock = raw_handshake(addr);
    assert!(matches!(recv_msg(&server_rx), Ev::Open));

    // close with status 1000 and reason "bye"
    sock.write_all(&[0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']).unwrap();
    // engine echoes the close payload
    assert_eq!(
        read_short_frame(&mut sock),
        [0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']
    );
    match recv_msg(&server_rx) {
        Ev::Close(Some(msg)) => {
            assert!(msg.contains("1000"), "{msg}");
            assert!(msg.contains("bye"), "{msg}");
        }
        other => panic!("expected close, got {other:?}"),
    }
    // exactly once
    assert!(server_rx.recv_timeout(Duration::from_millis(200)).is_err());
    pool.shutdown();
}

#[test]
fn test_client_disconnect_reaches_on_close() {
    let pool = MultiEventLoop::new(1).unwrap();
    pool.start();
    let (server_cb, server_rx) = chan_callback();
    let server = WsServer::bind(
        "127.0.0.1:0",
        Config::default(),
        server_cb,
        Arc::clone(&pool),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    let _handle = server.start().unwrap();

    let sock = raw_handshake(addr);
    assert!(matches!(recv_msg(&server_rx), Ev::Open));
    logmsg!("dropping raw client socket");
    drop(sock);
    match recv_msg(&server_rx) {
        Ev::Close(err) => assert!(err.is_some()),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(pool.len(), 0);
    pool.shutdown();
}
