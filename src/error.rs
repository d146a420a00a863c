use std::fmt;
use std::io;

/// Errors surfaced by the engine: handshake failures bubble out of `dial`,
/// frame/protocol violations are reported through `on_close` after the
/// connection has answered with a close frame.
#[derive(Debug)]
pub enum WsError {
    /// Handshake response status was not 101.
    WrongStatusCode(u16),
    /// Handshake `Upgrade` header missing or not "websocket".
    UpgradeFieldValue,
    /// Handshake `Connection` header missing or lacking the "upgrade" token.
    ConnectionFieldValue,
    /// `Sec-WebSocket-Accept` did not match the key sent.
    SecWebSocketAccept,
    /// Malformed upgrade request/response.
    Handshake(String),
    /// Frame length field is out of range (high bit of the 8-byte form).
    FramePayloadLength,
    /// Reserved header bits set without a matching extension.
    Rsv123,
    /// Expected a continuation frame while a fragmented message is in flight.
    FrameOpcode,
    /// Invalid or reserved opcode on the wire.
    Opcode(u8),
    /// Control frame payload exceeds 125 bytes.
    MaxControlFrameSize(usize),
    /// Control frame arrived fragmented.
    NotBeFragmented,
    /// Close frame carried a 1-byte payload.
    ClosePayloadTooSmall,
    /// Close frame status code is forbidden on the wire.
    CloseValue(u16),
    /// Text payload (or close reason) is not valid UTF-8.
    TextNotUTF8,
    /// Operation on a connection that has already been closed.
    Closed,
    /// The peer sent a close frame with this status code and reason.
    PeerClose(u16, String),
    /// Fatal socket error.
    Io(io::Error),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongStatusCode(code) => write!(f, "handshake status code {code}, expected 101"),
            Self::UpgradeFieldValue => write!(f, "Upgrade header is not websocket"),
            Self::ConnectionFieldValue => write!(f, "Connection header is not Upgrade"),
            Self::SecWebSocketAccept => write!(f, "Sec-WebSocket-Accept mismatch"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::FramePayloadLength => write!(f, "frame payload length out of range"),
            Self::Rsv123 => write!(f, "reserved bits set without negotiated extension"),
            Self::FrameOpcode => write!(f, "expected continuation frame"),
            Self::Opcode(op) => write!(f, "invalid opcode: 0x{op:X}"),
            Self::MaxControlFrameSize(size) => {
                write!(f, "control frame payload too large: {size} bytes (max 125)")
            }
            Self::NotBeFragmented => write!(f, "control frame must not be fragmented"),
            Self::ClosePayloadTooSmall => write!(f, "close frame payload of 1 byte"),
            Self::CloseValue(code) => write!(f, "close status code {code} forbidden on the wire"),
            Self::TextNotUTF8 => write!(f, "text payload is not valid UTF-8"),
            Self::Closed => write!(f, "connection closed"),
            Self::PeerClose(code, reason) => {
                if reason.is_empty() {
                    write!(f, "peer closed with status {code}")
                } else {
                    write!(f, "peer closed with status {code}: {reason}")
                }
            }
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for WsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
