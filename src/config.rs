use crate::frame::MAX_FRAME_HEADER_SIZE;
use std::time::Duration;

//====================================================================================
//            Engine options consumed by the core
//====================================================================================

/// Per-connection behavior knobs, shared by server and client sides. The
/// compression pair only takes effect when the handshake also negotiates
/// permessage-deflate.
#[derive(Clone)]
pub struct Config {
    pub compression: bool,
    pub decompression: bool,
    /// Auto-answer an incoming ping with a pong carrying the same payload.
    pub reply_ping: bool,
    /// Drop incoming pongs instead of surfacing them to `on_message`.
    pub ignore_pong: bool,
    /// Validate UTF-8 of text payloads (inbound and outbound) and of close
    /// reasons.
    pub utf8_check: bool,
    pub tcp_no_delay: bool,
    /// Connections idle past this are torn down at the next poll wake.
    pub read_timeout: Option<Duration>,
    /// Delay-write coalescing bounds. Stored for callers that tune them; the
    /// write path sends immediately and queues only on a short write.
    pub max_delay_write_duration: Duration,
    pub max_delay_write_num: i32,
    pub delay_write_init_buffer_size: usize,
    /// Initial read buffer sizing multiplier, clamped to >= 1.0.
    pub windows_multiple_times_payload_size: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compression: false,
            decompression: false,
            reply_ping: false,
            ignore_pong: false,
            utf8_check: true,
            tcp_no_delay: true,
            read_timeout: None,
            max_delay_write_duration: Duration::from_millis(10),
            max_delay_write_num: 10,
            delay_write_init_buffer_size: 8 * 1024,
            windows_multiple_times_payload_size: 1.0,
        }
    }
}

impl Config {
    pub fn with_compression(mut self, on: bool) -> Self {
        self.compression = on;
        self
    }
    pub fn with_decompression(mut self, on: bool) -> Self {
        self.decompression = on;
        self
    }
    pub fn with_reply_ping(mut self, on: bool) -> Self {
        self.reply_ping = on;
        self
    }
    pub fn with_ignore_pong(mut self, on: bool) -> Self {
        self.ignore_pong = on;
        self
    }
    pub fn with_utf8_check(mut self, on: bool) -> Self {
        self.utf8_check = on;
        self
    }
    pub fn with_tcp_no_delay(mut self, on: bool) -> Self {
        self.tcp_no_delay = on;
        self
    }
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
    pub fn with_windows_multiple_times_payload_size(mut self, mt: f32) -> Self {
        self.windows_multiple_times_payload_size = if mt < 1.0 { 1.0 } else { mt };
        self
    }

    /// Initial read buffer size: one payload window plus the largest header.
    pub(crate) fn init_rbuf_size(&self) -> usize {
        let mt = if self.windows_multiple_times_payload_size < 1.0 {
            1.0
        } else {
            self.windows_multiple_times_payload_size
        };
        return (1024.0 * mt) as usize + MAX_FRAME_HEADER_SIZE;
    }
}
