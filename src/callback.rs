use crate::conn::Conn;
use crate::error::WsError;
use crate::frame::Opcode;
use std::sync::Arc;

//====================================================================================
//            User capability set: OnOpen / OnMessage / OnClose
//====================================================================================

/// The three capabilities the engine exposes to users. For one connection,
/// `on_open` fires once after the handshake, `on_message` zero or more times
/// in wire order, and `on_close` exactly once. All of them run on the
/// connection's owning reactor thread and must not block it.
pub trait Callback: Send + Sync {
    fn on_open(&self, _conn: &Arc<Conn>) {}
    fn on_message(&self, _conn: &Arc<Conn>, _opcode: Opcode, _payload: &[u8]) {}
    fn on_close(&self, _conn: &Arc<Conn>, _err: Option<&WsError>) {}
}

/// Function-triple form: any subset of the three capabilities.
#[derive(Default)]
pub struct FnCallback {
    pub open: Option<Box<dyn Fn(&Arc<Conn>) + Send + Sync>>,
    pub message: Option<Box<dyn Fn(&Arc<Conn>, Opcode, &[u8]) + Send + Sync>>,
    pub close: Option<Box<dyn Fn(&Arc<Conn>, Option<&WsError>) + Send + Sync>>,
}

impl Callback for FnCallback {
    fn on_open(&self, conn: &Arc<Conn>) {
        if let Some(f) = &self.open {
            f(conn);
        }
    }
    fn on_message(&self, conn: &Arc<Conn>, opcode: Opcode, payload: &[u8]) {
        if let Some(f) = &self.message {
            f(conn, opcode, payload);
        }
    }
    fn on_close(&self, conn: &Arc<Conn>, err: Option<&WsError>) {
        if let Some(f) = &self.close {
            f(conn, err);
        }
    }
}

/// Single-function form: only `on_message`.
pub struct OnMessageFn<F>(pub F);
impl<F: Fn(&Arc<Conn>, Opcode, &[u8]) + Send + Sync> Callback for OnMessageFn<F> {
    fn on_message(&self, conn: &Arc<Conn>, opcode: Opcode, payload: &[u8]) {
        (self.0)(conn, opcode, payload);
    }
}

/// Single-function form: only `on_close`.
pub struct OnCloseFn<F>(pub F);
impl<F: Fn(&Arc<Conn>, Option<&WsError>) + Send + Sync> Callback for OnCloseFn<F> {
    fn on_close(&self, conn: &Arc<Conn>, err: Option<&WsError>) {
        (self.0)(conn, err);
    }
}
