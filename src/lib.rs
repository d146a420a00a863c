//! Multi-reactor non-blocking WebSocket (RFC 6455) engine. A fixed pool of
//! poll-driven reactor threads multiplexes many connections; frames are
//! decoded incrementally by a resumable state machine and dispatched to user
//! callbacks on the owning reactor thread.

mod callback;
mod client;
mod config;
mod conn;
mod deflate;
mod error;
mod event_loop;
mod frame;
mod handshake;
mod multi_event_loop;
mod parser;
mod poller;
mod server;
pub mod utils;

pub use callback::*;
pub use client::*;
pub use config::*;
pub use conn::*;
pub use error::*;
pub use event_loop::*;
pub use frame::*;
pub use handshake::{compute_accept_key, EXTENSIONS_OFFER};
pub use multi_event_loop::*;
pub use poller::*;
pub use server::*;
