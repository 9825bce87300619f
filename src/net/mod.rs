//! Notification transport: server-side fan-out and client-side receive.

pub mod broadcaster;
pub mod receiver;

pub use broadcaster::Broadcaster;
pub use receiver::{ConnState, EventReceiver, RECONNECT_BACKOFF};
