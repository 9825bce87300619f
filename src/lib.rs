//! One-way directory mirroring.
//!
//! A server watches a monitored directory and broadcasts change
//! notifications over persistent TCP connections; clients reconcile
//! their local mirror in bulk passes and by applying streamed events.

pub mod config;
pub mod net;
pub mod protocol;
pub mod sync;
pub mod watch;
