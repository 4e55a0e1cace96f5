//! Connection plumbing between a [`Peer`](crate::Peer) and the network.
//!
//! A connection is split into two halves:
//!
//! - [`Transport`]: the sending half, shared by every task that writes frames.
//! - [`FrameSource`]: the receiving half, consumed by one reader task that
//!   reports what arrives to a [`ConnectionEvents`] observer.

pub mod memory;
pub mod websocket;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// Sending half of a duplex frame connection.
///
/// Implementations write each frame atomically, so concurrent senders never
/// interleave partial frames.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one complete frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Observer of a connection's lifecycle.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// The connection is established and ready for traffic.
    async fn on_open(&self);

    /// Bytes arrived. They need not be aligned to message boundaries.
    async fn on_message(&self, data: &[u8]);

    /// The connection is gone. Called at most once, and nothing follows it.
    async fn on_close(&self, code: Option<u16>, reason: &str);
}

/// Receiving half of a duplex frame connection.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Deliver inbound data in arrival order until the connection ends, then
    /// report the close.
    async fn run(self, events: &dyn ConnectionEvents);
}
