//! In-process transport pair.
//!
//! Two connected ends backed by unbounded channels. Useful for tests and for
//! embedding two peers in one process. [`pair_chunked`] splits every frame
//! into small deliveries to exercise stream reassembly.

use super::{ConnectionEvents, FrameSource, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Close code reported when an end is dropped without closing.
const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug)]
enum Event {
    Data(Bytes),
    Close { code: u16, reason: String },
}

/// Sending half of one end.
#[derive(Debug)]
pub struct MemoryTransport {
    remote: mpsc::UnboundedSender<Event>,
    local: mpsc::UnboundedSender<Event>,
    connected: Arc<AtomicBool>,
    chunk_size: Option<usize>,
    /// Held while the pieces of one frame are queued.
    write_lock: Mutex<()>,
}

/// Receiving half of one end.
#[derive(Debug)]
pub struct MemorySource {
    inbox: mpsc::UnboundedReceiver<Event>,
}

/// One end of the connection.
pub type End = (MemoryTransport, MemorySource);

/// Two connected ends delivering whole frames.
pub fn pair() -> (End, End) {
    build(None)
}

/// Two connected ends delivering every frame in pieces of at most
/// `chunk_size` bytes.
pub fn pair_chunked(chunk_size: usize) -> (End, End) {
    build(Some(chunk_size.max(1)))
}

fn build(chunk_size: Option<usize>) -> (End, End) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let a = MemoryTransport {
        remote: b_tx.clone(),
        local: a_tx.clone(),
        connected: connected.clone(),
        chunk_size,
        write_lock: Mutex::new(()),
    };
    let b = MemoryTransport {
        remote: a_tx,
        local: b_tx,
        connected,
        chunk_size,
        write_lock: Mutex::new(()),
    };

    ((a, MemorySource { inbox: a_rx }), (b, MemorySource { inbox: b_rx }))
}

impl MemoryTransport {
    /// Mark the connection closed and tell both ends. Returns false if it was
    /// already closed.
    fn shutdown(&self, code: u16, reason: &str) -> bool {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return false;
        }
        for side in [&self.local, &self.remote] {
            let _ = side.send(Event::Close {
                code,
                reason: reason.to_string(),
            });
        }
        true
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let pieces = match self.chunk_size {
            Some(size) if frame.len() > size => {
                let mut pieces = Vec::with_capacity(frame.len() / size + 1);
                let mut rest = frame;
                while rest.len() > size {
                    pieces.push(rest.split_to(size));
                }
                pieces.push(rest);
                pieces
            }
            _ => vec![frame],
        };

        let _frame = self.write_lock.lock();
        for piece in pieces {
            self.remote
                .send(Event::Data(piece))
                .map_err(|_| Error::NotConnected)?;
        }
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if self.shutdown(code, reason) {
            debug!(code, reason, "memory transport closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown(CLOSE_ABNORMAL, "transport dropped");
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn run(mut self, events: &dyn ConnectionEvents) {
        while let Some(event) = self.inbox.recv().await {
            match event {
                Event::Data(data) => events.on_message(&data).await,
                Event::Close { code, reason } => {
                    events.on_close(Some(code), &reason).await;
                    return;
                }
            }
        }
        events.on_close(None, "").await;
    }
}
