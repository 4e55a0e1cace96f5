//! One endpoint of a bidirectional RPC connection.
//!
//! A [`Peer`] is symmetric: the side that accepted the connection and the
//! side that opened it run the same engine. Each peer owns a pending-call
//! ledger for its outbound calls, a decoder for the inbound byte stream, a
//! dispatcher for inbound calls, and the handler bound to the connection.
//!
//! Lifecycle: `Connecting -> Connected -> Disconnected`. A reconnection is a
//! new peer.

use crate::codec::{self, CallId, Decoded, Decoder, Message};
use crate::config::{NetworkConfig, PeerConfig};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result, RpcError};
use crate::handler::{Handler, HandlerFactory};
use crate::ledger::{CallHandle, Ledger};
use crate::transport::{ConnectionEvents, FrameSource, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Process-unique peer identity, increasing in creation order.
pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Handle to one connection endpoint. Clones share the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    id: PeerId,
    transport: Box<dyn Transport>,
    ledger: Ledger,
    decoder: Mutex<Decoder>,
    dispatcher: Dispatcher,
    factory: Arc<dyn HandlerFactory>,
    binding: RwLock<Option<Arc<Handler>>>,
    state: Mutex<ConnectionState>,
    closed_tx: watch::Sender<bool>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
}

type TeardownHook = Box<dyn FnOnce(PeerId) + Send>;

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl Peer {
    /// Create a peer over `transport` without starting a reader.
    ///
    /// The caller drives it through its [`ConnectionEvents`] implementation.
    pub fn new<T, F>(transport: T, factory: F, config: &PeerConfig) -> Self
    where
        T: Transport,
        F: HandlerFactory,
    {
        Self::with_shared_factory(Box::new(transport), Arc::new(factory), config)
    }

    pub(crate) fn with_shared_factory(
        transport: Box<dyn Transport>,
        factory: Arc<dyn HandlerFactory>,
        config: &PeerConfig,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                ledger: Ledger::new(config.max_pending_calls),
                decoder: Mutex::new(Decoder::new(config.max_buffered_bytes)),
                dispatcher: Dispatcher::new(config.max_concurrent_calls),
                factory,
                binding: RwLock::new(None),
                state: Mutex::new(ConnectionState::Connecting),
                closed_tx,
                teardown_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the connection and spawn its reader task.
    ///
    /// The handler is bound before the reader starts, so the first inbound
    /// call already finds it. The returned task finishes after teardown.
    pub async fn start<T, S, F>(
        transport: T,
        source: S,
        factory: F,
        config: &PeerConfig,
    ) -> (Peer, JoinHandle<()>)
    where
        T: Transport,
        S: FrameSource,
        F: HandlerFactory,
    {
        let peer = Self::new(transport, factory, config);
        peer.on_open().await;

        let reader = peer.clone();
        let task = tokio::spawn(async move {
            source.run(&reader).await;
        });
        (peer, task)
    }

    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected && self.inner.transport.is_connected()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    /// Outbound calls still awaiting a Response.
    pub fn pending_calls(&self) -> usize {
        self.inner.ledger.len()
    }

    /// Handler bound to the connection, while connected.
    pub fn handler(&self) -> Option<Arc<Handler>> {
        self.inner.binding.read().clone()
    }

    /// Invoke `method` on the other side.
    ///
    /// Returns as soon as the Request is sent; the handle yields the outcome.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<CallHandle> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let (id, handle) = self.inner.ledger.register(method)?;
        debug!(peer = self.id(), id, "----> REQUEST {}", method);

        let request = Message::Request {
            id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send(&request).await {
            self.inner.ledger.abandon(id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Fire a one-way Notification.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        debug!(peer = self.id(), "----> NOTIFY {}", method);
        self.send(&Message::Notification {
            method: method.to_string(),
            params,
        })
        .await
    }

    /// Send an already encoded frame.
    pub async fn write(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner.transport.send(frame).await
    }

    /// Close the connection and tear down locally without waiting for the
    /// other side to acknowledge.
    pub async fn disconnect(&self, code: u16, reason: &str) -> Result<()> {
        let closed = self.inner.transport.close(code, reason).await;
        self.teardown(Some(code), reason);
        closed
    }

    /// Resolves once the peer is disconnected.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let frame = codec::encode(message)?;
        self.inner.transport.send(frame).await
    }

    /// Answer an inbound Request. Skipped once disconnected.
    pub(crate) async fn respond(&self, id: CallId, outcome: std::result::Result<Value, RpcError>) {
        if !self.is_connected() {
            debug!(peer = self.id(), id, "disconnected; dropping response");
            return;
        }

        let (error, result) = match outcome {
            Ok(value) => (Value::Null, value),
            Err(e) => {
                debug!(peer = self.id(), id, "<---- ERROR {}", e);
                (e.to_value(), Value::Null)
            }
        };
        debug!(peer = self.id(), id, "----> RESPONSE");

        if let Err(e) = self.send(&Message::Response { id, error, result }).await {
            debug!(peer = self.id(), id, "failed to send response: {}", e);
        }
    }

    async fn route(&self, item: Decoded) {
        match item {
            Decoded::Message(Message::Response { id, error, result }) => {
                debug!(peer = self.id(), id, "<---- RESPONSE");
                self.inner.ledger.resolve(id, error, result);
            }
            Decoded::Message(Message::Request { id, method, params }) => {
                debug!(peer = self.id(), id, "<---- REQUEST {}", method);
                self.inner
                    .dispatcher
                    .submit(self.clone(), self.handler(), Some(id), method, params);
            }
            Decoded::Message(Message::Notification { method, params }) => {
                debug!(peer = self.id(), "<---- NOTIFY {}", method);
                self.inner
                    .dispatcher
                    .submit(self.clone(), self.handler(), None, method, params);
            }
            Decoded::Malformed { id, reason } => {
                warn!(peer = self.id(), id, "invalid request: {}", reason);
                self.respond(id, Err(RpcError::invalid_request(reason))).await;
            }
        }
    }

    /// Run `hook` once the peer is torn down, or now if it already is.
    pub(crate) fn on_teardown(&self, hook: impl FnOnce(PeerId) + Send + 'static) {
        {
            let state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                self.inner.teardown_hooks.lock().push(Box::new(hook));
                return;
            }
        }
        hook(self.id());
    }

    /// Release the handler and terminate outstanding calls. Runs once.
    pub(crate) fn teardown(&self, code: Option<u16>, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        let binding = self.inner.binding.write().take();
        drop(binding);

        let terminated = self.inner.ledger.drain_all();
        let hooks = std::mem::take(&mut *self.inner.teardown_hooks.lock());
        for hook in hooks {
            hook(self.id());
        }
        self.inner.closed_tx.send_replace(true);
        info!(
            peer = self.id(),
            code = ?code,
            terminated,
            "Connection closed{}{}",
            if reason.is_empty() { "" } else { ": " },
            reason
        );
    }
}

#[async_trait]
impl ConnectionEvents for Peer {
    async fn on_open(&self) {
        if self.state() != ConnectionState::Connecting {
            return;
        }

        let handler = Arc::new(self.inner.factory.create(self));
        *self.inner.binding.write() = Some(handler);

        let mut state = self.inner.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected;
            info!(peer = self.id(), addr = ?self.peer_addr(), "Connection opened");
        }
    }

    async fn on_message(&self, data: &[u8]) {
        let drained = {
            let mut decoder = self.inner.decoder.lock();
            decoder.feed(data);
            decoder.drain()
        };

        match drained {
            Ok(items) => {
                for item in items {
                    self.route(item).await;
                }
            }
            Err(e) => {
                error!(peer = self.id(), "Closing connection: {}", e);
                let _ = self
                    .disconnect(NetworkConfig::CLOSE_INVALID_PAYLOAD, "undecodable stream")
                    .await;
            }
        }
    }

    async fn on_close(&self, code: Option<u16>, reason: &str) {
        self.teardown(code, reason);
    }
}
