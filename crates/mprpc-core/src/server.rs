//! WebSocket RPC server.
//!
//! Accepts connections, binds a fresh handler to each one and keeps a
//! registry of connected peers so the application can broadcast to all of
//! them.
//!
//! # Thread Safety
//!
//! Each connection runs its own reader task. The registry is a `BTreeMap`
//! keyed by [`PeerId`] behind a `parking_lot::RwLock`, so iteration order is
//! connection order.

use crate::codec::{self, Message};
use crate::config::{NetworkConfig, ServerConfig};
use crate::error::Result;
use crate::handler::HandlerFactory;
use crate::peer::{Peer, PeerId};
use crate::transport::{websocket, ConnectionEvents, FrameSource, Transport};
use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running server. Dropping shuts down the server.
pub struct RpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl RpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server gracefully.
    ///
    /// Stops accepting new connections and closes every active connection
    /// with `1001 Going Away`.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the accept loop to stop.
    pub async fn join(mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// RPC server. Clones share the same registry.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    factory: Arc<dyn HandlerFactory>,
    config: ServerConfig,
    peers: RwLock<BTreeMap<PeerId, Peer>>,
    active_connections: AtomicUsize,
}

impl RpcServer {
    pub fn new<F: HandlerFactory>(factory: F) -> Self {
        Self::with_config(factory, ServerConfig::default())
    }

    pub fn with_config<F: HandlerFactory>(factory: F, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                factory: Arc::new(factory),
                config,
                peers: RwLock::new(BTreeMap::new()),
                active_connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Start accepting WebSocket connections on `addr`.
    ///
    /// The server runs in background tokio tasks until the handle is shut
    /// down or dropped.
    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("RPC server listening on ws://{}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(
            self.clone()
                .accept_loop(listener, shutdown_rx, conn_shutdown_rx),
        );

        Ok(RpcServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    /// Bind to `host:port` and serve until the accept loop stops.
    pub async fn listen(&self, host: &str, port: u16) -> Result<()> {
        let handle = self.bind((host, port)).await?;
        handle.join().await;
        Ok(())
    }

    /// Attach an already established connection and start serving it.
    ///
    /// The peer is registered once its handler is bound and unregistered as
    /// part of its teardown, right after its pending calls are drained.
    pub async fn serve_connection<T, S>(&self, transport: T, source: S) -> (Peer, JoinHandle<()>)
    where
        T: Transport,
        S: FrameSource,
    {
        let peer = Peer::with_shared_factory(
            Box::new(transport),
            self.inner.factory.clone(),
            &self.inner.config.peer,
        );
        peer.on_open().await;
        self.inner.peers.write().insert(peer.id(), peer.clone());

        let server = Arc::downgrade(&self.inner);
        peer.on_teardown(move |id| {
            if let Some(server) = server.upgrade() {
                if server.peers.write().remove(&id).is_some() {
                    debug!(peer = id, "peer unregistered");
                }
            }
        });

        let reader = peer.clone();
        let task = tokio::spawn(async move {
            source.run(&reader).await;
        });

        (peer, task)
    }

    /// Connected peers in connection order.
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.read().values().cloned().collect()
    }

    pub fn peer(&self, id: PeerId) -> Option<Peer> {
        self.inner.peers.read().get(&id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Send a raw frame to every connected peer.
    ///
    /// Returns how many peers accepted it; failures are logged and skipped.
    pub async fn write(&self, frame: Bytes) -> usize {
        let mut delivered = 0;
        for peer in self.peers() {
            match peer.write(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = peer.id(), "broadcast skipped: {}", e),
            }
        }
        delivered
    }

    /// Send one Notification to every connected peer.
    pub async fn notify_all(&self, method: &str, params: Vec<Value>) -> Result<usize> {
        let frame = codec::encode(&Message::Notification {
            method: method.to_string(),
            params,
        })?;
        Ok(self.write(frame).await)
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let max_connections = self.inner.config.max_connections;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("RPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = self.inner.active_connections.load(Ordering::Relaxed);
                            if current >= max_connections {
                                warn!(
                                    "Rejecting connection from {}: at max capacity ({})",
                                    peer_addr,
                                    max_connections
                                );
                                continue;
                            }

                            self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
                            let server = self.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Connection from {}", peer_addr);
                                if let Err(e) = server.handle_connection(stream, &mut conn_shutdown).await {
                                    debug!("Connection {} ended: {}", peer_addr, e);
                                }
                                server.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (transport, source) =
            websocket::accept(stream, self.inner.config.peer.heartbeat_interval).await?;
        let (peer, mut reader) = self.serve_connection(transport, source).await;

        let shutting_down = tokio::select! {
            _ = &mut reader => return Ok(()),
            _ = shutdown_rx.changed() => true,
            _ = peer.closed() => false,
        };

        if shutting_down {
            peer.disconnect(NetworkConfig::CLOSE_GOING_AWAY, "server shutting down")
                .await?;
        }
        // A client that never answers the close must not hold its slot
        if tokio::time::timeout(self.inner.config.close_timeout, &mut reader)
            .await
            .is_err()
        {
            debug!(peer = peer.id(), "reader did not finish, aborting");
            reader.abort();
        }
        Ok(())
    }
}
