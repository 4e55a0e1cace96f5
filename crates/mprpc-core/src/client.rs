//! WebSocket RPC client.
//!
//! Opens a connection to a server and runs a [`Peer`] over it. The client is
//! a full peer: the server may call back into the handler bound here while
//! the client's own calls are outstanding.
//!
//! # Thread Safety
//!
//! All methods take `&self`; concurrent calls from many tasks share one
//! connection and are correlated by call id.

use crate::config::{NetworkConfig, PeerConfig};
use crate::error::Result;
use crate::handler::HandlerFactory;
use crate::ledger::CallHandle;
use crate::peer::Peer;
use crate::transport::websocket;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

/// Client side of a WebSocket RPC connection. Dropping it closes the
/// connection.
#[derive(Debug)]
pub struct RpcClient {
    peer: Peer,
    url: String,
    reader: Option<JoinHandle<()>>,
}

impl RpcClient {
    /// Connect to `url` (`ws://host:port/path`) with default settings.
    pub async fn connect<F: HandlerFactory>(url: &str, factory: F) -> Result<Self> {
        Self::connect_with_config(url, factory, PeerConfig::default()).await
    }

    /// Connect to `url`, giving up after `config.connect_timeout`.
    pub async fn connect_with_config<F: HandlerFactory>(
        url: &str,
        factory: F,
        config: PeerConfig,
    ) -> Result<Self> {
        let (transport, source) =
            websocket::connect(url, config.heartbeat_interval, config.connect_timeout).await?;
        let (peer, reader) = Peer::start(transport, source, factory, &config).await;

        info!(peer = peer.id(), "RPC client connected to {}", url);

        Ok(Self {
            peer,
            url: url.to_string(),
            reader: Some(reader),
        })
    }

    /// The peer running this connection.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<CallHandle> {
        self.peer.call(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.peer.notify(method, params).await
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// Close the connection with `1000 Normal Closure`.
    pub async fn disconnect(&self) -> Result<()> {
        self.peer
            .disconnect(NetworkConfig::CLOSE_NORMAL, "client disconnect")
            .await
    }

    /// Resolves once the connection is gone, from either side.
    pub async fn closed(&self) {
        self.peer.closed().await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.peer
            .teardown(Some(NetworkConfig::CLOSE_GOING_AWAY), "client dropped");
    }
}
