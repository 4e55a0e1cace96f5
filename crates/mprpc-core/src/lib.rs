//! mprpc Core - Bidirectional MessagePack-RPC engine.
//!
//! Either side of a persistent connection can call named methods on the
//! other side and receive correlated responses, or send one-way
//! notifications. The same [`Peer`] engine backs both the accepting and the
//! connecting side.
//!
//! # Example
//!
//! ```rust,ignore
//! use mprpc_core::{Handler, RpcClient, RpcServer};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let handler = Handler::builder()
//!         .method("test", |_| async { Ok(json!("hello")) })
//!         .build();
//!     let server = RpcServer::new(handler.into_factory());
//!     let handle = server.bind("127.0.0.1:9091").await?;
//!
//!     let client = RpcClient::connect("ws://127.0.0.1:9091", Handler::empty().into_factory()).await?;
//!     let reply = client.call("test", vec![]).await?.get(None).await?;
//!     assert_eq!(reply, json!("hello"));
//!
//!     drop(handle);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod id;
pub mod ledger;
pub mod peer;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::RpcClient;
pub use codec::{CallId, Decoded, Decoder, Message};
pub use config::{NetworkConfig, PeerConfig, ProtocolConfig, ServerConfig};
pub use error::{CallError, Error, ErrorKind, Result, RpcError};
pub use handler::{Handler, HandlerBuilder, HandlerFactory, MethodResult, Params};
pub use id::IdGenerator;
pub use ledger::{CallHandle, Ledger};
pub use peer::{ConnectionState, Peer, PeerId};
pub use server::{RpcServer, RpcServerHandle};
pub use transport::{ConnectionEvents, FrameSource, Transport};
