//! Server and client talking over real WebSocket connections.

use mprpc_core::error::METHOD_NOT_FOUND;
use mprpc_core::{
    CallError, Handler, MethodResult, Params, Peer, PeerConfig, RpcClient, RpcServer,
    RpcServerHandle, ServerConfig,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

async fn sleep(params: Params) -> MethodResult {
    let ms: u64 = params.get(0)?;
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!(ms))
}

async fn greet_back(peer: Peer) -> MethodResult {
    let name: String = peer.call("name", vec![]).await?.get_as(WAIT).await?;
    Ok(json!(format!("hello, {}", name)))
}

fn server_factory(peer: &Peer) -> Handler {
    let peer = peer.clone();
    Handler::builder()
        .method("test", |_| async { Ok(json!("hello")) })
        .method("sleep", sleep)
        .method("greet", move |_| greet_back(peer.clone()))
        .build()
}

async fn start(config: ServerConfig) -> (RpcServer, RpcServerHandle, String) {
    let server = RpcServer::with_config(server_factory, config);
    let handle = server.bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", handle.addr());
    (server, handle, url)
}

fn named(name: &'static str) -> Handler {
    Handler::builder()
        .method("name", move |_| async move { Ok(json!(name)) })
        .build()
}

async fn wait_for_peers(server: &RpcServer, count: usize) {
    for _ in 0..200 {
        if server.peer_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Expected {} peers, have {}", count, server.peer_count());
}

#[tokio::test]
async fn test_call_over_websocket() {
    let (server, _handle, url) = start(ServerConfig::default()).await;
    let client = RpcClient::connect(&url, Handler::empty().into_factory())
        .await
        .unwrap();

    assert!(client.is_connected());
    assert_eq!(client.url(), url);
    assert!(client.peer().peer_addr().is_some());

    let reply = client.call("test", vec![]).await.unwrap().get(WAIT).await.unwrap();
    assert_eq!(reply, json!("hello"));

    let err = client.call("missing", vec![]).await.unwrap().get(WAIT).await.unwrap_err();
    assert_eq!(err.code(), Some(METHOD_NOT_FOUND));

    wait_for_peers(&server, 1).await;
}

#[tokio::test]
async fn test_server_calls_back_during_request() {
    let (_server, _handle, url) = start(ServerConfig::default()).await;
    let client = RpcClient::connect(&url, named("ada").into_factory()).await.unwrap();

    let reply = client.call("greet", vec![]).await.unwrap().get(WAIT).await.unwrap();
    assert_eq!(reply, json!("hello, ada"));
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let (server, _handle, url) = start(ServerConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let tx = tx.clone();
        let handler = Handler::builder()
            .method("news", move |params: Params| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(Value::Array(params.into_vec()));
                    Ok(Value::Null)
                }
            })
            .build();
        clients.push(RpcClient::connect(&url, handler.into_factory()).await.unwrap());
    }
    wait_for_peers(&server, 3).await;

    assert_eq!(server.notify_all("news", vec![json!(1)]).await.unwrap(), 3);
    for _ in 0..3 {
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, json!([1]));
    }

    clients[0].disconnect().await.unwrap();
    wait_for_peers(&server, 2).await;

    drop(clients);
    wait_for_peers(&server, 0).await;
}

#[tokio::test]
async fn test_shutdown_terminates_client_calls() {
    let (_server, mut handle, url) = start(ServerConfig::default()).await;
    let client = RpcClient::connect(&url, Handler::empty().into_factory())
        .await
        .unwrap();

    let pending = client.call("sleep", vec![json!(10_000)]).await.unwrap();
    handle.shutdown();

    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .unwrap();
    assert!(!client.is_connected());
    assert!(matches!(pending.get(WAIT).await, Err(CallError::Terminated)));
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_clients() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (server, _handle, url) = start(config).await;

    let first = RpcClient::connect(&url, Handler::empty().into_factory())
        .await
        .unwrap();
    wait_for_peers(&server, 1).await;

    let second = RpcClient::connect(&url, Handler::empty().into_factory()).await;
    assert!(second.is_err());

    let reply = first.call("test", vec![]).await.unwrap().get(WAIT).await.unwrap();
    assert_eq!(reply, json!("hello"));
}

#[tokio::test]
async fn test_heartbeat_keeps_idle_connection_alive() {
    let config = ServerConfig {
        peer: PeerConfig::default().with_heartbeat(Duration::from_millis(50)),
        ..ServerConfig::default()
    };
    let (_server, _handle, url) = start(config).await;

    let client_config = PeerConfig::default().with_heartbeat(Duration::from_millis(50));
    let client = RpcClient::connect_with_config(&url, Handler::empty().into_factory(), client_config)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(client.is_connected());
    let reply = client.call("test", vec![]).await.unwrap().get(WAIT).await.unwrap();
    assert_eq!(reply, json!("hello"));
}

#[tokio::test]
async fn test_unresponsive_client_releases_its_slot() {
    use futures::SinkExt;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let config = ServerConfig {
        max_connections: 1,
        close_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let (server, _handle, url) = start(config).await;

    // Sends one invalid frame, then never reads the server's close
    let (mut raw, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_peers(&server, 1).await;
    raw.send(WsMessage::Binary(vec![0xc1])).await.unwrap();
    wait_for_peers(&server, 0).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let client = loop {
        match RpcClient::connect(&url, Handler::empty().into_factory()).await {
            Ok(client) => break client,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("slot was never released: {}", e),
        }
    };

    let reply = client.call("test", vec![]).await.unwrap().get(WAIT).await.unwrap();
    assert_eq!(reply, json!("hello"));
    drop(raw);
}
