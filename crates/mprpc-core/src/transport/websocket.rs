//! WebSocket transport over `tokio-tungstenite`.
//!
//! Every protocol frame travels as one binary WebSocket message. Text messages
//! are accepted and fed to the decoder as raw bytes. With a heartbeat
//! interval configured, the reader pings the other side and closes the
//! connection when a whole interval passes without hearing anything back.

use super::{ConnectionEvents, FrameSource, Transport};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

type Sink<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, WsMessage>>>;

/// Sending half of a WebSocket connection.
pub struct WsTransport<S> {
    sink: Sink<S>,
    connected: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Receiving half of a WebSocket connection.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    sink: Sink<S>,
    connected: Arc<AtomicBool>,
    heartbeat: Option<Duration>,
}

/// Split an established WebSocket into its two halves.
pub fn split<S>(
    ws: WebSocketStream<S>,
    heartbeat: Option<Duration>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
) -> (WsTransport<S>, WsReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let sink = Arc::new(Mutex::new(sink));
    let connected = Arc::new(AtomicBool::new(true));

    (
        WsTransport {
            sink: sink.clone(),
            connected: connected.clone(),
            local_addr,
            peer_addr,
        },
        WsReader {
            stream,
            sink,
            connected,
            heartbeat,
        },
    )
}

/// Open a client connection to a `ws://host:port/path` URL.
pub async fn connect(
    url: &str,
    heartbeat: Option<Duration>,
    timeout: Duration,
) -> Result<(WsTransport<TcpStream>, WsReader<TcpStream>)> {
    let request = url
        .into_client_request()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", url, e)))?;

    let uri = request.uri();
    if uri.scheme_str() != Some("ws") {
        return Err(Error::InvalidAddress(format!(
            "{}: only ws:// URLs are supported",
            url
        )));
    }
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidAddress(format!("{}: missing host", url)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri.port_u16().unwrap_or(80);

    let handshake = async {
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
        Ok::<_, Error>((ws, local_addr, peer_addr))
    };

    let (ws, local_addr, peer_addr) = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| Error::ConnectTimeout(timeout))??;

    debug!("WebSocket connected to {}", url);
    Ok(split(ws, heartbeat, local_addr, peer_addr))
}

/// Complete the server side handshake on an accepted TCP stream.
pub async fn accept(
    stream: TcpStream,
    heartbeat: Option<Duration>,
) -> Result<(WsTransport<TcpStream>, WsReader<TcpStream>)> {
    let _ = stream.set_nodelay(true);
    let local_addr = stream.local_addr().ok();
    let peer_addr = stream.peer_addr().ok();
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(split(ws, heartbeat, local_addr, peer_addr))
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Binary(frame.to_vec())).await?;
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        match sink.send(WsMessage::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_disconnect() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_control(&self, message: WsMessage) -> bool {
        self.sink.lock().await.send(message).await.is_ok()
    }
}

#[async_trait]
impl<S> FrameSource for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, events: &dyn ConnectionEvents) {
        let mut ticker = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut heard_since_ping = true;

        let (code, reason) = loop {
            let next = tokio::select! {
                next = self.stream.next() => next,
                _ = tick(&mut ticker) => {
                    if !heard_since_ping {
                        warn!("No traffic for a heartbeat interval, closing connection");
                        let frame = CloseFrame {
                            code: CloseCode::from(NetworkConfig::CLOSE_GOING_AWAY),
                            reason: "heartbeat timeout".to_string().into(),
                        };
                        self.send_control(WsMessage::Close(Some(frame))).await;
                        break (Some(NetworkConfig::CLOSE_GOING_AWAY), "heartbeat timeout".to_string());
                    }
                    heard_since_ping = false;
                    if !self.send_control(WsMessage::Ping(Vec::new())).await {
                        break (None, "heartbeat ping failed".to_string());
                    }
                    continue;
                }
            };

            heard_since_ping = true;
            match next {
                Some(Ok(WsMessage::Binary(data))) => events.on_message(&data).await,
                Some(Ok(WsMessage::Text(text))) => events.on_message(text.as_bytes()).await,
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                }
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    break (None, e.to_string());
                }
                None => break (None, String::new()),
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        // Flushes the close handshake reply, if one is owed.
        let _ = self.sink.lock().await.close().await;
        events.on_close(code, &reason).await;
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        data: SyncMutex<Vec<u8>>,
        closed: SyncMutex<Option<Option<u16>>>,
    }

    #[async_trait]
    impl ConnectionEvents for Recorder {
        async fn on_open(&self) {}

        async fn on_message(&self, data: &[u8]) {
            self.data.lock().extend_from_slice(data);
        }

        async fn on_close(&self, code: Option<u16>, _reason: &str) {
            *self.closed.lock() = Some(code);
        }
    }

    async fn connected_pair() -> (
        (WsTransport<TcpStream>, WsReader<TcpStream>),
        (WsTransport<TcpStream>, WsReader<TcpStream>),
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream, None).await.unwrap()
        });
        let client = connect(&url, None, Duration::from_secs(5)).await.unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_binary_frames_and_close_code() {
        let ((client, _client_reader), (server, server_reader)) = connected_pair().await;
        assert!(client.peer_addr().is_some());
        assert_eq!(client.peer_addr(), server.local_addr());

        client.send(Bytes::from_static(b"abc")).await.unwrap();
        client.send(Bytes::from_static(b"def")).await.unwrap();
        client.close(NetworkConfig::CLOSE_NORMAL, "done").await.unwrap();
        assert!(!client.is_connected());

        let recorder = Recorder::default();
        server_reader.run(&recorder).await;

        assert_eq!(recorder.data.lock().as_slice(), b"abcdef");
        assert_eq!(*recorder.closed.lock(), Some(Some(NetworkConfig::CLOSE_NORMAL)));
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let ((client, _reader), _server) = connected_pair().await;
        client.close(NetworkConfig::CLOSE_NORMAL, "").await.unwrap();
        client.close(NetworkConfig::CLOSE_NORMAL, "").await.unwrap();
        assert!(matches!(
            client.send(Bytes::from_static(b"x")).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_ws_urls() {
        let err = connect("http://127.0.0.1:1/", None, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }
}
