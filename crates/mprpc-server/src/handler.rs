//! Method handlers for the demo server and the command line client.

use mprpc_core::{Handler, HandlerFactory, MethodResult, Params, Peer, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Longest a `sleep` call may ask for.
const MAX_SLEEP_MS: u64 = 60_000;

/// How long `callback` waits for the client to answer.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Factory giving every connection its own demo handler.
///
/// With `shutdown` set, the handler also exposes a `shutdown` method that
/// notifies it.
pub fn demo_factory(shutdown: Option<Arc<Notify>>) -> impl HandlerFactory {
    move |peer: &Peer| demo_handler(peer, shutdown.clone())
}

pub fn demo_handler(peer: &Peer, shutdown: Option<Arc<Notify>>) -> Handler {
    let callback_peer = peer.clone();
    debug!(peer = peer.id(), "Binding demo handler");

    let mut builder = Handler::builder()
        .method("test", |_| async { Ok(json!("hello")) })
        .method("echo", echo)
        .method("add", add)
        .method("sleep", sleep)
        .method("callback", move |params| callback(callback_peer.clone(), params))
        .method("_secret", |_| async { Ok(json!("hidden")) })
        .attribute("version", env!("CARGO_PKG_VERSION"));

    if let Some(shutdown) = shutdown {
        builder = builder.method("shutdown", move |_| {
            let shutdown = shutdown.clone();
            async move {
                info!("Shutdown requested");
                shutdown.notify_one();
                Ok(Value::Null)
            }
        });
    }
    builder.build()
}

/// Handler bound by `mprpc call`, so servers can call back into it.
pub fn cli_handler() -> Handler {
    Handler::builder()
        .method("whoami", |_| async { Ok(json!("mprpc call")) })
        .build()
}

async fn echo(params: Params) -> MethodResult {
    Ok(Value::Array(params.into_vec()))
}

async fn add(params: Params) -> MethodResult {
    let (a, b): (Value, Value) = params.parse()?;
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let sum = a
            .checked_add(b)
            .ok_or_else(|| RpcError::invalid_params("integer overflow"))?;
        return Ok(json!(sum));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(RpcError::invalid_params("add expects two numbers").into()),
    }
}

async fn sleep(params: Params) -> MethodResult {
    let ms: u64 = params.get(0)?;
    if ms > MAX_SLEEP_MS {
        return Err(RpcError::invalid_params(format!("sleep is limited to {} ms", MAX_SLEEP_MS)).into());
    }
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!(ms))
}

/// `callback(method, [args])`: call `method` on the caller and return its answer.
async fn callback(peer: Peer, params: Params) -> MethodResult {
    let method: String = params.get(0)?;
    let args: Vec<Value> = params.optional(1)?.unwrap_or_default();

    let handle = peer.call(&method, args).await?;
    let answer = handle.get(Some(CALLBACK_TIMEOUT)).await?;
    Ok(answer)
}
