//! Inbound call execution.
//!
//! Every Request and Notification runs in its own tokio task, so a slow
//! handler never holds up the reader or other calls. A per-peer semaphore
//! bounds how many handler bodies run at once; excess tasks wait for a permit
//! inside their own task.

use crate::codec::CallId;
use crate::error::RpcError;
use crate::handler::{Handler, Params};
use crate::peer::Peer;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub(crate) struct Dispatcher {
    limiter: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(max_concurrent_calls: usize) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    /// Run `method` for the remote side.
    ///
    /// With an id, exactly one Response is sent once the handler finishes,
    /// provided the peer is still connected. Without one, the outcome is only
    /// logged.
    pub(crate) fn submit(
        &self,
        peer: Peer,
        handler: Option<Arc<Handler>>,
        id: Option<CallId>,
        method: String,
        params: Vec<Value>,
    ) {
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            // The semaphore is never closed, so a permit always arrives.
            let _permit = limiter.acquire_owned().await.ok();

            let outcome = match handler {
                Some(handler) => invoke(&handler, &method, params).await,
                None => Err(RpcError::method_not_found(format!(
                    "Unknown method: {}",
                    method
                ))),
            };

            match id {
                Some(id) => peer.respond(id, outcome).await,
                None => match outcome {
                    Ok(_) => debug!(peer = peer.id(), method = %method, "notification handled"),
                    Err(e) => warn!(peer = peer.id(), method = %method, "notification failed: {}", e),
                },
            }
        });
    }
}

/// Resolve and run one handler method, mapping every failure to an [`RpcError`].
pub async fn invoke(handler: &Handler, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
    let method_fn = handler.resolve(method)?;

    match AssertUnwindSafe(method_fn(Params::new(params)))
        .catch_unwind()
        .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(into_rpc_error(err)),
        Err(panic) => {
            let message = panic_message(&*panic);
            warn!(method, "handler panicked: {}", message);
            Err(RpcError::internal(message))
        }
    }
}

/// An [`RpcError`] passes through unchanged; anything else is an internal error.
pub fn into_rpc_error(err: anyhow::Error) -> RpcError {
    match err.downcast::<RpcError>() {
        Ok(rpc) => rpc,
        Err(other) => RpcError::internal(format!("{:#}", other)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
