//! Method handlers exposed to the remote peer.
//!
//! A [`Handler`] is a table of named async methods plus optional plain
//! attributes. Visibility follows two rules that are kept for wire
//! compatibility: names starting with `_` are never callable, and neither is
//! any name in the handler's declared private set.
//!
//! ```rust,ignore
//! let factory = |peer: &Peer| {
//!     let peer = peer.clone();
//!     Handler::builder()
//!         .method("test", |_params| async { Ok(json!("hello")) })
//!         .method("whoami", move |_params| {
//!             let peer = peer.clone();
//!             async move { Ok(json!(peer.id())) }
//!         })
//!         .private("whoami")
//!         .build()
//! };
//! ```

use crate::config::ProtocolConfig;
use crate::error::RpcError;
use crate::peer::Peer;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Return type of every handler method.
///
/// Returning an [`RpcError`] (converted into `anyhow::Error`) sends that exact
/// code and message back; any other error becomes `INTERNAL_ERROR`.
pub type MethodResult = anyhow::Result<Value>;

/// Type-erased handler method.
pub type MethodFn = Arc<dyn Fn(Params) -> BoxFuture<'static, MethodResult> + Send + Sync>;

#[derive(Clone)]
enum Member {
    Method(MethodFn),
    /// Present on the handler but not invocable.
    Attribute(Value),
}

/// Method table bound to one connection.
#[derive(Clone, Default)]
pub struct Handler {
    members: HashMap<String, Member>,
    private_methods: HashSet<String>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.members.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Handler")
            .field("members", &names)
            .field("private_methods", &self.private_methods)
            .finish()
    }
}

impl Handler {
    pub fn builder() -> HandlerBuilder {
        HandlerBuilder::default()
    }

    /// Handler without any callable methods.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_private(&self, name: &str) -> bool {
        name.starts_with(ProtocolConfig::PRIVATE_METHOD_PREFIX) || self.private_methods.contains(name)
    }

    /// Names a remote peer may call, sorted.
    pub fn public_methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .members
            .iter()
            .filter(|(name, member)| matches!(member, Member::Method(_)) && !self.is_private(name))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        match self.members.get(name) {
            Some(Member::Attribute(value)) => Some(value),
            _ => None,
        }
    }

    /// Look up a method a remote peer asked for.
    ///
    /// Every refusal is `METHOD_NOT_FOUND`; the message says which rule applied.
    pub fn resolve(&self, name: &str) -> Result<MethodFn, RpcError> {
        let member = self
            .members
            .get(name)
            .ok_or_else(|| RpcError::method_not_found(format!("Unknown method: {}", name)))?;

        if self.is_private(name) {
            return Err(RpcError::method_not_found(format!("Private method: {}", name)));
        }

        match member {
            Member::Method(method) => Ok(method.clone()),
            Member::Attribute(_) => Err(RpcError::method_not_found(format!(
                "Method not callable: {}",
                name
            ))),
        }
    }

    /// Factory that hands every connection a clone of this handler.
    pub fn into_factory(self) -> impl HandlerFactory {
        move |_: &Peer| self.clone()
    }
}

/// Builder for [`Handler`].
#[derive(Default)]
pub struct HandlerBuilder {
    handler: Handler,
}

impl HandlerBuilder {
    /// Register an async method. A later registration under the same name wins.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let method: MethodFn =
            Arc::new(move |params| -> BoxFuture<'static, MethodResult> { Box::pin(method(params)) });
        self.handler
            .members
            .insert(name.into(), Member::Method(method));
        self
    }

    /// Register a value that is visible on the handler but cannot be called.
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.handler
            .members
            .insert(name.into(), Member::Attribute(value.into()));
        self
    }

    /// Hide a method from remote callers.
    pub fn private(mut self, name: impl Into<String>) -> Self {
        self.handler.private_methods.insert(name.into());
        self
    }

    pub fn build(self) -> Handler {
        self.handler
    }
}

/// Creates the handler for each newly established connection.
///
/// Receives the owning peer so methods can call back into the other side.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create(&self, peer: &Peer) -> Handler;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Peer) -> Handler + Send + Sync + 'static,
{
    fn create(&self, peer: &Peer) -> Handler {
        self(peer)
    }
}

/// Positional parameters of an inbound call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    /// Raw value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Required parameter at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| RpcError::invalid_params(format!("Missing parameter #{}", index)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RpcError::invalid_params(format!("Invalid parameter #{}: {}", index, e)))
    }

    /// Optional parameter at `index`; absent and `null` both yield `None`.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    /// Deserialize the whole parameter list, typically into a tuple.
    pub fn parse<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        serde_json::from_value(Value::Array(self.0))
            .map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {}", e)))
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
