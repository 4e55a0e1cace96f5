//! Pending-call ledger.
//!
//! Correlates outbound Requests with the Responses that eventually answer them.
//! Each registered call gets a [`CallHandle`] the caller can wait on; the
//! ledger settles it exactly once, either with the matching Response or with
//! a termination when the connection goes away. Entries are looked up by id
//! and iterated in registration order.
//!
//! Timed-out waits do not evict the entry. A late Response still settles it,
//! and whatever is left is reclaimed by [`Ledger::drain_all`] on disconnect.

use crate::codec::CallId;
use crate::config::NetworkConfig;
use crate::error::{CallError, Error, Result, RpcError};
use crate::id::IdGenerator;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Settled { error: Value, result: Value },
    Terminated,
}

#[derive(Debug)]
struct Entry {
    method: String,
    /// Registration order, for iteration.
    seq: u64,
    slot: watch::Sender<Option<Outcome>>,
}

#[derive(Debug)]
struct LedgerState {
    ids: IdGenerator,
    pending: HashMap<CallId, Entry>,
    next_seq: u64,
    closed: bool,
}

impl LedgerState {
    /// Entries in registration order.
    fn ordered(&self) -> Vec<(CallId, &Entry)> {
        let mut entries: Vec<(CallId, &Entry)> =
            self.pending.iter().map(|(id, entry)| (*id, entry)).collect();
        entries.sort_unstable_by_key(|(_, entry)| entry.seq);
        entries
    }
}

/// Correlation table from call id to pending outcome.
#[derive(Debug)]
pub struct Ledger {
    state: Mutex<LedgerState>,
    max_pending: usize,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(NetworkConfig::MAX_PENDING_CALLS)
    }
}

impl Ledger {
    pub fn new(max_pending: usize) -> Self {
        Self::with_ids(IdGenerator::new(), max_pending)
    }

    /// Ledger drawing ids from `ids`.
    ///
    /// `max_pending` is capped at the number of distinct ids `ids` can issue.
    pub fn with_ids(ids: IdGenerator, max_pending: usize) -> Self {
        let id_space = usize::try_from(ids.bound())
            .map_or(usize::MAX, |bound| bound.saturating_add(1));
        Self {
            state: Mutex::new(LedgerState {
                ids,
                pending: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            max_pending: max_pending.clamp(1, id_space),
        }
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Allocate an id and record an unsettled entry for it.
    ///
    /// Ids still owned by an outstanding call are skipped.
    pub fn register(&self, method: &str) -> Result<(CallId, CallHandle)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::NotConnected);
        }
        if state.pending.len() >= self.max_pending {
            warn!(
                pending = state.pending.len(),
                limit = self.max_pending,
                "too many pending calls; refusing {}",
                method
            );
            return Err(Error::TooManyPendingCalls {
                limit: self.max_pending,
            });
        }

        let id = loop {
            let candidate = state.ids.next_id();
            if !state.pending.contains_key(&candidate) {
                break candidate;
            }
        };

        let (slot, rx) = watch::channel(None);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(
            id,
            Entry {
                method: method.to_string(),
                seq,
                slot,
            },
        );

        Ok((
            id,
            CallHandle {
                id,
                method: method.to_string(),
                rx,
            },
        ))
    }

    /// Settle the entry for `id` with a Response.
    ///
    /// Returns false (and logs) for unknown ids, which covers duplicate and
    /// stale Responses.
    pub fn resolve(&self, id: CallId, error: Value, result: Value) -> bool {
        let entry = self.state.lock().pending.remove(&id);
        match entry {
            Some(entry) => {
                debug!(id, method = %entry.method, "call settled");
                entry
                    .slot
                    .send_replace(Some(Outcome::Settled { error, result }));
                true
            }
            None => {
                warn!("on_response: request id={} not found", id);
                false
            }
        }
    }

    /// Forget an entry whose Request never left this peer.
    pub fn abandon(&self, id: CallId) -> bool {
        self.state.lock().pending.remove(&id).is_some()
    }

    /// Terminate every pending call, oldest first, and refuse new
    /// registrations.
    ///
    /// Returns the number of calls terminated; later invocations return 0.
    pub fn drain_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            state.closed = true;
            let mut entries: Vec<Entry> = state.pending.drain().map(|(_, entry)| entry).collect();
            entries.sort_unstable_by_key(|entry| entry.seq);
            entries
        };

        for entry in &drained {
            debug!(method = %entry.method, "call terminated by disconnect");
            entry.slot.send_replace(Some(Outcome::Terminated));
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.state.lock().pending.contains_key(&id)
    }

    /// Ids of outstanding calls in registration order.
    pub fn pending_ids(&self) -> Vec<CallId> {
        self.state.lock().ordered().into_iter().map(|(id, _)| id).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Whether a Response's error slot carries an error.
///
/// `null`, `false`, zero, and empty strings, arrays and maps all count as
/// "no error", matching peers that only fill the slot when something failed.
fn error_slot_set(error: &Value) -> bool {
    match error {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Caller-side view of one outbound call.
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Debug, Clone)]
pub struct CallHandle {
    id: CallId,
    method: String,
    rx: watch::Receiver<Option<Outcome>>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the call has been settled or terminated.
    pub fn is_finished(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// Whether a real Response (success or error) has arrived.
    pub fn is_response_available(&self) -> bool {
        matches!(*self.rx.borrow(), Some(Outcome::Settled { .. }))
    }

    /// Wait until the call finishes. `None` waits without bound.
    ///
    /// Returns whether the call finished within the timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.rx.clone();
        let finished = async move {
            // An Err means the ledger itself is gone, which also ends the call.
            let _ = rx.wait_for(Option::is_some).await;
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished).await.is_ok(),
            None => {
                finished.await;
                true
            }
        }
    }

    /// Wait for the outcome and return the result value.
    pub async fn get(&self, timeout: Option<Duration>) -> std::result::Result<Value, CallError> {
        if !self.wait(timeout).await {
            return Err(CallError::Timeout(timeout.unwrap_or_default()));
        }

        let outcome = self.rx.borrow().clone();
        match outcome {
            Some(Outcome::Settled { error, result }) => {
                if error_slot_set(&error) {
                    Err(CallError::Remote(RpcError::from_value(&error)))
                } else {
                    Ok(result)
                }
            }
            Some(Outcome::Terminated) | None => Err(CallError::Terminated),
        }
    }

    /// Like [`get`](Self::get), deserializing the result into `T`.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        timeout: Option<Duration>,
    ) -> std::result::Result<T, CallError> {
        let value = self.get(timeout).await?;
        serde_json::from_value(value).map_err(CallError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    #[tokio::test]
    async fn test_register_assigns_sequential_ids() {
        let ledger = Ledger::default();
        let (a, _) = ledger.register("a").unwrap();
        let (b, _) = ledger.register("b").unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.pending_ids(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_resolve_settles_handle() {
        let ledger = Ledger::default();
        let (id, handle) = ledger.register("test").unwrap();
        assert!(!handle.is_finished());

        assert!(ledger.resolve(id, Value::Null, json!("hello")));
        assert!(handle.is_finished());
        assert!(handle.is_response_available());
        assert_eq!(handle.get(SHORT).await.unwrap(), json!("hello"));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let ledger = Ledger::default();
        let (id, handle) = ledger.register("test").unwrap();

        assert!(ledger.resolve(id, Value::Null, json!(1)));
        assert!(!ledger.resolve(id, Value::Null, json!(2)));
        assert_eq!(handle.get(SHORT).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_unknown_response_is_ignored() {
        let ledger = Ledger::default();
        assert!(!ledger.resolve(42, Value::Null, json!(true)));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_error_slot_shapes() {
        let ledger = Ledger::default();

        let (id, handle) = ledger.register("a").unwrap();
        ledger.resolve(id, json!([-32601, "Unknown method: a"]), Value::Null);
        let err = handle.get(SHORT).await.unwrap_err();
        assert_eq!(err.code(), Some(-32601));

        let (id, handle) = ledger.register("b").unwrap();
        ledger.resolve(id, json!({"code": -32010, "message": "nope"}), Value::Null);
        match handle.get(SHORT).await.unwrap_err() {
            CallError::Remote(e) => assert_eq!((e.code, e.message.as_str()), (-32010, "nope")),
            other => panic!("Expected remote error, got {:?}", other),
        }

        let (id, handle) = ledger.register("c").unwrap();
        ledger.resolve(id, json!("plain failure"), Value::Null);
        match handle.get(SHORT).await.unwrap_err() {
            CallError::Remote(e) => {
                assert_eq!(e.code, crate::error::USER_ERROR);
                assert_eq!(e.message, "plain failure");
            }
            other => panic!("Expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_drain_terminates_everything() {
        let ledger = Ledger::default();
        let handles: Vec<CallHandle> = (0..5)
            .map(|i| ledger.register(&format!("m{}", i)).unwrap().1)
            .collect();

        assert_eq!(ledger.drain_all(), 5);
        assert!(ledger.is_empty());
        assert!(ledger.is_closed());

        for handle in handles {
            assert!(handle.is_finished());
            assert!(!handle.is_response_available());
            assert!(matches!(handle.get(SHORT).await, Err(CallError::Terminated)));
        }

        assert_eq!(ledger.drain_all(), 0);
    }

    #[tokio::test]
    async fn test_register_after_drain_fails() {
        let ledger = Ledger::default();
        ledger.drain_all();
        assert!(matches!(ledger.register("late"), Err(Error::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_entry_for_late_response() {
        let ledger = Ledger::default();
        let (id, handle) = ledger.register("slow").unwrap();

        let err = handle.get(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout(d) if d == Duration::from_secs(1)));
        assert!(ledger.contains(id));

        assert!(ledger.resolve(id, Value::Null, json!("late")));
        assert_eq!(handle.get(Some(Duration::from_secs(1))).await.unwrap(), json!("late"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_timeout() {
        let ledger = Ledger::default();
        let (_, handle) = ledger.register("slow").unwrap();
        assert!(!handle.wait(Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn test_waiter_is_woken_by_resolve() {
        let ledger = std::sync::Arc::new(Ledger::default());
        let (id, handle) = ledger.register("later").unwrap();

        let resolver = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            resolver.resolve(id, Value::Null, json!(5));
        });

        assert_eq!(handle.get_as::<i64>(None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_get_as_type_mismatch() {
        let ledger = Ledger::default();
        let (id, handle) = ledger.register("x").unwrap();
        ledger.resolve(id, Value::Null, json!("text"));
        assert!(matches!(
            handle.get_as::<u32>(SHORT).await,
            Err(CallError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_limit() {
        let ledger = Ledger::new(2);
        ledger.register("a").unwrap();
        ledger.register("b").unwrap();
        assert!(matches!(
            ledger.register("c"),
            Err(Error::TooManyPendingCalls { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_wrapped_ids_skip_outstanding_calls() {
        let ledger = Ledger::with_ids(IdGenerator::with_bound(2), 16);
        let (a, _) = ledger.register("a").unwrap();
        let (b, _) = ledger.register("b").unwrap();
        let (c, _) = ledger.register("c").unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        ledger.resolve(1, Value::Null, Value::Null);

        // Generator wraps to 0, which is still outstanding
        let (d, _) = ledger.register("d").unwrap();
        assert_eq!(d, 1);
        assert_eq!(ledger.pending_ids(), vec![0, 2, 1]);
    }

    #[tokio::test]
    async fn test_pending_limit_never_exceeds_id_space() {
        let ledger = Ledger::with_ids(IdGenerator::with_bound(1), 16);
        assert_eq!(ledger.max_pending(), 2);

        ledger.register("a").unwrap();
        ledger.register("b").unwrap();
        assert!(matches!(
            ledger.register("c"),
            Err(Error::TooManyPendingCalls { limit: 2 })
        ));

        ledger.resolve(0, Value::Null, Value::Null);
        let (id, _) = ledger.register("d").unwrap();
        assert_eq!(id, 0);
    }

    #[tokio::test]
    async fn test_empty_error_slots_are_success() {
        let ledger = Ledger::default();
        for empty in [json!(false), json!(""), json!(0), json!(0.0), json!([]), json!({})] {
            let (id, handle) = ledger.register("quiet").unwrap();
            ledger.resolve(id, empty.clone(), json!("ok"));
            assert_eq!(handle.get(SHORT).await.unwrap(), json!("ok"), "error slot {}", empty);
        }

        for set in [json!(true), json!(1), json!("bad"), json!([0])] {
            let (id, handle) = ledger.register("loud").unwrap();
            ledger.resolve(id, set.clone(), Value::Null);
            assert!(
                matches!(handle.get(SHORT).await, Err(CallError::Remote(_))),
                "error slot {}",
                set
            );
        }
    }

    #[tokio::test]
    async fn test_abandon_removes_entry() {
        let ledger = Ledger::default();
        let (id, _handle) = ledger.register("unsent").unwrap();
        assert!(ledger.abandon(id));
        assert!(!ledger.abandon(id));
        assert!(ledger.is_empty());
    }
}
