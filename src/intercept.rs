//! Intercept decision queue
//!
//! Requests marked for review are paused one at a time: a single decision
//! slot holds the request currently shown to the operator, while later
//! arrivals wait in FIFO order. Freeing the slot promotes exactly the head of
//! the queue, so promotion is condition-driven rather than polled. Each entry
//! owns a one-shot decision channel keyed by request id.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Stable request identifier, assigned by the capture layer
pub type RequestId = u64;

/// Serializable image of a request shown to the operator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSnapshot {
  /// Request id, correlates the decision with this request
  pub id: RequestId,
  /// Request method
  #[serde(with = "http_serde::method")]
  pub method: Method,
  /// Absolute request URL
  #[serde(with = "http_serde::uri")]
  pub url: Uri,
  /// Request headers
  #[serde(with = "http_serde::header_map")]
  pub headers: HeaderMap,
  /// Request body
  #[serde(with = "bytes_serde")]
  pub body: Bytes,
}

impl RequestSnapshot {
  /// Snapshot an in-flight request under the given id
  pub fn of(id: RequestId, request: &http::Request<Bytes>) -> Self {
    Self {
      id,
      method: request.method().clone(),
      url: request.uri().clone(),
      headers: request.headers().clone(),
      body: request.body().clone(),
    }
  }
}

/// Fields an operator may replace on a forwarded request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedFields {
  /// Replacement method
  #[serde(default, with = "http_serde::option::method", skip_serializing_if = "Option::is_none")]
  pub method: Option<Method>,
  /// Replacement URL
  #[serde(default, with = "http_serde::option::uri", skip_serializing_if = "Option::is_none")]
  pub url: Option<Uri>,
  /// Replacement header set
  #[serde(
    default,
    with = "http_serde::option::header_map",
    skip_serializing_if = "Option::is_none"
  )]
  pub headers: Option<HeaderMap>,
  /// Replacement body
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Vec<u8>>,
}

/// The operator's ruling on one intercepted request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "modifiedFields", rename_all = "kebab-case")]
pub enum DecisionAction {
  /// Forward the request unchanged
  Forward,
  /// Forward the request with the supplied replacement fields
  ForwardModified(ModifiedFields),
  /// Drop the exchange entirely
  Drop,
}

/// A decision message from the operator, correlated by request id
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
  /// Id of the request this decision resolves
  pub request_id: RequestId,
  /// What to do with it
  #[serde(flatten)]
  pub action: DecisionAction,
}

/// Notifications sent to the operator side channel
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InterceptEvent {
  /// A request reached the decision slot and awaits review
  #[serde(rename_all = "camelCase")]
  RequestIntercepted {
    /// Full snapshot of the paused request
    request: RequestSnapshot,
  },
  /// A pending review became moot (the connection went away or timed out)
  #[serde(rename_all = "camelCase")]
  ReviewMoot {
    /// Id of the request whose review is moot
    request_id: RequestId,
  },
}

/// What to do when a decision wait exceeds the configured timeout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutAction {
  /// Forward the request unchanged
  #[default]
  Forward,
  /// Drop the exchange
  Drop,
}

/// Intercept queue policy.
///
/// The decision wait is unbounded by default, matching an operator who may
/// stall a flow indefinitely; `decision_timeout` is the seam for bounding it.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterceptPolicy {
  /// Bound on how long one request may await a decision
  pub decision_timeout: Option<Duration>,
  /// Applied when `decision_timeout` elapses
  pub timeout_action: TimeoutAction,
}

struct Entry {
  snapshot: RequestSnapshot,
  tx: Option<oneshot::Sender<DecisionAction>>,
}

#[derive(Default)]
struct State {
  /// Id currently awaiting a decision; at most one system-wide
  slot: Option<RequestId>,
  /// Queued ids in arrival order
  fifo: VecDeque<RequestId>,
  entries: HashMap<RequestId, Entry>,
}

struct Shared {
  state: Mutex<State>,
  events: mpsc::UnboundedSender<InterceptEvent>,
  policy: InterceptPolicy,
}

impl Shared {
  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  fn notify(&self, event: InterceptEvent) {
    // The operator channel may be gone; a send failure only means nobody is
    // listening.
    let _ = self.events.send(event);
  }

  /// Promote the FIFO head into the free slot and notify the operator
  fn promote_next(&self, state: &mut State) {
    while let Some(next) = state.fifo.pop_front() {
      if let Some(entry) = state.entries.get(&next) {
        state.slot = Some(next);
        tracing::debug!("[Intercept] promoting request {} from queue", next);
        self.notify(InterceptEvent::RequestIntercepted {
          request: entry.snapshot.clone(),
        });
        return;
      }
    }
  }

  /// Discard a pending entry, freeing the slot if it holds it
  fn cancel(&self, id: RequestId) {
    let mut state = self.lock();
    if state.entries.remove(&id).is_none() {
      return;
    }
    if state.slot == Some(id) {
      state.slot = None;
      self.notify(InterceptEvent::ReviewMoot { request_id: id });
      self.promote_next(&mut state);
    } else {
      state.fifo.retain(|queued| *queued != id);
      self.notify(InterceptEvent::ReviewMoot { request_id: id });
    }
  }
}

/// Discards the entry if the submitting pipeline is dropped mid-wait
struct CancelGuard {
  shared: Arc<Shared>,
  id: RequestId,
  armed: bool,
}

impl CancelGuard {
  fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for CancelGuard {
  fn drop(&mut self) {
    if self.armed {
      self.shared.cancel(self.id);
    }
  }
}

/// Handle to the intercept decision queue.
///
/// Clones share the same slot, queue, and operator channel.
#[derive(Clone)]
pub struct InterceptQueue {
  shared: Arc<Shared>,
}

impl InterceptQueue {
  /// Create a queue with the given policy, returning the operator event
  /// receiver alongside it.
  pub fn new(policy: InterceptPolicy) -> (Self, mpsc::UnboundedReceiver<InterceptEvent>) {
    let (events, receiver) = mpsc::unbounded_channel();
    let queue = Self {
      shared: Arc::new(Shared {
        state: Mutex::new(State::default()),
        events,
        policy,
      }),
    };
    (queue, receiver)
  }

  /// Submit a request for operator review and wait for its decision.
  ///
  /// The call suspends until this request's decision arrives (or the timeout
  /// policy fires), without blocking other connections. Dropping the returned
  /// future discards the entry, frees the slot if held, and notifies the
  /// operator that the review is moot.
  pub async fn submit(&self, snapshot: RequestSnapshot) -> Result<DecisionAction> {
    let id = snapshot.id;
    let (tx, rx) = oneshot::channel();
    {
      let mut state = self.shared.lock();
      if state.entries.contains_key(&id) {
        return Err(Error::invalid_request(format!(
          "request {} is already queued for interception",
          id
        )));
      }
      state.entries.insert(
        id,
        Entry {
          snapshot: snapshot.clone(),
          tx: Some(tx),
        },
      );
      if state.slot.is_none() && state.fifo.is_empty() {
        state.slot = Some(id);
        tracing::debug!("[Intercept] request {} awaiting decision", id);
        self.shared.notify(InterceptEvent::RequestIntercepted { request: snapshot });
      } else {
        tracing::debug!("[Intercept] request {} queued behind the decision slot", id);
        state.fifo.push_back(id);
      }
    }

    let guard = CancelGuard {
      shared: Arc::clone(&self.shared),
      id,
      armed: true,
    };

    let outcome = match self.shared.policy.decision_timeout {
      None => rx.await,
      Some(timeout) => match tokio::time::timeout(timeout, rx).await {
        Ok(outcome) => outcome,
        Err(_) => {
          // Timed out: discard the entry ourselves, then apply the policy
          guard.disarm();
          self.shared.cancel(id);
          tracing::warn!("[Intercept] decision wait for request {} timed out", id);
          return Ok(match self.shared.policy.timeout_action {
            TimeoutAction::Forward => DecisionAction::Forward,
            TimeoutAction::Drop => DecisionAction::Drop,
          });
        }
      },
    };
    guard.disarm();
    outcome.map_err(|_| Error::Connection("decision channel closed".to_string()))
  }

  /// Apply an operator decision to the request currently awaiting one.
  ///
  /// A decision for any other id is a recoverable no-op error; the slot state
  /// is left untouched for subsequent requests.
  pub fn resolve(&self, decision: Decision) -> Result<()> {
    let Decision { request_id, action } = decision;
    let mut state = self.shared.lock();
    if state.slot != Some(request_id) {
      tracing::warn!(
        "[Intercept] decision for request {} matches no awaiting request",
        request_id
      );
      return Err(Error::UnmatchedDecision(request_id));
    }
    state.slot = None;
    if let Some(mut entry) = state.entries.remove(&request_id) {
      if let Some(tx) = entry.tx.take() {
        // The waiting pipeline may have gone away concurrently
        let _ = tx.send(action);
      }
    }
    self.shared.promote_next(&mut state);
    Ok(())
  }

  /// Id of the request currently awaiting a decision, if any
  pub fn awaiting(&self) -> Option<RequestId> {
    self.shared.lock().slot
  }

  /// Number of requests queued behind the decision slot
  pub fn queued_len(&self) -> usize {
    self.shared.lock().fifo.len()
  }
}

pub(crate) mod bytes_serde {
  use bytes::Bytes;
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_bytes(v)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let bytes: Vec<u8> = Deserialize::deserialize(d)?;
    Ok(Bytes::from(bytes))
  }
}
