//! External collaborator seams
//!
//! The proxy core hands fully-formed requests to a [`RequestListener`],
//! upgrade requests to an [`UpgradeHandler`], captured exchanges to a
//! [`CaptureSink`], and asks an [`InterceptFilter`] which requests to pause.
//! All four are trait objects so the surrounding application (UI process,
//! storage, browser automation) stays outside this crate.

use crate::error::Result;
use crate::intercept::{RequestId, RequestSnapshot};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe byte stream, the unit of connection ownership
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// An owned boxed connection stream
pub type TunnelStream = Box<dyn ByteStream>;

/// Processes one fully-formed HTTP request into a response.
///
/// Requests always carry an absolute URL, whether they arrived directly, via
/// a plaintext CONNECT tunnel, or from an unwrapped TLS session.
#[async_trait::async_trait]
pub trait RequestListener: Send + Sync {
  /// Handle one request; the returned response flows back down the same
  /// tunnel. Returning [`crate::Error::RequestDropped`] closes the
  /// client-facing connection instead.
  async fn handle(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>>;
}

/// Handles protocol upgrade (WebSocket) requests.
///
/// A single handler receives every upgrade regardless of which path the
/// request arrived on; the URL is always absolute.
#[async_trait::async_trait]
pub trait UpgradeHandler: Send + Sync {
  /// Take over the connection for the upgraded protocol
  async fn handle_upgrade(&self, request: http::Request<Bytes>, stream: TunnelStream)
    -> Result<()>;
}

/// Boundary to the external capture store.
///
/// Ids are assigned here and stay stable for the lifetime of the exchange;
/// the intercept side channel correlates decisions by them.
#[async_trait::async_trait]
pub trait CaptureSink: Send + Sync {
  /// Record a request about to be processed, returning its id
  async fn record_request(&self, request: &http::Request<Bytes>) -> RequestId;
  /// Record the response that completed the exchange
  async fn record_response(&self, id: RequestId, response: &http::Response<Bytes>);
}

/// Pure predicate deciding whether a request is paused for operator review
pub trait InterceptFilter: Send + Sync {
  /// `true` queues the request for interception
  fn should_intercept(&self, request: &http::Request<Bytes>) -> bool;
}

impl<F> InterceptFilter for F
where
  F: Fn(&http::Request<Bytes>) -> bool + Send + Sync,
{
  fn should_intercept(&self, request: &http::Request<Bytes>) -> bool {
    self(request)
  }
}

/// Recorded image of a response
#[derive(Clone, Debug)]
pub struct ResponseRecord {
  /// Response status
  pub status: StatusCode,
  /// Response headers
  pub headers: HeaderMap,
  /// Response body
  pub body: Bytes,
}

/// One captured request/response exchange
#[derive(Clone, Debug)]
pub struct CapturedExchange {
  /// The request as the listener saw it (id included)
  pub request: RequestSnapshot,
  /// The response, once the exchange completed
  pub response: Option<ResponseRecord>,
}

/// In-memory capture store, for standalone use and tests
#[derive(Default)]
pub struct MemoryCapture {
  state: Mutex<MemoryCaptureState>,
}

#[derive(Default)]
struct MemoryCaptureState {
  next_id: RequestId,
  exchanges: Vec<CapturedExchange>,
}

impl MemoryCapture {
  /// Create an empty store
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot of all captured exchanges
  pub fn exchanges(&self) -> Vec<CapturedExchange> {
    self.lock().exchanges.clone()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, MemoryCaptureState> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

#[async_trait::async_trait]
impl CaptureSink for MemoryCapture {
  async fn record_request(&self, request: &http::Request<Bytes>) -> RequestId {
    let mut state = self.lock();
    state.next_id += 1;
    let id = state.next_id;
    state.exchanges.push(CapturedExchange {
      request: RequestSnapshot::of(id, request),
      response: None,
    });
    id
  }

  async fn record_response(&self, id: RequestId, response: &http::Response<Bytes>) {
    let mut state = self.lock();
    if let Some(exchange) = state.exchanges.iter_mut().find(|e| e.request.id == id) {
      exchange.response = Some(ResponseRecord {
        status: response.status(),
        headers: response.headers().clone(),
        body: response.body().clone(),
      });
    }
  }
}
