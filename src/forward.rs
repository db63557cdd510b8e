//! Default request listener: capture, intercept pause, upstream fetch
//!
//! One exchange at a time: record the request, optionally hold it in the
//! decision queue, then replay it upstream over a fresh connection and bring
//! the response back through the tunnel it arrived on.

use crate::error::{Error, Result};
use crate::http1;
use crate::intercept::{DecisionAction, InterceptQueue, ModifiedFields, RequestSnapshot};
use crate::listener::{
  CaptureSink, InterceptFilter, RequestListener, TunnelStream, UpgradeHandler,
};
use crate::tls;
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Per-exchange HTTP client for the upstream side of the proxy
pub struct UpstreamClient {
  connect_timeout: Duration,
  tls: TlsConnector,
}

impl Default for UpstreamClient {
  fn default() -> Self {
    Self::new()
  }
}

impl UpstreamClient {
  /// Create a client with the default connect timeout
  pub fn new() -> Self {
    Self {
      connect_timeout: Duration::from_secs(10),
      tls: tls::upstream_connector(),
    }
  }

  /// Open a connection (TLS when the scheme is https) to the target of `uri`
  pub async fn open(&self, uri: &http::Uri) -> Result<TunnelStream> {
    let host = uri
      .host()
      .ok_or_else(|| Error::invalid_request(format!("URL without host: {}", uri)))?;
    let https = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
    let addr = format!("{}:{}", host, port);

    let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
      .await
      .map_err(|_| Error::connection(format!("connect to {} timed out", addr)))?
      .map_err(|e| Error::connection(format!("failed to connect to {}: {}", addr, e)))?;

    if https {
      let name = tls::server_name(host)?;
      let stream = self
        .tls
        .connect(name, stream)
        .await
        .map_err(|e| Error::tls(format!("upstream handshake with {} failed: {}", addr, e)))?;
      Ok(Box::new(stream))
    } else {
      Ok(Box::new(stream))
    }
  }

  /// Send one request over a fresh connection and read the full response
  pub async fn send(&self, request: &http::Request<Bytes>) -> Result<http::Response<Bytes>> {
    let request = sanitize(request)?;
    let mut stream = self.open(request.uri()).await?;
    stream.write_all(&http1::request_to_bytes(&request)).await?;
    stream.flush().await?;
    let mut reader = BufReader::new(stream);
    let mut response = http1::read_response(&mut reader, request.method() == Method::HEAD).await?;
    // The close handshake with the upstream is ours, not the client's
    response.headers_mut().remove(http::header::CONNECTION);
    Ok(response)
  }
}

/// Rebuild the request for the upstream wire: proxy bookkeeping headers go,
/// and the connection is single-use.
fn sanitize(request: &http::Request<Bytes>) -> Result<http::Request<Bytes>> {
  let mut builder = http::Request::builder()
    .method(request.method().clone())
    .uri(request.uri().clone())
    .version(request.version());
  if let Some(headers) = builder.headers_mut() {
    for (k, v) in request.headers() {
      if k == http::header::PROXY_AUTHORIZATION
        || k == http::header::CONNECTION
        || k.as_str() == "proxy-connection"
      {
        continue;
      }
      headers.append(k.clone(), v.clone());
    }
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
  }
  Ok(builder.body(request.body().clone())?)
}

/// The default [`RequestListener`]: capture, intercept, forward
pub struct ForwardingListener {
  capture: Arc<dyn CaptureSink>,
  filter: Arc<dyn InterceptFilter>,
  queue: InterceptQueue,
  client: UpstreamClient,
}

impl ForwardingListener {
  /// Wire a listener to a capture store, a filter, and the decision queue
  pub fn new(
    capture: Arc<dyn CaptureSink>,
    filter: Arc<dyn InterceptFilter>,
    queue: InterceptQueue,
  ) -> Self {
    Self {
      capture,
      filter,
      queue,
      client: UpstreamClient::new(),
    }
  }
}

#[async_trait::async_trait]
impl RequestListener for ForwardingListener {
  async fn handle(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
    let id = self.capture.record_request(&request).await;
    let mut request = request;

    if self.filter.should_intercept(&request) {
      tracing::debug!("[Proxy] request {} held for operator review", id);
      let action = self.queue.submit(RequestSnapshot::of(id, &request)).await?;
      match action {
        DecisionAction::Forward => {}
        DecisionAction::ForwardModified(fields) => apply_modifications(&mut request, fields),
        DecisionAction::Drop => {
          tracing::debug!("[Proxy] request {} dropped by operator decision", id);
          return Err(Error::RequestDropped);
        }
      }
    }

    let response = match self.client.send(&request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!("[Proxy] upstream fetch for request {} failed: {}", id, e);
        bad_gateway()
      }
    };
    self.capture.record_response(id, &response).await;
    Ok(response)
  }
}

/// Apply operator-supplied replacement fields to a request
fn apply_modifications(request: &mut http::Request<Bytes>, fields: ModifiedFields) {
  if let Some(method) = fields.method {
    *request.method_mut() = method;
  }
  if let Some(url) = fields.url {
    *request.uri_mut() = url;
  }
  if let Some(headers) = fields.headers {
    *request.headers_mut() = headers;
  }
  if let Some(body) = fields.body {
    *request.body_mut() = Bytes::from(body);
  }
}

fn bad_gateway() -> http::Response<Bytes> {
  let mut response = http::Response::new(Bytes::from_static(b"Bad Gateway"));
  *response.status_mut() = http::StatusCode::BAD_GATEWAY;
  response
}

/// The default [`UpgradeHandler`]: replay the upgrade request upstream and
/// splice bytes both ways until either side closes.
pub struct RelayUpgrade {
  client: UpstreamClient,
}

impl Default for RelayUpgrade {
  fn default() -> Self {
    Self::new()
  }
}

impl RelayUpgrade {
  /// Create a relay with its own upstream client
  pub fn new() -> Self {
    Self {
      client: UpstreamClient::new(),
    }
  }
}

#[async_trait::async_trait]
impl UpgradeHandler for RelayUpgrade {
  async fn handle_upgrade(
    &self,
    request: http::Request<Bytes>,
    mut stream: TunnelStream,
  ) -> Result<()> {
    let mut upstream = self.client.open(request.uri()).await?;
    upstream.write_all(&http1::request_to_bytes(&request)).await?;
    upstream.flush().await?;
    match tokio::io::copy_bidirectional(&mut stream, &mut upstream).await {
      Ok((up, down)) => {
        tracing::debug!("[Proxy] upgrade relay finished ({} up, {} down)", up, down);
      }
      Err(e) => {
        tracing::debug!("[Proxy] upgrade relay ended: {}", e);
      }
    }
    Ok(())
  }
}
