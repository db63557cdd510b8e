//! Polyglot listener and CONNECT tunnel
//!
//! One TCP port accepts direct HTTP requests, direct TLS sessions, and HTTP
//! CONNECT tunnels from the same accept loop. Each accepted connection runs
//! in its own task; a failure tears down that connection only.

use crate::ca::CertStore;
use crate::error::{Error, Result};
use crate::http1;
use crate::listener::{RequestListener, TunnelStream, UpgradeHandler};
use crate::proxy::ProxyConfig;
use crate::sniff::{RewindStream, StreamKind};
use crate::tls::{self, HandshakeOutcome};
use bytes::Bytes;
use http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Scheme and target of an established tunnel, used to rewrite relative
/// request targets into absolute URLs
#[derive(Clone, Debug)]
pub struct TunnelContext {
  /// `http` or `https`
  pub scheme: &'static str,
  /// Target host from the CONNECT request
  pub host: String,
  /// Target port from the CONNECT request
  pub port: u16,
}

impl TunnelContext {
  fn https(host: String, port: u16) -> Self {
    Self {
      scheme: "https",
      host,
      port,
    }
  }

  fn http(host: String, port: u16) -> Self {
    Self {
      scheme: "http",
      host,
      port,
    }
  }
}

struct ServerShared {
  config: ProxyConfig,
  certs: Arc<CertStore>,
  listener: Arc<dyn RequestListener>,
  upgrades: Arc<dyn UpgradeHandler>,
}

/// The proxy server: accept loop plus per-connection handling
pub struct ProxyServer {
  shared: Arc<ServerShared>,
}

impl ProxyServer {
  /// Assemble a server from its parts
  pub fn new(
    config: ProxyConfig,
    certs: Arc<CertStore>,
    listener: Arc<dyn RequestListener>,
    upgrades: Arc<dyn UpgradeHandler>,
  ) -> Self {
    Self {
      shared: Arc::new(ServerShared {
        config,
        certs,
        listener,
        upgrades,
      }),
    }
  }

  /// Bind the address and serve until the process ends
  pub async fn run(&self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection(format!("failed to bind {}: {}", addr, e)))?;
    tracing::info!("[Proxy] server listening on {}", addr);
    self.serve_listener(listener).await
  }

  /// Serve connections from an already-bound listener.
  ///
  /// Accept errors are logged and never abort the loop; per-connection
  /// errors are scoped to their own task.
  pub async fn serve_listener(&self, listener: TcpListener) -> Result<()> {
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let shared = self.shared.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(shared, stream, peer_addr).await {
              tracing::debug!("[Proxy] connection from {} ended: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[Proxy] failed to accept connection: {}", e);
        }
      }
    }
  }
}

/// Classify and dispatch one freshly accepted socket
async fn handle_connection(
  shared: Arc<ServerShared>,
  stream: TcpStream,
  peer_addr: SocketAddr,
) -> Result<()> {
  let mut stream = RewindStream::new(Box::new(stream) as TunnelStream);
  match stream.sniff().await? {
    StreamKind::Tls => {
      // A client speaking TLS directly to the proxy port: terminate with the
      // proxy's own certificate before HTTP parsing.
      let config = tls::impersonation_config(&shared.certs, &shared.config.proxy_hostname).await?;
      match tls::accept(
        Arc::new(config),
        stream,
        shared.config.handshake_close_grace,
        shared.config.handshake_timeout,
      )
      .await
      {
        HandshakeOutcome::Secure(tls_stream) => {
          serve(shared, Box::new(tls_stream), None).await
        }
        HandshakeOutcome::Rejected(e) => {
          tracing::warn!("[Proxy] TLS handshake with {} failed: {}", peer_addr, e);
          Ok(())
        }
        HandshakeOutcome::Closed => {
          tracing::warn!(
            "[Proxy] TLS handshake with {} ended before completing",
            peer_addr
          );
          Ok(())
        }
      }
    }
    StreamKind::Plain => serve(shared, Box::new(stream), None).await,
  }
}

/// Serve HTTP requests on one stream until it closes or another protocol
/// takes it over (CONNECT tunnel or upgrade)
async fn serve(
  shared: Arc<ServerShared>,
  stream: TunnelStream,
  ctx: Option<TunnelContext>,
) -> Result<()> {
  let mut reader = BufReader::new(stream);
  loop {
    let request = match http1::read_request(&mut reader).await? {
      Some(request) => request,
      None => return Ok(()),
    };

    if request.method() == Method::CONNECT {
      return handle_connect(shared, request, reader).await;
    }

    let keep_alive = wants_keep_alive(&request);
    let request = absolutize(request, ctx.as_ref())?;

    if request.headers().contains_key(http::header::UPGRADE) {
      tracing::debug!("[Proxy] forwarding upgrade for {}", request.uri());
      let stream = into_rewind(reader);
      return shared
        .upgrades
        .handle_upgrade(request, Box::new(stream))
        .await;
    }

    match shared.listener.handle(request).await {
      Ok(response) => {
        let raw = http1::response_to_bytes(&response);
        reader.get_mut().write_all(&raw).await?;
        reader.get_mut().flush().await?;
        if !keep_alive {
          return Ok(());
        }
      }
      Err(Error::RequestDropped) => {
        // The operator dropped the exchange: close the client connection
        // instead of leaving it hanging.
        let _ = reader.get_mut().shutdown().await;
        return Ok(());
      }
      Err(e) => {
        tracing::warn!("[Proxy] request handling failed: {}", e);
        reader
          .get_mut()
          .write_all(b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n")
          .await?;
        return Ok(());
      }
    }
  }
}

/// Reply to a CONNECT request and take over its socket as a tunnel
async fn handle_connect(
  shared: Arc<ServerShared>,
  request: http::Request<Bytes>,
  reader: BufReader<TunnelStream>,
) -> Result<()> {
  let mut stream = into_rewind(reader);
  let (host, port) = match parse_connect_target(request.uri()) {
    Ok(target) => target,
    Err(_) => {
      // Unparsable host:port: reject immediately, no tunnel attempted
      let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
      let _ = stream.shutdown().await;
      return Ok(());
    }
  };

  // The 200 goes out before anything else: the client starts its own
  // protocol (usually a TLS handshake) as soon as it sees success.
  stream
    .write_all(format!("{:?} 200 OK\r\n\r\n", request.version()).as_bytes())
    .await?;
  stream.flush().await?;

  tunnel(shared, host, port, stream).await
}

/// Sniff a freshly opened tunnel exactly once and route it
async fn tunnel(
  shared: Arc<ServerShared>,
  host: String,
  port: u16,
  mut stream: RewindStream<TunnelStream>,
) -> Result<()> {
  let kind = match stream.sniff().await {
    Ok(kind) => kind,
    Err(e) => {
      tracing::debug!("[Proxy] tunnel to {}:{} ended during sniff: {}", host, port, e);
      return Ok(());
    }
  };

  match kind {
    StreamKind::Tls if shared.config.https_interception => {
      tracing::debug!("[Proxy] unwrapping TLS connection to {}", host);
      let config = tls::impersonation_config(&shared.certs, &host).await?;
      match tls::accept(
        Arc::new(config),
        stream,
        shared.config.handshake_close_grace,
        shared.config.handshake_timeout,
      )
      .await
      {
        HandshakeOutcome::Secure(tls_stream) => {
          let ctx = TunnelContext::https(host, port);
          Box::pin(serve(shared, Box::new(tls_stream), Some(ctx))).await
        }
        HandshakeOutcome::Rejected(e) => {
          tracing::warn!("[Proxy] TLS handshake for {}:{} failed: {}", host, port, e);
          Ok(())
        }
        HandshakeOutcome::Closed => {
          tracing::warn!(
            "[Proxy] TLS handshake for {}:{} ended before completing",
            host,
            port
          );
          Ok(())
        }
      }
    }
    StreamKind::Tls => {
      // Interception disabled: blind byte relay to the real target
      tracing::debug!("[Proxy] relaying TLS connection to {}:{}", host, port);
      relay(stream, &host, port).await
    }
    StreamKind::Plain => {
      // Non-TLS CONNECT, probably a plain HTTP websocket: splice it back
      // into the HTTP serve path untouched.
      tracing::debug!("[Proxy] passing through connection to {}", host);
      let ctx = TunnelContext::http(host, port);
      Box::pin(serve(shared, Box::new(stream), Some(ctx))).await
    }
  }
}

/// Blind bidirectional relay between the client and the real target
async fn relay(mut client: RewindStream<TunnelStream>, host: &str, port: u16) -> Result<()> {
  let addr = format!("{}:{}", host, port);
  let mut target = TcpStream::connect(&addr)
    .await
    .map_err(|e| Error::connection(format!("failed to connect to {}: {}", addr, e)))?;
  match tokio::io::copy_bidirectional(&mut client, &mut target).await {
    Ok(_) => {}
    Err(e) => tracing::debug!("[Proxy] relay to {} ended: {}", addr, e),
  }
  Ok(())
}

/// Rewrite a relative request target into an absolute URL.
///
/// Absolute-form and `*` targets pass through; origin-form targets use the
/// tunnel context when inside a tunnel, the Host header otherwise.
fn absolutize(
  mut request: http::Request<Bytes>,
  ctx: Option<&TunnelContext>,
) -> Result<http::Request<Bytes>> {
  if request.uri().scheme().is_some() || request.uri().path() == "*" {
    return Ok(request);
  }
  let path = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  let absolute = match ctx {
    Some(ctx) => format!("{}://{}:{}{}", ctx.scheme, ctx.host, ctx.port, path),
    None => {
      let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::invalid_request("relative request target without Host header"))?;
      format!("http://{}{}", host, path)
    }
  };
  *request.uri_mut() = absolute
    .parse()
    .map_err(|_| Error::invalid_request(format!("cannot absolutize target: {}", absolute)))?;
  Ok(request)
}

/// Extract host and port from a CONNECT authority-form target
fn parse_connect_target(uri: &http::Uri) -> Result<(String, u16)> {
  let host = uri
    .host()
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::connect_target(uri.to_string()))?;
  let port = uri
    .port_u16()
    .ok_or_else(|| Error::connect_target(uri.to_string()))?;
  Ok((host.to_string(), port))
}

fn wants_keep_alive(request: &http::Request<Bytes>) -> bool {
  let connection = request
    .headers()
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("")
    .to_ascii_lowercase();
  if connection.contains("close") {
    return false;
  }
  if request.version() == http::Version::HTTP_10 && !connection.contains("keep-alive") {
    return false;
  }
  true
}

/// Turn a buffered reader back into a stream, replaying its unread bytes
fn into_rewind(reader: BufReader<TunnelStream>) -> RewindStream<TunnelStream> {
  let leftover = Bytes::copy_from_slice(reader.buffer());
  RewindStream::with_prefix(leftover, reader.into_inner())
}
