//! Integration tests for waylay

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use waylay::{
  CertStore, Decision, DecisionAction, InterceptEvent, InterceptProxy, ProxyConfig,
  RequestListener, Result,
};

fn test_config(name: &str) -> ProxyConfig {
  let path = std::env::temp_dir().join(format!("waylay-test-{}", name));
  if path.exists() {
    std::fs::remove_dir_all(&path).ok();
  }
  ProxyConfig {
    ca_storage_path: path,
    ..Default::default()
  }
}

/// Request listener that records every URL it sees and answers 200 "ok"
#[derive(Default)]
struct RecordingListener {
  seen: Mutex<Vec<http::Uri>>,
}

impl RecordingListener {
  fn seen(&self) -> Vec<http::Uri> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait::async_trait]
impl RequestListener for RecordingListener {
  async fn handle(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
    self.seen.lock().unwrap().push(request.uri().clone());
    Ok(
      http::Response::builder()
        .status(http::StatusCode::OK)
        .body(Bytes::from_static(b"ok"))
        .unwrap(),
    )
  }
}

/// Spawn the proxy on an ephemeral port, returning its address
async fn start_proxy(proxy: &InterceptProxy) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let server = proxy.server();
  tokio::spawn(async move {
    let _ = server.serve_listener(listener).await;
  });
  addr
}

/// Read from the stream until the end of the HTTP head
async fn read_head<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
  let mut buf = Vec::new();
  let mut byte = [0u8; 1];
  while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
    match stream.read(&mut byte).await {
      Ok(0) | Err(_) => break,
      Ok(_) => buf.push(byte[0]),
    }
  }
  String::from_utf8_lossy(&buf).to_string()
}

async fn recv_event(
  events: &mut tokio::sync::mpsc::UnboundedReceiver<InterceptEvent>,
) -> InterceptEvent {
  tokio::time::timeout(Duration::from_secs(5), events.recv())
    .await
    .expect("timed out waiting for intercept event")
    .expect("event channel closed")
}

#[tokio::test]
async fn test_ca_generation() {
  let temp_dir = std::env::temp_dir().join("waylay-test-ca");
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertStore::new(&temp_dir).await;
  assert!(store.is_ok(), "Failed to create certificate store");
  let store = store.unwrap();

  let ca_pem = store.ca_cert_pem();
  assert!(ca_pem.is_ok(), "Failed to get CA certificate PEM");
  let pem_content = ca_pem.unwrap();
  assert!(
    pem_content.contains("BEGIN CERTIFICATE"),
    "Invalid PEM format"
  );
  assert!(store.ca_cert_path().exists(), "CA certificate not created");

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_leaf_certificate_and_tls_config() {
  use tokio_rustls::rustls::ServerConfig;

  let temp_dir = std::env::temp_dir().join("waylay-test-leaf");
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let store = CertStore::new(&temp_dir).await.unwrap();

  let (chain, key) = store.certificate_for("example.com").await.unwrap();
  assert_eq!(chain.len(), 2, "Expected leaf + CA in the chain");
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key);
  assert!(config.is_ok(), "Issued certificate unusable for TLS");

  // A cached leaf must still pair with its key
  let (chain, key) = store.certificate_for("example.com").await.unwrap();
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(chain, key);
  assert!(config.is_ok(), "Cached certificate unusable for TLS");

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn test_proxy_creation() {
  let config = test_config("creation");
  let proxy = InterceptProxy::new(config.clone()).await;
  assert!(proxy.is_ok(), "Failed to create proxy");
  let proxy = proxy.unwrap();
  assert!(proxy.ca_cert_pem().is_ok());
  assert!(proxy.ca_cert_path().exists());
  std::fs::remove_dir_all(&config.ca_storage_path).ok();
}

/// CONNECT with a TLS first byte: the tunnel is unwrapped with the
/// impersonation certificate and relative targets become absolute.
#[tokio::test]
async fn test_connect_tls_unwrap_rewrites_url() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};
  use tokio_rustls::TlsConnector;

  let listener = Arc::new(RecordingListener::default());
  let proxy = InterceptProxy::new(test_config("unwrap"))
    .await
    .unwrap()
    .with_request_listener(listener.clone());
  let addr = start_proxy(&proxy).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);

  // Handshake against the impersonation certificate, trusting the proxy CA
  let mut roots = RootCertStore::empty();
  let pem = proxy.ca_cert_pem().unwrap();
  for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(config));
  let name = ServerName::try_from("example.com").unwrap();
  let mut tls = connector.connect(name, stream).await.unwrap();

  tls
    .write_all(b"GET /foo HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut tls).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  let mut body = [0u8; 2];
  tls.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"ok");

  let seen = listener.seen();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].to_string(), "https://example.com:443/foo");
}

/// CONNECT with a non-TLS first byte: the socket is spliced through
/// untouched and no TLS session is attempted.
#[tokio::test]
async fn test_connect_plain_passthrough() {
  let listener = Arc::new(RecordingListener::default());
  let proxy = InterceptProxy::new(test_config("passthrough"))
    .await
    .unwrap()
    .with_request_listener(listener.clone());
  let addr = start_proxy(&proxy).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);

  stream
    .write_all(b"GET /socket HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);

  let seen = listener.seen();
  assert_eq!(seen.len(), 1);
  assert_eq!(seen[0].to_string(), "http://example.com:80/socket");
}

/// A malformed CONNECT target is rejected with 400 and no tunnel
#[tokio::test]
async fn test_connect_malformed_target() {
  let proxy = InterceptProxy::new(test_config("badtarget")).await.unwrap();
  let addr = start_proxy(&proxy).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 400"), "head: {}", head);
}

/// Full forward path: capture, upstream fetch, response relayed back
#[tokio::test]
async fn test_forward_through_local_upstream() {
  // Minimal upstream: answer one request and close
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut socket, _) = upstream.accept().await.unwrap();
    let _ = read_head(&mut socket).await;
    socket
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nupstream")
      .await
      .unwrap();
  });

  let capture = Arc::new(waylay::MemoryCapture::new());
  let proxy = InterceptProxy::new(test_config("forward"))
    .await
    .unwrap()
    .with_capture(capture.clone());
  let addr = start_proxy(&proxy).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{}/data HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
    upstream_addr.port(),
    upstream_addr.port()
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  let mut body = [0u8; 8];
  stream.read_exact(&mut body).await.unwrap();
  assert_eq!(&body, b"upstream");

  let exchanges = capture.exchanges();
  assert_eq!(exchanges.len(), 1);
  assert!(exchanges[0].request.url.to_string().contains("/data"));
  assert_eq!(
    exchanges[0].response.as_ref().unwrap().body.as_ref(),
    b"upstream"
  );
}

/// A drop decision closes the client connection instead of hanging it
#[tokio::test]
async fn test_drop_decision_closes_connection() {
  let mut proxy = InterceptProxy::new(test_config("drop"))
    .await
    .unwrap()
    .with_filter(Arc::new(|_: &http::Request<Bytes>| true));
  let mut events = proxy.take_events().unwrap();
  let queue = proxy.queue();
  let addr = start_proxy(&proxy).await;

  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"GET http://example.com/secret HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();

  let id = match recv_event(&mut events).await {
    InterceptEvent::RequestIntercepted { request } => {
      assert_eq!(request.url.to_string(), "http://example.com/secret");
      request.id
    }
    other => panic!("unexpected event: {:?}", other),
  };
  queue
    .resolve(Decision {
      request_id: id,
      action: DecisionAction::Drop,
    })
    .unwrap();

  // The connection must close without any response bytes
  let mut buf = Vec::new();
  let n = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
    .await
    .expect("connection must not hang")
    .unwrap();
  assert_eq!(n, 0, "expected no response, got: {:?}", buf);
}

/// Two intercepted requests are reviewed strictly one at a time, FIFO
#[tokio::test]
async fn test_intercept_fifo_over_connections() {
  let mut proxy = InterceptProxy::new(test_config("fifo"))
    .await
    .unwrap()
    .with_filter(Arc::new(|_: &http::Request<Bytes>| true));
  let mut events = proxy.take_events().unwrap();
  let queue = proxy.queue();
  let addr = start_proxy(&proxy).await;

  // First connection submits and is announced
  let mut first = TcpStream::connect(addr).await.unwrap();
  first
    .write_all(b"GET http://example.com/first HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  let first_id = match recv_event(&mut events).await {
    InterceptEvent::RequestIntercepted { request } => {
      assert_eq!(request.url.path(), "/first");
      request.id
    }
    other => panic!("unexpected event: {:?}", other),
  };

  // Second connection queues behind the occupied slot
  let mut second = TcpStream::connect(addr).await.unwrap();
  second
    .write_all(b"GET http://example.com/second HTTP/1.1\r\nHost: example.com\r\n\r\n")
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(queue.awaiting(), Some(first_id));

  queue
    .resolve(Decision {
      request_id: first_id,
      action: DecisionAction::Drop,
    })
    .unwrap();

  // Only after the first resolves is the second announced
  let second_id = match recv_event(&mut events).await {
    InterceptEvent::RequestIntercepted { request } => {
      assert_eq!(request.url.path(), "/second");
      request.id
    }
    other => panic!("unexpected event: {:?}", other),
  };
  queue
    .resolve(Decision {
      request_id: second_id,
      action: DecisionAction::Drop,
    })
    .unwrap();

  let mut buf = Vec::new();
  let _ = first.read_to_end(&mut buf).await;
  let _ = second.read_to_end(&mut buf).await;
}

/// A tunnel whose socket ends before the handshake resolves is treated as a
/// rejection; the proxy keeps serving other connections.
#[tokio::test]
async fn test_handshake_end_before_secure() {
  let listener = Arc::new(RecordingListener::default());
  let proxy = InterceptProxy::new(test_config("hsclose"))
    .await
    .unwrap()
    .with_request_listener(listener.clone());
  let addr = start_proxy(&proxy).await;

  {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
      .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
    // Send the TLS first byte so the unwrap engine engages, then vanish
    stream.write_all(&[22]).await.unwrap();
    drop(stream);
  }
  tokio::time::sleep(Duration::from_millis(200)).await;

  // Unrelated traffic is unaffected
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream
    .write_all(b"GET http://example.com/alive HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut stream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {}", head);
  assert_eq!(listener.seen().len(), 1);
}
