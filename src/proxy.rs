//! Proxy configuration and the top-level handle

use crate::ca::CertStore;
use crate::error::Result;
use crate::forward::{ForwardingListener, RelayUpgrade};
use crate::intercept::{InterceptEvent, InterceptPolicy, InterceptQueue};
use crate::listener::{CaptureSink, InterceptFilter, MemoryCapture, RequestListener, UpgradeHandler};
use crate::server::ProxyServer;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Configuration for the intercepting proxy
#[derive(Clone)]
pub struct ProxyConfig {
  /// Path to store the CA certificate and key
  pub ca_storage_path: PathBuf,
  /// Unwrap TLS inside CONNECT tunnels (off relays them blindly)
  pub https_interception: bool,
  /// Host name presented when a client speaks TLS directly to the proxy port
  pub proxy_hostname: String,
  /// Bound on the client-facing TLS handshake race
  pub handshake_timeout: Duration,
  /// Delay before an end-of-stream during the handshake counts as rejection,
  /// letting a concurrent explicit TLS error win. Tunable, not a protocol
  /// guarantee.
  pub handshake_close_grace: Duration,
  /// Intercept queue policy (decision timeout seam)
  pub intercept: InterceptPolicy,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: PathBuf::from(".waylay"),
      https_interception: true,
      proxy_hostname: "localhost".to_string(),
      handshake_timeout: Duration::from_secs(10),
      handshake_close_grace: Duration::from_millis(10),
      intercept: InterceptPolicy::default(),
    }
  }
}

/// The intercepting proxy: certificate store, decision queue, and server
pub struct InterceptProxy {
  config: ProxyConfig,
  certs: Arc<CertStore>,
  queue: InterceptQueue,
  events: Option<UnboundedReceiver<InterceptEvent>>,
  capture: Arc<dyn CaptureSink>,
  filter: Arc<dyn InterceptFilter>,
  request_listener: Option<Arc<dyn RequestListener>>,
  upgrade_handler: Option<Arc<dyn UpgradeHandler>>,
}

impl InterceptProxy {
  /// Create a proxy with the given configuration.
  ///
  /// Nothing is intercepted until a filter is installed; traffic is captured
  /// into an in-memory store unless a sink is provided.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let certs = Arc::new(CertStore::new(&config.ca_storage_path).await?);
    let (queue, events) = InterceptQueue::new(config.intercept);
    Ok(Self {
      config,
      certs,
      queue,
      events: Some(events),
      capture: Arc::new(MemoryCapture::new()),
      filter: Arc::new(|_: &http::Request<Bytes>| false),
      request_listener: None,
      upgrade_handler: None,
    })
  }

  /// Create a proxy with the default configuration
  pub async fn default() -> Result<Self> {
    Self::new(ProxyConfig::default()).await
  }

  /// Use an external capture store instead of the in-memory one
  pub fn with_capture(mut self, capture: Arc<dyn CaptureSink>) -> Self {
    self.capture = capture;
    self
  }

  /// Install the predicate selecting requests for operator review
  pub fn with_filter(mut self, filter: Arc<dyn InterceptFilter>) -> Self {
    self.filter = filter;
    self
  }

  /// Replace the default forwarding request listener entirely
  pub fn with_request_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
    self.request_listener = Some(listener);
    self
  }

  /// Replace the default upgrade relay
  pub fn with_upgrade_handler(mut self, handler: Arc<dyn UpgradeHandler>) -> Self {
    self.upgrade_handler = Some(handler);
    self
  }

  /// Handle to the intercept decision queue (resolve decisions through it)
  pub fn queue(&self) -> InterceptQueue {
    self.queue.clone()
  }

  /// Take the operator event receiver; yields `None` after the first call
  pub fn take_events(&mut self) -> Option<UnboundedReceiver<InterceptEvent>> {
    self.events.take()
  }

  /// CA certificate in PEM format for client trust-store installation
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.certs.ca_cert_pem()
  }

  /// Path of the persisted CA certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.certs.ca_cert_path()
  }

  /// Assemble the server from the configured parts
  pub fn server(&self) -> ProxyServer {
    let listener = self.request_listener.clone().unwrap_or_else(|| {
      Arc::new(ForwardingListener::new(
        self.capture.clone(),
        self.filter.clone(),
        self.queue.clone(),
      ))
    });
    let upgrades = self
      .upgrade_handler
      .clone()
      .unwrap_or_else(|| Arc::new(RelayUpgrade::new()));
    ProxyServer::new(self.config.clone(), self.certs.clone(), listener, upgrades)
  }

  /// Start the proxy server on the given address
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.server().run(addr).await
  }
}
