//! Intercepting MITM Proxy Engine
//!
//! This crate provides the transport and interception engine of a
//! man-in-the-middle (MITM) proxy: a single listener that accepts plain
//! HTTP, direct TLS, and HTTP CONNECT traffic on one port, unwraps TLS on
//! demand with a locally-issued impersonation certificate, and lets an
//! operator pause, inspect, and decide the fate of individual in-flight
//! requests.
//!
//! # Features
//!
//! - Polyglot listener: HTTP, CONNECT tunnels, and direct TLS on one port
//! - First-byte handshake sniffing with full byte replay
//! - Automatic CA generation and per-host impersonation certificates
//! - Single-slot FIFO intercept decision queue with a typed operator channel
//! - Trait seams for the capture store, intercept filter, request listener,
//!   and upgrade handler
//!
//! # Example
//!
//! ```no_run
//! use waylay::{InterceptProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = InterceptProxy::new(ProxyConfig::default()).await?;
//!     proxy.start("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

mod ca;
mod error;
mod forward;
mod http1;
mod intercept;
mod listener;
mod proxy;
mod server;
mod sniff;
mod tls;

pub use ca::{CertStore, CertificateAuthority};
pub use error::{Error, Result};
pub use forward::{ForwardingListener, RelayUpgrade, UpstreamClient};
pub use intercept::{
  Decision, DecisionAction, InterceptEvent, InterceptPolicy, InterceptQueue, ModifiedFields,
  RequestId, RequestSnapshot, TimeoutAction,
};
pub use listener::{
  ByteStream, CaptureSink, CapturedExchange, InterceptFilter, MemoryCapture, RequestListener,
  ResponseRecord, TunnelStream, UpgradeHandler,
};
pub use proxy::{InterceptProxy, ProxyConfig};
pub use server::{ProxyServer, TunnelContext};
pub use sniff::{classify, RewindStream, StreamKind, TLS_HANDSHAKE_BYTE};
pub use tls::HandshakeOutcome;

#[cfg(test)]
mod tests {
  #[test]
  fn it_works() {
    let result = 2 + 2;
    assert_eq!(result, 4);
  }
}
