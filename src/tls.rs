//! TLS termination and configuration
//!
//! The unwrap engine terminates TLS directly on an already-open client
//! socket using an impersonation certificate, and classifies the handshake
//! into exactly one of three outcomes. Client-side configuration for the
//! upstream fetch lives here too.

use crate::ca::CertStore;
use crate::error::{Error, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TlsError, ServerConfig, SignatureScheme,
};
use tokio_rustls::{server, TlsAcceptor, TlsConnector};

/// Outcome of one client-facing TLS handshake.
///
/// Exactly one of these fires per connection; an unresolved handshake is
/// bounded by the caller-supplied timeout.
pub enum HandshakeOutcome<S> {
  /// Handshake completed, decrypted bytes flow through the stream
  Secure(server::TlsStream<S>),
  /// The TLS layer rejected the handshake (usually a distrusted certificate)
  Rejected(io::Error),
  /// The socket ended before the handshake finished either way
  Closed,
}

/// Accept a TLS session over an already-open stream.
///
/// End-of-stream is classified as [`HandshakeOutcome::Closed`] only after the
/// `close_grace` delay, so a concurrent explicit TLS error can win the race.
/// The whole handshake is bounded by `timeout`; expiry counts as rejection.
pub async fn accept<S>(
  config: Arc<ServerConfig>,
  stream: S,
  close_grace: Duration,
  timeout: Duration,
) -> HandshakeOutcome<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let acceptor = TlsAcceptor::from(config);
  match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
    Ok(Ok(tls_stream)) => HandshakeOutcome::Secure(tls_stream),
    Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
      tokio::time::sleep(close_grace).await;
      HandshakeOutcome::Closed
    }
    Ok(Err(e)) => HandshakeOutcome::Rejected(e),
    Err(_) => HandshakeOutcome::Rejected(io::Error::new(
      io::ErrorKind::TimedOut,
      "TLS handshake timed out",
    )),
  }
}

/// Build the server-side TLS configuration from an issued certificate
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)
    .map_err(|e| Error::tls(format!("failed to create TLS config: {}", e)))
}

/// Server configuration impersonating `host`, certificate from the store
pub async fn impersonation_config(certs: &CertStore, host: &str) -> Result<ServerConfig> {
  let (chain, key) = certs.certificate_for(host).await?;
  server_config(chain, key)
}

/// TLS connector for upstream fetches.
///
/// Upstream certificates are not verified: the client behind the proxy
/// already trusts our impersonation certificate instead of the target's, so
/// end-to-end verification is gone either way.
pub fn upstream_connector() -> TlsConnector {
  let config = ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier))
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

/// Turn a host string into a rustls server name for SNI
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
  ServerName::try_from(host.to_owned())
    .map_err(|_| Error::tls(format!("invalid server name: {}", host)))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TlsError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}
