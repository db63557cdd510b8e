//! Impersonation certificate authority
//!
//! Generates and persists a local root CA, and issues short-lived leaf
//! certificates impersonating intercepted hosts. Issued leaves are cached and
//! shared read-only across connections.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Backdate not_before to tolerate client clock skew
const NOT_BEFORE_SKEW_SECS: i64 = 60;
/// How long issued leaves stay cached (half the validity window)
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Upper bound on distinct cached hosts
const CACHE_CAPACITY: u64 = 1000;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// The root certificate authority used to sign impersonation certificates
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load the CA from the storage path, generating and persisting a new one
  /// if none exists yet.
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }
    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
      (
        fs::read_to_string(&cert_path).await?,
        fs::read_to_string(&key_path).await?,
      )
    } else {
      let (cert_pem, key_pem) = Self::generate_root()?;
      fs::write(&cert_path, &cert_pem).await?;
      fs::write(&key_path, &key_pem).await?;
      (cert_pem, key_pem)
    };

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to load CA certificate: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      storage_path,
    })
  }

  /// Generate a fresh self-signed root, returning (cert PEM, key PEM)
  fn generate_root() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Waylay Proxy CA");
    dn.push(DnType::OrganizationName, "Kali-Team");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(3650);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate CA key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign CA: {}", e)))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Issue a leaf certificate impersonating `host`, signed by this CA.
  ///
  /// Returns the chain `[leaf, ca]` and the leaf private key.
  pub fn issue(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid host name: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_SKEW_SECS);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;
    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// CA certificate in PEM form, for installation in a client trust store
  pub fn ca_cert_pem(&self) -> Result<String> {
    std::fs::read_to_string(self.ca_cert_path())
      .map_err(|e| Error::certificate(format!("failed to read CA certificate: {}", e)))
  }

  /// Path of the persisted CA certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

type CachedLeaf = Arc<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;

/// Issues and caches impersonation certificates per host
pub struct CertStore {
  authority: CertificateAuthority,
  leaves: Cache<String, CachedLeaf>,
}

impl CertStore {
  /// Open (or initialize) the certificate store at the given path
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let authority = CertificateAuthority::new(storage_path).await?;
    let leaves = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();
    Ok(Self { authority, leaves })
  }

  /// Get a cached or freshly issued certificate for `host`
  pub async fn certificate_for(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let Some(cached) = self.leaves.get(host).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }
    let (chain, key) = self.authority.issue(host)?;
    self
      .leaves
      .insert(host.to_string(), Arc::new((chain.clone(), key.clone_key())))
      .await;
    Ok((chain, key))
  }

  /// CA certificate in PEM form
  pub fn ca_cert_pem(&self) -> Result<String> {
    self.authority.ca_cert_pem()
  }

  /// Path of the persisted CA certificate
  pub fn ca_cert_path(&self) -> PathBuf {
    self.authority.ca_cert_path()
  }
}
