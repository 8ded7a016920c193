// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{IdentityError, Result};
use crate::spiffe::SpiffeId;
use crate::verifier::{leaf_uri_sans, PeerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use x509_parser::prelude::*;
use zeroize::Zeroizing;

pub const DEFAULT_CERT_DIR: &str = "./var/run/secrets/istio.io/";
pub const KEY_FILE: &str = "key.pem";
pub const CERT_CHAIN_FILE: &str = "cert-chain.pem";
pub const ROOT_CERT_FILE: &str = "root-cert.pem";

pub const ALPN_ISTIO: &[u8] = b"istio";
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_H2R: &[u8] = b"h2r";

const FILE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Key, certificate chain and trusted roots of the local workload.
pub struct Identity {
	key_pem: Zeroizing<String>,
	chain_pem: String,
	roots_pem: String,
	chain: Vec<CertificateDer<'static>>,
	roots: Arc<RootCertStore>,
	spiffe_id: Option<SpiffeId>,
	subject: String,
	not_after: i64,
	provider: Arc<CryptoProvider>,
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity")
			.field("spiffe_id", &self.spiffe_id.as_ref().map(ToString::to_string))
			.field("subject", &self.subject)
			.field("chain_len", &self.chain.len())
			.field("roots", &self.roots.len())
			.field("not_after", &self.not_after)
			.finish_non_exhaustive()
	}
}

impl Identity {
	/// Loads `key.pem`, `cert-chain.pem` and (optionally) `root-cert.pem`
	/// from `cert_dir`. The files may be written by a co-located agent, so
	/// the key is polled for up to five seconds before failing with
	/// [`IdentityError::NotReady`].
	#[instrument(skip_all, fields(cert_dir = %cert_dir.as_ref().display()))]
	pub async fn load(cert_dir: impl AsRef<Path>) -> Result<Self> {
		let dir = cert_dir.as_ref();
		let key_path = dir.join(KEY_FILE);
		wait_for_file(&key_path, FILE_WAIT_TIMEOUT).await?;

		let key_pem = tokio::fs::read(&key_path).await?;
		let chain_pem = tokio::fs::read(dir.join(CERT_CHAIN_FILE)).await?;
		let roots_pem = match tokio::fs::read(dir.join(ROOT_CERT_FILE)).await {
			Ok(pem) => Some(pem),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				warn!("no root-cert.pem, peers cannot be verified until roots are added");
				None
			}
			Err(e) => return Err(e.into()),
		};

		Self::from_pem(&key_pem, &chain_pem, roots_pem.as_deref())
	}

	/// Builds an identity from PEM material held in memory, e.g. a freshly
	/// issued chain.
	pub fn from_pem(key_pem: &[u8], chain_pem: &[u8], roots_pem: Option<&[u8]>) -> Result<Self> {
		PrivateKeyDer::from_pem_slice(key_pem)
			.map_err(|e| IdentityError::InvalidPem(format!("private key: {e}")))?;
		let chain = parse_certificates(chain_pem)?;
		let leaf = chain.first().ok_or(IdentityError::MissingCertificate)?;

		let (subject, not_after) = leaf_summary(leaf)?;
		let uris = leaf_uri_sans(leaf)?;
		let spiffe_id = match uris.first() {
			Some(uri) => match SpiffeId::parse(uri) {
				Ok(id) => {
					info!(spiffe_id = %id, not_after, "loaded workload identity");
					Some(id)
				}
				Err(_) => {
					warn!(uri = %uri, %subject, "unexpected URI SAN, using subject-only identity");
					None
				}
			},
			None => {
				info!(%subject, not_after, "certificate has no URI SAN, using subject-only identity");
				None
			}
		};

		let mut identity = Self {
			key_pem: Zeroizing::new(String::from_utf8_lossy(key_pem).into_owned()),
			chain_pem: String::from_utf8_lossy(chain_pem).into_owned(),
			roots_pem: String::new(),
			chain,
			roots: Arc::new(RootCertStore::empty()),
			spiffe_id,
			subject,
			not_after,
			provider: Arc::new(rustls::crypto::ring::default_provider()),
		};
		if let Some(roots_pem) = roots_pem {
			identity.add_roots(roots_pem)?;
		}
		Ok(identity)
	}

	/// Adds PEM encoded roots to the trusted pool.
	pub fn add_roots(&mut self, roots_pem: &[u8]) -> Result<usize> {
		let certs = parse_certificates(roots_pem)?;
		let mut store = RootCertStore::clone(&self.roots);
		let (added, ignored) = store.add_parsable_certificates(certs);
		if ignored > 0 {
			warn!(ignored, "ignored unparsable root certificates");
		}
		debug!(added, "added trusted roots");

		let text = String::from_utf8_lossy(roots_pem);
		if !self.roots_pem.is_empty() && !self.roots_pem.ends_with('\n') {
			self.roots_pem.push('\n');
		}
		self.roots_pem.push_str(&text);
		self.roots = Arc::new(store);
		Ok(added)
	}

	/// Writes the identity back in the same layout [`Identity::load`] reads.
	#[instrument(skip_all, fields(cert_dir = %dir.as_ref().display()))]
	pub async fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
		let dir = dir.as_ref();
		tokio::fs::create_dir_all(dir).await?;
		tokio::fs::write(dir.join(CERT_CHAIN_FILE), self.chain_pem.as_bytes()).await?;
		tokio::fs::write(dir.join(ROOT_CERT_FILE), self.roots_pem.as_bytes()).await?;
		// key last: loaders wait on it
		tokio::fs::write(dir.join(KEY_FILE), self.key_pem.as_bytes()).await?;
		Ok(())
	}

	pub fn spiffe_id(&self) -> Option<&SpiffeId> {
		self.spiffe_id.as_ref()
	}

	pub fn trust_domain(&self) -> Option<&str> {
		self.spiffe_id.as_ref().map(SpiffeId::trust_domain)
	}

	pub fn namespace(&self) -> Option<&str> {
		self.spiffe_id.as_ref().map(SpiffeId::namespace)
	}

	pub fn service_account(&self) -> Option<&str> {
		self.spiffe_id.as_ref().map(SpiffeId::service_account)
	}

	pub fn subject(&self) -> &str {
		&self.subject
	}

	/// Leaf expiry as unix seconds.
	pub fn not_after(&self) -> i64 {
		self.not_after
	}

	pub fn chain(&self) -> &[CertificateDer<'static>] {
		&self.chain
	}

	pub fn roots(&self) -> Arc<RootCertStore> {
		Arc::clone(&self.roots)
	}

	pub fn provider(&self) -> Arc<CryptoProvider> {
		Arc::clone(&self.provider)
	}

	pub fn verifier(&self) -> PeerVerifier {
		PeerVerifier::new(
			self.trust_domain().map(str::to_string),
			self.roots(),
			self.provider(),
		)
	}

	fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
		PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
			.map_err(|e| IdentityError::InvalidPem(format!("private key: {e}")))
	}

	/// Server config presenting the local chain. Client certificates are
	/// requested but not required; see [`crate::peer_identity`].
	pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
		self.server_config_with(&[ALPN_ISTIO, ALPN_H2], false)
	}

	pub fn server_config_with(
		&self,
		alpn: &[&[u8]],
		require_client_cert: bool,
	) -> Result<Arc<ServerConfig>> {
		let verifier = self
			.verifier()
			.with_client_auth_mandatory(require_client_cert);

		let mut config = ServerConfig::builder_with_provider(self.provider())
			.with_safe_default_protocol_versions()?
			.with_client_cert_verifier(Arc::new(verifier))
			.with_single_cert(self.chain.clone(), self.private_key()?)?;
		config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
		Ok(Arc::new(config))
	}

	/// Client config presenting the local chain and verifying the server
	/// with the same peer rules as the server side.
	pub fn client_config(&self, alpn: &[&[u8]]) -> Result<Arc<ClientConfig>> {
		let mut config = ClientConfig::builder_with_provider(self.provider())
			.with_safe_default_protocol_versions()?
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(self.verifier()))
			.with_client_auth_cert(self.chain.clone(), self.private_key()?)?;
		config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
		Ok(Arc::new(config))
	}
}

/// Polls for `path` until it exists or `timeout` elapses.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> Result<()> {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if tokio::fs::try_exists(path).await.unwrap_or(false) {
			return Ok(());
		}
		if tokio::time::Instant::now() >= deadline {
			return Err(IdentityError::NotReady(path.display().to_string()));
		}
		tokio::time::sleep(FILE_POLL_INTERVAL).await;
	}
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
	CertificateDer::pem_slice_iter(pem)
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|e| IdentityError::InvalidPem(format!("certificate: {e}")))
}

fn leaf_summary(der: &CertificateDer<'_>) -> Result<(String, i64)> {
	let (_, cert) = X509Certificate::from_der(der.as_ref())
		.map_err(|e| IdentityError::Certificate(format!("failed to parse certificate: {e}")))?;
	Ok((
		cert.subject().to_string(),
		cert.validity().not_after.timestamp(),
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::TestCa;
	use tempfile::TempDir;

	#[tokio::test]
	async fn load_extracts_spiffe_components() {
		let ca = TestCa::new("root");
		let dir = TempDir::new().unwrap();
		ca.write_identity(dir.path(), Some("spiffe://cluster.local/ns/fortio/sa/default"));

		let identity = Identity::load(dir.path()).await.unwrap();
		assert_eq!(identity.trust_domain(), Some("cluster.local"));
		assert_eq!(identity.namespace(), Some("fortio"));
		assert_eq!(identity.service_account(), Some("default"));
		assert_eq!(
			identity.spiffe_id().unwrap().to_string(),
			"spiffe://cluster.local/ns/fortio/sa/default"
		);
		assert_eq!(identity.roots().len(), 1);
		assert_eq!(identity.chain().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn load_fails_not_ready_when_key_never_appears() {
		let dir = TempDir::new().unwrap();
		let started = tokio::time::Instant::now();

		let result = Identity::load(dir.path()).await;
		assert!(matches!(result, Err(IdentityError::NotReady(_))));
		assert!(started.elapsed() >= FILE_WAIT_TIMEOUT);
	}

	#[tokio::test]
	async fn load_waits_for_late_files() {
		let ca = TestCa::new("root");
		let dir = TempDir::new().unwrap();
		let path = dir.path().to_path_buf();

		let (key, chain) = ca.issue(Some("spiffe://cluster.local/ns/a/sa/b"));
		let root = ca.root_pem();
		let writer = tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(200)).await;
			tokio::fs::write(path.join(CERT_CHAIN_FILE), chain).await.unwrap();
			tokio::fs::write(path.join(ROOT_CERT_FILE), root).await.unwrap();
			tokio::fs::write(path.join(KEY_FILE), key).await.unwrap();
		});

		let identity = Identity::load(dir.path()).await.unwrap();
		writer.await.unwrap();
		assert_eq!(identity.namespace(), Some("a"));
	}

	#[test]
	fn non_spiffe_uri_gives_degraded_identity() {
		let ca = TestCa::new("root");
		let (key, chain) = ca.issue(Some("https://example.com/workload"));

		let identity = Identity::from_pem(key.as_bytes(), chain.as_bytes(), None).unwrap();
		assert!(identity.spiffe_id().is_none());
		assert!(identity.trust_domain().is_none());
		assert!(identity.subject().contains("workload"));
	}

	#[test]
	fn missing_uri_san_gives_degraded_identity() {
		let ca = TestCa::new("root");
		let (key, chain) = ca.issue(None);

		let identity = Identity::from_pem(key.as_bytes(), chain.as_bytes(), None).unwrap();
		assert!(identity.spiffe_id().is_none());
		assert!(identity.server_config().is_ok());
	}

	#[test]
	fn empty_chain_is_rejected() {
		let ca = TestCa::new("root");
		let (key, _) = ca.issue(None);
		let result = Identity::from_pem(key.as_bytes(), b"", None);
		assert!(matches!(result, Err(IdentityError::MissingCertificate)));
	}

	#[tokio::test]
	async fn save_then_load_roundtrips() {
		let ca = TestCa::new("root");
		let identity = ca.identity(Some("spiffe://cluster.local/ns/x/sa/y"));
		let dir = TempDir::new().unwrap();

		identity.save(dir.path()).await.unwrap();
		let loaded = Identity::load(dir.path()).await.unwrap();
		assert_eq!(loaded.spiffe_id(), identity.spiffe_id());
		assert_eq!(loaded.roots().len(), 1);
	}

	#[test]
	fn server_config_offers_istio_and_h2() {
		let ca = TestCa::new("root");
		let identity = ca.identity(Some("spiffe://cluster.local/ns/x/sa/y"));
		let config = identity.server_config().unwrap();
		assert_eq!(
			config.alpn_protocols,
			vec![ALPN_ISTIO.to_vec(), ALPN_H2.to_vec()]
		);
	}

	#[test]
	fn debug_does_not_print_key() {
		let ca = TestCa::new("root");
		let identity = ca.identity(Some("spiffe://cluster.local/ns/x/sa/y"));
		let debug = format!("{identity:?}");
		assert!(!debug.contains("PRIVATE KEY"));
		assert!(debug.contains("spiffe://cluster.local/ns/x/sa/y"));
	}
}
