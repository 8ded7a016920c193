// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::cas::{CasClient, CAS_ENDPOINT};
use crate::citadel::{citadel_address, load_provisioning_cert, CitadelClient, CitadelOptions};
use crate::client::CaClient;
use crate::config::{CaBackend, CaConfig};
use crate::discovery::{discover_mesh_env, ConfigSource};
use crate::error::{CaError, Result};
use crate::meshca::MeshCaClient;
use meshlink_common_http::RetryConfig;
use meshlink_identity::{CsrBundle, Identity, SpiffeId};
use meshlink_sts::{PlatformCredentials, PlatformTokenSource, TokenExchange, TokenProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const PEM_END: &str = "-----END CERTIFICATE-----";

/// A signed chain, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaResponse {
	pub chain: Vec<String>,
}

impl CaResponse {
	pub fn chain_pem(&self) -> String {
		let mut pem = String::new();
		for cert in &self.chain {
			pem.push_str(cert.trim_end());
			pem.push('\n');
		}
		pem
	}

	pub fn root(&self) -> Option<&str> {
		self.chain.last().map(String::as_str)
	}
}

/// Splits concatenated PEM certificates; CAs are inconsistent about
/// returning one block per element.
pub fn split_pem_chain(chain: &[String]) -> Vec<String> {
	chain
		.iter()
		.flat_map(|entry| entry.split_inclusive(PEM_END))
		.map(str::trim)
		.filter(|block| block.contains(PEM_END))
		.map(|block| format!("{block}\n"))
		.collect()
}

/// Token material the CA backends authenticate with.
pub struct IssuerCredentials {
	pub platform: Arc<dyn PlatformTokenSource>,
	pub exchange: Option<Arc<TokenExchange>>,
}

pub struct CertificateIssuer {
	client: Arc<dyn CaClient>,
}

impl CertificateIssuer {
	pub fn new(client: Arc<dyn CaClient>) -> Self {
		Self { client }
	}

	/// Builds the configured backend. Citadel without an explicit address
	/// discovers it from the mesh environment, retrying with `retry_cfg`.
	#[instrument(skip_all, fields(backend = %config.backend))]
	pub async fn connect(
		config: &CaConfig,
		source: &dyn ConfigSource,
		credentials: IssuerCredentials,
		retry_cfg: &RetryConfig,
	) -> Result<Self> {
		let client: Arc<dyn CaClient> = match config.backend {
			CaBackend::Citadel => {
				let (address, discovered_root) = match &config.ca_addr {
					Some(addr) => (addr.clone(), None),
					None => {
						let env = discover_mesh_env(source, retry_cfg).await?;
						let mcon = env.mcon_addr.unwrap_or_default();
						(citadel_address(&mcon), env.ca_root)
					}
				};
				let provisioning = match &config.prov_cert_dir {
					Some(dir) => load_provisioning_cert(dir).await?,
					None => None,
				};
				let platform: Arc<dyn TokenProvider> = Arc::new(
					PlatformCredentials::new(credentials.platform)
						.with_audience(config.trust_domain.clone()),
				);
				let options = CitadelOptions {
					address,
					root_pem: config.ca_root_pem.clone().or(discovered_root),
					cluster_id: config.cluster_id.clone(),
					cert_signer: config.cert_signer.clone(),
					provisioning,
				};
				Arc::new(CitadelClient::new(options, platform, config.trust_domain.clone())?)
			}
			CaBackend::MeshCa => {
				let exchange = require_exchange(credentials.exchange, config.backend)?;
				Arc::new(MeshCaClient::new(
					&config.meshca_addr,
					config.location.as_deref(),
					exchange,
				)?)
			}
			CaBackend::Cas => {
				let exchange = require_exchange(credentials.exchange, config.backend)?;
				let pool = config
					.cas_pool
					.clone()
					.ok_or_else(|| CaError::Config("CAS backend requires a CA pool".into()))?;
				Arc::new(CasClient::with_client(
					CAS_ENDPOINT,
					pool,
					exchange,
					meshlink_common_http::new_client()?,
				))
			}
		};
		info!(backend = client.name(), "CA client ready");
		Ok(Self::new(client))
	}

	pub fn client(&self) -> &Arc<dyn CaClient> {
		&self.client
	}

	/// Signs `csr_pem` once. Any failure, including a chain without an
	/// issuer, is reported as [`CaError::IssuanceFailed`].
	#[instrument(skip(self, csr_pem), fields(backend = self.client.name()))]
	pub async fn request_certificate(&self, csr_pem: &str, validity: Duration) -> Result<CaResponse> {
		let raw = self
			.client
			.csr_sign(csr_pem, validity)
			.await
			.map_err(|e| CaError::IssuanceFailed(format!("{}: {e}", self.client.name())))?;

		let chain = split_pem_chain(&raw);
		if chain.len() < 2 {
			return Err(CaError::IssuanceFailed(format!(
				"{}: chain has {} certificate(s), expected leaf and issuer",
				self.client.name(),
				chain.len()
			)));
		}
		Ok(CaResponse { chain })
	}

	/// Generates a key for `id`, has it signed and returns the resulting
	/// identity, trusting the CA's root bundle (or the chain's root when the
	/// CA publishes none).
	#[instrument(skip(self), fields(spiffe_id = %id))]
	pub async fn bootstrap(&self, id: &SpiffeId, validity: Duration) -> Result<Identity> {
		let csr = CsrBundle::generate(id)?;
		let response = self.request_certificate(&csr.csr_pem, validity).await?;

		let mut roots = match self.client.root_cert_bundle().await {
			Ok(roots) => split_pem_chain(&roots),
			Err(e) => {
				warn!(error = %e, "root bundle unavailable, trusting chain root");
				Vec::new()
			}
		};
		if roots.is_empty() {
			roots.extend(response.root().map(str::to_string));
		}

		let identity = Identity::from_pem(
			csr.key_pem.as_bytes(),
			response.chain_pem().as_bytes(),
			Some(roots.concat().as_bytes()),
		)?;
		info!(not_after = identity.not_after(), "issued workload identity");
		Ok(identity)
	}

	pub async fn close(&self) {
		self.client.close().await;
	}
}

fn require_exchange(
	exchange: Option<Arc<TokenExchange>>,
	backend: CaBackend,
) -> Result<Arc<dyn TokenProvider>> {
	exchange
		.map(|e| e as Arc<dyn TokenProvider>)
		.ok_or_else(|| CaError::Config(format!("{backend} requires STS token exchange")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::discovery::StaticConfigSource;
	use async_trait::async_trait;
	use meshlink_identity::testing::TestCa;
	use meshlink_sts::StaticTokenSource;
	use std::sync::atomic::{AtomicBool, Ordering};

	struct TestCaClient {
		ca: TestCa,
		leaf_only: bool,
		closed: AtomicBool,
	}

	impl TestCaClient {
		fn new(leaf_only: bool) -> Self {
			Self {
				ca: TestCa::new("mesh-root"),
				leaf_only,
				closed: AtomicBool::new(false),
			}
		}
	}

	#[async_trait]
	impl CaClient for TestCaClient {
		fn name(&self) -> &'static str {
			"test"
		}

		async fn csr_sign(&self, csr_pem: &str, _ttl: Duration) -> Result<Vec<String>> {
			let chain = self.ca.sign_csr(csr_pem);
			let mut blocks = split_pem_chain(&[chain]);
			if self.leaf_only {
				blocks.truncate(1);
			}
			Ok(blocks)
		}

		async fn root_cert_bundle(&self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		async fn close(&self) {
			self.closed.store(true, Ordering::SeqCst);
		}
	}

	struct FailingCaClient;

	#[async_trait]
	impl CaClient for FailingCaClient {
		fn name(&self) -> &'static str {
			"failing"
		}

		async fn csr_sign(&self, _csr_pem: &str, _ttl: Duration) -> Result<Vec<String>> {
			Err(CaError::Rpc(tonic::Status::permission_denied("no")))
		}

		async fn root_cert_bundle(&self) -> Result<Vec<String>> {
			Ok(Vec::new())
		}

		async fn close(&self) {}
	}

	fn credentials() -> IssuerCredentials {
		IssuerCredentials {
			platform: Arc::new(StaticTokenSource::new("k8s-jwt")),
			exchange: None,
		}
	}

	#[test]
	fn split_handles_concatenated_blocks() {
		let ca = TestCa::new("root");
		let (_, chain) = ca.issue(None);
		let blocks = split_pem_chain(&[chain]);
		assert_eq!(blocks.len(), 2);
		assert!(blocks.iter().all(|b| b.starts_with("-----BEGIN CERTIFICATE-----")));
	}

	#[tokio::test]
	async fn bootstrap_yields_spiffe_identity() {
		let issuer = CertificateIssuer::new(Arc::new(TestCaClient::new(false)));
		let id = SpiffeId::new("cluster.local", "fortio", "default");

		let identity = issuer.bootstrap(&id, Duration::from_secs(3600)).await.unwrap();
		assert_eq!(identity.spiffe_id(), Some(&id));
		assert_eq!(identity.chain().len(), 2);
		assert_eq!(identity.roots().len(), 1);
	}

	#[tokio::test]
	async fn single_certificate_chain_is_rejected() {
		let issuer = CertificateIssuer::new(Arc::new(TestCaClient::new(true)));
		let csr = CsrBundle::generate(&SpiffeId::new("td", "ns", "sa")).unwrap();

		let result = issuer
			.request_certificate(&csr.csr_pem, Duration::from_secs(60))
			.await;
		assert!(matches!(result, Err(CaError::IssuanceFailed(_))));
	}

	#[tokio::test]
	async fn signing_error_is_issuance_failure() {
		let issuer = CertificateIssuer::new(Arc::new(FailingCaClient));
		let result = issuer.request_certificate("CSR", Duration::from_secs(60)).await;
		match result {
			Err(CaError::IssuanceFailed(msg)) => assert!(msg.starts_with("failing:")),
			other => panic!("expected IssuanceFailed, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn close_reaches_backend() {
		let client = Arc::new(TestCaClient::new(false));
		let issuer = CertificateIssuer::new(client.clone());
		issuer.close().await;
		assert!(client.closed.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn meshca_requires_exchange() {
		let config = CaConfig::new(CaBackend::MeshCa, "proj.svc.id.goog");
		let result = CertificateIssuer::connect(
			&config,
			&StaticConfigSource::new(),
			credentials(),
			&RetryConfig::fixed(1, Duration::ZERO),
		)
		.await;
		assert!(matches!(result, Err(CaError::Config(_))));
	}

	#[tokio::test]
	async fn citadel_connects_from_discovered_env() {
		let root = TestCa::new("istiod").root_pem();
		let source = StaticConfigSource::new().with_config_map(
			"istio-system",
			"mesh-env",
			[("MCON_ADDR", "localhost:15014"), ("CAROOT_ISTIOD", root.as_str())],
		);
		let config = CaConfig::new(CaBackend::Citadel, "cluster.local");

		let issuer = CertificateIssuer::connect(
			&config,
			&source,
			credentials(),
			&RetryConfig::fixed(1, Duration::ZERO),
		)
		.await
		.unwrap();
		assert_eq!(issuer.client().name(), "citadel");
		assert_eq!(issuer.client().root_cert_bundle().await.unwrap(), vec![root]);
	}
}
