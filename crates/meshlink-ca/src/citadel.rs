// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::client::{CaClient, GrpcConnection};
use crate::error::{CaError, Result};
use crate::proto::{IstioCertificateRequest, IstioCertificateResponse, ISTIO_CREATE_CERTIFICATE};
use async_trait::async_trait;
use meshlink_identity::{Identity, CERT_CHAIN_FILE, KEY_FILE};
use meshlink_sts::TokenProvider;
use prost_types::value::Kind;
use prost_types::{Struct, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tonic::transport::{Certificate, ClientTlsConfig};
use tracing::{info, instrument, warn};

pub const CITADEL_PORT: u16 = 15012;
pub const ISTIOD_SNI: &str = "istiod.istio-system.svc";

const CLUSTER_ID_METADATA: &str = "clusterid";
const CERT_SIGNER_FIELD: &str = "CertSigner";

/// Client certificate used to authenticate to the CA before the workload has
/// its own.
#[derive(Clone)]
pub struct ProvisioningCert {
	pub cert_pem: String,
	pub key_pem: String,
}

impl std::fmt::Debug for ProvisioningCert {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProvisioningCert").finish_non_exhaustive()
	}
}

#[derive(Debug, Clone)]
pub struct CitadelOptions {
	/// `host:port` of the CA.
	pub address: String,
	/// Root the CA's serving certificate chains to; webpki roots when unset.
	pub root_pem: Option<String>,
	pub cluster_id: String,
	pub cert_signer: Option<String>,
	pub provisioning: Option<ProvisioningCert>,
}

pub struct CitadelClient {
	conn: GrpcConnection,
	root_pem: Option<String>,
	cert_signer: Option<String>,
}

impl CitadelClient {
	/// `audience` is the audience requested from `credentials` for every
	/// call; for Istio CAs this is the trust domain.
	pub fn new(
		options: CitadelOptions,
		credentials: Arc<dyn TokenProvider>,
		audience: impl Into<String>,
	) -> Result<Self> {
		let mut tls = ClientTlsConfig::new();
		tls = match &options.root_pem {
			Some(root) => tls.ca_certificate(Certificate::from_pem(root)),
			None => tls.with_webpki_roots(),
		};
		if let Some(sni) = server_name_override(&options.address) {
			tls = tls.domain_name(sni);
		}
		if let Some(prov) = &options.provisioning {
			tls = tls.identity(tonic::transport::Identity::from_pem(
				&prov.cert_pem,
				&prov.key_pem,
			));
		}

		let conn = GrpcConnection::new(&options.address, tls, credentials, audience)?
			.with_metadata(CLUSTER_ID_METADATA, options.cluster_id.clone());

		Ok(Self {
			conn,
			root_pem: options.root_pem,
			cert_signer: options.cert_signer,
		})
	}

	fn build_request(&self, csr_pem: &str, ttl: Duration) -> IstioCertificateRequest {
		let metadata = self.cert_signer.as_ref().map(|signer| Struct {
			fields: BTreeMap::from([(
				CERT_SIGNER_FIELD.to_string(),
				Value {
					kind: Some(Kind::StringValue(signer.clone())),
				},
			)]),
		});
		IstioCertificateRequest {
			csr: csr_pem.to_string(),
			validity_duration: ttl.as_secs() as i64,
			metadata,
		}
	}
}

#[async_trait]
impl CaClient for CitadelClient {
	fn name(&self) -> &'static str {
		"citadel"
	}

	#[instrument(skip(self, csr_pem), fields(ttl_secs = ttl.as_secs()))]
	async fn csr_sign(&self, csr_pem: &str, ttl: Duration) -> Result<Vec<String>> {
		let request = self.build_request(csr_pem, ttl);
		let response: IstioCertificateResponse =
			self.conn.unary(ISTIO_CREATE_CERTIFICATE, request).await?;
		info!(chain_len = response.cert_chain.len(), "citadel signed certificate");
		Ok(response.cert_chain)
	}

	async fn root_cert_bundle(&self) -> Result<Vec<String>> {
		Ok(self.root_pem.iter().cloned().collect())
	}

	async fn close(&self) {
		self.conn.close().await;
	}
}

/// Local debugging tunnels reach istiod through `localhost`, so the
/// expected name is pinned instead of the dialed host.
pub fn server_name_override(address: &str) -> Option<&'static str> {
	address.contains("localhost").then_some(ISTIOD_SNI)
}

/// Citadel endpoint for a discovered mesh connector address.
pub fn citadel_address(mcon_addr: &str) -> String {
	let host = mcon_addr
		.rsplit_once(':')
		.filter(|(_, port)| port.parse::<u16>().is_ok())
		.map_or(mcon_addr, |(host, _)| host);
	format!("{host}:{CITADEL_PORT}")
}

/// Loads a provisioning certificate from `dir` when present and unexpired.
pub async fn load_provisioning_cert(dir: &Path) -> Result<Option<ProvisioningCert>> {
	let cert = match tokio::fs::read_to_string(dir.join(CERT_CHAIN_FILE)).await {
		Ok(cert) => cert,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(CaError::Io(e)),
	};
	let key = tokio::fs::read_to_string(dir.join(KEY_FILE)).await?;

	let identity = match Identity::from_pem(key.as_bytes(), cert.as_bytes(), None) {
		Ok(identity) => identity,
		Err(e) => {
			warn!(error = %e, dir = %dir.display(), "ignoring unreadable provisioning certificate");
			return Ok(None);
		}
	};
	let now = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_secs() as i64);
	if identity.not_after() <= now {
		info!(dir = %dir.display(), "provisioning certificate expired, using token only");
		return Ok(None);
	}

	Ok(Some(ProvisioningCert {
		cert_pem: cert,
		key_pem: key,
	}))
}
