// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::client::CaClient;
use crate::error::{CaError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use meshlink_sts::{TokenProvider, AUTHORIZATION};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

pub const CAS_ENDPOINT: &str = "https://privateca.googleapis.com";

const CERTIFICATE_ID_PREFIX: &str = "csr-workload-";
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateResponse {
	pem_certificate: String,
	#[serde(default)]
	pem_certificate_chain: Vec<String>,
}

#[derive(Serialize)]
struct FetchCaCertsRequest {}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchCaCertsResponse {
	#[serde(default)]
	ca_certs: Vec<CertChain>,
}

#[derive(Deserialize)]
struct CertChain {
	#[serde(default)]
	certificates: Vec<String>,
}

/// Certificate Authority Service pool. The subject is reflected from the
/// SPIFFE SAN of the CSR.
pub struct CasClient {
	http: Client,
	endpoint: String,
	/// `projects/<p>/locations/<l>/caPools/<pool>`
	pool: String,
	credentials: Arc<dyn TokenProvider>,
	closed: RwLock<bool>,
}

impl CasClient {
	pub fn new(pool: impl Into<String>, credentials: Arc<dyn TokenProvider>) -> Result<Self> {
		let http = meshlink_common_http::new_client()?;
		Ok(Self::with_client(CAS_ENDPOINT, pool, credentials, http))
	}

	pub fn with_client(
		endpoint: impl Into<String>,
		pool: impl Into<String>,
		credentials: Arc<dyn TokenProvider>,
		http: Client,
	) -> Self {
		Self {
			http,
			endpoint: endpoint.into().trim_end_matches('/').to_string(),
			pool: pool.into(),
			credentials,
			closed: RwLock::new(false),
		}
	}

	async fn bearer(&self) -> Result<String> {
		if *self.closed.read().await {
			return Err(CaError::Closed);
		}
		let metadata = self.credentials.request_metadata(&[""]).await?;
		metadata
			.get(AUTHORIZATION)
			.cloned()
			.ok_or_else(|| CaError::Config("token provider returned no authorization".into()))
	}

	async fn post_json(&self, url: &str, body: &impl Serialize) -> Result<reqwest::Response> {
		let response = self
			.http
			.post(url)
			.header(reqwest::header::AUTHORIZATION, self.bearer().await?)
			.json(body)
			.send()
			.await?;
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}
		Err(CaError::Status {
			endpoint: url.to_string(),
			status: status.as_u16(),
			body: response.text().await.unwrap_or_default(),
		})
	}
}

fn certificate_request_body(csr_pem: &str, ttl: Duration) -> serde_json::Value {
	json!({
		"lifetime": format!("{}s", ttl.as_secs()),
		"config": {
			"subjectConfig": {
				"subject": {},
			},
			"x509Config": {
				"keyUsage": {
					"baseKeyUsage": {
						"digitalSignature": true,
						"keyEncipherment": true,
					},
					"extendedKeyUsage": {
						"serverAuth": true,
						"clientAuth": true,
					},
				},
				"caOptions": {
					"isCa": false,
				},
			},
			"publicKey": {
				"format": "PEM",
				"key": STANDARD.encode(csr_pem),
			},
		},
		"subjectMode": "REFLECTED_SPIFFE",
	})
}

pub fn generate_certificate_id() -> String {
	let suffix: String = (0..8)
		.map(|_| ID_CHARSET[fastrand::usize(..ID_CHARSET.len())] as char)
		.collect();
	format!("{CERTIFICATE_ID_PREFIX}{suffix}")
}

#[async_trait]
impl CaClient for CasClient {
	fn name(&self) -> &'static str {
		"cas"
	}

	#[instrument(skip(self, csr_pem), fields(pool = %self.pool, ttl_secs = ttl.as_secs()))]
	async fn csr_sign(&self, csr_pem: &str, ttl: Duration) -> Result<Vec<String>> {
		let id = generate_certificate_id();
		let url = format!(
			"{}/v1/{}/certificates?certificateId={}",
			self.endpoint, self.pool, id
		);

		let response: CertificateResponse = self
			.post_json(&url, &certificate_request_body(csr_pem, ttl))
			.await?
			.json()
			.await?;

		let mut chain = Vec::with_capacity(1 + response.pem_certificate_chain.len());
		chain.push(response.pem_certificate);
		chain.extend(response.pem_certificate_chain);
		info!(certificate_id = %id, chain_len = chain.len(), "CAS issued certificate");
		Ok(chain)
	}

	#[instrument(skip(self), fields(pool = %self.pool))]
	async fn root_cert_bundle(&self) -> Result<Vec<String>> {
		let url = format!("{}/v1/{}:fetchCaCerts", self.endpoint, self.pool);
		let response: FetchCaCertsResponse = self
			.post_json(&url, &FetchCaCertsRequest {})
			.await?
			.json()
			.await?;

		let mut roots: Vec<String> = Vec::new();
		for chain in response.ca_certs {
			if let Some(root) = chain.certificates.last() {
				if !roots.contains(root) {
					roots.push(root.clone());
				}
			}
		}
		debug!(roots = roots.len(), "fetched CAS root bundle");
		Ok(roots)
	}

	async fn close(&self) {
		*self.closed.write().await = true;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use meshlink_sts::{PlatformCredentials, StaticTokenSource};
	use wiremock::matchers::{body_partial_json, header, method, path, query_param_contains};
	use wiremock::{Mock, MockServer, Request, ResponseTemplate};

	const POOL: &str = "projects/p/locations/us-central1/caPools/mesh";

	fn client_for(server: &MockServer) -> CasClient {
		let creds = Arc::new(PlatformCredentials::new(Arc::new(StaticTokenSource::new(
			"access-token",
		))));
		CasClient::with_client(server.uri(), POOL, creds, Client::new())
	}

	#[test]
	fn certificate_id_shape() {
		let id = generate_certificate_id();
		let suffix = id.strip_prefix(CERTIFICATE_ID_PREFIX).unwrap();
		assert_eq!(suffix.len(), 8);
		assert!(suffix
			.chars()
			.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
	}

	#[tokio::test]
	async fn csr_sign_posts_reflected_spiffe_request() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path(format!("/v1/{POOL}/certificates")))
			.and(query_param_contains("certificateId", CERTIFICATE_ID_PREFIX))
			.and(header("authorization", "Bearer access-token"))
			.and(body_partial_json(json!({
				"lifetime": "3600s",
				"subjectMode": "REFLECTED_SPIFFE",
				"config": {
					"x509Config": { "caOptions": { "isCa": false } },
					"publicKey": { "format": "PEM", "key": STANDARD.encode("CSR") },
				},
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"name": format!("{POOL}/certificates/csr-workload-abcd1234"),
				"pemCertificate": "LEAF",
				"pemCertificateChain": ["INTERMEDIATE", "ROOT"],
			})))
			.expect(1)
			.mount(&server)
			.await;

		let chain = client_for(&server)
			.csr_sign("CSR", Duration::from_secs(3600))
			.await
			.unwrap();
		assert_eq!(chain, vec!["LEAF", "INTERMEDIATE", "ROOT"]);
	}

	#[tokio::test]
	async fn root_bundle_dedupes_chain_roots() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path(format!("/v1/{POOL}:fetchCaCerts")))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"caCerts": [
					{ "certificates": ["INT-A", "ROOT-1"] },
					{ "certificates": ["INT-B", "ROOT-1"] },
					{ "certificates": ["ROOT-2"] },
				],
			})))
			.mount(&server)
			.await;

		let roots = client_for(&server).root_cert_bundle().await.unwrap();
		assert_eq!(roots, vec!["ROOT-1", "ROOT-2"]);
	}

	#[tokio::test]
	async fn error_status_is_surfaced() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.respond_with(|_: &Request| ResponseTemplate::new(403).set_body_string("denied"))
			.mount(&server)
			.await;

		let result = client_for(&server)
			.csr_sign("CSR", Duration::from_secs(60))
			.await;
		assert!(matches!(result, Err(CaError::Status { status: 403, .. })));
	}

	#[tokio::test]
	async fn closed_client_rejects_calls() {
		let server = MockServer::start().await;
		let client = client_for(&server);
		client.close().await;
		assert!(matches!(client.root_cert_bundle().await, Err(CaError::Closed)));
	}
}
