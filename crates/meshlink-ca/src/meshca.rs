// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::client::{CaClient, GrpcConnection};
use crate::error::Result;
use crate::proto::{MeshCertificateRequest, MeshCertificateResponse, MESHCA_CREATE_CERTIFICATE};
use async_trait::async_trait;
use meshlink_sts::TokenProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::transport::ClientTlsConfig;
use tracing::{info, instrument};

pub const MESHCA_ADDRESS: &str = "meshca.googleapis.com:443";

const REQUEST_PARAMS_METADATA: &str = "x-goog-request-params";

/// Managed mesh CA. Authorized only by the cloud access token.
pub struct MeshCaClient {
	conn: GrpcConnection,
	last_root: RwLock<Option<String>>,
}

impl MeshCaClient {
	pub fn new(
		address: &str,
		location: Option<&str>,
		credentials: Arc<dyn TokenProvider>,
	) -> Result<Self> {
		let tls = ClientTlsConfig::new().with_webpki_roots();
		// empty audience: plain cloud-platform access token
		let mut conn = GrpcConnection::new(address, tls, credentials, "")?;
		if let Some(location) = location {
			conn = conn.with_metadata(REQUEST_PARAMS_METADATA, format!("location=locations/{location}"));
		}
		Ok(Self {
			conn,
			last_root: RwLock::new(None),
		})
	}

	fn build_request(csr_pem: &str, ttl: Duration) -> MeshCertificateRequest {
		MeshCertificateRequest {
			request_id: uuid::Uuid::new_v4().to_string(),
			csr: csr_pem.to_string(),
			validity: Some(prost_types::Duration {
				seconds: ttl.as_secs() as i64,
				nanos: 0,
			}),
		}
	}
}

#[async_trait]
impl CaClient for MeshCaClient {
	fn name(&self) -> &'static str {
		"meshca"
	}

	#[instrument(skip(self, csr_pem), fields(ttl_secs = ttl.as_secs()))]
	async fn csr_sign(&self, csr_pem: &str, ttl: Duration) -> Result<Vec<String>> {
		let request = Self::build_request(csr_pem, ttl);
		let response: MeshCertificateResponse =
			self.conn.unary(MESHCA_CREATE_CERTIFICATE, request).await?;
		info!(chain_len = response.cert_chain.len(), "meshca signed certificate");

		if let Some(root) = response.cert_chain.last() {
			*self.last_root.write().await = Some(root.clone());
		}
		Ok(response.cert_chain)
	}

	/// The root of the most recently issued chain.
	async fn root_cert_bundle(&self) -> Result<Vec<String>> {
		Ok(self.last_root.read().await.iter().cloned().collect())
	}

	async fn close(&self) {
		self.conn.close().await;
	}
}
