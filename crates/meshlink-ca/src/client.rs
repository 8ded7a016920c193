// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{CaError, Result};
use async_trait::async_trait;
use meshlink_sts::TokenProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A certificate authority that signs workload CSRs.
#[async_trait]
pub trait CaClient: Send + Sync {
	fn name(&self) -> &'static str;

	/// Signs `csr_pem` and returns the PEM chain, leaf first.
	async fn csr_sign(&self, csr_pem: &str, ttl: Duration) -> Result<Vec<String>>;

	/// Roots peers should trust for certificates from this CA. May be empty
	/// when the CA cannot tell.
	async fn root_cert_bundle(&self) -> Result<Vec<String>>;

	/// Releases the connection; later calls fail with [`CaError::Closed`].
	async fn close(&self);
}

/// A lazily connected gRPC channel plus the per-RPC metadata every call
/// carries.
pub(crate) struct GrpcConnection {
	channel: RwLock<Option<Channel>>,
	credentials: Arc<dyn TokenProvider>,
	audience: String,
	extra_metadata: Vec<(&'static str, String)>,
}

impl GrpcConnection {
	pub(crate) fn new(
		address: &str,
		tls: ClientTlsConfig,
		credentials: Arc<dyn TokenProvider>,
		audience: impl Into<String>,
	) -> Result<Self> {
		let url = if address.starts_with("https://") {
			address.to_string()
		} else {
			format!("https://{address}")
		};
		let channel = Endpoint::from_shared(url)
			.map_err(|e| CaError::Config(format!("invalid CA address {address}: {e}")))?
			.tls_config(tls)
			.map_err(|e| CaError::Transport(e.to_string()))?
			.connect_timeout(CONNECT_TIMEOUT)
			.connect_lazy();

		Ok(Self {
			channel: RwLock::new(Some(channel)),
			credentials,
			audience: audience.into(),
			extra_metadata: Vec::new(),
		})
	}

	pub(crate) fn with_metadata(mut self, key: &'static str, value: impl Into<String>) -> Self {
		self.extra_metadata.push((key, value.into()));
		self
	}

	pub(crate) async fn authorize<T>(&self, request: &mut tonic::Request<T>) -> Result<()> {
		let metadata = self
			.credentials
			.request_metadata(&[self.audience.as_str()])
			.await?;

		let pairs = metadata
			.iter()
			.map(|(k, v)| (k.as_str(), v.as_str()))
			.chain(self.extra_metadata.iter().map(|(k, v)| (*k, v.as_str())));
		for (key, value) in pairs {
			let key = AsciiMetadataKey::from_bytes(key.as_bytes())
				.map_err(|e| CaError::Config(format!("metadata key {key}: {e}")))?;
			let value = AsciiMetadataValue::try_from(value)
				.map_err(|e| CaError::Config(format!("metadata value for {key:?}: {e}")))?;
			request.metadata_mut().insert(key, value);
		}
		Ok(())
	}

	pub(crate) async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp>
	where
		Req: prost::Message + Send + Sync + 'static,
		Resp: prost::Message + Default + Send + Sync + 'static,
	{
		let channel = self.channel.read().await.clone().ok_or(CaError::Closed)?;

		let mut request = tonic::Request::new(message);
		self.authorize(&mut request).await?;

		let mut grpc = tonic::client::Grpc::new(channel);
		grpc.ready()
			.await
			.map_err(|e| CaError::Transport(e.to_string()))?;
		debug!(path, "sending CA request");
		let response = grpc
			.unary(request, PathAndQuery::from_static(path), ProstCodec::default())
			.await?;
		Ok(response.into_inner())
	}

	pub(crate) async fn close(&self) {
		self.channel.write().await.take();
	}
}
