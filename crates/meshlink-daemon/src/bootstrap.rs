// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::{Context, Result};
use meshlink_ca::{
	discovery_retry, CaConfig, CertificateIssuer, ConfigSource, DirConfigSource, IssuerCredentials,
	StaticConfigSource,
};
use meshlink_identity::{Identity, KEY_FILE};
use meshlink_sts::config::DEFAULT_TOKEN_PATH;
use meshlink_sts::{FileTokenSource, PlatformTokenSource, StsConfig, TokenExchange};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Platform token source plus, when a workload pool is configured, the STS
/// exchange built on it.
pub struct Credentials {
	pub platform: Arc<dyn PlatformTokenSource>,
	pub exchange: Option<Arc<TokenExchange>>,
}

impl Credentials {
	pub fn from_env() -> Result<Self> {
		match StsConfig::from_env() {
			Ok(sts) => {
				let platform: Arc<dyn PlatformTokenSource> =
					Arc::new(FileTokenSource::new(sts.token_path.clone()));
				let exchange = TokenExchange::new(sts, Arc::clone(&platform))
					.context("building STS token exchange")?;
				Ok(Self {
					platform,
					exchange: Some(Arc::new(exchange)),
				})
			}
			Err(e) => {
				info!(reason = %e, "STS token exchange not configured");
				let path = std::env::var("MESHLINK_TOKEN_PATH")
					.unwrap_or_else(|_| DEFAULT_TOKEN_PATH.to_string());
				Ok(Self {
					platform: Arc::new(FileTokenSource::new(path)),
					exchange: None,
				})
			}
		}
	}
}

/// Loads the identity in `cert_dir` when one has been written there,
/// otherwise has the configured CA issue one and saves it.
pub async fn acquire_identity(cert_dir: &Path, credentials: &Credentials) -> Result<Identity> {
	if cert_dir.join(KEY_FILE).exists() {
		let identity = Identity::load(cert_dir)
			.await
			.with_context(|| format!("loading identity from {}", cert_dir.display()))?;
		info!(dir = %cert_dir.display(), subject = identity.subject(), "loaded existing identity");
		return Ok(identity);
	}
	issue_identity(cert_dir, credentials).await
}

pub async fn issue_identity(cert_dir: &Path, credentials: &Credentials) -> Result<Identity> {
	let config = CaConfig::from_env().context("CA configuration")?;
	let source: Box<dyn ConfigSource> = match &config.config_dir {
		Some(dir) => Box::new(DirConfigSource::new(dir)),
		None => Box::new(StaticConfigSource::new()),
	};

	let issuer = CertificateIssuer::connect(
		&config,
		source.as_ref(),
		IssuerCredentials {
			platform: Arc::clone(&credentials.platform),
			exchange: credentials.exchange.clone(),
		},
		&discovery_retry(),
	)
	.await
	.context("connecting to CA")?;

	let issued = issuer.bootstrap(&config.spiffe_id(), config.cert_ttl).await;
	issuer.close().await;
	let identity = issued.context("certificate issuance failed")?;

	persist_identity(&identity, cert_dir).await?;
	Ok(identity)
}

/// Writes an issued identity for co-located consumers.
pub async fn persist_identity(identity: &Identity, cert_dir: &Path) -> Result<()> {
	identity
		.save(cert_dir)
		.await
		.with_context(|| format!("writing identity to {}", cert_dir.display()))?;
	info!(dir = %cert_dir.display(), "persisted issued identity");
	Ok(())
}
