// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_STS_ENDPOINT: &str = "https://sts.googleapis.com";
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iamcredentials.googleapis.com";
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/tokens/istio-token";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("missing required environment variable: {0}")]
	MissingEnvVar(String),

	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

#[derive(Debug, Clone)]
pub struct StsConfig {
	pub sts_endpoint: String,
	pub iam_endpoint: String,
	/// Workload identity pool, e.g. `my-project.svc.id.goog`. Also the
	/// audience requested for the platform token.
	pub workload_pool: String,
	/// Identity provider URL; when set the exchange audience becomes
	/// `identitynamespace:<pool>:<provider>`.
	pub identity_provider: Option<String>,
	pub google_service_account: Option<String>,
	pub token_path: PathBuf,
	pub scope: String,
}

impl StsConfig {
	pub fn new(workload_pool: impl Into<String>) -> Self {
		Self {
			sts_endpoint: DEFAULT_STS_ENDPOINT.to_string(),
			iam_endpoint: DEFAULT_IAM_ENDPOINT.to_string(),
			workload_pool: workload_pool.into(),
			identity_provider: None,
			google_service_account: None,
			token_path: PathBuf::from(DEFAULT_TOKEN_PATH),
			scope: CLOUD_PLATFORM_SCOPE.to_string(),
		}
	}

	pub fn from_env() -> Result<Self, ConfigError> {
		let workload_pool = match std::env::var("MESHLINK_WORKLOAD_POOL") {
			Ok(pool) => pool,
			Err(_) => {
				let project = require_env("MESHLINK_PROJECT_ID")?;
				format!("{project}.svc.id.goog")
			}
		};
		if workload_pool.is_empty() {
			return Err(ConfigError::InvalidValue {
				name: "MESHLINK_WORKLOAD_POOL".into(),
				message: "must not be empty".into(),
			});
		}

		let sts_endpoint = optional_env("MESHLINK_STS_ENDPOINT", DEFAULT_STS_ENDPOINT);
		validate_url("MESHLINK_STS_ENDPOINT", &sts_endpoint)?;
		let iam_endpoint = optional_env("MESHLINK_IAM_ENDPOINT", DEFAULT_IAM_ENDPOINT);
		validate_url("MESHLINK_IAM_ENDPOINT", &iam_endpoint)?;

		Ok(Self {
			sts_endpoint,
			iam_endpoint,
			workload_pool,
			identity_provider: non_empty_env("MESHLINK_IDENTITY_PROVIDER"),
			google_service_account: non_empty_env("MESHLINK_GSA"),
			token_path: PathBuf::from(optional_env("MESHLINK_TOKEN_PATH", DEFAULT_TOKEN_PATH)),
			scope: optional_env("MESHLINK_STS_SCOPE", CLOUD_PLATFORM_SCOPE),
		})
	}

	/// Audience sent in the STS exchange request.
	pub fn exchange_audience(&self) -> String {
		match &self.identity_provider {
			Some(provider) => format!("identitynamespace:{}:{}", self.workload_pool, provider),
			None => self.workload_pool.clone(),
		}
	}
}

fn require_env(name: &str) -> Result<String, ConfigError> {
	std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn optional_env(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn non_empty_env(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn validate_url(name: &str, value: &str) -> Result<(), ConfigError> {
	if value.starts_with("https://") || value.starts_with("http://") {
		Ok(())
	} else {
		Err(ConfigError::InvalidValue {
			name: name.to_string(),
			message: "must be an http(s) URL".into(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exchange_audience_includes_provider() {
		let mut config = StsConfig::new("proj.svc.id.goog");
		assert_eq!(config.exchange_audience(), "proj.svc.id.goog");

		config.identity_provider = Some("https://container.googleapis.com/v1/projects/p".into());
		assert_eq!(
			config.exchange_audience(),
			"identitynamespace:proj.svc.id.goog:https://container.googleapis.com/v1/projects/p"
		);
	}

	#[test]
	fn validate_url_rejects_bare_hosts() {
		assert!(validate_url("X", "sts.googleapis.com").is_err());
		assert!(validate_url("X", "http://127.0.0.1:8080").is_ok());
	}
}
