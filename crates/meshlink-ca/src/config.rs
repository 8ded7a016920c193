// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::meshca::MESHCA_ADDRESS;
use meshlink_identity::{SpiffeId, DEFAULT_CERT_DIR};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("missing required environment variable: {0}")]
	MissingEnvVar(String),

	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaBackend {
	Citadel,
	MeshCa,
	Cas,
}

impl FromStr for CaBackend {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"citadel" | "istiod" => Ok(Self::Citadel),
			"meshca" => Ok(Self::MeshCa),
			"cas" | "privateca" => Ok(Self::Cas),
			other => Err(format!("unknown CA backend {other:?}, expected citadel, meshca or cas")),
		}
	}
}

impl fmt::Display for CaBackend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Citadel => "citadel",
			Self::MeshCa => "meshca",
			Self::Cas => "cas",
		})
	}
}

#[derive(Debug, Clone)]
pub struct CaConfig {
	pub backend: CaBackend,
	/// Overrides mesh-env discovery for Citadel.
	pub ca_addr: Option<String>,
	pub ca_root_pem: Option<String>,
	pub trust_domain: String,
	pub namespace: String,
	pub service_account: String,
	pub cluster_id: String,
	pub cert_signer: Option<String>,
	/// `projects/<p>/locations/<l>/caPools/<pool>`
	pub cas_pool: Option<String>,
	pub meshca_addr: String,
	pub location: Option<String>,
	pub cert_ttl: Duration,
	pub cert_dir: PathBuf,
	pub config_dir: Option<PathBuf>,
	pub prov_cert_dir: Option<PathBuf>,
}

impl CaConfig {
	pub fn new(backend: CaBackend, trust_domain: impl Into<String>) -> Self {
		Self {
			backend,
			ca_addr: None,
			ca_root_pem: None,
			trust_domain: trust_domain.into(),
			namespace: "default".to_string(),
			service_account: "default".to_string(),
			cluster_id: "Kubernetes".to_string(),
			cert_signer: None,
			cas_pool: None,
			meshca_addr: MESHCA_ADDRESS.to_string(),
			location: None,
			cert_ttl: DEFAULT_CERT_TTL,
			cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
			config_dir: None,
			prov_cert_dir: None,
		}
	}

	pub fn from_env() -> Result<Self, ConfigError> {
		let backend = optional_env("MESHLINK_CA", "citadel")
			.parse()
			.map_err(|message| ConfigError::InvalidValue {
				name: "MESHLINK_CA".into(),
				message,
			})?;

		let mut config = Self::new(backend, optional_env("MESHLINK_TRUST_DOMAIN", "cluster.local"));
		config.ca_addr = non_empty_env("MESHLINK_CA_ADDR");
		config.namespace = optional_env("MESHLINK_NAMESPACE", "default");
		config.service_account = optional_env("MESHLINK_SERVICE_ACCOUNT", "default");
		config.cluster_id = optional_env("MESHLINK_CLUSTER_ID", "Kubernetes");
		config.cert_signer = non_empty_env("MESHLINK_CERT_SIGNER");
		config.cas_pool = non_empty_env("MESHLINK_CAS_POOL");
		config.meshca_addr = optional_env("MESHLINK_MESHCA_ADDR", MESHCA_ADDRESS);
		config.location = non_empty_env("MESHLINK_LOCATION");
		config.cert_ttl = Duration::from_secs(optional_env_parse(
			"MESHLINK_CERT_TTL_SECS",
			DEFAULT_CERT_TTL.as_secs(),
		)?);
		config.cert_dir = PathBuf::from(optional_env("MESHLINK_CERT_DIR", DEFAULT_CERT_DIR));
		config.config_dir = non_empty_env("MESHLINK_CONFIG_DIR").map(PathBuf::from);
		config.prov_cert_dir = non_empty_env("MESHLINK_PROV_CERT_DIR").map(PathBuf::from);

		if let Some(root_file) = non_empty_env("MESHLINK_CA_ROOT_FILE") {
			let pem = std::fs::read_to_string(&root_file).map_err(|e| ConfigError::InvalidValue {
				name: "MESHLINK_CA_ROOT_FILE".into(),
				message: format!("{root_file}: {e}"),
			})?;
			config.ca_root_pem = Some(pem);
		}

		if config.backend == CaBackend::Cas && config.cas_pool.is_none() {
			return Err(ConfigError::MissingEnvVar("MESHLINK_CAS_POOL".into()));
		}
		Ok(config)
	}

	pub fn spiffe_id(&self) -> SpiffeId {
		SpiffeId::new(&self.trust_domain, &self.namespace, &self.service_account)
	}
}

fn optional_env(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn non_empty_env(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn optional_env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
	T::Err: fmt::Display,
{
	match std::env::var(name) {
		Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
			name: name.to_string(),
			message: e.to_string(),
		}),
		Err(_) => Ok(default),
	}
}
