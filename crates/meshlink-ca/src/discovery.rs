// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Locating the mesh CA from cluster-published configuration.

use crate::error::{CaError, Result};
use async_trait::async_trait;
use meshlink_common_http::{retry, RetryConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, instrument};

pub const MESH_NAMESPACE: &str = "istio-system";
pub const MESH_ENV_CONFIGMAP: &str = "mesh-env";
pub const CA_ROOT_CONFIGMAP: &str = "istio-ca-root-cert";
pub const CA_ROOT_KEY: &str = "root-cert.pem";

pub const DISCOVERY_ATTEMPTS: u32 = 5;
pub const DISCOVERY_BACKOFF: Duration = Duration::from_secs(1);

/// Read access to cluster config maps and secrets.
#[async_trait]
pub trait ConfigSource: Send + Sync {
	async fn get_cm(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>>;

	async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>>;
}

/// In-memory config maps, for tests and pre-fetched configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticConfigSource {
	config_maps: HashMap<(String, String), HashMap<String, String>>,
	secrets: HashMap<(String, String), HashMap<String, Vec<u8>>>,
}

impl StaticConfigSource {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_config_map(
		mut self,
		namespace: &str,
		name: &str,
		data: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
	) -> Self {
		self.config_maps.insert(
			(namespace.to_string(), name.to_string()),
			data.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
		);
		self
	}

	pub fn with_secret(
		mut self,
		namespace: &str,
		name: &str,
		data: impl IntoIterator<Item = (impl Into<String>, Vec<u8>)>,
	) -> Self {
		self.secrets.insert(
			(namespace.to_string(), name.to_string()),
			data.into_iter().map(|(k, v)| (k.into(), v)).collect(),
		);
		self
	}
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
	async fn get_cm(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>> {
		self.config_maps
			.get(&(namespace.to_string(), name.to_string()))
			.cloned()
			.ok_or_else(|| CaError::Discovery(format!("config map {namespace}/{name} not found")))
	}

	async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>> {
		self.secrets
			.get(&(namespace.to_string(), name.to_string()))
			.cloned()
			.ok_or_else(|| CaError::Discovery(format!("secret {namespace}/{name} not found")))
	}
}

/// Reads `<root>/<namespace>/<name>/<key>` files, the layout of mounted
/// config maps.
#[derive(Debug, Clone)]
pub struct DirConfigSource {
	root: PathBuf,
}

impl DirConfigSource {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	async fn read_dir(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>> {
		let dir = self.root.join(namespace).join(name);
		let mut entries = match tokio::fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(CaError::Discovery(format!("{} not found", dir.display())));
			}
			Err(e) => return Err(e.into()),
		};

		let mut data = HashMap::new();
		while let Some(entry) = entries.next_entry().await? {
			let Ok(key) = entry.file_name().into_string() else {
				continue;
			};
			// mounted volumes carry ..data symlinks and friends
			if key.starts_with('.') || !entry.file_type().await?.is_file() {
				continue;
			}
			data.insert(key, tokio::fs::read(entry.path()).await?);
		}
		Ok(data)
	}
}

#[async_trait]
impl ConfigSource for DirConfigSource {
	async fn get_cm(&self, namespace: &str, name: &str) -> Result<HashMap<String, String>> {
		Ok(self
			.read_dir(namespace, name)
			.await?
			.into_iter()
			.map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
			.collect())
	}

	async fn get_secret(&self, namespace: &str, name: &str) -> Result<HashMap<String, Vec<u8>>> {
		self.read_dir(namespace, name).await
	}
}

/// Cluster-published mesh settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshEnv {
	pub mcon_addr: Option<String>,
	pub ca_root: Option<String>,
	pub project_number: Option<String>,
	pub project_id: Option<String>,
	pub cluster_name: Option<String>,
	pub cluster_location: Option<String>,
	pub xds_addr: Option<String>,
}

impl MeshEnv {
	fn from_config_map(mut data: HashMap<String, String>) -> Self {
		let mut take = |key: &str| data.remove(key).filter(|v| !v.is_empty());
		Self {
			mcon_addr: take("MCON_ADDR"),
			ca_root: take("CAROOT_ISTIOD"),
			project_number: take("PROJECT_NUMBER"),
			project_id: take("PROJECT_ID"),
			cluster_name: take("CLUSTER_NAME"),
			cluster_location: take("CLUSTER_LOCATION"),
			xds_addr: take("XDS_ADDR"),
		}
	}
}

async fn read_mesh_env(source: &dyn ConfigSource) -> Result<MeshEnv> {
	let data = source.get_cm(MESH_NAMESPACE, MESH_ENV_CONFIGMAP).await?;
	let mut env = MeshEnv::from_config_map(data);

	if env.ca_root.is_none() {
		if let Ok(mut roots) = source.get_cm(MESH_NAMESPACE, CA_ROOT_CONFIGMAP).await {
			env.ca_root = roots.remove(CA_ROOT_KEY).filter(|v| !v.is_empty());
		}
	}
	if env.mcon_addr.is_none() {
		return Err(CaError::Discovery(format!(
			"{MESH_NAMESPACE}/{MESH_ENV_CONFIGMAP} has no MCON_ADDR"
		)));
	}
	Ok(env)
}

pub fn discovery_retry() -> RetryConfig {
	RetryConfig::fixed(DISCOVERY_ATTEMPTS, DISCOVERY_BACKOFF)
}

/// Reads the mesh environment, retrying transient failures with `retry_cfg`.
/// Exhaustion is reported as [`CaError::IssuanceFailed`]: without a CA
/// address there is no way to obtain an identity.
#[instrument(skip_all)]
pub async fn discover_mesh_env(source: &dyn ConfigSource, retry_cfg: &RetryConfig) -> Result<MeshEnv> {
	let env = retry(retry_cfg, || read_mesh_env(source))
		.await
		.map_err(|e| CaError::IssuanceFailed(format!("mesh environment unavailable: {e}")))?;
	info!(
		mcon_addr = env.mcon_addr.as_deref().unwrap_or_default(),
		project_id = env.project_id.as_deref().unwrap_or_default(),
		cluster = env.cluster_name.as_deref().unwrap_or_default(),
		has_root = env.ca_root.is_some(),
		"discovered mesh environment"
	);
	Ok(env)
}
