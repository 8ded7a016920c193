// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::resolver::DEFAULT_PLATFORM_DOMAIN;
use meshlink_identity::DEFAULT_CERT_DIR;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub const SNI_PORT: u16 = 15443;
pub const H2R_PORT: u16 = 15441;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

#[derive(Debug, Clone)]
pub struct GateConfig {
	pub sni_addr: SocketAddr,
	pub h2r_addr: SocketAddr,
	/// Directory holding the gateway's own mesh identity.
	pub cert_dir: PathBuf,
	pub platform_domain: String,
}

impl Default for GateConfig {
	fn default() -> Self {
		Self {
			sni_addr: SocketAddr::from(([0, 0, 0, 0], SNI_PORT)),
			h2r_addr: SocketAddr::from(([0, 0, 0, 0], H2R_PORT)),
			cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
			platform_domain: DEFAULT_PLATFORM_DOMAIN.to_string(),
		}
	}
}

impl GateConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		let defaults = Self::default();
		Ok(Self {
			sni_addr: optional_env_parse("MESHLINK_SNI_ADDR", defaults.sni_addr)?,
			h2r_addr: optional_env_parse("MESHLINK_H2R_ADDR", defaults.h2r_addr)?,
			cert_dir: std::env::var("MESHLINK_CERT_DIR")
				.map(PathBuf::from)
				.unwrap_or(defaults.cert_dir),
			platform_domain: std::env::var("MESHLINK_PLATFORM_DOMAIN")
				.ok()
				.filter(|d| !d.is_empty())
				.unwrap_or(defaults.platform_domain),
		})
	}
}

fn optional_env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match std::env::var(name) {
		Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
			name: name.to_string(),
			message: e.to_string(),
		}),
		Err(_) => Ok(default),
	}
}
