// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::io::{CopyConfig, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub const HBONE_PORT: u16 = 15009;
pub const DEFAULT_APP_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("invalid value for {name}: {message}")]
	InvalidValue { name: String, message: String },
}

#[derive(Debug, Clone)]
pub struct HboneConfig {
	pub listen_addr: SocketAddr,
	/// Local port `/_hbone/mtls` streams are relayed to.
	pub app_port: u16,
	pub idle_timeout: Duration,
	pub buffer_size: usize,
}

impl Default for HboneConfig {
	fn default() -> Self {
		Self {
			listen_addr: SocketAddr::from(([0, 0, 0, 0], HBONE_PORT)),
			app_port: DEFAULT_APP_PORT,
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
			buffer_size: DEFAULT_BUFFER_SIZE,
		}
	}
}

impl HboneConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		let defaults = Self::default();
		Ok(Self {
			listen_addr: optional_env_parse("MESHLINK_HBONE_ADDR", defaults.listen_addr)?,
			// PORT is what serverless platforms hand the application
			app_port: optional_env_parse("PORT", defaults.app_port)?,
			idle_timeout: Duration::from_secs(optional_env_parse(
				"MESHLINK_IDLE_TIMEOUT_SECS",
				defaults.idle_timeout.as_secs(),
			)?),
			buffer_size: optional_env_parse("MESHLINK_BUFFER_SIZE", defaults.buffer_size)?,
		})
	}

	pub fn copy_config(&self) -> CopyConfig {
		CopyConfig::new(self.buffer_size, self.idle_timeout)
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

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_well_known_ports() {
		let config = HboneConfig::default();
		assert_eq!(config.listen_addr.port(), 15009);
		assert_eq!(config.buffer_size, 32 * 1024);
		assert_eq!(config.idle_timeout, Duration::from_secs(900));
	}
}
