// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use anyhow::{anyhow, Context, Result};
use meshlink_hbone::{expand_url, MTLS_PATH};
use std::net::SocketAddr;

/// A local listener whose connections are tunneled to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
	pub listen: SocketAddr,
	/// Full HBONE URL.
	pub target: String,
}

impl ForwardSpec {
	/// Parses `LISTEN=TARGET`, where `TARGET` is a URL or `host:port`.
	pub fn parse(spec: &str) -> Result<Self> {
		let (listen, target) = spec
			.split_once('=')
			.ok_or_else(|| anyhow!("forward {spec:?} is not LISTEN=TARGET"))?;
		let listen = listen
			.parse()
			.with_context(|| format!("forward listen address {listen:?}"))?;
		if target.is_empty() {
			return Err(anyhow!("forward {spec:?} has an empty target"));
		}
		Ok(Self {
			listen,
			target: expand_url(target),
		})
	}

	pub fn is_mtls(&self) -> bool {
		self.target.ends_with(MTLS_PATH)
	}
}

/// Whether `MESHLINK_LOG_JSON` style flags are on.
pub fn is_truthy(value: &str) -> bool {
	matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
