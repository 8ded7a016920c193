// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, TokenError};
use crate::exchange::TokenExchange;
use crate::source::PlatformTokenSource;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub const AUTHORIZATION: &str = "authorization";

/// Per-RPC credentials: request metadata for exactly one audience.
#[async_trait]
pub trait TokenProvider: Send + Sync {
	async fn request_metadata(&self, audiences: &[&str]) -> Result<HashMap<String, String>>;

	fn require_transport_security(&self) -> bool {
		true
	}
}

fn single_audience<'a>(audiences: &[&'a str]) -> Result<&'a str> {
	match audiences {
		[audience] => Ok(*audience),
		other => Err(TokenError::MultipleAudiencesUnsupported(other.len())),
	}
}

fn bearer_metadata(bearer: String) -> HashMap<String, String> {
	HashMap::from([(AUTHORIZATION.to_string(), bearer)])
}

#[async_trait]
impl TokenProvider for TokenExchange {
	async fn request_metadata(&self, audiences: &[&str]) -> Result<HashMap<String, String>> {
		let audience = single_audience(audiences)?;
		let token = self.token(audience).await?;
		Ok(bearer_metadata(token.bearer()))
	}
}

/// Presents the platform token directly, optionally for a fixed audience
/// regardless of what the caller asks for.
pub struct PlatformCredentials {
	source: Arc<dyn PlatformTokenSource>,
	audience_override: Option<String>,
}

impl PlatformCredentials {
	pub fn new(source: Arc<dyn PlatformTokenSource>) -> Self {
		Self {
			source,
			audience_override: None,
		}
	}

	pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
		self.audience_override = Some(audience.into());
		self
	}
}

#[async_trait]
impl TokenProvider for PlatformCredentials {
	async fn request_metadata(&self, audiences: &[&str]) -> Result<HashMap<String, String>> {
		let requested = single_audience(audiences)?;
		let audience = self.audience_override.as_deref().unwrap_or(requested);
		let token = self.source.platform_token(audience).await?;
		Ok(bearer_metadata(token.bearer()))
	}
}
