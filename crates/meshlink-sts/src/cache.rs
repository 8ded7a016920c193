// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::token::SecretToken;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Tokens are treated as expired this long before their real expiry.
pub const DEFAULT_SKEW: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CachedToken {
	token: SecretToken,
	expires_at: Instant,
}

/// Audience-keyed token cache.
///
/// Misses are fetched by the caller outside the lock, so concurrent misses
/// on one key may fetch twice; the later insert wins.
pub struct TokenCache {
	skew: Duration,
	entries: RwLock<HashMap<String, CachedToken>>,
}

impl Default for TokenCache {
	fn default() -> Self {
		Self::new()
	}
}

impl TokenCache {
	pub fn new() -> Self {
		Self::with_skew(DEFAULT_SKEW)
	}

	pub fn with_skew(skew: Duration) -> Self {
		Self {
			skew,
			entries: RwLock::new(HashMap::new()),
		}
	}

	/// Returns the cached token for `key` if it is still outside the skew
	/// window.
	pub async fn get(&self, key: &str) -> Option<SecretToken> {
		let entries = self.entries.read().await;
		let cached = entries.get(key)?;
		let usable_until = cached.expires_at.checked_sub(self.skew)?;
		(Instant::now() < usable_until).then(|| cached.token.clone())
	}

	pub async fn insert(&self, key: impl Into<String>, token: SecretToken, expires_at: Instant) {
		self.entries
			.write()
			.await
			.insert(key.into(), CachedToken { token, expires_at });
	}

	pub async fn invalidate(&self, key: &str) {
		self.entries.write().await.remove(key);
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}

	pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<SecretToken, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<(SecretToken, Instant), E>>,
	{
		if let Some(token) = self.get(key).await {
			return Ok(token);
		}

		debug!(key, "token cache miss");
		let (token, expires_at) = fetch().await?;
		self.insert(key, token.clone(), expires_at).await;
		Ok(token)
	}
}
