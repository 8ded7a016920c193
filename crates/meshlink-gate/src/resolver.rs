// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{GateError, Result};
use crate::route::SniTarget;
use async_trait::async_trait;
use meshlink_hbone::{Endpoint, TokenCallback};
use meshlink_sts::{SecretToken, TokenCache, TokenError, TokenProvider, AUTHORIZATION};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

pub const DEFAULT_PLATFORM_DOMAIN: &str = "a.run.app";
/// Lifetime assumed for gateway tokens.
pub const HOST_TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Maps an inbound SNI to the HBONE endpoint serving it.
pub trait EndpointResolver: Send + Sync {
	fn resolve(&self, target: &SniTarget) -> Result<Endpoint>;
}

/// Sends `<service>` to `https://<service>.<domain>/_hbone/mtls`, where the
/// workload terminates the client's original TLS session.
pub struct PlatformResolver {
	domain: String,
	token: Option<Arc<dyn TokenCallback>>,
	tls: Option<Arc<ClientConfig>>,
}

impl PlatformResolver {
	pub fn new(domain: impl Into<String>) -> Self {
		Self {
			domain: domain.into(),
			token: None,
			tls: None,
		}
	}

	pub fn with_token_callback(mut self, token: Arc<dyn TokenCallback>) -> Self {
		self.token = Some(token);
		self
	}

	pub fn with_tls_config(mut self, tls: Arc<ClientConfig>) -> Self {
		self.tls = Some(tls);
		self
	}

	pub fn host(&self, target: &SniTarget) -> String {
		format!("{}.{}", target.service, self.domain)
	}
}

impl EndpointResolver for PlatformResolver {
	fn resolve(&self, target: &SniTarget) -> Result<Endpoint> {
		let host = self.host(target);
		let mut endpoint = Endpoint::new(&format!("https://{host}/_hbone/mtls"))?.with_sni(host);
		if let Some(token) = &self.token {
			endpoint = endpoint.with_token_callback(Arc::clone(token));
		}
		if let Some(tls) = &self.tls {
			endpoint = endpoint.with_tls_config(Arc::clone(tls));
		}
		Ok(endpoint)
	}
}

/// Refuses every direct route, leaving only registered reverse tunnels
/// reachable.
pub struct ReverseOnly;

impl EndpointResolver for ReverseOnly {
	fn resolve(&self, target: &SniTarget) -> Result<Endpoint> {
		Err(GateError::NoRoute(target.service.clone()))
	}
}

/// Bearer tokens per destination host, fetched through a per-RPC token
/// provider and reused for [`HOST_TOKEN_TTL`].
pub struct HostTokenCache {
	provider: Arc<dyn TokenProvider>,
	cache: TokenCache,
	ttl: Duration,
}

impl HostTokenCache {
	pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
		Self {
			provider,
			cache: TokenCache::new(),
			ttl: HOST_TOKEN_TTL,
		}
	}

	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = ttl;
		self
	}

	async fn fetch(&self, host: &str) -> meshlink_sts::Result<(SecretToken, Instant)> {
		let metadata = self.provider.request_metadata(&[host]).await?;
		let token = metadata
			.get(AUTHORIZATION)
			.and_then(|value| value.strip_prefix("Bearer "))
			.ok_or_else(|| TokenError::InvalidResponse("authorization metadata is not a bearer token".into()))?;
		Ok((SecretToken::new(token), Instant::now() + self.ttl))
	}
}

#[async_trait]
impl TokenCallback for HostTokenCache {
	#[instrument(skip(self))]
	async fn token(&self, host: &str) -> meshlink_sts::Result<SecretToken> {
		self.cache.get_or_fetch(host, || self.fetch(host)).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::route::parse_sni;
	use std::collections::HashMap;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[derive(Default)]
	struct CountingProvider {
		calls: AtomicUsize,
	}

	#[async_trait]
	impl TokenProvider for CountingProvider {
		async fn request_metadata(
			&self,
			audiences: &[&str],
		) -> meshlink_sts::Result<HashMap<String, String>> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			Ok(HashMap::from([(
				AUTHORIZATION.to_string(),
				format!("Bearer token-{}-{n}", audiences[0]),
			)]))
		}
	}

	struct RawProvider;

	#[async_trait]
	impl TokenProvider for RawProvider {
		async fn request_metadata(&self, _: &[&str]) -> meshlink_sts::Result<HashMap<String, String>> {
			Ok(HashMap::from([(AUTHORIZATION.to_string(), "Basic abc".to_string())]))
		}
	}

	/// Purpose: A token cached at T for 45 minutes is reused at T+44m and
	/// refetched at T+46m.
	#[tokio::test(start_paused = true)]
	async fn host_tokens_live_for_45_minutes() {
		let provider = Arc::new(CountingProvider::default());
		let cache = HostTokenCache::new(provider.clone());
		let host = "https://svc.a.run.app";

		let first = cache.token(host).await.unwrap();
		assert_eq!(first.expose(), "token-https://svc.a.run.app-0");

		tokio::time::advance(Duration::from_secs(44 * 60)).await;
		assert_eq!(cache.token(host).await.unwrap(), first);
		assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

		tokio::time::advance(Duration::from_secs(2 * 60)).await;
		let second = cache.token(host).await.unwrap();
		assert_ne!(second, first);
		assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn hosts_are_cached_independently() {
		let provider = Arc::new(CountingProvider::default());
		let cache = HostTokenCache::new(provider.clone());
		cache.token("https://a.a.run.app").await.unwrap();
		cache.token("https://b.a.run.app").await.unwrap();
		cache.token("https://a.a.run.app").await.unwrap();
		assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn non_bearer_metadata_is_rejected() {
		let cache = HostTokenCache::new(Arc::new(RawProvider));
		assert!(matches!(
			cache.token("https://a.a.run.app").await,
			Err(TokenError::InvalidResponse(_))
		));
	}

	#[test]
	fn resolves_service_to_platform_host() {
		let resolver = PlatformResolver::new(DEFAULT_PLATFORM_DOMAIN);
		let target = parse_sni("outbound_.9090_._.fortio.test.svc.cluster.local").unwrap();
		let endpoint = resolver.resolve(&target).unwrap();
		assert_eq!(endpoint.url(), "https://fortio.a.run.app/_hbone/mtls");
		assert_eq!(endpoint.host(), "fortio.a.run.app");
	}
}
