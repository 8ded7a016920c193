// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::cache::TokenCache;
use crate::config::StsConfig;
use crate::error::{Result, TokenError};
use crate::jwt::decode_jwt_payload;
use crate::source::PlatformTokenSource;
use crate::token::SecretToken;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

const FEDERATED_KEY: &str = "federated";
const ACCESS_KEY: &str = "";
const DEFAULT_ID_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StsRequest<'a> {
	grant_type: &'a str,
	audience: &'a str,
	scope: &'a str,
	requested_token_type: &'a str,
	subject_token: &'a str,
	subject_token_type: &'a str,
}

#[derive(Deserialize)]
struct StsResponse {
	access_token: String,
	#[serde(default)]
	expires_in: u64,
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
	scope: [&'a str; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
	access_token: String,
	expire_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdTokenRequest<'a> {
	audience: &'a str,
	include_email: bool,
}

#[derive(Deserialize)]
struct IdTokenResponse {
	token: String,
}

/// Two-hop token exchange with a session-wide federated token and a
/// per-audience cache of what it is traded for.
pub struct TokenExchange {
	http: Client,
	config: StsConfig,
	source: Arc<dyn PlatformTokenSource>,
	federated: TokenCache,
	tokens: TokenCache,
}

impl TokenExchange {
	pub fn new(config: StsConfig, source: Arc<dyn PlatformTokenSource>) -> Result<Self> {
		let http = meshlink_common_http::new_client()?;
		Ok(Self::with_client(config, source, http))
	}

	pub fn with_client(config: StsConfig, source: Arc<dyn PlatformTokenSource>, http: Client) -> Self {
		Self {
			http,
			config,
			source,
			federated: TokenCache::new(),
			tokens: TokenCache::new(),
		}
	}

	pub fn config(&self) -> &StsConfig {
		&self.config
	}

	/// Token for `audience`. An empty audience asks for a cloud access
	/// token; anything else asks for an ID token minted for that audience
	/// when a service account is configured, and falls back to the access
	/// token otherwise.
	pub async fn token(&self, audience: &str) -> Result<SecretToken> {
		if audience.is_empty() || self.config.google_service_account.is_none() {
			return self.access_token().await;
		}
		self.id_token(audience).await
	}

	/// The federated token, exchanged once and reused until it expires.
	pub async fn federated_token(&self) -> Result<SecretToken> {
		self.federated
			.get_or_fetch(FEDERATED_KEY, || self.exchange_platform_token())
			.await
	}

	/// A cloud-platform access token: the service account's when one is
	/// configured, the federated token itself otherwise.
	pub async fn access_token(&self) -> Result<SecretToken> {
		let Some(gsa) = self.config.google_service_account.as_deref() else {
			return self.federated_token().await;
		};
		self.tokens
			.get_or_fetch(ACCESS_KEY, || self.generate_access_token(gsa))
			.await
	}

	pub async fn id_token(&self, audience: &str) -> Result<SecretToken> {
		let gsa = self
			.config
			.google_service_account
			.as_deref()
			.ok_or(TokenError::ServiceAccountRequired)?;
		self.tokens
			.get_or_fetch(audience, || self.generate_id_token(gsa, audience))
			.await
	}

	#[instrument(skip(self), fields(endpoint = %self.config.sts_endpoint))]
	async fn exchange_platform_token(&self) -> Result<(SecretToken, Instant)> {
		let subject = self
			.source
			.platform_token(&self.config.workload_pool)
			.await?;
		let audience = self.config.exchange_audience();
		let url = format!("{}/v1/token", self.config.sts_endpoint.trim_end_matches('/'));

		let body = StsRequest {
			grant_type: TOKEN_EXCHANGE_GRANT,
			audience: &audience,
			scope: &self.config.scope,
			requested_token_type: ACCESS_TOKEN_TYPE,
			subject_token: subject.expose(),
			subject_token_type: JWT_TOKEN_TYPE,
		};
		let response = self.http.post(&url).json(&body).send().await?;
		let response: StsResponse = check_status(response, &url).await?.json().await?;

		if response.access_token.is_empty() {
			return Err(TokenError::InvalidResponse("STS returned an empty token".into()));
		}
		debug!(expires_in = response.expires_in, "exchanged platform token");
		Ok((
			SecretToken::new(response.access_token),
			Instant::now() + Duration::from_secs(response.expires_in),
		))
	}

	#[instrument(skip(self))]
	async fn generate_access_token(&self, gsa: &str) -> Result<(SecretToken, Instant)> {
		let federated = self.federated_token().await?;
		let url = self.iam_url(gsa, "generateAccessToken");

		let response = self
			.http
			.post(&url)
			.bearer_auth(federated.expose())
			.json(&AccessTokenRequest {
				scope: [self.config.scope.as_str()],
			})
			.send()
			.await?;
		let response: AccessTokenResponse = check_status(response, &url).await?.json().await?;

		let expire_time = DateTime::parse_from_rfc3339(&response.expire_time)
			.map_err(|e| TokenError::InvalidResponse(format!("expireTime: {e}")))?;
		debug!(%expire_time, "generated service account access token");
		Ok((
			SecretToken::new(response.access_token),
			instant_at(expire_time.timestamp()),
		))
	}

	#[instrument(skip(self))]
	async fn generate_id_token(&self, gsa: &str, audience: &str) -> Result<(SecretToken, Instant)> {
		let federated = self.federated_token().await?;
		let url = self.iam_url(gsa, "generateIdToken");

		let response = self
			.http
			.post(&url)
			.bearer_auth(federated.expose())
			.json(&IdTokenRequest {
				audience,
				include_email: true,
			})
			.send()
			.await?;
		let response: IdTokenResponse = check_status(response, &url).await?.json().await?;

		let expires_at = match decode_jwt_payload(&response.token)?.exp {
			Some(exp) => instant_at(exp),
			None => Instant::now() + DEFAULT_ID_TOKEN_LIFETIME,
		};
		Ok((SecretToken::new(response.token), expires_at))
	}

	fn iam_url(&self, gsa: &str, method: &str) -> String {
		format!(
			"{}/v1/projects/-/serviceAccounts/{}:{}",
			self.config.iam_endpoint.trim_end_matches('/'),
			gsa,
			method
		)
	}
}

async fn check_status(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
	let status = response.status();
	if status.is_success() {
		return Ok(response);
	}
	let body = response.text().await.unwrap_or_default();
	Err(TokenError::Status {
		endpoint: endpoint.to_string(),
		status: status.as_u16(),
		body,
	})
}

/// Converts a unix timestamp into a monotonic deadline.
fn instant_at(unix_secs: i64) -> Instant {
	let remaining = unix_secs.saturating_sub(Utc::now().timestamp()).max(0);
	Instant::now() + Duration::from_secs(remaining as u64)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::jwt::encode_test_jwt;
	use crate::source::StaticTokenSource;
	use serde_json::json;
	use wiremock::matchers::{body_partial_json, header, method, path, path_regex};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	const GSA: &str = "mesh@proj.iam.gserviceaccount.com";

	fn exchange_for(server: &MockServer, gsa: Option<&str>) -> TokenExchange {
		let mut config = StsConfig::new("proj.svc.id.goog");
		config.sts_endpoint = server.uri();
		config.iam_endpoint = server.uri();
		config.google_service_account = gsa.map(str::to_string);
		TokenExchange::with_client(
			config,
			Arc::new(StaticTokenSource::new("k8s-jwt")),
			Client::new(),
		)
	}

	async fn mount_sts(server: &MockServer, expected_calls: u64) {
		Mock::given(method("POST"))
			.and(path("/v1/token"))
			.and(body_partial_json(json!({
				"grantType": TOKEN_EXCHANGE_GRANT,
				"audience": "proj.svc.id.goog",
				"subjectToken": "k8s-jwt",
				"subjectTokenType": JWT_TOKEN_TYPE,
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": "federated-token",
				"issued_token_type": ACCESS_TOKEN_TYPE,
				"token_type": "Bearer",
				"expires_in": 3600,
			})))
			.expect(expected_calls)
			.mount(server)
			.await;
	}

	/// Purpose: Without a service account the federated token is the access
	/// token, and it is exchanged once per session.
	#[tokio::test]
	async fn test_federated_token_used_without_service_account() {
		let server = MockServer::start().await;
		mount_sts(&server, 1).await;
		let exchange = exchange_for(&server, None);

		assert_eq!(exchange.token("").await.unwrap().expose(), "federated-token");
		assert_eq!(
			exchange.token("https://svc.a.run.app").await.unwrap().expose(),
			"federated-token"
		);
	}

	#[tokio::test]
	async fn test_access_token_via_service_account() {
		let server = MockServer::start().await;
		mount_sts(&server, 1).await;
		let expire_time = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
		Mock::given(method("POST"))
			.and(path_regex(r".*/serviceAccounts/.*:generateAccessToken$"))
			.and(header("authorization", "Bearer federated-token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"accessToken": "gsa-access-token",
				"expireTime": expire_time,
			})))
			.expect(1)
			.mount(&server)
			.await;
		let exchange = exchange_for(&server, Some(GSA));

		assert_eq!(exchange.access_token().await.unwrap().expose(), "gsa-access-token");
		assert_eq!(exchange.access_token().await.unwrap().expose(), "gsa-access-token");
	}

	/// Purpose: ID tokens are cached per audience until their `exp`.
	#[tokio::test]
	async fn test_id_token_cached_per_audience() {
		let server = MockServer::start().await;
		mount_sts(&server, 1).await;
		let exp = Utc::now().timestamp() + 3600;
		let id_token = encode_test_jwt(&json!({"aud": "https://svc.a.run.app", "exp": exp}));
		Mock::given(method("POST"))
			.and(path_regex(r".*:generateIdToken$"))
			.and(body_partial_json(json!({
				"audience": "https://svc.a.run.app",
				"includeEmail": true,
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": id_token })))
			.expect(1)
			.mount(&server)
			.await;
		let exchange = exchange_for(&server, Some(GSA));

		let first = exchange.token("https://svc.a.run.app").await.unwrap();
		let second = exchange.token("https://svc.a.run.app").await.unwrap();
		assert_eq!(first, second);
		assert_eq!(first.expose(), id_token);
	}

	#[tokio::test]
	async fn test_id_token_requires_service_account() {
		let server = MockServer::start().await;
		let exchange = exchange_for(&server, None);
		assert!(matches!(
			exchange.id_token("https://svc.a.run.app").await,
			Err(TokenError::ServiceAccountRequired)
		));
	}

	#[tokio::test]
	async fn test_sts_error_status_is_surfaced() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/token"))
			.respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
			.mount(&server)
			.await;
		let exchange = exchange_for(&server, None);

		match exchange.token("").await {
			Err(TokenError::Status { status, body, .. }) => {
				assert_eq!(status, 400);
				assert_eq!(body, "invalid_grant");
			}
			other => panic!("expected status error, got {other:?}"),
		}
	}
}
