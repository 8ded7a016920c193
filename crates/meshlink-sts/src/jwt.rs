// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, TokenError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

/// The registered claims we look at. Signatures are not checked: tokens are
/// only inspected for routing and cache lifetimes, never trusted.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct JwtClaims {
	#[serde(default, deserialize_with = "one_or_many")]
	pub aud: Vec<String>,
	#[serde(default)]
	pub exp: Option<i64>,
	#[serde(default)]
	pub iat: Option<i64>,
	#[serde(default)]
	pub iss: Option<String>,
	#[serde(default)]
	pub sub: Option<String>,
}

pub fn decode_jwt_payload(token: &str) -> Result<JwtClaims> {
	let mut parts = token.split('.');
	let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
		(Some(_), Some(payload), Some(_), None) => payload,
		_ => return Err(TokenError::InvalidJwt("expected three segments".into())),
	};

	let raw = URL_SAFE_NO_PAD
		.decode(payload.trim_end_matches('='))
		.map_err(|e| TokenError::InvalidJwt(format!("payload is not base64url: {e}")))?;
	serde_json::from_slice(&raw)
		.map_err(|e| TokenError::InvalidJwt(format!("payload is not a claims object: {e}")))
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
	D: serde::Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Aud {
		One(String),
		Many(Vec<String>),
	}

	Ok(match Aud::deserialize(deserializer)? {
		Aud::One(aud) => vec![aud],
		Aud::Many(auds) => auds,
	})
}

#[cfg(test)]
pub(crate) fn encode_test_jwt(claims: &serde_json::Value) -> String {
	let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
	let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
	format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn decodes_string_audience() {
		let token = encode_test_jwt(&json!({
			"aud": "cluster.local",
			"exp": 1_700_000_000,
			"iss": "https://kubernetes.default.svc",
			"sub": "system:serviceaccount:fortio:default",
		}));

		let claims = decode_jwt_payload(&token).unwrap();
		assert_eq!(claims.aud, vec!["cluster.local"]);
		assert_eq!(claims.exp, Some(1_700_000_000));
		assert_eq!(claims.sub.as_deref(), Some("system:serviceaccount:fortio:default"));
	}

	#[test]
	fn decodes_audience_list() {
		let token = encode_test_jwt(&json!({"aud": ["a", "b"]}));
		let claims = decode_jwt_payload(&token).unwrap();
		assert_eq!(claims.aud, vec!["a", "b"]);
		assert_eq!(claims.exp, None);
	}

	#[test]
	fn rejects_malformed_tokens() {
		for token in ["", "abc", "a.b", "a.b.c.d", "a.!!!.c", "a.e30x.c"] {
			assert!(
				matches!(decode_jwt_payload(token), Err(TokenError::InvalidJwt(_))),
				"{token} should be rejected"
			);
		}
	}
}
