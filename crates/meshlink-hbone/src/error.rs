// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HboneError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("HTTP/2 error: {0}")]
	H2(#[from] h2::Error),

	#[error("HTTP error: {0}")]
	Http(#[from] http::Error),

	#[error("tunnel request rejected with status {0}")]
	Status(http::StatusCode),

	#[error("TLS error: {0}")]
	Tls(#[from] rustls::Error),

	#[error("identity error: {0}")]
	Identity(#[from] meshlink_identity::IdentityError),

	#[error("invalid endpoint URL: {0}")]
	InvalidUrl(String),

	#[error("token error: {0}")]
	Token(#[from] meshlink_sts::TokenError),

	#[error("inner mTLS is not configured")]
	MtlsUnavailable,
}

pub type Result<T> = std::result::Result<T, HboneError>;
