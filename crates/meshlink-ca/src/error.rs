// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use meshlink_common_http::RetryableError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
	/// Terminal: the workload cannot obtain a certificate.
	#[error("CA issuance failed: {0}")]
	IssuanceFailed(String),

	#[error("CA discovery failed: {0}")]
	Discovery(String),

	#[error("invalid certificate chain: {0}")]
	InvalidChain(String),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("RPC failed: {0}")]
	Rpc(#[from] tonic::Status),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("{endpoint} returned {status}: {body}")]
	Status {
		endpoint: String,
		status: u16,
		body: String,
	},

	#[error("token error: {0}")]
	Token(#[from] meshlink_sts::TokenError),

	#[error("identity error: {0}")]
	Identity(#[from] meshlink_identity::IdentityError),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("CA client is closed")]
	Closed,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl RetryableError for CaError {
	fn is_retryable(&self) -> bool {
		match self {
			CaError::Discovery(_) | CaError::Transport(_) | CaError::Io(_) => true,
			CaError::Http(e) => e.is_retryable(),
			_ => false,
		}
	}
}

pub type Result<T> = std::result::Result<T, CaError>;
