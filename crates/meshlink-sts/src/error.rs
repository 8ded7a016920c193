// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
	#[error("per-RPC credentials require exactly one audience, got {0}")]
	MultipleAudiencesUnsupported(usize),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("{endpoint} returned {status}: {body}")]
	Status {
		endpoint: String,
		status: u16,
		body: String,
	},

	#[error("invalid token response: {0}")]
	InvalidResponse(String),

	#[error("invalid JWT: {0}")]
	InvalidJwt(String),

	#[error("ID tokens require a Google service account")]
	ServiceAccountRequired,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("platform token source failed: {0}")]
	Source(String),
}

pub type Result<T> = std::result::Result<T, TokenError>;
