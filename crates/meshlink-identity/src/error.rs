// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("identity not ready: {0} did not appear in time")]
	NotReady(String),

	#[error("peer certificate required")]
	PeerCertRequired,

	#[error("trust domain mismatch: expected {expected}, got {}", actual.as_deref().unwrap_or("no URI SAN"))]
	TrustDomainMismatch {
		expected: String,
		actual: Option<String>,
	},

	#[error("certificate chain verification failed: {0}")]
	ChainVerificationFailed(String),

	#[error("missing certificate")]
	MissingCertificate,

	#[error("invalid SPIFFE id: {0}")]
	InvalidSpiffeId(String),

	#[error("invalid PEM: {0}")]
	InvalidPem(String),

	#[error("certificate error: {0}")]
	Certificate(String),

	#[error("CSR generation failed: {0}")]
	Csr(String),

	#[error("TLS error: {0}")]
	Tls(#[from] rustls::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IdentityError>;
