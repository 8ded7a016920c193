// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
	#[error("invalid SNI: {0}")]
	InvalidSni(String),

	#[error("no route for SNI {0}")]
	NoRoute(String),

	#[error("failed to read ClientHello: {0}")]
	ClientHello(#[source] std::io::Error),

	#[error("ClientHello carried no server name")]
	MissingSni,

	#[error("tunnel error: {0}")]
	Hbone(#[from] meshlink_hbone::HboneError),

	#[error("identity error: {0}")]
	Identity(#[from] meshlink_identity::IdentityError),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("HTTP/2 error: {0}")]
	H2(#[from] h2::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
