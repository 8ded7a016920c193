// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use zeroize::Zeroize;

const REDACTED: &str = "[REDACTED]";

/// A bearer token. Formatting never prints the value and the memory is
/// wiped on drop; [`SecretToken::expose`] is the only way to read it.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SecretToken(String);

impl SecretToken {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// `Bearer <token>`, for an `authorization` header.
	pub fn bearer(&self) -> String {
		format!("Bearer {}", self.0)
	}
}

impl fmt::Debug for SecretToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("SecretToken").field(&REDACTED).finish()
	}
}

impl fmt::Display for SecretToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl PartialEq for SecretToken {
	fn eq(&self, other: &Self) -> bool {
		self.0 == other.0
	}
}

impl Eq for SecretToken {}

impl From<String> for SecretToken {
	fn from(value: String) -> Self {
		Self(value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn formatting_is_redacted() {
		let token = SecretToken::new("eyJhbGciOi.secret");
		assert_eq!(format!("{token}"), REDACTED);
		assert_eq!(format!("{token:?}"), "SecretToken(\"[REDACTED]\")");
		assert_eq!(token.expose(), "eyJhbGciOi.secret");
	}

	#[test]
	fn bearer_prefixes_value() {
		assert_eq!(SecretToken::new("abc").bearer(), "Bearer abc");
	}
}
