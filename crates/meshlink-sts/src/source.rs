// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{Result, TokenError};
use crate::token::SecretToken;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supplies the platform-issued token a workload starts from.
#[async_trait]
pub trait PlatformTokenSource: Send + Sync {
	async fn platform_token(&self, audience: &str) -> Result<SecretToken>;
}

/// Reads a projected token from disk on every call, so kubelet rotation is
/// picked up without restarts. The audience is fixed by the projection.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
	path: PathBuf,
}

impl FileTokenSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[async_trait]
impl PlatformTokenSource for FileTokenSource {
	async fn platform_token(&self, audience: &str) -> Result<SecretToken> {
		let raw = tokio::fs::read_to_string(&self.path).await?;
		let token = raw.trim();
		if token.is_empty() {
			return Err(TokenError::Source(format!(
				"{} is empty",
				self.path.display()
			)));
		}
		debug!(path = %self.path.display(), audience, "read platform token");
		Ok(SecretToken::new(token))
	}
}

#[derive(Debug, Clone)]
pub struct StaticTokenSource {
	token: SecretToken,
}

impl StaticTokenSource {
	pub fn new(token: impl Into<String>) -> Self {
		Self {
			token: SecretToken::new(token),
		}
	}
}

#[async_trait]
impl PlatformTokenSource for StaticTokenSource {
	async fn platform_token(&self, _audience: &str) -> Result<SecretToken> {
		Ok(self.token.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::NamedTempFile;

	#[tokio::test]
	async fn file_source_rereads_on_each_call() {
		let mut file = NamedTempFile::new().unwrap();
		writeln!(file, "first").unwrap();
		let source = FileTokenSource::new(file.path());

		assert_eq!(source.platform_token("aud").await.unwrap().expose(), "first");

		std::fs::write(file.path(), "second\n").unwrap();
		assert_eq!(source.platform_token("aud").await.unwrap().expose(), "second");
	}

	#[tokio::test]
	async fn file_source_rejects_empty_file() {
		let file = NamedTempFile::new().unwrap();
		let source = FileTokenSource::new(file.path());
		assert!(matches!(
			source.platform_token("aud").await,
			Err(TokenError::Source(_))
		));
	}

	#[tokio::test]
	async fn file_source_missing_file_is_io_error() {
		let source = FileTokenSource::new("/nonexistent/meshlink/token");
		assert!(matches!(
			source.platform_token("aud").await,
			Err(TokenError::Io(_))
		));
	}
}
