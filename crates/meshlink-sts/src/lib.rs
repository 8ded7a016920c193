// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload token exchange.
//!
//! A workload without native cloud credentials starts from a platform token
//! (for example a projected Kubernetes service account token) and trades it
//! in two hops:
//!
//! 1. platform token to federated token via the STS `token-exchange` grant,
//! 2. federated token to a service account access or ID token via IAM
//!    credentials, when a Google service account is configured.
//!
//! [`TokenExchange`] caches the federated token once per session and the
//! resulting tokens per audience. [`TokenProvider`] exposes either exchange
//! or raw platform credentials as per-RPC `authorization` metadata.

pub mod cache;
pub mod config;
pub mod error;
pub mod exchange;
pub mod jwt;
pub mod provider;
pub mod source;
pub mod token;

pub use cache::{TokenCache, DEFAULT_SKEW};
pub use config::StsConfig;
pub use error::{Result, TokenError};
pub use exchange::TokenExchange;
pub use jwt::{decode_jwt_payload, JwtClaims};
pub use provider::{PlatformCredentials, TokenProvider, AUTHORIZATION};
pub use source::{FileTokenSource, PlatformTokenSource, StaticTokenSource};
pub use token::SecretToken;
