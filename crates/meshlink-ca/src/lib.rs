// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload certificate issuance.
//!
//! Three interchangeable backends implement [`CaClient`]:
//!
//! - [`CitadelClient`]: Istio-compatible gRPC CA, authorized by a platform
//!   token for the trust domain plus cluster id metadata,
//! - [`MeshCaClient`]: the managed mesh CA, authorized by an access token,
//! - [`CasClient`]: a Certificate Authority Service pool over REST.
//!
//! [`CertificateIssuer`] selects one from [`CaConfig`], discovering the
//! Citadel address from the `istio-system/mesh-env` config map when it is
//! not configured, and turns a signed chain into an [`Identity`].
//!
//! [`Identity`]: meshlink_identity::Identity

pub mod cas;
pub mod citadel;
mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod issuer;
pub mod meshca;
pub mod proto;

pub use cas::CasClient;
pub use citadel::{CitadelClient, CitadelOptions, ProvisioningCert};
pub use client::CaClient;
pub use config::{CaBackend, CaConfig, ConfigError};
pub use discovery::{
	discover_mesh_env, discovery_retry, ConfigSource, DirConfigSource, MeshEnv, StaticConfigSource,
};
pub use error::{CaError, Result};
pub use issuer::{split_pem_chain, CaResponse, CertificateIssuer, IssuerCredentials};
pub use meshca::MeshCaClient;
