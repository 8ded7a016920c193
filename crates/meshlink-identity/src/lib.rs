// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh workload identity.
//!
//! An [`Identity`] holds the private key, the certificate chain and the
//! trusted roots of a workload. The trust domain, namespace and service
//! account are derived from the first URI SAN of the leaf certificate,
//! which is expected to be a SPIFFE id:
//!
//! ```text
//! spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>
//! ```
//!
//! A leaf without such a SAN yields a degraded identity: TLS still works,
//! but peers cannot be held to a trust domain.
//!
//! Peer certificates are checked by [`PeerVerifier`], which is installed
//! on both the server and client TLS configurations built here.

pub mod csr;
pub mod error;
pub mod identity;
pub mod spiffe;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod verifier;

pub use csr::CsrBundle;
pub use error::{IdentityError, Result};
pub use identity::{
	wait_for_file, Identity, ALPN_H2, ALPN_H2R, ALPN_ISTIO, CERT_CHAIN_FILE, DEFAULT_CERT_DIR,
	KEY_FILE, ROOT_CERT_FILE,
};
pub use spiffe::SpiffeId;
pub use verifier::{peer_identity, PeerVerifier};
