// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{IdentityError, Result};
use std::fmt;
use std::str::FromStr;

pub const SPIFFE_PREFIX: &str = "spiffe://";

/// A Kubernetes-shaped SPIFFE id: `spiffe://<td>/ns/<ns>/sa/<sa>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
	trust_domain: String,
	namespace: String,
	service_account: String,
}

impl SpiffeId {
	pub fn new(
		trust_domain: impl Into<String>,
		namespace: impl Into<String>,
		service_account: impl Into<String>,
	) -> Self {
		Self {
			trust_domain: trust_domain.into(),
			namespace: namespace.into(),
			service_account: service_account.into(),
		}
	}

	pub fn parse(uri: &str) -> Result<Self> {
		let invalid = || IdentityError::InvalidSpiffeId(uri.to_string());

		let rest = uri.strip_prefix(SPIFFE_PREFIX).ok_or_else(invalid)?;
		let (trust_domain, path) = rest.split_once('/').ok_or_else(invalid)?;
		if trust_domain.is_empty() {
			return Err(invalid());
		}

		let segments: Vec<&str> = path.split('/').collect();
		match segments.as_slice() {
			["ns", namespace, "sa", service_account]
				if !namespace.is_empty() && !service_account.is_empty() =>
			{
				Ok(Self::new(trust_domain, *namespace, *service_account))
			}
			_ => Err(invalid()),
		}
	}

	pub fn trust_domain(&self) -> &str {
		&self.trust_domain
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn service_account(&self) -> &str {
		&self.service_account
	}
}

impl fmt::Display for SpiffeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{SPIFFE_PREFIX}{}/ns/{}/sa/{}",
			self.trust_domain, self.namespace, self.service_account
		)
	}
}

impl FromStr for SpiffeId {
	type Err = IdentityError;

	fn from_str(s: &str) -> Result<Self> {
		Self::parse(s)
	}
}

/// Host part of a URI SAN, used as the trust domain even when the path is
/// not in the namespace/service-account form.
pub fn uri_host(uri: &str) -> Option<String> {
	url::Url::parse(uri)
		.ok()
		.and_then(|u| u.host_str().map(str::to_string))
		.filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn parses_kubernetes_shaped_id() {
		let id = SpiffeId::parse("spiffe://cluster.local/ns/fortio/sa/default").unwrap();
		assert_eq!(id.trust_domain(), "cluster.local");
		assert_eq!(id.namespace(), "fortio");
		assert_eq!(id.service_account(), "default");
	}

	#[test]
	fn rejects_other_shapes() {
		for uri in [
			"https://cluster.local/ns/a/sa/b",
			"spiffe://cluster.local",
			"spiffe:///ns/a/sa/b",
			"spiffe://cluster.local/ns/a",
			"spiffe://cluster.local/ns//sa/b",
			"spiffe://cluster.local/sa/b/ns/a",
			"spiffe://cluster.local/ns/a/sa/b/extra",
		] {
			assert!(
				matches!(SpiffeId::parse(uri), Err(IdentityError::InvalidSpiffeId(_))),
				"{uri} should be rejected"
			);
		}
	}

	#[test]
	fn uri_host_extracts_trust_domain() {
		assert_eq!(
			uri_host("spiffe://example.org/workload").as_deref(),
			Some("example.org")
		);
		assert_eq!(uri_host("not a uri"), None);
	}

	proptest! {
		/// Formatting then parsing yields the same components.
		#[test]
		fn display_parse_roundtrip(
			td in "[a-z][a-z0-9-]{0,20}(\\.[a-z][a-z0-9-]{0,10}){0,3}",
			ns in "[a-z][a-z0-9-]{0,30}",
			sa in "[a-z][a-z0-9-]{0,30}",
		) {
			let id = SpiffeId::new(td.clone(), ns.clone(), sa.clone());
			let parsed = SpiffeId::parse(&id.to_string()).unwrap();
			prop_assert_eq!(parsed.trust_domain(), td.as_str());
			prop_assert_eq!(parsed.namespace(), ns.as_str());
			prop_assert_eq!(parsed.service_account(), sa.as_str());
		}
	}
}
