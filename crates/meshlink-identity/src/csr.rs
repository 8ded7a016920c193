// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{IdentityError, Result};
use crate::spiffe::SpiffeId;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::fmt;
use zeroize::Zeroizing;

/// A fresh P-256 key and a PKCS#10 request for it.
pub struct CsrBundle {
	pub key_pem: Zeroizing<String>,
	pub csr_pem: String,
}

impl fmt::Debug for CsrBundle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CsrBundle")
			.field("csr_pem", &self.csr_pem)
			.finish_non_exhaustive()
	}
}

impl CsrBundle {
	/// Request for `id`: organization set to the trust domain, the id as the
	/// only URI SAN.
	pub fn generate(id: &SpiffeId) -> Result<Self> {
		let csr_err = |e: rcgen::Error| IdentityError::Csr(e.to_string());

		let key = KeyPair::generate().map_err(csr_err)?;

		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::OrganizationName, id.trust_domain());
		params.distinguished_name = dn;
		params.subject_alt_names = vec![SanType::URI(id.to_string().try_into().map_err(csr_err)?)];

		let csr_pem = params
			.serialize_request(&key)
			.and_then(|csr| csr.pem())
			.map_err(csr_err)?;

		Ok(Self {
			key_pem: Zeroizing::new(key.serialize_pem()),
			csr_pem,
		})
	}
}
