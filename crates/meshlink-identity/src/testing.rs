// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory certificate authority for tests.

use crate::identity::{Identity, CERT_CHAIN_FILE, KEY_FILE, ROOT_CERT_FILE};
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
	ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use std::path::Path;

pub struct TestCa {
	cert: Certificate,
	key: KeyPair,
}

impl TestCa {
	pub fn new(name: &str) -> Self {
		let key = KeyPair::generate().expect("generate CA key");
		let mut params = CertificateParams::default();
		params.distinguished_name.push(DnType::CommonName, name);
		params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
		let cert = params.self_signed(&key).expect("self-sign CA");
		Self { cert, key }
	}

	pub fn root_pem(&self) -> String {
		self.cert.pem()
	}

	fn leaf_params(uri: Option<&str>) -> CertificateParams {
		let mut params = CertificateParams::default();
		params.distinguished_name.push(DnType::CommonName, "workload");
		params.extended_key_usages = vec![
			ExtendedKeyUsagePurpose::ServerAuth,
			ExtendedKeyUsagePurpose::ClientAuth,
		];
		if let Some(uri) = uri {
			params.subject_alt_names = vec![SanType::URI(uri.try_into().expect("ia5 uri"))];
		}
		params
	}

	/// Issues a leaf and returns `(key_pem, chain_pem)` with the chain being
	/// leaf followed by this CA's root.
	pub fn issue(&self, uri: Option<&str>) -> (String, String) {
		let key = KeyPair::generate().expect("generate leaf key");
		let leaf = Self::leaf_params(uri)
			.signed_by(&key, &self.cert, &self.key)
			.expect("sign leaf");
		(key.serialize_pem(), format!("{}{}", leaf.pem(), self.cert.pem()))
	}

	/// Signs a PEM CSR, returning the leaf followed by the root.
	pub fn sign_csr(&self, csr_pem: &str) -> String {
		let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).expect("parse CSR");
		csr.params.extended_key_usages = vec![
			ExtendedKeyUsagePurpose::ServerAuth,
			ExtendedKeyUsagePurpose::ClientAuth,
		];
		let leaf = csr.signed_by(&self.cert, &self.key).expect("sign CSR");
		format!("{}{}", leaf.pem(), self.cert.pem())
	}

	pub fn identity(&self, uri: Option<&str>) -> Identity {
		let (key, chain) = self.issue(uri);
		Identity::from_pem(
			key.as_bytes(),
			chain.as_bytes(),
			Some(self.root_pem().as_bytes()),
		)
		.expect("build identity")
	}

	/// Writes the standard key/chain/root files for a fresh leaf.
	pub fn write_identity(&self, dir: &Path, uri: Option<&str>) {
		let (key, chain) = self.issue(uri);
		std::fs::write(dir.join(CERT_CHAIN_FILE), chain).expect("write chain");
		std::fs::write(dir.join(ROOT_CERT_FILE), self.root_pem()).expect("write root");
		std::fs::write(dir.join(KEY_FILE), key).expect("write key");
	}
}
