// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer certificate verification shared by the server and client sides.
//!
//! The check order is fixed: a missing certificate fails with
//! [`IdentityError::PeerCertRequired`], a leaf whose first URI SAN is absent
//! or names another trust domain fails with
//! [`IdentityError::TrustDomainMismatch`], and only then is the chain
//! verified against the trusted roots. Host names are never checked; mesh
//! peers are identified by their URI SAN.

use crate::error::{IdentityError, Result};
use crate::spiffe::{uri_host, SpiffeId};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
	CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, RootCertStore,
	SignatureScheme,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::sync::Arc;
use tracing::debug;
use x509_parser::prelude::*;

#[derive(Debug)]
pub struct PeerVerifier {
	trust_domain: Option<String>,
	roots: Arc<RootCertStore>,
	root_hints: Vec<DistinguishedName>,
	provider: Arc<CryptoProvider>,
	client_auth_mandatory: bool,
}

impl PeerVerifier {
	/// `trust_domain` is `None` for a degraded local identity, in which case
	/// only the chain is verified.
	pub fn new(
		trust_domain: Option<String>,
		roots: Arc<RootCertStore>,
		provider: Arc<CryptoProvider>,
	) -> Self {
		let root_hints = roots.subjects();
		Self {
			trust_domain,
			roots,
			root_hints,
			provider,
			client_auth_mandatory: false,
		}
	}

	/// Require a client certificate during the handshake instead of only
	/// requesting one.
	pub fn with_client_auth_mandatory(mut self, mandatory: bool) -> Self {
		self.client_auth_mandatory = mandatory;
		self
	}

	pub fn trust_domain(&self) -> Option<&str> {
		self.trust_domain.as_deref()
	}

	/// Verifies a presented chain (leaf first). Returns the peer's SPIFFE id
	/// when its URI SAN has the Kubernetes shape.
	pub fn verify_peer(
		&self,
		chain: &[CertificateDer<'_>],
		now: UnixTime,
		usage: webpki::KeyUsage,
	) -> Result<Option<SpiffeId>> {
		let (leaf, intermediates) = chain.split_first().ok_or(IdentityError::PeerCertRequired)?;

		let uris = leaf_uri_sans(leaf)?;
		if let Some(expected) = &self.trust_domain {
			let actual = uris.first().and_then(|uri| uri_host(uri));
			if actual.as_deref() != Some(expected.as_str()) {
				return Err(IdentityError::TrustDomainMismatch {
					expected: expected.clone(),
					actual,
				});
			}
		}

		self.verify_chain(leaf, intermediates, now, usage)?;

		let peer = uris.first().and_then(|uri| SpiffeId::parse(uri).ok());
		debug!(peer = ?peer.as_ref().map(ToString::to_string), "peer certificate verified");
		Ok(peer)
	}

	fn verify_chain(
		&self,
		leaf: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
		usage: webpki::KeyUsage,
	) -> Result<()> {
		let cert = webpki::EndEntityCert::try_from(leaf)
			.map_err(|e| IdentityError::ChainVerificationFailed(format!("{e:?}")))?;

		cert
			.verify_for_usage(
				self.provider.signature_verification_algorithms.all,
				&self.roots.roots,
				intermediates,
				now,
				usage,
				None,
				None,
			)
			.map(|_| ())
			.map_err(|e| IdentityError::ChainVerificationFailed(format!("{e:?}")))
	}
}

/// Identity of the peer on an established TLS session. Sessions where the
/// peer sent no certificate are rejected here, since the handshake only
/// requests one.
pub fn peer_identity(certs: Option<&[CertificateDer<'_>]>) -> Result<Option<SpiffeId>> {
	let leaf = certs
		.and_then(|certs| certs.first())
		.ok_or(IdentityError::PeerCertRequired)?;
	let uris = leaf_uri_sans(leaf)?;
	Ok(uris.first().and_then(|uri| SpiffeId::parse(uri).ok()))
}

pub(crate) fn leaf_uri_sans(der: &CertificateDer<'_>) -> Result<Vec<String>> {
	let (_, cert) = X509Certificate::from_der(der.as_ref())
		.map_err(|e| IdentityError::Certificate(format!("failed to parse certificate: {e}")))?;

	let uris = match cert.subject_alternative_name() {
		Ok(Some(san)) => san
			.value
			.general_names
			.iter()
			.filter_map(|name| match name {
				GeneralName::URI(uri) => Some(uri.to_string()),
				_ => None,
			})
			.collect(),
		Ok(None) => Vec::new(),
		Err(e) => {
			return Err(IdentityError::Certificate(format!(
				"invalid subjectAltName: {e}"
			)))
		}
	};
	Ok(uris)
}

fn to_rustls_error(err: IdentityError) -> rustls::Error {
	match err {
		IdentityError::PeerCertRequired => rustls::Error::NoCertificatesPresented,
		other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(other)))),
	}
}

impl ClientCertVerifier for PeerVerifier {
	fn offer_client_auth(&self) -> bool {
		true
	}

	fn client_auth_mandatory(&self) -> bool {
		self.client_auth_mandatory
	}

	fn root_hint_subjects(&self) -> &[DistinguishedName] {
		&self.root_hints
	}

	fn verify_client_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		now: UnixTime,
	) -> std::result::Result<ClientCertVerified, rustls::Error> {
		let mut chain = Vec::with_capacity(intermediates.len() + 1);
		chain.push(end_entity.clone());
		chain.extend(intermediates.iter().cloned());

		self
			.verify_peer(&chain, now, webpki::KeyUsage::client_auth())
			.map(|_| ClientCertVerified::assertion())
			.map_err(to_rustls_error)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self
			.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}

impl ServerCertVerifier for PeerVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &CertificateDer<'_>,
		intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		now: UnixTime,
	) -> std::result::Result<ServerCertVerified, rustls::Error> {
		let mut chain = Vec::with_capacity(intermediates.len() + 1);
		chain.push(end_entity.clone());
		chain.extend(intermediates.iter().cloned());

		self
			.verify_peer(&chain, now, webpki::KeyUsage::server_auth())
			.map(|_| ServerCertVerified::assertion())
			.map_err(to_rustls_error)
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls12_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
		verify_tls13_signature(
			message,
			cert,
			dss,
			&self.provider.signature_verification_algorithms,
		)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self
			.provider
			.signature_verification_algorithms
			.supported_schemes()
	}
}
