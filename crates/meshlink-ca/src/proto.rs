// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire messages for the certificate services. Only the fields we send or
//! read are declared; unknown fields are skipped by prost.

pub const ISTIO_CREATE_CERTIFICATE: &str =
	"/istio.v1.auth.IstioCertificateService/CreateCertificate";
pub const MESHCA_CREATE_CERTIFICATE: &str =
	"/google.security.meshca.v1.MeshCertificateService/CreateCertificate";

#[derive(Clone, PartialEq, prost::Message)]
pub struct IstioCertificateRequest {
	#[prost(string, tag = "1")]
	pub csr: String,
	/// Requested lifetime in seconds.
	#[prost(int64, tag = "3")]
	pub validity_duration: i64,
	#[prost(message, optional, tag = "4")]
	pub metadata: Option<prost_types::Struct>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IstioCertificateResponse {
	/// Leaf first, root last.
	#[prost(string, repeated, tag = "1")]
	pub cert_chain: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshCertificateRequest {
	#[prost(string, tag = "1")]
	pub request_id: String,
	#[prost(string, tag = "2")]
	pub csr: String,
	#[prost(message, optional, tag = "3")]
	pub validity: Option<prost_types::Duration>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshCertificateResponse {
	#[prost(string, repeated, tag = "1")]
	pub cert_chain: Vec<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use prost::Message;

	#[test]
	fn istio_request_uses_expected_field_numbers() {
		let request = IstioCertificateRequest {
			csr: "c".into(),
			validity_duration: 1,
			metadata: None,
		};
		// field 1 (len-delimited) "c", field 3 (varint) 1
		assert_eq!(request.encode_to_vec(), vec![0x0a, 0x01, b'c', 0x18, 0x01]);
	}

	#[test]
	fn mesh_response_decodes_repeated_chain() {
		let bytes = [0x0a, 0x01, b'a', 0x0a, 0x01, b'b'];
		let response = MeshCertificateResponse::decode(&bytes[..]).unwrap();
		assert_eq!(response.cert_chain, vec!["a", "b"]);
	}
}
