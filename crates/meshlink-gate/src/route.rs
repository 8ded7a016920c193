// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{GateError, Result};
use crate::registry::ReverseHandle;
use meshlink_hbone::Endpoint;

const OUTBOUND_PREFIX: &str = "outbound_";

/// Service named by an inbound SNI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniTarget {
	pub service: String,
	pub namespace: Option<String>,
	pub port: Option<u16>,
}

fn is_label(label: &str) -> bool {
	!label.is_empty()
		&& label.len() <= 63
		&& label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
		&& !label.starts_with('-')
		&& !label.ends_with('-')
}

/// Accepts the mesh form `outbound_.<port>_._.<service>.<namespace>.svc.cluster.local`
/// and plain names whose first label is the service.
pub fn parse_sni(sni: &str) -> Result<SniTarget> {
	let invalid = || GateError::InvalidSni(sni.to_string());
	let parts: Vec<&str> = sni.split('.').collect();

	if parts[0] == OUTBOUND_PREFIX {
		let [_, port, _subset, service, rest @ ..] = parts.as_slice() else {
			return Err(invalid());
		};
		let port = port
			.strip_suffix('_')
			.and_then(|p| p.parse::<u16>().ok())
			.filter(|p| *p != 0)
			.ok_or_else(invalid)?;
		if !is_label(service) {
			return Err(invalid());
		}
		return Ok(SniTarget {
			service: service.to_string(),
			namespace: rest.first().filter(|ns| is_label(ns)).map(|ns| ns.to_string()),
			port: Some(port),
		});
	}

	if !is_label(parts[0]) {
		return Err(invalid());
	}
	Ok(SniTarget {
		service: parts[0].to_string(),
		namespace: None,
		port: None,
	})
}

/// Where an inbound connection is sent.
pub enum Route {
	/// A fresh HBONE endpoint dialed for this connection.
	Direct(Endpoint),
	/// A stream on a tunnel a workload registered.
	Reverse(ReverseHandle),
}

impl Route {
	pub fn kind(&self) -> &'static str {
		match self {
			Route::Direct(_) => "direct",
			Route::Reverse(_) => "reverse",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn parses_mesh_outbound_form() {
		let target = parse_sni("outbound_.9090_._.svcA.nsB.svc.cluster.local").unwrap();
		assert_eq!(
			target,
			SniTarget {
				service: "svcA".into(),
				namespace: Some("nsB".into()),
				port: Some(9090),
			}
		);
	}

	#[test]
	fn parses_bare_service() {
		let target = parse_sni("svcA").unwrap();
		assert_eq!(target.service, "svcA");
		assert_eq!(target.port, None);

		assert_eq!(parse_sni("fortio.a.run.app").unwrap().service, "fortio");
	}

	#[test]
	fn rejects_unparseable() {
		for sni in [
			"",
			".svc",
			"outbound_",
			"outbound_.9090_",
			"outbound_.9090_._",
			"outbound_.abc_._.svc.ns.svc.cluster.local",
			"outbound_.9090._.svc.ns.svc.cluster.local",
			"outbound_.0_._.svc.ns.svc.cluster.local",
			"outbound_.9090_._..ns",
			"bad_label.example.com",
			"-svc",
		] {
			assert!(
				matches!(parse_sni(sni), Err(GateError::InvalidSni(_))),
				"{sni:?} should be rejected"
			);
		}
	}

	proptest! {
		#[test]
		fn outbound_form_yields_service(
			service in "[a-z][a-z0-9-]{0,20}[a-z0-9]",
			namespace in "[a-z][a-z0-9]{0,20}",
			port in 1u16..,
		) {
			let sni = format!("outbound_.{port}_._.{service}.{namespace}.svc.cluster.local");
			let target = parse_sni(&sni).unwrap();
			prop_assert_eq!(target.service, service);
			prop_assert_eq!(target.namespace, Some(namespace));
			prop_assert_eq!(target.port, Some(port));
		}

		#[test]
		fn bare_form_yields_first_label(
			service in "[a-z][a-z0-9-]{0,20}[a-z0-9]",
			domain in "([a-z]{1,10}\\.){0,3}[a-z]{2,6}",
		) {
			let target = parse_sni(&format!("{service}.{domain}")).unwrap();
			prop_assert_eq!(target.service, service);
		}

		#[test]
		fn never_panics(sni in "\\PC{0,80}") {
			let _ = parse_sni(&sni);
		}
	}
}
