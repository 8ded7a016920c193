// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Workload side of a reverse (H2R) tunnel.
//!
//! The workload dials the gateway, completes mTLS with ALPN `h2r` and the
//! SNI it serves, then runs the HBONE server on that connection. The
//! gateway becomes the HTTP/2 client and opens streams toward the workload.

use crate::error::{HboneError, Result};
use crate::net;
use crate::server::HboneServer;
use meshlink_identity::{Identity, ALPN_H2R};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{info, instrument, warn};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct ReverseTunnel {
	gateway: String,
	server_name: ServerName<'static>,
	tls: Arc<ClientConfig>,
	server: HboneServer,
	reconnect_delay: Duration,
}

impl ReverseTunnel {
	/// `gateway` is a `host:port` address; `server_name` is the SNI the
	/// gateway indexes this tunnel under.
	pub fn new(
		gateway: impl Into<String>,
		server_name: &str,
		identity: &Identity,
		server: HboneServer,
	) -> Result<Self> {
		let server_name = ServerName::try_from(server_name.to_string())
			.map_err(|e| HboneError::InvalidUrl(format!("server name {server_name}: {e}")))?;
		Ok(Self {
			gateway: gateway.into(),
			server_name,
			tls: identity.client_config(&[ALPN_H2R])?,
			server,
			reconnect_delay: DEFAULT_RECONNECT_DELAY,
		})
	}

	pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
		self.reconnect_delay = delay;
		self
	}

	/// Dials once and serves until the gateway closes the connection.
	#[instrument(skip(self), fields(gateway = %self.gateway, sni = ?self.server_name))]
	pub async fn dial_reverse(&self) -> Result<()> {
		let tcp = TcpStream::connect(self.gateway.as_str()).await?;
		net::set_nodelay(&tcp);
		let tls = TlsConnector::from(Arc::clone(&self.tls))
			.connect(self.server_name.clone(), tcp)
			.await?;
		info!("reverse tunnel registered with gateway");
		self.server.serve_connection(tls).await
	}

	/// Keeps a tunnel open, reconnecting after `reconnect_delay`, until
	/// `shutdown` flips to true.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		loop {
			tokio::select! {
				_ = shutdown.changed() => return,
				result = self.dial_reverse() => match result {
					Ok(()) => info!(gateway = %self.gateway, "reverse tunnel closed by gateway"),
					Err(e) => warn!(gateway = %self.gateway, error = %e, "reverse tunnel failed"),
				},
			}

			tokio::select! {
				_ = shutdown.changed() => return,
				_ = tokio::time::sleep(self.reconnect_delay) => {}
			}
		}
	}
}
