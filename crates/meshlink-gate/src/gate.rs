// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::registry::{ReverseHandle, ReverseTunnelRegistry};
use crate::resolver::EndpointResolver;
use crate::route::{parse_sni, Route};
use crate::sni::{read_client_hello, PrefixedStream};
use meshlink_hbone::{net, Connector, CopyConfig, Endpoint, MTLS_PATH};
use meshlink_identity::{peer_identity, Identity, ALPN_H2R};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

/// Fires after every successful reverse tunnel handshake.
pub type RegistrationCallback = Arc<dyn Fn(&ReverseHandle) + Send + Sync>;

/// Gateway that routes inbound TLS by SNI without terminating it.
///
/// Connections on the SNI port are forwarded, ClientHello included, either
/// through a reverse tunnel registered for that SNI or to the endpoint the
/// resolver names. Connections on the H2R port are workloads registering
/// reverse tunnels.
#[derive(Clone)]
pub struct SniGate {
	registry: Arc<ReverseTunnelRegistry>,
	resolver: Arc<dyn EndpointResolver>,
	h2r_acceptor: TlsAcceptor,
	copy: CopyConfig,
	on_register: Option<RegistrationCallback>,
}

impl SniGate {
	/// `identity` is presented to registering workloads, which must present
	/// a certificate from the same trust domain in return.
	pub fn new(
		identity: &Identity,
		resolver: Arc<dyn EndpointResolver>,
		registry: Arc<ReverseTunnelRegistry>,
	) -> Result<Self> {
		let tls = identity.server_config_with(&[ALPN_H2R], true)?;
		Ok(Self {
			registry,
			resolver,
			h2r_acceptor: TlsAcceptor::from(tls),
			copy: CopyConfig::default(),
			on_register: None,
		})
	}

	pub fn with_registration_callback(mut self, callback: RegistrationCallback) -> Self {
		self.on_register = Some(callback);
		self
	}

	pub fn with_copy_config(mut self, copy: CopyConfig) -> Self {
		self.copy = copy;
		self
	}

	pub fn registry(&self) -> &Arc<ReverseTunnelRegistry> {
		&self.registry
	}

	/// A registered reverse tunnel takes precedence over direct routing.
	pub fn route(&self, sni: &str) -> Result<Route> {
		if let Some(handle) = self.registry.lookup(sni) {
			return Ok(Route::Reverse(handle));
		}
		let target = parse_sni(sni)?;
		Ok(Route::Direct(self.resolver.resolve(&target)?))
	}

	fn reverse_endpoint(&self, handle: ReverseHandle) -> Result<Endpoint> {
		let url = format!("https://{}{MTLS_PATH}", handle.sni);
		Ok(Endpoint::new(&url)?.with_connector(Connector::Shared(handle.send)))
	}

	/// Routes one inbound connection. On any error before routing the
	/// connection is dropped without a byte written.
	#[instrument(skip(self, stream))]
	pub async fn handle_sni_conn<IO>(&self, mut stream: IO, peer: SocketAddr) -> Result<()>
	where
		IO: AsyncRead + AsyncWrite + Unpin + Send,
	{
		let hello = read_client_hello(&mut stream).await?;
		let sni = hello.server_name.ok_or(GateError::MissingSni)?;
		let route = self.route(&sni)?;
		debug!(%sni, route = route.kind(), "routing SNI connection");

		let endpoint = match route {
			Route::Direct(endpoint) => endpoint,
			Route::Reverse(handle) => self.reverse_endpoint(handle)?,
		}
		.with_copy_config(self.copy.clone());

		let (up, down) = endpoint
			.proxy_stream(PrefixedStream::new(hello.raw, stream))
			.await?;
		debug!(%sni, up, down, "SNI connection closed");
		Ok(())
	}

	/// Accepts a workload's reverse tunnel and keeps it registered until the
	/// connection ends.
	#[instrument(skip(self, stream))]
	pub async fn handle_h2r_conn<IO>(&self, stream: IO, peer: SocketAddr) -> Result<()>
	where
		IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let tls = self.h2r_acceptor.accept(stream).await?;
		let (sni, workload) = {
			let (_, conn) = tls.get_ref();
			let sni = conn
				.server_name()
				.filter(|s| !s.is_empty())
				.map(str::to_string)
				.ok_or(GateError::MissingSni)?;
			(sni, peer_identity(conn.peer_certificates())?)
		};

		let (send, connection) = h2::client::handshake(tls).await?;
		let handle = self.registry.register(sni.clone(), workload, send);
		if let Some(callback) = &self.on_register {
			callback(&handle);
		}

		if let Err(e) = connection.await {
			debug!(%sni, error = %e, "reverse tunnel connection ended");
		}
		self.registry.remove_if_current(&sni, handle.generation);
		info!(%sni, generation = handle.generation, "reverse tunnel closed");
		Ok(())
	}

	pub async fn serve_sni(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		info!(addr = ?listener.local_addr().ok(), "SNI listener started");
		loop {
			let (stream, peer) = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				accepted = net::accept(&listener) => accepted?,
			};
			let gate = self.clone();
			tokio::spawn(async move {
				if let Err(e) = gate.handle_sni_conn(stream, peer).await {
					match &e {
						GateError::InvalidSni(_)
						| GateError::NoRoute(_)
						| GateError::MissingSni
						| GateError::ClientHello(_) => debug!(%peer, error = %e, "rejected SNI connection"),
						_ => warn!(%peer, error = %e, "SNI connection failed"),
					}
				}
			});
		}
	}

	pub async fn serve_h2r(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		info!(addr = ?listener.local_addr().ok(), "H2R listener started");
		loop {
			let (stream, peer) = tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				accepted = net::accept(&listener) => accepted?,
			};
			let gate = self.clone();
			tokio::spawn(async move {
				if let Err(e) = gate.handle_h2r_conn(stream, peer).await {
					warn!(%peer, error = %e, "reverse tunnel rejected");
				}
			});
		}
	}

	/// Binds both listeners from `config` and serves until shutdown. A
	/// permanent accept error ends only the listener it occurred on.
	pub async fn run(&self, config: &GateConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
		let sni = TcpListener::bind(config.sni_addr).await?;
		let h2r = TcpListener::bind(config.h2r_addr).await?;
		let (sni_result, h2r_result) = tokio::join!(
			self.serve_sni(sni, shutdown.clone()),
			self.serve_h2r(h2r, shutdown),
		);
		if let Err(e) = &sni_result {
			warn!(error = %e, "SNI listener stopped");
		}
		if let Err(e) = &h2r_result {
			warn!(error = %e, "H2R listener stopped");
		}
		sni_result.and(h2r_result)
	}
}
