// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::HboneConfig;
use crate::error::{HboneError, Result};
use crate::io::{proxy, CopyConfig};
use crate::net;
use crate::stream::H2Stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use h2::server::SendResponse;
use h2::{Reason, RecvStream};
use http::{Method, Request, Response, StatusCode};
use meshlink_identity::{peer_identity, Identity};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

pub const HBONE_PATH_PREFIX: &str = "/_hbone/";
pub const MTLS_PATH: &str = "/_hbone/mtls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HboneRoute {
	/// Raw passthrough to `localhost:<port>`.
	Port(u16),
	/// Inner TLS handshake, then the application port.
	Mtls,
}

impl HboneRoute {
	pub fn from_path(path: &str) -> Option<Self> {
		if path == MTLS_PATH {
			return Some(Self::Mtls);
		}
		path.strip_prefix(HBONE_PATH_PREFIX)?
			.parse::<u16>()
			.ok()
			.filter(|port| *port != 0)
			.map(Self::Port)
	}
}

/// Opens the local leg of a tunneled stream.
#[async_trait]
pub trait LocalDialer: Send + Sync {
	async fn dial(&self, port: u16) -> io::Result<TcpStream>;
}

/// Dials `<ip>:<port>`, loopback by default.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackDialer {
	pub ip: Ipv4Addr,
}

impl Default for LoopbackDialer {
	fn default() -> Self {
		Self {
			ip: Ipv4Addr::LOCALHOST,
		}
	}
}

#[async_trait]
impl LocalDialer for LoopbackDialer {
	async fn dial(&self, port: u16) -> io::Result<TcpStream> {
		let stream = TcpStream::connect((self.ip, port)).await?;
		net::set_nodelay(&stream);
		Ok(stream)
	}
}

struct ServerInner {
	app_port: u16,
	dialer: Arc<dyn LocalDialer>,
	copy: CopyConfig,
	acceptor: Option<TlsAcceptor>,
}

/// Accepts HBONE streams on cleartext HTTP/2 connections and relays them to
/// local ports.
#[derive(Clone)]
pub struct HboneServer {
	inner: Arc<ServerInner>,
}

impl HboneServer {
	/// `identity` enables `/_hbone/mtls`; without it those requests get 503.
	pub fn new(config: &HboneConfig, identity: Option<&Identity>) -> Result<Self> {
		let acceptor = match identity {
			Some(identity) => Some(TlsAcceptor::from(identity.server_config()?)),
			None => None,
		};
		Ok(Self {
			inner: Arc::new(ServerInner {
				app_port: config.app_port,
				dialer: Arc::new(LoopbackDialer::default()),
				copy: config.copy_config(),
				acceptor,
			}),
		})
	}

	/// Replaces how local targets are reached.
	pub fn with_dialer(self, dialer: Arc<dyn LocalDialer>) -> Self {
		let inner = &self.inner;
		Self {
			inner: Arc::new(ServerInner {
				app_port: inner.app_port,
				dialer,
				copy: inner.copy.clone(),
				acceptor: inner.acceptor.clone(),
			}),
		}
	}

	/// Runs the accept loop until `shutdown` flips to true or the listener
	/// fails permanently.
	pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
		info!(addr = ?listener.local_addr().ok(), "HBONE server listening");
		loop {
			let (stream, peer) = tokio::select! {
				_ = shutdown.changed() => {
					info!("HBONE server shutting down");
					return Ok(());
				}
				accepted = net::accept(&listener) => accepted?,
			};

			let server = self.clone();
			tokio::spawn(async move {
				if let Err(e) = server.handle_accepted_h2c(stream, peer).await {
					debug!(%peer, error = %e, "HBONE connection ended with error");
				}
			});
		}
	}

	#[instrument(skip(self, stream))]
	async fn handle_accepted_h2c(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
		debug!(%peer, "HBONE connection accepted");
		self.serve_connection(stream).await
	}

	/// Serves HBONE requests on one HTTP/2 connection, e.g. an accepted
	/// socket or an outbound reverse tunnel.
	pub async fn serve_connection<IO>(&self, io: IO) -> Result<()>
	where
		IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let mut connection = h2::server::handshake(io).await?;
		while let Some(accepted) = connection.accept().await {
			let (request, mut respond) = accepted?;
			let server = self.clone();
			let path = request.uri().path().to_string();
			tokio::spawn(async move {
				let handled = AssertUnwindSafe(server.handle_request(request, &mut respond))
					.catch_unwind()
					.await;
				match handled {
					Ok(Ok(())) => {}
					Ok(Err(e)) => warn!(%path, error = %e, "HBONE stream failed"),
					Err(_) => {
						error!(%path, "HBONE stream handler panicked");
						// headers may already be out; reset the stream then
						if let Err(e) = reject(&mut respond, StatusCode::INTERNAL_SERVER_ERROR) {
							debug!(%path, error = %e, "resetting stream after panic");
							respond.send_reset(Reason::INTERNAL_ERROR);
						}
					}
				}
			});
		}
		Ok(())
	}

	async fn handle_request(
		&self,
		request: Request<RecvStream>,
		respond: &mut SendResponse<Bytes>,
	) -> Result<()> {
		if request.method() != Method::POST {
			return reject(respond, StatusCode::METHOD_NOT_ALLOWED);
		}
		let Some(route) = HboneRoute::from_path(request.uri().path()) else {
			return reject(respond, StatusCode::NOT_FOUND);
		};

		match route {
			HboneRoute::Port(port) => {
				let target = self.dial_local(port, respond).await?;
				let stream = accept_stream(request, respond)?;
				let (up, down) = proxy(stream, target, &self.inner.copy).await?;
				debug!(port, up, down, "HBONE stream closed");
			}
			HboneRoute::Mtls => {
				let Some(acceptor) = self.inner.acceptor.clone() else {
					return reject(respond, StatusCode::SERVICE_UNAVAILABLE);
				};
				let stream = accept_stream(request, respond)?;
				let tls = acceptor.accept(stream).await?;
				let peer = peer_identity(tls.get_ref().1.peer_certificates())?;
				debug!(peer = ?peer.as_ref().map(ToString::to_string), "inner mTLS established");

				let app = self.inner.dialer.dial(self.inner.app_port).await?;
				let (up, down) = proxy(tls, app, &self.inner.copy).await?;
				debug!(port = self.inner.app_port, up, down, "HBONE mTLS stream closed");
			}
		}
		Ok(())
	}

	async fn dial_local(&self, port: u16, respond: &mut SendResponse<Bytes>) -> Result<TcpStream> {
		match self.inner.dialer.dial(port).await {
			Ok(stream) => Ok(stream),
			Err(e) => {
				warn!(port, error = %e, "HBONE target dial failed");
				if let Err(reject_err) = reject(respond, StatusCode::BAD_GATEWAY) {
					debug!(port, error = %reject_err, "could not send 502");
				}
				Err(e.into())
			}
		}
	}
}

fn accept_stream(request: Request<RecvStream>, respond: &mut SendResponse<Bytes>) -> Result<H2Stream> {
	let response = Response::builder().status(StatusCode::OK).body(())?;
	let send = respond.send_response(response, false)?;
	Ok(H2Stream::new(send, request.into_body()))
}

fn reject(respond: &mut SendResponse<Bytes>, status: StatusCode) -> Result<()> {
	let response = Response::builder().status(status).body(())?;
	respond.send_response(response, true)?;
	Ok(())
}
