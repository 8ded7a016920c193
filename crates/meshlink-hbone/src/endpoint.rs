// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{HboneError, Result};
use crate::io::{copy_buffered, proxy, CopyConfig};
use crate::net;
use crate::stream::H2Stream;
use async_trait::async_trait;
use bytes::Bytes;
use h2::client::SendRequest;
use http::{header, Method, Request, StatusCode};
use meshlink_identity::ALPN_H2;
use meshlink_sts::{SecretToken, TokenExchange};
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

/// Supplies the bearer token presented to `host`.
#[async_trait]
pub trait TokenCallback: Send + Sync {
	async fn token(&self, host: &str) -> meshlink_sts::Result<SecretToken>;
}

#[async_trait]
impl TokenCallback for TokenExchange {
	async fn token(&self, host: &str) -> meshlink_sts::Result<SecretToken> {
		TokenExchange::token(self, host).await
	}
}

/// How the outer HTTP/2 connection is obtained.
#[derive(Clone)]
pub enum Connector {
	/// Dial the URL's host; TLS with this config for `https`.
	Dial { tls: Option<Arc<ClientConfig>> },
	/// Open streams on an already established connection, e.g. a reverse
	/// tunnel registered with a gateway.
	Shared(SendRequest<Bytes>),
}

struct InnerTls {
	config: Arc<ClientConfig>,
	server_name: ServerName<'static>,
}

/// Client side of an HBONE tunnel: every [`Endpoint::dial`] opens one POST
/// stream to the endpoint URL.
pub struct Endpoint {
	url: url::Url,
	host: String,
	port: u16,
	connector: Connector,
	sni: Option<String>,
	token: Option<Arc<dyn TokenCallback>>,
	mtls: Option<InnerTls>,
	copy: CopyConfig,
}

impl fmt::Debug for Endpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Endpoint")
			.field("url", &self.url.as_str())
			.field("sni", &self.sni)
			.field("mtls", &self.mtls.is_some())
			.finish_non_exhaustive()
	}
}

/// Expands `host:port` into `https://host/_hbone/port`; full URLs pass
/// through unchanged.
pub fn expand_url(target: &str) -> String {
	if target.contains("://") {
		return target.to_string();
	}
	match target.rsplit_once(':') {
		Some((host, port)) if port.parse::<u16>().is_ok() => {
			format!("https://{host}/_hbone/{port}")
		}
		_ => format!("https://{target}/_hbone/mtls"),
	}
}

static DEFAULT_TLS: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Public web roots with ALPN `h2`, built once per process.
fn default_tls_config() -> Result<Arc<ClientConfig>> {
	if let Some(config) = DEFAULT_TLS.get() {
		return Ok(Arc::clone(config));
	}
	let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
	let mut config = ClientConfig::builder_with_provider(Arc::new(
		rustls::crypto::ring::default_provider(),
	))
	.with_safe_default_protocol_versions()?
	.with_root_certificates(roots)
	.with_no_client_auth();
	config.alpn_protocols = vec![ALPN_H2.to_vec()];
	Ok(Arc::clone(DEFAULT_TLS.get_or_init(|| Arc::new(config))))
}

impl Endpoint {
	pub fn new(target: &str) -> Result<Self> {
		let url = url::Url::parse(&expand_url(target))
			.map_err(|e| HboneError::InvalidUrl(format!("{target}: {e}")))?;
		let host = url
			.host_str()
			.ok_or_else(|| HboneError::InvalidUrl(format!("{target}: missing host")))?
			.to_string();
		let (port, tls) = match url.scheme() {
			"http" => (url.port().unwrap_or(80), None),
			"https" => (url.port().unwrap_or(443), Some(default_tls_config()?)),
			other => {
				return Err(HboneError::InvalidUrl(format!("unsupported scheme {other}")));
			}
		};

		Ok(Self {
			url,
			host,
			port,
			connector: Connector::Dial { tls },
			sni: None,
			token: None,
			mtls: None,
			copy: CopyConfig::default(),
		})
	}

	pub fn url(&self) -> &str {
		self.url.as_str()
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	/// Replaces the outer TLS config (ignored for `http` URLs).
	pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
		if let Connector::Dial { tls: Some(_) } = self.connector {
			self.connector = Connector::Dial { tls: Some(config) };
		}
		self
	}

	pub fn with_connector(mut self, connector: Connector) -> Self {
		self.connector = connector;
		self
	}

	/// Server name for the outer TLS handshake, when it differs from the
	/// URL host.
	pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
		self.sni = Some(sni.into());
		self
	}

	pub fn with_token_callback(mut self, token: Arc<dyn TokenCallback>) -> Self {
		self.token = Some(token);
		self
	}

	/// Layers a TLS handshake with `config` inside each stream.
	pub fn with_mtls(mut self, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
		let server_name = ServerName::try_from(server_name.to_string())
			.map_err(|e| HboneError::InvalidUrl(format!("server name {server_name}: {e}")))?;
		self.mtls = Some(InnerTls {
			config,
			server_name,
		});
		Ok(self)
	}

	pub fn with_copy_config(mut self, copy: CopyConfig) -> Self {
		self.copy = copy;
		self
	}

	async fn connect(&self) -> Result<SendRequest<Bytes>> {
		let tls = match &self.connector {
			Connector::Shared(send) => return Ok(send.clone()),
			Connector::Dial { tls } => tls.clone(),
		};

		let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
		net::set_nodelay(&tcp);
		match tls {
			None => spawn_client(tcp).await,
			Some(config) => {
				let name = self.sni.as_deref().unwrap_or(&self.host).to_string();
				let server_name = ServerName::try_from(name)
					.map_err(|e| HboneError::InvalidUrl(format!("server name: {e}")))?;
				let tls = TlsConnector::from(config).connect(server_name, tcp).await?;
				spawn_client(tls).await
			}
		}
	}

	/// Opens one tunneled stream.
	#[instrument(skip(self), fields(url = %self.url))]
	pub async fn dial(&self) -> Result<H2Stream> {
		let send = self.connect().await?;
		let mut send = send.ready().await?;

		let mut request = Request::builder()
			.method(Method::POST)
			.uri(self.url.as_str());
		if let Some(callback) = &self.token {
			let token = callback.token(&format!("https://{}", self.host)).await?;
			request = request.header(header::AUTHORIZATION, token.bearer());
		}
		let request = request.body(())?;

		let (response, send_stream) = send.send_request(request, false)?;
		let response = response.await?;
		if response.status() != StatusCode::OK {
			return Err(HboneError::Status(response.status()));
		}
		debug!("HBONE stream established");
		Ok(H2Stream::new(send_stream, response.into_body()))
	}

	/// Opens a stream and completes the inner mTLS handshake over it.
	pub async fn dial_mtls(&self) -> Result<TlsStream<H2Stream>> {
		let inner = self.mtls.as_ref().ok_or(HboneError::MtlsUnavailable)?;
		let stream = self.dial().await?;
		let tls = TlsConnector::from(Arc::clone(&inner.config))
			.connect(inner.server_name.clone(), stream)
			.await?;
		Ok(tls)
	}

	/// Tunnels `reader` to the peer and the peer's bytes to `writer`,
	/// returning when both directions have finished or either failed.
	pub async fn proxy<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(u64, u64)>
	where
		R: AsyncRead + Unpin + ?Sized,
		W: AsyncWrite + Unpin + ?Sized,
	{
		if self.mtls.is_some() {
			let stream = self.dial_mtls().await?;
			return self.copy_split(stream, reader, writer).await;
		}
		let stream = self.dial().await?;
		self.copy_split(stream, reader, writer).await
	}

	/// Tunnels a full-duplex stream, e.g. an accepted socket.
	pub async fn proxy_stream<S>(&self, local: S) -> Result<(u64, u64)>
	where
		S: AsyncRead + AsyncWrite,
	{
		if self.mtls.is_some() {
			let stream = self.dial_mtls().await?;
			return Ok(proxy(local, stream, &self.copy).await?);
		}
		let stream = self.dial().await?;
		Ok(proxy(local, stream, &self.copy).await?)
	}

	async fn copy_split<S, R, W>(&self, stream: S, reader: &mut R, writer: &mut W) -> Result<(u64, u64)>
	where
		S: AsyncRead + AsyncWrite,
		R: AsyncRead + Unpin + ?Sized,
		W: AsyncWrite + Unpin + ?Sized,
	{
		let (mut remote_read, mut remote_write) = tokio::io::split(stream);
		Ok(tokio::try_join!(
			copy_buffered(reader, &mut remote_write, &self.copy),
			copy_buffered(&mut remote_read, writer, &self.copy),
		)?)
	}
}

async fn spawn_client<IO>(io: IO) -> Result<SendRequest<Bytes>>
where
	IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (send, connection) = h2::client::handshake(io).await?;
	tokio::spawn(async move {
		if let Err(e) = connection.await {
			debug!(error = %e, "HBONE client connection closed");
		}
	});
	Ok(send)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shorthand_expands_to_hbone_port() {
		assert_eq!(expand_url("svc.example.com:8080"), "https://svc.example.com/_hbone/8080");
		assert_eq!(expand_url("svc.example.com"), "https://svc.example.com/_hbone/mtls");
		assert_eq!(
			expand_url("http://127.0.0.1:15009/_hbone/9090"),
			"http://127.0.0.1:15009/_hbone/9090"
		);
	}

	#[test]
	fn scheme_selects_transport() {
		let h2c = Endpoint::new("http://127.0.0.1:15009/_hbone/8080").unwrap();
		assert!(matches!(h2c.connector, Connector::Dial { tls: None }));
		assert_eq!(h2c.port, 15009);

		let tls = Endpoint::new("svc.a.run.app:8080").unwrap();
		assert!(matches!(tls.connector, Connector::Dial { tls: Some(_) }));
		assert_eq!(tls.port, 443);
		assert_eq!(tls.host(), "svc.a.run.app");

		assert!(matches!(
			Endpoint::new("ftp://host/x"),
			Err(HboneError::InvalidUrl(_))
		));
	}
}
