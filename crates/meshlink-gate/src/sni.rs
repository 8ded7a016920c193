// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reads a TLS ClientHello without terminating the handshake, so the bytes
//! can be replayed to whichever backend the server name routes to.

use crate::error::{GateError, Result};
use bytes::{Buf, Bytes};
use pin_project_lite::pin_project;
use rustls::server::Acceptor;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::LazyConfigAcceptor;

/// Upper bound on bytes buffered while waiting for a complete ClientHello.
pub const MAX_CLIENT_HELLO: usize = 64 * 1024;
pub const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientHello {
	pub server_name: Option<String>,
	pub alpn: Vec<Vec<u8>>,
	/// Every byte read from the connection so far, starting with the
	/// ClientHello record.
	pub raw: Bytes,
}

/// Captures what the TLS parser reads and swallows anything it tries to
/// write, so a rejected connection never sees an alert.
struct Recording<'a, S> {
	inner: &'a mut S,
	recorded: Vec<u8>,
}

impl<S: AsyncRead + Unpin> AsyncRead for Recording<'_, S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let before = buf.filled().len();
		match Pin::new(&mut *this.inner).poll_read(cx, buf) {
			Poll::Ready(Ok(())) => {
				this.recorded.extend_from_slice(&buf.filled()[before..]);
				if this.recorded.len() > MAX_CLIENT_HELLO {
					return Poll::Ready(Err(io::Error::new(
						io::ErrorKind::InvalidData,
						"ClientHello too large",
					)));
				}
				Poll::Ready(Ok(()))
			}
			other => other,
		}
	}
}

impl<S: Unpin> AsyncWrite for Recording<'_, S> {
	fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}
}

/// Reads until a full ClientHello has arrived. Nothing is written to
/// `stream`.
pub async fn read_client_hello<S>(stream: &mut S) -> Result<ClientHello>
where
	S: AsyncRead + Unpin,
{
	let mut recording = Recording {
		inner: stream,
		recorded: Vec::new(),
	};

	let (server_name, alpn) = {
		let accept = LazyConfigAcceptor::new(Acceptor::default(), &mut recording);
		let start = tokio::time::timeout(CLIENT_HELLO_TIMEOUT, accept)
			.await
			.map_err(|_| {
				GateError::ClientHello(io::Error::new(io::ErrorKind::TimedOut, "ClientHello timed out"))
			})?
			.map_err(GateError::ClientHello)?;
		let hello = start.client_hello();
		let alpn = hello
			.alpn()
			.map(|protocols| protocols.map(<[u8]>::to_vec).collect())
			.unwrap_or_default();
		(hello.server_name().map(str::to_string), alpn)
	};

	Ok(ClientHello {
		server_name,
		alpn,
		raw: Bytes::from(recording.recorded),
	})
}

pin_project! {
	/// A stream whose first reads return `prefix`, then the inner stream.
	pub struct PrefixedStream<S> {
		prefix: Bytes,
		#[pin]
		inner: S,
	}
}

impl<S> PrefixedStream<S> {
	pub fn new(prefix: Bytes, inner: S) -> Self {
		Self { prefix, inner }
	}
}

impl<S: AsyncRead> AsyncRead for PrefixedStream<S> {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.project();
		if !this.prefix.is_empty() {
			let n = this.prefix.len().min(buf.remaining());
			buf.put_slice(&this.prefix[..n]);
			this.prefix.advance(n);
			return Poll::Ready(Ok(()));
		}
		this.inner.poll_read(cx, buf)
	}
}

impl<S: AsyncWrite> AsyncWrite for PrefixedStream<S> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		self.project().inner.poll_write(cx, buf)
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		self.project().inner.poll_shutdown(cx)
	}
}
