// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use bytes::{Buf, Bytes};
use h2::{RecvStream, SendStream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// One HTTP/2 request/response pair viewed as a byte stream: the local
/// side's send body is the write half, the peer's body the read half.
#[derive(Debug)]
pub struct H2Stream {
	send: SendStream<Bytes>,
	recv: RecvStream,
	pending: Bytes,
	write_closed: bool,
}

impl H2Stream {
	pub fn new(send: SendStream<Bytes>, recv: RecvStream) -> Self {
		Self {
			send,
			recv,
			pending: Bytes::new(),
			write_closed: false,
		}
	}
}

fn h2_to_io(err: h2::Error) -> io::Error {
	if err.is_io() {
		match err.into_io() {
			Some(io) => io,
			None => io::Error::new(io::ErrorKind::BrokenPipe, "h2 connection closed"),
		}
	} else {
		io::Error::other(err)
	}
}

impl AsyncRead for H2Stream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if !this.pending.is_empty() {
				let n = this.pending.len().min(buf.remaining());
				buf.put_slice(&this.pending[..n]);
				this.pending.advance(n);
				return Poll::Ready(Ok(()));
			}

			match ready!(this.recv.poll_data(cx)) {
				Some(Ok(data)) => {
					let _ = this.recv.flow_control().release_capacity(data.len());
					this.pending = data;
				}
				// a peer that finished its body may reset with NO_ERROR
				Some(Err(e)) if e.reason() == Some(h2::Reason::NO_ERROR) => {
					return Poll::Ready(Ok(()));
				}
				Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
				None => return Poll::Ready(Ok(())),
			}
		}
	}
}

impl AsyncWrite for H2Stream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		if buf.is_empty() {
			return Poll::Ready(Ok(0));
		}
		if this.write_closed {
			return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
		}

		this.send.reserve_capacity(buf.len());
		loop {
			match ready!(this.send.poll_capacity(cx)) {
				Some(Ok(0)) => continue,
				Some(Ok(capacity)) => {
					let n = capacity.min(buf.len());
					this.send
						.send_data(Bytes::copy_from_slice(&buf[..n]), false)
						.map_err(h2_to_io)?;
					return Poll::Ready(Ok(n));
				}
				Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
				None => {
					return Poll::Ready(Err(io::Error::new(
						io::ErrorKind::BrokenPipe,
						"h2 stream closed by peer",
					)));
				}
			}
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		if this.write_closed {
			return Poll::Ready(Ok(()));
		}
		this.write_closed = true;
		this.send
			.send_data(Bytes::new(), true)
			.map_err(h2_to_io)?;
		Poll::Ready(Ok(()))
	}
}
