// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

// EMFILE / ENFILE
const TOO_MANY_OPEN_FILES: [i32; 2] = [24, 23];

/// Accept errors that concern one connection or a passing resource
/// shortage rather than the listener itself.
pub fn is_temporary(err: &io::Error) -> bool {
	matches!(
		err.kind(),
		io::ErrorKind::ConnectionAborted
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::Interrupted
			| io::ErrorKind::WouldBlock
			| io::ErrorKind::TimedOut
	) || err
		.raw_os_error()
		.is_some_and(|code| TOO_MANY_OPEN_FILES.contains(&code))
}

/// Best effort; a socket that refuses the option still works.
pub fn set_nodelay(stream: &TcpStream) {
	if let Err(e) = stream.set_nodelay(true) {
		debug!(error = %e, "could not set TCP_NODELAY");
	}
}

/// Accepts the next connection, sleeping briefly over temporary errors.
/// Any other error is returned and should end the listener's loop.
pub async fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				set_nodelay(&stream);
				return Ok((stream, peer));
			}
			Err(e) if is_temporary(&e) => {
				warn!(error = %e, "temporary accept error, retrying");
				tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
			}
			Err(e) => return Err(e),
		}
	}
}
