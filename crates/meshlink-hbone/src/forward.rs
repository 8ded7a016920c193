// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::endpoint::Endpoint;
use crate::net;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

/// Tunnels every connection accepted on `listener` through `endpoint`.
pub async fn forward(
	listener: TcpListener,
	endpoint: Arc<Endpoint>,
	mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
	info!(addr = ?listener.local_addr().ok(), url = endpoint.url(), "forwarding local connections");
	loop {
		let (stream, peer) = tokio::select! {
			_ = shutdown.changed() => return Ok(()),
			accepted = net::accept(&listener) => accepted?,
		};

		let endpoint = Arc::clone(&endpoint);
		tokio::spawn(async move {
			match endpoint.proxy_stream(stream).await {
				Ok((up, down)) => debug!(%peer, up, down, "forwarded connection closed"),
				Err(e) => debug!(%peer, error = %e, "forwarded connection failed"),
			}
		});
	}
}
