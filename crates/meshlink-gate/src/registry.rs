// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use bytes::Bytes;
use h2::client::SendRequest;
use meshlink_identity::SpiffeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// An HTTP/2 client connection over a tunnel a workload dialed to the
/// gateway.
#[derive(Clone)]
pub struct ReverseHandle {
	pub sni: String,
	pub generation: u64,
	pub peer: Option<SpiffeId>,
	pub send: SendRequest<Bytes>,
}

impl std::fmt::Debug for ReverseHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReverseHandle")
			.field("sni", &self.sni)
			.field("generation", &self.generation)
			.field("peer", &self.peer.as_ref().map(ToString::to_string))
			.finish()
	}
}

/// Reverse tunnels keyed by the SNI each workload serves. Holds at most one
/// handle per SNI; a later registration replaces the earlier one, which
/// stays open until its own connection ends.
#[derive(Default)]
pub struct ReverseTunnelRegistry {
	tunnels: Mutex<HashMap<String, ReverseHandle>>,
	next_generation: AtomicU64,
}

impl ReverseTunnelRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn tunnels(&self) -> MutexGuard<'_, HashMap<String, ReverseHandle>> {
		self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn register(
		&self,
		sni: impl Into<String>,
		peer: Option<SpiffeId>,
		send: SendRequest<Bytes>,
	) -> ReverseHandle {
		let handle = ReverseHandle {
			sni: sni.into(),
			generation: self.next_generation.fetch_add(1, Ordering::Relaxed) + 1,
			peer,
			send,
		};
		let replaced = self.tunnels().insert(handle.sni.clone(), handle.clone());
		info!(
			sni = %handle.sni,
			generation = handle.generation,
			replaced = ?replaced.map(|old| old.generation),
			"reverse tunnel registered"
		);
		handle
	}

	pub fn lookup(&self, sni: &str) -> Option<ReverseHandle> {
		self.tunnels().get(sni).cloned()
	}

	/// Removes the entry for `sni` only while it still holds `generation`.
	pub fn remove_if_current(&self, sni: &str, generation: u64) -> bool {
		let mut tunnels = self.tunnels();
		match tunnels.get(sni) {
			Some(current) if current.generation == generation => {
				tunnels.remove(sni);
				debug!(sni, generation, "reverse tunnel removed");
				true
			}
			_ => false,
		}
	}

	pub fn len(&self) -> usize {
		self.tunnels().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn snis(&self) -> Vec<String> {
		self.tunnels().keys().cloned().collect()
	}
}
