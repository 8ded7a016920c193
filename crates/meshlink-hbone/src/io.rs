// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Pooled buffers and the bidirectional copy used by every tunnel leg.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const MAX_POOLED: usize = 256;

/// Fixed-size byte buffers shared by all copies in the process.
pub struct BufferPool {
	size: usize,
	free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
	pub fn new(size: usize) -> Arc<Self> {
		Arc::new(Self {
			size,
			free: Mutex::new(Vec::new()),
		})
	}

	pub fn global() -> Arc<Self> {
		static POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();
		Arc::clone(POOL.get_or_init(|| BufferPool::new(DEFAULT_BUFFER_SIZE)))
	}

	pub fn buffer_size(&self) -> usize {
		self.size
	}

	pub fn get(self: &Arc<Self>) -> PooledBuffer {
		let buf = self
			.free
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.pop()
			.unwrap_or_else(|| vec![0; self.size]);
		PooledBuffer {
			buf,
			pool: Arc::clone(self),
		}
	}

	pub fn idle(&self) -> usize {
		self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
	}

	fn put(&self, buf: Vec<u8>) {
		let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
		if free.len() < MAX_POOLED {
			free.push(buf);
		}
	}
}

/// A buffer that goes back to its pool when dropped, whichever way the copy
/// ends.
pub struct PooledBuffer {
	buf: Vec<u8>,
	pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.buf
	}
}

impl DerefMut for PooledBuffer {
	fn deref_mut(&mut self) -> &mut [u8] {
		&mut self.buf
	}
}

impl Drop for PooledBuffer {
	fn drop(&mut self) {
		self.pool.put(std::mem::take(&mut self.buf));
	}
}

#[derive(Clone)]
pub struct CopyConfig {
	pub pool: Arc<BufferPool>,
	/// A read that waits longer than this ends the direction as if the
	/// peer had closed it.
	pub idle_timeout: Duration,
}

impl Default for CopyConfig {
	fn default() -> Self {
		Self {
			pool: BufferPool::global(),
			idle_timeout: DEFAULT_IDLE_TIMEOUT,
		}
	}
}

impl CopyConfig {
	pub fn new(buffer_size: usize, idle_timeout: Duration) -> Self {
		let pool = if buffer_size == DEFAULT_BUFFER_SIZE {
			BufferPool::global()
		} else {
			BufferPool::new(buffer_size)
		};
		Self { pool, idle_timeout }
	}
}

/// Copies `reader` into `writer` until EOF or idle timeout, then shuts the
/// writer down. Returns the bytes copied.
pub async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W, config: &CopyConfig) -> io::Result<u64>
where
	R: AsyncRead + Unpin + ?Sized,
	W: AsyncWrite + Unpin + ?Sized,
{
	let mut buf = config.pool.get();
	let mut total = 0u64;

	loop {
		let n = match tokio::time::timeout(config.idle_timeout, reader.read(&mut buf)).await {
			Err(_) => {
				debug!(idle_timeout = ?config.idle_timeout, total, "read idle, closing direction");
				break;
			}
			Ok(Ok(0)) => break,
			Ok(Ok(n)) => n,
			Ok(Err(e)) => return Err(e),
		};
		writer.write_all(&buf[..n]).await?;
		writer.flush().await?;
		total += n as u64;
	}

	if let Err(e) = writer.shutdown().await {
		debug!(error = %e, "shutdown after copy failed");
	}
	Ok(total)
}

/// Runs both directions between `a` and `b`. An error on either side ends
/// both. Returns `(a_to_b, b_to_a)` byte counts.
pub async fn proxy<A, B>(a: A, b: B, config: &CopyConfig) -> io::Result<(u64, u64)>
where
	A: AsyncRead + AsyncWrite,
	B: AsyncRead + AsyncWrite,
{
	let (mut a_read, mut a_write) = tokio::io::split(a);
	let (mut b_read, mut b_write) = tokio::io::split(b);

	tokio::try_join!(
		copy_buffered(&mut a_read, &mut b_write, config),
		copy_buffered(&mut b_read, &mut a_write, config),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::duplex;

	fn payload(len: usize) -> Vec<u8> {
		(0..len).map(|i| (i % 251) as u8).collect()
	}

	/// Purpose: Payloads larger than one pooled buffer arrive intact and in
	/// order in both directions.
	#[tokio::test]
	async fn test_proxy_preserves_large_payloads() {
		let (mut client, proxy_a) = duplex(16 * 1024);
		let (proxy_b, mut target) = duplex(16 * 1024);
		let config = CopyConfig::default();
		let relay = tokio::spawn(async move { proxy(proxy_a, proxy_b, &config).await });

		let upstream = payload(100 * 1024);
		let downstream = payload(70 * 1024 + 3);

		let up = upstream.clone();
		let down = downstream.clone();
		let target_task = tokio::spawn(async move {
			let mut received = Vec::new();
			let (mut r, mut w) = tokio::io::split(&mut target);
			let (read, write) = tokio::join!(r.read_to_end(&mut received), async {
				w.write_all(&down).await?;
				w.shutdown().await
			});
			read.unwrap();
			write.unwrap();
			assert_eq!(received, up);
		});

		let mut received = Vec::new();
		let (mut r, mut w) = tokio::io::split(&mut client);
		let (read, write) = tokio::join!(r.read_to_end(&mut received), async {
			w.write_all(&upstream).await?;
			w.shutdown().await
		});
		read.unwrap();
		write.unwrap();
		assert_eq!(received, downstream);

		target_task.await.unwrap();
		let (up_bytes, down_bytes) = relay.await.unwrap().unwrap();
		assert_eq!(up_bytes, upstream.len() as u64);
		assert_eq!(down_bytes, downstream.len() as u64);
	}

	/// Purpose: A stalled reader is treated as EOF once the idle timeout
	/// elapses.
	#[tokio::test(start_paused = true)]
	async fn test_idle_timeout_is_clean_eof() {
		let (_peer, mut stalled) = duplex(1024);
		let mut sink = Vec::new();
		let config = CopyConfig::new(DEFAULT_BUFFER_SIZE, Duration::from_secs(5));

		let copied = copy_buffered(&mut stalled, &mut sink, &config).await.unwrap();
		assert_eq!(copied, 0);
	}

	#[test]
	fn buffers_return_to_pool() {
		let pool = BufferPool::new(1024);
		{
			let a = pool.get();
			let _b = pool.get();
			assert_eq!(a.len(), 1024);
			assert_eq!(pool.idle(), 0);
		}
		assert_eq!(pool.idle(), 2);
		let _again = pool.get();
		assert_eq!(pool.idle(), 1);
	}
}
