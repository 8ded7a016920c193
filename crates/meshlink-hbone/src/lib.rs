// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HBONE: byte streams tunneled over HTTP/2.
//!
//! Each tunneled connection is one HTTP/2 POST stream. The request path
//! selects the destination on the receiving side:
//!
//! - `/_hbone/<port>` relays raw bytes to `127.0.0.1:<port>`,
//! - `/_hbone/mtls` first terminates an inner TLS handshake with the
//!   workload identity, then relays to the application port.
//!
//! [`HboneServer`] accepts streams, either from cleartext HTTP/2
//! connections or over a [`ReverseTunnel`] the workload dialed out to a
//! gateway. [`Endpoint`] is the client side.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod forward;
pub mod io;
pub mod net;
pub mod reverse;
pub mod server;
pub mod stream;

pub use config::{ConfigError, HboneConfig, DEFAULT_APP_PORT, HBONE_PORT};
pub use endpoint::{expand_url, Connector, Endpoint, TokenCallback};
pub use error::{HboneError, Result};
pub use forward::forward;
pub use io::{copy_buffered, proxy, BufferPool, CopyConfig, PooledBuffer};
pub use reverse::ReverseTunnel;
pub use server::{
	HboneRoute, HboneServer, LocalDialer, LoopbackDialer, HBONE_PATH_PREFIX, MTLS_PATH,
};
pub use stream::H2Stream;
