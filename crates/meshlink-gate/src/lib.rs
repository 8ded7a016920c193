// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SNI gateway.
//!
//! Inbound TLS connections are routed by the server name in their
//! ClientHello, which is read but never answered. A name with a registered
//! reverse (H2R) tunnel goes through that tunnel; any other name is
//! resolved to a platform endpoint and tunneled over HBONE with a bearer
//! token for that host. Unroutable connections are closed silently.

pub mod config;
pub mod error;
pub mod gate;
pub mod registry;
pub mod resolver;
pub mod route;
pub mod sni;

pub use config::{ConfigError, GateConfig, H2R_PORT, SNI_PORT};
pub use error::{GateError, Result};
pub use gate::{RegistrationCallback, SniGate};
pub use registry::{ReverseHandle, ReverseTunnelRegistry};
pub use resolver::{
	EndpointResolver, HostTokenCache, PlatformResolver, ReverseOnly, DEFAULT_PLATFORM_DOMAIN,
	HOST_TOKEN_TTL,
};
pub use route::{parse_sni, Route, SniTarget};
pub use sni::{read_client_hello, ClientHello, PrefixedStream};
