// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use meshlink_gate::{GateError, ReverseHandle, ReverseOnly, ReverseTunnelRegistry, SniGate};
use meshlink_hbone::{HboneConfig, HboneServer, ReverseTunnel};
use meshlink_identity::testing::TestCa;
use meshlink_identity::{Identity, ALPN_ISTIO};
use rustls_pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;

const APP_SNI: &str = "app.example.com";

async fn echo_server() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let (stream, _) = listener.accept().await.unwrap();
			tokio::spawn(async move {
				let (mut r, mut w) = stream.into_split();
				let _ = tokio::io::copy(&mut r, &mut w).await;
				let _ = w.shutdown().await;
			});
		}
	});
	addr
}

/// Answers each connection with `tag`, then echoes.
async fn tagged_echo_server(tag: &'static [u8]) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let (stream, _) = listener.accept().await.unwrap();
			tokio::spawn(async move {
				let (mut r, mut w) = stream.into_split();
				if w.write_all(tag).await.is_err() {
					return;
				}
				let _ = tokio::io::copy(&mut r, &mut w).await;
				let _ = w.shutdown().await;
			});
		}
	});
	addr
}

fn workload_tunnel(gateway: &Gateway, workload: &Identity, app: SocketAddr) -> ReverseTunnel {
	let server = HboneServer::new(
		&HboneConfig {
			app_port: app.port(),
			..HboneConfig::default()
		},
		Some(workload),
	)
	.unwrap();
	ReverseTunnel::new(gateway.h2r_addr.to_string(), APP_SNI, workload, server)
		.unwrap()
		.with_reconnect_delay(Duration::from_millis(50))
}

async fn next_registration(gateway: &mut Gateway) -> String {
	tokio::time::timeout(Duration::from_secs(5), gateway.registered.recv())
		.await
		.unwrap()
		.unwrap()
}

struct Gateway {
	gate: SniGate,
	sni_addr: SocketAddr,
	h2r_addr: SocketAddr,
	registered: mpsc::UnboundedReceiver<String>,
	_shutdown: watch::Sender<bool>,
}

async fn start_gateway(identity: &Identity) -> Gateway {
	let (tx, registered) = mpsc::unbounded_channel();
	let gate = SniGate::new(identity, Arc::new(ReverseOnly), Arc::new(ReverseTunnelRegistry::new()))
		.unwrap()
		.with_registration_callback(Arc::new(move |handle: &ReverseHandle| {
			let _ = tx.send(handle.sni.clone());
		}));

	let sni = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let h2r = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let sni_addr = sni.local_addr().unwrap();
	let h2r_addr = h2r.local_addr().unwrap();
	let (shutdown, rx) = watch::channel(false);
	{
		let gate = gate.clone();
		let rx = rx.clone();
		tokio::spawn(async move { gate.serve_sni(sni, rx).await });
	}
	{
		let gate = gate.clone();
		tokio::spawn(async move { gate.serve_h2r(h2r, rx).await });
	}

	Gateway {
		gate,
		sni_addr,
		h2r_addr,
		registered,
		_shutdown: shutdown,
	}
}

/// The bytes a TLS client sends first for `server_name`.
async fn client_hello_bytes(server_name: &'static str) -> Vec<u8> {
	let ca = TestCa::new("hello root");
	let config = ca.identity(None).client_config(&[ALPN_ISTIO]).unwrap();
	let (client, mut server) = duplex(64 * 1024);
	tokio::spawn(async move {
		let _ = TlsConnector::from(config)
			.connect(ServerName::try_from(server_name).unwrap(), client)
			.await;
	});
	let mut buf = vec![0u8; 64 * 1024];
	let n = server.read(&mut buf).await.unwrap();
	buf.truncate(n);
	buf
}

async fn assert_closed_silently(addr: SocketAddr, payload: &[u8]) {
	let mut stream = TcpStream::connect(addr).await.unwrap();
	stream.write_all(payload).await.unwrap();
	let mut received = Vec::new();
	let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
		.await
		.unwrap();
	// A reset is as silent as a FIN.
	if read.is_ok() {
		assert!(received.is_empty(), "gateway wrote {} bytes", received.len());
	}
}

/// Purpose: A client's TLS session to an SNI with a registered reverse
/// tunnel reaches the workload, which terminates mTLS and relays to its
/// application port.
#[tokio::test]
async fn routes_through_registered_reverse_tunnel() {
	let ca = TestCa::new("mesh root");
	let mut gateway =
		start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/istio-system/sa/gate"))).await;

	let echo = echo_server().await;
	let workload = ca.identity(Some("spiffe://cluster.local/ns/app/sa/default"));
	let server = HboneServer::new(
		&HboneConfig {
			app_port: echo.port(),
			..HboneConfig::default()
		},
		Some(&workload),
	)
	.unwrap();
	let tunnel = ReverseTunnel::new(gateway.h2r_addr.to_string(), APP_SNI, &workload, server)
		.unwrap()
		.with_reconnect_delay(Duration::from_millis(50));
	let (tunnel_shutdown, tunnel_rx) = watch::channel(false);
	let tunnel_task = tokio::spawn(async move { tunnel.run(tunnel_rx).await });

	let registered = tokio::time::timeout(Duration::from_secs(5), gateway.registered.recv())
		.await
		.unwrap()
		.unwrap();
	assert_eq!(registered, APP_SNI);
	let handle = gateway.gate.registry().lookup(APP_SNI).unwrap();
	assert_eq!(
		handle.peer.as_ref().map(|id| id.service_account().to_string()),
		Some("default".to_string())
	);

	let client = ca.identity(Some("spiffe://cluster.local/ns/app/sa/client"));
	let tcp = TcpStream::connect(gateway.sni_addr).await.unwrap();
	let mut tls = TlsConnector::from(client.client_config(&[ALPN_ISTIO]).unwrap())
		.connect(ServerName::try_from(APP_SNI).unwrap(), tcp)
		.await
		.unwrap();
	tls.write_all(b"ping through h2r").await.unwrap();
	let mut reply = [0u8; 16];
	tls.read_exact(&mut reply).await.unwrap();
	assert_eq!(&reply, b"ping through h2r");
	drop(tls);

	tunnel_shutdown.send(true).unwrap();
	tunnel_task.await.unwrap();
	tokio::time::timeout(Duration::from_secs(5), async {
		while gateway.gate.registry().lookup(APP_SNI).is_some() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("registration removed after the tunnel closed");
}

#[tokio::test]
async fn unroutable_sni_is_closed_without_response() {
	let ca = TestCa::new("mesh root");
	let gateway = start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/gw/sa/gate"))).await;
	let hello = client_hello_bytes("nobody.example.com").await;
	assert_closed_silently(gateway.sni_addr, &hello).await;
}

/// Purpose: A well-formed ClientHello whose SNI is not a routable name is
/// rejected with nothing written back.
#[tokio::test]
async fn unparseable_sni_is_closed_without_response() {
	let ca = TestCa::new("mesh root");
	let gateway = start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/gw/sa/gate"))).await;
	assert!(matches!(
		gateway.gate.route("bad_name.example.com"),
		Err(GateError::InvalidSni(_))
	));
	let hello = client_hello_bytes("bad_name.example.com").await;
	assert!(!hello.is_empty());
	assert_closed_silently(gateway.sni_addr, &hello).await;
}

/// Purpose: A second tunnel for the same SNI takes over routing, and the
/// first tunnel closing afterwards leaves the second registered.
#[tokio::test]
async fn later_reverse_tunnel_takes_over_sni() {
	let ca = TestCa::new("mesh root");
	let mut gateway =
		start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/istio-system/sa/gate"))).await;
	let workload_a = ca.identity(Some("spiffe://cluster.local/ns/app/sa/first"));
	let workload_b = ca.identity(Some("spiffe://cluster.local/ns/app/sa/second"));

	let tunnel_a = workload_tunnel(&gateway, &workload_a, tagged_echo_server(b"A").await);
	let (shutdown_a, rx_a) = watch::channel(false);
	let task_a = tokio::spawn(async move { tunnel_a.run(rx_a).await });
	assert_eq!(next_registration(&mut gateway).await, APP_SNI);
	let first = gateway.gate.registry().lookup(APP_SNI).unwrap();

	let tunnel_b = workload_tunnel(&gateway, &workload_b, tagged_echo_server(b"B").await);
	let (shutdown_b, rx_b) = watch::channel(false);
	let task_b = tokio::spawn(async move { tunnel_b.run(rx_b).await });
	assert_eq!(next_registration(&mut gateway).await, APP_SNI);
	let second = gateway.gate.registry().lookup(APP_SNI).unwrap();
	assert!(second.generation > first.generation);
	assert_eq!(
		second.peer.as_ref().map(|id| id.service_account().to_string()),
		Some("second".to_string())
	);

	shutdown_a.send(true).unwrap();
	task_a.await.unwrap();
	// give the gate time to observe the first tunnel's disconnect
	tokio::time::sleep(Duration::from_millis(300)).await;

	let current = gateway.gate.registry().lookup(APP_SNI).expect("second tunnel still registered");
	assert_eq!(current.generation, second.generation);
	assert_eq!(gateway.gate.registry().len(), 1);

	let client = ca.identity(Some("spiffe://cluster.local/ns/app/sa/client"));
	let tcp = TcpStream::connect(gateway.sni_addr).await.unwrap();
	let mut tls = TlsConnector::from(client.client_config(&[ALPN_ISTIO]).unwrap())
		.connect(ServerName::try_from(APP_SNI).unwrap(), tcp)
		.await
		.unwrap();
	tls.write_all(b"ping").await.unwrap();
	let mut reply = [0u8; 5];
	tls.read_exact(&mut reply).await.unwrap();
	assert_eq!(&reply, b"Bping");
	drop(tls);

	shutdown_b.send(true).unwrap();
	task_b.await.unwrap();
}

#[tokio::test]
async fn plaintext_is_closed_without_response() {
	let ca = TestCa::new("mesh root");
	let gateway = start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/gw/sa/gate"))).await;
	assert_closed_silently(gateway.sni_addr, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
}

#[tokio::test]
async fn route_errors_name_the_failure() {
	let ca = TestCa::new("mesh root");
	let gateway = start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/gw/sa/gate"))).await;
	assert!(matches!(gateway.gate.route("bad_name!"), Err(GateError::InvalidSni(_))));
	assert!(matches!(
		gateway.gate.route("outbound_.9090_._.svcA.nsB.svc.cluster.local"),
		Err(GateError::NoRoute(service)) if service == "svcA"
	));
}

#[tokio::test]
async fn foreign_workload_cannot_register() {
	let ca = TestCa::new("mesh root");
	let foreign = TestCa::new("foreign root");
	let gateway = start_gateway(&ca.identity(Some("spiffe://cluster.local/ns/gw/sa/gate"))).await;

	let workload = foreign.identity(Some("spiffe://cluster.local/ns/app/sa/default"));
	let server = HboneServer::new(&HboneConfig::default(), None).unwrap();
	let tunnel = ReverseTunnel::new(gateway.h2r_addr.to_string(), APP_SNI, &workload, server).unwrap();

	assert!(tunnel.dial_reverse().await.is_err());
	assert!(gateway.gate.registry().is_empty());
}
