// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod bootstrap;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshlink_gate::{
	GateConfig, HostTokenCache, PlatformResolver, ReverseHandle, ReverseTunnelRegistry, SniGate,
};
use meshlink_hbone::{forward, Endpoint, HboneConfig, HboneServer, ReverseTunnel, TokenCallback};
use meshlink_identity::{Identity, ALPN_ISTIO};
use meshlink_sts::TokenProvider;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bootstrap::{acquire_identity, issue_identity, Credentials};
use crate::config::{is_truthy, ForwardSpec};

#[derive(Parser, Debug)]
#[command(name = "meshlink", version, about, long_about = None)]
struct Cli {
	/// Log as JSON lines (also enabled by MESHLINK_LOG_JSON=1)
	#[arg(long)]
	log_json: bool,

	/// Directory holding key.pem, cert-chain.pem and root-cert.pem
	#[arg(long, env = "MESHLINK_CERT_DIR", default_value = meshlink_identity::DEFAULT_CERT_DIR)]
	cert_dir: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Obtain a workload certificate from the configured CA and exit
	Certs,

	/// Serve HBONE for the local application
	Workload {
		/// Gateway H2R address to keep a reverse tunnel open to
		#[arg(long, env = "MESHLINK_GATEWAY")]
		gateway: Option<String>,

		/// Name the reverse tunnel is registered under
		#[arg(long, env = "MESHLINK_REVERSE_SNI", requires = "gateway")]
		sni: Option<String>,

		/// Tunnel a local listener, as LISTEN=TARGET
		#[arg(long = "forward", value_name = "LISTEN=TARGET")]
		forwards: Vec<String>,
	},

	/// Run the SNI gateway and reverse tunnel listener
	Gate,
}

fn init_tracing(json: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry.with(tracing_subscriber::fmt::layer().json()).init();
	} else {
		registry.with(tracing_subscriber::fmt::layer()).init();
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	let json = cli.log_json || std::env::var("MESHLINK_LOG_JSON").is_ok_and(|v| is_truthy(&v));
	init_tracing(json);

	let (shutdown_tx, shutdown) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("shutdown requested");
			let _ = shutdown_tx.send(true);
		}
	});

	let result = match cli.command {
		Command::Certs => run_certs(&cli.cert_dir).await,
		Command::Workload {
			gateway,
			sni,
			forwards,
		} => run_workload(&cli.cert_dir, gateway, sni, forwards, shutdown).await,
		Command::Gate => run_gate(&cli.cert_dir, shutdown).await,
	};
	if let Err(e) = &result {
		error!(error = ?e, "meshlink exiting");
	}
	result
}

async fn run_certs(cert_dir: &std::path::Path) -> Result<()> {
	let credentials = Credentials::from_env()?;
	let identity = issue_identity(cert_dir, &credentials).await?;
	info!(
		dir = %cert_dir.display(),
		spiffe_id = ?identity.spiffe_id().map(ToString::to_string),
		not_after = identity.not_after(),
		"certificates written"
	);
	Ok(())
}

async fn run_workload(
	cert_dir: &std::path::Path,
	gateway: Option<String>,
	sni: Option<String>,
	forwards: Vec<String>,
	shutdown: watch::Receiver<bool>,
) -> Result<()> {
	let forwards = forwards
		.iter()
		.map(|spec| ForwardSpec::parse(spec))
		.collect::<Result<Vec<_>>>()?;
	let config = HboneConfig::from_env().context("HBONE configuration")?;
	let credentials = Credentials::from_env()?;
	let identity = acquire_identity(cert_dir, &credentials).await?;

	let server = HboneServer::new(&config, Some(&identity))?;
	let mut tasks = JoinSet::new();

	let listener = TcpListener::bind(config.listen_addr)
		.await
		.with_context(|| format!("binding HBONE listener {}", config.listen_addr))?;
	{
		let server = server.clone();
		let shutdown = shutdown.clone();
		tasks.spawn(async move { server.serve(listener, shutdown).await.map_err(anyhow::Error::from) });
	}

	if let Some(gateway) = gateway {
		let sni = match sni {
			Some(sni) => sni,
			None => identity
				.service_account()
				.map(str::to_string)
				.context("reverse tunnel needs --sni or a SPIFFE identity")?,
		};
		info!(%gateway, %sni, "keeping reverse tunnel open");
		let tunnel = ReverseTunnel::new(gateway, &sni, &identity, server.clone())?;
		let shutdown = shutdown.clone();
		tasks.spawn(async move {
			tunnel.run(shutdown).await;
			Ok(())
		});
	}

	let token: Option<Arc<dyn TokenCallback>> = credentials
		.exchange
		.clone()
		.map(|exchange| exchange as Arc<dyn TokenCallback>);
	for spec in forwards {
		let endpoint = forward_endpoint(&spec, &identity, token.clone())?;
		let listener = TcpListener::bind(spec.listen)
			.await
			.with_context(|| format!("binding forward listener {}", spec.listen))?;
		let shutdown = shutdown.clone();
		tasks.spawn(async move {
			forward(listener, Arc::new(endpoint), shutdown)
				.await
				.map_err(anyhow::Error::from)
		});
	}

	wait_for_tasks(tasks).await
}

fn forward_endpoint(
	spec: &ForwardSpec,
	identity: &Identity,
	token: Option<Arc<dyn TokenCallback>>,
) -> Result<Endpoint> {
	let mut endpoint = Endpoint::new(&spec.target)?;
	if let Some(token) = token {
		endpoint = endpoint.with_token_callback(token);
	}
	if spec.is_mtls() {
		let host = endpoint.host().to_string();
		endpoint = endpoint.with_mtls(identity.client_config(&[ALPN_ISTIO])?, &host)?;
	}
	info!(listen = %spec.listen, target = %spec.target, "forwarding");
	Ok(endpoint)
}

async fn run_gate(cert_dir: &std::path::Path, shutdown: watch::Receiver<bool>) -> Result<()> {
	let config = GateConfig::from_env().context("gateway configuration")?;
	let credentials = Credentials::from_env()?;
	let identity = acquire_identity(cert_dir, &credentials).await?;

	let mut resolver = PlatformResolver::new(config.platform_domain.clone());
	match &credentials.exchange {
		Some(exchange) => {
			let tokens = HostTokenCache::new(Arc::clone(exchange) as Arc<dyn TokenProvider>);
			resolver = resolver.with_token_callback(Arc::new(tokens));
		}
		None => warn!("no STS exchange configured, direct routes carry no token"),
	}

	let gate = SniGate::new(&identity, Arc::new(resolver), Arc::new(ReverseTunnelRegistry::new()))?
		.with_registration_callback(Arc::new(|handle: &ReverseHandle| {
			info!(sni = %handle.sni, generation = handle.generation, "workload registered");
		}));
	gate.run(&config, shutdown).await?;
	Ok(())
}

async fn wait_for_tasks(mut tasks: JoinSet<Result<()>>) -> Result<()> {
	let mut first_error = None;
	while let Some(joined) = tasks.join_next().await {
		match joined {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				error!(error = ?e, "task failed");
				first_error.get_or_insert(e);
			}
			Err(e) => {
				error!(error = %e, "task panicked");
				first_error.get_or_insert(e.into());
			}
		}
	}
	match first_error {
		Some(e) => Err(e),
		None => Ok(()),
	}
}
