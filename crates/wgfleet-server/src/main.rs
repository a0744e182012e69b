// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wgfleet control-plane binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wgfleet_common_secret::SecretString;
use wgfleet_proto::DEFAULT_AGENT_PORT;
use wgfleet_server::jobs::{ReconcileJob, SessionPurgeJob};
use wgfleet_server::{
	load_config, load_config_with_file, FleetServices, HttpDispatchFactory, Outcome,
	ServerConfig,
};
use wgfleet_server_db::{MirrorRepository, NewNode, NodeRepository};
use wgfleet_server_jobs::{JobScheduler, RunHistory, TriggerSource};

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// wgfleet server - manages a fleet of WireGuard gateway nodes.
#[derive(Parser, Debug)]
#[command(name = "wgfleet-server", about = "wgfleet control plane", version)]
struct Args {
	/// Config file (defaults to /etc/wgfleet/server.toml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the reconciliation scheduler until interrupted (default)
	Serve,
	/// Run one reconciliation cycle for one node, or for every node
	Reconcile {
		/// Node id; all nodes when omitted
		node: Option<i64>,
	},
	/// Manage registered nodes
	#[command(subcommand)]
	Node(NodeCommand),
	/// Show version information
	Version,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
	/// Probe a node's agent and register it
	Add {
		name: String,
		address: String,
		#[arg(long, default_value_t = DEFAULT_AGENT_PORT)]
		port: u16,
		#[arg(long, env = "WGFLEET_NODE_API_KEY", hide_env_values = true)]
		api_key: String,
		#[arg(long, default_value = "")]
		description: String,
	},
	/// List registered nodes
	List,
	/// Remove a node and everything mirrored under it
	Remove { id: i64 },
}

fn outcome<T>(outcome: Outcome<T>) -> anyhow::Result<T> {
	match outcome {
		Outcome::Succeeded(value) => Ok(value),
		Outcome::Failed(e) => Err(e.into()),
		Outcome::Indeterminate(e) => Err(anyhow::Error::new(e).context("outcome unknown, verify on the node")),
	}
}

async fn build_services(config: &ServerConfig) -> anyhow::Result<FleetServices> {
	let pool = wgfleet_server_db::create_pool(&config.database.url).await?;
	wgfleet_server_db::run_migrations(&pool).await?;

	let factory = HttpDispatchFactory::new(config.dispatch.timeout()).context("failed to build HTTP client")?;
	Ok(FleetServices::new(
		Arc::new(NodeRepository::new(pool.clone())),
		Arc::new(MirrorRepository::new(pool)),
		Arc::new(factory),
		config.reconcile.clone(),
	))
}

async fn serve(config: &ServerConfig, services: FleetServices) -> anyhow::Result<()> {
	let mut scheduler = JobScheduler::new(Arc::new(RunHistory::default()));
	scheduler.register_periodic(
		Arc::new(ReconcileJob::new(services.engine.clone())),
		config.reconcile.interval(),
	);
	scheduler.register_periodic(
		Arc::new(SessionPurgeJob::new(services.sessions.clone())),
		SESSION_PURGE_INTERVAL,
	);
	scheduler.start().await;

	if let Err(e) = scheduler.trigger_job("fleet-reconcile", TriggerSource::Manual).await {
		tracing::warn!(error = %e, "initial reconciliation could not be started");
	}

	tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
	tracing::info!("received shutdown signal");

	scheduler.shutdown().await;
	tracing::info!("server shutdown complete");
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("wgfleet-server version: {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	dotenvy::dotenv().ok();

	let config = match &args.config {
		Some(path) => load_config_with_file(path),
		None => load_config(),
	}
	.context("invalid server configuration")?;

	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| config.logging.level.clone().into()),
		)
		.with(tracing_subscriber::fmt::layer())
		.init();

	tracing::info!(
		database = %config.database.url,
		dispatch_timeout_secs = config.dispatch.timeout_secs,
		reconcile_interval_secs = config.reconcile.interval_secs,
		"starting wgfleet-server"
	);

	let services = build_services(&config).await?;

	match args.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(&config, services).await?,
		Command::Reconcile { node: Some(id) } => {
			let report = outcome(services.trigger_sync(id).await)?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Command::Reconcile { node: None } => {
			let summary = services.engine.run_all().await?;
			println!("{}", serde_json::to_string_pretty(&summary)?);
		}
		Command::Node(NodeCommand::Add {
			name,
			address,
			port,
			api_key,
			description,
		}) => {
			let node = outcome(
				services
					.add_node(NewNode {
						name,
						address,
						port,
						api_key: SecretString::new(api_key),
						description,
					})
					.await,
			)?;
			println!("registered node {} ({}) at {}", node.id, node.name, node.base_url());
		}
		Command::Node(NodeCommand::List) => {
			for node in outcome(services.list_nodes().await)? {
				let synced = node
					.last_synced_at
					.map(|t| t.to_rfc3339())
					.unwrap_or_else(|| "never".to_string());
				println!(
					"{}\t{}\t{}\t{}\tsynced {}\t{} bytes",
					node.id,
					node.name,
					node.base_url(),
					node.health,
					synced,
					node.bandwidth_total
				);
			}
		}
		Command::Node(NodeCommand::Remove { id }) => {
			outcome(services.remove_node(id).await)?;
			println!("removed node {id}");
		}
		Command::Version => {}
	}

	Ok(())
}
