// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wgfleet node agent binary.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wgfleet_agent::{router, store, AgentConfig, AgentState, LocalStore, SystemDaemon};

/// wgfleet agent - applies WireGuard changes requested by the control plane.
#[derive(Parser, Debug)]
#[command(name = "wgfleet-agent", about = "wgfleet node agent", version)]
struct Args {
	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Serve the agent RPC API (default)
	Serve,
	/// Show version information
	Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if let Some(Command::Version) = args.command {
		println!("wgfleet-agent version: {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	dotenvy::dotenv().ok();

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let config = Arc::new(AgentConfig::from_env().context("invalid agent configuration")?);

	tracing::info!(
		listen = %config.listen_addr,
		wg_dir = %config.wg_dir.display(),
		database = %config.database_url,
		"starting wgfleet-agent"
	);

	let pool = store::create_pool(&config.database_url).await?;
	store::run_migrations(&pool).await?;

	let daemon = Arc::new(SystemDaemon::new(std::env::temp_dir()));
	let state = AgentState::new(config.clone(), LocalStore::new(pool), daemon);
	let app = router(state);

	let listener = tokio::net::TcpListener::bind(config.listen_addr)
		.await
		.with_context(|| format!("failed to bind {}", config.listen_addr))?;

	tokio::select! {
		result = axum::serve(listener, app) => {
			if let Err(e) = result {
				tracing::error!(error = %e, "server error");
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("received shutdown signal");
		}
	}

	tracing::info!("agent shutdown complete");
	Ok(())
}
