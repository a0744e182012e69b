// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control of the WireGuard daemon through `wg`, `wg-quick` and `systemctl`.

use std::io::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::DaemonError;

/// One peer line of `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDump {
	pub public_key: String,
	pub endpoint: Option<String>,
	pub allowed_ips: Vec<String>,
	pub latest_handshake: Option<DateTime<Utc>>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

#[async_trait]
pub trait TunnelDaemon: Send + Sync {
	/// Applies a stripped config to a running interface without tearing it down.
	async fn sync_config(&self, interface: &str, stripped: &str) -> Result<(), DaemonError>;

	/// `wg-quick down` followed by `wg-quick up`.
	async fn restart(&self, interface: &str) -> Result<(), DaemonError>;

	/// Enables and starts the `wg-quick@` unit.
	async fn enable(&self, interface: &str) -> Result<(), DaemonError>;

	/// Stops and disables the `wg-quick@` unit.
	async fn disable(&self, interface: &str) -> Result<(), DaemonError>;

	async fn dump(&self, interface: &str) -> Result<Vec<PeerDump>, DaemonError>;
}

/// Drives the real system binaries.
#[derive(Debug, Clone)]
pub struct SystemDaemon {
	scratch_dir: PathBuf,
}

impl SystemDaemon {
	/// `scratch_dir` holds the short-lived stripped configs handed to `wg syncconf`.
	pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
		Self {
			scratch_dir: scratch_dir.into(),
		}
	}
}

#[async_trait]
impl TunnelDaemon for SystemDaemon {
	async fn sync_config(&self, interface: &str, stripped: &str) -> Result<(), DaemonError> {
		let spawn_err = |source| DaemonError::Spawn {
			command: "write stripped config".to_string(),
			source,
		};
		let mut file = tempfile::Builder::new()
			.prefix(&format!("{interface}-"))
			.suffix(".conf")
			.tempfile_in(&self.scratch_dir)
			.map_err(spawn_err)?;
		file.write_all(stripped.as_bytes()).map_err(spawn_err)?;
		file.flush().map_err(spawn_err)?;

		let path = file.path().to_string_lossy().to_string();
		run("wg", &["syncconf", interface, &path]).await?;
		debug!(interface, "applied config with syncconf");
		Ok(())
	}

	async fn restart(&self, interface: &str) -> Result<(), DaemonError> {
		if let Err(e) = run("wg-quick", &["down", interface]).await {
			warn!(interface, error = %e, "wg-quick down failed, bringing interface up anyway");
		}
		run("wg-quick", &["up", interface]).await?;
		debug!(interface, "restarted interface");
		Ok(())
	}

	async fn enable(&self, interface: &str) -> Result<(), DaemonError> {
		let unit = format!("wg-quick@{interface}");
		run("systemctl", &["enable", "--now", &unit]).await?;
		Ok(())
	}

	async fn disable(&self, interface: &str) -> Result<(), DaemonError> {
		let unit = format!("wg-quick@{interface}");
		run("systemctl", &["disable", "--now", &unit]).await?;
		Ok(())
	}

	async fn dump(&self, interface: &str) -> Result<Vec<PeerDump>, DaemonError> {
		let output = run("wg", &["show", interface, "dump"]).await?;
		parse_dump(&output)
	}
}

async fn run(program: &str, args: &[&str]) -> Result<String, DaemonError> {
	let command = format!("{program} {}", args.join(" "));
	trace!(cmd = %command, "running daemon command");

	let output = Command::new(program)
		.args(args)
		.output()
		.await
		.map_err(|source| DaemonError::Spawn {
			command: command.clone(),
			source,
		})?;

	if output.status.success() {
		Ok(String::from_utf8_lossy(&output.stdout).into_owned())
	} else {
		Err(DaemonError::Failed {
			command,
			status: output.status.to_string(),
			stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		})
	}
}

/// Parses `wg show <iface> dump`. The first line describes the interface
/// itself and is skipped; every following line is a tab-separated peer.
pub fn parse_dump(output: &str) -> Result<Vec<PeerDump>, DaemonError> {
	let mut peers = Vec::new();
	for line in output.lines().skip(1) {
		if line.trim().is_empty() {
			continue;
		}
		let fields: Vec<&str> = line.split('\t').collect();
		if fields.len() < 8 {
			return Err(DaemonError::Parse(format!(
				"expected 8 fields in peer line, got {}",
				fields.len()
			)));
		}

		let number = |idx: usize, what: &str| -> Result<u64, DaemonError> {
			fields[idx]
				.parse::<u64>()
				.map_err(|_| DaemonError::Parse(format!("bad {what} '{}'", fields[idx])))
		};

		let handshake = number(4, "latest-handshake")?;
		let latest_handshake = if handshake == 0 {
			None
		} else {
			i64::try_from(handshake)
				.ok()
				.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
		};

		peers.push(PeerDump {
			public_key: fields[0].to_string(),
			endpoint: none_marker(fields[2]).map(str::to_string),
			allowed_ips: none_marker(fields[3])
				.map(|ips| ips.split(',').map(|ip| ip.trim().to_string()).collect())
				.unwrap_or_default(),
			latest_handshake,
			rx_bytes: number(5, "transfer-rx")?,
			tx_bytes: number(6, "transfer-tx")?,
		});
	}
	Ok(peers)
}

fn none_marker(field: &str) -> Option<&str> {
	match field {
		"(none)" | "" => None,
		other => Some(other),
	}
}
