// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory [`TunnelDaemon`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::daemon::{PeerDump, TunnelDaemon};
use crate::error::DaemonError;

#[derive(Debug, Default)]
struct FakeInterface {
	running: bool,
	peers: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Default)]
struct FakeState {
	interfaces: HashMap<String, FakeInterface>,
	counters: HashMap<String, (u64, u64, Option<DateTime<Utc>>)>,
	failing: HashSet<String>,
	calls: Vec<String>,
}

/// Records every call and keeps the peer set handed to `sync_config`.
#[derive(Debug, Default)]
pub struct FakeDaemon {
	state: Mutex<FakeState>,
}

impl FakeDaemon {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, FakeState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn calls(&self) -> Vec<String> {
		self.state().calls.clone()
	}

	/// Public keys currently applied to `interface`.
	pub fn peers(&self, interface: &str) -> Vec<String> {
		self.state()
			.interfaces
			.get(interface)
			.map(|i| i.peers.iter().map(|(k, _)| k.clone()).collect())
			.unwrap_or_default()
	}

	pub fn is_running(&self, interface: &str) -> bool {
		self.state().interfaces.get(interface).is_some_and(|i| i.running)
	}

	pub fn set_counters(&self, public_key: &str, rx: u64, tx: u64, handshake: Option<DateTime<Utc>>) {
		self.state()
			.counters
			.insert(public_key.to_string(), (rx, tx, handshake));
	}

	/// Adds a live peer the agent's store does not know about.
	pub fn inject_peer(&self, interface: &str, public_key: &str, allowed_ip: &str) {
		self.state()
			.interfaces
			.entry(interface.to_string())
			.or_default()
			.peers
			.push((public_key.to_string(), vec![allowed_ip.to_string()]));
	}

	/// Makes every later call touching `interface` fail.
	pub fn fail(&self, interface: &str) {
		self.state().failing.insert(interface.to_string());
	}

	fn check(state: &FakeState, interface: &str, command: &str) -> Result<(), DaemonError> {
		if state.failing.contains(interface) {
			return Err(DaemonError::Failed {
				command: format!("{command} {interface}"),
				status: "exit status: 1".to_string(),
				stderr: format!("Unable to access interface: {interface}"),
			});
		}
		Ok(())
	}
}

#[async_trait]
impl TunnelDaemon for FakeDaemon {
	async fn sync_config(&self, interface: &str, stripped: &str) -> Result<(), DaemonError> {
		let mut state = self.state();
		state.calls.push(format!("syncconf {interface}"));
		Self::check(&state, interface, "wg syncconf")?;

		let mut peers: Vec<(String, Vec<String>)> = Vec::new();
		for line in stripped.lines() {
			let Some((key, value)) = line.split_once('=') else {
				continue;
			};
			match key.trim() {
				"PublicKey" => peers.push((value.trim().to_string(), Vec::new())),
				"AllowedIPs" => {
					if let Some(peer) = peers.last_mut() {
						peer.1 = value.split(',').map(|s| s.trim().to_string()).collect();
					}
				}
				_ => {}
			}
		}
		state.interfaces.entry(interface.to_string()).or_default().peers = peers;
		Ok(())
	}

	async fn restart(&self, interface: &str) -> Result<(), DaemonError> {
		let mut state = self.state();
		state.calls.push(format!("restart {interface}"));
		Self::check(&state, interface, "wg-quick up")?;
		state.interfaces.entry(interface.to_string()).or_default().running = true;
		Ok(())
	}

	async fn enable(&self, interface: &str) -> Result<(), DaemonError> {
		let mut state = self.state();
		state.calls.push(format!("enable {interface}"));
		Self::check(&state, interface, "systemctl enable")?;
		state.interfaces.entry(interface.to_string()).or_default().running = true;
		Ok(())
	}

	async fn disable(&self, interface: &str) -> Result<(), DaemonError> {
		let mut state = self.state();
		state.calls.push(format!("disable {interface}"));
		Self::check(&state, interface, "systemctl disable")?;
		state.interfaces.entry(interface.to_string()).or_default().running = false;
		Ok(())
	}

	async fn dump(&self, interface: &str) -> Result<Vec<PeerDump>, DaemonError> {
		let state = self.state();
		Self::check(&state, interface, "wg show")?;
		let Some(iface) = state.interfaces.get(interface) else {
			return Ok(Vec::new());
		};
		Ok(iface
			.peers
			.iter()
			.map(|(key, ips)| {
				let (rx, tx, handshake) = state.counters.get(key).copied().unwrap_or((0, 0, None));
				PeerDump {
					public_key: key.clone(),
					endpoint: None,
					allowed_ips: ips.clone(),
					latest_handshake: handshake,
					rx_bytes: rx,
					tx_bytes: tx,
				}
			})
			.collect())
	}
}
