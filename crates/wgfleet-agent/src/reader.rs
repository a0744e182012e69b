// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node Health & Traffic Reader.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;
use wgfleet_proto::{DashboardStats, HealthInfo, MemoryStats, NetworkRate, PeerTraffic, TrafficDump};

use crate::config::AgentConfig;
use crate::daemon::TunnelDaemon;
use crate::error::{AgentError, Result};
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
	pub total: u64,
	pub idle: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetTotals {
	pub rx_bytes: u64,
	pub tx_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
	cpu: CpuTimes,
	net: NetTotals,
	at: Instant,
}

pub struct NodeReader {
	config: Arc<AgentConfig>,
	store: LocalStore,
	daemon: Arc<dyn TunnelDaemon>,
}

impl NodeReader {
	pub fn new(config: Arc<AgentConfig>, store: LocalStore, daemon: Arc<dyn TunnelDaemon>) -> Self {
		Self { config, store, daemon }
	}

	#[tracing::instrument(skip(self))]
	pub async fn health(&self) -> Result<HealthInfo> {
		let interfaces = self.store.list_interfaces().await?;
		let clients = self.store.count_clients().await?;
		Ok(HealthInfo {
			version: env!("CARGO_PKG_VERSION").to_string(),
			interface_count: u32::try_from(interfaces.len()).unwrap_or(u32::MAX),
			client_count: u32::try_from(clients).unwrap_or(u32::MAX),
		})
	}

	/// Live counters of every peer on every enabled interface. An interface
	/// whose dump fails is skipped.
	#[tracing::instrument(skip(self))]
	pub async fn traffic_dump(&self) -> Result<TrafficDump> {
		let mut dump = TrafficDump::default();
		for iface in self.store.list_interfaces().await?.into_iter().filter(|i| i.enabled) {
			let name = iface.name();
			let peers = match self.daemon.dump(&name).await {
				Ok(peers) => peers,
				Err(e) => {
					warn!(interface = %name, error = %e, "skipping interface in traffic dump");
					continue;
				}
			};
			for peer in peers {
				dump.peers.insert(
					peer.public_key,
					PeerTraffic {
						interface: name.clone(),
						rx_bytes: peer.rx_bytes,
						tx_bytes: peer.tx_bytes,
						latest_handshake: peer.latest_handshake,
						endpoint: peer.endpoint,
					},
				);
			}
		}
		Ok(dump)
	}

	/// Host and tunnel statistics. Rates come from two samples taken one
	/// sample interval apart.
	#[tracing::instrument(skip(self))]
	pub async fn dashboard(&self) -> Result<DashboardStats> {
		let first = self.sample().await?;
		tokio::time::sleep(self.config.sample_interval).await;
		let second = self.sample().await?;

		let root = &self.config.proc_root;
		let memory = parse_meminfo(&read_proc(root, "meminfo").await?)?;
		let uptime_seconds = parse_uptime(&read_proc(root, "uptime").await?)?;

		let traffic = self.traffic_dump().await?;
		let bandwidth_total = traffic
			.peers
			.values()
			.map(|p| p.rx_bytes.saturating_add(p.tx_bytes))
			.fold(0u64, u64::saturating_add);

		let status = self
			.store
			.setting("status")
			.await?
			.map_or(true, |v| v.trim() != "false");
		let alerts = match self.store.setting("alerts").await? {
			Some(raw) => serde_json::from_str::<Vec<String>>(&raw).unwrap_or_else(|e| {
				warn!(error = %e, "stored alerts are not a JSON string list");
				Vec::new()
			}),
			None => Vec::new(),
		};

		Ok(DashboardStats {
			cpu_percent: cpu_percent(first.cpu, second.cpu),
			memory,
			client_count: self.store.count_clients().await?,
			bandwidth_total,
			uptime_seconds,
			status,
			alerts,
			network: network_rate(first.net, second.net, second.at.duration_since(first.at)),
		})
	}

	async fn sample(&self) -> Result<Sample> {
		let root = &self.config.proc_root;
		let cpu = parse_cpu_times(&read_proc(root, "stat").await?)?;
		let net = parse_net_dev(&read_proc(root, "net/dev").await?)?;
		Ok(Sample {
			cpu,
			net,
			at: Instant::now(),
		})
	}
}

async fn read_proc(root: &Path, file: &str) -> Result<String> {
	Ok(tokio::fs::read_to_string(root.join(file)).await?)
}

fn malformed(file: &str) -> AgentError {
	AgentError::Internal(format!("malformed /proc/{file}"))
}

/// Aggregate `cpu` line of `/proc/stat`. Guest time is already part of user
/// time, so only the first eight columns count.
pub fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
	let line = stat
		.lines()
		.find(|l| l.starts_with("cpu "))
		.ok_or_else(|| malformed("stat"))?;
	let fields: Vec<u64> = line
		.split_whitespace()
		.skip(1)
		.take(8)
		.map(|f| f.parse::<u64>().map_err(|_| malformed("stat")))
		.collect::<Result<_>>()?;
	if fields.len() < 4 {
		return Err(malformed("stat"));
	}
	let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
	Ok(CpuTimes {
		total: fields.iter().sum(),
		idle,
	})
}

pub fn parse_meminfo(meminfo: &str) -> Result<MemoryStats> {
	let field = |name: &str| -> Option<u64> {
		meminfo
			.lines()
			.find_map(|l| l.strip_prefix(name))
			.and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
			.and_then(|kb| kb.parse::<u64>().ok())
			.map(|kb| kb * 1024)
	};
	let total_bytes = field("MemTotal").ok_or_else(|| malformed("meminfo"))?;
	let available_bytes = field("MemAvailable")
		.or_else(|| field("MemFree"))
		.ok_or_else(|| malformed("meminfo"))?;
	let percent = if total_bytes == 0 {
		0.0
	} else {
		round1(total_bytes.saturating_sub(available_bytes) as f64 * 100.0 / total_bytes as f64)
	};
	Ok(MemoryStats {
		total_bytes,
		available_bytes,
		percent,
	})
}

/// Sums receive and transmit bytes over every device except loopback.
pub fn parse_net_dev(net_dev: &str) -> Result<NetTotals> {
	let mut totals = NetTotals::default();
	for line in net_dev.lines().skip(2) {
		let Some((device, counters)) = line.split_once(':') else {
			continue;
		};
		if device.trim() == "lo" {
			continue;
		}
		let fields: Vec<&str> = counters.split_whitespace().collect();
		if fields.len() < 9 {
			return Err(malformed("net/dev"));
		}
		let rx = fields[0].parse::<u64>().map_err(|_| malformed("net/dev"))?;
		let tx = fields[8].parse::<u64>().map_err(|_| malformed("net/dev"))?;
		totals.rx_bytes = totals.rx_bytes.saturating_add(rx);
		totals.tx_bytes = totals.tx_bytes.saturating_add(tx);
	}
	Ok(totals)
}

pub fn parse_uptime(uptime: &str) -> Result<u64> {
	uptime
		.split_whitespace()
		.next()
		.and_then(|s| s.parse::<f64>().ok())
		.map(|secs| secs as u64)
		.ok_or_else(|| malformed("uptime"))
}

pub fn cpu_percent(first: CpuTimes, second: CpuTimes) -> f64 {
	let total = second.total.saturating_sub(first.total);
	if total == 0 {
		return 0.0;
	}
	let idle = second.idle.saturating_sub(first.idle).min(total);
	round1((total - idle) as f64 * 100.0 / total as f64)
}

/// Bytes per second between two samples. Counter wrap yields zero.
pub fn network_rate(first: NetTotals, second: NetTotals, elapsed: Duration) -> NetworkRate {
	let secs = elapsed.as_secs_f64();
	if secs <= 0.0 {
		return NetworkRate::default();
	}
	NetworkRate {
		download_bps: second.rx_bytes.saturating_sub(first.rx_bytes) as f64 / secs,
		upload_bps: second.tx_bytes.saturating_sub(first.tx_bytes) as f64 / secs,
	}
}

fn round1(value: f64) -> f64 {
	(value * 10.0).round() / 10.0
}
