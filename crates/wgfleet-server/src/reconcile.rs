// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation engine: one cycle per node pulls live traffic into the
//! mirror, enforces expiry and quota, runs the periodic reset and backup, and
//! records the node's health.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use wgfleet_proto::{DashboardRequest, SyncRequest, TrafficDumpRequest, CONNECTED_HANDSHAKE_WINDOW_SECS};
use wgfleet_server_db::{ManagedNode, MirrorStore, NodeHealth, NodeStore};

use crate::config::ReconcileConfig;
use crate::dispatch::NodeDispatch;
use crate::error::{FleetError, Result};
use crate::orchestrator::Orchestrator;
use crate::registry::NodeRegistry;
use crate::usage::{apply_sample, breach, DisableReason};

#[derive(Debug, Clone, Serialize)]
pub struct DisabledClient {
	pub name: String,
	pub reason: DisableReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeCycleReport {
	pub node_id: i64,
	/// Another cycle for this node was still running.
	pub skipped: bool,
	pub health: Option<NodeHealth>,
	pub reloaded: Vec<u32>,
	pub backed_up: Vec<u32>,
	pub disabled: Vec<DisabledClient>,
	pub failures: Vec<String>,
	pub bandwidth_delta: u64,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
	pub nodes: Vec<NodeCycleReport>,
}

impl ReconcileSummary {
	pub fn count(&self, health: NodeHealth) -> usize {
		self.nodes.iter().filter(|n| n.health == Some(health)).count()
	}

	pub fn skipped(&self) -> usize {
		self.nodes.iter().filter(|n| n.skipped).count()
	}
}

pub struct ReconciliationEngine {
	registry: Arc<NodeRegistry>,
	orchestrator: Arc<Orchestrator>,
	config: ReconcileConfig,
	locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

fn health_after(result: &Result<()>) -> NodeHealth {
	match result {
		Ok(()) => NodeHealth::Active,
		Err(e) if e.is_communication() => NodeHealth::Unreachable,
		Err(_) => NodeHealth::Error,
	}
}

fn is_connected(handshake: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
	handshake.is_some_and(|at| (now - at).num_seconds() <= CONNECTED_HANDSHAKE_WINDOW_SECS)
}

impl ReconciliationEngine {
	pub fn new(registry: Arc<NodeRegistry>, orchestrator: Arc<Orchestrator>, config: ReconcileConfig) -> Self {
		Self {
			registry,
			orchestrator,
			config,
			locks: StdMutex::new(HashMap::new()),
		}
	}

	fn nodes(&self) -> &Arc<dyn NodeStore> {
		self.registry.store()
	}

	fn mirror(&self) -> &Arc<dyn MirrorStore> {
		self.orchestrator.mirror()
	}

	fn lock_for(&self, node_id: i64) -> Arc<Mutex<()>> {
		let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
		locks.entry(node_id).or_default().clone()
	}

	/// Drops the overlap guard of a removed node. A cycle still holding it
	/// finishes undisturbed.
	pub fn forget_node(&self, node_id: i64) {
		let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
		locks.remove(&node_id);
	}

	/// Runs one cycle for every registered node, at most
	/// `max_concurrent_nodes` at a time.
	#[instrument(skip(self))]
	pub async fn run_all(&self) -> Result<ReconcileSummary> {
		let ids: Vec<i64> = self.registry.list_nodes().await?.iter().map(|n| n.id).collect();

		let nodes = stream::iter(ids)
			.map(|id| async move {
				match self.run_node(id).await {
					Ok(report) => report,
					Err(e) => {
						warn!(node_id = id, error = %e, "reconciliation could not run");
						NodeCycleReport {
							node_id: id,
							error: Some(e.to_string()),
							..Default::default()
						}
					}
				}
			})
			.buffer_unordered(self.config.max_concurrent_nodes.max(1))
			.collect::<Vec<_>>()
			.await;

		Ok(ReconcileSummary { nodes })
	}

	/// Runs one cycle for `node_id`, or reports it skipped when a cycle for
	/// the same node is already in flight.
	#[instrument(skip(self))]
	pub async fn run_node(&self, node_id: i64) -> Result<NodeCycleReport> {
		let lock = self.lock_for(node_id);
		let Ok(_guard) = lock.try_lock() else {
			info!(node_id, "reconciliation already running for node, skipping");
			return Ok(NodeCycleReport {
				node_id,
				skipped: true,
				..Default::default()
			});
		};

		let (node, dispatch) = self.registry.dispatch_for(node_id).await?;
		let now = Utc::now();
		let mut report = NodeCycleReport {
			node_id,
			..Default::default()
		};

		let result = self.cycle(&node, &dispatch, now, &mut report).await;
		let health = health_after(&result);
		if let Err(e) = &result {
			warn!(node_id, health = %health, error = %e, "reconciliation cycle failed");
			report.error = Some(e.to_string());
		}

		let synced_at = (health == NodeHealth::Active).then_some(now);
		self.nodes().record_health(node_id, health, synced_at).await?;
		if health != node.health {
			info!(node_id, from = %node.health, to = %health, "node health changed");
		}
		report.health = Some(health);
		Ok(report)
	}

	async fn cycle(
		&self,
		node: &ManagedNode,
		dispatch: &Arc<dyn NodeDispatch>,
		now: DateTime<Utc>,
		report: &mut NodeCycleReport,
	) -> Result<()> {
		self.reset_and_backup(node, dispatch, now, report).await?;
		self.enforce(node, now, report).await?;
		self.account_traffic(node, dispatch, now, report).await?;

		let dashboard = dispatch.call(&DashboardRequest {}).await?;
		let snapshot = serde_json::to_value(&dashboard).map_err(|e| FleetError::Internal(e.to_string()))?;
		self.nodes().cache_dashboard(node.id, &snapshot).await?;
		Ok(())
	}

	async fn reset_and_backup(
		&self,
		node: &ManagedNode,
		dispatch: &Arc<dyn NodeDispatch>,
		now: DateTime<Utc>,
		report: &mut NodeCycleReport,
	) -> Result<()> {
		let reload = match (self.config.reset_interval(), node.last_reset_at) {
			(None, _) => false,
			(Some(_), None) => {
				self.nodes().set_last_reset(node.id, now).await?;
				info!(node_id = node.id, "interface reset timer armed");
				false
			}
			(Some(interval), Some(last)) => now - last >= interval,
		};
		let backup = self.config.backup_enabled;
		if !reload && !backup {
			return Ok(());
		}

		let synced = dispatch
			.call(&SyncRequest {
				reload_interfaces: reload,
				backup,
			})
			.await?;
		if reload {
			self.nodes().set_last_reset(node.id, now).await?;
			info!(node_id = node.id, interfaces = ?synced.reloaded, "interfaces reset");
		}
		report.reloaded = synced.reloaded;
		report.backed_up = synced.backed_up;
		Ok(())
	}

	async fn enforce(&self, node: &ManagedNode, now: DateTime<Utc>, report: &mut NodeCycleReport) -> Result<()> {
		for client in self.mirror().list_clients(node.id).await? {
			let Some(reason) = breach(&client, now) else {
				continue;
			};
			match self.orchestrator.disable_client(&client.name, reason).await {
				Ok(_) => report.disabled.push(DisabledClient {
					name: client.name,
					reason,
				}),
				Err(e) if e.is_communication() => return Err(e),
				Err(e) => {
					error!(node_id = node.id, client = %client.name, reason = %reason, error = %e, "failed to disable client");
					report.failures.push(format!("{}: {e}", client.name));
				}
			}
		}
		Ok(())
	}

	async fn account_traffic(
		&self,
		node: &ManagedNode,
		dispatch: &Arc<dyn NodeDispatch>,
		now: DateTime<Utc>,
		report: &mut NodeCycleReport,
	) -> Result<()> {
		let dump = dispatch.call(&TrafficDumpRequest {}).await?;

		let mut delta_total: u64 = 0;
		for client in self.mirror().list_clients(node.id).await? {
			match dump.peers.get(&client.public_key) {
				Some(peer) => {
					let (usage, delta) = apply_sample(&client.usage, peer.rx_bytes, peer.tx_bytes);
					let connected = client.enabled && is_connected(peer.latest_handshake, now);
					self.mirror().record_usage(&client.name, &usage, connected).await?;
					delta_total = delta_total.saturating_add(delta);
				}
				None if client.connected => {
					self.mirror().record_usage(&client.name, &client.usage, false).await?;
				}
				None => {}
			}
		}

		if delta_total > 0 {
			self.nodes().add_bandwidth(node.id, delta_total).await?;
		}
		report.bandwidth_delta = delta_total;
		Ok(())
	}
}
