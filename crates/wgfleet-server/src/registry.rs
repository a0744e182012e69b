// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node registry: the durable list of managed nodes and their dispatch clients.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use wgfleet_server_db::{DbError, ManagedNode, NewNode, NodeHealth, NodeStore, NodeUpdate};

use crate::dispatch::{DispatchPool, NodeDispatch, NodeEndpoint};
use crate::error::{FleetError, Result};

/// Last dashboard snapshot as cached by reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct CachedDashboard {
	pub node_id: i64,
	pub health: NodeHealth,
	pub last_synced_at: Option<DateTime<Utc>>,
	pub dashboard: Option<serde_json::Value>,
	pub bandwidth_total: u64,
}

pub struct NodeRegistry {
	store: Arc<dyn NodeStore>,
	pool: Arc<DispatchPool>,
}

impl NodeRegistry {
	pub fn new(store: Arc<dyn NodeStore>, pool: Arc<DispatchPool>) -> Self {
		Self { store, pool }
	}

	pub fn store(&self) -> &Arc<dyn NodeStore> {
		&self.store
	}

	/// Registers a node after its agent answers a health probe.
	#[instrument(skip(self, node), fields(name = %node.name, address = %node.address, port = node.port))]
	pub async fn add_node(&self, node: NewNode) -> Result<ManagedNode> {
		if self.store.get_node_by_name(&node.name).await?.is_some() {
			return Err(FleetError::DuplicateName(node.name));
		}

		match self.pool.probe(&NodeEndpoint::from(&node)).await {
			Ok(health) => {
				info!(version = %health.version, interfaces = health.interface_count, "node answered probe");
			}
			Err(e) => {
				warn!(error = %e, "node failed probe, not registering");
				return Err(FleetError::NodeUnreachable(format!("{}: {e}", node.name)));
			}
		}

		let name = node.name.clone();
		let created = self.store.insert_node(&node).await.map_err(|e| match e {
			DbError::Conflict(_) => FleetError::DuplicateName(name),
			other => other.into(),
		})?;
		info!(node_id = created.id, "node registered");
		Ok(created)
	}

	#[instrument(skip(self, update))]
	pub async fn update_node(&self, id: i64, update: NodeUpdate) -> Result<ManagedNode> {
		let current = self.get_node(id).await?;
		if let Some(name) = update.name.as_deref() {
			if name != current.name && self.store.get_node_by_name(name).await?.is_some() {
				return Err(FleetError::DuplicateName(name.to_string()));
			}
		}

		let updated = self.store.update_node(id, &update).await.map_err(|e| match e {
			DbError::Conflict(_) => FleetError::DuplicateName(update.name.clone().unwrap_or_default()),
			DbError::NotFound(_) => FleetError::NotFound(format!("node {id}")),
			other => other.into(),
		})?;
		self.pool.invalidate(id).await;
		info!(node_id = id, "node updated");
		Ok(updated)
	}

	/// Removes the node and, in the same transaction, everything mirrored under it.
	#[instrument(skip(self))]
	pub async fn remove_node(&self, id: i64) -> Result<()> {
		if !self.store.delete_node(id).await? {
			return Err(FleetError::NotFound(format!("node {id}")));
		}
		self.pool.invalidate(id).await;
		Ok(())
	}

	pub async fn list_nodes(&self) -> Result<Vec<ManagedNode>> {
		Ok(self.store.list_nodes().await?)
	}

	pub async fn get_node(&self, id: i64) -> Result<ManagedNode> {
		self.store
			.get_node(id)
			.await?
			.ok_or_else(|| FleetError::NotFound(format!("node {id}")))
	}

	pub async fn cached_dashboard(&self, id: i64) -> Result<CachedDashboard> {
		let node = self.get_node(id).await?;
		Ok(CachedDashboard {
			node_id: node.id,
			health: node.health,
			last_synced_at: node.last_synced_at,
			dashboard: node.dashboard,
			bandwidth_total: node.bandwidth_total,
		})
	}

	/// Resolves a node for dispatch; unknown ids are `NodeNotFound`.
	pub async fn dispatch_for(&self, id: i64) -> Result<(ManagedNode, Arc<dyn NodeDispatch>)> {
		let node = self.store.get_node(id).await?.ok_or(FleetError::NodeNotFound(id))?;
		let client = self.pool.for_node(&node).await;
		Ok((node, client))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{FakeFleet, FakeNode};
	use wgfleet_common_secret::SecretString;
	use wgfleet_server_db::testing::{create_test_pool, sample_node};
	use wgfleet_server_db::NodeRepository;

	async fn registry() -> (NodeRegistry, Arc<FakeFleet>) {
		let fleet = Arc::new(FakeFleet::new());
		let pool = Arc::new(DispatchPool::new(fleet.clone()));
		let store = Arc::new(NodeRepository::new(create_test_pool().await));
		(NodeRegistry::new(store, pool), fleet)
	}

	#[tokio::test]
	async fn node_failing_probe_is_never_listed() {
		let (registry, _fleet) = registry().await;

		let err = registry.add_node(sample_node("edge-1")).await.unwrap_err();
		assert!(matches!(err, FleetError::NodeUnreachable(_)));
		assert!(registry.list_nodes().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn probe_rejected_key_is_unreachable() {
		let (registry, fleet) = registry().await;
		let node = fleet.add(&sample_node("edge-1"));
		node.set_failure(
			wgfleet_proto::Operation::Health,
			crate::dispatch::DispatchError::Unauthorized,
		);

		let err = registry.add_node(sample_node("edge-1")).await.unwrap_err();
		assert!(matches!(err, FleetError::NodeUnreachable(_)));
		assert!(registry.list_nodes().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn duplicate_name_is_rejected_before_probing() {
		let (registry, fleet) = registry().await;
		let node: Arc<FakeNode> = fleet.add(&sample_node("edge-1"));
		registry.add_node(sample_node("edge-1")).await.unwrap();
		let probes = node.calls().len();

		let err = registry.add_node(sample_node("edge-1")).await.unwrap_err();
		assert!(matches!(err, FleetError::DuplicateName(name) if name == "edge-1"));
		assert_eq!(node.calls().len(), probes);
	}

	#[tokio::test]
	async fn rename_onto_existing_name_fails() {
		let (registry, fleet) = registry().await;
		fleet.add(&sample_node("edge-1"));
		let a = registry.add_node(sample_node("edge-1")).await.unwrap();
		let mut second = sample_node("edge-2");
		second.address = "192.0.2.11".to_string();
		fleet.add(&second);
		registry.add_node(second).await.unwrap();

		let err = registry
			.update_node(
				a.id,
				NodeUpdate {
					name: Some("edge-2".into()),
					..Default::default()
				},
			)
			.await
			.unwrap_err();
		assert!(matches!(err, FleetError::DuplicateName(_)));

		let err = registry.update_node(999, NodeUpdate::default()).await.unwrap_err();
		assert!(matches!(err, FleetError::NotFound(_)));
	}

	#[tokio::test]
	async fn update_rebuilds_dispatch_with_new_credentials() {
		let (registry, fleet) = registry().await;
		fleet.add(&sample_node("edge-1"));
		let node = registry.add_node(sample_node("edge-1")).await.unwrap();

		registry.dispatch_for(node.id).await.unwrap();
		registry.dispatch_for(node.id).await.unwrap();
		let builds = fleet.builds();

		registry
			.update_node(
				node.id,
				NodeUpdate {
					api_key: Some(SecretString::new("rotated".to_string())),
					..Default::default()
				},
			)
			.await
			.unwrap();
		registry.dispatch_for(node.id).await.unwrap();
		assert_eq!(fleet.builds(), builds + 1);
		assert_eq!(fleet.last_api_key().as_deref(), Some("rotated"));
	}

	#[tokio::test]
	async fn remove_and_lookup_errors() {
		let (registry, fleet) = registry().await;
		fleet.add(&sample_node("edge-1"));
		let node = registry.add_node(sample_node("edge-1")).await.unwrap();

		registry.remove_node(node.id).await.unwrap();
		assert!(matches!(
			registry.remove_node(node.id).await.unwrap_err(),
			FleetError::NotFound(_)
		));
		assert!(matches!(
			registry.dispatch_for(node.id).await.err(),
			Some(FleetError::NodeNotFound(id)) if id == node.id
		));
	}

	#[tokio::test]
	async fn cached_dashboard_reads_without_dispatch() {
		let (registry, fleet) = registry().await;
		let fake = fleet.add(&sample_node("edge-1"));
		let node = registry.add_node(sample_node("edge-1")).await.unwrap();
		let calls = fake.calls().len();

		let cached = registry.cached_dashboard(node.id).await.unwrap();
		assert!(cached.dashboard.is_none());
		assert_eq!(cached.health, NodeHealth::Active);
		assert_eq!(fake.calls().len(), calls);
	}
}
