// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Operator-facing entry points. Every call resolves to an [`Outcome`].

use std::sync::Arc;

use ipnet::Ipv4Net;
use wgfleet_proto::{ClientDetail, CreateClientRequest, UpdateClientRequest, UpdateInterfaceRequest};
use wgfleet_server_db::{ManagedNode, MirrorClient, MirrorInterface, MirrorStore, NewNode, NodeStore, NodeUpdate};

use crate::config::ReconcileConfig;
use crate::dispatch::{DispatchFactory, DispatchPool};
use crate::error::Outcome;
use crate::orchestrator::{Orchestrator, ProvisionedClient};
use crate::reconcile::{NodeCycleReport, ReconciliationEngine};
use crate::registry::{CachedDashboard, NodeRegistry};
use crate::session::{MemorySessionStore, SessionStore};

#[derive(Clone)]
pub struct FleetServices {
	pub registry: Arc<NodeRegistry>,
	pub orchestrator: Arc<Orchestrator>,
	pub engine: Arc<ReconciliationEngine>,
	/// Front-end conversation state, purged by the session purge job.
	pub sessions: Arc<dyn SessionStore>,
}

impl FleetServices {
	pub fn new(
		nodes: Arc<dyn NodeStore>,
		mirror: Arc<dyn MirrorStore>,
		factory: Arc<dyn DispatchFactory>,
		reconcile: ReconcileConfig,
	) -> Self {
		let pool = Arc::new(DispatchPool::new(factory));
		let registry = Arc::new(NodeRegistry::new(nodes, pool));
		let orchestrator = Arc::new(Orchestrator::new(registry.clone(), mirror));
		let engine = Arc::new(ReconciliationEngine::new(registry.clone(), orchestrator.clone(), reconcile));
		Self {
			registry,
			orchestrator,
			engine,
			sessions: Arc::new(MemorySessionStore::new()),
		}
	}

	pub async fn add_node(&self, node: NewNode) -> Outcome<ManagedNode> {
		self.registry.add_node(node).await.into()
	}

	pub async fn update_node(&self, id: i64, update: NodeUpdate) -> Outcome<ManagedNode> {
		self.registry.update_node(id, update).await.into()
	}

	pub async fn remove_node(&self, id: i64) -> Outcome<()> {
		let result = self.registry.remove_node(id).await;
		if result.is_ok() {
			self.engine.forget_node(id);
		}
		result.into()
	}

	pub async fn list_nodes(&self) -> Outcome<Vec<ManagedNode>> {
		self.registry.list_nodes().await.into()
	}

	pub async fn get_node(&self, id: i64) -> Outcome<ManagedNode> {
		self.registry.get_node(id).await.into()
	}

	pub async fn cached_dashboard(&self, id: i64) -> Outcome<CachedDashboard> {
		self.registry.cached_dashboard(id).await.into()
	}

	pub async fn create_interface(&self, node_id: i64, address_range: Ipv4Net, port: u16) -> Outcome<MirrorInterface> {
		self.orchestrator
			.create_interface(node_id, address_range, port)
			.await
			.into()
	}

	pub async fn update_interface(&self, node_id: i64, request: UpdateInterfaceRequest) -> Outcome<MirrorInterface> {
		self.orchestrator.update_interface(node_id, request).await.into()
	}

	pub async fn delete_interface(&self, node_id: i64, index: u32) -> Outcome<Vec<String>> {
		self.orchestrator.delete_interface(node_id, index).await.into()
	}

	pub async fn list_interfaces(&self, node_id: i64) -> Outcome<Vec<MirrorInterface>> {
		self.orchestrator.list_interfaces(node_id).await.into()
	}

	pub async fn create_client(&self, node_id: i64, request: CreateClientRequest) -> Outcome<ProvisionedClient> {
		self.orchestrator.create_client(node_id, request).await.into()
	}

	pub async fn update_client(&self, request: UpdateClientRequest) -> Outcome<MirrorClient> {
		self.orchestrator.update_client(request).await.into()
	}

	pub async fn delete_client(&self, name: &str) -> Outcome<()> {
		self.orchestrator.delete_client(name).await.into()
	}

	pub async fn client_config(&self, name: &str) -> Outcome<String> {
		self.orchestrator.client_config(name).await.into()
	}

	pub async fn client_detail(&self, name: &str) -> Outcome<ClientDetail> {
		self.orchestrator.client_detail(name).await.into()
	}

	pub async fn list_clients(&self, node_id: i64) -> Outcome<Vec<MirrorClient>> {
		self.orchestrator.list_clients(node_id).await.into()
	}

	/// Runs one reconciliation cycle for `node_id` now.
	pub async fn trigger_sync(&self, node_id: i64) -> Outcome<NodeCycleReport> {
		self.engine.run_node(node_id).await.into()
	}
}
