// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dual-write coordinator for interface and client mutations.
//!
//! Every mutation validates against the mirror, calls the node, and only
//! after the node confirms does it touch the mirror. A node failure leaves the
//! mirror as it was; a mirror failure after the node applied the change is a
//! [`FleetError::MirrorDesync`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use ipnet::Ipv4Net;
use serde::Serialize;
use tracing::{error, info, instrument};
use wgfleet_proto::{
	AgentCall, ClientConfigRequest, ClientDetail, ClientDetailRequest, CreateClientRequest, CreateInterfaceRequest,
	DeleteClientRequest, DeleteInterfaceRequest, UpdateClientRequest, UpdateInterfaceRequest,
};
use wgfleet_server_db::{
	ClientPatch, DbError, InterfacePatch, ManagedNode, MirrorClient, MirrorInterface, MirrorStore, UsageRecord,
};

use crate::dispatch::{DispatchError, NodeDispatch};
use crate::error::{FleetError, Result};
use crate::registry::NodeRegistry;
use crate::usage::DisableReason;

/// Mirror record of a new client plus the profile the node generated for it.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedClient {
	pub client: MirrorClient,
	pub config: String,
}

pub struct Orchestrator {
	registry: Arc<NodeRegistry>,
	mirror: Arc<dyn MirrorStore>,
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
	a.contains(&b.network()) || b.contains(&a.network())
}

/// Whether `address` stays a valid client host under gateway range `range`.
fn hosts_client(range: &Ipv4Net, address: std::net::Ipv4Addr) -> bool {
	range.contains(&address)
		&& address != range.addr()
		&& address != range.network()
		&& address != range.broadcast()
}

/// Client addresses a range can hand out: host offsets from 2 up to 254,
/// below broadcast, minus the gateway.
fn client_capacity(range: &Ipv4Net) -> usize {
	let network = u32::from(range.network());
	let broadcast = u32::from(range.broadcast());
	(2u32..255)
		.map(|offset| network.saturating_add(offset))
		.take_while(|candidate| *candidate < broadcast)
		.filter(|candidate| *candidate != u32::from(range.addr()))
		.count()
}

impl Orchestrator {
	pub fn new(registry: Arc<NodeRegistry>, mirror: Arc<dyn MirrorStore>) -> Self {
		Self { registry, mirror }
	}

	pub fn mirror(&self) -> &Arc<dyn MirrorStore> {
		&self.mirror
	}

	/// Runs one call on `node`. A mutating call that times out or loses its
	/// connection after sending has an unknown outcome and is reported as
	/// indeterminate.
	async fn remote<C: AgentCall>(
		&self,
		node: &ManagedNode,
		dispatch: &Arc<dyn NodeDispatch>,
		request: &C,
	) -> Result<C::Response> {
		match dispatch.call(request).await {
			Ok(response) => Ok(response),
			Err(e @ (DispatchError::Timeout(_) | DispatchError::Interrupted(_))) if C::OPERATION.is_mutating() => {
				error!(
					node_id = node.id,
					operation = %C::OPERATION,
					error = %e,
					"mutating call did not complete, outcome unknown; mirror left unchanged"
				);
				Err(FleetError::Indeterminate {
					operation: C::OPERATION.to_string(),
				})
			}
			Err(e) => Err(e.into()),
		}
	}

	fn desync(node_id: i64, operation: &str, e: DbError) -> FleetError {
		error!(node_id, operation, error = %e, "node applied change but mirror write failed");
		FleetError::MirrorDesync {
			operation: operation.to_string(),
			detail: e.to_string(),
		}
	}

	async fn existing_client(&self, name: &str) -> Result<MirrorClient> {
		self.mirror
			.get_client(name)
			.await?
			.ok_or_else(|| FleetError::NotFound(format!("client '{name}'")))
	}

	async fn existing_interface(&self, node_id: i64, index: u32) -> Result<MirrorInterface> {
		self.mirror
			.get_interface(node_id, index)
			.await?
			.ok_or_else(|| FleetError::NotFound(format!("interface wg{index} on node {node_id}")))
	}

	#[instrument(skip(self))]
	pub async fn create_interface(&self, node_id: i64, address_range: Ipv4Net, port: u16) -> Result<MirrorInterface> {
		let (node, dispatch) = self.registry.dispatch_for(node_id).await?;

		for existing in self.mirror.list_interfaces(node_id).await? {
			if existing.port == port {
				return Err(FleetError::Conflict(format!(
					"port {port} is already used by wg{}",
					existing.index
				)));
			}
			if overlaps(&existing.address_range, &address_range) {
				return Err(FleetError::Conflict(format!(
					"{address_range} overlaps wg{} ({})",
					existing.index, existing.address_range
				)));
			}
		}

		let created = self
			.remote(&node, &dispatch, &CreateInterfaceRequest { address_range, port })
			.await?;

		let iface = MirrorInterface {
			node_id,
			index: created.index,
			public_key: created.public_key.to_base64(),
			port,
			address_range,
			enabled: true,
		};
		self.mirror
			.insert_interface(&iface)
			.await
			.map_err(|e| Self::desync(node_id, "interface_create", e))?;

		info!(node_id, interface = iface.index, "interface created");
		Ok(iface)
	}

	#[instrument(skip(self, request), fields(interface = request.index))]
	pub async fn update_interface(&self, node_id: i64, request: UpdateInterfaceRequest) -> Result<MirrorInterface> {
		let (node, dispatch) = self.registry.dispatch_for(node_id).await?;
		let current = self.existing_interface(node_id, request.index).await?;

		for other in self.mirror.list_interfaces(node_id).await? {
			if other.index == current.index {
				continue;
			}
			if request.port == Some(other.port) {
				return Err(FleetError::Conflict(format!("port {} is already used by wg{}", other.port, other.index)));
			}
			if let Some(range) = request.address_range {
				if overlaps(&other.address_range, &range) {
					return Err(FleetError::Conflict(format!("{range} overlaps wg{}", other.index)));
				}
			}
		}

		if let Some(range) = request.address_range {
			for client in self.mirror.list_clients(node_id).await? {
				if client.interface_index == current.index && !hosts_client(&range, client.address) {
					return Err(FleetError::Conflict(format!(
						"client '{}' at {} would fall outside {range}",
						client.name, client.address
					)));
				}
			}
		}

		self.remote(&node, &dispatch, &request).await?;

		let patch = InterfacePatch {
			address_range: request.address_range,
			port: request.port,
			enabled: request.enabled,
		};
		self.mirror
			.update_interface(node_id, request.index, &patch)
			.await
			.map_err(|e| Self::desync(node_id, "interface_update", e))?;

		Ok(MirrorInterface {
			address_range: patch.address_range.unwrap_or(current.address_range),
			port: patch.port.unwrap_or(current.port),
			enabled: patch.enabled.unwrap_or(current.enabled),
			..current
		})
	}

	/// Deletes the interface on the node, then it and its clients from the
	/// mirror. Returns the names of the removed clients.
	#[instrument(skip(self))]
	pub async fn delete_interface(&self, node_id: i64, index: u32) -> Result<Vec<String>> {
		let (node, dispatch) = self.registry.dispatch_for(node_id).await?;
		self.existing_interface(node_id, index).await?;

		let deleted = self.remote(&node, &dispatch, &DeleteInterfaceRequest { index }).await?;

		let removed = self
			.mirror
			.delete_interface(node_id, index)
			.await
			.map_err(|e| Self::desync(node_id, "interface_delete", e))?;

		let on_node: HashSet<&String> = deleted.removed_clients.iter().collect();
		let only_in_mirror: Vec<&String> = removed.iter().filter(|n| !on_node.contains(n)).collect();
		if !only_in_mirror.is_empty() {
			info!(node_id, interface = index, clients = ?only_in_mirror, "mirror had clients the node did not report");
		}
		info!(node_id, interface = index, clients = removed.len(), "interface deleted");
		Ok(removed)
	}

	#[instrument(skip(self, request), fields(client = %request.name, interface = request.interface_index))]
	pub async fn create_client(&self, node_id: i64, request: CreateClientRequest) -> Result<ProvisionedClient> {
		let (node, dispatch) = self.registry.dispatch_for(node_id).await?;

		if self.mirror.get_client(&request.name).await?.is_some() {
			return Err(FleetError::Conflict(format!("client '{}' already exists", request.name)));
		}
		let iface = self.existing_interface(node_id, request.interface_index).await?;
		let on_interface = self
			.mirror
			.list_clients(node_id)
			.await?
			.iter()
			.filter(|c| c.interface_index == iface.index)
			.count();
		if on_interface >= client_capacity(&iface.address_range) {
			return Err(FleetError::SubnetExhausted(iface.address_range.trunc().to_string()));
		}

		let created = self.remote(&node, &dispatch, &request).await?;

		let client = MirrorClient {
			name: created.name,
			node_id,
			interface_index: request.interface_index,
			public_key: created.public_key.to_base64(),
			address: created.address,
			created_at: Utc::now(),
			expires_at: request.expires_at,
			quota_bytes: request.quota_bytes,
			note: request.note,
			enabled: true,
			connected: false,
			usage: UsageRecord::default(),
		};
		self.mirror
			.insert_client(&client)
			.await
			.map_err(|e| Self::desync(node_id, "client_create", e))?;

		info!(node_id, address = %client.address, "client created");
		Ok(ProvisionedClient {
			client,
			config: created.config,
		})
	}

	#[instrument(skip(self, request), fields(client = %request.name))]
	pub async fn update_client(&self, request: UpdateClientRequest) -> Result<MirrorClient> {
		let current = self.existing_client(&request.name).await?;
		let (node, dispatch) = self.registry.dispatch_for(current.node_id).await?;

		self.remote(&node, &dispatch, &request).await?;

		let patch = ClientPatch {
			expires_at: request.expires_at,
			quota_bytes: request.quota_bytes,
			enabled: request.enabled,
			note: request.note,
		};
		self.mirror
			.update_client(&request.name, &patch)
			.await
			.map_err(|e| Self::desync(node.id, "client_update", e))?;

		let enabled = patch.enabled.unwrap_or(current.enabled);
		Ok(MirrorClient {
			expires_at: patch.expires_at.unwrap_or(current.expires_at),
			quota_bytes: patch.quota_bytes.unwrap_or(current.quota_bytes),
			note: patch.note.unwrap_or_else(|| current.note.clone()),
			connected: current.connected && enabled,
			enabled,
			..current
		})
	}

	/// Disables a client on its node and in the mirror, keeping the record.
	pub async fn disable_client(&self, name: &str, reason: DisableReason) -> Result<MirrorClient> {
		let disabled = self.update_client(UpdateClientRequest::disable(name)).await?;
		info!(client = name, reason = %reason, "client disabled");
		Ok(disabled)
	}

	#[instrument(skip(self))]
	pub async fn delete_client(&self, name: &str) -> Result<()> {
		let current = self.existing_client(name).await?;
		let (node, dispatch) = self.registry.dispatch_for(current.node_id).await?;

		self.remote(&node, &dispatch, &DeleteClientRequest { name: name.to_string() })
			.await?;

		self.mirror
			.delete_client(name)
			.await
			.map_err(|e| Self::desync(node.id, "client_delete", e))?;
		info!(node_id = node.id, "client deleted");
		Ok(())
	}

	pub async fn client_config(&self, name: &str) -> Result<String> {
		let current = self.existing_client(name).await?;
		let (node, dispatch) = self.registry.dispatch_for(current.node_id).await?;
		let profile = self
			.remote(&node, &dispatch, &ClientConfigRequest { name: name.to_string() })
			.await?;
		Ok(profile.config)
	}

	pub async fn client_detail(&self, name: &str) -> Result<ClientDetail> {
		let current = self.existing_client(name).await?;
		let (node, dispatch) = self.registry.dispatch_for(current.node_id).await?;
		self.remote(&node, &dispatch, &ClientDetailRequest { name: name.to_string() })
			.await
	}

	pub async fn list_clients(&self, node_id: i64) -> Result<Vec<MirrorClient>> {
		self.registry.dispatch_for(node_id).await?;
		Ok(self.mirror.list_clients(node_id).await?)
	}

	pub async fn list_interfaces(&self, node_id: i64) -> Result<Vec<MirrorInterface>> {
		self.registry.dispatch_for(node_id).await?;
		Ok(self.mirror.list_interfaces(node_id).await?)
	}
}
