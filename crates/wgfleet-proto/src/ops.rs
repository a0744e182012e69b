// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-operation request and response bodies.
//!
//! Each request type names its operation and its response type through
//! [`AgentCall`], so the dispatch client and the agent router cannot disagree
//! about what goes over a given path.

use crate::keys::WgPublicKey;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Health,
	Dashboard,
	TrafficDump,
	Sync,
	InterfaceCreate,
	InterfaceUpdate,
	InterfaceDelete,
	ClientCreate,
	ClientUpdate,
	ClientDelete,
	ClientConfig,
	ClientDetail,
}

impl Operation {
	pub const ALL: [Operation; 12] = [
		Operation::Health,
		Operation::Dashboard,
		Operation::TrafficDump,
		Operation::Sync,
		Operation::InterfaceCreate,
		Operation::InterfaceUpdate,
		Operation::InterfaceDelete,
		Operation::ClientCreate,
		Operation::ClientUpdate,
		Operation::ClientDelete,
		Operation::ClientConfig,
		Operation::ClientDetail,
	];

	pub fn path(&self) -> &'static str {
		match self {
			Operation::Health => "/agent_api/health",
			Operation::Dashboard => "/agent_api/dashboard",
			Operation::TrafficDump => "/agent_api/traffic/dump",
			Operation::Sync => "/agent_api/sync",
			Operation::InterfaceCreate => "/agent_api/interface/create",
			Operation::InterfaceUpdate => "/agent_api/interface/update",
			Operation::InterfaceDelete => "/agent_api/interface/delete",
			Operation::ClientCreate => "/agent_api/client/create",
			Operation::ClientUpdate => "/agent_api/client/update",
			Operation::ClientDelete => "/agent_api/client/delete",
			Operation::ClientConfig => "/agent_api/client/config",
			Operation::ClientDetail => "/agent_api/client/detail",
		}
	}

	/// Whether the call changes node state. A timed-out mutating call has an
	/// unknown outcome.
	pub fn is_mutating(&self) -> bool {
		matches!(
			self,
			Operation::Sync
				| Operation::InterfaceCreate
				| Operation::InterfaceUpdate
				| Operation::InterfaceDelete
				| Operation::ClientCreate
				| Operation::ClientUpdate
				| Operation::ClientDelete
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Operation::Health => "health",
			Operation::Dashboard => "dashboard",
			Operation::TrafficDump => "traffic_dump",
			Operation::Sync => "sync",
			Operation::InterfaceCreate => "interface_create",
			Operation::InterfaceUpdate => "interface_update",
			Operation::InterfaceDelete => "interface_delete",
			Operation::ClientCreate => "client_create",
			Operation::ClientUpdate => "client_update",
			Operation::ClientDelete => "client_delete",
			Operation::ClientConfig => "client_config",
			Operation::ClientDetail => "client_detail",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Binds a request body to its operation and response body.
pub trait AgentCall: Serialize + DeserializeOwned + Send + Sync + 'static {
	const OPERATION: Operation;
	type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Body for operations that take or return nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthInfo {
	pub version: String,
	pub interface_count: u32,
	pub client_count: u32,
}

impl AgentCall for HealthRequest {
	const OPERATION: Operation = Operation::Health;
	type Response = HealthInfo;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
	pub total_bytes: u64,
	pub available_bytes: u64,
	pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRate {
	pub download_bps: f64,
	pub upload_bps: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
	pub cpu_percent: f64,
	pub memory: MemoryStats,
	pub client_count: u64,
	/// Sum of the live per-peer counters on this node.
	pub bandwidth_total: u64,
	pub uptime_seconds: u64,
	pub status: bool,
	pub alerts: Vec<String>,
	pub network: NetworkRate,
}

impl AgentCall for DashboardRequest {
	const OPERATION: Operation = Operation::Dashboard;
	type Response = DashboardStats;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficDumpRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTraffic {
	pub interface: String,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub latest_handshake: Option<DateTime<Utc>>,
	pub endpoint: Option<String>,
}

/// Raw counters keyed by the peer's base64 public key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDump {
	pub peers: BTreeMap<String, PeerTraffic>,
}

impl AgentCall for TrafficDumpRequest {
	const OPERATION: Operation = Operation::TrafficDump;
	type Response = TrafficDump;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
	pub reload_interfaces: bool,
	pub backup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
	pub reloaded: Vec<u32>,
	pub backed_up: Vec<u32>,
}

impl AgentCall for SyncRequest {
	const OPERATION: Operation = Operation::Sync;
	type Response = SyncReport;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInterfaceRequest {
	/// Gateway form: the node's own host address with the subnet prefix,
	/// e.g. `10.0.0.1/24`. The host part is kept on the wire, and a range
	/// naming the network address (`10.0.0.0/24`) is rejected as a bad
	/// request.
	pub address_range: Ipv4Net,
	pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedInterface {
	pub index: u32,
	pub public_key: WgPublicKey,
}

impl AgentCall for CreateInterfaceRequest {
	const OPERATION: Operation = Operation::InterfaceCreate;
	type Response = CreatedInterface;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInterfaceRequest {
	pub index: u32,
	/// New range in gateway form, as for [`CreateInterfaceRequest`]. Every
	/// existing client must remain a host inside it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub address_range: Option<Ipv4Net>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub port: Option<u16>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub enabled: Option<bool>,
}

impl AgentCall for UpdateInterfaceRequest {
	const OPERATION: Operation = Operation::InterfaceUpdate;
	type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteInterfaceRequest {
	pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedInterface {
	pub removed_clients: Vec<String>,
}

impl AgentCall for DeleteInterfaceRequest {
	const OPERATION: Operation = Operation::InterfaceDelete;
	type Response = DeletedInterface;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClientRequest {
	pub interface_index: u32,
	pub name: String,
	pub expires_at: DateTime<Utc>,
	/// Zero means unlimited.
	#[serde(default)]
	pub quota_bytes: u64,
	#[serde(default)]
	pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedClient {
	pub name: String,
	pub public_key: WgPublicKey,
	pub address: Ipv4Addr,
	/// Ready-to-import client profile.
	pub config: String,
}

impl AgentCall for CreateClientRequest {
	const OPERATION: Operation = Operation::ClientCreate;
	type Response = CreatedClient;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateClientRequest {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub quota_bytes: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub enabled: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub note: Option<String>,
}

impl UpdateClientRequest {
	pub fn disable(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			enabled: Some(false),
			..Default::default()
		}
	}
}

impl AgentCall for UpdateClientRequest {
	const OPERATION: Operation = Operation::ClientUpdate;
	type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteClientRequest {
	pub name: String,
}

impl AgentCall for DeleteClientRequest {
	const OPERATION: Operation = Operation::ClientDelete;
	type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfigRequest {
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
	pub config: String,
}

impl AgentCall for ClientConfigRequest {
	const OPERATION: Operation = Operation::ClientConfig;
	type Response = ClientConfig;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetailRequest {
	pub name: String,
}

/// Stored attributes plus the daemon's live view of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetail {
	pub name: String,
	pub interface_index: u32,
	pub public_key: WgPublicKey,
	pub address: Ipv4Addr,
	pub enabled: bool,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub quota_bytes: u64,
	pub note: String,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub latest_handshake: Option<DateTime<Utc>>,
	pub endpoint: Option<String>,
}

impl AgentCall for ClientDetailRequest {
	const OPERATION: Operation = Operation::ClientDetail;
	type Response = ClientDetail;
}
