// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory node agents for tests.
//!
//! [`FakeNode`] answers every agent operation from a small model of
//! interfaces and clients; faults can be injected per operation.
//! [`FakeFleet`] hands out fake nodes by endpoint as a [`DispatchFactory`].

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use wgfleet_proto::{
	ClientConfig, ClientConfigRequest, ClientDetail, ClientDetailRequest, CreateClientRequest, CreateInterfaceRequest,
	CreatedClient, CreatedInterface, DashboardStats, DeleteClientRequest, DeleteInterfaceRequest, DeletedInterface,
	Empty, ErrorCode, HealthInfo, Operation, PeerTraffic, SyncReport, SyncRequest, TrafficDump, UpdateClientRequest,
	UpdateInterfaceRequest, WgPublicKey,
};
use wgfleet_server_db::NewNode;

use crate::dispatch::{DispatchError, DispatchFactory, NodeDispatch, NodeEndpoint};

#[derive(Debug, Clone)]
pub struct FakeInterface {
	pub address_range: Ipv4Net,
	pub port: u16,
	pub enabled: bool,
	pub public_key: WgPublicKey,
}

#[derive(Debug, Clone)]
pub struct FakeClient {
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
}

#[derive(Debug, Default)]
struct FakeNodeState {
	interfaces: BTreeMap<u32, FakeInterface>,
	clients: BTreeMap<String, FakeClient>,
	calls: Vec<Operation>,
	syncs: Vec<SyncRequest>,
	failures: HashMap<Operation, DispatchError>,
	delays: HashMap<Operation, Duration>,
	unreachable: bool,
	next_key: u8,
}

#[derive(Debug, Default)]
pub struct FakeNode {
	state: Mutex<FakeNodeState>,
}

fn node_error(code: ErrorCode, message: impl Into<String>) -> DispatchError {
	DispatchError::Node {
		message: message.into(),
		code: Some(code),
	}
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, DispatchError> {
	serde_json::from_value(body).map_err(|e| node_error(ErrorCode::BadRequest, e.to_string()))
}

fn encode<T: Serialize>(value: T) -> Result<Value, DispatchError> {
	serde_json::to_value(value).map_err(|e| DispatchError::Protocol(e.to_string()))
}

impl FakeNode {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, FakeNodeState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Operations received, in order, including failed ones.
	pub fn calls(&self) -> Vec<Operation> {
		self.state().calls.clone()
	}

	pub fn count(&self, operation: Operation) -> usize {
		self.state().calls.iter().filter(|op| **op == operation).count()
	}

	pub fn syncs(&self) -> Vec<SyncRequest> {
		self.state().syncs.clone()
	}

	pub fn client(&self, name: &str) -> Option<FakeClient> {
		self.state().clients.get(name).cloned()
	}

	pub fn client_names(&self) -> Vec<String> {
		self.state().clients.keys().cloned().collect()
	}

	pub fn interface(&self, index: u32) -> Option<FakeInterface> {
		self.state().interfaces.get(&index).cloned()
	}

	pub fn set_counters(&self, name: &str, rx: u64, tx: u64, handshake: Option<DateTime<Utc>>) {
		if let Some(client) = self.state().clients.get_mut(name) {
			client.rx_bytes = rx;
			client.tx_bytes = tx;
			client.latest_handshake = handshake;
		}
	}

	/// Makes every later `operation` fail with `error` without side effects.
	pub fn set_failure(&self, operation: Operation, error: DispatchError) {
		self.state().failures.insert(operation, error);
	}

	pub fn set_timeout(&self, operation: Operation) {
		self.set_failure(operation, DispatchError::Timeout(Duration::from_secs(30)));
	}

	pub fn clear_failures(&self) {
		let mut state = self.state();
		state.failures.clear();
		state.unreachable = false;
	}

	/// Refuses every connection, as a powered-off node would.
	pub fn set_unreachable(&self, unreachable: bool) {
		self.state().unreachable = unreachable;
	}

	pub fn set_delay(&self, operation: Operation, delay: Duration) {
		self.state().delays.insert(operation, delay);
	}

	fn allocate(state: &FakeNodeState, index: u32, range: &Ipv4Net) -> Option<Ipv4Addr> {
		let network = u32::from(range.network());
		let broadcast = u32::from(range.broadcast());
		(2u32..255)
			.map(|offset| network.saturating_add(offset))
			.take_while(|candidate| *candidate < broadcast)
			.map(Ipv4Addr::from)
			.filter(|candidate| *candidate != range.addr())
			.find(|candidate| {
				!state
					.clients
					.values()
					.any(|c| c.interface_index == index && c.address == *candidate)
			})
	}

	fn next_key(state: &mut FakeNodeState) -> WgPublicKey {
		state.next_key = state.next_key.wrapping_add(1);
		WgPublicKey::from_bytes([state.next_key; 32])
	}

	fn handle(state: &mut FakeNodeState, operation: Operation, body: Value) -> Result<Value, DispatchError> {
		match operation {
			Operation::Health => encode(HealthInfo {
				version: "fake".to_string(),
				interface_count: state.interfaces.len() as u32,
				client_count: state.clients.len() as u32,
			}),
			Operation::Dashboard => encode(DashboardStats {
				client_count: state.clients.len() as u64,
				bandwidth_total: state.clients.values().map(|c| c.rx_bytes + c.tx_bytes).sum(),
				status: true,
				..Default::default()
			}),
			Operation::TrafficDump => {
				let mut dump = TrafficDump::default();
				for client in state.clients.values().filter(|c| c.enabled) {
					dump.peers.insert(
						client.public_key.to_base64(),
						PeerTraffic {
							interface: format!("wg{}", client.interface_index),
							rx_bytes: client.rx_bytes,
							tx_bytes: client.tx_bytes,
							latest_handshake: client.latest_handshake,
							endpoint: None,
						},
					);
				}
				encode(dump)
			}
			Operation::Sync => {
				let req: SyncRequest = decode(body)?;
				let enabled: Vec<u32> = state
					.interfaces
					.iter()
					.filter(|(_, i)| i.enabled)
					.map(|(idx, _)| *idx)
					.collect();
				let report = SyncReport {
					reloaded: if req.reload_interfaces { enabled } else { Vec::new() },
					backed_up: if req.backup {
						state.interfaces.keys().copied().collect()
					} else {
						Vec::new()
					},
				};
				state.syncs.push(req);
				encode(report)
			}
			Operation::InterfaceCreate => {
				let req: CreateInterfaceRequest = decode(body)?;
				if state.interfaces.values().any(|i| i.port == req.port) {
					return Err(node_error(ErrorCode::Conflict, format!("port {} in use", req.port)));
				}
				let index = (0u32..).find(|i| !state.interfaces.contains_key(i)).unwrap_or_default();
				let public_key = Self::next_key(state);
				state.interfaces.insert(
					index,
					FakeInterface {
						address_range: req.address_range,
						port: req.port,
						enabled: true,
						public_key,
					},
				);
				encode(CreatedInterface { index, public_key })
			}
			Operation::InterfaceUpdate => {
				let req: UpdateInterfaceRequest = decode(body)?;
				let iface = state
					.interfaces
					.get_mut(&req.index)
					.ok_or_else(|| node_error(ErrorCode::NotFound, format!("interface wg{} not found", req.index)))?;
				if let Some(range) = req.address_range {
					iface.address_range = range;
				}
				if let Some(port) = req.port {
					iface.port = port;
				}
				if let Some(enabled) = req.enabled {
					iface.enabled = enabled;
				}
				encode(Empty {})
			}
			Operation::InterfaceDelete => {
				let req: DeleteInterfaceRequest = decode(body)?;
				if state.interfaces.remove(&req.index).is_none() {
					return Err(node_error(ErrorCode::NotFound, format!("interface wg{} not found", req.index)));
				}
				let removed: Vec<String> = state
					.clients
					.iter()
					.filter(|(_, c)| c.interface_index == req.index)
					.map(|(name, _)| name.clone())
					.collect();
				for name in &removed {
					state.clients.remove(name);
				}
				encode(DeletedInterface {
					removed_clients: removed,
				})
			}
			Operation::ClientCreate => {
				let req: CreateClientRequest = decode(body)?;
				if state.clients.contains_key(&req.name) {
					return Err(node_error(ErrorCode::Conflict, format!("client '{}' already exists", req.name)));
				}
				let range = state
					.interfaces
					.get(&req.interface_index)
					.map(|i| i.address_range)
					.ok_or_else(|| {
						node_error(ErrorCode::NotFound, format!("interface wg{} not found", req.interface_index))
					})?;
				let address = Self::allocate(state, req.interface_index, &range)
					.ok_or_else(|| node_error(ErrorCode::SubnetExhausted, format!("{} is full", range.trunc())))?;
				let public_key = Self::next_key(state);
				state.clients.insert(
					req.name.clone(),
					FakeClient {
						interface_index: req.interface_index,
						public_key,
						address,
						enabled: true,
						created_at: Utc::now(),
						expires_at: req.expires_at,
						quota_bytes: req.quota_bytes,
						note: req.note,
						rx_bytes: 0,
						tx_bytes: 0,
						latest_handshake: None,
					},
				);
				encode(CreatedClient {
					config: format!("[Interface]\nAddress = {address}/32\n"),
					name: req.name,
					public_key,
					address,
				})
			}
			Operation::ClientUpdate => {
				let req: UpdateClientRequest = decode(body)?;
				let client = state
					.clients
					.get_mut(&req.name)
					.ok_or_else(|| node_error(ErrorCode::NotFound, format!("client '{}' not found", req.name)))?;
				if let Some(expires_at) = req.expires_at {
					client.expires_at = expires_at;
				}
				if let Some(quota) = req.quota_bytes {
					client.quota_bytes = quota;
				}
				if let Some(enabled) = req.enabled {
					client.enabled = enabled;
				}
				if let Some(note) = req.note {
					client.note = note;
				}
				encode(Empty {})
			}
			Operation::ClientDelete => {
				let req: DeleteClientRequest = decode(body)?;
				state
					.clients
					.remove(&req.name)
					.ok_or_else(|| node_error(ErrorCode::NotFound, format!("client '{}' not found", req.name)))?;
				encode(Empty {})
			}
			Operation::ClientConfig => {
				let req: ClientConfigRequest = decode(body)?;
				let client = state
					.clients
					.get(&req.name)
					.ok_or_else(|| node_error(ErrorCode::NotFound, format!("client '{}' not found", req.name)))?;
				encode(ClientConfig {
					config: format!("[Interface]\nAddress = {}/32\n", client.address),
				})
			}
			Operation::ClientDetail => {
				let req: ClientDetailRequest = decode(body)?;
				let client = state
					.clients
					.get(&req.name)
					.ok_or_else(|| node_error(ErrorCode::NotFound, format!("client '{}' not found", req.name)))?;
				encode(ClientDetail {
					name: req.name.clone(),
					interface_index: client.interface_index,
					public_key: client.public_key,
					address: client.address,
					enabled: client.enabled,
					created_at: client.created_at,
					expires_at: client.expires_at,
					quota_bytes: client.quota_bytes,
					note: client.note.clone(),
					rx_bytes: client.rx_bytes,
					tx_bytes: client.tx_bytes,
					latest_handshake: client.latest_handshake,
					endpoint: None,
				})
			}
		}
	}
}

#[async_trait]
impl NodeDispatch for FakeNode {
	async fn invoke(&self, operation: Operation, body: Value) -> Result<Value, DispatchError> {
		let delay = {
			let mut state = self.state();
			state.calls.push(operation);
			state.delays.get(&operation).copied()
		};
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}

		let mut state = self.state();
		if state.unreachable {
			return Err(DispatchError::Transport("connection refused".to_string()));
		}
		if let Some(error) = state.failures.get(&operation) {
			return Err(error.clone());
		}
		Self::handle(&mut state, operation, body)
	}
}

/// Dispatch factory resolving endpoints to registered [`FakeNode`]s by base
/// URL. Unknown endpoints refuse connections.
#[derive(Default)]
pub struct FakeFleet {
	nodes: Mutex<HashMap<String, Arc<FakeNode>>>,
	builds: Mutex<Vec<String>>,
}

impl FakeFleet {
	pub fn new() -> Self {
		Self::default()
	}

	/// Brings up a fake agent at `node`'s address.
	pub fn add(&self, node: &NewNode) -> Arc<FakeNode> {
		let fake = Arc::new(FakeNode::new());
		let endpoint = NodeEndpoint::from(node);
		self.nodes
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(endpoint.base_url, fake.clone());
		fake
	}

	/// Number of dispatch clients built so far, probes included.
	pub fn builds(&self) -> usize {
		self.builds.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn last_api_key(&self) -> Option<String> {
		self.builds.lock().unwrap_or_else(|e| e.into_inner()).last().cloned()
	}
}

impl DispatchFactory for FakeFleet {
	fn build(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeDispatch> {
		self.builds
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push(endpoint.api_key.expose().clone());
		let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
		match nodes.get(&endpoint.base_url) {
			Some(node) => node.clone(),
			None => {
				let down = FakeNode::new();
				down.set_unreachable(true);
				Arc::new(down)
			}
		}
	}
}
