// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Remote dispatch: typed RPC calls from the control plane to node agents.
//!
//! [`NodeDispatch`] moves raw JSON for one node; its typed `call` wrapper
//! layers the typed request/response pairing from `wgfleet_proto` on top.
//! Clients are built by a [`DispatchFactory`] and cached per node id in a
//! [`DispatchPool`] until the node's record changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use wgfleet_common_secret::SecretString;
use wgfleet_proto::{
	AgentCall, AgentResponse, EnvelopeError, ErrorCode, HealthInfo, HealthRequest, Operation, API_KEY_HEADER,
};
use wgfleet_server_db::{ManagedNode, NewNode};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
	#[error("node rejected the API key")]
	Unauthorized,

	#[error("no response within {0:?}")]
	Timeout(Duration),

	#[error("{message}")]
	Node { message: String, code: Option<ErrorCode> },

	/// The request never reached the node.
	#[error("transport error: {0}")]
	Transport(String),

	/// The connection failed after the request may have been delivered.
	#[error("connection lost mid-request: {0}")]
	Interrupted(String),

	#[error("undecodable response: {0}")]
	Protocol(String),
}

/// Raw per-node RPC. One implementation talks HTTP; tests substitute fakes.
#[async_trait]
pub trait NodeDispatch: Send + Sync {
	async fn invoke(&self, operation: Operation, body: Value) -> Result<Value, DispatchError>;
}

impl dyn NodeDispatch {
	pub async fn call<C: AgentCall>(&self, request: &C) -> Result<C::Response, DispatchError> {
		let body = serde_json::to_value(request)
			.map_err(|e| DispatchError::Protocol(format!("cannot encode {} request: {e}", C::OPERATION)))?;
		let data = self.invoke(C::OPERATION, body).await?;
		serde_json::from_value(data)
			.map_err(|e| DispatchError::Protocol(format!("cannot decode {} response: {e}", C::OPERATION)))
	}
}

/// Where and how to reach one node's agent.
#[derive(Debug, Clone)]
pub struct NodeEndpoint {
	pub node_id: Option<i64>,
	pub base_url: String,
	pub api_key: SecretString,
}

impl From<&ManagedNode> for NodeEndpoint {
	fn from(node: &ManagedNode) -> Self {
		Self {
			node_id: Some(node.id),
			base_url: node.base_url(),
			api_key: node.api_key.clone(),
		}
	}
}

impl From<&NewNode> for NodeEndpoint {
	fn from(node: &NewNode) -> Self {
		Self {
			node_id: None,
			base_url: format!("http://{}:{}", node.address, node.port),
			api_key: node.api_key.clone(),
		}
	}
}

pub struct RemoteDispatchClient {
	http: Client,
	timeout: Duration,
	endpoint: NodeEndpoint,
}

impl RemoteDispatchClient {
	/// `http` must already carry `timeout` as its request bound.
	pub fn new(http: Client, timeout: Duration, endpoint: NodeEndpoint) -> Self {
		Self {
			http,
			timeout,
			endpoint,
		}
	}

	fn send_error(&self, e: reqwest::Error) -> DispatchError {
		// A connect failure means nothing reached the node, even when it was the
		// connect timeout that fired.
		if e.is_connect() || e.is_builder() {
			DispatchError::Transport(e.to_string())
		} else if e.is_timeout() {
			DispatchError::Timeout(self.timeout)
		} else {
			DispatchError::Interrupted(e.to_string())
		}
	}
}

#[async_trait]
impl NodeDispatch for RemoteDispatchClient {
	#[instrument(skip(self, body), fields(node_id = ?self.endpoint.node_id, operation = %operation))]
	async fn invoke(&self, operation: Operation, body: Value) -> Result<Value, DispatchError> {
		let url = format!("{}{}", self.endpoint.base_url, operation.path());
		let response = self
			.http
			.post(&url)
			.header(API_KEY_HEADER, self.endpoint.api_key.expose().as_str())
			.json(&body)
			.send()
			.await
			.map_err(|e| self.send_error(e))?;

		let status = response.status();
		if status == StatusCode::UNAUTHORIZED {
			warn!(url = %url, "node rejected API key");
			return Err(DispatchError::Unauthorized);
		}

		let bytes = response.bytes().await.map_err(|e| self.send_error(e))?;
		let envelope: AgentResponse<Value> = serde_json::from_slice(&bytes)
			.map_err(|e| DispatchError::Protocol(format!("HTTP {status}: {e}")))?;

		debug!(status = %status, ok = envelope.ok, "node responded");
		envelope.into_result().map_err(|e| match e {
			EnvelopeError::Failed { message, code } => DispatchError::Node { message, code },
			EnvelopeError::MissingData => DispatchError::Protocol(e.to_string()),
		})
	}
}

pub trait DispatchFactory: Send + Sync {
	fn build(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeDispatch>;
}

/// Builds [`RemoteDispatchClient`]s sharing one connection pool.
pub struct HttpDispatchFactory {
	http: Client,
	timeout: Duration,
}

impl HttpDispatchFactory {
	pub fn new(timeout: Duration) -> reqwest::Result<Self> {
		Ok(Self {
			http: wgfleet_common_http::client_with_timeout(timeout)?,
			timeout,
		})
	}
}

impl DispatchFactory for HttpDispatchFactory {
	fn build(&self, endpoint: &NodeEndpoint) -> Arc<dyn NodeDispatch> {
		Arc::new(RemoteDispatchClient::new(
			self.http.clone(),
			self.timeout,
			endpoint.clone(),
		))
	}
}

/// Per-node cache of dispatch clients.
pub struct DispatchPool {
	factory: Arc<dyn DispatchFactory>,
	clients: RwLock<HashMap<i64, Arc<dyn NodeDispatch>>>,
}

impl DispatchPool {
	pub fn new(factory: Arc<dyn DispatchFactory>) -> Self {
		Self {
			factory,
			clients: RwLock::new(HashMap::new()),
		}
	}

	pub async fn for_node(&self, node: &ManagedNode) -> Arc<dyn NodeDispatch> {
		if let Some(client) = self.clients.read().await.get(&node.id) {
			return client.clone();
		}
		let mut clients = self.clients.write().await;
		clients
			.entry(node.id)
			.or_insert_with(|| self.factory.build(&NodeEndpoint::from(node)))
			.clone()
	}

	pub async fn invalidate(&self, node_id: i64) {
		if self.clients.write().await.remove(&node_id).is_some() {
			debug!(node_id, "dispatch client invalidated");
		}
	}

	/// Health-checks an endpoint with an uncached client.
	pub async fn probe(&self, endpoint: &NodeEndpoint) -> Result<HealthInfo, DispatchError> {
		let client = self.factory.build(endpoint);
		client.call(&HealthRequest {}).await
	}

	pub async fn cached(&self) -> usize {
		self.clients.read().await.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use wgfleet_server_db::testing::sample_node;

	struct Echo;

	#[async_trait]
	impl NodeDispatch for Echo {
		async fn invoke(&self, operation: Operation, body: Value) -> Result<Value, DispatchError> {
			match operation {
				Operation::Health => Ok(serde_json::json!({
					"version": "test",
					"interface_count": 1,
					"client_count": 2
				})),
				_ => Ok(body),
			}
		}
	}

	#[derive(Default)]
	struct CountingFactory {
		built: AtomicUsize,
	}

	impl DispatchFactory for CountingFactory {
		fn build(&self, _endpoint: &NodeEndpoint) -> Arc<dyn NodeDispatch> {
			self.built.fetch_add(1, Ordering::SeqCst);
			Arc::new(Echo)
		}
	}

	fn managed(id: i64) -> ManagedNode {
		let new = sample_node("edge-1");
		ManagedNode {
			id,
			name: new.name,
			address: new.address,
			port: new.port,
			api_key: new.api_key,
			description: new.description,
			health: wgfleet_server_db::NodeHealth::Active,
			last_synced_at: None,
			dashboard: None,
			bandwidth_total: 0,
			last_reset_at: None,
			created_at: chrono::Utc::now(),
		}
	}

	#[tokio::test]
	async fn typed_call_decodes_response() {
		let client: Arc<dyn NodeDispatch> = Arc::new(Echo);
		let health = client.call(&HealthRequest {}).await.unwrap();
		assert_eq!(health.client_count, 2);
	}

	#[tokio::test]
	async fn undecodable_data_is_protocol_error() {
		let client: Arc<dyn NodeDispatch> = Arc::new(Echo);
		// Echo returns the request body, which is not a ClientConfig.
		let err = client
			.call(&wgfleet_proto::ClientConfigRequest { name: "a".into() })
			.await
			.unwrap_err();
		assert!(matches!(err, DispatchError::Protocol(_)));
	}

	#[tokio::test]
	async fn pool_caches_until_invalidated() {
		let factory = Arc::new(CountingFactory::default());
		let pool = DispatchPool::new(factory.clone());
		let node = managed(7);

		pool.for_node(&node).await;
		pool.for_node(&node).await;
		assert_eq!(factory.built.load(Ordering::SeqCst), 1);
		assert_eq!(pool.cached().await, 1);

		pool.invalidate(7).await;
		assert_eq!(pool.cached().await, 0);
		pool.for_node(&node).await;
		assert_eq!(factory.built.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn probe_is_not_cached() {
		let factory = Arc::new(CountingFactory::default());
		let pool = DispatchPool::new(factory.clone());
		let info = pool.probe(&NodeEndpoint::from(&sample_node("edge-2"))).await.unwrap();
		assert_eq!(info.version, "test");
		assert_eq!(pool.cached().await, 0);
	}

	#[test]
	fn endpoint_from_new_node() {
		let endpoint = NodeEndpoint::from(&sample_node("edge-3"));
		assert_eq!(endpoint.base_url, "http://192.0.2.10:1212");
		assert_eq!(endpoint.node_id, None);
	}
}
