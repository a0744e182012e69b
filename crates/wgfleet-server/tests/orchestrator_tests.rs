// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Dual-write behaviour of the orchestrator against fake node agents.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use wgfleet_proto::{CreateClientRequest, ErrorCode, Operation, UpdateClientRequest, UpdateInterfaceRequest};
use wgfleet_server::config::ReconcileConfig;
use wgfleet_server::testing::{FakeFleet, FakeNode};
use wgfleet_server::{DispatchError, FleetError, FleetServices, Outcome};
use wgfleet_server_db::testing::{create_test_pool, sample_node};
use wgfleet_server_db::{
	ClientPatch, DbError, InterfacePatch, MirrorClient, MirrorInterface, MirrorRepository, MirrorStore,
	NodeRepository, UsageRecord,
};

/// Mirror that can be told to fail every write while reads keep working.
struct FlakyMirror {
	inner: MirrorRepository,
	fail_writes: AtomicBool,
}

impl FlakyMirror {
	fn check(&self) -> Result<(), DbError> {
		if self.fail_writes.load(Ordering::SeqCst) {
			return Err(DbError::Internal("disk I/O error".to_string()));
		}
		Ok(())
	}
}

#[async_trait]
impl MirrorStore for FlakyMirror {
	async fn insert_interface(&self, iface: &MirrorInterface) -> Result<(), DbError> {
		self.check()?;
		self.inner.insert_interface(iface).await
	}

	async fn get_interface(&self, node_id: i64, index: u32) -> Result<Option<MirrorInterface>, DbError> {
		self.inner.get_interface(node_id, index).await
	}

	async fn list_interfaces(&self, node_id: i64) -> Result<Vec<MirrorInterface>, DbError> {
		self.inner.list_interfaces(node_id).await
	}

	async fn update_interface(&self, node_id: i64, index: u32, patch: &InterfacePatch) -> Result<(), DbError> {
		self.check()?;
		self.inner.update_interface(node_id, index, patch).await
	}

	async fn delete_interface(&self, node_id: i64, index: u32) -> Result<Vec<String>, DbError> {
		self.check()?;
		self.inner.delete_interface(node_id, index).await
	}

	async fn insert_client(&self, client: &MirrorClient) -> Result<(), DbError> {
		self.check()?;
		self.inner.insert_client(client).await
	}

	async fn get_client(&self, name: &str) -> Result<Option<MirrorClient>, DbError> {
		self.inner.get_client(name).await
	}

	async fn list_clients(&self, node_id: i64) -> Result<Vec<MirrorClient>, DbError> {
		self.inner.list_clients(node_id).await
	}

	async fn update_client(&self, name: &str, patch: &ClientPatch) -> Result<(), DbError> {
		self.check()?;
		self.inner.update_client(name, patch).await
	}

	async fn delete_client(&self, name: &str) -> Result<bool, DbError> {
		self.check()?;
		self.inner.delete_client(name).await
	}

	async fn record_usage(&self, name: &str, usage: &UsageRecord, connected: bool) -> Result<(), DbError> {
		self.check()?;
		self.inner.record_usage(name, usage, connected).await
	}
}

struct Harness {
	services: FleetServices,
	mirror: Arc<FlakyMirror>,
	node: Arc<FakeNode>,
	node_id: i64,
}

async fn harness() -> Harness {
	let pool = create_test_pool().await;
	let fleet = Arc::new(FakeFleet::new());
	let node = fleet.add(&sample_node("edge-1"));
	let mirror = Arc::new(FlakyMirror {
		inner: MirrorRepository::new(pool.clone()),
		fail_writes: AtomicBool::new(false),
	});
	let services = FleetServices::new(
		Arc::new(NodeRepository::new(pool)),
		mirror.clone(),
		fleet,
		ReconcileConfig::default(),
	);
	let node_id = services.add_node(sample_node("edge-1")).await.into_result().unwrap().id;
	Harness {
		services,
		mirror,
		node,
		node_id,
	}
}

fn client_request(name: &str) -> CreateClientRequest {
	CreateClientRequest {
		interface_index: 0,
		name: name.to_string(),
		expires_at: Utc::now() + Duration::days(30),
		quota_bytes: 0,
		note: String::new(),
	}
}

impl Harness {
	async fn with_interface(self) -> Self {
		self.services
			.create_interface(self.node_id, "10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.into_result()
			.unwrap();
		self
	}

	async fn create_client(&self, name: &str) -> Outcome<wgfleet_server::ProvisionedClient> {
		self.services.create_client(self.node_id, client_request(name)).await
	}
}

#[tokio::test]
async fn create_interface_mirrors_public_key_only() {
	let h = harness().await.with_interface().await;

	let mirrored = h.mirror.get_interface(h.node_id, 0).await.unwrap().unwrap();
	let on_node = h.node.interface(0).unwrap();
	assert_eq!(mirrored.public_key, on_node.public_key.to_base64());
	assert_eq!(mirrored.port, 51820);
	assert!(mirrored.enabled);
}

#[tokio::test]
async fn interface_conflicts_are_caught_before_dispatch() {
	let h = harness().await.with_interface().await;
	let before = h.node.count(Operation::InterfaceCreate);

	let same_port = h
		.services
		.create_interface(h.node_id, "10.9.0.1/24".parse().unwrap(), 51820)
		.await;
	assert!(matches!(same_port, Outcome::Failed(FleetError::Conflict(_))));

	let overlapping = h
		.services
		.create_interface(h.node_id, "10.0.0.129/25".parse().unwrap(), 51821)
		.await;
	assert!(matches!(overlapping, Outcome::Failed(FleetError::Conflict(_))));

	assert_eq!(h.node.count(Operation::InterfaceCreate), before);
}

#[tokio::test]
async fn third_client_gets_next_free_address() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	h.create_client("bob").await.into_result().unwrap();

	let carol = h.create_client("carol").await.into_result().unwrap();
	assert_eq!(carol.client.address, Ipv4Addr::new(10, 0, 0, 4));
	assert!(carol.config.starts_with("[Interface]"));

	let mirrored = h.mirror.get_client("carol").await.unwrap().unwrap();
	assert_eq!(mirrored.address, Ipv4Addr::new(10, 0, 0, 4));
	assert_eq!(mirrored.public_key, h.node.client("carol").unwrap().public_key.to_base64());
}

#[tokio::test]
async fn duplicate_client_name_makes_no_remote_call() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	let before = h.node.count(Operation::ClientCreate);

	let outcome = h.create_client("alice").await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::Conflict(_))));
	assert_eq!(h.node.count(Operation::ClientCreate), before);
}

#[tokio::test]
async fn unknown_interface_and_node_are_rejected_locally() {
	let h = harness().await;

	let outcome = h.create_client("alice").await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::NotFound(_))));
	assert_eq!(h.node.count(Operation::ClientCreate), 0);

	let outcome = h.services.create_client(h.node_id + 100, client_request("alice")).await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::NodeNotFound(_))));

	let outcome = h.services.delete_client("nobody").await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::NotFound(_))));
}

#[tokio::test]
async fn full_subnet_is_detected_before_dispatch() {
	let h = harness().await;
	h.services
		.create_interface(h.node_id, "10.5.0.1/30".parse().unwrap(), 51830)
		.await
		.into_result()
		.unwrap();
	h.create_client("only").await.into_result().unwrap();
	let before = h.node.count(Operation::ClientCreate);

	let outcome = h.create_client("second").await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::SubnetExhausted(_))));
	assert_eq!(h.node.count(Operation::ClientCreate), before);
}

#[tokio::test]
async fn timed_out_create_is_indeterminate_and_mirror_unchanged() {
	let h = harness().await.with_interface().await;
	h.node.set_timeout(Operation::ClientCreate);

	let outcome = h.create_client("alice").await;
	match outcome {
		Outcome::Indeterminate(FleetError::Indeterminate { operation }) => assert_eq!(operation, "client_create"),
		other => panic!("expected indeterminate, got {other:?}"),
	}
	assert!(h.mirror.get_client("alice").await.unwrap().is_none());
	assert_eq!(h.node.count(Operation::ClientCreate), 1);
}

#[tokio::test]
async fn dropped_connection_on_create_is_indeterminate() {
	let h = harness().await.with_interface().await;
	h.node.set_failure(
		Operation::ClientCreate,
		DispatchError::Interrupted("connection closed before message completed".into()),
	);

	match h.create_client("alice").await {
		Outcome::Indeterminate(FleetError::Indeterminate { operation }) => assert_eq!(operation, "client_create"),
		other => panic!("expected indeterminate, got {other:?}"),
	}
	assert!(h.mirror.get_client("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn dropped_connection_on_read_is_unreachable() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	h.node.set_failure(Operation::ClientDetail, DispatchError::Interrupted("connection reset".into()));

	assert!(matches!(
		h.services.client_detail("alice").await,
		Outcome::Failed(FleetError::NodeUnreachable(_))
	));
}

#[tokio::test]
async fn timed_out_read_is_a_plain_timeout() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	h.node.set_timeout(Operation::ClientDetail);

	let outcome = h.services.client_detail("alice").await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::Timeout(_))));
}

#[tokio::test]
async fn node_errors_keep_their_code_and_leave_mirror_alone() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	h.node.set_failure(
		Operation::ClientDelete,
		DispatchError::Node {
			message: "Unable to modify interface: Operation not permitted".into(),
			code: Some(ErrorCode::Internal),
		},
	);

	match h.services.delete_client("alice").await {
		Outcome::Failed(FleetError::NodeError { message, code }) => {
			assert!(message.contains("Operation not permitted"));
			assert_eq!(code, Some(ErrorCode::Internal));
		}
		other => panic!("unexpected outcome {other:?}"),
	}
	assert!(h.mirror.get_client("alice").await.unwrap().is_some());
}

#[tokio::test]
async fn unauthorized_is_surfaced_without_detail() {
	let h = harness().await.with_interface().await;
	h.node.set_failure(Operation::ClientCreate, DispatchError::Unauthorized);

	let outcome = h.create_client("alice").await;
	match outcome {
		Outcome::Failed(e @ FleetError::Unauthorized) => assert_eq!(e.to_string(), "unauthorized"),
		other => panic!("unexpected outcome {other:?}"),
	}
	assert!(h.mirror.get_client("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn mirror_failure_after_remote_success_is_desync() {
	let h = harness().await.with_interface().await;
	h.mirror.fail_writes.store(true, Ordering::SeqCst);

	match h.create_client("alice").await {
		Outcome::Failed(FleetError::MirrorDesync { operation, detail }) => {
			assert_eq!(operation, "client_create");
			assert!(detail.contains("disk I/O error"));
		}
		other => panic!("unexpected outcome {other:?}"),
	}
	assert!(h.node.client("alice").is_some());
	assert!(h.mirror.get_client("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn deleting_interface_removes_its_clients_everywhere() {
	let h = harness().await.with_interface().await;
	h.services
		.create_interface(h.node_id, "10.1.0.1/24".parse().unwrap(), 51821)
		.await
		.into_result()
		.unwrap();
	h.create_client("alice").await.into_result().unwrap();
	h.create_client("bob").await.into_result().unwrap();
	h.services
		.create_client(
			h.node_id,
			CreateClientRequest {
				interface_index: 1,
				..client_request("carol")
			},
		)
		.await
		.into_result()
		.unwrap();

	let removed = h.services.delete_interface(h.node_id, 0).await.into_result().unwrap();
	assert_eq!(removed, vec!["alice".to_string(), "bob".to_string()]);

	assert_eq!(h.node.client_names(), vec!["carol".to_string()]);
	let remaining: Vec<String> = h
		.services
		.list_clients(h.node_id)
		.await
		.into_result()
		.unwrap()
		.into_iter()
		.map(|c| c.name)
		.collect();
	assert_eq!(remaining, vec!["carol".to_string()]);
	assert!(h.mirror.get_interface(h.node_id, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn disabling_a_client_updates_node_and_mirror() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();

	let updated = h
		.services
		.update_client(UpdateClientRequest {
			name: "alice".into(),
			enabled: Some(false),
			quota_bytes: Some(5_000),
			..Default::default()
		})
		.await
		.into_result()
		.unwrap();
	assert!(!updated.enabled);
	assert_eq!(updated.quota_bytes, 5_000);

	assert!(!h.node.client("alice").unwrap().enabled);
	let mirrored = h.mirror.get_client("alice").await.unwrap().unwrap();
	assert!(!mirrored.enabled);
	assert_eq!(mirrored.quota_bytes, 5_000);
}

#[tokio::test]
async fn interface_update_and_read_through() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();

	let iface = h
		.services
		.update_interface(
			h.node_id,
			UpdateInterfaceRequest {
				index: 0,
				enabled: Some(false),
				..Default::default()
			},
		)
		.await
		.into_result()
		.unwrap();
	assert!(!iface.enabled);
	assert!(!h.node.interface(0).unwrap().enabled);

	let config = h.services.client_config("alice").await.into_result().unwrap();
	assert!(config.contains("10.0.0.2"));
	let detail = h.services.client_detail("alice").await.into_result().unwrap();
	assert_eq!(detail.address, Ipv4Addr::new(10, 0, 0, 2));

	let interfaces = h.services.list_interfaces(h.node_id).await.into_result().unwrap();
	assert_eq!(interfaces.len(), 1);
}

#[tokio::test]
async fn range_change_stranding_a_client_is_refused_locally() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();
	h.services
		.update_client(UpdateClientRequest::disable("alice"))
		.await
		.into_result()
		.unwrap();

	let outcome = h
		.services
		.update_interface(
			h.node_id,
			UpdateInterfaceRequest {
				index: 0,
				address_range: Some("10.9.0.1/24".parse().unwrap()),
				..Default::default()
			},
		)
		.await;
	assert!(matches!(outcome, Outcome::Failed(FleetError::Conflict(_))));
	assert_eq!(h.node.count(Operation::InterfaceUpdate), 0);

	let mirrored = h.mirror.get_interface(h.node_id, 0).await.unwrap().unwrap();
	assert_eq!(mirrored.address_range, "10.0.0.1/24".parse::<ipnet::Ipv4Net>().unwrap());
}

#[tokio::test]
async fn removing_node_drops_its_mirror() {
	let h = harness().await.with_interface().await;
	h.create_client("alice").await.into_result().unwrap();

	h.services.remove_node(h.node_id).await.into_result().unwrap();
	assert!(h.mirror.get_client("alice").await.unwrap().is_none());
	assert!(matches!(
		h.services.list_clients(h.node_id).await,
		Outcome::Failed(FleetError::NodeNotFound(_))
	));
}
