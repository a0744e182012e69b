// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane mirror of every node's interfaces and clients.
//!
//! The mirror only ever follows confirmed node state; it never holds private
//! keys.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use crate::error::{conflict_on_unique, DbError};
use crate::types::{
	from_db_u64, narrow, parse_ts, to_db_u64, ClientPatch, InterfacePatch, MirrorClient,
	MirrorInterface, UsageRecord,
};

#[derive(FromRow)]
struct InterfaceRow {
	node_id: i64,
	idx: i64,
	public_key: String,
	port: i64,
	address_range: String,
	enabled: bool,
}

impl TryFrom<InterfaceRow> for MirrorInterface {
	type Error = DbError;

	fn try_from(row: InterfaceRow) -> Result<Self, Self::Error> {
		Ok(MirrorInterface {
			node_id: row.node_id,
			index: narrow(row.idx, "idx")?,
			public_key: row.public_key,
			port: narrow(row.port, "port")?,
			address_range: row
				.address_range
				.parse()
				.map_err(|e| DbError::Internal(format!("invalid address range: {e}")))?,
			enabled: row.enabled,
		})
	}
}

#[derive(FromRow)]
struct ClientRow {
	name: String,
	node_id: i64,
	interface_idx: i64,
	public_key: String,
	address: String,
	created_at: String,
	expires_at: String,
	quota_bytes: i64,
	note: String,
	enabled: bool,
	connected: bool,
	used_rx: i64,
	used_tx: i64,
	last_raw_rx: i64,
	last_raw_tx: i64,
}

impl TryFrom<ClientRow> for MirrorClient {
	type Error = DbError;

	fn try_from(row: ClientRow) -> Result<Self, Self::Error> {
		Ok(MirrorClient {
			name: row.name,
			node_id: row.node_id,
			interface_index: narrow(row.interface_idx, "interface_idx")?,
			public_key: row.public_key,
			address: row
				.address
				.parse()
				.map_err(|e| DbError::Internal(format!("invalid client address: {e}")))?,
			created_at: parse_ts(&row.created_at)?,
			expires_at: parse_ts(&row.expires_at)?,
			quota_bytes: from_db_u64(row.quota_bytes),
			note: row.note,
			enabled: row.enabled,
			connected: row.connected,
			usage: UsageRecord {
				used_rx: from_db_u64(row.used_rx),
				used_tx: from_db_u64(row.used_tx),
				last_raw_rx: from_db_u64(row.last_raw_rx),
				last_raw_tx: from_db_u64(row.last_raw_tx),
			},
		})
	}
}

const CLIENT_COLUMNS: &str = "name, node_id, interface_idx, public_key, address, created_at, \
	expires_at, quota_bytes, note, enabled, connected, used_rx, used_tx, last_raw_rx, last_raw_tx";

#[async_trait]
pub trait MirrorStore: Send + Sync {
	async fn insert_interface(&self, iface: &MirrorInterface) -> Result<(), DbError>;
	async fn get_interface(&self, node_id: i64, index: u32) -> Result<Option<MirrorInterface>, DbError>;
	async fn list_interfaces(&self, node_id: i64) -> Result<Vec<MirrorInterface>, DbError>;
	async fn update_interface(
		&self,
		node_id: i64,
		index: u32,
		patch: &InterfacePatch,
	) -> Result<(), DbError>;
	/// Removes the interface and every client on it; returns the removed client names.
	async fn delete_interface(&self, node_id: i64, index: u32) -> Result<Vec<String>, DbError>;

	async fn insert_client(&self, client: &MirrorClient) -> Result<(), DbError>;
	async fn get_client(&self, name: &str) -> Result<Option<MirrorClient>, DbError>;
	async fn list_clients(&self, node_id: i64) -> Result<Vec<MirrorClient>, DbError>;
	async fn update_client(&self, name: &str, patch: &ClientPatch) -> Result<(), DbError>;
	async fn delete_client(&self, name: &str) -> Result<bool, DbError>;
	async fn record_usage(
		&self,
		name: &str,
		usage: &UsageRecord,
		connected: bool,
	) -> Result<(), DbError>;
}

#[derive(Clone)]
pub struct MirrorRepository {
	pool: SqlitePool,
}

impl MirrorRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}
}

#[async_trait]
impl MirrorStore for MirrorRepository {
	#[tracing::instrument(skip(self, iface), fields(node_id = iface.node_id, index = iface.index))]
	async fn insert_interface(&self, iface: &MirrorInterface) -> Result<(), DbError> {
		sqlx::query(
			"INSERT INTO mirror_interfaces (node_id, idx, public_key, port, address_range, enabled)
			 VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(iface.node_id)
		.bind(i64::from(iface.index))
		.bind(&iface.public_key)
		.bind(i64::from(iface.port))
		.bind(iface.address_range.to_string())
		.bind(iface.enabled)
		.execute(&self.pool)
		.await
		.map_err(conflict_on_unique(format!(
			"interface wg{} overlaps an existing interface on node {}",
			iface.index, iface.node_id
		)))?;
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	async fn get_interface(&self, node_id: i64, index: u32) -> Result<Option<MirrorInterface>, DbError> {
		let row: Option<InterfaceRow> = sqlx::query_as(
			"SELECT node_id, idx, public_key, port, address_range, enabled
			 FROM mirror_interfaces WHERE node_id = ? AND idx = ?",
		)
		.bind(node_id)
		.bind(i64::from(index))
		.fetch_optional(&self.pool)
		.await?;
		row.map(MirrorInterface::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	async fn list_interfaces(&self, node_id: i64) -> Result<Vec<MirrorInterface>, DbError> {
		let rows: Vec<InterfaceRow> = sqlx::query_as(
			"SELECT node_id, idx, public_key, port, address_range, enabled
			 FROM mirror_interfaces WHERE node_id = ? ORDER BY idx",
		)
		.bind(node_id)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(MirrorInterface::try_from).collect()
	}

	#[tracing::instrument(skip(self, patch))]
	async fn update_interface(
		&self,
		node_id: i64,
		index: u32,
		patch: &InterfacePatch,
	) -> Result<(), DbError> {
		let result = sqlx::query(
			"UPDATE mirror_interfaces SET
				address_range = COALESCE(?, address_range),
				port = COALESCE(?, port),
				enabled = COALESCE(?, enabled)
			 WHERE node_id = ? AND idx = ?",
		)
		.bind(patch.address_range.map(|r| r.to_string()))
		.bind(patch.port.map(i64::from))
		.bind(patch.enabled)
		.bind(node_id)
		.bind(i64::from(index))
		.execute(&self.pool)
		.await
		.map_err(conflict_on_unique(format!(
			"interface wg{index} would overlap another interface on node {node_id}"
		)))?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("interface wg{index} on node {node_id}")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	async fn delete_interface(&self, node_id: i64, index: u32) -> Result<Vec<String>, DbError> {
		let mut tx = self.pool.begin().await?;

		let removed: Vec<(String,)> = sqlx::query_as(
			"DELETE FROM mirror_clients WHERE node_id = ? AND interface_idx = ? RETURNING name",
		)
		.bind(node_id)
		.bind(i64::from(index))
		.fetch_all(&mut *tx)
		.await?;

		let result = sqlx::query("DELETE FROM mirror_interfaces WHERE node_id = ? AND idx = ?")
			.bind(node_id)
			.bind(i64::from(index))
			.execute(&mut *tx)
			.await?;

		if result.rows_affected() == 0 {
			tx.rollback().await?;
			return Err(DbError::NotFound(format!("interface wg{index} on node {node_id}")));
		}
		tx.commit().await?;

		let mut names: Vec<String> = removed.into_iter().map(|(name,)| name).collect();
		names.sort();
		tracing::info!(node_id, index, clients = names.len(), "mirror interface removed");
		Ok(names)
	}

	#[tracing::instrument(skip(self, client), fields(client = %client.name, node_id = client.node_id))]
	async fn insert_client(&self, client: &MirrorClient) -> Result<(), DbError> {
		sqlx::query(&format!(
			"INSERT INTO mirror_clients ({CLIENT_COLUMNS})
			 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
		))
		.bind(&client.name)
		.bind(client.node_id)
		.bind(i64::from(client.interface_index))
		.bind(&client.public_key)
		.bind(client.address.to_string())
		.bind(client.created_at.to_rfc3339())
		.bind(client.expires_at.to_rfc3339())
		.bind(to_db_u64(client.quota_bytes))
		.bind(&client.note)
		.bind(client.enabled)
		.bind(client.connected)
		.bind(to_db_u64(client.usage.used_rx))
		.bind(to_db_u64(client.usage.used_tx))
		.bind(to_db_u64(client.usage.last_raw_rx))
		.bind(to_db_u64(client.usage.last_raw_tx))
		.execute(&self.pool)
		.await
		.map_err(conflict_on_unique(format!("client '{}' already exists", client.name)))?;
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	async fn get_client(&self, name: &str) -> Result<Option<MirrorClient>, DbError> {
		let row: Option<ClientRow> =
			sqlx::query_as(&format!("SELECT {CLIENT_COLUMNS} FROM mirror_clients WHERE name = ?"))
				.bind(name)
				.fetch_optional(&self.pool)
				.await?;
		row.map(MirrorClient::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	async fn list_clients(&self, node_id: i64) -> Result<Vec<MirrorClient>, DbError> {
		let rows: Vec<ClientRow> = sqlx::query_as(&format!(
			"SELECT {CLIENT_COLUMNS} FROM mirror_clients WHERE node_id = ? ORDER BY interface_idx, name"
		))
		.bind(node_id)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(MirrorClient::try_from).collect()
	}

	#[tracing::instrument(skip(self, patch))]
	async fn update_client(&self, name: &str, patch: &ClientPatch) -> Result<(), DbError> {
		let result = sqlx::query(
			"UPDATE mirror_clients SET
				expires_at = COALESCE(?, expires_at),
				quota_bytes = COALESCE(?, quota_bytes),
				enabled = COALESCE(?, enabled),
				note = COALESCE(?, note),
				connected = CASE WHEN ? = 0 THEN 0 ELSE connected END
			 WHERE name = ?",
		)
		.bind(patch.expires_at.map(|t| t.to_rfc3339()))
		.bind(patch.quota_bytes.map(to_db_u64))
		.bind(patch.enabled)
		.bind(patch.note.as_deref())
		.bind(patch.enabled)
		.bind(name)
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("client '{name}'")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	async fn delete_client(&self, name: &str) -> Result<bool, DbError> {
		let result = sqlx::query("DELETE FROM mirror_clients WHERE name = ?")
			.bind(name)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self, usage))]
	async fn record_usage(
		&self,
		name: &str,
		usage: &UsageRecord,
		connected: bool,
	) -> Result<(), DbError> {
		let result = sqlx::query(
			"UPDATE mirror_clients
			 SET used_rx = ?, used_tx = ?, last_raw_rx = ?, last_raw_tx = ?, connected = ?
			 WHERE name = ?",
		)
		.bind(to_db_u64(usage.used_rx))
		.bind(to_db_u64(usage.used_tx))
		.bind(to_db_u64(usage.last_raw_rx))
		.bind(to_db_u64(usage.last_raw_tx))
		.bind(connected)
		.bind(name)
		.execute(&self.pool)
		.await?;

		if result.rows_affected() == 0 {
			return Err(DbError::NotFound(format!("client '{name}'")));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::nodes::{NodeRepository, NodeStore};
	use crate::testing::{create_test_pool, sample_client, sample_interface, sample_node};
	use chrono::{Duration, Utc};

	async fn setup() -> (MirrorRepository, i64) {
		let pool = create_test_pool().await;
		let node = NodeRepository::new(pool.clone())
			.insert_node(&sample_node("edge-1"))
			.await
			.unwrap();
		let mirror = MirrorRepository::new(pool);
		mirror
			.insert_interface(&sample_interface(node.id, 0))
			.await
			.unwrap();
		(mirror, node.id)
	}

	#[tokio::test]
	async fn interface_roundtrip_and_uniqueness() {
		let (mirror, node_id) = setup().await;

		let fetched = mirror.get_interface(node_id, 0).await.unwrap().unwrap();
		assert_eq!(fetched, sample_interface(node_id, 0));

		let mut same_port = sample_interface(node_id, 1);
		same_port.port = fetched.port;
		assert!(matches!(
			mirror.insert_interface(&same_port).await,
			Err(DbError::Conflict(_))
		));
		assert_eq!(mirror.list_interfaces(node_id).await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn client_names_are_globally_unique() {
		let (mirror, node_id) = setup().await;
		mirror
			.insert_client(&sample_client(node_id, 0, "alice", 2))
			.await
			.unwrap();
		let err = mirror
			.insert_client(&sample_client(node_id, 0, "alice", 3))
			.await
			.unwrap_err();
		assert!(matches!(err, DbError::Conflict(_)));
	}

	#[tokio::test]
	async fn client_update_is_partial() {
		let (mirror, node_id) = setup().await;
		mirror
			.insert_client(&sample_client(node_id, 0, "alice", 2))
			.await
			.unwrap();
		let later = Utc::now() + Duration::days(60);

		mirror
			.update_client(
				"alice",
				&ClientPatch {
					expires_at: Some(later),
					quota_bytes: Some(5_000),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let client = mirror.get_client("alice").await.unwrap().unwrap();
		assert_eq!(client.expires_at.timestamp(), later.timestamp());
		assert_eq!(client.quota_bytes, 5_000);
		assert!(client.enabled);
		assert_eq!(client.note, "test client");
	}

	#[tokio::test]
	async fn disabling_clears_connected_flag() {
		let (mirror, node_id) = setup().await;
		mirror
			.insert_client(&sample_client(node_id, 0, "alice", 2))
			.await
			.unwrap();
		mirror
			.record_usage("alice", &UsageRecord::default(), true)
			.await
			.unwrap();

		mirror
			.update_client(
				"alice",
				&ClientPatch {
					enabled: Some(false),
					..Default::default()
				},
			)
			.await
			.unwrap();

		let client = mirror.get_client("alice").await.unwrap().unwrap();
		assert!(!client.enabled);
		assert!(!client.connected);
	}

	#[tokio::test]
	async fn usage_is_persisted() {
		let (mirror, node_id) = setup().await;
		mirror
			.insert_client(&sample_client(node_id, 0, "alice", 2))
			.await
			.unwrap();
		let usage = UsageRecord {
			used_rx: 1_200,
			used_tx: 600,
			last_raw_rx: 200,
			last_raw_tx: 600,
		};
		mirror.record_usage("alice", &usage, true).await.unwrap();

		let client = mirror.get_client("alice").await.unwrap().unwrap();
		assert_eq!(client.usage, usage);
		assert!(client.connected);
		assert!(matches!(
			mirror.record_usage("ghost", &usage, false).await,
			Err(DbError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn deleting_interface_removes_its_clients_only() {
		let (mirror, node_id) = setup().await;
		mirror
			.insert_interface(&sample_interface(node_id, 1))
			.await
			.unwrap();
		mirror
			.insert_client(&sample_client(node_id, 0, "alice", 2))
			.await
			.unwrap();
		mirror
			.insert_client(&sample_client(node_id, 0, "bob", 3))
			.await
			.unwrap();
		mirror
			.insert_client(&sample_client(node_id, 1, "carol", 2))
			.await
			.unwrap();

		let removed = mirror.delete_interface(node_id, 0).await.unwrap();
		assert_eq!(removed, vec!["alice".to_string(), "bob".to_string()]);

		let remaining = mirror.list_clients(node_id).await.unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].name, "carol");
		assert!(mirror.get_interface(node_id, 0).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn deleting_unknown_interface_is_not_found() {
		let (mirror, node_id) = setup().await;
		assert!(matches!(
			mirror.delete_interface(node_id, 9).await,
			Err(DbError::NotFound(_))
		));
	}
}
