// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable node registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use wgfleet_common_secret::SecretString;

use crate::error::{conflict_on_unique, DbError};
use crate::types::{
	from_db_u64, narrow, parse_opt_ts, parse_ts, to_db_u64, ManagedNode, NewNode, NodeHealth,
	NodeUpdate,
};

#[derive(FromRow)]
struct NodeRow {
	id: i64,
	name: String,
	address: String,
	port: i64,
	api_key: String,
	description: String,
	health: String,
	last_synced_at: Option<String>,
	dashboard: Option<String>,
	bandwidth_total: i64,
	last_reset_at: Option<String>,
	created_at: String,
}

impl TryFrom<NodeRow> for ManagedNode {
	type Error = DbError;

	fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
		Ok(ManagedNode {
			id: row.id,
			name: row.name,
			address: row.address,
			port: narrow(row.port, "port")?,
			api_key: SecretString::new(row.api_key),
			description: row.description,
			health: row.health.parse()?,
			last_synced_at: parse_opt_ts(row.last_synced_at.as_deref())?,
			dashboard: row.dashboard.as_deref().map(serde_json::from_str).transpose()?,
			bandwidth_total: from_db_u64(row.bandwidth_total),
			last_reset_at: parse_opt_ts(row.last_reset_at.as_deref())?,
			created_at: parse_ts(&row.created_at)?,
		})
	}
}

const NODE_COLUMNS: &str = "id, name, address, port, api_key, description, health, last_synced_at, \
	dashboard, bandwidth_total, last_reset_at, created_at";

#[async_trait]
pub trait NodeStore: Send + Sync {
	async fn insert_node(&self, node: &NewNode) -> Result<ManagedNode, DbError>;
	async fn get_node(&self, id: i64) -> Result<Option<ManagedNode>, DbError>;
	async fn get_node_by_name(&self, name: &str) -> Result<Option<ManagedNode>, DbError>;
	async fn list_nodes(&self) -> Result<Vec<ManagedNode>, DbError>;
	async fn update_node(&self, id: i64, update: &NodeUpdate) -> Result<ManagedNode, DbError>;
	/// Deletes the node and every mirrored interface and client it owns.
	async fn delete_node(&self, id: i64) -> Result<bool, DbError>;
	async fn record_health(
		&self,
		id: i64,
		health: NodeHealth,
		synced_at: Option<DateTime<Utc>>,
	) -> Result<(), DbError>;
	async fn cache_dashboard(&self, id: i64, dashboard: &serde_json::Value) -> Result<(), DbError>;
	async fn add_bandwidth(&self, id: i64, bytes: u64) -> Result<(), DbError>;
	async fn set_last_reset(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError>;
}

#[derive(Clone)]
pub struct NodeRepository {
	pool: SqlitePool,
}

impl NodeRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	async fn fetch(&self, id: i64) -> Result<Option<ManagedNode>, DbError> {
		let row: Option<NodeRow> =
			sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"))
				.bind(id)
				.fetch_optional(&self.pool)
				.await?;
		row.map(ManagedNode::try_from).transpose()
	}
}

fn ensure_affected(rows: u64, id: i64) -> Result<(), DbError> {
	if rows == 0 {
		return Err(DbError::NotFound(format!("node {id}")));
	}
	Ok(())
}

#[async_trait]
impl NodeStore for NodeRepository {
	#[tracing::instrument(skip(self, node), fields(name = %node.name, address = %node.address))]
	async fn insert_node(&self, node: &NewNode) -> Result<ManagedNode, DbError> {
		let id = sqlx::query(
			"INSERT INTO nodes (name, address, port, api_key, description, health, created_at)
			 VALUES (?, ?, ?, ?, ?, 'active', ?)",
		)
		.bind(&node.name)
		.bind(&node.address)
		.bind(i64::from(node.port))
		.bind(node.api_key.expose())
		.bind(&node.description)
		.bind(Utc::now().to_rfc3339())
		.execute(&self.pool)
		.await
		.map_err(conflict_on_unique(format!("node name '{}' already exists", node.name)))?
		.last_insert_rowid();

		tracing::info!(node_id = id, "node registered");
		self.fetch(id)
			.await?
			.ok_or_else(|| DbError::Internal(format!("node {id} vanished after insert")))
	}

	#[tracing::instrument(skip(self))]
	async fn get_node(&self, id: i64) -> Result<Option<ManagedNode>, DbError> {
		self.fetch(id).await
	}

	#[tracing::instrument(skip(self))]
	async fn get_node_by_name(&self, name: &str) -> Result<Option<ManagedNode>, DbError> {
		let row: Option<NodeRow> =
			sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE name = ?"))
				.bind(name)
				.fetch_optional(&self.pool)
				.await?;
		row.map(ManagedNode::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	async fn list_nodes(&self) -> Result<Vec<ManagedNode>, DbError> {
		let rows: Vec<NodeRow> = sqlx::query_as(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))
			.fetch_all(&self.pool)
			.await?;
		rows.into_iter().map(ManagedNode::try_from).collect()
	}

	#[tracing::instrument(skip(self, update))]
	async fn update_node(&self, id: i64, update: &NodeUpdate) -> Result<ManagedNode, DbError> {
		let conflict = format!(
			"node name '{}' already exists",
			update.name.as_deref().unwrap_or_default()
		);
		let result = sqlx::query(
			"UPDATE nodes SET
				name = COALESCE(?, name),
				address = COALESCE(?, address),
				port = COALESCE(?, port),
				api_key = COALESCE(?, api_key),
				description = COALESCE(?, description)
			 WHERE id = ?",
		)
		.bind(update.name.as_deref())
		.bind(update.address.as_deref())
		.bind(update.port.map(i64::from))
		.bind(update.api_key.as_ref().map(|k| k.expose().as_str()))
		.bind(update.description.as_deref())
		.bind(id)
		.execute(&self.pool)
		.await
		.map_err(conflict_on_unique(conflict))?;

		ensure_affected(result.rows_affected(), id)?;
		self.fetch(id)
			.await?
			.ok_or_else(|| DbError::NotFound(format!("node {id}")))
	}

	#[tracing::instrument(skip(self))]
	async fn delete_node(&self, id: i64) -> Result<bool, DbError> {
		let mut tx = self.pool.begin().await?;

		let clients = sqlx::query("DELETE FROM mirror_clients WHERE node_id = ?")
			.bind(id)
			.execute(&mut *tx)
			.await?
			.rows_affected();
		let interfaces = sqlx::query("DELETE FROM mirror_interfaces WHERE node_id = ?")
			.bind(id)
			.execute(&mut *tx)
			.await?
			.rows_affected();
		let nodes = sqlx::query("DELETE FROM nodes WHERE id = ?")
			.bind(id)
			.execute(&mut *tx)
			.await?
			.rows_affected();

		if nodes == 0 {
			tx.rollback().await?;
			return Ok(false);
		}
		tx.commit().await?;

		tracing::info!(node_id = id, interfaces, clients, "node removed");
		Ok(true)
	}

	#[tracing::instrument(skip(self))]
	async fn record_health(
		&self,
		id: i64,
		health: NodeHealth,
		synced_at: Option<DateTime<Utc>>,
	) -> Result<(), DbError> {
		let result = sqlx::query(
			"UPDATE nodes SET health = ?, last_synced_at = COALESCE(?, last_synced_at) WHERE id = ?",
		)
		.bind(health.as_str())
		.bind(synced_at.map(|t| t.to_rfc3339()))
		.bind(id)
		.execute(&self.pool)
		.await?;
		ensure_affected(result.rows_affected(), id)
	}

	#[tracing::instrument(skip(self, dashboard))]
	async fn cache_dashboard(&self, id: i64, dashboard: &serde_json::Value) -> Result<(), DbError> {
		let result = sqlx::query("UPDATE nodes SET dashboard = ? WHERE id = ?")
			.bind(serde_json::to_string(dashboard)?)
			.bind(id)
			.execute(&self.pool)
			.await?;
		ensure_affected(result.rows_affected(), id)
	}

	#[tracing::instrument(skip(self))]
	async fn add_bandwidth(&self, id: i64, bytes: u64) -> Result<(), DbError> {
		let result = sqlx::query("UPDATE nodes SET bandwidth_total = bandwidth_total + ? WHERE id = ?")
			.bind(to_db_u64(bytes))
			.bind(id)
			.execute(&self.pool)
			.await?;
		ensure_affected(result.rows_affected(), id)
	}

	#[tracing::instrument(skip(self))]
	async fn set_last_reset(&self, id: i64, at: DateTime<Utc>) -> Result<(), DbError> {
		let result = sqlx::query("UPDATE nodes SET last_reset_at = ? WHERE id = ?")
			.bind(at.to_rfc3339())
			.bind(id)
			.execute(&self.pool)
			.await?;
		ensure_affected(result.rows_affected(), id)
	}
}
