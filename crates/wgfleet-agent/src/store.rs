// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node-local SQLite store. This is the only place private keys are kept.

use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::FromRow;
use wgfleet_common_secret::SecretString;

use crate::error::{AgentError, Result};

const MIGRATIONS: &[(&str, &str)] = &[("001_agent", include_str!("../migrations/001_agent.sql"))];

#[tracing::instrument(skip(database_url))]
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
	let options = SqliteConnectOptions::from_str(database_url)
		.map_err(|e| AgentError::Internal(format!("invalid database URL: {e}")))?
		.journal_mode(SqliteJournalMode::Wal)
		.foreign_keys(true)
		.create_if_missing(true);
	Ok(SqlitePool::connect_with(options).await?)
}

#[tracing::instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
	for (name, sql) in MIGRATIONS {
		for stmt in sql.split(';').filter(|s| !s.trim().is_empty()) {
			sqlx::query(stmt).execute(pool).await?;
		}
		tracing::debug!(migration = name, "migration applied");
	}
	Ok(())
}

#[derive(Debug, Clone)]
pub struct LocalInterface {
	pub index: u32,
	pub private_key: SecretString,
	pub public_key: String,
	pub port: u16,
	pub address_range: Ipv4Net,
	pub enabled: bool,
}

impl LocalInterface {
	pub fn name(&self) -> String {
		interface_name(self.index)
	}
}

pub fn interface_name(index: u32) -> String {
	format!("wg{index}")
}

#[derive(Debug, Clone)]
pub struct LocalClient {
	pub name: String,
	pub interface_index: u32,
	pub public_key: String,
	pub private_key: SecretString,
	pub address: Ipv4Addr,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub quota_bytes: u64,
	pub note: String,
	pub enabled: bool,
}

/// Record-only client fields; `None` leaves the column unchanged.
#[derive(Debug, Clone, Default)]
pub struct LocalClientPatch {
	pub expires_at: Option<DateTime<Utc>>,
	pub quota_bytes: Option<u64>,
	pub note: Option<String>,
	pub enabled: Option<bool>,
}

#[derive(FromRow)]
struct InterfaceRow {
	idx: i64,
	private_key: String,
	public_key: String,
	port: i64,
	address_range: String,
	enabled: bool,
}

impl TryFrom<InterfaceRow> for LocalInterface {
	type Error = AgentError;

	fn try_from(row: InterfaceRow) -> Result<Self> {
		Ok(Self {
			index: narrow(row.idx, "idx")?,
			private_key: SecretString::new(row.private_key),
			public_key: row.public_key,
			port: narrow(row.port, "port")?,
			address_range: row
				.address_range
				.parse()
				.map_err(|e| AgentError::Internal(format!("stored address range is invalid: {e}")))?,
			enabled: row.enabled,
		})
	}
}

#[derive(FromRow)]
struct ClientRow {
	name: String,
	interface_idx: i64,
	public_key: String,
	private_key: String,
	address: String,
	created_at: String,
	expires_at: String,
	quota_bytes: i64,
	note: String,
	enabled: bool,
}

impl TryFrom<ClientRow> for LocalClient {
	type Error = AgentError;

	fn try_from(row: ClientRow) -> Result<Self> {
		Ok(Self {
			name: row.name,
			interface_index: narrow(row.interface_idx, "interface_idx")?,
			public_key: row.public_key,
			private_key: SecretString::new(row.private_key),
			address: row
				.address
				.parse()
				.map_err(|e| AgentError::Internal(format!("stored client address is invalid: {e}")))?,
			created_at: parse_ts(&row.created_at)?,
			expires_at: parse_ts(&row.expires_at)?,
			quota_bytes: u64::try_from(row.quota_bytes).unwrap_or(0),
			note: row.note,
			enabled: row.enabled,
		})
	}
}

fn narrow<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T> {
	T::try_from(value).map_err(|_| AgentError::Internal(format!("{column} out of range: {value}")))
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(value)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| AgentError::Internal(format!("stored timestamp '{value}' is invalid: {e}")))
}

fn db_u64(value: u64) -> i64 {
	i64::try_from(value).unwrap_or(i64::MAX)
}

const CLIENT_COLUMNS: &str = "name, interface_idx, public_key, private_key, address, created_at, expires_at, quota_bytes, note, enabled";

#[derive(Debug, Clone)]
pub struct LocalStore {
	pool: SqlitePool,
}

impl LocalStore {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	#[tracing::instrument(skip(self, iface), fields(interface = iface.index))]
	pub async fn insert_interface(&self, iface: &LocalInterface) -> Result<()> {
		sqlx::query(
			"INSERT INTO interfaces (idx, private_key, public_key, port, address_range, enabled) VALUES (?, ?, ?, ?, ?, ?)",
		)
		.bind(i64::from(iface.index))
		.bind(iface.private_key.expose())
		.bind(&iface.public_key)
		.bind(i64::from(iface.port))
		.bind(iface.address_range.to_string())
		.bind(iface.enabled)
		.execute(&self.pool)
		.await
		.map_err(AgentError::conflict_on_unique(format!(
			"interface index, port or range already in use: wg{}",
			iface.index
		)))?;
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_interface(&self, index: u32) -> Result<Option<LocalInterface>> {
		let row: Option<InterfaceRow> = sqlx::query_as(
			"SELECT idx, private_key, public_key, port, address_range, enabled FROM interfaces WHERE idx = ?",
		)
		.bind(i64::from(index))
		.fetch_optional(&self.pool)
		.await?;
		row.map(LocalInterface::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_interfaces(&self) -> Result<Vec<LocalInterface>> {
		let rows: Vec<InterfaceRow> = sqlx::query_as(
			"SELECT idx, private_key, public_key, port, address_range, enabled FROM interfaces ORDER BY idx",
		)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(LocalInterface::try_from).collect()
	}

	/// Overwrites port, range and enabled flag of an existing interface.
	#[tracing::instrument(skip(self, iface), fields(interface = iface.index))]
	pub async fn save_interface(&self, iface: &LocalInterface) -> Result<()> {
		let result = sqlx::query("UPDATE interfaces SET port = ?, address_range = ?, enabled = ? WHERE idx = ?")
			.bind(i64::from(iface.port))
			.bind(iface.address_range.to_string())
			.bind(iface.enabled)
			.bind(i64::from(iface.index))
			.execute(&self.pool)
			.await
			.map_err(AgentError::conflict_on_unique("port or address range already in use"))?;
		if result.rows_affected() == 0 {
			return Err(AgentError::NotFound(interface_name(iface.index)));
		}
		Ok(())
	}

	/// Deletes the interface and its clients; returns the removed client names.
	#[tracing::instrument(skip(self))]
	pub async fn delete_interface(&self, index: u32) -> Result<Vec<String>> {
		let mut tx = self.pool.begin().await?;
		let mut names: Vec<String> =
			sqlx::query_scalar("DELETE FROM clients WHERE interface_idx = ? RETURNING name")
				.bind(i64::from(index))
				.fetch_all(&mut *tx)
				.await?;
		let result = sqlx::query("DELETE FROM interfaces WHERE idx = ?")
			.bind(i64::from(index))
			.execute(&mut *tx)
			.await?;
		if result.rows_affected() == 0 {
			return Err(AgentError::NotFound(interface_name(index)));
		}
		tx.commit().await?;
		names.sort();
		Ok(names)
	}

	#[tracing::instrument(skip(self, client), fields(client = %client.name))]
	pub async fn insert_client(&self, client: &LocalClient) -> Result<()> {
		sqlx::query(&format!(
			"INSERT INTO clients ({CLIENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
		))
		.bind(&client.name)
		.bind(i64::from(client.interface_index))
		.bind(&client.public_key)
		.bind(client.private_key.expose())
		.bind(client.address.to_string())
		.bind(client.created_at.to_rfc3339())
		.bind(client.expires_at.to_rfc3339())
		.bind(db_u64(client.quota_bytes))
		.bind(&client.note)
		.bind(client.enabled)
		.execute(&self.pool)
		.await
		.map_err(AgentError::conflict_on_unique(format!(
			"client '{}' or its address already exists",
			client.name
		)))?;
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_client(&self, name: &str) -> Result<Option<LocalClient>> {
		let row: Option<ClientRow> = sqlx::query_as(&format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE name = ?"))
			.bind(name)
			.fetch_optional(&self.pool)
			.await?;
		row.map(LocalClient::try_from).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_clients(&self) -> Result<Vec<LocalClient>> {
		let rows: Vec<ClientRow> = sqlx::query_as(&format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY name"))
			.fetch_all(&self.pool)
			.await?;
		rows.into_iter().map(LocalClient::try_from).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn clients_on(&self, index: u32) -> Result<Vec<LocalClient>> {
		let rows: Vec<ClientRow> = sqlx::query_as(&format!(
			"SELECT {CLIENT_COLUMNS} FROM clients WHERE interface_idx = ? ORDER BY name"
		))
		.bind(i64::from(index))
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(LocalClient::try_from).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn count_clients(&self) -> Result<u64> {
		let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clients")
			.fetch_one(&self.pool)
			.await?;
		Ok(u64::try_from(count).unwrap_or(0))
	}

	#[tracing::instrument(skip(self, patch))]
	pub async fn update_client(&self, name: &str, patch: &LocalClientPatch) -> Result<()> {
		let result = sqlx::query(
			r#"
			UPDATE clients SET
				expires_at = COALESCE(?, expires_at),
				quota_bytes = COALESCE(?, quota_bytes),
				note = COALESCE(?, note),
				enabled = COALESCE(?, enabled)
			WHERE name = ?
			"#,
		)
		.bind(patch.expires_at.map(|t| t.to_rfc3339()))
		.bind(patch.quota_bytes.map(db_u64))
		.bind(patch.note.as_deref())
		.bind(patch.enabled)
		.bind(name)
		.execute(&self.pool)
		.await?;
		if result.rows_affected() == 0 {
			return Err(AgentError::NotFound(format!("client '{name}'")));
		}
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn delete_client(&self, name: &str) -> Result<bool> {
		let result = sqlx::query("DELETE FROM clients WHERE name = ?")
			.bind(name)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}

	#[tracing::instrument(skip(self))]
	pub async fn setting(&self, key: &str) -> Result<Option<String>> {
		Ok(sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?)
	}

	#[tracing::instrument(skip(self, value))]
	pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
		sqlx::query(
			"INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
		)
		.bind(key)
		.bind(value)
		.execute(&self.pool)
		.await?;
		Ok(())
	}
}
