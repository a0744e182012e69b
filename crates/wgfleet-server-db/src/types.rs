// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use wgfleet_common_secret::SecretString;

use crate::error::DbError;

/// Reachability of a node as last observed by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
	Active,
	Unreachable,
	Error,
}

impl NodeHealth {
	pub fn as_str(&self) -> &'static str {
		match self {
			NodeHealth::Active => "active",
			NodeHealth::Unreachable => "unreachable",
			NodeHealth::Error => "error",
		}
	}
}

impl fmt::Display for NodeHealth {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NodeHealth {
	type Err = DbError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(NodeHealth::Active),
			"unreachable" => Ok(NodeHealth::Unreachable),
			"error" => Ok(NodeHealth::Error),
			other => Err(DbError::Internal(format!("unknown node health '{other}'"))),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ManagedNode {
	pub id: i64,
	pub name: String,
	pub address: String,
	pub port: u16,
	pub api_key: SecretString,
	pub description: String,
	pub health: NodeHealth,
	pub last_synced_at: Option<DateTime<Utc>>,
	/// Last dashboard snapshot as returned by the node, stored verbatim.
	pub dashboard: Option<serde_json::Value>,
	/// Bytes accumulated across all reconciliation cycles.
	pub bandwidth_total: u64,
	pub last_reset_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

impl ManagedNode {
	pub fn base_url(&self) -> String {
		format!("http://{}:{}", self.address, self.port)
	}
}

#[derive(Debug, Clone)]
pub struct NewNode {
	pub name: String,
	pub address: String,
	pub port: u16,
	pub api_key: SecretString,
	pub description: String,
}

/// Partial node update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
	pub name: Option<String>,
	pub address: Option<String>,
	pub port: Option<u16>,
	pub api_key: Option<SecretString>,
	pub description: Option<String>,
}

impl NodeUpdate {
	pub fn is_empty(&self) -> bool {
		self.name.is_none()
			&& self.address.is_none()
			&& self.port.is_none()
			&& self.api_key.is_none()
			&& self.description.is_none()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorInterface {
	pub node_id: i64,
	pub index: u32,
	pub public_key: String,
	pub port: u16,
	pub address_range: Ipv4Net,
	pub enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfacePatch {
	pub address_range: Option<Ipv4Net>,
	pub port: Option<u16>,
	pub enabled: Option<bool>,
}

/// Cumulative traffic for one client plus the raw counters last seen on the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
	pub used_rx: u64,
	pub used_tx: u64,
	pub last_raw_rx: u64,
	pub last_raw_tx: u64,
}

impl UsageRecord {
	pub fn total(&self) -> u64 {
		self.used_rx.saturating_add(self.used_tx)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorClient {
	pub name: String,
	pub node_id: i64,
	pub interface_index: u32,
	pub public_key: String,
	pub address: Ipv4Addr,
	pub created_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	/// Zero means unlimited.
	pub quota_bytes: u64,
	pub note: String,
	pub enabled: bool,
	pub connected: bool,
	pub usage: UsageRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientPatch {
	pub expires_at: Option<DateTime<Utc>>,
	pub quota_bytes: Option<u64>,
	pub enabled: Option<bool>,
	pub note: Option<String>,
}

// SQLite integers are signed; byte counters never get near i64::MAX in practice.
pub(crate) fn to_db_u64(v: u64) -> i64 {
	i64::try_from(v).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_u64(v: i64) -> u64 {
	u64::try_from(v).unwrap_or(0)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, DbError> {
	DateTime::parse_from_rfc3339(s)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| DbError::Internal(format!("invalid timestamp '{s}': {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DbError> {
	s.map(parse_ts).transpose()
}

pub(crate) fn narrow<T: TryFrom<i64>>(v: i64, column: &str) -> Result<T, DbError> {
	T::try_from(v).map_err(|_| DbError::Internal(format!("{column} out of range: {v}")))
}
