// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fixtures for tests in this crate and in crates that build on it.

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::net::Ipv4Addr;
use std::str::FromStr;
use wgfleet_common_secret::SecretString;

use crate::pool::run_migrations;
use crate::types::{MirrorClient, MirrorInterface, NewNode, UsageRecord};

/// Single-connection in-memory pool with the schema applied.
pub async fn create_test_pool() -> SqlitePool {
	let options = SqliteConnectOptions::from_str(":memory:")
		.unwrap()
		.foreign_keys(true);
	let pool = SqlitePoolOptions::new()
		.max_connections(1)
		.connect_with(options)
		.await
		.expect("Failed to create test pool");
	run_migrations(&pool).await.unwrap();
	pool
}

pub fn sample_node(name: &str) -> NewNode {
	NewNode {
		name: name.to_string(),
		address: "192.0.2.10".to_string(),
		port: 1212,
		api_key: SecretString::new(format!("key-{name}")),
		description: String::new(),
	}
}

/// Interface `wg<index>` on `10.<index>.0.1/24`, port `51820 + index`.
pub fn sample_interface(node_id: i64, index: u32) -> MirrorInterface {
	MirrorInterface {
		node_id,
		index,
		public_key: format!("iface-{node_id}-{index}-pubkey"),
		port: 51820 + index as u16,
		address_range: format!("10.{index}.0.1/24").parse().unwrap(),
		enabled: true,
	}
}

/// Client `name` on `wg<index>` with address `10.<index>.0.<host>`.
pub fn sample_client(node_id: i64, index: u32, name: &str, host: u8) -> MirrorClient {
	let now = Utc::now();
	MirrorClient {
		name: name.to_string(),
		node_id,
		interface_index: index,
		public_key: format!("{name}-pubkey"),
		address: Ipv4Addr::new(10, index as u8, 0, host),
		created_at: now,
		expires_at: now + Duration::days(30),
		quota_bytes: 0,
		note: "test client".to_string(),
		enabled: true,
		connected: false,
		usage: UsageRecord::default(),
	}
}
