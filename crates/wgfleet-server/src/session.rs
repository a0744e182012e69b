// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Keyed conversational state for operator front ends, with explicit expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[async_trait]
pub trait SessionStore: Send + Sync {
	/// Live value for `key`; expired entries are never returned.
	async fn get(&self, key: &str) -> Option<Value>;
	async fn set(&self, key: &str, value: Value, ttl: Duration);
	async fn remove(&self, key: &str) -> bool;
	/// Drops every expired entry, returning how many were removed.
	async fn purge_expired(&self) -> usize;
}

#[derive(Debug)]
struct Entry {
	value: Value,
	expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
	entries: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}

#[async_trait]
impl SessionStore for MemorySessionStore {
	async fn get(&self, key: &str) -> Option<Value> {
		let entries = self.entries.read().await;
		entries
			.get(key)
			.filter(|entry| entry.expires_at > Instant::now())
			.map(|entry| entry.value.clone())
	}

	async fn set(&self, key: &str, value: Value, ttl: Duration) {
		let entry = Entry {
			value,
			expires_at: Instant::now() + ttl,
		};
		self.entries.write().await.insert(key.to_string(), entry);
	}

	async fn remove(&self, key: &str) -> bool {
		self.entries.write().await.remove(key).is_some()
	}

	async fn purge_expired(&self) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.write().await;
		let before = entries.len();
		entries.retain(|_, entry| entry.expires_at > now);
		before - entries.len()
	}
}
