// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections. Each `*ConfigLayer` holds optional values from one
//! source; `finalize` fills the gaps with defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:/var/lib/wgfleet/server.db?mode=rwc";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfigLayer {
	pub url: Option<String>,
}

impl DatabaseConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.url.is_some() {
			self.url = other.url;
		}
	}

	pub fn finalize(self) -> DatabaseConfig {
		DatabaseConfig {
			url: self.url.unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
	pub url: String,
}

impl Default for DatabaseConfig {
	fn default() -> Self {
		DatabaseConfigLayer::default().finalize()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfigLayer {
	pub timeout_secs: Option<u64>,
}

impl DispatchConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.timeout_secs.is_some() {
			self.timeout_secs = other.timeout_secs;
		}
	}

	pub fn finalize(self) -> DispatchConfig {
		DispatchConfig {
			timeout_secs: self.timeout_secs.unwrap_or(30),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
	pub timeout_secs: u64,
}

impl DispatchConfig {
	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}
}

impl Default for DispatchConfig {
	fn default() -> Self {
		DispatchConfigLayer::default().finalize()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfigLayer {
	pub interval_secs: Option<u64>,
	pub reset_interval_hours: Option<u64>,
	pub backup_enabled: Option<bool>,
	pub max_concurrent_nodes: Option<usize>,
}

impl ReconcileConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.interval_secs.is_some() {
			self.interval_secs = other.interval_secs;
		}
		if other.reset_interval_hours.is_some() {
			self.reset_interval_hours = other.reset_interval_hours;
		}
		if other.backup_enabled.is_some() {
			self.backup_enabled = other.backup_enabled;
		}
		if other.max_concurrent_nodes.is_some() {
			self.max_concurrent_nodes = other.max_concurrent_nodes;
		}
	}

	pub fn finalize(self) -> ReconcileConfig {
		ReconcileConfig {
			interval_secs: self.interval_secs.unwrap_or(300),
			reset_interval_hours: self.reset_interval_hours.unwrap_or(0),
			backup_enabled: self.backup_enabled.unwrap_or(true),
			max_concurrent_nodes: self.max_concurrent_nodes.unwrap_or(8),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
	pub interval_secs: u64,
	/// Zero disables the periodic interface reset.
	pub reset_interval_hours: u64,
	pub backup_enabled: bool,
	pub max_concurrent_nodes: usize,
}

impl ReconcileConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}

	pub fn reset_interval(&self) -> Option<chrono::Duration> {
		match self.reset_interval_hours {
			0 => None,
			hours => i64::try_from(hours).ok().map(chrono::Duration::hours),
		}
	}
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		ReconcileConfigLayer::default().finalize()
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfigLayer {
	pub level: Option<String>,
}

impl LoggingConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.level.is_some() {
			self.level = other.level;
		}
	}

	pub fn finalize(self) -> LoggingConfig {
		LoggingConfig {
			level: self.level.unwrap_or_else(|| "info".to_string()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
	pub level: String,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		LoggingConfigLayer::default().finalize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		assert_eq!(DispatchConfig::default().timeout(), Duration::from_secs(30));
		let reconcile = ReconcileConfig::default();
		assert_eq!(reconcile.interval(), Duration::from_secs(300));
		assert_eq!(reconcile.reset_interval(), None);
		assert!(reconcile.backup_enabled);
		assert_eq!(reconcile.max_concurrent_nodes, 8);
		assert_eq!(LoggingConfig::default().level, "info");
	}

	#[test]
	fn reset_interval_in_hours() {
		let config = ReconcileConfigLayer {
			reset_interval_hours: Some(6),
			..Default::default()
		}
		.finalize();
		assert_eq!(config.reset_interval(), Some(chrono::Duration::hours(6)));
	}

	#[test]
	fn merge_only_overwrites_present_fields() {
		let mut base = DatabaseConfigLayer {
			url: Some("sqlite:a.db".to_string()),
		};
		base.merge(DatabaseConfigLayer { url: None });
		assert_eq!(base.url.as_deref(), Some("sqlite:a.db"));
		base.merge(DatabaseConfigLayer {
			url: Some("sqlite:b.db".to_string()),
		});
		assert_eq!(base.finalize().url, "sqlite:b.db");
	}
}
