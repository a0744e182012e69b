// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Layered control-plane configuration.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables (`WGFLEET_SERVER_*`)
//! 2. Config file (`/etc/wgfleet/server.toml`, or the path given with `--config`)
//! 3. Built-in defaults

pub mod error;
pub mod layer;
pub mod sections;
pub mod sources;

pub use error::ConfigError;
pub use layer::ServerConfigLayer;
pub use sections::*;
pub use sources::{ConfigSource, DefaultsSource, EnvSource, Precedence, TomlSource};

use std::path::PathBuf;
use tracing::{debug, info};

/// Fully resolved server configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerConfig {
	pub database: DatabaseConfig,
	pub dispatch: DispatchConfig,
	pub reconcile: ReconcileConfig,
	pub logging: LoggingConfig,
}

pub fn load_config() -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::system()),
		Box::new(EnvSource::default()),
	])
}

pub fn load_config_with_file(config_path: impl Into<PathBuf>) -> Result<ServerConfig, ConfigError> {
	load_from_sources(vec![
		Box::new(DefaultsSource),
		Box::new(TomlSource::new(config_path)),
		Box::new(EnvSource::default()),
	])
}

pub fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ServerConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ServerConfigLayer::default();
	for source in sources {
		debug!(source = source.name(), "loading configuration source");
		merged.merge(source.load()?);
	}

	finalize(merged)
}

fn finalize(layer: ServerConfigLayer) -> Result<ServerConfig, ConfigError> {
	let config = ServerConfig {
		database: layer.database.unwrap_or_default().finalize(),
		dispatch: layer.dispatch.unwrap_or_default().finalize(),
		reconcile: layer.reconcile.unwrap_or_default().finalize(),
		logging: layer.logging.unwrap_or_default().finalize(),
	};
	validate_config(&config)?;

	info!(
		database = %config.database.url,
		dispatch_timeout_secs = config.dispatch.timeout_secs,
		reconcile_interval_secs = config.reconcile.interval_secs,
		reset_interval_hours = config.reconcile.reset_interval_hours,
		backup_enabled = config.reconcile.backup_enabled,
		"server configuration loaded"
	);
	Ok(config)
}

fn validate_config(config: &ServerConfig) -> Result<(), ConfigError> {
	if config.dispatch.timeout_secs == 0 {
		return Err(ConfigError::Validation("dispatch.timeout_secs must be at least 1".to_string()));
	}
	if config.reconcile.interval_secs == 0 {
		return Err(ConfigError::Validation("reconcile.interval_secs must be at least 1".to_string()));
	}
	if config.reconcile.max_concurrent_nodes == 0 {
		return Err(ConfigError::Validation(
			"reconcile.max_concurrent_nodes must be at least 1".to_string(),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn environment_overrides_file_overrides_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("server.toml");
		std::fs::write(
			&path,
			"[dispatch]\ntimeout_secs = 10\n\n[reconcile]\ninterval_secs = 120\nbackup_enabled = false\n",
		)
		.unwrap();

		let config = load_from_sources(vec![
			Box::new(EnvSource::from_lookup(|name| {
				(name == "WGFLEET_SERVER_RECONCILE_INTERVAL_SECS").then(|| "60".to_string())
			})),
			Box::new(TomlSource::new(&path)),
			Box::new(DefaultsSource),
		])
		.unwrap();

		assert_eq!(config.dispatch.timeout_secs, 10);
		assert_eq!(config.reconcile.interval_secs, 60);
		assert!(!config.reconcile.backup_enabled);
		assert_eq!(config.reconcile.max_concurrent_nodes, 8);
		assert_eq!(config.logging.level, "info");
	}

	#[test]
	fn zero_timeout_is_rejected() {
		let err = load_from_sources(vec![Box::new(EnvSource::from_lookup(|name| {
			(name == "WGFLEET_SERVER_DISPATCH_TIMEOUT_SECS").then(|| "0".to_string())
		}))])
		.unwrap_err();
		assert!(matches!(err, ConfigError::Validation(_)));
	}
}
