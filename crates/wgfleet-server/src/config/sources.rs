// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sources: built-in defaults, a TOML file and the environment.

use std::path::PathBuf;

use tracing::{debug, trace};

use super::error::ConfigError;
use super::layer::ServerConfigLayer;
use super::sections::{DatabaseConfigLayer, DispatchConfigLayer, LoggingConfigLayer, ReconcileConfigLayer};

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ServerConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading defaults");
		Ok(ServerConfigLayer::default())
	}
}

pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn system() -> Self {
		Self::new("/etc/wgfleet/server.toml")
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ServerConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		let layer: ServerConfigLayer = toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})?;

		trace!("parsed config layer from TOML");
		Ok(layer)
	}
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Environment variable source.
///
/// Convention: `WGFLEET_SERVER_<SECTION>_<FIELD>`
pub struct EnvSource {
	lookup: Lookup,
}

impl Default for EnvSource {
	fn default() -> Self {
		Self::from_lookup(|name| std::env::var(name).ok())
	}
}

impl EnvSource {
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
		Self {
			lookup: Box::new(lookup),
		}
	}

	fn var(&self, name: &str) -> Option<String> {
		(self.lookup)(name).filter(|s| !s.is_empty())
	}

	fn bool(&self, name: &str) -> Option<bool> {
		self.var(name).map(|v| v.eq_ignore_ascii_case("true") || v == "1")
	}

	fn parsed<T: std::str::FromStr>(&self, name: &str, kind: &str) -> Result<Option<T>, ConfigError> {
		match self.var(name) {
			Some(v) => v.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
				key: name.to_string(),
				message: format!("invalid {kind} value '{v}'"),
			}),
			None => Ok(None),
		}
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ServerConfigLayer, ConfigError> {
		debug!("loading environment variables");
		Ok(ServerConfigLayer {
			database: Some(DatabaseConfigLayer {
				url: self.var("WGFLEET_SERVER_DATABASE_URL"),
			}),
			dispatch: Some(DispatchConfigLayer {
				timeout_secs: self.parsed("WGFLEET_SERVER_DISPATCH_TIMEOUT_SECS", "u64")?,
			}),
			reconcile: Some(ReconcileConfigLayer {
				interval_secs: self.parsed("WGFLEET_SERVER_RECONCILE_INTERVAL_SECS", "u64")?,
				reset_interval_hours: self.parsed("WGFLEET_SERVER_RECONCILE_RESET_INTERVAL_HOURS", "u64")?,
				backup_enabled: self.bool("WGFLEET_SERVER_RECONCILE_BACKUP_ENABLED"),
				max_concurrent_nodes: self.parsed("WGFLEET_SERVER_RECONCILE_MAX_CONCURRENT_NODES", "usize")?,
			}),
			logging: Some(LoggingConfigLayer {
				level: self.var("WGFLEET_SERVER_LOGGING_LEVEL"),
			}),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn env(vars: &[(&str, &str)]) -> EnvSource {
		let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		EnvSource::from_lookup(move |name| map.get(name).cloned())
	}

	#[test]
	fn precedence_orders_sources() {
		assert!(Precedence::Defaults < Precedence::ConfigFile);
		assert!(Precedence::ConfigFile < Precedence::Environment);
	}

	#[test]
	fn missing_file_yields_empty_layer() {
		let layer = TomlSource::new("/nonexistent/wgfleet.toml").load().unwrap();
		assert_eq!(layer, ServerConfigLayer::default());
	}

	#[test]
	fn malformed_file_is_a_parse_error() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("server.toml");
		std::fs::write(&path, "[dispatch\ntimeout_secs = ").unwrap();
		let err = TomlSource::new(&path).load().unwrap_err();
		assert!(matches!(err, ConfigError::TomlParse { .. }));
	}

	#[test]
	fn env_values_are_read() {
		let layer = env(&[
			("WGFLEET_SERVER_DISPATCH_TIMEOUT_SECS", "5"),
			("WGFLEET_SERVER_RECONCILE_BACKUP_ENABLED", "false"),
			("WGFLEET_SERVER_RECONCILE_MAX_CONCURRENT_NODES", "2"),
			("WGFLEET_SERVER_LOGGING_LEVEL", ""),
		])
		.load()
		.unwrap();
		assert_eq!(layer.dispatch.unwrap().timeout_secs, Some(5));
		let reconcile = layer.reconcile.unwrap();
		assert_eq!(reconcile.backup_enabled, Some(false));
		assert_eq!(reconcile.max_concurrent_nodes, Some(2));
		assert_eq!(layer.logging.unwrap().level, None);
	}

	#[test]
	fn bad_number_names_the_variable() {
		let err = env(&[("WGFLEET_SERVER_RECONCILE_INTERVAL_SECS", "soon")]).load().unwrap_err();
		match err {
			ConfigError::InvalidValue { key, .. } => assert_eq!(key, "WGFLEET_SERVER_RECONCILE_INTERVAL_SECS"),
			other => panic!("unexpected error: {other}"),
		}
	}
}
