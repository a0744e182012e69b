// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use wgfleet_common_secret::SecretString;
use wgfleet_proto::DEFAULT_AGENT_PORT;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "WGFLEET_AGENT_";

#[derive(Debug, Clone)]
pub struct AgentConfig {
	/// Shared key the control plane must present in `X-API-Key`.
	pub api_key: SecretString,
	pub listen_addr: SocketAddr,
	pub database_url: String,
	/// Directory holding `wg<N>.conf` and the interface key files.
	pub wg_dir: PathBuf,
	pub backup_dir: PathBuf,
	/// Public host clients use as their `Endpoint`.
	pub endpoint_host: String,
	pub dns: String,
	pub mtu: u16,
	/// Snapshot interface configs before each peer-list change.
	pub backup_on_change: bool,
	/// Emit `PostUp`/`PostDown` ufw rules opening the listen port.
	pub firewall_hooks: bool,
	pub sample_interval: Duration,
	pub proc_root: PathBuf,
}

impl AgentConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	/// Builds the config from an arbitrary variable source; `from_env` passes the process environment.
	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

		let api_key = match (var("API_KEY"), var("API_KEY_FILE")) {
			(Some(key), _) => key,
			(None, Some(path)) => std::fs::read_to_string(&path)
				.map_err(|e| ConfigError::Parse(format!("cannot read {ENV_PREFIX}API_KEY_FILE {path}: {e}")))?
				.trim()
				.to_string(),
			(None, None) => return Err(ConfigError::MissingEnv(format!("{ENV_PREFIX}API_KEY"))),
		};
		let api_key = SecretString::new(api_key);
		if api_key.is_blank() {
			return Err(ConfigError::Parse("API key must not be empty".to_string()));
		}

		let endpoint_host = var("ENDPOINT_HOST")
			.ok_or_else(|| ConfigError::MissingEnv(format!("{ENV_PREFIX}ENDPOINT_HOST")))?;

		let listen_addr = parse_or(var("LISTEN"), "LISTEN", SocketAddr::from(([0, 0, 0, 0], DEFAULT_AGENT_PORT)))?;
		let wg_dir = var("WG_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/etc/wireguard"));
		let backup_dir = var("BACKUP_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(|| wg_dir.join("backups"));

		Ok(Self {
			api_key,
			listen_addr,
			database_url: var("DATABASE_URL")
				.unwrap_or_else(|| "sqlite:/var/lib/wgfleet/agent.db".to_string()),
			wg_dir,
			backup_dir,
			endpoint_host,
			dns: var("DNS").unwrap_or_else(|| "8.8.8.8".to_string()),
			mtu: parse_or(var("MTU"), "MTU", 1420)?,
			backup_on_change: parse_flag(var("BACKUP"), true),
			firewall_hooks: parse_flag(var("FIREWALL_HOOKS"), true),
			sample_interval: Duration::from_millis(parse_or(var("SAMPLE_MS"), "SAMPLE_MS", 1000)?),
			proc_root: var("PROC_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/proc")),
		})
	}

	/// Config rooted in `dir`, for tests and local experiments.
	pub fn for_directory(dir: impl Into<PathBuf>, api_key: &str) -> Self {
		let dir = dir.into();
		Self {
			api_key: SecretString::new(api_key.to_string()),
			listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_AGENT_PORT)),
			database_url: "sqlite::memory:".to_string(),
			wg_dir: dir.join("wireguard"),
			backup_dir: dir.join("backups"),
			endpoint_host: "vpn.example.net".to_string(),
			dns: "8.8.8.8".to_string(),
			mtu: 1420,
			backup_on_change: false,
			firewall_hooks: false,
			sample_interval: Duration::from_millis(10),
			proc_root: dir.join("proc"),
		}
	}

	pub fn conf_path(&self, index: u32) -> PathBuf {
		self.wg_dir.join(format!("wg{index}.conf"))
	}

	pub fn private_key_path(&self, index: u32) -> PathBuf {
		self.wg_dir.join(format!("server_private_wg{index}.key"))
	}

	pub fn public_key_path(&self, index: u32) -> PathBuf {
		self.wg_dir.join(format!("server_public_wg{index}.key"))
	}
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
	T::Err: std::fmt::Display,
{
	match value {
		Some(v) => v
			.trim()
			.parse()
			.map_err(|e| ConfigError::Parse(format!("invalid {ENV_PREFIX}{name} '{v}': {e}"))),
		None => Ok(default),
	}
}

fn parse_flag(value: Option<String>, default: bool) -> bool {
	value
		.map(|v| v != "0" && v.to_lowercase() != "false")
		.unwrap_or(default)
}
