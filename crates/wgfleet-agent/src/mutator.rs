// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local Config Mutator: applies interface and client changes to the store,
//! the `wg<N>.conf` files and the live daemon.
//!
//! All mutations run under one async mutex, so two RPCs never interleave their
//! read-modify-write of a config file.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wgfleet_proto::{
	ClientDetail, CreateClientRequest, SyncReport, UpdateClientRequest, UpdateInterfaceRequest,
	WgKeyPair, WgPublicKey,
};

use crate::config::AgentConfig;
use crate::daemon::TunnelDaemon;
use crate::error::{AgentError, Result};
use crate::store::{interface_name, LocalClient, LocalClientPatch, LocalInterface, LocalStore};
use crate::wgconf::{InterfaceDocument, PeerEntry};

/// Client addresses are searched in at most this many hosts after the gateway.
pub const ADDRESS_SEARCH_BOUND: u32 = 253;

const CLIENT_KEEPALIVE_SECS: u16 = 25;

#[derive(Debug)]
pub struct NewInterface {
	pub index: u32,
	pub key_pair: WgKeyPair,
}

#[derive(Debug, Clone)]
pub struct NewClient {
	pub name: String,
	pub public_key: WgPublicKey,
	pub address: Ipv4Addr,
	pub config: String,
}

pub struct LocalConfigMutator {
	config: Arc<AgentConfig>,
	store: LocalStore,
	daemon: Arc<dyn TunnelDaemon>,
	lock: Mutex<()>,
}

impl LocalConfigMutator {
	pub fn new(config: Arc<AgentConfig>, store: LocalStore, daemon: Arc<dyn TunnelDaemon>) -> Self {
		Self {
			config,
			store,
			daemon,
			lock: Mutex::new(()),
		}
	}

	#[tracing::instrument(skip(self))]
	pub async fn create_interface(&self, address_range: Ipv4Net, port: u16) -> Result<NewInterface> {
		let _guard = self.lock.lock().await;

		validate_gateway_range(&address_range)?;
		let existing = self.store.list_interfaces().await?;
		check_interface_conflicts(&existing, None, address_range, port)?;

		let used: HashSet<u32> = existing.iter().map(|i| i.index).collect();
		let index = (0..).find(|i| !used.contains(i)).unwrap_or_default();
		let name = interface_name(index);

		let key_pair = WgKeyPair::generate();
		let private_b64 = key_pair.private_key().to_base64();
		let public_b64 = key_pair.public_key().to_base64();

		let document = InterfaceDocument::new(address_range, port, private_b64.clone(), self.config.firewall_hooks);

		tokio::fs::create_dir_all(&self.config.wg_dir).await?;
		write_private(&self.config.private_key_path(index), private_b64.expose()).await?;
		write_private(&self.config.public_key_path(index), &public_b64).await?;
		write_private(&self.config.conf_path(index), &document.render()).await?;

		let record = LocalInterface {
			index,
			private_key: private_b64,
			public_key: public_b64,
			port,
			address_range,
			enabled: true,
		};
		if let Err(e) = self.store.insert_interface(&record).await {
			self.remove_interface_files(index).await;
			return Err(e);
		}

		if let Err(e) = self.daemon.enable(&name).await {
			warn!(interface = %name, error = %e, "service failed to start, rolling back interface");
			self.remove_interface_files(index).await;
			if let Err(cleanup) = self.store.delete_interface(index).await {
				warn!(interface = %name, error = %cleanup, "failed to remove interface record during rollback");
			}
			return Err(e.into());
		}

		info!(interface = %name, port, range = %address_range, "interface created");
		Ok(NewInterface { index, key_pair })
	}

	#[tracing::instrument(skip(self, request), fields(interface = request.index))]
	pub async fn update_interface(&self, request: &UpdateInterfaceRequest) -> Result<()> {
		let _guard = self.lock.lock().await;

		let current = self
			.store
			.get_interface(request.index)
			.await?
			.ok_or_else(|| AgentError::NotFound(interface_name(request.index)))?;

		let mut updated = current.clone();
		if let Some(range) = request.address_range {
			validate_gateway_range(&range)?;
			updated.address_range = range;
		}
		if let Some(port) = request.port {
			updated.port = port;
		}
		if let Some(enabled) = request.enabled {
			updated.enabled = enabled;
		}

		let others = self.store.list_interfaces().await?;
		check_interface_conflicts(&others, Some(updated.index), updated.address_range, updated.port)?;
		if request.address_range.is_some() {
			for client in self.store.clients_on(updated.index).await? {
				if !fits_range(&updated.address_range, client.address) {
					return Err(AgentError::Conflict(format!(
						"client '{}' at {} would fall outside {}",
						client.name, client.address, updated.address_range
					)));
				}
			}
		}

		let mut document = self.load_document(&current).await?;
		document.address = updated.address_range;
		document.listen_port = updated.port;
		self.backup_best_effort(updated.index).await;
		write_private(&self.config.conf_path(updated.index), &document.render()).await?;
		self.store.save_interface(&updated).await?;

		let name = updated.name();
		match (current.enabled, updated.enabled) {
			(_, false) if current.enabled => self.daemon.disable(&name).await?,
			(false, true) => self.daemon.enable(&name).await?,
			(true, true) => self.daemon.restart(&name).await?,
			_ => {}
		}

		info!(interface = %name, enabled = updated.enabled, "interface updated");
		Ok(())
	}

	/// Stops the service, removes key material and config, and drops every
	/// client on the interface. Returns the removed client names.
	#[tracing::instrument(skip(self))]
	pub async fn delete_interface(&self, index: u32) -> Result<Vec<String>> {
		let _guard = self.lock.lock().await;

		let iface = self
			.store
			.get_interface(index)
			.await?
			.ok_or_else(|| AgentError::NotFound(interface_name(index)))?;
		let name = iface.name();

		if let Err(e) = self.daemon.disable(&name).await {
			warn!(interface = %name, error = %e, "failed to stop service, removing interface anyway");
		}
		self.backup_best_effort(index).await;
		self.remove_interface_files(index).await;

		let removed = self.store.delete_interface(index).await?;
		info!(interface = %name, removed = removed.len(), "interface deleted");
		Ok(removed)
	}

	#[tracing::instrument(skip(self, request), fields(client = %request.name, interface = request.interface_index))]
	pub async fn create_client(&self, request: &CreateClientRequest) -> Result<NewClient> {
		let _guard = self.lock.lock().await;

		validate_client_name(&request.name)?;
		if self.store.get_client(&request.name).await?.is_some() {
			return Err(AgentError::Conflict(format!("client '{}' already exists", request.name)));
		}
		let iface = self
			.store
			.get_interface(request.interface_index)
			.await?
			.ok_or_else(|| AgentError::NotFound(interface_name(request.interface_index)))?;

		let taken = self.taken_addresses(&iface).await?;
		let address = allocate_address(iface.address_range, &taken)
			.ok_or_else(|| AgentError::SubnetExhausted(iface.address_range.trunc().to_string()))?;

		let key_pair = WgKeyPair::generate();
		let client = LocalClient {
			name: request.name.clone(),
			interface_index: iface.index,
			public_key: key_pair.public_key().to_base64(),
			private_key: key_pair.private_key().to_base64(),
			address,
			created_at: Utc::now(),
			expires_at: request.expires_at,
			quota_bytes: request.quota_bytes,
			note: request.note.clone(),
			enabled: true,
		};
		self.store.insert_client(&client).await?;

		let applied: Result<()> = async {
			let mut document = self.load_document(&iface).await?;
			document.upsert_peer(PeerEntry::client(&client.name, &client.public_key, address));
			self.apply_document(&iface, &document).await
		}
		.await;
		if let Err(e) = applied {
			warn!(client = %client.name, error = %e, "failed to apply peer, removing client record");
			if let Err(cleanup) = self.store.delete_client(&client.name).await {
				warn!(client = %client.name, error = %cleanup, "failed to remove client record during rollback");
			}
			return Err(e);
		}

		info!(client = %client.name, %address, "client created");
		Ok(NewClient {
			name: client.name.clone(),
			public_key: *key_pair.public_key(),
			address,
			config: self.client_profile(&client, &iface),
		})
	}

	/// Record-only fields are written as given; an enabled flip also adds or
	/// removes the live peer entry.
	#[tracing::instrument(skip(self, request), fields(client = %request.name))]
	pub async fn update_client(&self, request: &UpdateClientRequest) -> Result<()> {
		let _guard = self.lock.lock().await;

		let client = self.require_client(&request.name).await?;

		if let Some(enabled) = request.enabled.filter(|e| *e != client.enabled) {
			let iface = self.require_interface(client.interface_index).await?;
			let mut document = self.load_document(&iface).await?;
			if enabled {
				document.upsert_peer(PeerEntry::client(&client.name, &client.public_key, client.address));
			} else if document.remove_peer(&client.public_key).is_none() {
				warn!(client = %client.name, "peer entry already absent while disabling");
			}
			self.apply_document(&iface, &document).await?;
			info!(client = %client.name, enabled, "client peer toggled");
		}

		self.store
			.update_client(
				&client.name,
				&LocalClientPatch {
					expires_at: request.expires_at,
					quota_bytes: request.quota_bytes,
					note: request.note.clone(),
					enabled: request.enabled,
				},
			)
			.await
	}

	/// Removing the peer entry is best-effort; the record is always purged.
	#[tracing::instrument(skip(self))]
	pub async fn delete_client(&self, name: &str) -> Result<()> {
		let _guard = self.lock.lock().await;

		let client = self.require_client(name).await?;
		match self.store.get_interface(client.interface_index).await? {
			Some(iface) => {
				if let Err(e) = self.remove_peer(&iface, &client).await {
					warn!(client = %name, error = %e, "failed to remove peer entry, deleting record anyway");
				}
			}
			None => warn!(client = %name, interface = client.interface_index, "owning interface is missing"),
		}

		self.store.delete_client(name).await?;
		info!(client = %name, "client deleted");
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn client_config(&self, name: &str) -> Result<String> {
		let client = self.require_client(name).await?;
		let iface = self.require_interface(client.interface_index).await?;
		Ok(self.client_profile(&client, &iface))
	}

	/// Stored fields plus live counters; counters are zero when the daemon
	/// cannot be read.
	#[tracing::instrument(skip(self))]
	pub async fn client_detail(&self, name: &str) -> Result<ClientDetail> {
		let client = self.require_client(name).await?;
		let interface = interface_name(client.interface_index);

		let live = match self.daemon.dump(&interface).await {
			Ok(peers) => peers.into_iter().find(|p| p.public_key == client.public_key),
			Err(e) => {
				warn!(%interface, error = %e, "live counters unavailable");
				None
			}
		};

		Ok(ClientDetail {
			public_key: WgPublicKey::from_base64(&client.public_key)?,
			name: client.name,
			interface_index: client.interface_index,
			address: client.address,
			enabled: client.enabled,
			created_at: client.created_at,
			expires_at: client.expires_at,
			quota_bytes: client.quota_bytes,
			note: client.note,
			rx_bytes: live.as_ref().map_or(0, |p| p.rx_bytes),
			tx_bytes: live.as_ref().map_or(0, |p| p.tx_bytes),
			latest_handshake: live.as_ref().and_then(|p| p.latest_handshake),
			endpoint: live.and_then(|p| p.endpoint),
		})
	}

	/// Restarts every enabled interface and/or snapshots every config.
	/// Per-interface failures are logged and left out of the report.
	#[tracing::instrument(skip(self))]
	pub async fn sync(&self, reload: bool, backup: bool) -> Result<SyncReport> {
		let _guard = self.lock.lock().await;

		let mut report = SyncReport::default();
		for iface in self.store.list_interfaces().await? {
			let name = iface.name();
			if backup {
				match self.backup(iface.index).await {
					Ok(()) => report.backed_up.push(iface.index),
					Err(e) => warn!(interface = %name, error = %e, "backup failed"),
				}
			}
			if reload && iface.enabled {
				match self.daemon.restart(&name).await {
					Ok(()) => report.reloaded.push(iface.index),
					Err(e) => warn!(interface = %name, error = %e, "reload failed"),
				}
			}
		}
		debug!(reloaded = ?report.reloaded, backed_up = ?report.backed_up, "sync finished");
		Ok(report)
	}

	async fn require_client(&self, name: &str) -> Result<LocalClient> {
		self.store
			.get_client(name)
			.await?
			.ok_or_else(|| AgentError::NotFound(format!("client '{name}'")))
	}

	async fn require_interface(&self, index: u32) -> Result<LocalInterface> {
		self.store
			.get_interface(index)
			.await?
			.ok_or_else(|| AgentError::NotFound(interface_name(index)))
	}

	async fn remove_peer(&self, iface: &LocalInterface, client: &LocalClient) -> Result<()> {
		let mut document = self.load_document(iface).await?;
		if document.remove_peer(&client.public_key).is_none() {
			warn!(client = %client.name, "peer entry missing from interface config");
			return Ok(());
		}
		self.apply_document(iface, &document).await
	}

	/// Parses the interface's config file, or rebuilds it from the store when
	/// the file is gone.
	async fn load_document(&self, iface: &LocalInterface) -> Result<InterfaceDocument> {
		let path = self.config.conf_path(iface.index);
		match tokio::fs::read_to_string(&path).await {
			Ok(text) => Ok(InterfaceDocument::parse(&text)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				warn!(path = %path.display(), "interface config missing, rebuilding from store");
				let mut document = InterfaceDocument::new(
					iface.address_range,
					iface.port,
					iface.private_key.clone(),
					self.config.firewall_hooks,
				);
				for client in self.store.clients_on(iface.index).await? {
					if client.enabled {
						document.upsert_peer(PeerEntry::client(&client.name, &client.public_key, client.address));
					}
				}
				Ok(document)
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Writes the config and, for a running interface, live-reloads the peer set.
	async fn apply_document(&self, iface: &LocalInterface, document: &InterfaceDocument) -> Result<()> {
		self.backup_best_effort(iface.index).await;
		write_private(&self.config.conf_path(iface.index), &document.render()).await?;
		if iface.enabled {
			self.daemon
				.sync_config(&iface.name(), &document.render_stripped())
				.await?;
		}
		Ok(())
	}

	async fn taken_addresses(&self, iface: &LocalInterface) -> Result<HashSet<Ipv4Addr>> {
		let mut taken: HashSet<Ipv4Addr> = self
			.store
			.clients_on(iface.index)
			.await?
			.into_iter()
			.map(|c| c.address)
			.collect();

		match self.daemon.dump(&iface.name()).await {
			Ok(peers) => {
				for ip in peers.iter().flat_map(|p| p.allowed_ips.iter()) {
					if let Ok(net) = ip.parse::<Ipv4Net>() {
						taken.insert(net.addr());
					}
				}
			}
			Err(e) => warn!(interface = %iface.name(), error = %e, "live peer list unavailable, allocating from store only"),
		}
		Ok(taken)
	}

	fn client_profile(&self, client: &LocalClient, iface: &LocalInterface) -> String {
		format!(
			"[Interface]\n\
			 PrivateKey = {private}\n\
			 Address = {address}/32\n\
			 DNS = {dns}\n\
			 MTU = {mtu}\n\
			 \n\
			 [Peer]\n\
			 PublicKey = {server}\n\
			 Endpoint = {host}:{port}\n\
			 AllowedIPs = 0.0.0.0/0, ::/0\n\
			 PersistentKeepalive = {keepalive}\n",
			private = client.private_key.expose(),
			address = client.address,
			dns = self.config.dns,
			mtu = self.config.mtu,
			server = iface.public_key,
			host = self.config.endpoint_host,
			port = iface.port,
			keepalive = CLIENT_KEEPALIVE_SECS,
		)
	}

	async fn backup_best_effort(&self, index: u32) {
		if !self.config.backup_on_change {
			return;
		}
		if let Err(e) = self.backup(index).await {
			warn!(interface = index, error = %e, "config backup failed");
		}
	}

	/// Copies `wg<N>.conf` to a timestamped file in the backup directory.
	async fn backup(&self, index: u32) -> Result<()> {
		let source = self.config.conf_path(index);
		let contents = match tokio::fs::read_to_string(&source).await {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		tokio::fs::create_dir_all(&self.config.backup_dir).await?;
		let target = self
			.config
			.backup_dir
			.join(backup_file_name(index, Utc::now()));
		write_private(&target, &contents).await?;
		debug!(path = %target.display(), "config backed up");
		Ok(())
	}

	async fn remove_interface_files(&self, index: u32) {
		for path in [
			self.config.conf_path(index),
			self.config.private_key_path(index),
			self.config.public_key_path(index),
		] {
			if let Err(e) = tokio::fs::remove_file(&path).await {
				if e.kind() != std::io::ErrorKind::NotFound {
					warn!(path = %path.display(), error = %e, "failed to remove interface file");
				}
			}
		}
	}
}

fn backup_file_name(index: u32, at: DateTime<Utc>) -> String {
	format!("wg{index}-{}.conf", at.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Writes `contents` to `path` readable only by the owner.
async fn write_private(path: &Path, contents: &str) -> Result<()> {
	let mut file = tokio::fs::OpenOptions::new()
		.write(true)
		.create(true)
		.truncate(true)
		.mode(0o600)
		.open(path)
		.await?;
	file.write_all(contents.as_bytes()).await?;
	file.flush().await?;
	tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
	Ok(())
}

fn validate_gateway_range(range: &Ipv4Net) -> Result<()> {
	if range.prefix_len() > 30 {
		return Err(AgentError::BadRequest(format!(
			"address range {range} leaves no room for clients"
		)));
	}
	if range.addr() == range.network() || range.addr() == range.broadcast() {
		return Err(AgentError::BadRequest(format!(
			"address range {range} must carry the gateway host address, e.g. {}/{}",
			Ipv4Addr::from(u32::from(range.network()) + 1),
			range.prefix_len()
		)));
	}
	Ok(())
}

/// Whether `address` is a usable client host in `range`: inside the subnet
/// and neither the gateway nor the network or broadcast address.
fn fits_range(range: &Ipv4Net, address: Ipv4Addr) -> bool {
	range.contains(&address)
		&& address != range.addr()
		&& address != range.network()
		&& address != range.broadcast()
}

fn validate_client_name(name: &str) -> Result<()> {
	if name.trim().is_empty() {
		return Err(AgentError::BadRequest("client name must not be empty".to_string()));
	}
	if name.chars().any(|c| c.is_control()) {
		return Err(AgentError::BadRequest("client name must not contain control characters".to_string()));
	}
	Ok(())
}

fn ranges_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
	a.contains(&b.network()) || b.contains(&a.network())
}

fn check_interface_conflicts(
	interfaces: &[LocalInterface],
	exclude: Option<u32>,
	range: Ipv4Net,
	port: u16,
) -> Result<()> {
	for other in interfaces.iter().filter(|i| Some(i.index) != exclude) {
		if other.port == port {
			return Err(AgentError::Conflict(format!("port {port} is used by {}", other.name())));
		}
		if ranges_overlap(&other.address_range, &range) {
			return Err(AgentError::Conflict(format!(
				"address range {range} overlaps {} on {}",
				other.address_range,
				other.name()
			)));
		}
	}
	Ok(())
}

/// Picks the lowest free host address, starting at the second usable host
/// (the first is the gateway) and never past [`ADDRESS_SEARCH_BOUND`] hosts.
pub fn allocate_address(range: Ipv4Net, taken: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
	let network = u32::from(range.network());
	let broadcast = u32::from(range.broadcast());
	(2..2 + ADDRESS_SEARCH_BOUND)
		.map(|offset| network.saturating_add(offset))
		.take_while(|candidate| *candidate < broadcast)
		.map(Ipv4Addr::from)
		.find(|candidate| *candidate != range.addr() && !taken.contains(candidate))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::tests::test_store;
	use crate::testing::FakeDaemon;
	use chrono::Duration;

	struct Harness {
		_dir: tempfile::TempDir,
		config: Arc<AgentConfig>,
		daemon: Arc<FakeDaemon>,
		store: LocalStore,
		mutator: LocalConfigMutator,
	}

	async fn harness() -> Harness {
		let dir = tempfile::tempdir().unwrap();
		let config = Arc::new(AgentConfig::for_directory(dir.path(), "k"));
		let daemon = Arc::new(FakeDaemon::new());
		let store = test_store().await;
		let mutator = LocalConfigMutator::new(config.clone(), store.clone(), daemon.clone());
		Harness {
			_dir: dir,
			config,
			daemon,
			store,
			mutator,
		}
	}

	fn client_request(name: &str, index: u32) -> CreateClientRequest {
		CreateClientRequest {
			interface_index: index,
			name: name.to_string(),
			expires_at: Utc::now() + Duration::days(30),
			quota_bytes: 0,
			note: String::new(),
		}
	}

	fn taken(hosts: &[u8]) -> HashSet<Ipv4Addr> {
		hosts.iter().map(|h| Ipv4Addr::new(10, 0, 0, *h)).collect()
	}

	#[test]
	fn allocation_skips_gateway_and_taken_hosts() {
		let range: Ipv4Net = "10.0.0.1/24".parse().unwrap();
		assert_eq!(allocate_address(range, &taken(&[])), Some(Ipv4Addr::new(10, 0, 0, 2)));
		assert_eq!(allocate_address(range, &taken(&[2, 3])), Some(Ipv4Addr::new(10, 0, 0, 4)));
		assert_eq!(allocate_address(range, &taken(&[2, 4])), Some(Ipv4Addr::new(10, 0, 0, 3)));
	}

	#[test]
	fn allocation_exhausts_a_full_subnet() {
		let range: Ipv4Net = "10.0.0.1/24".parse().unwrap();
		let all: Vec<u8> = (2..=254).collect();
		assert_eq!(allocate_address(range, &taken(&all)), None);

		let small: Ipv4Net = "10.0.0.1/30".parse().unwrap();
		assert_eq!(allocate_address(small, &taken(&[])), Some(Ipv4Addr::new(10, 0, 0, 2)));
		assert_eq!(allocate_address(small, &taken(&[2])), None);
	}

	#[test]
	fn allocation_is_bounded_in_large_subnets() {
		let range: Ipv4Net = "10.0.0.1/16".parse().unwrap();
		let full: HashSet<Ipv4Addr> = (2..2 + ADDRESS_SEARCH_BOUND)
			.map(|o| Ipv4Addr::from(u32::from(range.network()) + o))
			.collect();
		assert_eq!(allocate_address(range, &full), None);
	}

	#[test]
	fn overlapping_ranges_are_detected() {
		let a: Ipv4Net = "10.0.0.1/24".parse().unwrap();
		assert!(ranges_overlap(&a, &"10.0.0.129/25".parse().unwrap()));
		assert!(ranges_overlap(&a, &"10.0.0.1/16".parse().unwrap()));
		assert!(!ranges_overlap(&a, &"10.0.1.1/24".parse().unwrap()));
	}

	#[test]
	fn gateway_range_must_name_a_host() {
		assert!(validate_gateway_range(&"10.0.0.1/24".parse().unwrap()).is_ok());
		assert!(matches!(
			validate_gateway_range(&"10.0.0.0/24".parse().unwrap()),
			Err(AgentError::BadRequest(_))
		));
		assert!(matches!(
			validate_gateway_range(&"10.0.0.1/31".parse().unwrap()),
			Err(AgentError::BadRequest(_))
		));
	}

	#[tokio::test]
	async fn network_form_range_is_rejected_on_create() {
		let h = harness().await;
		let err = h
			.mutator
			.create_interface("10.0.0.0/24".parse().unwrap(), 51820)
			.await
			.unwrap_err();
		assert!(matches!(err, AgentError::BadRequest(_)));
		assert!(h.store.list_interfaces().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn create_interface_writes_files_and_starts_service() {
		let h = harness().await;
		let created = h
			.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		assert_eq!(created.index, 0);
		assert!(h.daemon.is_running("wg0"));

		let conf = std::fs::read_to_string(h.config.conf_path(0)).unwrap();
		assert!(conf.contains("ListenPort = 51820"));
		let mode = std::fs::metadata(h.config.conf_path(0)).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o600);

		let public = std::fs::read_to_string(h.config.public_key_path(0)).unwrap();
		assert_eq!(public, created.key_pair.public_key().to_base64());

		let second = h
			.mutator
			.create_interface("10.0.1.1/24".parse().unwrap(), 51821)
			.await
			.unwrap();
		assert_eq!(second.index, 1);
	}

	#[tokio::test]
	async fn create_interface_rejects_port_and_range_clashes() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();

		let port = h
			.mutator
			.create_interface("10.0.1.1/24".parse().unwrap(), 51820)
			.await
			.unwrap_err();
		assert!(matches!(port, AgentError::Conflict(_)));

		let range = h
			.mutator
			.create_interface("10.0.0.65/26".parse().unwrap(), 51821)
			.await
			.unwrap_err();
		assert!(matches!(range, AgentError::Conflict(_)));
	}

	#[tokio::test]
	async fn failed_service_start_rolls_back_interface() {
		let h = harness().await;
		h.daemon.fail("wg0");

		let err = h
			.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap_err();
		assert!(matches!(err, AgentError::Daemon(_)));
		assert!(h.store.get_interface(0).await.unwrap().is_none());
		assert!(!h.config.conf_path(0).exists());
	}

	#[tokio::test]
	async fn create_client_allocates_next_free_address_and_syncs() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();

		let alice = h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		let bob = h.mutator.create_client(&client_request("bob", 0)).await.unwrap();
		let carol = h.mutator.create_client(&client_request("carol", 0)).await.unwrap();

		assert_eq!(alice.address, Ipv4Addr::new(10, 0, 0, 2));
		assert_eq!(bob.address, Ipv4Addr::new(10, 0, 0, 3));
		assert_eq!(carol.address, Ipv4Addr::new(10, 0, 0, 4));

		assert_eq!(h.daemon.peers("wg0").len(), 3);
		assert!(h.daemon.calls().iter().all(|c| !c.starts_with("restart")));

		let conf = std::fs::read_to_string(h.config.conf_path(0)).unwrap();
		assert!(conf.contains("# carol"));
	}

	#[tokio::test]
	async fn create_client_skips_addresses_only_the_daemon_knows() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.daemon.inject_peer("wg0", "c3RyYXk=", "10.0.0.2/32");

		let client = h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		assert_eq!(client.address, Ipv4Addr::new(10, 0, 0, 3));
	}

	#[tokio::test]
	async fn client_profile_has_routing_and_endpoint() {
		let h = harness().await;
		let iface = h
			.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		let client = h.mutator.create_client(&client_request("alice", 0)).await.unwrap();

		assert!(client.config.contains("Address = 10.0.0.2/32"));
		assert!(client.config.contains("Endpoint = vpn.example.net:51820"));
		assert!(client.config.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
		assert!(client.config.contains("PersistentKeepalive = 25"));
		assert!(client.config.contains("MTU = 1420"));
		assert!(client
			.config
			.contains(&format!("PublicKey = {}", iface.key_pair.public_key().to_base64())));

		let fetched = h.mutator.client_config("alice").await.unwrap();
		assert_eq!(fetched, client.config);
	}

	#[tokio::test]
	async fn create_client_reports_conflict_and_missing_interface() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();

		let dup = h.mutator.create_client(&client_request("alice", 0)).await.unwrap_err();
		assert!(matches!(dup, AgentError::Conflict(_)));

		let missing = h.mutator.create_client(&client_request("bob", 7)).await.unwrap_err();
		assert!(matches!(missing, AgentError::NotFound(_)));
	}

	#[tokio::test]
	async fn full_subnet_reports_exhaustion() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/30".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();

		let err = h.mutator.create_client(&client_request("bob", 0)).await.unwrap_err();
		assert!(matches!(err, AgentError::SubnetExhausted(_)));
	}

	#[tokio::test]
	async fn disabling_removes_peer_and_enabling_restores_it() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		let alice = h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		let key = alice.public_key.to_base64();

		h.mutator
			.update_client(&UpdateClientRequest::disable("alice"))
			.await
			.unwrap();
		assert!(!h.daemon.peers("wg0").contains(&key));
		assert!(!h.store.get_client("alice").await.unwrap().unwrap().enabled);

		h.mutator
			.update_client(&UpdateClientRequest {
				name: "alice".to_string(),
				enabled: Some(true),
				..Default::default()
			})
			.await
			.unwrap();
		assert!(h.daemon.peers("wg0").contains(&key));
	}

	#[tokio::test]
	async fn record_only_update_does_not_touch_daemon() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		let calls_before = h.daemon.calls().len();

		h.mutator
			.update_client(&UpdateClientRequest {
				name: "alice".to_string(),
				quota_bytes: Some(1_000),
				enabled: Some(true),
				note: Some("vip".to_string()),
				..Default::default()
			})
			.await
			.unwrap();

		assert_eq!(h.daemon.calls().len(), calls_before);
		let stored = h.store.get_client("alice").await.unwrap().unwrap();
		assert_eq!(stored.quota_bytes, 1_000);
		assert_eq!(stored.note, "vip");
	}

	#[tokio::test]
	async fn delete_client_tolerates_missing_peer_entry() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		h.mutator
			.update_client(&UpdateClientRequest::disable("alice"))
			.await
			.unwrap();

		h.mutator.delete_client("alice").await.unwrap();
		assert!(h.store.get_client("alice").await.unwrap().is_none());

		let err = h.mutator.delete_client("alice").await.unwrap_err();
		assert!(matches!(err, AgentError::NotFound(_)));
	}

	#[tokio::test]
	async fn delete_interface_cascades_clients_and_files() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		h.mutator.create_client(&client_request("bob", 0)).await.unwrap();

		let removed = h.mutator.delete_interface(0).await.unwrap();
		assert_eq!(removed, vec!["alice", "bob"]);
		assert!(!h.config.conf_path(0).exists());
		assert!(!h.config.private_key_path(0).exists());
		assert!(!h.daemon.is_running("wg0"));
		assert_eq!(h.store.count_clients().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn update_interface_changes_port_and_stops_when_disabled() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();

		h.mutator
			.update_interface(&UpdateInterfaceRequest {
				index: 0,
				address_range: None,
				port: Some(51900),
				enabled: None,
			})
			.await
			.unwrap();
		let conf = std::fs::read_to_string(h.config.conf_path(0)).unwrap();
		assert!(conf.contains("ListenPort = 51900"));
		assert!(h.daemon.calls().contains(&"restart wg0".to_string()));

		h.mutator
			.update_interface(&UpdateInterfaceRequest {
				index: 0,
				address_range: None,
				port: None,
				enabled: Some(false),
			})
			.await
			.unwrap();
		assert!(!h.daemon.is_running("wg0"));
		assert!(!h.store.get_interface(0).await.unwrap().unwrap().enabled);
	}

	#[tokio::test]
	async fn range_change_must_keep_existing_clients_inside() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		h.mutator.create_client(&client_request("bob", 0)).await.unwrap();
		h.mutator
			.update_client(&UpdateClientRequest::disable("bob"))
			.await
			.unwrap();

		let moved = UpdateInterfaceRequest {
			index: 0,
			address_range: Some("10.9.0.1/24".parse().unwrap()),
			..Default::default()
		};
		let err = h.mutator.update_interface(&moved).await.unwrap_err();
		assert!(matches!(err, AgentError::Conflict(_)));
		let iface = h.store.get_interface(0).await.unwrap().unwrap();
		assert_eq!(iface.address_range, "10.0.0.1/24".parse::<Ipv4Net>().unwrap());

		// Gateway moved onto bob's address, and bob is disabled but still counts.
		let onto_client = UpdateInterfaceRequest {
			index: 0,
			address_range: Some("10.0.0.3/24".parse().unwrap()),
			..Default::default()
		};
		assert!(matches!(
			h.mutator.update_interface(&onto_client).await.unwrap_err(),
			AgentError::Conflict(_)
		));

		let widened = UpdateInterfaceRequest {
			index: 0,
			address_range: Some("10.0.0.1/16".parse().unwrap()),
			..Default::default()
		};
		h.mutator.update_interface(&widened).await.unwrap();
	}

	#[test]
	fn client_hosts_exclude_gateway_and_edges() {
		let range: Ipv4Net = "10.0.0.1/24".parse().unwrap();
		assert!(fits_range(&range, Ipv4Addr::new(10, 0, 0, 2)));
		assert!(!fits_range(&range, Ipv4Addr::new(10, 0, 0, 1)));
		assert!(!fits_range(&range, Ipv4Addr::new(10, 0, 0, 255)));
		assert!(!fits_range(&range, Ipv4Addr::new(10, 0, 1, 2)));
	}

	#[tokio::test]
	async fn client_detail_reads_live_counters() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		let alice = h.mutator.create_client(&client_request("alice", 0)).await.unwrap();
		h.daemon
			.set_counters(&alice.public_key.to_base64(), 4096, 1024, Some(Utc::now()));

		let detail = h.mutator.client_detail("alice").await.unwrap();
		assert_eq!(detail.rx_bytes, 4096);
		assert_eq!(detail.tx_bytes, 1024);
		assert!(detail.latest_handshake.is_some());
		assert_eq!(detail.address, Ipv4Addr::new(10, 0, 0, 2));
	}

	#[tokio::test]
	async fn sync_reloads_enabled_interfaces_and_backs_up_all() {
		let h = harness().await;
		h.mutator
			.create_interface("10.0.0.1/24".parse().unwrap(), 51820)
			.await
			.unwrap();
		h.mutator
			.create_interface("10.0.1.1/24".parse().unwrap(), 51821)
			.await
			.unwrap();
		h.mutator
			.update_interface(&UpdateInterfaceRequest {
				index: 1,
				address_range: None,
				port: None,
				enabled: Some(false),
			})
			.await
			.unwrap();

		let report = h.mutator.sync(true, true).await.unwrap();
		assert_eq!(report.reloaded, vec![0]);
		assert_eq!(report.backed_up, vec![0, 1]);

		let backups = std::fs::read_dir(&h.config.backup_dir).unwrap().count();
		assert_eq!(backups, 2);
	}

	#[test]
	fn backup_names_are_sortable_timestamps() {
		let at = DateTime::parse_from_rfc3339("2025-03-04T05:06:07.089Z")
			.unwrap()
			.with_timezone(&Utc);
		assert_eq!(backup_file_name(3, at), "wg3-20250304T050607.089Z.conf");
	}
}
