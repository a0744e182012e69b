// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Structured `wg-quick` interface document.
//!
//! The on-disk config is always produced by [`InterfaceDocument::render`];
//! peers are edited as records keyed by public key and never by matching text
//! in the file. Each peer carries the client name as a comment line so the
//! file stays readable by operators.

use ipnet::Ipv4Net;
use std::fmt::Write as _;
use thiserror::Error;
use wgfleet_common_secret::SecretString;

/// Interface keys understood only by `wg-quick`; `wg syncconf` rejects them.
const WG_QUICK_ONLY_KEYS: &[&str] = &[
	"address",
	"dns",
	"mtu",
	"table",
	"preup",
	"postup",
	"predown",
	"postdown",
	"saveconfig",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
	#[error("line {line}: {message}")]
	Invalid { line: usize, message: String },

	#[error("missing [Interface] key {0}")]
	MissingKey(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
	/// Client name, rendered as a `# name` comment.
	pub name: String,
	pub public_key: String,
	pub allowed_ips: Vec<Ipv4Net>,
	/// Other peer keys (`Endpoint`, `PersistentKeepalive`, ...) kept verbatim.
	pub extra: Vec<(String, String)>,
}

impl PeerEntry {
	pub fn client(name: impl Into<String>, public_key: impl Into<String>, address: std::net::Ipv4Addr) -> Self {
		Self {
			name: name.into(),
			public_key: public_key.into(),
			allowed_ips: vec![Ipv4Net::from(address)],
			extra: Vec::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct InterfaceDocument {
	pub address: Ipv4Net,
	pub listen_port: u16,
	pub private_key: SecretString,
	/// Generate `ufw allow/delete allow <port>/udp` hooks.
	pub firewall_hooks: bool,
	pub post_up: Vec<String>,
	pub post_down: Vec<String>,
	pub extra: Vec<(String, String)>,
	peers: Vec<PeerEntry>,
}

impl InterfaceDocument {
	pub fn new(address: Ipv4Net, listen_port: u16, private_key: SecretString, firewall_hooks: bool) -> Self {
		Self {
			address,
			listen_port,
			private_key,
			firewall_hooks,
			post_up: Vec::new(),
			post_down: Vec::new(),
			extra: Vec::new(),
			peers: Vec::new(),
		}
	}

	pub fn peers(&self) -> &[PeerEntry] {
		&self.peers
	}

	pub fn contains_peer(&self, public_key: &str) -> bool {
		self.peers.iter().any(|p| p.public_key == public_key)
	}

	/// Replaces the peer with the same public key, or appends it.
	pub fn upsert_peer(&mut self, peer: PeerEntry) {
		match self.peers.iter_mut().find(|p| p.public_key == peer.public_key) {
			Some(existing) => *existing = peer,
			None => self.peers.push(peer),
		}
	}

	pub fn remove_peer(&mut self, public_key: &str) -> Option<PeerEntry> {
		let pos = self.peers.iter().position(|p| p.public_key == public_key)?;
		Some(self.peers.remove(pos))
	}

	fn hook_lines(&self) -> (Vec<String>, Vec<String>) {
		let mut up = Vec::new();
		let mut down = Vec::new();
		if self.firewall_hooks {
			up.push(format!("ufw allow {}/udp", self.listen_port));
			down.push(format!("ufw delete allow {}/udp", self.listen_port));
		}
		up.extend(self.post_up.iter().cloned());
		down.extend(self.post_down.iter().cloned());
		(up, down)
	}

	/// Full `wg-quick` config.
	pub fn render(&self) -> String {
		let mut out = String::new();
		let (up, down) = self.hook_lines();

		out.push_str("[Interface]\n");
		let _ = writeln!(out, "Address = {}", self.address);
		let _ = writeln!(out, "ListenPort = {}", self.listen_port);
		let _ = writeln!(out, "PrivateKey = {}", self.private_key.expose());
		for line in &up {
			let _ = writeln!(out, "PostUp = {line}");
		}
		for line in &down {
			let _ = writeln!(out, "PostDown = {line}");
		}
		for (k, v) in &self.extra {
			let _ = writeln!(out, "{k} = {v}");
		}

		for peer in &self.peers {
			out.push_str("\n[Peer]\n");
			if !peer.name.is_empty() {
				let _ = writeln!(out, "# {}", peer.name);
			}
			render_peer_keys(&mut out, peer);
		}
		out
	}

	/// Config accepted by `wg syncconf`: the equivalent of `wg-quick strip`.
	pub fn render_stripped(&self) -> String {
		let mut out = String::new();
		out.push_str("[Interface]\n");
		let _ = writeln!(out, "ListenPort = {}", self.listen_port);
		let _ = writeln!(out, "PrivateKey = {}", self.private_key.expose());
		for (k, v) in &self.extra {
			if !WG_QUICK_ONLY_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
				let _ = writeln!(out, "{k} = {v}");
			}
		}
		for peer in &self.peers {
			out.push_str("\n[Peer]\n");
			render_peer_keys(&mut out, peer);
		}
		out
	}

	pub fn parse(text: &str) -> Result<Self, ParseError> {
		enum Section {
			None,
			Interface,
			Peer,
		}

		let mut section = Section::None;
		let mut address = None;
		let mut listen_port = None;
		let mut private_key = None;
		let mut post_up = Vec::new();
		let mut post_down = Vec::new();
		let mut extra = Vec::new();
		let mut peers: Vec<PeerEntry> = Vec::new();

		for (i, raw) in text.lines().enumerate() {
			let line_no = i + 1;
			let line = raw.trim();
			if line.is_empty() {
				continue;
			}
			let invalid = |message: String| ParseError::Invalid {
				line: line_no,
				message,
			};

			if line.eq_ignore_ascii_case("[interface]") {
				section = Section::Interface;
				continue;
			}
			if line.eq_ignore_ascii_case("[peer]") {
				section = Section::Peer;
				peers.push(PeerEntry {
					name: String::new(),
					public_key: String::new(),
					allowed_ips: Vec::new(),
					extra: Vec::new(),
				});
				continue;
			}
			if let Some(comment) = line.strip_prefix('#') {
				if let (Section::Peer, Some(peer)) = (&section, peers.last_mut()) {
					if peer.name.is_empty() && peer.public_key.is_empty() {
						peer.name = comment.trim().to_string();
					}
				}
				continue;
			}

			let (key, value) = line
				.split_once('=')
				.map(|(k, v)| (k.trim(), v.trim()))
				.ok_or_else(|| invalid(format!("expected key = value, got '{line}'")))?;

			match section {
				Section::None => return Err(invalid("key outside of a section".to_string())),
				Section::Interface => match key.to_ascii_lowercase().as_str() {
					"address" => {
						address = Some(
							value
								.parse::<Ipv4Net>()
								.map_err(|e| invalid(format!("bad Address '{value}': {e}")))?,
						)
					}
					"listenport" => {
						listen_port = Some(
							value
								.parse::<u16>()
								.map_err(|e| invalid(format!("bad ListenPort '{value}': {e}")))?,
						)
					}
					"privatekey" => private_key = Some(SecretString::new(value.to_string())),
					"postup" => post_up.push(value.to_string()),
					"postdown" => post_down.push(value.to_string()),
					_ => extra.push((key.to_string(), value.to_string())),
				},
				Section::Peer => {
					let Some(peer) = peers.last_mut() else {
						return Err(invalid("peer key before [Peer]".to_string()));
					};
					match key.to_ascii_lowercase().as_str() {
						"publickey" => peer.public_key = value.to_string(),
						"allowedips" => {
							for ip in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
								peer.allowed_ips.push(
									ip.parse::<Ipv4Net>()
										.map_err(|e| invalid(format!("bad AllowedIPs '{ip}': {e}")))?,
								);
							}
						}
						_ => peer.extra.push((key.to_string(), value.to_string())),
					}
				}
			}
		}

		if let Some(missing) = peers.iter().position(|p| p.public_key.is_empty()) {
			return Err(ParseError::Invalid {
				line: 0,
				message: format!("peer #{} has no PublicKey", missing + 1),
			});
		}

		let address = address.ok_or(ParseError::MissingKey("Address"))?;
		let listen_port = listen_port.ok_or(ParseError::MissingKey("ListenPort"))?;
		let private_key = private_key.ok_or(ParseError::MissingKey("PrivateKey"))?;

		let up_hook = format!("ufw allow {listen_port}/udp");
		let down_hook = format!("ufw delete allow {listen_port}/udp");
		let firewall_hooks = post_up.contains(&up_hook) && post_down.contains(&down_hook);
		if firewall_hooks {
			post_up.retain(|l| *l != up_hook);
			post_down.retain(|l| *l != down_hook);
		}

		Ok(Self {
			address,
			listen_port,
			private_key,
			firewall_hooks,
			post_up,
			post_down,
			extra,
			peers,
		})
	}
}

fn render_peer_keys(out: &mut String, peer: &PeerEntry) {
	let _ = writeln!(out, "PublicKey = {}", peer.public_key);
	let ips: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();
	let _ = writeln!(out, "AllowedIPs = {}", ips.join(", "));
	for (k, v) in &peer.extra {
		let _ = writeln!(out, "{k} = {v}");
	}
}
