// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard key material in the encoding `wg genkey` / `wg pubkey` produce
//! (standard base64 with padding, 44 characters).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;
use wgfleet_common_secret::SecretString;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

fn decode_32(s: &str) -> Result<[u8; 32]> {
	let bytes = STANDARD.decode(s.trim())?;
	<[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| KeyError::InvalidLength(bytes.len()))
}

#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct WgPrivateKey {
	bytes: [u8; 32],
}

impl WgPrivateKey {
	pub fn generate() -> Self {
		let secret = StaticSecret::random_from_rng(OsRng);
		Self {
			bytes: secret.to_bytes(),
		}
	}

	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		decode_32(s).map(Self::from_bytes)
	}

	pub fn to_base64(&self) -> SecretString {
		SecretString::new(STANDARD.encode(self.bytes))
	}

	pub fn public_key(&self) -> WgPublicKey {
		let secret = StaticSecret::from(self.bytes);
		WgPublicKey {
			bytes: *PublicKey::from(&secret).as_bytes(),
		}
	}
}

impl fmt::Debug for WgPrivateKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WgPrivateKey")
			.field("bytes", &"[REDACTED]")
			.finish()
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; 32],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; 32]) -> Self {
		Self { bytes }
	}

	pub fn from_base64(s: &str) -> Result<Self> {
		decode_32(s).map(Self::from_bytes)
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		f.debug_tuple("WgPublicKey")
			.field(&format!("{}...", &b64[..8]))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl std::str::FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// A freshly generated or restored key pair for an interface or a client.
#[derive(Clone, Debug)]
pub struct WgKeyPair {
	private: WgPrivateKey,
	public: WgPublicKey,
}

impl WgKeyPair {
	pub fn generate() -> Self {
		Self::from_private_key(WgPrivateKey::generate())
	}

	pub fn from_private_key(private: WgPrivateKey) -> Self {
		let public = private.public_key();
		Self { private, public }
	}

	pub fn from_base64(private_key: &str) -> Result<Self> {
		WgPrivateKey::from_base64(private_key).map(Self::from_private_key)
	}

	pub fn private_key(&self) -> &WgPrivateKey {
		&self.private
	}

	pub fn public_key(&self) -> &WgPublicKey {
		&self.public
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn encoding_matches_wg_genkey_length() {
		let pair = WgKeyPair::generate();
		assert_eq!(pair.private_key().to_base64().expose().len(), 44);
		assert_eq!(pair.public_key().to_base64().len(), 44);
		assert!(pair.public_key().to_base64().ends_with('='));
	}

	#[test]
	fn known_vector_public_key() {
		// RFC 7748 section 6.1, Alice.
		let private = WgPrivateKey::from_base64("dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=").unwrap();
		assert_eq!(
			private.public_key().to_base64(),
			"hSDwCYkwp1R0i33ctD73Wg2/Og0mOBr066SpjqqbTmo="
		);
	}

	#[test]
	fn short_key_is_rejected() {
		let err = WgPublicKey::from_base64("AAAA").unwrap_err();
		assert!(matches!(err, KeyError::InvalidLength(3)));
	}

	#[test]
	fn garbage_is_rejected() {
		assert!(matches!(
			WgPublicKey::from_base64("not base64!!"),
			Err(KeyError::InvalidBase64(_))
		));
	}

	#[test]
	fn private_key_debug_is_redacted() {
		let private = WgPrivateKey::generate();
		let debug = format!("{private:?}");
		assert!(debug.contains("[REDACTED]"));
		assert!(!debug.contains(private.to_base64().expose().as_str()));
	}

	#[test]
	fn public_key_serializes_as_plain_string() {
		let pair = WgKeyPair::generate();
		let json = serde_json::to_string(pair.public_key()).unwrap();
		assert_eq!(json, format!("\"{}\"", pair.public_key()));
	}

	proptest! {
		#[test]
		fn restoring_from_private_key_yields_same_public_key(seed in prop::array::uniform32(any::<u8>())) {
			let pair = WgKeyPair::from_private_key(WgPrivateKey::from_bytes(seed));
			let restored = WgKeyPair::from_base64(pair.private_key().to_base64().expose()).unwrap();
			prop_assert_eq!(pair.public_key(), restored.public_key());
		}
	}
}
