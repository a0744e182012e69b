// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Redacting wrapper for credentials that cross the fleet.
//!
//! Node API keys live in the control-plane registry and in every agent's
//! environment; WireGuard private keys live in agent storage. Both are held as
//! [`Secret<T>`] so that a stray `{:?}` in a log line or a serialized config
//! dump prints `[REDACTED]` instead of the value.
//!
//! ```
//! use wgfleet_common_secret::SecretString;
//!
//! let key = SecretString::new("node-api-key".to_string());
//! assert_eq!(format!("{key}"), "[REDACTED]");
//! assert_eq!(key.expose(), "node-api-key");
//! ```

use std::fmt;
use zeroize::Zeroize;

/// Placeholder emitted wherever a secret would otherwise be printed.
pub const REDACTED: &str = "[REDACTED]";

/// Holds a sensitive value; zeroized on drop, redacted when printed or serialized.
///
/// There is no `Deref`: callers reach the value through [`Secret::expose`] so
/// every use is visible at the call site.
#[derive(Zeroize)]
#[zeroize(drop)]
pub struct Secret<T>
where
	T: Zeroize,
{
	inner: T,
}

pub type SecretString = Secret<String>;

impl<T> Secret<T>
where
	T: Zeroize,
{
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	pub fn expose(&self) -> &T {
		&self.inner
	}

	/// Returns a copy of the inner value; the wrapper's memory is still zeroized on drop.
	pub fn into_inner(self) -> T
	where
		T: Clone,
	{
		self.inner.clone()
	}
}

impl SecretString {
	/// True when the wrapped string is empty or whitespace.
	pub fn is_blank(&self) -> bool {
		self.inner.trim().is_empty()
	}
}

impl<T> Clone for Secret<T>
where
	T: Zeroize + Clone,
{
	fn clone(&self) -> Self {
		Self::new(self.inner.clone())
	}
}

impl<T> fmt::Debug for Secret<T>
where
	T: Zeroize,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Secret").field(&REDACTED).finish()
	}
}

impl<T> fmt::Display for Secret<T>
where
	T: Zeroize,
{
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

impl<T> PartialEq for Secret<T>
where
	T: Zeroize + PartialEq,
{
	fn eq(&self, other: &Self) -> bool {
		self.inner == other.inner
	}
}

impl<T> Eq for Secret<T> where T: Zeroize + Eq {}

impl From<String> for SecretString {
	fn from(value: String) -> Self {
		Self::new(value)
	}
}

impl From<&str> for SecretString {
	fn from(value: &str) -> Self {
		Self::new(value.to_string())
	}
}

#[cfg(feature = "serde")]
mod serde_impl {
	use super::{Secret, REDACTED};
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use zeroize::Zeroize;

	impl<T> Serialize for Secret<T>
	where
		T: Serialize + Zeroize,
	{
		fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
		where
			S: Serializer,
		{
			serializer.serialize_str(REDACTED)
		}
	}

	impl<'de, T> Deserialize<'de> for Secret<T>
	where
		T: Deserialize<'de> + Zeroize,
	{
		fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
		where
			D: Deserializer<'de>,
		{
			T::deserialize(deserializer).map(Secret::new)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn api_key_is_redacted_in_debug_and_display() {
		let key = SecretString::from("wg-node-key-0001");
		assert_eq!(format!("{key:?}"), "Secret(\"[REDACTED]\")");
		assert_eq!(format!("{key}"), REDACTED);
	}

	#[test]
	fn struct_holding_key_does_not_leak_it() {
		#[derive(Debug)]
		#[allow(dead_code)]
		struct Node {
			name: String,
			api_key: SecretString,
		}
		let node = Node {
			name: "edge-1".to_string(),
			api_key: SecretString::from("hunter2-but-longer"),
		};
		let out = format!("{node:?}");
		assert!(out.contains("edge-1"));
		assert!(!out.contains("hunter2"));
	}

	#[test]
	fn blank_detection() {
		assert!(SecretString::from("   ").is_blank());
		assert!(!SecretString::from("k").is_blank());
	}

	#[test]
	fn equality_uses_inner_value() {
		assert_eq!(SecretString::from("a"), SecretString::from("a"));
		assert_ne!(SecretString::from("a"), SecretString::from("b"));
	}

	#[cfg(feature = "serde")]
	#[test]
	fn serializes_redacted_and_deserializes_plain() {
		let json = serde_json::to_string(&SecretString::from("private")).unwrap();
		assert_eq!(json, "\"[REDACTED]\"");

		let parsed: SecretString = serde_json::from_str("\"private\"").unwrap();
		assert_eq!(parsed.expose(), "private");
	}

	proptest! {
		#[test]
		fn display_never_contains_value(inner in "[a-zA-Z0-9+/=]{8,44}") {
			prop_assume!(!inner.contains("REDACTED"));
			let secret = Secret::new(inner.clone());
			let displayed = format!("{secret}");
			let debugged = format!("{secret:?}");
			prop_assert!(!displayed.contains(&inner));
			prop_assert!(!debugged.contains(&inner));
		}
	}
}
