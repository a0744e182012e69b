// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Traffic accounting and quota/expiry checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use wgfleet_server_db::{MirrorClient, UsageRecord};

/// Bytes gained by one counter since the previous sample. A counter lower
/// than its last reading was reset, so all of it is new traffic.
fn counter_delta(current: u64, last: u64) -> u64 {
	if current >= last {
		current - last
	} else {
		current
	}
}

/// Folds a raw `(rx, tx)` sample into `usage`, returning the new record and
/// the bytes added.
pub fn apply_sample(usage: &UsageRecord, rx: u64, tx: u64) -> (UsageRecord, u64) {
	let delta_rx = counter_delta(rx, usage.last_raw_rx);
	let delta_tx = counter_delta(tx, usage.last_raw_tx);
	let next = UsageRecord {
		used_rx: usage.used_rx.saturating_add(delta_rx),
		used_tx: usage.used_tx.saturating_add(delta_tx),
		last_raw_rx: rx,
		last_raw_tx: tx,
	};
	(next, delta_rx.saturating_add(delta_tx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
	Expired,
	QuotaExceeded,
}

impl DisableReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			DisableReason::Expired => "expired",
			DisableReason::QuotaExceeded => "quota exceeded",
		}
	}
}

impl fmt::Display for DisableReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Why an enabled client must be disabled at `now`, if at all. Expiry wins
/// over quota; a quota of zero is unlimited.
pub fn breach(client: &MirrorClient, now: DateTime<Utc>) -> Option<DisableReason> {
	if !client.enabled {
		return None;
	}
	if now >= client.expires_at {
		return Some(DisableReason::Expired);
	}
	if client.quota_bytes > 0 && client.usage.total() >= client.quota_bytes {
		return Some(DisableReason::QuotaExceeded);
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;
	use proptest::prelude::*;
	use wgfleet_server_db::testing::sample_client;

	#[test]
	fn counter_reset_counts_whole_reading() {
		let usage = UsageRecord {
			used_rx: 5000,
			used_tx: 5000,
			last_raw_rx: 1000,
			last_raw_tx: 500,
		};
		let (next, delta) = apply_sample(&usage, 200, 600);
		assert_eq!(next.used_rx, 5200);
		assert_eq!(next.used_tx, 5100);
		assert_eq!(next.last_raw_rx, 200);
		assert_eq!(next.last_raw_tx, 600);
		assert_eq!(delta, 300);
	}

	#[test]
	fn first_sample_counts_from_zero() {
		let (next, delta) = apply_sample(&UsageRecord::default(), 700, 300);
		assert_eq!(next.total(), 1000);
		assert_eq!(delta, 1000);
	}

	#[test]
	fn expired_takes_precedence() {
		let now = Utc::now();
		let mut client = sample_client(1, 0, "alice", 2);
		client.expires_at = now - Duration::seconds(1);
		client.quota_bytes = 10;
		client.usage.used_rx = 100;
		assert_eq!(breach(&client, now), Some(DisableReason::Expired));
	}

	#[test]
	fn expiry_boundary_is_inclusive() {
		let now = Utc::now();
		let mut client = sample_client(1, 0, "alice", 2);
		client.expires_at = now;
		assert_eq!(breach(&client, now), Some(DisableReason::Expired));
	}

	#[test]
	fn quota_is_inclusive_and_zero_is_unlimited() {
		let now = Utc::now();
		let mut client = sample_client(1, 0, "bob", 3);
		client.quota_bytes = 1000;
		client.usage.used_rx = 600;
		client.usage.used_tx = 399;
		assert_eq!(breach(&client, now), None);

		client.usage.used_tx = 400;
		let reason = breach(&client, now).unwrap();
		assert_eq!(reason, DisableReason::QuotaExceeded);
		assert_eq!(reason.to_string(), "quota exceeded");

		client.quota_bytes = 0;
		assert_eq!(breach(&client, now), None);
	}

	#[test]
	fn disabled_clients_are_left_alone() {
		let now = Utc::now();
		let mut client = sample_client(1, 0, "carol", 4);
		client.enabled = false;
		client.expires_at = now - Duration::days(1);
		assert_eq!(breach(&client, now), None);
	}

	proptest! {
		#[test]
		fn cumulative_usage_never_decreases(samples in prop::collection::vec((0u64..1_000_000, 0u64..1_000_000), 1..50)) {
			let mut usage = UsageRecord::default();
			for (rx, tx) in samples {
				let (next, delta) = apply_sample(&usage, rx, tx);
				prop_assert!(next.used_rx >= usage.used_rx);
				prop_assert!(next.used_tx >= usage.used_tx);
				prop_assert_eq!(next.total(), usage.total() + delta);
				usage = next;
			}
		}
	}
}
