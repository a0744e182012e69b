// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared HTTP client construction.
//!
//! Every control-plane request to a node agent goes through a client built
//! here so the User-Agent and timeout policy are the same everywhere.

use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// Builder with the standard `wgfleet/<version>` User-Agent.
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Builds a client whose every request is bounded by `timeout`.
///
/// The same bound is applied to connection establishment so an unroutable node
/// address cannot stall longer than a slow response would.
pub fn client_with_timeout(timeout: Duration) -> reqwest::Result<Client> {
	builder().timeout(timeout).connect_timeout(timeout).build()
}

pub fn user_agent() -> String {
	format!("wgfleet/{}", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_has_product_and_version() {
		let ua = user_agent();
		let parts: Vec<&str> = ua.split('/').collect();
		assert_eq!(parts.len(), 2);
		assert_eq!(parts[0], "wgfleet");
		assert!(!parts[1].is_empty());
	}

	#[test]
	fn timeout_client_builds() {
		assert!(client_with_timeout(Duration::from_secs(30)).is_ok());
	}
}
