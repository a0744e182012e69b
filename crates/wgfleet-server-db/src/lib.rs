// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane storage: the node registry and the fleet mirror.

pub mod error;
pub mod mirror;
pub mod nodes;
pub mod pool;
pub mod testing;
pub mod types;

pub use error::{DbError, Result};
pub use mirror::{MirrorRepository, MirrorStore};
pub use nodes::{NodeRepository, NodeStore};
pub use pool::{create_pool, run_migrations};
pub use types::{
	ClientPatch, InterfacePatch, ManagedNode, MirrorClient, MirrorInterface, NewNode, NodeHealth,
	NodeUpdate, UsageRecord,
};
