// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Node agent for wgfleet.
//!
//! The agent owns the WireGuard interfaces of one host. It keeps interface
//! and client records (including private keys) in a local SQLite store,
//! renders `wg<N>.conf` from them, drives the daemon and answers the control
//! plane over the RPC surface in [`rpc`].

pub mod config;
pub mod daemon;
pub mod error;
pub mod mutator;
pub mod reader;
pub mod rpc;
pub mod store;
pub mod testing;
pub mod wgconf;

pub use config::AgentConfig;
pub use daemon::{PeerDump, SystemDaemon, TunnelDaemon};
pub use error::{AgentError, ConfigError, DaemonError, Result};
pub use mutator::LocalConfigMutator;
pub use reader::NodeReader;
pub use rpc::{router, AgentState};
pub use store::LocalStore;
