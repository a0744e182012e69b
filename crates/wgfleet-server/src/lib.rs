// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! wgfleet control plane.
//!
//! Keeps the registry of managed nodes and a mirror of their interfaces and
//! clients, pushes mutations to node agents through the [`orchestrator`],
//! and periodically reconciles usage, expiry and health through the
//! [`reconcile`] engine.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;
pub mod services;
pub mod session;
pub mod testing;
pub mod usage;

pub use config::{load_config, load_config_with_file, ConfigError, ServerConfig};
pub use dispatch::{DispatchError, DispatchFactory, DispatchPool, HttpDispatchFactory, NodeDispatch, NodeEndpoint};
pub use error::{FleetError, Outcome, Result};
pub use orchestrator::{Orchestrator, ProvisionedClient};
pub use reconcile::{NodeCycleReport, ReconcileSummary, ReconciliationEngine};
pub use registry::{CachedDashboard, NodeRegistry};
pub use services::FleetServices;
pub use session::{MemorySessionStore, SessionStore};
