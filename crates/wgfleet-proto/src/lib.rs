// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent RPC contract shared by the control plane and node agents.
//!
//! Every operation is a JSON `POST` to a fixed path under `/agent_api/`,
//! authenticated with the node's shared key in the [`API_KEY_HEADER`] header,
//! and answered with an [`AgentResponse`] envelope.

pub mod envelope;
pub mod keys;
pub mod ops;

pub use envelope::{AgentResponse, EnvelopeError, ErrorCode};
pub use keys::{KeyError, WgKeyPair, WgPrivateKey, WgPublicKey};
pub use ops::*;

pub const API_KEY_HEADER: &str = "X-API-Key";

pub const DEFAULT_AGENT_PORT: u16 = 1212;

/// A peer counts as connected when its last handshake is at most this old.
pub const CONNECTED_HANDSHAKE_WINDOW_SECS: i64 = 180;
