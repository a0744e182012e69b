// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

use wgfleet_proto::ErrorCode;
use wgfleet_server_db::DbError;

use crate::dispatch::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
	#[error("not found: {0}")]
	NotFound(String),

	#[error("node {0} not found")]
	NodeNotFound(i64),

	#[error("a node named '{0}' already exists")]
	DuplicateName(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("no free address left in {0}")]
	SubnetExhausted(String),

	#[error("node unreachable: {0}")]
	NodeUnreachable(String),

	#[error("unauthorized")]
	Unauthorized,

	#[error("node did not respond within {0:?}")]
	Timeout(Duration),

	#[error("node error: {message}")]
	NodeError { message: String, code: Option<ErrorCode> },

	#[error("{operation} succeeded on the node but the mirror update failed: {detail}")]
	MirrorDesync { operation: String, detail: String },

	#[error("{operation} timed out; the node may or may not have applied it")]
	Indeterminate { operation: String },

	#[error("database error: {0}")]
	Database(#[from] DbError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl FleetError {
	/// The node could not be talked to, as opposed to answering with a failure.
	pub fn is_communication(&self) -> bool {
		matches!(
			self,
			FleetError::NodeUnreachable(_) | FleetError::Timeout(_) | FleetError::Indeterminate { .. }
		)
	}
}

impl From<DispatchError> for FleetError {
	fn from(e: DispatchError) -> Self {
		match e {
			DispatchError::Unauthorized => FleetError::Unauthorized,
			DispatchError::Timeout(after) => FleetError::Timeout(after),
			DispatchError::Node { message, code } => FleetError::NodeError { message, code },
			DispatchError::Transport(detail) | DispatchError::Interrupted(detail) => FleetError::NodeUnreachable(detail),
			DispatchError::Protocol(detail) => FleetError::NodeError {
				message: format!("malformed response: {detail}"),
				code: None,
			},
		}
	}
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Result of an operator-facing operation. `Indeterminate` means the node may
/// or may not have applied the change and the mirror was left untouched.
#[derive(Debug)]
pub enum Outcome<T> {
	Succeeded(T),
	Failed(FleetError),
	Indeterminate(FleetError),
}

impl<T> Outcome<T> {
	pub fn is_success(&self) -> bool {
		matches!(self, Outcome::Succeeded(_))
	}

	pub fn into_result(self) -> Result<T> {
		match self {
			Outcome::Succeeded(value) => Ok(value),
			Outcome::Failed(e) | Outcome::Indeterminate(e) => Err(e),
		}
	}
}

impl<T> From<Result<T>> for Outcome<T> {
	fn from(result: Result<T>) -> Self {
		match result {
			Ok(value) => Outcome::Succeeded(value),
			Err(e @ FleetError::Indeterminate { .. }) => Outcome::Indeterminate(e),
			Err(e) => Outcome::Failed(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dispatch_errors_translate() {
		assert!(matches!(
			FleetError::from(DispatchError::Transport("connection refused".into())),
			FleetError::NodeUnreachable(_)
		));
		match FleetError::from(DispatchError::Node {
			message: "client 'alice' already exists".into(),
			code: Some(ErrorCode::Conflict),
		}) {
			FleetError::NodeError { message, code } => {
				assert_eq!(message, "client 'alice' already exists");
				assert_eq!(code, Some(ErrorCode::Conflict));
			}
			other => panic!("unexpected: {other}"),
		}
		assert!(matches!(FleetError::from(DispatchError::Unauthorized), FleetError::Unauthorized));
		assert!(FleetError::from(DispatchError::Interrupted("connection reset".into())).is_communication());
	}

	#[test]
	fn communication_errors() {
		assert!(FleetError::Timeout(Duration::from_secs(1)).is_communication());
		assert!(FleetError::Indeterminate {
			operation: "client_create".into()
		}
		.is_communication());
		assert!(!FleetError::Unauthorized.is_communication());
		assert!(!FleetError::from(DispatchError::Protocol("eof".into())).is_communication());
	}

	#[test]
	fn outcome_from_result() {
		let ok: Outcome<u32> = Ok(1).into();
		assert!(ok.is_success());

		let failed: Outcome<u32> = Err(FleetError::Conflict("x".into())).into();
		assert!(matches!(failed, Outcome::Failed(FleetError::Conflict(_))));

		let unknown: Outcome<u32> = Err(FleetError::Indeterminate {
			operation: "client_delete".into(),
		})
		.into();
		assert!(matches!(unknown, Outcome::Indeterminate(_)));
		assert!(unknown.into_result().is_err());
	}
}
