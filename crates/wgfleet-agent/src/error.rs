// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use axum::http::StatusCode;
use thiserror::Error;
use wgfleet_proto::{ErrorCode, KeyError};

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("{0} not found")]
	NotFound(String),

	#[error("{0}")]
	Conflict(String),

	#[error("no free address left in {0}")]
	SubnetExhausted(String),

	#[error("{0}")]
	BadRequest(String),

	#[error("daemon error: {0}")]
	Daemon(#[from] DaemonError),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("key error: {0}")]
	Key(#[from] KeyError),

	#[error("malformed interface config: {0}")]
	MalformedConfig(#[from] crate::wgconf::ParseError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl AgentError {
	pub fn code(&self) -> ErrorCode {
		match self {
			AgentError::NotFound(_) => ErrorCode::NotFound,
			AgentError::Conflict(_) => ErrorCode::Conflict,
			AgentError::SubnetExhausted(_) => ErrorCode::SubnetExhausted,
			AgentError::BadRequest(_) => ErrorCode::BadRequest,
			_ => ErrorCode::Internal,
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			AgentError::NotFound(_) => StatusCode::NOT_FOUND,
			AgentError::Conflict(_) | AgentError::SubnetExhausted(_) => StatusCode::CONFLICT,
			AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Maps a unique-constraint violation to [`AgentError::Conflict`].
	pub(crate) fn conflict_on_unique(what: impl Into<String>) -> impl FnOnce(sqlx::Error) -> AgentError {
		let what = what.into();
		move |e| match e {
			sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => AgentError::Conflict(what),
			_ => AgentError::Database(e),
		}
	}
}

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("failed to run `{command}`: {source}")]
	Spawn {
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("`{command}` exited with {status}: {stderr}")]
	Failed {
		command: String,
		status: String,
		stderr: String,
	},

	#[error("unparseable daemon output: {0}")]
	Parse(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("missing environment variable: {0}")]
	MissingEnv(String),

	#[error("parse error: {0}")]
	Parse(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
