// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable failure class attached to a failed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	NotFound,
	Conflict,
	SubnetExhausted,
	BadRequest,
	Unauthorized,
	Internal,
}

impl ErrorCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCode::NotFound => "not_found",
			ErrorCode::Conflict => "conflict",
			ErrorCode::SubnetExhausted => "subnet_exhausted",
			ErrorCode::BadRequest => "bad_request",
			ErrorCode::Unauthorized => "unauthorized",
			ErrorCode::Internal => "internal",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Uniform response body for every agent operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse<T> {
	pub ok: bool,
	pub message: String,
	#[serde(default = "Option::default")]
	pub data: Option<T>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvelopeError {
	#[error("{message}")]
	Failed {
		message: String,
		code: Option<ErrorCode>,
	},

	#[error("successful response carried no data")]
	MissingData,
}

impl<T> AgentResponse<T> {
	pub fn success(message: impl Into<String>, data: T) -> Self {
		Self {
			ok: true,
			message: message.into(),
			data: Some(data),
			code: None,
		}
	}

	pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			ok: false,
			message: message.into(),
			data: None,
			code: Some(code),
		}
	}

	pub fn into_result(self) -> Result<T, EnvelopeError> {
		if !self.ok {
			return Err(EnvelopeError::Failed {
				message: self.message,
				code: self.code,
			});
		}
		self.data.ok_or(EnvelopeError::MissingData)
	}
}
