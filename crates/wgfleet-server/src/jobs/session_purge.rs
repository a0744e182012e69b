// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;
use wgfleet_server_jobs::{Job, JobContext, JobError, JobOutput};

use crate::session::SessionStore;

pub struct SessionPurgeJob {
	sessions: Arc<dyn SessionStore>,
}

impl SessionPurgeJob {
	pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
		Self { sessions }
	}
}

#[async_trait]
impl Job for SessionPurgeJob {
	fn id(&self) -> &str {
		"session-purge"
	}

	fn name(&self) -> &str {
		"Session Purge"
	}

	fn description(&self) -> &str {
		"Drop expired front-end session entries"
	}

	#[instrument(skip(self, ctx), fields(job_id = "session-purge"))]
	async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
		if ctx.cancellation_token.is_cancelled() {
			return Err(JobError::Cancelled);
		}

		let purged = self.sessions.purge_expired().await;
		tracing::debug!(purged, "session purge completed");

		Ok(JobOutput {
			message: format!("Purged {purged} expired sessions"),
			metadata: Some(serde_json::json!({ "purged": purged })),
		})
	}
}
