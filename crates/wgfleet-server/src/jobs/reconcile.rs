// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;
use wgfleet_server_db::NodeHealth;
use wgfleet_server_jobs::{Job, JobContext, JobError, JobOutput};

use crate::reconcile::ReconciliationEngine;

pub struct ReconcileJob {
	engine: Arc<ReconciliationEngine>,
}

impl ReconcileJob {
	pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
		Self { engine }
	}
}

#[async_trait]
impl Job for ReconcileJob {
	fn id(&self) -> &str {
		"fleet-reconcile"
	}

	fn name(&self) -> &str {
		"Fleet Reconciliation"
	}

	fn description(&self) -> &str {
		"Pull traffic from every node, enforce expiry and quota, and record node health"
	}

	#[instrument(skip(self, ctx), fields(job_id = "fleet-reconcile"))]
	async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
		if ctx.cancellation_token.is_cancelled() {
			return Err(JobError::Cancelled);
		}

		let summary = self.engine.run_all().await.map_err(|e| JobError::Failed {
			message: e.to_string(),
			retryable: true,
		})?;

		let active = summary.count(NodeHealth::Active);
		let unreachable = summary.count(NodeHealth::Unreachable);
		let errored = summary.count(NodeHealth::Error);
		let skipped = summary.skipped();
		let disabled: usize = summary.nodes.iter().map(|n| n.disabled.len()).sum();

		tracing::info!(
			nodes = summary.nodes.len(),
			active,
			unreachable,
			errored,
			skipped,
			disabled,
			"fleet reconciliation completed"
		);

		Ok(JobOutput {
			message: format!(
				"Reconciled {} nodes ({active} active, {unreachable} unreachable, {errored} error, {skipped} skipped)",
				summary.nodes.len()
			),
			metadata: serde_json::to_value(&summary).ok(),
		})
	}
}
