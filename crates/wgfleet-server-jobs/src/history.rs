// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::types::{JobRun, JobStatus};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

const DEFAULT_RUNS_PER_JOB: usize = 50;

/// Bounded in-memory record of recent runs, newest last.
pub struct RunHistory {
	runs: RwLock<HashMap<String, VecDeque<JobRun>>>,
	capacity: usize,
}

impl Default for RunHistory {
	fn default() -> Self {
		Self::with_capacity(DEFAULT_RUNS_PER_JOB)
	}
}

impl RunHistory {
	pub fn with_capacity(capacity: usize) -> Self {
		Self {
			runs: RwLock::new(HashMap::new()),
			capacity: capacity.max(1),
		}
	}

	pub async fn record_start(&self, run: JobRun) {
		let mut runs = self.runs.write().await;
		let entries = runs.entry(run.job_id.clone()).or_default();
		if entries.len() == self.capacity {
			entries.pop_front();
		}
		entries.push_back(run);
	}

	pub async fn record_complete(
		&self,
		job_id: &str,
		run_id: &str,
		status: JobStatus,
		error_message: Option<String>,
		metadata: Option<serde_json::Value>,
	) {
		let mut runs = self.runs.write().await;
		let Some(run) = runs
			.get_mut(job_id)
			.and_then(|entries| entries.iter_mut().rev().find(|r| r.id == run_id))
		else {
			tracing::warn!(job_id, run_id, "completed run not found in history");
			return;
		};

		let now = Utc::now();
		run.status = status;
		run.completed_at = Some(now);
		run.duration_ms = Some((now - run.started_at).num_milliseconds());
		run.error_message = error_message;
		run.metadata = metadata;
	}

	pub async fn set_retry_count(&self, job_id: &str, run_id: &str, retry_count: u32) {
		let mut runs = self.runs.write().await;
		if let Some(run) = runs
			.get_mut(job_id)
			.and_then(|entries| entries.iter_mut().rev().find(|r| r.id == run_id))
		{
			run.retry_count = retry_count;
		}
	}

	pub async fn last_run(&self, job_id: &str) -> Option<JobRun> {
		self.runs.read().await.get(job_id)?.back().cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::TriggerSource;

	fn run(id: &str) -> JobRun {
		JobRun {
			id: id.to_string(),
			job_id: "fleet-reconcile".to_string(),
			status: JobStatus::Running,
			started_at: Utc::now(),
			completed_at: None,
			duration_ms: None,
			error_message: None,
			retry_count: 0,
			triggered_by: TriggerSource::Schedule,
			metadata: None,
		}
	}

	#[tokio::test]
	async fn completion_updates_the_matching_run() {
		let history = RunHistory::default();
		history.record_start(run("a")).await;
		history
			.record_complete("fleet-reconcile", "a", JobStatus::Failed, Some("boom".into()), None)
			.await;

		let last = history.last_run("fleet-reconcile").await.unwrap();
		assert_eq!(last.status, JobStatus::Failed);
		assert_eq!(last.error_message.as_deref(), Some("boom"));
		assert!(last.completed_at.is_some());
	}

	#[tokio::test]
	async fn oldest_runs_are_evicted() {
		let history = RunHistory::with_capacity(2);
		for id in ["1", "2", "3"] {
			history.record_start(run(id)).await;
		}
		// "1" was evicted, so completing it leaves the newest run untouched.
		history
			.record_complete("fleet-reconcile", "1", JobStatus::Succeeded, None, None)
			.await;
		let last = history.last_run("fleet-reconcile").await.unwrap();
		assert_eq!(last.id, "3");
		assert_eq!(last.status, JobStatus::Running);
		assert!(history.last_run("other").await.is_none());
	}
}
