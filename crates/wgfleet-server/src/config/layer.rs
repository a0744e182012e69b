// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

use super::sections::{DatabaseConfigLayer, DispatchConfigLayer, LoggingConfigLayer, ReconcileConfigLayer};

/// One source's partial view of the configuration. Later layers win field by field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfigLayer {
	pub database: Option<DatabaseConfigLayer>,
	pub dispatch: Option<DispatchConfigLayer>,
	pub reconcile: Option<ReconcileConfigLayer>,
	pub logging: Option<LoggingConfigLayer>,
}

fn merge_section<T>(base: &mut Option<T>, other: Option<T>, merge: impl FnOnce(&mut T, T)) {
	match (base.as_mut(), other) {
		(Some(b), Some(o)) => merge(b, o),
		(None, Some(o)) => *base = Some(o),
		(_, None) => {}
	}
}

impl ServerConfigLayer {
	pub fn merge(&mut self, other: Self) {
		merge_section(&mut self.database, other.database, DatabaseConfigLayer::merge);
		merge_section(&mut self.dispatch, other.dispatch, DispatchConfigLayer::merge);
		merge_section(&mut self.reconcile, other.reconcile, ReconcileConfigLayer::merge);
		merge_section(&mut self.logging, other.logging, LoggingConfigLayer::merge);
	}
}
