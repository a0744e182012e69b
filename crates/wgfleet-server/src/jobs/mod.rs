// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

mod reconcile;
mod session_purge;

pub use reconcile::ReconcileJob;
pub use session_purge::SessionPurgeJob;
