use tracing::debug;
use zback_types::snapshot::SnapshotInfo;

use crate::error::{Result, ZbackError};
use crate::manifest::JobInfo;

/// What the next send should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPlan {
    Full { to: SnapshotInfo },
    Incremental { from: SnapshotInfo, to: SnapshotInfo },
}

impl SendPlan {
    pub fn to(&self) -> &SnapshotInfo {
        match self {
            SendPlan::Full { to } => to,
            SendPlan::Incremental { to, .. } => to,
        }
    }

    pub fn from(&self) -> Option<&SnapshotInfo> {
        match self {
            SendPlan::Full { .. } => None,
            SendPlan::Incremental { from, .. } => Some(from),
        }
    }
}

/// Smart-incremental planning: reconcile the source's snapshots and
/// bookmarks with the manifests already at the destination.
///
/// - With no prior manifest the plan is a full send of the newest snapshot.
/// - Otherwise the latest backed-up snapshot (by `to` creation) becomes
///   `from`, preferring its bookmark over the snapshot when both still
///   exist (bookmarks are cheaper to keep around).
/// - `to` is always the newest snapshot; bookmarks are never a target.
/// - `from == to` (by GUID) is the NoOp verdict, a non-error.
pub fn plan_increment(
    dataset: &str,
    local: &[SnapshotInfo],
    remote: &[JobInfo],
) -> Result<SendPlan> {
    let newest = local
        .iter()
        .filter(|s| !s.bookmark)
        .max_by_key(|s| s.txg)
        .ok_or_else(|| {
            ZbackError::SourceUnavailable(format!("{dataset} has no snapshots to send"))
        })?;

    let latest_backed_up = remote
        .iter()
        .filter(|j| j.volume_name == dataset)
        .max_by_key(|j| (j.base_snapshot.creation, j.base_snapshot.txg));

    let Some(latest) = latest_backed_up else {
        debug!("{dataset}: no manifests at destination, planning full send of {newest}");
        return Ok(SendPlan::Full {
            to: newest.clone(),
        });
    };

    if latest.base_snapshot.guid == newest.guid {
        return Err(ZbackError::NoOp);
    }

    // The backed-up snapshot may survive locally as a snapshot, a bookmark,
    // or both. Prefer the bookmark.
    let candidates: Vec<&SnapshotInfo> = local
        .iter()
        .filter(|s| s.guid == latest.base_snapshot.guid)
        .collect();
    let from = candidates
        .iter()
        .find(|s| s.bookmark)
        .or_else(|| candidates.first())
        .ok_or_else(|| {
            ZbackError::SourceUnavailable(format!(
                "cannot increment: last backed-up snapshot {} no longer exists on {dataset} \
                 (no snapshot or bookmark with guid {})",
                latest.base_snapshot.full_name(),
                latest.base_snapshot.guid,
            ))
        })?;

    if from.txg > newest.txg {
        return Err(ZbackError::SourceUnavailable(format!(
            "destination is ahead of the source: {} was created after {}",
            from.full_name(),
            newest.full_name(),
        )));
    }

    Ok(SendPlan::Incremental {
        from: (*from).clone(),
        to: newest.clone(),
    })
}
