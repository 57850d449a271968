//! The join decision.
//!
//! Decisions are pure: they look at a watch, the trigger and one finite member
//! snapshot, and say what should happen. No IO, no async. The
//! [`engine`](crate::engine) loads the inputs, commits the outcome and runs
//! the side effects.
//!
//! # Joint Rules
//!
//! - Every member `SUCCESS` settles the group as `SUCCESS`.
//! - Otherwise members are ordered by effective time and the first one that
//!   is neither `PENDING` nor `SUCCESS` decides the group's failure status.
//!   Ties keep snapshot order. Severity plays no part.
//! - Every other `PENDING` or `SUCCESS` member is cascaded to that status.
//! - No failed member yet means keep waiting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{AskStatus, FailureInfo, MemberId, MemberRecord, Watch};
use crate::error::WatchError;

/// What to do when every member of a joint watch is `FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllFailedPolicy {
    /// Fail loudly with [`WatchError::InvariantViolation`].
    #[default]
    Reject,
    /// Settle as `FAILED` through the normal earliest-failure scan.
    FailGroup,
}

impl fmt::Display for AllFailedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllFailedPolicy::Reject => write!(f, "reject"),
            AllFailedPolicy::FailGroup => write!(f, "fail-group"),
        }
    }
}

impl FromStr for AllFailedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(AllFailedPolicy::Reject),
            "fail-group" | "fail_group" => Ok(AllFailedPolicy::FailGroup),
            other => Err(format!(
                "unknown all-failed policy '{}', expected 'reject' or 'fail-group'",
                other
            )),
        }
    }
}

/// The outcome a watch settles on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// Terminal status to commit on the watch.
    pub status: AskStatus,
    /// Failure info handed to the callback (and to revocations).
    pub failure: Option<FailureInfo>,
    /// Members to force into `status`, in snapshot order.
    pub cascade: Vec<MemberId>,
}

impl Settlement {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Decide a non-joint watch.
///
/// The watch mirrors the trigger. A `PENDING` trigger settles nothing (see
/// decision 7 in DESIGN.md).
pub fn decide_single(
    watch: &Watch,
    trigger_status: AskStatus,
    trigger_failure: Option<FailureInfo>,
) -> Result<Option<Settlement>, WatchError> {
    if watch.member_ids.len() != 1 {
        return Err(WatchError::InvalidConfiguration {
            watch_id: watch.id,
            member_count: watch.member_ids.len(),
        });
    }

    if !trigger_status.is_terminal() {
        return Ok(None);
    }

    Ok(Some(Settlement {
        status: trigger_status,
        failure: trigger_failure,
        cascade: Vec::new(),
    }))
}

/// Decide a joint watch from one member snapshot.
pub fn decide_joint(
    watch: &Watch,
    snapshot: &[MemberRecord],
    policy: AllFailedPolicy,
) -> Result<Option<Settlement>, WatchError> {
    if snapshot.is_empty() {
        return Err(WatchError::InvalidConfiguration {
            watch_id: watch.id,
            member_count: 0,
        });
    }

    if snapshot.iter().all(|m| m.status == AskStatus::Success) {
        return Ok(Some(Settlement {
            status: AskStatus::Success,
            failure: None,
            cascade: Vec::new(),
        }));
    }

    if policy == AllFailedPolicy::Reject && snapshot.iter().all(|m| m.status == AskStatus::Failed)
    {
        let member_ids: Vec<MemberId> = snapshot.iter().map(|m| m.id).collect();
        return Err(WatchError::InvariantViolation {
            watch_id: watch.id,
            member_ids,
        });
    }

    let Some(first_failed) = earliest_failure(snapshot) else {
        return Ok(None);
    };

    let status = first_failed.status;
    let failure = first_failed.failure_info();
    let cascade = snapshot
        .iter()
        .filter(|m| m.id != first_failed.id)
        .filter(|m| matches!(m.status, AskStatus::Pending | AskStatus::Success))
        .map(|m| m.id)
        .collect();

    Ok(Some(Settlement {
        status,
        failure,
        cascade,
    }))
}

/// The earliest-resolving member that is neither `PENDING` nor `SUCCESS`.
///
/// Stable sort, so equal effective times keep snapshot order.
pub fn earliest_failure(snapshot: &[MemberRecord]) -> Option<&MemberRecord> {
    let mut ordered: Vec<&MemberRecord> = snapshot.iter().collect();
    ordered.sort_by_key(|m| m.effective_time());
    ordered.into_iter().find(|m| m.status.is_failure())
}
