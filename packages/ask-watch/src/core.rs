//! Core records for the ask-watch join.
//!
//! # Overview
//!
//! A [`Watch`] tracks a group of ask events ("members") and settles on one
//! terminal [`AskStatus`] for the group. Members are [`MemberRecord`]s owned by
//! the surrounding event-processing system; this crate only reads them, except
//! for the cascading forced transition performed when a joint group fails.
//!
//! Timestamps are `chrono::DateTime<Utc>`. Identifiers wrap `Uuid` the same way
//! correlation ids do elsewhere in the stack.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a [`Watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(Uuid);

impl WatchId {
    /// Create a new random watch id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for WatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for WatchId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an ask event taking part in a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Create a new random member id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MemberId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Status shared by watches and their members.
///
/// `Pending` is the only non-terminal value. Once a watch leaves `Pending` it
/// never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AskStatus {
    Pending,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl AskStatus {
    /// Returns true for every status except `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AskStatus::Pending)
    }

    /// Returns true for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, AskStatus::Success)
    }

    /// Returns true for terminal statuses other than `Success`.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AskStatus::Failed | AskStatus::Timeout | AskStatus::Cancelled
        )
    }
}

impl fmt::Display for AskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AskStatus::Pending => write!(f, "PENDING"),
            AskStatus::Success => write!(f, "SUCCESS"),
            AskStatus::Failed => write!(f, "FAILED"),
            AskStatus::Timeout => write!(f, "TIMEOUT"),
            AskStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// =============================================================================
// Failure Info
// =============================================================================

/// Why a member (and therefore its group) did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    Failed,
    Timeout,
    Cancelled,
}

impl FailureReason {
    /// Map a terminal non-success status to its reason.
    ///
    /// Returns `None` for `Pending` and `Success`.
    pub fn from_status(status: AskStatus) -> Option<Self> {
        match status {
            AskStatus::Failed => Some(FailureReason::Failed),
            AskStatus::Timeout => Some(FailureReason::Timeout),
            AskStatus::Cancelled => Some(FailureReason::Cancelled),
            AskStatus::Pending | AskStatus::Success => None,
        }
    }

    /// The status this reason was derived from.
    pub fn as_status(&self) -> AskStatus {
        match self {
            FailureReason::Failed => AskStatus::Failed,
            FailureReason::Timeout => AskStatus::Timeout,
            FailureReason::Cancelled => AskStatus::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_status().fmt(f)
    }
}

/// Failure details handed to callbacks and revocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureReason,
    pub timestamp: DateTime<Utc>,
}

impl FailureInfo {
    pub fn new(kind: FailureReason, timestamp: DateTime<Utc>) -> Self {
        Self { kind, timestamp }
    }
}

// =============================================================================
// Watch
// =============================================================================

/// The aggregate tracking join state over one or more members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub id: WatchId,
    pub status: AskStatus,
    /// Ordered member ids. Never empty for watches built by the engine.
    pub member_ids: Vec<MemberId>,
    /// AND-join over all members. A non-joint watch mirrors its single member.
    pub is_joint: bool,
    /// Registered callback to run once the watch settles.
    pub callback_id: Option<String>,
    /// Passed through to the callback untouched.
    pub extra_params: HashMap<String, String>,
}

impl Watch {
    /// A fresh `Pending` watch with a new id.
    pub fn pending(
        member_ids: Vec<MemberId>,
        is_joint: bool,
        callback_id: Option<String>,
        extra_params: HashMap<String, String>,
    ) -> Self {
        Self {
            id: WatchId::new(),
            status: AskStatus::Pending,
            member_ids,
            is_joint,
            callback_id,
            extra_params,
        }
    }

    /// Returns true while the watch has not settled.
    pub fn is_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Extra params as a JSON object string, `None` when there are none.
    ///
    /// Storage backends that keep the map in a text column use this form.
    pub fn extra_params_json(&self) -> serde_json::Result<Option<String>> {
        if self.extra_params.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(&self.extra_params).map(Some)
    }

    /// Parse extra params back from [`Watch::extra_params_json`] output.
    ///
    /// A missing or blank column is an empty map.
    pub fn parse_extra_params(json: Option<&str>) -> serde_json::Result<HashMap<String, String>> {
        match json.map(str::trim) {
            None | Some("") => Ok(HashMap::new()),
            Some(raw) => serde_json::from_str(raw),
        }
    }
}

// =============================================================================
// Member Record
// =============================================================================

/// One ask event as seen by the member status source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: MemberId,
    /// Tag naming the concrete domain event (looked up in the event registry).
    pub event_type: String,
    /// Serialized event.
    pub payload: serde_json::Value,
    pub status: AskStatus,
    pub create_time: DateTime<Utc>,
    /// `None` means "never updated since creation".
    pub update_time: Option<DateTime<Utc>>,
}

impl MemberRecord {
    /// `update_time` if present, otherwise `create_time`.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.update_time.unwrap_or(self.create_time)
    }

    /// Failure info for this member, if its status is a failure.
    pub fn failure_info(&self) -> Option<FailureInfo> {
        FailureReason::from_status(self.status)
            .map(|kind| FailureInfo::new(kind, self.effective_time()))
    }
}

// =============================================================================
// Ask Parameter
// =============================================================================

/// Creation input for a watch.
///
/// # Example
///
/// ```ignore
/// let param = AskParameter::joint([reserve_stock, charge_card])
///     .with_callback("order:place")
///     .with_param("order_id", order_id.to_string());
/// let watch = engine.watch_ask_events(param).await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct AskParameter {
    pub member_ids: Vec<MemberId>,
    pub is_joint: bool,
    pub callback_id: Option<String>,
    pub extra_params: HashMap<String, String>,
}

impl AskParameter {
    /// A non-joint watch mirroring one member.
    pub fn single(member_id: MemberId) -> Self {
        Self {
            member_ids: vec![member_id],
            is_joint: false,
            ..Self::default()
        }
    }

    /// An AND-join over all members.
    pub fn joint(member_ids: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            member_ids: member_ids.into_iter().collect(),
            is_joint: true,
            ..Self::default()
        }
    }

    /// Set the callback to invoke once the watch settles.
    pub fn with_callback(mut self, callback_id: impl Into<String>) -> Self {
        self.callback_id = Some(callback_id.into());
        self
    }

    /// Add an extra param passed through to the callback.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }
}
