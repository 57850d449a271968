//! Structured errors for watch creation, aggregation and callback dispatch.
//!
//! `WatchError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. `anyhow` stays internal to callback bodies: whatever a
//! callback returns is carried as the `source` of
//! [`WatchError::CallbackInvocationFailure`].
//!
//! None of these errors are retried here. They all propagate to the caller of
//! `process_trigger` / `create_watch`, which decides whether to redeliver.

use std::fmt;

use thiserror::Error;

use crate::core::{MemberId, WatchId};
use crate::persistence::StoreError;
use crate::registry::DeserializationError;

/// Which callback operation was being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOperation {
    OnSuccess,
    OnFailure,
}

impl CallbackOperation {
    pub fn for_outcome(success: bool) -> Self {
        if success {
            CallbackOperation::OnSuccess
        } else {
            CallbackOperation::OnFailure
        }
    }
}

impl fmt::Display for CallbackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackOperation::OnSuccess => write!(f, "on_success"),
            CallbackOperation::OnFailure => write!(f, "on_failure"),
        }
    }
}

/// Structured error type for ask-watch operations.
#[derive(Debug, Error)]
pub enum WatchError {
    /// No watch with this id exists.
    #[error("watch not found: {0}")]
    NotFound(WatchId),

    /// A member referenced by a watch is unknown to the member store.
    #[error("member {member_id} of watch {watch_id} not found")]
    MemberNotFound {
        watch_id: WatchId,
        member_id: MemberId,
    },

    /// A watch cannot be created without members.
    #[error("a watch needs at least one member")]
    EmptyMembers,

    /// A non-joint watch does not have exactly one member.
    #[error("non-joint watch {watch_id} has {member_count} members, expected exactly 1")]
    InvalidConfiguration {
        watch_id: WatchId,
        member_count: usize,
    },

    /// Every member of a joint watch is FAILED, which the join should have
    /// caught on an earlier trigger.
    #[error("all members of joint watch {watch_id} are FAILED: {member_ids:?}")]
    InvariantViolation {
        watch_id: WatchId,
        member_ids: Vec<MemberId>,
    },

    /// The callback id is not registered.
    #[error("unknown callback: {0}")]
    UnknownCallback(String),

    /// A parameter spec cannot be resolved.
    ///
    /// [`EventRegistry`](crate::EventRegistry) checks parameters at
    /// registration and the dispatcher binds anything missing as `None`, so
    /// only custom registries raise this.
    #[error("invalid signature for callback {callback_id}: {reason}")]
    InvalidCallbackSignature { callback_id: String, reason: String },

    /// The callback failed to instantiate, returned an error, or panicked.
    #[error("callback {callback_id} failed in {operation}: {source}")]
    CallbackInvocationFailure {
        callback_id: String,
        operation: CallbackOperation,
        #[source]
        source: anyhow::Error,
    },

    /// A member payload could not be decoded into its event type.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// Storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WatchError {
    /// Errors that point at a contract break elsewhere and deserve an alert.
    pub fn is_alerting(&self) -> bool {
        matches!(
            self,
            WatchError::InvariantViolation { .. } | WatchError::InvalidConfiguration { .. }
        )
    }
}
