//! Revocation emission.
//!
//! # Guarantees
//!
//! - **Fire-and-forget**: [`RevocationEmitter::revoke`] never blocks and never
//!   reports delivery back to the join
//! - **At-most-once delivery**: slow receivers may miss requests
//! - **In-memory only**: requests are not persisted
//!
//! Member owners that can cancel their work subscribe to a [`RevokeBus`] and
//! act on the [`RevokeRequest`]s addressed to their members.

use tokio::sync::broadcast;
use tracing::warn;

use crate::core::{FailureInfo, MemberId};

/// Default channel capacity for the revoke bus.
pub const DEFAULT_REVOKE_CAPACITY: usize = 1024;

/// Request to cancel the work behind a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeRequest {
    pub member_id: MemberId,
    /// Why the group failed.
    pub failure: FailureInfo,
}

/// Outbound seam for revocations.
pub trait RevocationEmitter: Send + Sync + 'static {
    /// Ask for the member's work to be cancelled. Best effort.
    fn revoke(&self, member_id: MemberId, failure: FailureInfo);
}

/// A revocation emitter that drops every request.
///
/// Use this when no member type supports revocation.
#[derive(Debug, Default)]
pub struct NoOpRevocationEmitter;

impl RevocationEmitter for NoOpRevocationEmitter {
    fn revoke(&self, _member_id: MemberId, _failure: FailureInfo) {}
}

/// Broadcast channel carrying [`RevokeRequest`]s.
///
/// # Example
///
/// ```ignore
/// let bus = RevokeBus::new();
/// let mut receiver = bus.subscribe();
///
/// tokio::spawn(async move {
///     while let Ok(request) = receiver.recv().await {
///         inventory.release(request.member_id).await;
///     }
/// });
/// ```
#[derive(Clone)]
pub struct RevokeBus {
    sender: broadcast::Sender<RevokeRequest>,
}

impl RevokeBus {
    /// Create a new revoke bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REVOKE_CAPACITY)
    }

    /// Create a new revoke bus with the specified capacity.
    ///
    /// The capacity determines how many requests can be buffered before
    /// slow receivers start lagging. A capacity of 0 is raised to 1.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a request to all subscribers.
    ///
    /// Returns the number of receivers that received the request.
    pub fn emit(&self, request: RevokeRequest) -> usize {
        self.sender.send(request).unwrap_or(0)
    }

    /// Subscribe to requests published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RevokeRequest> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RevokeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationEmitter for RevokeBus {
    fn revoke(&self, member_id: MemberId, failure: FailureInfo) {
        let delivered = self.emit(RevokeRequest { member_id, failure });
        if delivered == 0 {
            warn!(%member_id, kind = %failure.kind, "revoke request reached no subscriber");
        }
    }
}

impl std::fmt::Debug for RevokeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevokeBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
