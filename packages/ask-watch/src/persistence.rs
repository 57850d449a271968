//! Storage seams for watches and members.
//!
//! # The Contract
//!
//! 1. **Compare-and-set on commit.** A watch is saved against the [`Revision`]
//!    it was loaded at. If another writer committed first, the save fails with
//!    [`StoreError::Conflict`] and nothing is written.
//!
//! 2. **Insert is a save at [`Revision::NONE`].** Creating a watch twice with
//!    the same id conflicts.
//!
//! 3. **Guarded member writes.** [`MemberStore::force_status`] only overwrites
//!    a member that is still `Pending` or `Success` at write time. A member its
//!    owner already failed, timed out or cancelled is left alone.
//!
//! # What This Does NOT Guarantee
//!
//! - No transactions spanning the watch and its members.
//! - No retention policy. Watches are never deleted here.

use async_trait::async_trait;

use crate::core::{AskStatus, MemberId, MemberRecord, Watch, WatchId};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from watch and member storage.
///
/// - [`StoreError::Conflict`] means another writer modified the record.
/// - [`StoreError::Backend`] means storage failed (timeout, connection, etc).
#[derive(Debug)]
pub enum StoreError {
    /// Another writer modified the record since we loaded it.
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    Backend(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "revision conflict: record was modified concurrently"),
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Conflict => None,
            StoreError::Backend(e) => Some(e.as_ref()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Revision for optimistic concurrency control.
///
/// - [`Revision::NONE`] indicates a record that has never been saved.
/// - After each successful save, the revision advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel value for a record that has never been saved.
    pub const NONE: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    /// Get the next revision (for save operations).
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Watch Store
// =============================================================================

/// Persists watches.
///
/// Implementations must detect concurrent modification through revisions.
/// Two triggers racing to settle the same watch both load it at the same
/// revision; exactly one save succeeds.
#[async_trait]
pub trait WatchStore: Send + Sync + 'static {
    /// Load a watch and its current revision.
    ///
    /// Returns `None` if the watch was never saved.
    async fn load(&self, id: &WatchId) -> Result<Option<(Watch, Revision)>, StoreError>;

    /// Save a watch with optimistic concurrency control.
    ///
    /// `expected` must match the stored revision ([`Revision::NONE`] for new
    /// watches). Returns the new revision on success.
    async fn save(&self, watch: &Watch, expected: Revision) -> Result<Revision, StoreError>;
}

// =============================================================================
// Member Store
// =============================================================================

/// The member status source, plus the one write this crate performs.
#[async_trait]
pub trait MemberStore: Send + Sync + 'static {
    /// Current record for a member, `None` if unknown.
    async fn get(&self, id: &MemberId) -> Result<Option<MemberRecord>, StoreError>;

    /// Force a member into `status`, but only if it is still `Pending` or
    /// `Success` at write time.
    ///
    /// Returns `true` if the write happened, `false` if the member had already
    /// reached a failure status (or does not exist).
    async fn force_status(&self, id: &MemberId, status: AskStatus) -> Result<bool, StoreError>;
}

// =============================================================================
// In-Memory Stores (for testing)
// =============================================================================

/// In-memory stores for tests and demos.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use chrono::{DateTime, Utc};
    use dashmap::mapref::entry::Entry;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory watch store backed by a `DashMap`.
    #[derive(Default)]
    pub struct InMemoryWatchStore {
        data: DashMap<WatchId, (Watch, Revision)>,
        saves: AtomicUsize,
    }

    impl InMemoryWatchStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of successful saves, inserts included.
        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        /// Current copy of a watch, if stored.
        pub fn get(&self, id: &WatchId) -> Option<Watch> {
            self.data.get(id).map(|entry| entry.value().0.clone())
        }

        pub fn len(&self) -> usize {
            self.data.len()
        }

        pub fn is_empty(&self) -> bool {
            self.data.is_empty()
        }
    }

    #[async_trait]
    impl WatchStore for InMemoryWatchStore {
        async fn load(&self, id: &WatchId) -> Result<Option<(Watch, Revision)>, StoreError> {
            Ok(self.data.get(id).map(|entry| entry.value().clone()))
        }

        async fn save(&self, watch: &Watch, expected: Revision) -> Result<Revision, StoreError> {
            // The entry guard holds the shard lock, so check-and-write is atomic.
            let new_rev = expected.next();
            match self.data.entry(watch.id) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().1 != expected {
                        return Err(StoreError::Conflict);
                    }
                    occupied.insert((watch.clone(), new_rev));
                }
                Entry::Vacant(vacant) => {
                    if !expected.is_none() {
                        return Err(StoreError::Conflict);
                    }
                    vacant.insert((watch.clone(), new_rev));
                }
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(new_rev)
        }
    }

    /// In-memory member store backed by a `DashMap`.
    ///
    /// Tests play the role of the member owner through [`InMemoryMemberStore::resolve`].
    #[derive(Default)]
    pub struct InMemoryMemberStore {
        data: DashMap<MemberId, MemberRecord>,
        forced: AtomicUsize,
    }

    impl InMemoryMemberStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, record: MemberRecord) {
            self.data.insert(record.id, record);
        }

        /// Create a `Pending` member with the given event and return its id.
        pub fn create(&self, event_type: &str, payload: serde_json::Value) -> MemberId {
            let record = MemberRecord {
                id: MemberId::new(),
                event_type: event_type.to_string(),
                payload,
                status: AskStatus::Pending,
                create_time: Utc::now(),
                update_time: None,
            };
            let id = record.id;
            self.insert(record);
            id
        }

        /// Owner-side resolution: set status and update time unconditionally.
        pub fn resolve(&self, id: &MemberId, status: AskStatus, at: DateTime<Utc>) {
            if let Some(mut record) = self.data.get_mut(id) {
                record.status = status;
                record.update_time = Some(at);
            }
        }

        /// Current status of a member.
        pub fn status(&self, id: &MemberId) -> Option<AskStatus> {
            self.data.get(id).map(|record| record.status)
        }

        /// Number of successful forced writes.
        pub fn forced_count(&self) -> usize {
            self.forced.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MemberStore for InMemoryMemberStore {
        async fn get(&self, id: &MemberId) -> Result<Option<MemberRecord>, StoreError> {
            Ok(self.data.get(id).map(|record| record.clone()))
        }

        async fn force_status(&self, id: &MemberId, status: AskStatus) -> Result<bool, StoreError> {
            let Some(mut record) = self.data.get_mut(id) else {
                return Ok(false);
            };
            if !matches!(record.status, AskStatus::Pending | AskStatus::Success) {
                return Ok(false);
            }
            record.status = status;
            record.update_time = Some(Utc::now());
            self.forced.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }
}
