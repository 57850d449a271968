//! # Ask Watch
//!
//! AND-join aggregation over asynchronous "ask" events.
//!
//! ## Core Concepts
//!
//! A **member** is one asynchronous action (reserve stock, charge a card)
//! whose status moves from `PENDING` to a terminal value. A **watch** groups
//! one or more members and settles exactly once:
//!
//! - A **non-joint** watch has one member and mirrors it
//! - A **joint** watch succeeds when every member succeeds, and fails with
//!   the status of the member that failed first
//!
//! When a joint watch fails, its still-running siblings are forced into the
//! group status and revocable ones get a [`RevokeRequest`]. A registered
//! callback then runs with arguments bound by event type.
//!
//! ## Architecture
//!
//! ```text
//! member status change
//!     │
//!     ▼ process_trigger()
//! WatchEngine ─────────────────────────────┐
//!     │                                    │
//!     ├─► WatchStore.load()                │
//!     ├─► MemberStore.get() (snapshot)     │
//!     │                                    │
//!     ├─► machine::decide_*() ─► None ─────┤ Waiting
//!     │        │                           │
//!     │        ▼ Some(Settlement)          │
//!     ├─► WatchStore.save(rev) ─► Conflict ┤ LostRace
//!     │                                    │
//!     ├─► MemberStore.force_status()       │
//!     ├─► RevocationEmitter.revoke() ──► RevokeBus
//!     │                                    │
//!     └─► CallbackDispatcher.dispatch()    │
//!              │                           │
//!              ▼                           │
//!        AskCallback.on_success()          │
//!        AskCallback.on_failure() ─────────┘ Settled
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Settles once** - A non-`PENDING` watch ignores every trigger
//! 2. **Deciding is pure** - [`decide_joint`] and [`decide_single`] do no IO
//! 3. **Commit first** - The status is saved before any cascade or callback
//! 4. **Earliest failure wins** - Ties keep member order
//!
//! ## Guarantees
//!
//! - **At-least-once triggers**: redelivered triggers are no-ops
//! - **At-most-once revocations**: the revoke bus is in-memory only
//! - **No retries**: a failing callback is reported, never re-run
//!
//! ## Example
//!
//! ```ignore
//! use ask_watch::{AskParameter, CallbackDescriptor, EventRegistry, WatchEngine};
//!
//! let mut registry = EventRegistry::new();
//! registry.register_revocable_event::<StockReserved>("inventory:reserve");
//! registry.register_event::<CardCharged>("payment:charge");
//! registry.register_callback(
//!     CallbackDescriptor::builder("order:place")
//!         .event::<StockReserved>()
//!         .event::<CardCharged>()
//!         .failure_info()
//!         .named("order_id")
//!         .with_failure_operation()
//!         .build::<PlaceOrder>(),
//! );
//!
//! let engine = WatchEngine::builder(watches, members, Arc::new(registry)).build();
//!
//! let watch = engine
//!     .watch_ask_events(
//!         AskParameter::joint([reserve_id, charge_id])
//!             .with_callback("order:place")
//!             .with_param("order_id", "42"),
//!     )
//!     .await?;
//!
//! // Whenever a member changes status:
//! engine.process_trigger(watch.id, AskStatus::Success, None).await?;
//! ```

// Core modules
mod bus;
mod config;
mod core;
mod dispatch;
mod engine;
mod error;
mod machine;
mod persistence;
mod registry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export domain types
pub use crate::core::{
    AskParameter, AskStatus, FailureInfo, FailureReason, MemberId, MemberRecord, Watch, WatchId,
};

// Re-export error types
pub use crate::error::{CallbackOperation, WatchError};

// Re-export decision types
pub use machine::{decide_joint, decide_single, earliest_failure, AllFailedPolicy, Settlement};

// Re-export registry types
pub use registry::{
    AskCallback, CallbackDescriptor, CallbackDescriptorBuilder, CallbackFactory,
    CallbackRegistry, DeserializationError, EventRegistry, EventValue, ParamSpec,
};

// Re-export dispatcher types
pub use dispatch::{CallbackArg, CallbackArgs, CallbackDispatcher, DispatchOutcome};

// Re-export bus types
pub use bus::{
    NoOpRevocationEmitter, RevocationEmitter, RevokeBus, RevokeRequest, DEFAULT_REVOKE_CAPACITY,
};

// Re-export engine types (primary entry point)
pub use engine::{TriggerOutcome, WatchEngine, WatchEngineBuilder};

// Re-export configuration
pub use config::WatchConfig;

// Re-export persistence types
pub use persistence::{MemberStore, Revision, StoreError, WatchStore};

// Re-export persistence testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub use persistence::testing::{InMemoryMemberStore, InMemoryWatchStore};

// Re-export commonly used external types
pub use async_trait::async_trait;
