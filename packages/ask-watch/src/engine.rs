//! The watch engine: the entry point for creating and settling watches.
//!
//! # Processing a Trigger
//!
//! ```text
//! process_trigger(watch_id, status, failure)
//!     │
//!     ├─► load watch ─────────────► NotFound
//!     ├─► not PENDING ────────────► AlreadySettled (no-op)
//!     │
//!     ├─► snapshot members (each fetched once)
//!     ├─► machine::decide_* ──────► Waiting
//!     │
//!     ├─► commit status (compare-and-set) ─► LostRace (no-op)
//!     ├─► cascade + revoke (joint failures)
//!     └─► dispatch callback ──────► Settled
//! ```
//!
//! The commit happens before any side effect. Whichever trigger commits first
//! owns the transition; every later trigger sees a settled watch or loses the
//! compare-and-set and does nothing. An error after the commit propagates to
//! the caller and the watch stays settled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::{RevocationEmitter, RevokeBus, RevokeRequest};
use crate::config::WatchConfig;
use crate::core::{AskParameter, AskStatus, FailureInfo, MemberId, MemberRecord, Watch, WatchId};
use crate::dispatch::{CallbackDispatcher, DispatchOutcome};
use crate::error::WatchError;
use crate::machine::{self, Settlement};
use crate::persistence::{MemberStore, Revision, StoreError, WatchStore};
use crate::registry::CallbackRegistry;

/// What a call to [`WatchEngine::process_trigger`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The watch had already settled on this status. Nothing changed.
    AlreadySettled(AskStatus),
    /// Not enough information to settle yet. Nothing changed.
    Waiting,
    /// Another trigger committed first. Nothing changed.
    LostRace,
    /// This trigger settled the watch.
    Settled {
        status: AskStatus,
        dispatch: DispatchOutcome,
    },
}

/// Creates watches and settles them as members resolve.
pub struct WatchEngine {
    watches: Arc<dyn WatchStore>,
    members: Arc<dyn MemberStore>,
    registry: Arc<dyn CallbackRegistry>,
    revocations: Arc<dyn RevocationEmitter>,
    revoke_bus: Option<RevokeBus>,
    dispatcher: CallbackDispatcher,
    config: WatchConfig,
}

impl WatchEngine {
    pub fn builder(
        watches: Arc<dyn WatchStore>,
        members: Arc<dyn MemberStore>,
        registry: Arc<dyn CallbackRegistry>,
    ) -> WatchEngineBuilder {
        WatchEngineBuilder {
            watches,
            members,
            registry,
            revocations: None,
            config: WatchConfig::default(),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Subscribe to revocations, if the engine owns its revoke bus.
    ///
    /// Returns `None` when a custom emitter was supplied to the builder.
    pub fn subscribe_revocations(&self) -> Option<broadcast::Receiver<RevokeRequest>> {
        self.revoke_bus.as_ref().map(RevokeBus::subscribe)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create and persist a new `PENDING` watch.
    ///
    /// # Errors
    ///
    /// - `EmptyMembers` if `member_ids` is empty
    /// - `Store` if the watch cannot be saved
    pub async fn create_watch(
        &self,
        member_ids: Vec<MemberId>,
        is_joint: bool,
        callback_id: Option<String>,
        extra_params: HashMap<String, String>,
    ) -> Result<Watch, WatchError> {
        if member_ids.is_empty() {
            return Err(WatchError::EmptyMembers);
        }

        let watch = Watch::pending(member_ids, is_joint, callback_id, extra_params);
        self.watches.save(&watch, Revision::NONE).await?;

        info!(
            watch_id = %watch.id,
            members = watch.member_ids.len(),
            is_joint = watch.is_joint,
            callback_id = watch.callback_id.as_deref(),
            "watch created"
        );
        Ok(watch)
    }

    /// Create a watch from an [`AskParameter`].
    pub async fn watch_ask_events(&self, param: AskParameter) -> Result<Watch, WatchError> {
        self.create_watch(
            param.member_ids,
            param.is_joint,
            param.callback_id,
            param.extra_params,
        )
        .await
    }

    /// Current state of a watch.
    pub async fn load_watch(&self, watch_id: WatchId) -> Result<Option<Watch>, WatchError> {
        Ok(self.watches.load(&watch_id).await?.map(|(watch, _)| watch))
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// React to a member status change.
    ///
    /// Safe to call more than once for the same change and concurrently for
    /// different members of the same watch.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the watch does not exist
    /// - `InvalidConfiguration` if a non-joint watch does not have one member
    /// - `InvariantViolation` if every joint member is FAILED (default policy)
    /// - `MemberNotFound` if a member cannot be read
    /// - any dispatch error, after the watch has been settled
    pub async fn process_trigger(
        &self,
        watch_id: WatchId,
        trigger_status: AskStatus,
        trigger_failure: Option<FailureInfo>,
    ) -> Result<TriggerOutcome, WatchError> {
        debug!(%watch_id, %trigger_status, "processing trigger");

        let (mut watch, revision) = self
            .watches
            .load(&watch_id)
            .await?
            .ok_or(WatchError::NotFound(watch_id))?;

        if !watch.is_pending() {
            debug!(%watch_id, status = %watch.status, "watch already settled, ignoring trigger");
            return Ok(TriggerOutcome::AlreadySettled(watch.status));
        }

        let (settlement, mut snapshot) = if watch.is_joint {
            let snapshot = self.snapshot(&watch).await?;
            match machine::decide_joint(&watch, &snapshot, self.config.all_failed_policy) {
                Ok(settlement) => (settlement, snapshot),
                Err(err @ WatchError::InvariantViolation { .. }) => {
                    // A concurrent FAILED cascade also leaves every member FAILED
                    if let Some((current, _)) = self.watches.load(&watch_id).await? {
                        if !current.is_pending() {
                            debug!(%watch_id, status = %current.status, "watch settled during snapshot");
                            return Ok(TriggerOutcome::AlreadySettled(current.status));
                        }
                    }
                    error!(
                        %watch_id,
                        error = %err,
                        "join missed an earlier failure"
                    );
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        } else {
            let settlement = machine::decide_single(&watch, trigger_status, trigger_failure)?;
            let snapshot = match settlement {
                Some(_) => self.snapshot(&watch).await?,
                None => Vec::new(),
            };
            (settlement, snapshot)
        };

        let Some(settlement) = settlement else {
            debug!(%watch_id, "no member has failed yet, watch stays pending");
            return Ok(TriggerOutcome::Waiting);
        };

        watch.status = settlement.status;
        match self.watches.save(&watch, revision).await {
            Ok(_) => {}
            Err(StoreError::Conflict) => {
                warn!(%watch_id, "watch settled concurrently by another trigger");
                return Ok(TriggerOutcome::LostRace);
            }
            Err(e) => return Err(e.into()),
        }
        info!(%watch_id, status = %watch.status, is_joint = watch.is_joint, "watch settled");

        self.cascade(&watch, &settlement, &mut snapshot).await?;

        let dispatch = self
            .dispatcher
            .dispatch(
                settlement.is_success(),
                watch.callback_id.as_deref(),
                &watch.extra_params,
                &snapshot,
                settlement.failure,
            )
            .await?;

        Ok(TriggerOutcome::Settled {
            status: settlement.status,
            dispatch,
        })
    }

    /// Fetch every member exactly once, in watch order.
    async fn snapshot(&self, watch: &Watch) -> Result<Vec<MemberRecord>, WatchError> {
        let mut snapshot = Vec::with_capacity(watch.member_ids.len());
        for member_id in &watch.member_ids {
            let record = self
                .members
                .get(member_id)
                .await?
                .ok_or(WatchError::MemberNotFound {
                    watch_id: watch.id,
                    member_id: *member_id,
                })?;
            snapshot.push(record);
        }
        Ok(snapshot)
    }

    /// Force siblings into the group status and revoke the revocable ones.
    ///
    /// Updates `snapshot` in place so the callback sees the forced statuses.
    async fn cascade(
        &self,
        watch: &Watch,
        settlement: &Settlement,
        snapshot: &mut [MemberRecord],
    ) -> Result<(), WatchError> {
        for member_id in &settlement.cascade {
            let Some(record) = snapshot.iter_mut().find(|m| m.id == *member_id) else {
                continue;
            };

            let forced = self
                .members
                .force_status(member_id, settlement.status)
                .await?;

            if !forced {
                debug!(
                    watch_id = %watch.id,
                    %member_id,
                    "member already failed on its own, leaving it alone"
                );
                if let Some(current) = self.members.get(member_id).await? {
                    *record = current;
                }
                continue;
            }

            record.status = settlement.status;

            if let Some(failure) = settlement.failure {
                if self.registry.is_revocable(&record.event_type) {
                    debug!(
                        watch_id = %watch.id,
                        %member_id,
                        event_type = %record.event_type,
                        "revoking member"
                    );
                    self.revocations.revoke(*member_id, failure);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("config", &self.config)
            .field("revoke_bus", &self.revoke_bus)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WatchEngine`].
pub struct WatchEngineBuilder {
    watches: Arc<dyn WatchStore>,
    members: Arc<dyn MemberStore>,
    registry: Arc<dyn CallbackRegistry>,
    revocations: Option<Arc<dyn RevocationEmitter>>,
    config: WatchConfig,
}

impl WatchEngineBuilder {
    pub fn with_config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Send revocations somewhere other than the engine's own revoke bus.
    pub fn with_revocation_emitter(mut self, emitter: Arc<dyn RevocationEmitter>) -> Self {
        self.revocations = Some(emitter);
        self
    }

    pub fn build(self) -> WatchEngine {
        let (revocations, revoke_bus) = match self.revocations {
            Some(emitter) => (emitter, None),
            None => {
                let bus = RevokeBus::with_capacity(self.config.revoke_capacity);
                (Arc::new(bus.clone()) as Arc<dyn RevocationEmitter>, Some(bus))
            }
        };

        WatchEngine {
            dispatcher: CallbackDispatcher::new(self.registry.clone()),
            watches: self.watches,
            members: self.members,
            registry: self.registry,
            revocations,
            revoke_bus,
            config: self.config,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FailureReason;
    use crate::error::CallbackOperation;
    use crate::machine::AllFailedPolicy;
    use crate::persistence::testing::{InMemoryMemberStore, InMemoryWatchStore};
    use crate::registry::{CallbackDescriptor, EventRegistry};
    use crate::testing::{CallbackProbe, RecordingEmitter};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicBool, Ordering};

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StockReserved {
        sku: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CardCharged {
        amount_cents: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct EmailQueued {
        to: String,
    }

    const RESERVE: &str = "inventory:reserve";
    const CHARGE: &str = "payment:charge";
    const EMAIL: &str = "mail:queue";
    const CALLBACK: &str = "order:place";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn registry(probe: &CallbackProbe, failure_operation: bool) -> EventRegistry {
        let mut registry = EventRegistry::new();
        registry.register_revocable_event::<StockReserved>(RESERVE);
        registry.register_revocable_event::<CardCharged>(CHARGE);
        registry.register_event::<EmailQueued>(EMAIL);

        let mut builder = CallbackDescriptor::builder(CALLBACK)
            .event::<StockReserved>()
            .event::<CardCharged>()
            .event::<EmailQueued>()
            .failure_info()
            .named("order_id");
        if failure_operation {
            builder = builder.with_failure_operation();
        }
        registry.register_callback(probe.descriptor(builder));
        registry
    }

    struct Harness {
        engine: WatchEngine,
        watches: Arc<InMemoryWatchStore>,
        members: Arc<InMemoryMemberStore>,
        revocations: Arc<RecordingEmitter>,
        probe: CallbackProbe,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(WatchConfig::default(), true)
        }

        fn with_config(config: WatchConfig, failure_operation: bool) -> Self {
            let probe = CallbackProbe::new();
            let registry = registry(&probe, failure_operation);
            let watches = Arc::new(InMemoryWatchStore::new());
            let members = Arc::new(InMemoryMemberStore::new());
            let revocations = Arc::new(RecordingEmitter::new());

            let engine = WatchEngine::builder(watches.clone(), members.clone(), Arc::new(registry))
                .with_config(config)
                .with_revocation_emitter(revocations.clone())
                .build();

            Self {
                engine,
                watches,
                members,
                revocations,
                probe,
            }
        }

        fn member(&self, event_type: &str, status: AskStatus, at: DateTime<Utc>) -> MemberId {
            let payload = match event_type {
                RESERVE => serde_json::json!({ "sku": "A-1" }),
                CHARGE => serde_json::json!({ "amount_cents": 1299 }),
                _ => serde_json::json!({ "to": "ops@example.com" }),
            };
            let id = MemberId::new();
            self.members.insert(MemberRecord {
                id,
                event_type: event_type.to_string(),
                payload,
                status,
                create_time: t(-100),
                update_time: Some(at),
            });
            id
        }

        async fn joint(&self, member_ids: Vec<MemberId>) -> Watch {
            self.engine
                .create_watch(member_ids, true, Some(CALLBACK.to_string()), params())
                .await
                .unwrap()
        }

        async fn status(&self, watch_id: WatchId) -> AskStatus {
            self.engine.load_watch(watch_id).await.unwrap().unwrap().status
        }
    }

    fn params() -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("order_id".to_string(), "42".to_string());
        params
    }

    // ==========================================================================
    // Creation
    // ==========================================================================

    #[tokio::test]
    async fn test_create_watch_persists_pending() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));

        let watch = h
            .engine
            .create_watch(vec![a], false, Some(CALLBACK.to_string()), params())
            .await
            .unwrap();

        assert_eq!(watch.status, AskStatus::Pending);
        let stored = h.watches.get(&watch.id).unwrap();
        assert_eq!(stored, watch);
        assert_eq!(h.watches.save_count(), 1);
    }

    #[tokio::test]
    async fn test_create_watch_rejects_empty_members() {
        let h = Harness::new();
        let result = h
            .engine
            .create_watch(Vec::new(), true, None, HashMap::new())
            .await;

        assert!(matches!(result, Err(WatchError::EmptyMembers)));
        assert!(h.watches.is_empty());
    }

    #[tokio::test]
    async fn test_create_does_not_check_joint_member_count() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));
        let b = h.member(CHARGE, AskStatus::Pending, t(0));

        // Misconfigured, but only detected on the first trigger
        let watch = h
            .engine
            .create_watch(vec![a, b], false, None, HashMap::new())
            .await
            .unwrap();

        let result = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await;
        assert!(matches!(
            result,
            Err(WatchError::InvalidConfiguration { member_count: 2, .. })
        ));
        assert_eq!(h.status(watch.id).await, AskStatus::Pending);
    }

    #[tokio::test]
    async fn test_watch_ask_events() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));
        let b = h.member(CHARGE, AskStatus::Pending, t(0));

        let watch = h
            .engine
            .watch_ask_events(
                AskParameter::joint([a, b])
                    .with_callback(CALLBACK)
                    .with_param("order_id", "42"),
            )
            .await
            .unwrap();

        assert!(watch.is_joint);
        assert_eq!(watch.member_ids, vec![a, b]);
        assert_eq!(watch.extra_params, params());
    }

    // ==========================================================================
    // Unknown Watch & Idempotency
    // ==========================================================================

    #[tokio::test]
    async fn test_unknown_watch_is_not_found() {
        let h = Harness::new();
        let missing = WatchId::new();

        let result = h
            .engine
            .process_trigger(missing, AskStatus::Success, None)
            .await;

        assert!(matches!(result, Err(WatchError::NotFound(id)) if id == missing));
        assert_eq!(h.watches.save_count(), 0);
        assert_eq!(h.members.forced_count(), 0);
    }

    #[tokio::test]
    async fn test_settled_watch_ignores_every_trigger() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));
        let b = h.member(CHARGE, AskStatus::Failed, t(1));
        let watch = h.joint(vec![a, b]).await;

        h.engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await
            .unwrap();
        let saves = h.watches.save_count();
        let forced = h.members.forced_count();
        let calls = h.probe.calls().len();
        let revoked = h.revocations.requests().len();

        for status in [
            AskStatus::Success,
            AskStatus::Failed,
            AskStatus::Timeout,
            AskStatus::Pending,
        ] {
            let outcome = h
                .engine
                .process_trigger(watch.id, status, None)
                .await
                .unwrap();
            assert_eq!(outcome, TriggerOutcome::AlreadySettled(AskStatus::Failed));
        }

        assert_eq!(h.status(watch.id).await, AskStatus::Failed);
        assert_eq!(h.watches.save_count(), saves);
        assert_eq!(h.members.forced_count(), forced);
        assert_eq!(h.probe.calls().len(), calls);
        assert_eq!(h.revocations.requests().len(), revoked);
    }

    // ==========================================================================
    // Non-Joint Watches
    // ==========================================================================

    #[tokio::test]
    async fn test_single_member_mirrors_trigger() {
        for status in [
            AskStatus::Success,
            AskStatus::Failed,
            AskStatus::Timeout,
            AskStatus::Cancelled,
        ] {
            let h = Harness::new();
            let a = h.member(RESERVE, status, t(0));
            let watch = h
                .engine
                .create_watch(vec![a], false, Some(CALLBACK.to_string()), params())
                .await
                .unwrap();
            let failure = FailureReason::from_status(status).map(|k| FailureInfo::new(k, t(0)));

            let outcome = h
                .engine
                .process_trigger(watch.id, status, failure)
                .await
                .unwrap();

            let operation = CallbackOperation::for_outcome(status == AskStatus::Success);
            assert_eq!(
                outcome,
                TriggerOutcome::Settled {
                    status,
                    dispatch: DispatchOutcome::Invoked(operation),
                }
            );
            assert_eq!(h.status(watch.id).await, status);

            let calls = h.probe.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].operation, operation);
            assert_eq!(calls[0].args.event::<StockReserved>(0).unwrap().sku, "A-1");
            assert_eq!(calls[0].args.failure(3), failure.as_ref());
            assert_eq!(calls[0].args.text(4), Some("42"));
        }
    }

    #[tokio::test]
    async fn test_single_member_pending_trigger_waits() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));
        let watch = h
            .engine
            .create_watch(vec![a], false, Some(CALLBACK.to_string()), params())
            .await
            .unwrap();

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Pending, None)
            .await
            .unwrap();

        assert_eq!(outcome, TriggerOutcome::Waiting);
        assert_eq!(h.status(watch.id).await, AskStatus::Pending);
        assert!(h.probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_single_member_never_cascades() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Pending, t(0));
        let watch = h
            .engine
            .create_watch(vec![a], false, Some(CALLBACK.to_string()), params())
            .await
            .unwrap();

        h.engine
            .process_trigger(watch.id, AskStatus::Timeout, None)
            .await
            .unwrap();

        // The trigger is taken at its word; the member record is not touched
        assert_eq!(h.members.status(&a), Some(AskStatus::Pending));
        assert!(h.revocations.requests().is_empty());
    }

    // ==========================================================================
    // Joint Watches
    // ==========================================================================

    #[tokio::test]
    async fn test_joint_all_success() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Success, t(0));
        let b = h.member(CHARGE, AskStatus::Success, t(1));
        let c = h.member(EMAIL, AskStatus::Success, t(2));
        let watch = h.joint(vec![a, b, c]).await;

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TriggerOutcome::Settled {
                status: AskStatus::Success,
                dispatch: DispatchOutcome::Invoked(CallbackOperation::OnSuccess),
            }
        );
        assert_eq!(h.status(watch.id).await, AskStatus::Success);

        let calls = h.probe.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert!(args.event::<StockReserved>(0).is_some());
        assert_eq!(args.event::<CardCharged>(1).unwrap().amount_cents, 1299);
        assert!(args.event::<EmailQueued>(2).is_some());
        assert!(args.failure(3).is_none());
        assert!(h.revocations.requests().is_empty());
    }

    #[tokio::test]
    async fn test_joint_waits_while_members_pending() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Success, t(0));
        let b = h.member(CHARGE, AskStatus::Pending, t(1));
        let watch = h.joint(vec![a, b]).await;
        let saves = h.watches.save_count();

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await
            .unwrap();

        assert_eq!(outcome, TriggerOutcome::Waiting);
        assert_eq!(h.status(watch.id).await, AskStatus::Pending);
        assert_eq!(h.watches.save_count(), saves);
        assert!(h.probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_joint_earliest_failure_decides_and_cascades() {
        let h = Harness::new();
        // A: SUCCESS @t1, B: FAILED @t2, C: TIMEOUT @t0
        let a = h.member(RESERVE, AskStatus::Success, t(1));
        let b = h.member(CHARGE, AskStatus::Failed, t(2));
        let c = h.member(EMAIL, AskStatus::Timeout, t(0));
        let watch = h.joint(vec![a, b, c]).await;

        // The trigger status itself does not pick the group outcome
        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TriggerOutcome::Settled {
                status: AskStatus::Timeout,
                dispatch: DispatchOutcome::Invoked(CallbackOperation::OnFailure),
            }
        );
        assert_eq!(h.status(watch.id).await, AskStatus::Timeout);

        // A is forced, B keeps its own failure
        assert_eq!(h.members.status(&a), Some(AskStatus::Timeout));
        assert_eq!(h.members.status(&b), Some(AskStatus::Failed));
        assert_eq!(h.members.status(&c), Some(AskStatus::Timeout));
        assert_eq!(h.members.forced_count(), 1);

        let expected = FailureInfo::new(FailureReason::Timeout, t(0));
        let requests = h.revocations.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].member_id, a);
        assert_eq!(requests[0].failure, expected);

        let calls = h.probe.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, CallbackOperation::OnFailure);
        assert_eq!(calls[0].args.failure(3), Some(&expected));
        assert_eq!(calls[0].args.text(4), Some("42"));
    }

    #[tokio::test]
    async fn test_joint_non_revocable_sibling_is_forced_but_not_revoked() {
        let h = Harness::new();
        let email = h.member(EMAIL, AskStatus::Pending, t(5));
        let charge = h.member(CHARGE, AskStatus::Success, t(1));
        let reserve = h.member(RESERVE, AskStatus::Cancelled, t(0));
        let watch = h.joint(vec![email, charge, reserve]).await;

        h.engine
            .process_trigger(watch.id, AskStatus::Cancelled, None)
            .await
            .unwrap();

        assert_eq!(h.members.status(&email), Some(AskStatus::Cancelled));
        assert_eq!(h.members.status(&charge), Some(AskStatus::Cancelled));

        let revoked: Vec<MemberId> = h
            .revocations
            .requests()
            .iter()
            .map(|r| r.member_id)
            .collect();
        assert_eq!(revoked, vec![charge]);
    }

    #[tokio::test]
    async fn test_joint_all_failed_is_invariant_violation() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Failed, t(0));
        let b = h.member(CHARGE, AskStatus::Failed, t(1));
        let watch = h.joint(vec![a, b]).await;

        let result = h
            .engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await;

        assert!(matches!(result, Err(WatchError::InvariantViolation { .. })));
        assert_eq!(h.status(watch.id).await, AskStatus::Pending);
        assert!(h.probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_joint_all_failed_with_fail_group_policy() {
        let config = WatchConfig {
            all_failed_policy: AllFailedPolicy::FailGroup,
            ..WatchConfig::default()
        };
        let h = Harness::with_config(config, true);
        let a = h.member(RESERVE, AskStatus::Failed, t(3));
        let b = h.member(CHARGE, AskStatus::Failed, t(1));
        let watch = h.joint(vec![a, b]).await;

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TriggerOutcome::Settled {
                status: AskStatus::Failed,
                dispatch: DispatchOutcome::Invoked(CallbackOperation::OnFailure),
            }
        );
        assert_eq!(
            h.probe.calls()[0].args.failure(3),
            Some(&FailureInfo::new(FailureReason::Failed, t(1)))
        );
        assert!(h.revocations.requests().is_empty());
    }

    #[tokio::test]
    async fn test_callback_opt_out_still_settles_and_cascades() {
        let h = Harness::with_config(WatchConfig::default(), false);
        let a = h.member(RESERVE, AskStatus::Pending, t(5));
        let b = h.member(CHARGE, AskStatus::Failed, t(1));
        let watch = h.joint(vec![a, b]).await;

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TriggerOutcome::Settled {
                status: AskStatus::Failed,
                dispatch: DispatchOutcome::OptedOut,
            }
        );
        assert_eq!(h.status(watch.id).await, AskStatus::Failed);
        assert_eq!(h.members.status(&a), Some(AskStatus::Failed));
        assert_eq!(h.revocations.requests().len(), 1);
        assert_eq!(h.probe.instances(), 0);
    }

    #[tokio::test]
    async fn test_watch_without_callback() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Success, t(0));
        let watch = h
            .engine
            .create_watch(vec![a], true, None, HashMap::new())
            .await
            .unwrap();

        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TriggerOutcome::Settled {
                status: AskStatus::Success,
                dispatch: DispatchOutcome::NoCallback,
            }
        );
        assert!(h.probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_member_aborts_before_commit() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Success, t(0));
        let ghost = MemberId::new();
        let watch = h.joint(vec![a, ghost]).await;

        let result = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await;

        assert!(matches!(
            result,
            Err(WatchError::MemberNotFound { member_id, .. }) if member_id == ghost
        ));
        assert_eq!(h.status(watch.id).await, AskStatus::Pending);
    }

    // ==========================================================================
    // Errors After Commit
    // ==========================================================================

    #[tokio::test]
    async fn test_dispatch_error_propagates_and_watch_stays_settled() {
        let h = Harness::new();
        let a = h.member(RESERVE, AskStatus::Success, t(0));
        let watch = h
            .engine
            .create_watch(vec![a], true, Some("never:registered".to_string()), HashMap::new())
            .await
            .unwrap();

        let result = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await;
        assert!(matches!(result, Err(WatchError::UnknownCallback(_))));
        assert_eq!(h.status(watch.id).await, AskStatus::Success);

        // Redelivery is safe but does not re-run the transition
        let outcome = h
            .engine
            .process_trigger(watch.id, AskStatus::Success, None)
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::AlreadySettled(AskStatus::Success));
    }

    // ==========================================================================
    // Lost Race
    // ==========================================================================

    /// Serves the watch once as it looked before another trigger committed.
    struct StaleWatchStore {
        inner: InMemoryWatchStore,
        stale: Watch,
        served: AtomicBool,
    }

    impl StaleWatchStore {
        fn new(inner: InMemoryWatchStore, stale: Watch) -> Self {
            Self {
                inner,
                stale,
                served: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl WatchStore for StaleWatchStore {
        async fn load(&self, id: &WatchId) -> Result<Option<(Watch, Revision)>, StoreError> {
            if self.served.swap(true, Ordering::SeqCst) {
                return self.inner.load(id).await;
            }
            Ok(Some((self.stale.clone(), Revision::new(1))))
        }

        async fn save(&self, watch: &Watch, expected: Revision) -> Result<Revision, StoreError> {
            self.inner.save(watch, expected).await
        }
    }

    #[tokio::test]
    async fn test_lost_race_is_noop() {
        let probe = CallbackProbe::new();
        let members = Arc::new(InMemoryMemberStore::new());
        let a = members.create(RESERVE, serde_json::json!({ "sku": "A-1" }));
        members.resolve(&a, AskStatus::Success, t(0));

        let stale = Watch::pending(vec![a], false, Some(CALLBACK.to_string()), HashMap::new());
        let inner = InMemoryWatchStore::new();
        inner.save(&stale, Revision::NONE).await.unwrap();
        let mut winner = stale.clone();
        winner.status = AskStatus::Success;
        inner.save(&winner, Revision::new(1)).await.unwrap();

        let watches = Arc::new(StaleWatchStore::new(inner, stale.clone()));
        let revocations = Arc::new(RecordingEmitter::new());
        let engine = WatchEngine::builder(watches.clone(), members, Arc::new(registry(&probe, true)))
            .with_revocation_emitter(revocations)
            .build();

        let outcome = engine
            .process_trigger(stale.id, AskStatus::Success, None)
            .await
            .unwrap();

        assert_eq!(outcome, TriggerOutcome::LostRace);
        assert!(probe.calls().is_empty());
        assert_eq!(watches.inner.get(&stale.id).unwrap().status, AskStatus::Success);
    }

    #[tokio::test]
    async fn test_stale_trigger_after_failed_cascade_is_not_a_violation() {
        let probe = CallbackProbe::new();
        let members = Arc::new(InMemoryMemberStore::new());
        let a = members.create(RESERVE, serde_json::json!({ "sku": "A-1" }));
        let b = members.create(CHARGE, serde_json::json!({ "amount_cents": 5 }));
        // b failed on its own, a was forced by the winning trigger
        members.resolve(&b, AskStatus::Failed, t(0));
        members.resolve(&a, AskStatus::Failed, t(1));

        let stale = Watch::pending(vec![a, b], true, Some(CALLBACK.to_string()), HashMap::new());
        let inner = InMemoryWatchStore::new();
        inner.save(&stale, Revision::NONE).await.unwrap();
        let mut winner = stale.clone();
        winner.status = AskStatus::Failed;
        inner.save(&winner, Revision::new(1)).await.unwrap();

        let watches = Arc::new(StaleWatchStore::new(inner, stale.clone()));
        let engine = WatchEngine::builder(watches, members, Arc::new(registry(&probe, true)))
            .with_revocation_emitter(Arc::new(RecordingEmitter::new()))
            .build();

        let outcome = engine
            .process_trigger(stale.id, AskStatus::Failed, None)
            .await
            .unwrap();

        assert_eq!(outcome, TriggerOutcome::AlreadySettled(AskStatus::Failed));
        assert!(probe.calls().is_empty());
    }

    // ==========================================================================
    // Built-in Revoke Bus
    // ==========================================================================

    #[tokio::test]
    async fn test_default_emitter_is_revoke_bus() {
        let probe = CallbackProbe::new();
        let watches = Arc::new(InMemoryWatchStore::new());
        let members = Arc::new(InMemoryMemberStore::new());
        let engine = WatchEngine::builder(watches, members.clone(), Arc::new(registry(&probe, true)))
            .with_config(WatchConfig {
                revoke_capacity: 8,
                ..WatchConfig::default()
            })
            .build();
        let mut receiver = engine.subscribe_revocations().unwrap();
        assert_eq!(engine.config().revoke_capacity, 8);

        let reserve = members.create(RESERVE, serde_json::json!({ "sku": "A-1" }));
        let charge = members.create(CHARGE, serde_json::json!({ "amount_cents": 5 }));
        members.resolve(&charge, AskStatus::Failed, t(0));

        let watch = engine
            .create_watch(vec![reserve, charge], true, Some(CALLBACK.to_string()), HashMap::new())
            .await
            .unwrap();
        engine
            .process_trigger(watch.id, AskStatus::Failed, None)
            .await
            .unwrap();

        let request = receiver.recv().await.unwrap();
        assert_eq!(request.member_id, reserve);
        assert_eq!(request.failure, FailureInfo::new(FailureReason::Failed, t(0)));
    }

    #[tokio::test]
    async fn test_zero_revoke_capacity_still_builds() {
        let probe = CallbackProbe::new();
        let members = Arc::new(InMemoryMemberStore::new());
        let engine = WatchEngine::builder(
            Arc::new(InMemoryWatchStore::new()),
            members.clone(),
            Arc::new(registry(&probe, true)),
        )
        .with_config(WatchConfig {
            revoke_capacity: 0,
            ..WatchConfig::default()
        })
        .build();
        let mut receiver = engine.subscribe_revocations().unwrap();

        let reserve = members.create(RESERVE, serde_json::json!({ "sku": "A-1" }));
        let charge = members.create(CHARGE, serde_json::json!({ "amount_cents": 5 }));
        members.resolve(&charge, AskStatus::Cancelled, t(0));
        let watch = engine
            .create_watch(vec![reserve, charge], true, None, HashMap::new())
            .await
            .unwrap();
        engine
            .process_trigger(watch.id, AskStatus::Cancelled, None)
            .await
            .unwrap();

        assert_eq!(receiver.recv().await.unwrap().member_id, reserve);
    }

    #[tokio::test]
    async fn test_custom_emitter_has_no_bus() {
        let h = Harness::new();
        assert!(h.engine.subscribe_revocations().is_none());
    }
}
