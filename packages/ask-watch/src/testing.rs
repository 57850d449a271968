//! Testing utilities for watches and callbacks.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! ask-watch = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use ask_watch::testing::{CallbackProbe, RecordingEmitter};
//!
//! let probe = CallbackProbe::new();
//! registry.register_callback(probe.descriptor(
//!     CallbackDescriptor::builder("order:place")
//!         .event::<StockReserved>()
//!         .failure_info()
//!         .with_failure_operation(),
//! ));
//!
//! let revocations = Arc::new(RecordingEmitter::new());
//! let engine = WatchEngine::builder(watches, members, Arc::new(registry))
//!     .with_revocation_emitter(revocations.clone())
//!     .build();
//!
//! engine.process_trigger(watch.id, AskStatus::Failed, None).await?;
//!
//! assert_eq!(probe.calls().len(), 1);
//! assert_eq!(revocations.len(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::bus::{RevocationEmitter, RevokeRequest};
use crate::core::{FailureInfo, MemberId};
use crate::dispatch::CallbackArgs;
use crate::error::CallbackOperation;
use crate::registry::{AskCallback, CallbackDescriptor, CallbackDescriptorBuilder};

// =============================================================================
// Callback Probe
// =============================================================================

/// One recorded callback invocation.
#[derive(Debug, Clone)]
pub struct ProbeCall {
    /// Which operation the dispatcher chose.
    pub operation: CallbackOperation,
    /// The arguments it bound.
    pub args: CallbackArgs,
}

/// Callback that records every invocation for test assertions.
///
/// The probe does NOT do any work - it only records what the dispatcher
/// handed it. Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct CallbackProbe {
    calls: Arc<Mutex<Vec<ProbeCall>>>,
    instances: Arc<AtomicUsize>,
}

impl CallbackProbe {
    /// Create a new empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish a descriptor whose handler records into this probe.
    pub fn descriptor(&self, builder: CallbackDescriptorBuilder) -> CallbackDescriptor {
        let probe = self.clone();
        builder.build_with(std::any::type_name::<ProbeCallback>(), move || {
            probe.instances.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ProbeCallback {
                calls: probe.calls.clone(),
            }) as Box<dyn AskCallback>)
        })
    }

    /// Get all recorded invocations.
    pub fn calls(&self) -> Vec<ProbeCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Get the count of handler instances built.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    /// Clear all recorded invocations.
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
        self.instances.store(0, Ordering::SeqCst);
    }
}

struct ProbeCallback {
    calls: Arc<Mutex<Vec<ProbeCall>>>,
}

impl ProbeCallback {
    fn record(&self, operation: CallbackOperation, args: CallbackArgs) {
        self.calls.lock().unwrap().push(ProbeCall { operation, args });
    }
}

#[async_trait]
impl AskCallback for ProbeCallback {
    async fn on_success(&mut self, args: CallbackArgs) -> Result<()> {
        self.record(CallbackOperation::OnSuccess, args);
        Ok(())
    }

    async fn on_failure(&mut self, args: CallbackArgs) -> Result<()> {
        self.record(CallbackOperation::OnFailure, args);
        Ok(())
    }
}

// =============================================================================
// Recording Emitter
// =============================================================================

/// Revocation emitter that records requests instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    requests: Mutex<Vec<RevokeRequest>>,
}

impl RecordingEmitter {
    /// Create a new empty emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all recorded requests, in emission order.
    pub fn requests(&self) -> Vec<RevokeRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Check if a member was revoked.
    pub fn was_revoked(&self, member_id: MemberId) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.member_id == member_id)
    }

    /// Get the count of recorded requests.
    pub fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RevocationEmitter for RecordingEmitter {
    fn revoke(&self, member_id: MemberId, failure: FailureInfo) {
        self.requests
            .lock()
            .unwrap()
            .push(RevokeRequest { member_id, failure });
    }
}
