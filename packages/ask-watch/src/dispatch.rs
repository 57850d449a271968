//! Callback dispatcher for settled watches.
//!
//! The `CallbackDispatcher` is responsible for:
//! 1. Resolving the callback descriptor registered for a watch
//! 2. Decoding member payloads into typed events
//! 3. Binding declared parameters to arguments, in declaration order
//! 4. Invoking exactly one operation on a fresh handler instance
//!
//! Errors and panics raised by the handler are surfaced as
//! [`WatchError::CallbackInvocationFailure`] carrying the handler's own cause.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::core::{FailureInfo, MemberId, MemberRecord};
use crate::error::{CallbackOperation, WatchError};
use crate::registry::{CallbackRegistry, EventValue, ParamSpec};

// =============================================================================
// Callback Arguments
// =============================================================================

/// One resolved argument.
#[derive(Debug, Clone)]
pub enum CallbackArg {
    Event(EventValue),
    Failure(FailureInfo),
    Text(String),
}

/// Positional arguments handed to a callback operation.
///
/// Each slot matches the descriptor's parameter at the same index. A slot is
/// `None` when the value is absent (no member of that event type, no failure
/// info on success, missing extra param).
#[derive(Debug, Clone, Default)]
pub struct CallbackArgs {
    args: Vec<Option<CallbackArg>>,
}

impl CallbackArgs {
    pub fn new(args: Vec<Option<CallbackArg>>) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CallbackArg> {
        self.args.get(index).and_then(Option::as_ref)
    }

    /// The event at `index`, if present and of type `E`.
    pub fn event<E: Any>(&self, index: usize) -> Option<&E> {
        match self.get(index)? {
            CallbackArg::Event(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// The failure info at `index`, if present.
    pub fn failure(&self, index: usize) -> Option<&FailureInfo> {
        match self.get(index)? {
            CallbackArg::Failure(info) => Some(info),
            _ => None,
        }
    }

    /// The named extra param at `index`, if present.
    pub fn text(&self, index: usize) -> Option<&str> {
        match self.get(index)? {
            CallbackArg::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&CallbackArg>> {
        self.args.iter().map(Option::as_ref)
    }
}

impl fmt::Display for CallbackArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match arg {
                None => write!(f, "null")?,
                Some(CallbackArg::Event(value)) => write!(f, "{}", value.type_name())?,
                Some(CallbackArg::Failure(info)) => write!(f, "{}@{}", info.kind, info.timestamp)?,
                Some(CallbackArg::Text(value)) => write!(f, "{:?}", value)?,
            }
        }
        write!(f, "]")
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// What a dispatch call ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The watch has no callback.
    NoCallback,
    /// The outcome is a failure and the callback has no failure operation.
    OptedOut,
    /// The operation ran and returned `Ok`.
    Invoked(CallbackOperation),
}

/// Resolves and invokes registered callbacks.
#[derive(Clone)]
pub struct CallbackDispatcher {
    registry: Arc<dyn CallbackRegistry>,
}

impl CallbackDispatcher {
    pub fn new(registry: Arc<dyn CallbackRegistry>) -> Self {
        Self { registry }
    }

    /// Invoke the success or failure operation of `callback_id`.
    ///
    /// # Errors
    ///
    /// - `UnknownCallback` if `callback_id` is not registered
    /// - `Deserialization` if a member payload cannot be decoded
    /// - `CallbackInvocationFailure` if the handler fails to build, returns an
    ///   error, or panics
    pub async fn dispatch(
        &self,
        success: bool,
        callback_id: Option<&str>,
        extra_params: &HashMap<String, String>,
        members: &[MemberRecord],
        failure: Option<FailureInfo>,
    ) -> Result<DispatchOutcome, WatchError> {
        let Some(callback_id) = callback_id else {
            return Ok(DispatchOutcome::NoCallback);
        };

        let descriptor = self
            .registry
            .resolve(callback_id)
            .ok_or_else(|| WatchError::UnknownCallback(callback_id.to_string()))?;

        if !success && !descriptor.has_failure_operation() {
            debug!(callback_id, "callback has no failure operation, skipping");
            return Ok(DispatchOutcome::OptedOut);
        }

        let events = self.decode_members(callback_id, members)?;

        let args = descriptor
            .parameters()
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                self.resolve_param(callback_id, index, spec, &events, extra_params, failure)
            })
            .collect();
        let args = CallbackArgs::new(args);

        let operation = CallbackOperation::for_outcome(success);
        let invocation_failure = |source: anyhow::Error| WatchError::CallbackInvocationFailure {
            callback_id: callback_id.to_string(),
            operation,
            source,
        };

        let mut target = match catch_unwind(AssertUnwindSafe(|| descriptor.instantiate())) {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => return Err(invocation_failure(e)),
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(callback_id, panic = %panic_msg, "callback factory panicked");
                return Err(invocation_failure(anyhow::anyhow!(
                    "callback factory panicked: {}",
                    panic_msg
                )));
            }
        };

        debug!(
            callback_id,
            handler = descriptor.target(),
            %operation,
            %args,
            "invoking callback"
        );

        // AssertUnwindSafe is required because the handler is not UnwindSafe
        let result = if success {
            AssertUnwindSafe(target.on_success(args)).catch_unwind().await
        } else {
            AssertUnwindSafe(target.on_failure(args)).catch_unwind().await
        };

        match result {
            Ok(Ok(())) => Ok(DispatchOutcome::Invoked(operation)),
            Ok(Err(e)) => {
                error!(callback_id, %operation, error = ?e, "callback failed");
                Err(invocation_failure(e))
            }
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(callback_id, %operation, panic = %panic_msg, "callback panicked");
                Err(invocation_failure(anyhow::anyhow!(
                    "callback panicked: {}",
                    panic_msg
                )))
            }
        }
    }

    /// Decode every member and key the events by concrete type.
    ///
    /// Later members overwrite earlier ones of the same type.
    fn decode_members(
        &self,
        callback_id: &str,
        members: &[MemberRecord],
    ) -> Result<HashMap<TypeId, (MemberId, EventValue)>, WatchError> {
        let mut events = HashMap::with_capacity(members.len());
        for member in members {
            let value = self
                .registry
                .deserialize_event(&member.event_type, &member.payload)?;
            let type_name = value.type_name();
            if let Some((shadowed, _)) = events.insert(value.type_id(), (member.id, value)) {
                warn!(
                    callback_id,
                    event_type = type_name,
                    shadowed_member = %shadowed,
                    member_id = %member.id,
                    "two members share an event type, callback sees the later one"
                );
            }
        }
        Ok(events)
    }

    /// Bind one parameter. Anything missing binds as `None`.
    fn resolve_param(
        &self,
        callback_id: &str,
        index: usize,
        spec: &ParamSpec,
        events: &HashMap<TypeId, (MemberId, EventValue)>,
        extra_params: &HashMap<String, String>,
        failure: Option<FailureInfo>,
    ) -> Option<CallbackArg> {
        match spec {
            ParamSpec::Event { type_id, type_name } => {
                if !self.registry.produces(*type_id) {
                    warn!(
                        callback_id,
                        index,
                        expected = type_name,
                        "no registered event type produces this parameter, binding none"
                    );
                }
                events
                    .get(type_id)
                    .map(|(_, value)| CallbackArg::Event(value.clone()))
            }
            ParamSpec::FailureInfo => failure.map(CallbackArg::Failure),
            ParamSpec::Named(name) => extra_params.get(name).cloned().map(CallbackArg::Text),
        }
    }
}

impl fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDispatcher").finish_non_exhaustive()
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
