//! Event and callback registration.
//!
//! This module provides the read-mostly lookup state the join needs:
//! - [`EventValue`] - A deserialized member event with its concrete type erased
//! - [`ParamSpec`] - One declared callback parameter (closed set of slot kinds)
//! - [`AskCallback`] - The handler a caller registers for a watch
//! - [`CallbackDescriptor`] - How to build a handler and what it takes
//! - [`CallbackRegistry`] - Lookup seam used by the engine and dispatcher
//! - [`EventRegistry`] - The concrete registry, built once at startup
//!
//! # Example
//!
//! ```ignore
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
//!         .build::<PlaceOrderCallback>(),
//! );
//! let registry = Arc::new(registry); // frozen from here on
//! ```

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::dispatch::CallbackArgs;

// =============================================================================
// Event Value
// =============================================================================

/// A deserialized member event.
///
/// Carries the concrete `TypeId` so callback parameters can be matched by
/// type without knowing it statically.
#[derive(Clone)]
pub struct EventValue {
    type_id: TypeId,
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl EventValue {
    pub fn new<E: Any + Send + Sync + 'static>(event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            payload: Arc::new(event),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Downcast the payload to a concrete event type.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref()
    }
}

impl fmt::Debug for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Deserialization errors for member payloads.
#[derive(Debug, thiserror::Error)]
pub enum DeserializationError {
    /// The event type tag is not registered.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The payload does not match the registered event type.
    #[error("invalid payload for event type {event_type}: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// Callback Parameters
// =============================================================================

/// One declared callback parameter.
///
/// Arguments are resolved in declaration order and passed positionally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamSpec {
    /// The member event of this concrete type, absent if no member has it.
    Event {
        type_id: TypeId,
        type_name: &'static str,
    },
    /// The group's failure info, absent on success.
    FailureInfo,
    /// `extra_params[name]`, absent if the key is missing.
    Named(String),
}

impl ParamSpec {
    pub fn event<E: Any>() -> Self {
        ParamSpec::Event {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        ParamSpec::Named(name.into())
    }
}

// =============================================================================
// Callback
// =============================================================================

/// Handler invoked once a watch settles.
///
/// A fresh instance is built for every invocation, so implementations should
/// not expect state to survive between calls.
#[async_trait]
pub trait AskCallback: Send + 'static {
    /// Called when the watch settles on `SUCCESS`.
    async fn on_success(&mut self, args: CallbackArgs) -> Result<()>;

    /// Called when the watch settles on a failure status.
    ///
    /// Only invoked if the descriptor was built
    /// [`with_failure_operation`](CallbackDescriptorBuilder::with_failure_operation).
    async fn on_failure(&mut self, _args: CallbackArgs) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh callback instance.
pub type CallbackFactory = Arc<dyn Fn() -> Result<Box<dyn AskCallback>> + Send + Sync>;

/// Everything the dispatcher needs to invoke a registered callback.
#[derive(Clone)]
pub struct CallbackDescriptor {
    id: String,
    target: &'static str,
    factory: CallbackFactory,
    has_failure_operation: bool,
    parameters: Vec<ParamSpec>,
}

impl CallbackDescriptor {
    pub fn builder(id: impl Into<String>) -> CallbackDescriptorBuilder {
        CallbackDescriptorBuilder {
            id: id.into(),
            has_failure_operation: false,
            parameters: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Type name of the handler, for logs.
    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn has_failure_operation(&self) -> bool {
        self.has_failure_operation
    }

    pub fn parameters(&self) -> &[ParamSpec] {
        &self.parameters
    }

    /// Build a fresh handler instance.
    pub fn instantiate(&self) -> Result<Box<dyn AskCallback>> {
        (self.factory)()
    }
}

impl fmt::Debug for CallbackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDescriptor")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("has_failure_operation", &self.has_failure_operation)
            .field("parameters", &self.parameters)
            .finish_non_exhaustive()
    }
}

/// Builder for [`CallbackDescriptor`].
pub struct CallbackDescriptorBuilder {
    id: String,
    has_failure_operation: bool,
    parameters: Vec<ParamSpec>,
}

impl CallbackDescriptorBuilder {
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn event<E: Any>(self) -> Self {
        self.param(ParamSpec::event::<E>())
    }

    pub fn failure_info(self) -> Self {
        self.param(ParamSpec::FailureInfo)
    }

    pub fn named(self, name: impl Into<String>) -> Self {
        self.param(ParamSpec::named(name))
    }

    /// Opt in to failure notifications.
    ///
    /// Without this, failing transitions dispatch nothing.
    pub fn with_failure_operation(mut self) -> Self {
        self.has_failure_operation = true;
        self
    }

    /// Finish with a handler built through `Default` on every invocation.
    pub fn build<C>(self) -> CallbackDescriptor
    where
        C: AskCallback + Default,
    {
        self.build_with(std::any::type_name::<C>(), || {
            Ok(Box::new(C::default()) as Box<dyn AskCallback>)
        })
    }

    /// Finish with a custom, possibly fallible, factory.
    pub fn build_with<F>(self, target: &'static str, factory: F) -> CallbackDescriptor
    where
        F: Fn() -> Result<Box<dyn AskCallback>> + Send + Sync + 'static,
    {
        CallbackDescriptor {
            id: self.id,
            target,
            factory: Arc::new(factory),
            has_failure_operation: self.has_failure_operation,
            parameters: self.parameters,
        }
    }
}

// =============================================================================
// Callback Registry
// =============================================================================

/// Lookup seam for callbacks and event metadata.
///
/// Implementations are built at startup and treated as immutable afterwards.
pub trait CallbackRegistry: Send + Sync + 'static {
    /// Descriptor registered under `callback_id`.
    fn resolve(&self, callback_id: &str) -> Option<Arc<CallbackDescriptor>>;

    /// Whether members of this event type support revocation.
    fn is_revocable(&self, event_type: &str) -> bool;

    /// Decode a member payload into its concrete event.
    fn deserialize_event(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<EventValue, DeserializationError>;

    /// Whether some registered event type decodes into `type_id`.
    fn produces(&self, type_id: TypeId) -> bool;
}

/// Type-erased deserializer function.
type DeserializeFn =
    Box<dyn Fn(&serde_json::Value) -> Result<EventValue, serde_json::Error> + Send + Sync>;

struct EventEntry {
    deserialize: DeserializeFn,
    revocable: bool,
}

/// The concrete registry.
///
/// Registration happens while the value is still owned; share it behind an
/// `Arc` once built.
#[derive(Default)]
pub struct EventRegistry {
    events: HashMap<&'static str, EventEntry>,
    produced: HashSet<TypeId>,
    callbacks: HashMap<String, Arc<CallbackDescriptor>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type that cannot be revoked.
    ///
    /// # Panics
    ///
    /// Panics if the tag is already registered.
    pub fn register_event<E>(&mut self, event_type: &'static str)
    where
        E: DeserializeOwned + Send + Sync + 'static,
    {
        self.insert_event::<E>(event_type, false);
    }

    /// Register an event type whose work can be revoked.
    ///
    /// # Panics
    ///
    /// Panics if the tag is already registered.
    pub fn register_revocable_event<E>(&mut self, event_type: &'static str)
    where
        E: DeserializeOwned + Send + Sync + 'static,
    {
        self.insert_event::<E>(event_type, true);
    }

    fn insert_event<E>(&mut self, event_type: &'static str, revocable: bool)
    where
        E: DeserializeOwned + Send + Sync + 'static,
    {
        if self.events.contains_key(event_type) {
            panic!("event type already registered: {}", event_type);
        }

        let deserialize: DeserializeFn = Box::new(
            |payload: &serde_json::Value| -> Result<EventValue, serde_json::Error> {
                let event: E = serde_json::from_value(payload.clone())?;
                Ok(EventValue::new(event))
            },
        );

        self.produced.insert(TypeId::of::<E>());
        self.events.insert(
            event_type,
            EventEntry {
                deserialize,
                revocable,
            },
        );
    }

    /// Register a callback descriptor under its id.
    ///
    /// # Panics
    ///
    /// Panics if a callback with the same id is already registered, or if a
    /// named parameter has an empty name.
    pub fn register_callback(&mut self, descriptor: CallbackDescriptor) {
        if self.callbacks.contains_key(descriptor.id()) {
            panic!("callback already registered: {}", descriptor.id());
        }
        if let Some(index) = descriptor
            .parameters()
            .iter()
            .position(|spec| matches!(spec, ParamSpec::Named(name) if name.is_empty()))
        {
            panic!(
                "callback {} has an empty parameter name at position {}",
                descriptor.id(),
                index
            );
        }
        self.callbacks
            .insert(descriptor.id().to_string(), Arc::new(descriptor));
    }

    /// Check if an event type tag is registered.
    pub fn has_event(&self, event_type: &str) -> bool {
        self.events.contains_key(event_type)
    }

    pub fn has_callback(&self, callback_id: &str) -> bool {
        self.callbacks.contains_key(callback_id)
    }
}

impl CallbackRegistry for EventRegistry {
    fn resolve(&self, callback_id: &str) -> Option<Arc<CallbackDescriptor>> {
        self.callbacks.get(callback_id).cloned()
    }

    fn is_revocable(&self, event_type: &str) -> bool {
        self.events
            .get(event_type)
            .map(|entry| entry.revocable)
            .unwrap_or(false)
    }

    fn deserialize_event(
        &self,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<EventValue, DeserializationError> {
        let entry = self
            .events
            .get(event_type)
            .ok_or_else(|| DeserializationError::UnknownEventType(event_type.to_string()))?;

        (entry.deserialize)(payload).map_err(|source| DeserializationError::InvalidPayload {
            event_type: event_type.to_string(),
            source,
        })
    }

    fn produces(&self, type_id: TypeId) -> bool {
        self.produced.contains(&type_id)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.events.keys().collect::<Vec<_>>())
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StockReserved {
        sku: String,
        quantity: u32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CardCharged {
        amount_cents: i64,
    }

    #[derive(Default)]
    struct NoopCallback;

    #[async_trait]
    impl AskCallback for NoopCallback {
        async fn on_success(&mut self, _args: CallbackArgs) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> EventRegistry {
        let mut registry = EventRegistry::new();
        registry.register_revocable_event::<StockReserved>("inventory:reserve");
        registry.register_event::<CardCharged>("payment:charge");
        registry
    }

    #[test]
    fn test_deserialize_registered_event() {
        let registry = registry();
        let value = registry
            .deserialize_event(
                "inventory:reserve",
                &serde_json::json!({ "sku": "A-1", "quantity": 2 }),
            )
            .unwrap();

        assert_eq!(value.type_id(), TypeId::of::<StockReserved>());
        let event = value.downcast_ref::<StockReserved>().unwrap();
        assert_eq!(event.sku, "A-1");
        assert!(value.downcast_ref::<CardCharged>().is_none());
    }

    #[test]
    fn test_deserialize_unknown_event_type() {
        let registry = registry();
        let result = registry.deserialize_event("unknown:type", &serde_json::json!({}));
        assert!(matches!(
            result,
            Err(DeserializationError::UnknownEventType(ref t)) if t == "unknown:type"
        ));
    }

    #[test]
    fn test_deserialize_invalid_payload() {
        let registry = registry();
        let result =
            registry.deserialize_event("payment:charge", &serde_json::json!({ "wrong": 1 }));
        assert!(matches!(
            result,
            Err(DeserializationError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_revocability_lookup() {
        let registry = registry();
        assert!(registry.is_revocable("inventory:reserve"));
        assert!(!registry.is_revocable("payment:charge"));
        assert!(!registry.is_revocable("never:registered"));
    }

    #[test]
    fn test_produces_tracks_registered_types() {
        let registry = registry();
        assert!(registry.produces(TypeId::of::<StockReserved>()));
        assert!(!registry.produces(TypeId::of::<String>()));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_event_registration_panics() {
        let mut registry = registry();
        registry.register_event::<CardCharged>("payment:charge");
    }

    #[test]
    fn test_callback_registration_and_resolve() {
        let mut registry = registry();
        registry.register_callback(
            CallbackDescriptor::builder("order:place")
                .event::<StockReserved>()
                .failure_info()
                .named("order_id")
                .build::<NoopCallback>(),
        );

        assert!(registry.has_callback("order:place"));
        let descriptor = registry.resolve("order:place").unwrap();
        assert!(!descriptor.has_failure_operation());
        assert_eq!(
            descriptor.parameters(),
            &[
                ParamSpec::event::<StockReserved>(),
                ParamSpec::FailureInfo,
                ParamSpec::named("order_id"),
            ]
        );
        assert!(descriptor.target().contains("NoopCallback"));
        assert!(descriptor.instantiate().is_ok());
        assert!(registry.resolve("order:cancel").is_none());
    }

    #[test]
    #[should_panic(expected = "callback already registered")]
    fn test_duplicate_callback_registration_panics() {
        let mut registry = EventRegistry::new();
        registry.register_callback(CallbackDescriptor::builder("dup").build::<NoopCallback>());
        registry.register_callback(CallbackDescriptor::builder("dup").build::<NoopCallback>());
    }

    #[test]
    #[should_panic(expected = "empty parameter name at position 1")]
    fn test_empty_parameter_name_panics_at_registration() {
        let mut registry = EventRegistry::new();
        registry.register_callback(
            CallbackDescriptor::builder("order:place")
                .failure_info()
                .named("")
                .build::<NoopCallback>(),
        );
    }

    #[test]
    fn test_registry_debug_lists_keys() {
        let debug = format!("{:?}", registry());
        assert!(debug.contains("EventRegistry"));
        assert!(debug.contains("payment:charge"));
    }
}
