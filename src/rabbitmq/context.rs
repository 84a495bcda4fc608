// src/rabbitmq/context.rs

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-delivery context handed to subscription handlers.
///
/// Built fresh for every delivery from the subscription's cancellation token,
/// then threaded through the delivery-before hooks, each of which may attach
/// typed values (trace ids, tenant, ...) for the handler to read back.
#[derive(Clone)]
pub struct DeliveryContext {
    cancel: CancellationToken,
    generation: u64,
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DeliveryContext {
    pub fn new(cancel: CancellationToken, generation: u64) -> Self {
        Self {
            cancel,
            generation,
            values: HashMap::new(),
        }
    }

    /// Attach a value, replacing any previous value of the same type.
    pub fn with_value<T: 'static + Send + Sync>(mut self, value: T) -> Self {
        self.values.insert(
            TypeId::of::<T>(),
            Arc::new(value) as Arc<dyn Any + Send + Sync>,
        );
        self
    }

    pub fn get<T: 'static + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|arc| arc.downcast_ref::<T>())
    }

    /// Fires when the subscription is stopped or the client context is
    /// cancelled.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Connection generation the delivery arrived on.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("cancelled", &self.is_cancelled())
            .field("generation", &self.generation)
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TraceId(String);

    #[test]
    fn values_are_keyed_by_type() {
        let ctx = DeliveryContext::new(CancellationToken::new(), 3)
            .with_value(TraceId("t-1".into()))
            .with_value(42u32)
            .with_value(TraceId("t-2".into()));

        assert_eq!(ctx.get::<TraceId>(), Some(&TraceId("t-2".into())));
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert_eq!(ctx.get::<String>(), None);
        assert_eq!(ctx.generation(), 3);
    }

    #[test]
    fn follows_the_subscription_token() {
        let token = CancellationToken::new();
        let ctx = DeliveryContext::new(token.child_token(), 1);
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
