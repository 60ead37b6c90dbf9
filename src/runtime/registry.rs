//! Registry mapping task types to handlers.
//!
//! The set of task types is closed per deployment, so this is a plain
//! immutable map built once at startup. Duplicate registration is allowed
//! (last one wins, with a warning) so a deployment can override a built-in
//! handler; types without a handler are logged at build time and become
//! permanent failures at dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::handlers::TaskHandler;
use crate::task::TaskType;

pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn handler_for(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn has_handler(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct HandlerRegistryBuilder {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        let task_type = handler.task_type();
        if self.handlers.insert(task_type, handler).is_some() {
            warn!(task_type = %task_type, "duplicate handler registration; later one wins");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        for task_type in TaskType::ALL {
            match self.handlers.get(&task_type) {
                Some(_) => info!(task_type = %task_type, "registered task handler"),
                // Custom intentionally ships without a built-in handler.
                None if task_type != TaskType::Custom => {
                    warn!(task_type = %task_type, "no handler registered for task type")
                }
                None => {}
            }
        }
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{TaskExecutionResult, ValidationError};
    use crate::task::Task;
    use async_trait::async_trait;

    struct StubHandler(TaskType);

    #[async_trait]
    impl TaskHandler for StubHandler {
        fn task_type(&self) -> TaskType {
            self.0
        }

        fn validate(&self, _task: &Task) -> Result<(), ValidationError> {
            Ok(())
        }

        async fn execute(&self, _task: &Task) -> TaskExecutionResult {
            TaskExecutionResult::success()
        }
    }

    #[test]
    fn lookup_by_type() {
        let registry = HandlerRegistry::builder()
            .register(Arc::new(StubHandler(TaskType::OrderCancel)))
            .register(Arc::new(StubHandler(TaskType::PaymentRefund)))
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.has_handler(TaskType::OrderCancel));
        assert!(!registry.has_handler(TaskType::PaymentVoid));
        assert_eq!(
            registry.handler_for(TaskType::PaymentRefund).unwrap().task_type(),
            TaskType::PaymentRefund
        );
        assert!(registry.handler_for(TaskType::Custom).is_none());
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let first: Arc<dyn TaskHandler> = Arc::new(StubHandler(TaskType::OrderCancel));
        let second: Arc<dyn TaskHandler> = Arc::new(StubHandler(TaskType::OrderCancel));
        let second_ptr = Arc::as_ptr(&second) as *const ();

        let registry = HandlerRegistry::builder()
            .register(first)
            .register(second)
            .build();

        assert_eq!(registry.len(), 1);
        let resolved = registry.handler_for(TaskType::OrderCancel).unwrap();
        assert!(std::ptr::eq(Arc::as_ptr(&resolved) as *const (), second_ptr));
    }
}
