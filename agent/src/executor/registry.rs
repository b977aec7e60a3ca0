//! Executor registry: a write-once mapping from stage kind to factory.
//!
//! Registration happens during component init and is subsequently
//! read-only; binding a kind twice is a precondition error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use crate::errors::PipedError;
use crate::executor::{ExecutorFactory, StageExecutor};
use crate::model::deployment::StageKind;

pub struct ExecutorRegistry {
    factories: RwLock<HashMap<StageKind, ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a factory to a stage kind
    pub fn register(&self, kind: StageKind, factory: ExecutorFactory) -> Result<(), PipedError> {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(&kind) {
            return Err(PipedError::AlreadyRegistered(kind.to_string()));
        }
        factories.insert(kind, factory);
        Ok(())
    }

    /// Produce the executor for a stage kind
    pub fn executor_for(&self, kind: StageKind) -> Result<Arc<dyn StageExecutor>, PipedError> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let factory = factories
            .get(&kind)
            .ok_or_else(|| PipedError::UnknownStage(kind.to_string()))?;
        Ok(factory())
    }

    /// Whether a kind has a registered executor
    pub fn is_registered(&self, kind: StageKind) -> bool {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.contains_key(&kind)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::executor::{ExecutionOutcome, Input};

    #[derive(Debug)]
    struct NopExecutor;

    #[async_trait]
    impl StageExecutor for NopExecutor {
        async fn execute(&self, _input: Input) -> ExecutionOutcome {
            ExecutionOutcome::Success
        }
    }

    fn nop_factory() -> ExecutorFactory {
        Arc::new(|| Arc::new(NopExecutor))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Wait, nop_factory()).unwrap();

        assert!(registry.is_registered(StageKind::Wait));
        assert!(registry.executor_for(StageKind::Wait).is_ok());
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = ExecutorRegistry::new();
        registry.register(StageKind::Sync, nop_factory()).unwrap();

        let err = registry.register(StageKind::Sync, nop_factory()).unwrap_err();
        assert!(matches!(err, PipedError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_unknown_stage() {
        let registry = ExecutorRegistry::new();
        let err = registry.executor_for(StageKind::Analysis).unwrap_err();
        assert!(matches!(err, PipedError::UnknownStage(_)));
    }
}
