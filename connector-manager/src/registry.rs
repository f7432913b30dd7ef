//! Connector registry - maps data source kinds to connector factories.

use crate::connectors::restapi::RestApiConnector;
use crate::types::RunError;
use crate::Connector;
use std::collections::HashMap;
use std::sync::Arc;

type ConnectorFactory = Arc<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

/// Kind-to-factory table consulted once per query run.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in connector.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(RestApiConnector::KIND, || Box::new(RestApiConnector::new()));
        registry
    }

    /// Registers (or replaces) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Instantiates the connector for `kind`.
    pub fn create(&self, kind: &str) -> Result<Box<dyn Connector>, RunError> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| RunError::UnsupportedKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = ConnectorRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["restapi"]);

        let connector = registry.create("restapi").unwrap();
        assert_eq!(connector.kind(), "restapi");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ConnectorRegistry::with_builtins();
        let err = registry.create("mongodb").err().unwrap();
        assert!(matches!(err, RunError::UnsupportedKind(kind) if kind == "mongodb"));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ConnectorRegistry::new();
        assert!(registry.kinds().is_empty());
        registry.register("restapi", || Box::new(RestApiConnector::new()));
        registry.register("restapi", || Box::new(RestApiConnector::new()));
        assert_eq!(registry.kinds().len(), 1);
    }
}
