//! Driver factory registry
//!
//! Maps transformation type names to the factories that build driver
//! instances. The dispatcher resolves every configured type against the
//! registry at bootstrap; a missing factory is a fatal configuration error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::definition::DriverFactory;

/// Registry of driver factories keyed by transformation type name
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under its declared transformation type
    pub fn register<F: DriverFactory + 'static>(&mut self, factory: F) {
        self.register_arc(Arc::new(factory));
    }

    /// Register an already shared factory
    pub fn register_arc(&mut self, factory: Arc<dyn DriverFactory>) {
        self.factories
            .insert(factory.transformation_type().to_string(), factory);
    }

    /// Whether a type name has a registered factory
    pub fn contains(&self, transformation_type: &str) -> bool {
        self.factories.contains_key(transformation_type)
    }

    /// Resolve the factory for a type name
    pub fn factory(
        &self,
        transformation_type: &str,
    ) -> Result<Arc<dyn DriverFactory>, RegistryError> {
        self.factories
            .get(transformation_type)
            .cloned()
            .ok_or_else(|| {
                RegistryError::UnknownTransformationType(transformation_type.to_string())
            })
    }

    /// All registered type names
    pub fn transformation_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }

    /// Number of registered factories
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field(
                "transformation_types",
                &self.factories.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No factory registered for the type name
    #[error("unknown transformation type: {0}")]
    UnknownTransformationType(String),
}
