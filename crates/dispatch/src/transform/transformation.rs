//! Transformation recipe

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::View;

/// A transformation recipe
///
/// Carries the type name used for pool routing and the type-specific
/// parameters the driver interprets. Parameters live in a sorted map so the
/// checksum is stable regardless of insertion order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transformation {
    transformation_type: String,
    parameters: BTreeMap<String, serde_json::Value>,
}

impl Transformation {
    /// Create a transformation of the given type with no parameters
    pub fn new(transformation_type: impl Into<String>) -> Self {
        Self {
            transformation_type: transformation_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a parameter
    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// The type name used for pool routing
    pub fn transformation_type(&self) -> &str {
        &self.transformation_type
    }

    /// The type-specific parameters
    pub fn parameters(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.parameters
    }

    /// Bind this recipe to a concrete view
    ///
    /// Returns a copy carrying the view's path as a parameter, so the
    /// driver materialises the right target.
    pub fn for_view(&self, view: &View) -> Transformation {
        self.clone().with_parameter("view", view.path())
    }

    /// Stable content checksum of this transformation
    ///
    /// Sha256 over the type name and the canonically ordered parameters,
    /// hex encoded. Two transformations with the same type and parameters
    /// produce the same checksum.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.transformation_type.as_bytes());
        hasher.update([0u8]);
        for (key, value) in &self.parameters {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.to_string().as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} parameters)", self.transformation_type, self.parameters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_stable_across_insertion_order() {
        let a = Transformation::new("hive")
            .with_parameter("sql", "select 1")
            .with_parameter("database", "warehouse");
        let b = Transformation::new("hive")
            .with_parameter("database", "warehouse")
            .with_parameter("sql", "select 1");

        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_checksum_differs_on_content() {
        let a = Transformation::new("hive").with_parameter("sql", "select 1");
        let b = Transformation::new("hive").with_parameter("sql", "select 2");
        let c = Transformation::new("pig").with_parameter("sql", "select 1");

        assert_ne!(a.checksum(), b.checksum());
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn test_for_view_binds_path() {
        let recipe = Transformation::new("hive").with_parameter("sql", "select 1");
        let view = View::new("warehouse", "orders", recipe.clone()).with_partition("2026/07");

        let bound = recipe.for_view(&view);
        assert_eq!(
            bound.parameters().get("view").and_then(|v| v.as_str()),
            Some("warehouse.orders/2026/07")
        );
        // Binding changes the checksum: the bound run targets one view.
        assert_ne!(bound.checksum(), recipe.checksum());
    }

    #[test]
    fn test_serialization_round_trip() {
        let t = Transformation::new("mapreduce")
            .with_parameter("jar", "analytics.jar")
            .with_parameter("reducers", 16);

        let json = serde_json::to_string(&t).expect("should serialize");
        let parsed: Transformation = serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(t, parsed);
    }
}
