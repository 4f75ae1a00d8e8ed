//! Materialised view node

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Transformation;

/// A materialised (table or partition) node in the warehouse graph
///
/// The dispatcher core treats views as opaque: it only reads the declared
/// [`transformation`](View::transformation) and echoes the view back in
/// replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct View {
    module: String,
    name: String,
    partition: Option<String>,
    transformation: Transformation,
}

impl View {
    /// Create a view with its declared transformation
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        transformation: Transformation,
    ) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            partition: None,
            transformation,
        }
    }

    /// Set the partition this view covers
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// The module (database) the view belongs to
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The view's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The partition, if any
    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    /// The transformation declared for this view
    pub fn transformation(&self) -> &Transformation {
        &self.transformation
    }

    /// Path string identifying the view, e.g. `warehouse.orders/2026/07`
    pub fn path(&self) -> String {
        match &self.partition {
            Some(partition) => format!("{}.{}/{}", self.module, self.name, partition),
            None => format!("{}.{}", self.module, self.name),
        }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_without_partition() {
        let view = View::new("warehouse", "orders", Transformation::new("hive"));
        assert_eq!(view.path(), "warehouse.orders");
    }

    #[test]
    fn test_path_with_partition() {
        let view = View::new("warehouse", "orders", Transformation::new("hive"))
            .with_partition("2026/08");
        assert_eq!(view.path(), "warehouse.orders/2026/08");
        assert_eq!(view.to_string(), "warehouse.orders/2026/08");
    }

    #[test]
    fn test_transformation_access() {
        let recipe = Transformation::new("hive").with_parameter("sql", "select 1");
        let view = View::new("warehouse", "orders", recipe.clone());
        assert_eq!(view.transformation(), &recipe);
    }
}
