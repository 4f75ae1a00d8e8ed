//! Filesystem transformation convenience shape

use serde::{Deserialize, Serialize};

use super::Transformation;

/// Type name of the filesystem pool
pub const FILESYSTEM_TYPE: &str = "filesystem";

/// A filesystem operation carried by a [`FilesystemTransformation`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum FilesystemOperation {
    /// Copy a file or tree
    Copy {
        /// Source path
        from: String,
        /// Destination path
        to: String,
    },

    /// Move a file or tree
    Move {
        /// Source path
        from: String,
        /// Destination path
        to: String,
    },

    /// Delete a path
    Delete {
        /// Path to delete
        path: String,
        /// Whether directories are removed recursively
        recursive: bool,
    },

    /// Create an empty marker file
    Touch {
        /// Path to touch
        path: String,
    },

    /// Create a directory tree
    MkDirs {
        /// Path to create
        path: String,
    },
}

/// A bare filesystem transformation, not bound to any view
///
/// Convenience inbound shape: the dispatcher converts it into a
/// [`Transformation`] of type [`FILESYSTEM_TYPE`] and routes it to the
/// filesystem pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesystemTransformation {
    operation: FilesystemOperation,
}

impl FilesystemTransformation {
    /// Wrap a filesystem operation
    pub fn new(operation: FilesystemOperation) -> Self {
        Self { operation }
    }

    /// The wrapped operation
    pub fn operation(&self) -> &FilesystemOperation {
        &self.operation
    }
}

impl From<FilesystemTransformation> for Transformation {
    fn from(fs: FilesystemTransformation) -> Self {
        let params = serde_json::to_value(&fs.operation)
            .unwrap_or(serde_json::Value::Null);
        let mut transformation = Transformation::new(FILESYSTEM_TYPE);
        if let serde_json::Value::Object(map) = params {
            for (key, value) in map {
                transformation = transformation.with_parameter(key, value);
            }
        }
        transformation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_to_filesystem_type() {
        let fs = FilesystemTransformation::new(FilesystemOperation::Touch {
            path: "/data/_SUCCESS".to_string(),
        });

        let t: Transformation = fs.into();
        assert_eq!(t.transformation_type(), FILESYSTEM_TYPE);
        assert_eq!(
            t.parameters().get("operation").and_then(|v| v.as_str()),
            Some("touch")
        );
        assert_eq!(
            t.parameters().get("path").and_then(|v| v.as_str()),
            Some("/data/_SUCCESS")
        );
    }

    #[test]
    fn test_copy_parameters_carry_paths() {
        let fs = FilesystemTransformation::new(FilesystemOperation::Copy {
            from: "/staging/orders".to_string(),
            to: "/warehouse/orders".to_string(),
        });

        let t: Transformation = fs.into();
        assert_eq!(
            t.parameters().get("from").and_then(|v| v.as_str()),
            Some("/staging/orders")
        );
        assert_eq!(
            t.parameters().get("to").and_then(|v| v.as_str()),
            Some("/warehouse/orders")
        );
    }

    #[test]
    fn test_serialization_round_trip() {
        let fs = FilesystemTransformation::new(FilesystemOperation::Delete {
            path: "/tmp/stale".to_string(),
            recursive: true,
        });

        let json = serde_json::to_string(&fs).expect("should serialize");
        let parsed: FilesystemTransformation =
            serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(fs, parsed);
    }
}
