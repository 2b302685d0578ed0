use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipesyncError, Result};

/// A `namespace:name` reference to another record.
///
/// Runs point at their parent pipeline as `<pipeline-namespace>:<pipeline>`
/// and at their owning project as `<cluster>:<project>`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace:name` reference. Both halves must be non-empty.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains(':') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(PipesyncError::InvalidReference(format!(
                "expected <namespace>:<name>, got '{}'",
                s
            ))),
        }
    }
}

impl FromStr for ObjectRef {
    type Err = PipesyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}
