//! Data versions used by the optimistic and MVCC locking schemes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A comparable token attached to every node.
///
/// The default kind is a per-node counter incremented on each committed
/// write. Custom versions are supplied explicitly by callers and are only
/// comparable with custom versions of the same `kind`; comparing across
/// kinds is a [`Error::VersionTypeMismatch`], not a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataVersion {
    /// Monotonically incrementing counter.
    Default(u64),

    /// Caller-supplied version of a named kind (e.g. a timestamp scheme).
    Custom { kind: String, value: u64 },
}

impl DataVersion {
    /// Version carried by a freshly created node.
    pub const fn initial() -> Self {
        DataVersion::Default(0)
    }

    /// Create a custom version of the given kind.
    pub fn custom(kind: impl Into<String>, value: u64) -> Self {
        DataVersion::Custom {
            kind: kind.into(),
            value,
        }
    }

    /// Name of this version's kind.
    pub fn kind(&self) -> &str {
        match self {
            DataVersion::Default(_) => "default",
            DataVersion::Custom { kind, .. } => kind,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, DataVersion::Default(_))
    }

    /// The next default version.
    ///
    /// Custom versions never advance on their own: a write to a node that
    /// carries a custom version must supply the next version explicitly.
    pub fn increment(&self) -> Result<DataVersion> {
        match self {
            DataVersion::Default(n) => n.checked_add(1).map(DataVersion::Default).ok_or_else(|| {
                Error::InvalidOperation(format!("data version {} is exhausted", self))
            }),
            DataVersion::Custom { .. } => Err(Error::VersionTypeMismatch {
                left: self.to_string(),
                right: "default".to_string(),
            }),
        }
    }

    /// True if `self` is strictly newer than `other`.
    pub fn newer_than(&self, other: &DataVersion) -> Result<bool> {
        match (self, other) {
            (DataVersion::Default(a), DataVersion::Default(b)) => Ok(a > b),
            (
                DataVersion::Custom { kind: ka, value: a },
                DataVersion::Custom { kind: kb, value: b },
            ) if ka == kb => Ok(a > b),
            _ => Err(Error::VersionTypeMismatch {
                left: self.to_string(),
                right: other.to_string(),
            }),
        }
    }
}

impl Default for DataVersion {
    fn default() -> Self {
        Self::initial()
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataVersion::Default(n) => write!(f, "v{}", n),
            DataVersion::Custom { kind, value } => write!(f, "{}:{}", kind, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_versions_compare_numerically() {
        let v3 = DataVersion::Default(3);
        let v5 = DataVersion::Default(5);
        assert!(v5.newer_than(&v3).unwrap());
        assert!(!v3.newer_than(&v5).unwrap());
        assert!(!v5.newer_than(&v5).unwrap());
        assert_eq!(v5.increment().unwrap(), DataVersion::Default(6));
    }

    #[test]
    fn test_exhausted_default_version_does_not_wrap() {
        let last = DataVersion::Default(u64::MAX);
        assert!(matches!(last.increment(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_custom_versions_of_same_kind() {
        let a = DataVersion::custom("ts", 10);
        let b = DataVersion::custom("ts", 20);
        assert!(b.newer_than(&a).unwrap());
    }

    #[test]
    fn test_mismatched_kinds_are_an_error() {
        let custom = DataVersion::custom("ts", 10);
        let other = DataVersion::custom("epoch", 1);
        let default = DataVersion::Default(1);

        assert!(matches!(
            custom.newer_than(&default),
            Err(Error::VersionTypeMismatch { .. })
        ));
        assert!(matches!(
            custom.newer_than(&other),
            Err(Error::VersionTypeMismatch { .. })
        ));
        assert!(matches!(
            custom.increment(),
            Err(Error::VersionTypeMismatch { .. })
        ));
    }
}
