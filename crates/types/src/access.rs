//! Database access requirements and the lattice used to validate them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared database-transaction requirement of a step, block or service.
///
/// `None ⊑ ReadOnly ⊑ ReadWrite` form the ordered part of the lattice.
/// `Delegated` marks a component whose descendants manage their own
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
    Delegated,
}

impl AccessLevel {
    /// Whether work at this level writes to the database.
    pub fn updates_database(self) -> bool {
        matches!(self, AccessLevel::ReadWrite)
    }

    /// Level of the connection to open when a component at this level
    /// acquires one for itself. `Delegated` components open a read-only
    /// connection and let their children negotiate writes.
    pub fn connection_level(self) -> Option<AccessLevel> {
        match self {
            AccessLevel::None => None,
            AccessLevel::ReadOnly | AccessLevel::Delegated => Some(AccessLevel::ReadOnly),
            AccessLevel::ReadWrite => Some(AccessLevel::ReadWrite),
        }
    }

    /// Whether a parent declared at this level can host a child requiring
    /// `child`. Children that manage their own transaction (`Delegated`) are
    /// always admitted.
    pub fn admits(self, child: AccessLevel) -> bool {
        match (self, child) {
            (_, AccessLevel::None | AccessLevel::Delegated) => true,
            (AccessLevel::None, _) => false,
            (AccessLevel::ReadOnly | AccessLevel::Delegated, AccessLevel::ReadOnly) => true,
            (AccessLevel::ReadOnly | AccessLevel::Delegated, AccessLevel::ReadWrite) => false,
            (AccessLevel::ReadWrite, _) => true,
        }
    }

    /// Least upper bound over the ordered part of the lattice. `Delegated`
    /// does not raise the requirement of the enclosing component.
    pub fn join(self, other: AccessLevel) -> AccessLevel {
        match (self.rank(), other.rank()) {
            (left, right) if left >= right => self.ordered(),
            _ => other.ordered(),
        }
    }

    fn ordered(self) -> AccessLevel {
        match self {
            AccessLevel::Delegated => AccessLevel::None,
            level => level,
        }
    }

    fn rank(self) -> u8 {
        match self {
            AccessLevel::None | AccessLevel::Delegated => 0,
            AccessLevel::ReadOnly => 1,
            AccessLevel::ReadWrite => 2,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccessLevel::None => "none",
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::ReadWrite => "read_write",
            AccessLevel::Delegated => "delegated",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::AccessLevel::*;

    #[test]
    fn admits_follows_lattice() {
        assert!(None.admits(None));
        assert!(!None.admits(ReadOnly));
        assert!(ReadOnly.admits(ReadOnly));
        assert!(!ReadOnly.admits(ReadWrite));
        assert!(ReadWrite.admits(ReadOnly));
        assert!(ReadWrite.admits(ReadWrite));
        assert!(Delegated.admits(ReadOnly));
        assert!(!Delegated.admits(ReadWrite));
        assert!(None.admits(Delegated));
    }

    #[test]
    fn join_ignores_delegated_children() {
        assert_eq!(None.join(ReadOnly), ReadOnly);
        assert_eq!(ReadWrite.join(ReadOnly), ReadWrite);
        assert_eq!(Delegated.join(None), None);
        assert_eq!(Delegated.join(ReadOnly), ReadOnly);
    }

    #[test]
    fn delegated_opens_read_only_connection() {
        assert_eq!(Delegated.connection_level(), Some(ReadOnly));
        assert_eq!(None.connection_level(), Option::None);
        assert!(ReadWrite.updates_database());
        assert!(!Delegated.updates_database());
    }
}
