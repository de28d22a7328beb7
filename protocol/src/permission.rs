//! Index-level cross-namespace access policy (spec §4.8).

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Private,
    PublicRead,
    PublicReadAdd,
    PublicReadWrite,
}

impl Default for Permission {
    fn default() -> Self {
        Self::Private
    }
}

/// The operation classes the permission table in spec §4.8 is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// query / list / info
    Read,
    /// addDocuments
    Add,
    /// remove / destroy / setInactivityTimeout / manualOffload
    Manage,
}

impl Permission {
    /// Whether a cross-namespace caller (one that does not own the
    /// resource) may perform `op` against a resource with this permission.
    /// Owner access is always admitted regardless of this table; callers
    /// check ownership separately.
    pub fn admits_cross_namespace(self, op: Operation) -> bool {
        match (self, op) {
            (Permission::Private, _) => false,
            (Permission::PublicRead, Operation::Read) => true,
            (Permission::PublicRead, _) => false,
            (Permission::PublicReadAdd, Operation::Read | Operation::Add) => true,
            (Permission::PublicReadAdd, Operation::Manage) => false,
            (Permission::PublicReadWrite, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_never_admits_cross_namespace() {
        for op in [Operation::Read, Operation::Add, Operation::Manage] {
            assert!(!Permission::Private.admits_cross_namespace(op));
        }
    }

    #[test]
    fn public_read_add_admits_read_and_add_only() {
        assert!(Permission::PublicReadAdd.admits_cross_namespace(Operation::Read));
        assert!(Permission::PublicReadAdd.admits_cross_namespace(Operation::Add));
        assert!(!Permission::PublicReadAdd.admits_cross_namespace(Operation::Manage));
    }

    #[test]
    fn public_read_write_admits_everything() {
        for op in [Operation::Read, Operation::Add, Operation::Manage] {
            assert!(Permission::PublicReadWrite.admits_cross_namespace(op));
        }
    }
}
