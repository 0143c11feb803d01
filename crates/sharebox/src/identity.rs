//! Caller identity as handed over by the authentication layer.
//!
//! The core trusts these values; it records them on ledger rows and uses
//! them to scope listings, but never authorizes anything itself.

use serde::{Deserialize, Serialize};

/// Who submitted (or is asking about) an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub identity: String,
    pub user_id: Option<u64>,
}

impl Submitter {
    pub fn new(identity: impl Into<String>, user_id: Option<u64>) -> Self {
        Self {
            identity: identity.into(),
            user_id,
        }
    }

    /// Matches a ledger row's submitter columns.
    ///
    /// The user id decides when both sides carry one; otherwise the
    /// identity strings are compared.
    pub fn owns(&self, identity: &str, user_id: Option<u64>) -> bool {
        match (self.user_id, user_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => self.identity == identity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Browse,
    Search,
    Submit,
    ViewOwnUploads,
    ReviewUploads,
    RelocateUploads,
    RebuildIndex,
    /// Download files and folder archives from the destination tree.
    Download,
    /// Create folders and move items to the trash.
    ManageTree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Member => &[
                Permission::Browse,
                Permission::Search,
                Permission::Submit,
                Permission::ViewOwnUploads,
                Permission::Download,
            ],
            Role::Admin => &[
                Permission::Browse,
                Permission::Search,
                Permission::Submit,
                Permission::ViewOwnUploads,
                Permission::ReviewUploads,
                Permission::RelocateUploads,
                Permission::RebuildIndex,
                Permission::Download,
                Permission::ManageTree,
            ],
        }
    }

    pub fn allows(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// An authenticated caller: identity plus role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub submitter: Submitter,
    pub role: Role,
}

impl Caller {
    pub fn new(submitter: Submitter, role: Role) -> Self {
        Self { submitter, role }
    }

    pub fn is_privileged(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.role.allows(permission)
    }
}
