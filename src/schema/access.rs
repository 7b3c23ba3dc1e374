//! Access levels, ACL entries and the caller's access context
//!
//! The compiler only reads these. Resolution of a caller's grant against a
//! document happens elsewhere; here we need just enough to decide whether a
//! property may take part in a filter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::property::Property;

/// Ordered access levels. Comparisons follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Public,
    Connected,
    Read,
    Share,
    Update,
    Delete,
    System,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Public => "public",
            AccessLevel::Connected => "connected",
            AccessLevel::Read => "read",
            AccessLevel::Share => "share",
            AccessLevel::Update => "update",
            AccessLevel::Delete => "delete",
            AccessLevel::System => "system",
        }
    }
}

impl Default for AccessLevel {
    fn default() -> Self {
        AccessLevel::Read
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an ACL entry applies to.
///
/// Relative targets (`owner`, `creator`, `self`) depend on the document being
/// read and cannot be resolved while compiling a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AclTarget {
    Account { id: Uuid },
    Role { id: String },
    Owner,
    Creator,
    #[serde(rename = "self")]
    SelfRef,
}

/// A single `{target, allow}` grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub target: AclTarget,
    pub allow: AccessLevel,
}

impl AclEntry {
    pub fn account(id: Uuid, allow: AccessLevel) -> Self {
        Self {
            target: AclTarget::Account { id },
            allow,
        }
    }

    pub fn role(id: impl Into<String>, allow: AccessLevel) -> Self {
        Self {
            target: AclTarget::Role { id: id.into() },
            allow,
        }
    }

    pub fn owner(allow: AccessLevel) -> Self {
        Self {
            target: AclTarget::Owner,
            allow,
        }
    }

    /// True when the entry names a concrete account or role
    pub fn is_targeted(&self) -> bool {
        matches!(
            self.target,
            AclTarget::Account { .. } | AclTarget::Role { .. }
        )
    }

    fn applies_to(&self, principal: &Principal) -> bool {
        match &self.target {
            AclTarget::Account { id } => principal.id == Some(*id),
            AclTarget::Role { id } => principal.roles.iter().any(|r| r == id),
            AclTarget::Owner | AclTarget::Creator | AclTarget::SelfRef => false,
        }
    }
}

/// The calling principal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Account id (None when anonymous)
    #[serde(default)]
    pub id: Option<Uuid>,

    /// Role ids held by the principal
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn account(id: Uuid) -> Self {
        Self {
            id: Some(id),
            roles: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }
}

/// A principal plus the grant level resolved for the queried object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessContext {
    pub principal: Principal,

    /// Access already resolved for the caller on the target object
    #[serde(default)]
    pub grant: AccessLevel,

    #[serde(default)]
    pub locale: Option<String>,

    /// Set when the query originates from a sandboxed script
    #[serde(default)]
    pub script: bool,
}

impl AccessContext {
    pub fn new(principal: Principal, grant: AccessLevel) -> Self {
        Self {
            principal,
            grant,
            locale: None,
            script: false,
        }
    }

    pub fn resolved_access_level(&self) -> AccessLevel {
        self.grant
    }

    /// Resolves the property's explicit ACL for this caller and compares the
    /// result against the property's read requirement.
    pub fn has_read_access(&self, property: &Property) -> bool {
        let level = property
            .acl
            .iter()
            .filter(|entry| entry.applies_to(&self.principal))
            .map(|entry| entry.allow)
            .fold(self.grant, std::cmp::max);
        level >= property.read_access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyType;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::None < AccessLevel::Public);
        assert!(AccessLevel::Read < AccessLevel::Update);
        assert!(AccessLevel::Delete < AccessLevel::System);
    }

    #[test]
    fn test_relative_entries_are_not_targeted() {
        assert!(!AclEntry::owner(AccessLevel::Read).is_targeted());
        assert!(AclEntry::role("admin", AccessLevel::Read).is_targeted());
    }

    #[test]
    fn test_role_entry_raises_access() {
        let prop = Property::new("c_secret", PropertyType::String)
            .with_read_access(AccessLevel::Update)
            .with_acl(vec![AclEntry::role("auditor", AccessLevel::Update)]);

        let plain = AccessContext::new(Principal::account(Uuid::new_v4()), AccessLevel::Read);
        assert!(!plain.has_read_access(&prop));

        let auditor = AccessContext::new(
            Principal::account(Uuid::new_v4()).with_role("auditor"),
            AccessLevel::Read,
        );
        assert!(auditor.has_read_access(&prop));
    }

    #[test]
    fn test_acl_target_serde() {
        let entry: AclEntry =
            serde_json::from_str(r#"{"target":{"type":"role","id":"admin"},"allow":"read"}"#)
                .unwrap();
        assert_eq!(entry, AclEntry::role("admin", AccessLevel::Read));
    }
}
