use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Staff,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff => "staff",
            Role::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoleParseError {
    #[error("unknown role: {0:?}")]
    UnknownRole(String),
    #[error("malformed role list: {0}")]
    Malformed(String),
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" | "administrator" => Ok(Role::Admin),
            "staff" | "manager" => Ok(Role::Staff),
            "member" | "user" => Ok(Role::Member),
            other => Err(RoleParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Typed role set. The only place raw role strings are interpreted is
/// [`RoleSet::parse`] / [`RoleSet::from_json`]; everything past the edge
/// works with this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
        Self(roles.into_iter().collect())
    }

    /// Accepts a JSON array (`["admin","staff"]`), a JSON string
    /// (`"admin,staff"`), a CSV list (`admin, staff`) or a single name.
    pub fn parse(raw: &str) -> Result<Self, RoleParseError> {
        let trimmed = raw.trim();
        if trimmed.starts_with('[') {
            let names: Vec<String> = serde_json::from_str(trimmed)
                .map_err(|e| RoleParseError::Malformed(e.to_string()))?;
            return Self::from_names(names.iter().map(String::as_str));
        }
        if trimmed.starts_with('"') {
            let inner: String = serde_json::from_str(trimmed)
                .map_err(|e| RoleParseError::Malformed(e.to_string()))?;
            return Self::parse(&inner);
        }
        Self::from_names(trimmed.split(','))
    }

    /// Same as [`RoleSet::parse`] for an already-decoded JSON value.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, RoleParseError> {
        match value {
            serde_json::Value::Null => Ok(Self::default()),
            serde_json::Value::String(s) => Self::parse(s),
            serde_json::Value::Array(items) => {
                let mut set: BTreeSet<Role> = BTreeSet::new();
                for item in items {
                    let name = item
                        .as_str()
                        .ok_or_else(|| RoleParseError::Malformed(format!("non-string role: {item}")))?;
                    set.insert(name.parse::<Role>()?);
                }
                Ok(Self(set))
            }
            other => Err(RoleParseError::Malformed(format!("unexpected role value: {other}"))),
        }
    }

    fn from_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<Self, RoleParseError> {
        let mut set: BTreeSet<Role> = BTreeSet::new();
        for name in names.map(str::trim).filter(|n| !n.is_empty()) {
            set.insert(name.parse::<Role>()?);
        }
        Ok(Self(set))
    }

    pub fn contains(&self, role: Role) -> bool {
        self.0.contains(&role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        self.0.iter().copied()
    }
}

/// Who is calling into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub roles: RoleSet,
}

impl Actor {
    pub fn new(user_id: UserId, roles: RoleSet) -> Self {
        Self { user_id, roles }
    }

    pub fn member(user_id: UserId) -> Self {
        Self::new(user_id, RoleSet::new([Role::Member]))
    }

    pub fn staff(user_id: UserId) -> Self {
        Self::new(user_id, RoleSet::new([Role::Staff]))
    }

    pub fn admin(user_id: UserId) -> Self {
        Self::new(user_id, RoleSet::new([Role::Admin]))
    }

    /// Admins and staff approve, propose and cancel on behalf of others.
    pub fn can_moderate(&self) -> bool {
        self.roles.contains(Role::Admin) || self.roles.contains(Role::Staff)
    }

    /// Bookings by moderators skip the pending state.
    pub fn bypasses_approval(&self) -> bool {
        self.can_moderate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_array() {
        let set = RoleSet::parse(r#"["admin", "Staff"]"#).unwrap();
        assert!(set.contains(Role::Admin));
        assert!(set.contains(Role::Staff));
        assert!(!set.contains(Role::Member));
    }

    #[test]
    fn parse_csv_and_single() {
        let set = RoleSet::parse(" member , staff ").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Role::Staff, Role::Member]);
        assert_eq!(RoleSet::parse("admin").unwrap(), RoleSet::new([Role::Admin]));
    }

    #[test]
    fn parse_json_encoded_csv_string() {
        let set = RoleSet::parse(r#""admin,member""#).unwrap();
        assert_eq!(set, RoleSet::new([Role::Admin, Role::Member]));
    }

    #[test]
    fn parse_empty_is_no_roles() {
        assert!(RoleSet::parse("").unwrap().is_empty());
        assert!(RoleSet::parse("[]").unwrap().is_empty());
        assert!(RoleSet::parse(" , ").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_unknown_and_malformed() {
        assert_eq!(
            RoleSet::parse("admin,janitor"),
            Err(RoleParseError::UnknownRole("janitor".into()))
        );
        assert!(matches!(RoleSet::parse("[admin"), Err(RoleParseError::Malformed(_))));
    }

    #[test]
    fn from_json_value() {
        let value = serde_json::json!(["staff", "member"]);
        assert_eq!(
            RoleSet::from_json(&value).unwrap(),
            RoleSet::new([Role::Staff, Role::Member])
        );
        assert!(RoleSet::from_json(&serde_json::Value::Null).unwrap().is_empty());
        assert!(RoleSet::from_json(&serde_json::json!([1])).is_err());
        assert!(RoleSet::from_json(&serde_json::json!(7)).is_err());
    }

    #[test]
    fn moderation_rights() {
        assert!(Actor::admin(1).can_moderate());
        assert!(Actor::staff(1).bypasses_approval());
        assert!(!Actor::member(1).can_moderate());
        assert!(!Actor::new(1, RoleSet::default()).can_moderate());
    }
}
