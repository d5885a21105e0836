//! Principals, roles and requester profiles.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::division::Division;

/// Unique identifier for an authenticated principal (and its profile).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub Uuid);

impl From<Uuid> for PrincipalId {
    fn from(uuid: Uuid) -> Self {
        PrincipalId(uuid)
    }
}

impl std::ops::Deref for PrincipalId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A role held by a principal. Principals may hold several at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Admin,
    /// Staff member of a division (`staff_cd`, `staff_medpro`, ...)
    Staff(Division),
    Requester,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Staff(Division::Cd) => "staff_cd",
            Role::Staff(Division::Medpro) => "staff_medpro",
            Role::Staff(Division::Ms) => "staff_ms",
            Role::Staff(Division::Cc) => "staff_cc",
            Role::Requester => "requester",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "requester" => Ok(Role::Requester),
            other => other
                .strip_prefix("staff_")
                .and_then(|code| code.parse::<Division>().ok())
                .map(Role::Staff)
                .ok_or_else(|| format!("Invalid role: {}", s)),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An authenticated actor: identity plus the role set resolved for this call.
///
/// Roles are resolved once by the calling layer (see
/// [`crate::storage::ProfileStorage::resolve_principal`]) and passed down
/// explicitly; nothing in the core looks them up implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub roles: BTreeSet<Role>,
}

impl Principal {
    pub fn new(id: PrincipalId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id,
            roles: roles.into_iter().collect(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }

    /// Divisions this principal is staff of.
    pub fn staff_divisions(&self) -> impl Iterator<Item = Division> + '_ {
        self.roles.iter().filter_map(|role| match role {
            Role::Staff(division) => Some(*division),
            _ => None,
        })
    }
}

/// Requester-facing identity and contact details, 1:1 with a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: PrincipalId,
    pub full_name: String,
    pub email: Option<String>,
    /// Organisational unit the person belongs to (free text)
    pub division: Option<String>,
    pub contact_whatsapp: Option<String>,
    pub contact_line: Option<String>,
}

impl Profile {
    /// Name used in notifications; falls back to the e-mail address.
    pub fn display_name(&self) -> &str {
        let name = self.full_name.trim();
        if !name.is_empty() {
            name
        } else {
            self.email.as_deref().unwrap_or("there")
        }
    }
}
