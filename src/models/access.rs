use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::role::Scope;

/// The entity an access grant is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "entity", rename_all = "lowercase")]
pub enum ScopeRef {
    General,
    Model(Uuid),
    Instance(Uuid),
}

impl ScopeRef {
    pub fn scope(&self) -> Scope {
        match self {
            ScopeRef::General => Scope::General,
            ScopeRef::Model(_) => Scope::Model,
            ScopeRef::Instance(_) => Scope::Instance,
        }
    }

    pub fn entity_id(&self) -> Option<Uuid> {
        match self {
            ScopeRef::General => None,
            ScopeRef::Model(id) | ScopeRef::Instance(id) => Some(*id),
        }
    }

    /// Rebuild from the persisted (scope, entity) column pair.
    pub fn from_parts(scope: Scope, entity_id: Option<Uuid>) -> Option<ScopeRef> {
        match (scope, entity_id) {
            (Scope::General, None) => Some(ScopeRef::General),
            (Scope::Model, Some(id)) => Some(ScopeRef::Model(id)),
            (Scope::Instance, Some(id)) => Some(ScopeRef::Instance(id)),
            _ => None,
        }
    }
}

/// A (user, role, scope entity) tuple. Several grants may exist for one user
/// on one entity; their roles are unioned during evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub scope: ScopeRef,
}

impl AccessGrant {
    pub fn new(user_id: Uuid, role_id: Uuid, scope: ScopeRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            role_id,
            scope,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessView {
    pub access_uuid: Uuid,
    pub user_uuid: Uuid,
    pub role_uuid: Uuid,
}

impl From<&AccessGrant> for AccessView {
    fn from(grant: &AccessGrant) -> Self {
        Self {
            access_uuid: grant.id,
            user_uuid: grant.user_id,
            role_uuid: grant.role_id,
        }
    }
}
