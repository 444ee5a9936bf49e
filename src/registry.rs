//! RoleRegistry: CRUD over the roles of each scope.
//!
//! Reads are open to any authenticated caller. Writes need the general
//! `edit_roles` capability, and essential roles can neither be edited nor
//! deleted.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::AppError;
use crate::middleware::rbac::require_in;
use crate::models::access::ScopeRef;
use crate::models::role::{Capability, CapabilitySet, GeneralCapability, Role, Scope};
use crate::models::Page;
use crate::store::{Store, Tx};

/// Partial update of a role. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RoleChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub capabilities: Option<CapabilitySet>,
}

pub struct RoleRegistry {
    store: Arc<dyn Store>,
}

const EDIT_ROLES: [Capability; 1] = [Capability::General(GeneralCapability::EditRoles)];

impl RoleRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn check(role: &Role, cap: Capability) -> bool {
        role.check(cap)
    }

    pub async fn list(&self, scope: Scope, page: Page) -> Result<Vec<Role>, AppError> {
        let page = page.validate()?;
        let mut tx = self.store.begin().await?;
        Ok(tx.list_roles(scope, page).await?)
    }

    pub async fn get(&self, scope: Scope, id: Uuid) -> Result<Role, AppError> {
        let mut tx = self.store.begin().await?;
        get_in(tx.as_mut(), scope, id).await
    }

    pub async fn create(
        &self,
        actor: Uuid,
        scope: Scope,
        name: &str,
        description: &str,
        capabilities: CapabilitySet,
    ) -> Result<Role, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("role name must not be empty".into()));
        }

        let mut tx = self.store.begin().await?;
        require_in(tx.as_mut(), actor, ScopeRef::General, &EDIT_ROLES).await?;

        let role = Role::new(scope, name, description, capabilities);
        tx.insert_role(&role).await.map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("{} role '{}' already exists", scope, name))
            }
            other => other,
        })?;
        tx.commit().await?;

        tracing::info!(role_id = %role.id, scope = %scope, name = %name, "role created");
        Ok(role)
    }

    pub async fn update(
        &self,
        actor: Uuid,
        scope: Scope,
        id: Uuid,
        changes: RoleChanges,
    ) -> Result<Role, AppError> {
        let mut tx = self.store.begin().await?;
        require_in(tx.as_mut(), actor, ScopeRef::General, &EDIT_ROLES).await?;

        let mut role = get_in(tx.as_mut(), scope, id).await?;
        if role.essential {
            return Err(AppError::Forbidden("essential role".into()));
        }

        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(AppError::BadRequest("role name must not be empty".into()));
            }
            role.name = name;
        }
        if let Some(description) = changes.description {
            role.description = description;
        }
        if let Some(capabilities) = changes.capabilities {
            role.capabilities = capabilities;
        }

        tx.update_role(&role).await?;
        tx.commit().await?;

        tracing::info!(role_id = %role.id, scope = %scope, "role updated");
        Ok(role)
    }

    /// Deleting a role also removes every grant that references it.
    pub async fn delete(&self, actor: Uuid, scope: Scope, id: Uuid) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;
        require_in(tx.as_mut(), actor, ScopeRef::General, &EDIT_ROLES).await?;

        let role = get_in(tx.as_mut(), scope, id).await?;
        if role.essential {
            return Err(AppError::Forbidden("essential role".into()));
        }

        tx.delete_role(role.id).await?;
        tx.commit().await?;

        tracing::info!(role_id = %role.id, scope = %scope, "role deleted");
        Ok(())
    }
}

/// Fetch a role and make sure it belongs to `scope`.
pub async fn get_in(tx: &mut dyn Tx, scope: Scope, id: Uuid) -> Result<Role, AppError> {
    tx.get_role(id)
        .await?
        .filter(|r| r.scope == scope)
        .ok_or_else(|| AppError::NotFound(format!("{} role {}", scope, id)))
}
