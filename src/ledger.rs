//! AccessLedger: the (user, role, scope entity) grants that back evaluation.
//!
//! Granting and revoking on an entity needs the grant capability of that
//! entity's scope (plus visibility for model and instance entities). The
//! authorization check and the write share one transaction.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::AppError;
use crate::middleware::rbac::require_in;
use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::role::{Capability, GeneralCapability, InstanceCapability, ModelCapability};
use crate::models::Page;
use crate::registry;
use crate::store::{Store, Tx};

/// Capabilities needed to grant or revoke on `scope`.
pub fn grant_capabilities(scope: ScopeRef) -> Vec<Capability> {
    match scope {
        ScopeRef::General => vec![GeneralCapability::GrantAccess.into()],
        ScopeRef::Model(_) => vec![
            ModelCapability::CanSee.into(),
            ModelCapability::GrantAccess.into(),
        ],
        ScopeRef::Instance(_) => vec![
            InstanceCapability::CanSee.into(),
            InstanceCapability::GrantAccess.into(),
        ],
    }
}

/// Capabilities needed to list the grants on `scope`.
fn list_capabilities(scope: ScopeRef) -> Vec<Capability> {
    match scope {
        ScopeRef::General => vec![],
        ScopeRef::Model(_) => vec![ModelCapability::CanSee.into()],
        ScopeRef::Instance(_) => vec![InstanceCapability::CanSee.into()],
    }
}

pub struct AccessLedger {
    store: Arc<dyn Store>,
}

impl AccessLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Grant `role_id` on `scope` to `target_user`, on behalf of `actor`.
    pub async fn grant(
        &self,
        actor: Uuid,
        role_id: Uuid,
        scope: ScopeRef,
        target_user: Uuid,
    ) -> Result<AccessGrant, AppError> {
        let mut tx = self.store.begin().await?;

        ensure_entity_in(tx.as_mut(), scope).await?;
        require_in(tx.as_mut(), actor, scope, &grant_capabilities(scope)).await?;
        let grant = grant_in(tx.as_mut(), role_id, scope, target_user).await?;

        tx.commit().await?;

        tracing::info!(
            grant_id = %grant.id,
            actor = %actor,
            user_id = %target_user,
            role_id = %role_id,
            scope = %scope.scope(),
            entity = ?scope.entity_id(),
            "access granted"
        );
        Ok(grant)
    }

    pub async fn revoke(&self, actor: Uuid, grant_id: Uuid) -> Result<(), AppError> {
        self.revoke_matching(actor, grant_id, None).await
    }

    /// Revoke a grant addressed through its entity; a grant on any other
    /// entity is reported as missing.
    pub async fn revoke_on(
        &self,
        actor: Uuid,
        scope: ScopeRef,
        grant_id: Uuid,
    ) -> Result<(), AppError> {
        self.revoke_matching(actor, grant_id, Some(scope)).await
    }

    async fn revoke_matching(
        &self,
        actor: Uuid,
        grant_id: Uuid,
        expected: Option<ScopeRef>,
    ) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;

        let grant = tx
            .get_grant(grant_id)
            .await?
            .filter(|g| expected.map_or(true, |scope| g.scope == scope))
            .ok_or_else(|| AppError::NotFound(format!("access grant {}", grant_id)))?;

        require_in(tx.as_mut(), actor, grant.scope, &grant_capabilities(grant.scope)).await?;
        tx.delete_grant(grant.id).await?;
        tx.commit().await?;

        tracing::info!(
            grant_id = %grant.id,
            actor = %actor,
            user_id = %grant.user_id,
            scope = %grant.scope.scope(),
            "access revoked"
        );
        Ok(())
    }

    pub async fn list(
        &self,
        actor: Uuid,
        scope: ScopeRef,
        page: Page,
    ) -> Result<Vec<AccessGrant>, AppError> {
        let page = page.validate()?;
        let mut tx = self.store.begin().await?;

        ensure_entity_in(tx.as_mut(), scope).await?;
        require_in(tx.as_mut(), actor, scope, &list_capabilities(scope)).await?;
        Ok(tx.list_grants(scope, page).await?)
    }

    /// Read one grant. Needs the same capabilities as listing its entity.
    pub async fn get(&self, actor: Uuid, grant_id: Uuid) -> Result<AccessGrant, AppError> {
        let mut tx = self.store.begin().await?;
        let grant = tx
            .get_grant(grant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("access grant {}", grant_id)))?;
        require_in(tx.as_mut(), actor, grant.scope, &list_capabilities(grant.scope)).await?;
        Ok(grant)
    }
}

/// Record a grant without any authorization check.
///
/// The role must belong to the scope of `scope`, the user must exist and the
/// identical grant must not exist yet.
pub async fn grant_in(
    tx: &mut dyn Tx,
    role_id: Uuid,
    scope: ScopeRef,
    user_id: Uuid,
) -> Result<AccessGrant, AppError> {
    let role = registry::get_in(tx, scope.scope(), role_id).await?;

    if tx.get_user(user_id).await?.is_none() {
        return Err(AppError::NotFound(format!("user {}", user_id)));
    }

    if tx.find_grant(user_id, role.id, scope).await?.is_some() {
        return Err(AppError::Conflict("access already granted".into()));
    }

    let grant = AccessGrant::new(user_id, role.id, scope);
    tx.insert_grant(&grant).await.map_err(|e| match AppError::from(e) {
        AppError::Conflict(_) => AppError::Conflict("access already granted".into()),
        other => other,
    })?;
    Ok(grant)
}

/// NotFound unless the model or instance behind `scope` exists.
pub async fn ensure_entity_in(tx: &mut dyn Tx, scope: ScopeRef) -> Result<(), AppError> {
    let exists = match scope {
        ScopeRef::General => true,
        ScopeRef::Model(id) => tx.get_model(id).await?.is_some(),
        ScopeRef::Instance(id) => tx.get_instance(id).await?.is_some(),
    };
    if exists {
        Ok(())
    } else {
        Err(AppError::NotFound(format!(
            "{} {}",
            scope.scope(),
            scope.entity_id().unwrap_or_default()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::role::{CapabilitySet, Role, Scope};
    use crate::models::user::User;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;

    struct Fixture {
        ledger: AccessLedger,
        admin: Uuid,
        bob: Uuid,
        guest: Uuid,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let admin = User::new("admin", vec![], Utc::now());
        let bob = User::new("bob", vec![], Utc::now());
        let admin_role = Role::new(Scope::General, "admin", "", CapabilitySet::full(Scope::General));
        let guest = Role::new(Scope::General, "guest", "", CapabilitySet::empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_user(&admin).await.unwrap();
        tx.insert_user(&bob).await.unwrap();
        tx.insert_role(&admin_role).await.unwrap();
        tx.insert_role(&guest).await.unwrap();
        tx.insert_grant(&AccessGrant::new(admin.id, admin_role.id, ScopeRef::General))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        Fixture {
            ledger: AccessLedger::new(store),
            admin: admin.id,
            bob: bob.id,
            guest: guest.id,
        }
    }

    #[tokio::test]
    async fn test_duplicate_grant_conflicts() {
        let f = setup().await;
        f.ledger
            .grant(f.admin, f.guest, ScopeRef::General, f.bob)
            .await
            .unwrap();
        let err = f
            .ledger
            .grant(f.admin, f.guest, ScopeRef::General, f.bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        let grants = f
            .ledger
            .list(f.admin, ScopeRef::General, Page::default())
            .await
            .unwrap();
        assert_eq!(grants.iter().filter(|g| g.user_id == f.bob).count(), 1);
    }

    #[tokio::test]
    async fn test_grant_unknown_user_or_role() {
        let f = setup().await;
        let err = f
            .ledger
            .grant(f.admin, f.guest, ScopeRef::General, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f
            .ledger
            .grant(f.admin, Uuid::new_v4(), ScopeRef::General, f.bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_grant_requires_grant_access() {
        let f = setup().await;
        let err = f
            .ledger
            .grant(f.bob, f.guest, ScopeRef::General, f.bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_grant_on_missing_entity() {
        let f = setup().await;
        let err = f
            .ledger
            .grant(f.admin, f.guest, ScopeRef::Model(Uuid::new_v4()), f.bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_revoke_then_revoke_again() {
        let f = setup().await;
        let grant = f
            .ledger
            .grant(f.admin, f.guest, ScopeRef::General, f.bob)
            .await
            .unwrap();

        f.ledger.revoke(f.admin, grant.id).await.unwrap();
        let err = f.ledger.revoke(f.admin, grant.id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_revoke_on_wrong_entity_is_not_found() {
        let f = setup().await;
        let grant = f
            .ledger
            .grant(f.admin, f.guest, ScopeRef::General, f.bob)
            .await
            .unwrap();
        let err = f
            .ledger
            .revoke_on(f.admin, ScopeRef::Model(Uuid::new_v4()), grant.id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
