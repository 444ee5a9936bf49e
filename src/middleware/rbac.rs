//! Permission evaluation.
//!
//! A user's effective capabilities on a scope entity are the union of the
//! capability sets of every role granted to them on exactly that entity
//! (OR over held roles). A request is allowed iff every required capability
//! is in that union (AND over required capabilities).
//!
//! The `*_in` functions run inside a caller-owned transaction so mutating
//! operations can authorize and write atomically.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::AppError;
use crate::models::access::ScopeRef;
use crate::models::role::{Capability, CapabilitySet};
use crate::models::user::User;
use crate::store::{Store, Tx};

/// Union of the capabilities `user_id` holds on `scope`.
pub async fn held_in(
    tx: &mut dyn Tx,
    user_id: Uuid,
    scope: ScopeRef,
) -> Result<CapabilitySet, AppError> {
    let grants = tx.grants_for_user(user_id, scope).await?;
    if grants.is_empty() {
        return Ok(CapabilitySet::empty());
    }

    let role_ids: Vec<Uuid> = grants.iter().map(|g| g.role_id).collect();
    let roles = tx.get_roles(&role_ids).await?;

    Ok(roles
        .iter()
        .filter(|r| r.scope == scope.scope())
        .fold(CapabilitySet::empty(), |acc, r| acc.union(&r.capabilities)))
}

pub async fn evaluate_in(
    tx: &mut dyn Tx,
    user_id: Uuid,
    scope: ScopeRef,
    required: &[Capability],
) -> Result<bool, AppError> {
    if required.is_empty() {
        return Ok(true);
    }
    // a capability of another scope can never be held on this one
    if required.iter().any(|c| c.scope() != scope.scope()) {
        return Ok(false);
    }

    let held = held_in(tx, user_id, scope).await?;
    let required: CapabilitySet = required.iter().copied().collect();
    Ok(held.is_superset(&required))
}

/// Like [`evaluate_in`], but denial is an error.
pub async fn require_in(
    tx: &mut dyn Tx,
    user_id: Uuid,
    scope: ScopeRef,
    required: &[Capability],
) -> Result<(), AppError> {
    if evaluate_in(tx, user_id, scope, required).await? {
        return Ok(());
    }

    let names: Vec<&str> = required.iter().map(|c| c.as_str()).collect();
    tracing::warn!(
        user_id = %user_id,
        scope = %scope.scope(),
        entity = ?scope.entity_id(),
        required = ?names,
        "RBAC access denied"
    );
    Err(AppError::Forbidden(format!(
        "missing {} capability: {}",
        scope.scope(),
        names.join(", ")
    )))
}

/// Access check for operations on a user resource. Acting on yourself is
/// always allowed; anything else needs the general capabilities.
pub async fn require_user_access_in(
    tx: &mut dyn Tx,
    actor: &User,
    target_user: Uuid,
    required: &[Capability],
) -> Result<(), AppError> {
    if actor.id == target_user {
        return Ok(());
    }
    require_in(tx, actor.id, ScopeRef::General, required).await
}

pub struct PermissionEvaluator {
    store: Arc<dyn Store>,
}

impl PermissionEvaluator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn evaluate(
        &self,
        user_id: Uuid,
        scope: ScopeRef,
        required: &[Capability],
    ) -> Result<bool, AppError> {
        let mut tx = self.store.begin().await?;
        evaluate_in(tx.as_mut(), user_id, scope, required).await
    }

    pub async fn require(
        &self,
        user_id: Uuid,
        scope: ScopeRef,
        required: &[Capability],
    ) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;
        require_in(tx.as_mut(), user_id, scope, required).await
    }

    pub async fn held(&self, user_id: Uuid, scope: ScopeRef) -> Result<CapabilitySet, AppError> {
        let mut tx = self.store.begin().await?;
        held_in(tx.as_mut(), user_id, scope).await
    }

    pub async fn require_user_access(
        &self,
        actor: &User,
        target_user: Uuid,
        required: &[Capability],
    ) -> Result<(), AppError> {
        if actor.id == target_user {
            return Ok(());
        }
        self.require(actor.id, ScopeRef::General, required).await
    }
}

// ── Tests ───────────────────────────────────────────────────────
