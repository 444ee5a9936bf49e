//! User management.
//!
//! Listing and reading users is open to every authenticated caller. Writes
//! on another user need the general `edit_users` capability; a user may
//! always update or delete themselves.

use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::middleware::auth::{hash_password, random_hex};
use crate::middleware::rbac::{require_in, require_user_access_in};
use crate::models::access::ScopeRef;
use crate::models::role::{Capability, GeneralCapability};
use crate::models::user::User;
use crate::models::Page;
use crate::store::Store;

const EDIT_USERS: [Capability; 1] = [Capability::General(GeneralCapability::EditUsers)];

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dusky", "eager", "fuzzy", "gentle", "hazy", "jolly", "lucky",
    "mellow", "nimble", "quiet", "rapid", "sunny", "tidy", "vivid", "witty",
];
const NOUNS: &[&str] = &[
    "badger", "carp", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "koi", "lynx",
    "marten", "newt", "otter", "puffin", "raven", "stoat", "tapir", "wombat",
];

/// A freshly created user. `password` is only present when it was generated.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub user_uuid: Uuid,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Partial update of a user. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub name: Option<String>,
    pub password: Option<String>,
}

pub struct UserService {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet"),
        NOUNS.choose(&mut rng).copied().unwrap_or("koi")
    )
}

impl UserService {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a user. A missing name is generated, a missing password is
    /// drawn at random, and a taken name gets random suffixes until free.
    pub async fn create(
        &self,
        actor: Uuid,
        name: Option<String>,
        password: Option<String>,
    ) -> Result<CreatedUser, AppError> {
        let mut tx = self.store.begin().await?;
        require_in(tx.as_mut(), actor, ScopeRef::General, &EDIT_USERS).await?;

        let mut user_name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(generate_name);
        while tx.get_user_by_name(&user_name).await?.is_some() {
            user_name.push_str(&random_hex(2));
        }

        let generated = password.is_none();
        let password = password.unwrap_or_else(|| random_hex(16));

        let user = User::new(&user_name, hash_password(&password), self.clock.now());
        tx.insert_user(&user).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, actor = %actor, "user created");
        Ok(CreatedUser {
            user_uuid: user.id,
            user_name: user.name,
            password: generated.then_some(password),
        })
    }

    pub async fn list(&self, page: Page) -> Result<Vec<User>, AppError> {
        let page = page.validate()?;
        let mut tx = self.store.begin().await?;
        Ok(tx.list_users(page).await?)
    }

    pub async fn get(&self, user_id: Uuid) -> Result<User, AppError> {
        let mut tx = self.store.begin().await?;
        tx.get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))
    }

    pub async fn update(
        &self,
        actor: &User,
        user_id: Uuid,
        changes: UserChanges,
    ) -> Result<User, AppError> {
        let mut tx = self.store.begin().await?;
        require_user_access_in(tx.as_mut(), actor, user_id, &EDIT_USERS).await?;

        let mut user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        if let Some(name) = changes.name {
            if name.trim().is_empty() {
                return Err(AppError::BadRequest("user name must not be empty".into()));
            }
            if name != user.name && tx.get_user_by_name(&name).await?.is_some() {
                return Err(AppError::Conflict("user name is taken".into()));
            }
            user.name = name;
        }
        if let Some(password) = changes.password {
            user.password_hash = hash_password(&password);
        }

        tx.update_user(&user).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, actor = %actor.id, "user updated");
        Ok(user)
    }

    /// Delete a user after invalidating their tokens. Grants go with the user.
    pub async fn delete(&self, actor: &User, user_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.store.begin().await?;
        require_user_access_in(tx.as_mut(), actor, user_id, &EDIT_USERS).await?;

        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;
        if user.essential {
            return Err(AppError::Forbidden("user is essential".into()));
        }

        tx.invalidate_user_tokens(user.id).await?;
        tx.delete_user(user.id).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user.id, actor = %actor.id, "user deleted");
        Ok(())
    }
}
