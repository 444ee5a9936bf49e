use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A principal. `password_hash` never leaves the core.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub password_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Bootstrap users are essential and can never be deleted.
    pub essential: bool,
}

impl User {
    pub fn new(name: &str, password_hash: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            password_hash,
            created_at,
            essential: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserView {
    pub user_uuid: Uuid,
    pub user_name: String,
    pub user_essential: bool,
    pub user_created: DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            user_uuid: user.id,
            user_name: user.name.clone(),
            user_essential: user.essential,
            user_created: user.created_at,
        }
    }
}
