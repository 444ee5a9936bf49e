// Session tokens. The value column is the only secret; it is scrubbed (set to
// NULL) on invalidation so a leaked value can never be matched again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Token {
    pub id: Uuid,
    pub user_id: Uuid,
    /// `None` once the token has been invalidated.
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub invalidated: bool,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.invalidated || now > self.valid_until
    }
}

/// Login response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssuedToken {
    pub user_uuid: Uuid,
    pub token: String,
    pub expires: DateTime<Utc>,
}
