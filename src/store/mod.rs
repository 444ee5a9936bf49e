//! Persistence collaborators.
//!
//! - [`Store`] / [`Tx`]: the transactional relational store. Every top-level
//!   core operation opens one [`Tx`], runs all of its reads and writes through
//!   it and commits once. Dropping a `Tx` without committing rolls it back.
//! - [`blob::BlobStore`]: opaque byte payloads (descriptor files, labels, data).
//!
//! Implementations: [`postgres::PgStore`] (sqlx, row-level locks) and
//! [`memory::MemoryStore`] (in-process, serialized transactions).

pub mod blob;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::catalog::{
    Descriptor, Instance, Model, Sample, SampleData, SampleLabel, SampleTag, Tag,
};
use crate::models::role::{Role, Scope};
use crate::models::token::Token;
use crate::models::user::User;
use crate::models::Page;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    /// A persisted row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return StoreError::Conflict(
                    db.constraint().unwrap_or_else(|| db.message()).to_string(),
                );
            }
        }
        StoreError::Database(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Factory for transactions.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<Box<dyn Tx>>;
}

/// One storage transaction.
///
/// Methods named `lock_*` take a row lock that is held until commit/rollback;
/// concurrent writers on the same row serialize behind it.
#[async_trait]
pub trait Tx: Send {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    // -- Users --

    async fn insert_user(&mut self, user: &User) -> StoreResult<()>;
    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>>;
    async fn get_user_by_name(&mut self, name: &str) -> StoreResult<Option<User>>;
    async fn list_users(&mut self, page: Page) -> StoreResult<Vec<User>>;
    async fn update_user(&mut self, user: &User) -> StoreResult<bool>;
    /// Deletes the user together with its tokens and grants.
    async fn delete_user(&mut self, id: Uuid) -> StoreResult<bool>;

    // -- Tokens --

    async fn insert_token(&mut self, token: &Token) -> StoreResult<()>;
    async fn token_value_exists(&mut self, value: &str) -> StoreResult<bool>;
    async fn lock_token_by_value(&mut self, value: &str) -> StoreResult<Option<Token>>;
    async fn get_token(&mut self, id: Uuid) -> StoreResult<Option<Token>>;
    /// Raise `valid_until` to `valid_until`; never lowers it.
    async fn extend_token(&mut self, id: Uuid, valid_until: DateTime<Utc>) -> StoreResult<()>;
    /// Mark invalidated and scrub the value.
    async fn invalidate_token(&mut self, id: Uuid) -> StoreResult<bool>;
    async fn invalidate_user_tokens(&mut self, user_id: Uuid) -> StoreResult<u64>;

    // -- Roles --

    async fn insert_role(&mut self, role: &Role) -> StoreResult<()>;
    async fn get_role(&mut self, id: Uuid) -> StoreResult<Option<Role>>;
    async fn get_role_by_name(&mut self, scope: Scope, name: &str) -> StoreResult<Option<Role>>;
    async fn list_roles(&mut self, scope: Scope, page: Page) -> StoreResult<Vec<Role>>;
    async fn get_roles(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Role>>;
    async fn update_role(&mut self, role: &Role) -> StoreResult<bool>;
    /// Deletes the role together with every grant referencing it.
    async fn delete_role(&mut self, id: Uuid) -> StoreResult<bool>;

    // -- Access grants --

    async fn insert_grant(&mut self, grant: &AccessGrant) -> StoreResult<()>;
    async fn get_grant(&mut self, id: Uuid) -> StoreResult<Option<AccessGrant>>;
    async fn find_grant(
        &mut self,
        user_id: Uuid,
        role_id: Uuid,
        scope: ScopeRef,
    ) -> StoreResult<Option<AccessGrant>>;
    async fn list_grants(&mut self, scope: ScopeRef, page: Page) -> StoreResult<Vec<AccessGrant>>;
    async fn grants_for_user(&mut self, user_id: Uuid, scope: ScopeRef)
        -> StoreResult<Vec<AccessGrant>>;
    async fn delete_grant(&mut self, id: Uuid) -> StoreResult<bool>;

    // -- Models & instances --

    async fn insert_model(&mut self, model: &Model) -> StoreResult<()>;
    async fn get_model(&mut self, id: Uuid) -> StoreResult<Option<Model>>;
    async fn update_model(&mut self, model: &Model) -> StoreResult<bool>;
    async fn insert_instance(&mut self, instance: &Instance) -> StoreResult<()>;
    async fn get_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>>;
    async fn lock_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>>;
    async fn update_instance(&mut self, instance: &Instance) -> StoreResult<bool>;

    // -- Samples --

    async fn insert_sample(&mut self, sample: &Sample) -> StoreResult<()>;
    async fn get_sample(&mut self, id: Uuid) -> StoreResult<Option<Sample>>;
    async fn list_samples(&mut self, instance_id: Uuid) -> StoreResult<Vec<Sample>>;
    async fn update_sample(&mut self, sample: &Sample) -> StoreResult<bool>;
    /// Move a sample to `instance_id` under the fresh identifier `new_id`.
    /// Data, labels and tag associations follow the sample.
    async fn transfer_sample(&mut self, id: Uuid, new_id: Uuid, instance_id: Uuid)
        -> StoreResult<()>;

    async fn insert_sample_data(&mut self, data: &SampleData) -> StoreResult<()>;
    async fn list_sample_data(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleData>>;

    async fn insert_label(&mut self, label: &SampleLabel) -> StoreResult<()>;
    async fn list_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>>;
    /// Delete the sample's non-mergeable labels and return them.
    async fn delete_unmergeable_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>>;

    // -- Tags --

    async fn insert_tag(&mut self, tag: &Tag) -> StoreResult<()>;
    async fn list_tags(&mut self, instance_id: Uuid) -> StoreResult<Vec<Tag>>;
    async fn get_tag_by_name(&mut self, instance_id: Uuid, name: &str) -> StoreResult<Option<Tag>>;
    /// Delete the instance's tags that no sample references. Returns the count.
    async fn delete_orphan_tags(&mut self, instance_id: Uuid) -> StoreResult<u64>;

    async fn insert_sample_tag(&mut self, assoc: &SampleTag) -> StoreResult<()>;
    async fn list_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleTag>>;
    async fn delete_unmergeable_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<u64>;
    /// Mergeable associations whose tag is owned by `instance_id`.
    async fn list_mergeable_tag_links(&mut self, instance_id: Uuid) -> StoreResult<Vec<SampleTag>>;
    async fn retarget_sample_tag(&mut self, sample_id: Uuid, from_tag: Uuid, to_tag: Uuid)
        -> StoreResult<()>;

    // -- Descriptors --

    async fn insert_descriptor(&mut self, descriptor: &Descriptor) -> StoreResult<()>;
    async fn list_descriptors(&mut self, instance_id: Uuid) -> StoreResult<Vec<Descriptor>>;
}
