//! In-process store.
//!
//! A transaction takes the single table lock, works on a private copy of all
//! tables and swaps the copy in on commit. Transactions are therefore fully
//! serialized and a dropped transaction leaves no trace. Unique constraints
//! mirror the Postgres schema in `migrations/`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, Tx};
use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::catalog::{
    Descriptor, Instance, Model, Sample, SampleData, SampleLabel, SampleTag, Tag,
};
use crate::models::role::{Role, Scope};
use crate::models::token::Token;
use crate::models::user::User;
use crate::models::Page;

#[derive(Debug, Clone, Default)]
struct Tables {
    users: Vec<User>,
    tokens: Vec<Token>,
    roles: Vec<Role>,
    grants: Vec<AccessGrant>,
    models: Vec<Model>,
    instances: Vec<Instance>,
    samples: Vec<Sample>,
    sample_data: Vec<SampleData>,
    labels: Vec<SampleLabel>,
    tags: Vec<Tag>,
    sample_tags: Vec<SampleTag>,
    descriptors: Vec<Descriptor>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn Tx>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

fn conflict(what: &str) -> StoreError {
    StoreError::Conflict(what.to_string())
}

fn replace<T: Clone>(rows: &mut [T], value: &T, matches: impl Fn(&T) -> bool) -> bool {
    match rows.iter_mut().find(|r| matches(r)) {
        Some(row) => {
            *row = value.clone();
            true
        }
        None => false,
    }
}

#[async_trait]
impl Tx for MemoryTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    // -- Users --

    async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        if self.work.users.iter().any(|u| u.name == user.name) {
            return Err(conflict("users_name_key"));
        }
        self.work.users.push(user.clone());
        Ok(())
    }

    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.work.users.iter().find(|u| u.id == id).cloned())
    }

    async fn get_user_by_name(&mut self, name: &str) -> StoreResult<Option<User>> {
        Ok(self.work.users.iter().find(|u| u.name == name).cloned())
    }

    async fn list_users(&mut self, page: Page) -> StoreResult<Vec<User>> {
        Ok(page.slice(&self.work.users))
    }

    async fn update_user(&mut self, user: &User) -> StoreResult<bool> {
        if self
            .work
            .users
            .iter()
            .any(|u| u.name == user.name && u.id != user.id)
        {
            return Err(conflict("users_name_key"));
        }
        Ok(replace(&mut self.work.users, user, |u| u.id == user.id))
    }

    async fn delete_user(&mut self, id: Uuid) -> StoreResult<bool> {
        let before = self.work.users.len();
        self.work.users.retain(|u| u.id != id);
        if self.work.users.len() == before {
            return Ok(false);
        }
        self.work.tokens.retain(|t| t.user_id != id);
        self.work.grants.retain(|g| g.user_id != id);
        Ok(true)
    }

    // -- Tokens --

    async fn insert_token(&mut self, token: &Token) -> StoreResult<()> {
        if token.value.is_some() && self.work.tokens.iter().any(|t| t.value == token.value) {
            return Err(conflict("tokens_value_key"));
        }
        self.work.tokens.push(token.clone());
        Ok(())
    }

    async fn token_value_exists(&mut self, value: &str) -> StoreResult<bool> {
        Ok(self
            .work
            .tokens
            .iter()
            .any(|t| t.value.as_deref() == Some(value)))
    }

    async fn lock_token_by_value(&mut self, value: &str) -> StoreResult<Option<Token>> {
        Ok(self
            .work
            .tokens
            .iter()
            .find(|t| t.value.as_deref() == Some(value))
            .cloned())
    }

    async fn get_token(&mut self, id: Uuid) -> StoreResult<Option<Token>> {
        Ok(self.work.tokens.iter().find(|t| t.id == id).cloned())
    }

    async fn extend_token(&mut self, id: Uuid, valid_until: DateTime<Utc>) -> StoreResult<()> {
        if let Some(token) = self.work.tokens.iter_mut().find(|t| t.id == id) {
            token.valid_until = token.valid_until.max(valid_until);
        }
        Ok(())
    }

    async fn invalidate_token(&mut self, id: Uuid) -> StoreResult<bool> {
        match self.work.tokens.iter_mut().find(|t| t.id == id) {
            Some(token) => {
                token.invalidated = true;
                token.value = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn invalidate_user_tokens(&mut self, user_id: Uuid) -> StoreResult<u64> {
        let mut count = 0;
        for token in self.work.tokens.iter_mut().filter(|t| t.user_id == user_id) {
            token.invalidated = true;
            token.value = None;
            count += 1;
        }
        Ok(count)
    }

    // -- Roles --

    async fn insert_role(&mut self, role: &Role) -> StoreResult<()> {
        if self
            .work
            .roles
            .iter()
            .any(|r| r.scope == role.scope && r.name == role.name)
        {
            return Err(conflict("roles_scope_name_key"));
        }
        self.work.roles.push(role.clone());
        Ok(())
    }

    async fn get_role(&mut self, id: Uuid) -> StoreResult<Option<Role>> {
        Ok(self.work.roles.iter().find(|r| r.id == id).cloned())
    }

    async fn get_role_by_name(&mut self, scope: Scope, name: &str) -> StoreResult<Option<Role>> {
        Ok(self
            .work
            .roles
            .iter()
            .find(|r| r.scope == scope && r.name == name)
            .cloned())
    }

    async fn list_roles(&mut self, scope: Scope, page: Page) -> StoreResult<Vec<Role>> {
        let scoped: Vec<Role> = self
            .work
            .roles
            .iter()
            .filter(|r| r.scope == scope)
            .cloned()
            .collect();
        Ok(page.slice(&scoped))
    }

    async fn get_roles(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Role>> {
        Ok(self
            .work
            .roles
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn update_role(&mut self, role: &Role) -> StoreResult<bool> {
        if self
            .work
            .roles
            .iter()
            .any(|r| r.scope == role.scope && r.name == role.name && r.id != role.id)
        {
            return Err(conflict("roles_scope_name_key"));
        }
        Ok(replace(&mut self.work.roles, role, |r| r.id == role.id))
    }

    async fn delete_role(&mut self, id: Uuid) -> StoreResult<bool> {
        let before = self.work.roles.len();
        self.work.roles.retain(|r| r.id != id);
        if self.work.roles.len() == before {
            return Ok(false);
        }
        self.work.grants.retain(|g| g.role_id != id);
        Ok(true)
    }

    // -- Access grants --

    async fn insert_grant(&mut self, grant: &AccessGrant) -> StoreResult<()> {
        if self.work.grants.iter().any(|g| {
            g.user_id == grant.user_id && g.role_id == grant.role_id && g.scope == grant.scope
        }) {
            return Err(conflict("access_grants_unique"));
        }
        self.work.grants.push(grant.clone());
        Ok(())
    }

    async fn get_grant(&mut self, id: Uuid) -> StoreResult<Option<AccessGrant>> {
        Ok(self.work.grants.iter().find(|g| g.id == id).cloned())
    }

    async fn find_grant(
        &mut self,
        user_id: Uuid,
        role_id: Uuid,
        scope: ScopeRef,
    ) -> StoreResult<Option<AccessGrant>> {
        Ok(self
            .work
            .grants
            .iter()
            .find(|g| g.user_id == user_id && g.role_id == role_id && g.scope == scope)
            .cloned())
    }

    async fn list_grants(&mut self, scope: ScopeRef, page: Page) -> StoreResult<Vec<AccessGrant>> {
        let scoped: Vec<AccessGrant> = self
            .work
            .grants
            .iter()
            .filter(|g| g.scope == scope)
            .cloned()
            .collect();
        Ok(page.slice(&scoped))
    }

    async fn grants_for_user(
        &mut self,
        user_id: Uuid,
        scope: ScopeRef,
    ) -> StoreResult<Vec<AccessGrant>> {
        Ok(self
            .work
            .grants
            .iter()
            .filter(|g| g.user_id == user_id && g.scope == scope)
            .cloned()
            .collect())
    }

    async fn delete_grant(&mut self, id: Uuid) -> StoreResult<bool> {
        let before = self.work.grants.len();
        self.work.grants.retain(|g| g.id != id);
        Ok(self.work.grants.len() != before)
    }

    // -- Models & instances --

    async fn insert_model(&mut self, model: &Model) -> StoreResult<()> {
        self.work.models.push(model.clone());
        Ok(())
    }

    async fn get_model(&mut self, id: Uuid) -> StoreResult<Option<Model>> {
        Ok(self.work.models.iter().find(|m| m.id == id).cloned())
    }

    async fn update_model(&mut self, model: &Model) -> StoreResult<bool> {
        Ok(replace(&mut self.work.models, model, |m| m.id == model.id))
    }

    async fn insert_instance(&mut self, instance: &Instance) -> StoreResult<()> {
        self.work.instances.push(instance.clone());
        Ok(())
    }

    async fn get_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>> {
        Ok(self.work.instances.iter().find(|i| i.id == id).cloned())
    }

    async fn lock_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>> {
        // the transaction already holds the table lock
        self.get_instance(id).await
    }

    async fn update_instance(&mut self, instance: &Instance) -> StoreResult<bool> {
        Ok(replace(&mut self.work.instances, instance, |i| {
            i.id == instance.id
        }))
    }

    // -- Samples --

    async fn insert_sample(&mut self, sample: &Sample) -> StoreResult<()> {
        self.work.samples.push(sample.clone());
        Ok(())
    }

    async fn get_sample(&mut self, id: Uuid) -> StoreResult<Option<Sample>> {
        Ok(self.work.samples.iter().find(|s| s.id == id).cloned())
    }

    async fn list_samples(&mut self, instance_id: Uuid) -> StoreResult<Vec<Sample>> {
        Ok(self
            .work
            .samples
            .iter()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn update_sample(&mut self, sample: &Sample) -> StoreResult<bool> {
        Ok(replace(&mut self.work.samples, sample, |s| s.id == sample.id))
    }

    async fn transfer_sample(
        &mut self,
        id: Uuid,
        new_id: Uuid,
        instance_id: Uuid,
    ) -> StoreResult<()> {
        if self.work.samples.iter().any(|s| s.id == new_id) {
            return Err(conflict("samples_pkey"));
        }
        if let Some(sample) = self.work.samples.iter_mut().find(|s| s.id == id) {
            sample.id = new_id;
            sample.instance_id = instance_id;
        }
        for data in self.work.sample_data.iter_mut().filter(|d| d.sample_id == id) {
            data.sample_id = new_id;
        }
        for label in self.work.labels.iter_mut().filter(|l| l.sample_id == id) {
            label.sample_id = new_id;
        }
        for assoc in self.work.sample_tags.iter_mut().filter(|a| a.sample_id == id) {
            assoc.sample_id = new_id;
        }
        Ok(())
    }

    async fn insert_sample_data(&mut self, data: &SampleData) -> StoreResult<()> {
        self.work.sample_data.push(data.clone());
        Ok(())
    }

    async fn list_sample_data(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleData>> {
        Ok(self
            .work
            .sample_data
            .iter()
            .filter(|d| d.sample_id == sample_id)
            .cloned()
            .collect())
    }

    async fn insert_label(&mut self, label: &SampleLabel) -> StoreResult<()> {
        self.work.labels.push(label.clone());
        Ok(())
    }

    async fn list_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>> {
        Ok(self
            .work
            .labels
            .iter()
            .filter(|l| l.sample_id == sample_id)
            .cloned()
            .collect())
    }

    async fn delete_unmergeable_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>> {
        let (removed, kept): (Vec<SampleLabel>, Vec<SampleLabel>) = self
            .work
            .labels
            .drain(..)
            .partition(|l| l.sample_id == sample_id && !l.mergeable);
        self.work.labels = kept;
        Ok(removed)
    }

    // -- Tags --

    async fn insert_tag(&mut self, tag: &Tag) -> StoreResult<()> {
        if self
            .work
            .tags
            .iter()
            .any(|t| t.instance_id == tag.instance_id && t.name == tag.name)
        {
            return Err(conflict("tags_instance_name_key"));
        }
        self.work.tags.push(tag.clone());
        Ok(())
    }

    async fn list_tags(&mut self, instance_id: Uuid) -> StoreResult<Vec<Tag>> {
        Ok(self
            .work
            .tags
            .iter()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn get_tag_by_name(&mut self, instance_id: Uuid, name: &str) -> StoreResult<Option<Tag>> {
        Ok(self
            .work
            .tags
            .iter()
            .find(|t| t.instance_id == instance_id && t.name == name)
            .cloned())
    }

    async fn delete_orphan_tags(&mut self, instance_id: Uuid) -> StoreResult<u64> {
        let Tables {
            tags, sample_tags, ..
        } = &mut self.work;
        let before = tags.len();
        tags.retain(|t| t.instance_id != instance_id || sample_tags.iter().any(|a| a.tag_id == t.id));
        Ok((before - tags.len()) as u64)
    }

    async fn insert_sample_tag(&mut self, assoc: &SampleTag) -> StoreResult<()> {
        if self
            .work
            .sample_tags
            .iter()
            .any(|a| a.sample_id == assoc.sample_id && a.tag_id == assoc.tag_id)
        {
            return Err(conflict("sample_tags_pkey"));
        }
        self.work.sample_tags.push(assoc.clone());
        Ok(())
    }

    async fn list_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleTag>> {
        Ok(self
            .work
            .sample_tags
            .iter()
            .filter(|a| a.sample_id == sample_id)
            .cloned()
            .collect())
    }

    async fn delete_unmergeable_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<u64> {
        let before = self.work.sample_tags.len();
        self.work
            .sample_tags
            .retain(|a| a.sample_id != sample_id || a.mergeable);
        Ok((before - self.work.sample_tags.len()) as u64)
    }

    async fn list_mergeable_tag_links(&mut self, instance_id: Uuid) -> StoreResult<Vec<SampleTag>> {
        let Tables {
            tags, sample_tags, ..
        } = &self.work;
        Ok(sample_tags
            .iter()
            .filter(|a| {
                a.mergeable
                    && tags
                        .iter()
                        .any(|t| t.id == a.tag_id && t.instance_id == instance_id)
            })
            .cloned()
            .collect())
    }

    async fn retarget_sample_tag(
        &mut self,
        sample_id: Uuid,
        from_tag: Uuid,
        to_tag: Uuid,
    ) -> StoreResult<()> {
        if self
            .work
            .sample_tags
            .iter()
            .any(|a| a.sample_id == sample_id && a.tag_id == to_tag)
        {
            return Err(conflict("sample_tags_pkey"));
        }
        if let Some(assoc) = self
            .work
            .sample_tags
            .iter_mut()
            .find(|a| a.sample_id == sample_id && a.tag_id == from_tag)
        {
            assoc.tag_id = to_tag;
        }
        Ok(())
    }

    // -- Descriptors --

    async fn insert_descriptor(&mut self, descriptor: &Descriptor) -> StoreResult<()> {
        self.work.descriptors.push(descriptor.clone());
        Ok(())
    }

    async fn list_descriptors(&mut self, instance_id: Uuid) -> StoreResult<Vec<Descriptor>> {
        Ok(self
            .work
            .descriptors
            .iter()
            .filter(|d| d.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
