use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{Store, StoreError, StoreResult, Tx};
use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::catalog::{
    Descriptor, Instance, Model, Sample, SampleData, SampleLabel, SampleTag, Tag,
};
use crate::models::role::{CapabilitySet, Role, Scope};
use crate::models::token::Token;
use crate::models::user::User;
use crate::models::Page;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn Tx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

// -- Row types --

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    scope: Scope,
    name: String,
    description: String,
    essential: bool,
    capabilities: Vec<String>,
}

impl TryFrom<RoleRow> for Role {
    type Error = StoreError;

    fn try_from(row: RoleRow) -> Result<Self, Self::Error> {
        let capabilities = CapabilitySet::parse(row.scope, &row.capabilities)
            .map_err(|e| StoreError::Corrupt(format!("role {}: {}", row.id, e)))?;
        Ok(Role {
            id: row.id,
            scope: row.scope,
            name: row.name,
            description: row.description,
            essential: row.essential,
            capabilities,
        })
    }
}

fn roles_from_rows(rows: Vec<RoleRow>) -> StoreResult<Vec<Role>> {
    rows.into_iter().map(Role::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    id: Uuid,
    user_id: Uuid,
    role_id: Uuid,
    scope: Scope,
    entity_id: Option<Uuid>,
}

impl TryFrom<GrantRow> for AccessGrant {
    type Error = StoreError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let scope = ScopeRef::from_parts(row.scope, row.entity_id).ok_or_else(|| {
            StoreError::Corrupt(format!("grant {}: entity does not match scope", row.id))
        })?;
        Ok(AccessGrant {
            id: row.id,
            user_id: row.user_id,
            role_id: row.role_id,
            scope,
        })
    }
}

fn grants_from_rows(rows: Vec<GrantRow>) -> StoreResult<Vec<AccessGrant>> {
    rows.into_iter().map(AccessGrant::try_from).collect()
}

const USER_COLUMNS: &str = "id, name, password_hash, created_at, essential";
const TOKEN_COLUMNS: &str = "id, user_id, value, created_at, valid_until, invalidated";
const ROLE_COLUMNS: &str = "id, scope, name, description, essential, capabilities";
const GRANT_COLUMNS: &str = "id, user_id, role_id, scope, entity_id";
const INSTANCE_COLUMNS: &str =
    "id, model_id, name, description, finalized, merged_into, last_modified";

#[async_trait]
impl Tx for PgTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    // -- User Operations --

    async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, name, password_hash, created_at, essential) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.password_hash)
        .bind(user.created_at)
        .bind(user.essential)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_user(&mut self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn get_user_by_name(&mut self, name: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users WHERE name = $1",
            USER_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn list_users(&mut self, page: Page) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, User>(&format!(
            "SELECT {} FROM users ORDER BY seq ASC LIMIT $1 OFFSET $2",
            USER_COLUMNS
        ))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn update_user(&mut self, user: &User) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE users SET name = $2, password_hash = $3 WHERE id = $1")
            .bind(user.id)
            .bind(&user.name)
            .bind(&user.password_hash)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user(&mut self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Token Operations --

    async fn insert_token(&mut self, token: &Token) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO tokens (id, user_id, value, created_at, valid_until, invalidated)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.value)
        .bind(token.created_at)
        .bind(token.valid_until)
        .bind(token.invalidated)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn token_value_exists(&mut self, value: &str) -> StoreResult<bool> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM tokens WHERE value = $1)")
                .bind(value)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(exists)
    }

    async fn lock_token_by_value(&mut self, value: &str) -> StoreResult<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            "SELECT {} FROM tokens WHERE value = $1 FOR UPDATE",
            TOKEN_COLUMNS
        ))
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn get_token(&mut self, id: Uuid) -> StoreResult<Option<Token>> {
        let row = sqlx::query_as::<_, Token>(&format!(
            "SELECT {} FROM tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn extend_token(&mut self, id: Uuid, valid_until: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE tokens SET valid_until = GREATEST(valid_until, $2) WHERE id = $1")
            .bind(id)
            .bind(valid_until)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn invalidate_token(&mut self, id: Uuid) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE tokens SET invalidated = true, value = NULL WHERE id = $1")
                .bind(id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn invalidate_user_tokens(&mut self, user_id: Uuid) -> StoreResult<u64> {
        let result =
            sqlx::query("UPDATE tokens SET invalidated = true, value = NULL WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected())
    }

    // -- Role Operations --

    async fn insert_role(&mut self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO roles (id, scope, name, description, essential, capabilities)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(role.id)
        .bind(role.scope)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.essential)
        .bind(role.capabilities.names(role.scope))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_role(&mut self, id: Uuid) -> StoreResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {} FROM roles WHERE id = $1",
            ROLE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Role::try_from).transpose()
    }

    async fn get_role_by_name(&mut self, scope: Scope, name: &str) -> StoreResult<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {} FROM roles WHERE scope = $1 AND name = $2",
            ROLE_COLUMNS
        ))
        .bind(scope)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Role::try_from).transpose()
    }

    async fn list_roles(&mut self, scope: Scope, page: Page) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {} FROM roles WHERE scope = $1 ORDER BY seq ASC LIMIT $2 OFFSET $3",
            ROLE_COLUMNS
        ))
        .bind(scope)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        roles_from_rows(rows)
    }

    async fn get_roles(&mut self, ids: &[Uuid]) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, RoleRow>(&format!(
            "SELECT {} FROM roles WHERE id = ANY($1) ORDER BY seq ASC",
            ROLE_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;
        roles_from_rows(rows)
    }

    async fn update_role(&mut self, role: &Role) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE roles SET name = $2, description = $3, capabilities = $4 WHERE id = $1",
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.capabilities.names(role.scope))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_role(&mut self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Access Grant Operations --

    async fn insert_grant(&mut self, grant: &AccessGrant) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO access_grants (id, user_id, role_id, scope, entity_id) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(grant.id)
        .bind(grant.user_id)
        .bind(grant.role_id)
        .bind(grant.scope.scope())
        .bind(grant.scope.entity_id())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_grant(&mut self, id: Uuid) -> StoreResult<Option<AccessGrant>> {
        let row = sqlx::query_as::<_, GrantRow>(&format!(
            "SELECT {} FROM access_grants WHERE id = $1",
            GRANT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(AccessGrant::try_from).transpose()
    }

    async fn find_grant(
        &mut self,
        user_id: Uuid,
        role_id: Uuid,
        scope: ScopeRef,
    ) -> StoreResult<Option<AccessGrant>> {
        let row = sqlx::query_as::<_, GrantRow>(&format!(
            r#"SELECT {} FROM access_grants
               WHERE user_id = $1 AND role_id = $2 AND scope = $3 AND entity_id IS NOT DISTINCT FROM $4"#,
            GRANT_COLUMNS
        ))
        .bind(user_id)
        .bind(role_id)
        .bind(scope.scope())
        .bind(scope.entity_id())
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(AccessGrant::try_from).transpose()
    }

    async fn list_grants(&mut self, scope: ScopeRef, page: Page) -> StoreResult<Vec<AccessGrant>> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            r#"SELECT {} FROM access_grants
               WHERE scope = $1 AND entity_id IS NOT DISTINCT FROM $2
               ORDER BY seq ASC LIMIT $3 OFFSET $4"#,
            GRANT_COLUMNS
        ))
        .bind(scope.scope())
        .bind(scope.entity_id())
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&mut *self.tx)
        .await?;
        grants_from_rows(rows)
    }

    async fn grants_for_user(
        &mut self,
        user_id: Uuid,
        scope: ScopeRef,
    ) -> StoreResult<Vec<AccessGrant>> {
        let rows = sqlx::query_as::<_, GrantRow>(&format!(
            r#"SELECT {} FROM access_grants
               WHERE user_id = $1 AND scope = $2 AND entity_id IS NOT DISTINCT FROM $3
               ORDER BY seq ASC"#,
            GRANT_COLUMNS
        ))
        .bind(user_id)
        .bind(scope.scope())
        .bind(scope.entity_id())
        .fetch_all(&mut *self.tx)
        .await?;
        grants_from_rows(rows)
    }

    async fn delete_grant(&mut self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM access_grants WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Model & Instance Operations --

    async fn insert_model(&mut self, model: &Model) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO models (id, name, description, finalized, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(model.id)
        .bind(&model.name)
        .bind(&model.description)
        .bind(model.finalized)
        .bind(model.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_model(&mut self, id: Uuid) -> StoreResult<Option<Model>> {
        let row = sqlx::query_as::<_, Model>(
            "SELECT id, name, description, finalized, created_at FROM models WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn update_model(&mut self, model: &Model) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE models SET name = $2, description = $3, finalized = $4 WHERE id = $1",
        )
        .bind(model.id)
        .bind(&model.name)
        .bind(&model.description)
        .bind(model.finalized)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_instance(&mut self, instance: &Instance) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO instances (id, model_id, name, description, finalized, merged_into, last_modified)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(instance.id)
        .bind(instance.model_id)
        .bind(&instance.name)
        .bind(&instance.description)
        .bind(instance.finalized)
        .bind(instance.merged_into)
        .bind(instance.last_modified)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>> {
        let row = sqlx::query_as::<_, Instance>(&format!(
            "SELECT {} FROM instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_instance(&mut self, id: Uuid) -> StoreResult<Option<Instance>> {
        let row = sqlx::query_as::<_, Instance>(&format!(
            "SELECT {} FROM instances WHERE id = $1 FOR UPDATE",
            INSTANCE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn update_instance(&mut self, instance: &Instance) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"UPDATE instances
               SET name = $2, description = $3, finalized = $4, merged_into = $5, last_modified = $6
               WHERE id = $1"#,
        )
        .bind(instance.id)
        .bind(&instance.name)
        .bind(&instance.description)
        .bind(instance.finalized)
        .bind(instance.merged_into)
        .bind(instance.last_modified)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Sample Operations --

    async fn insert_sample(&mut self, sample: &Sample) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO samples (id, instance_id, finalized, last_modified) VALUES ($1, $2, $3, $4)",
        )
        .bind(sample.id)
        .bind(sample.instance_id)
        .bind(sample.finalized)
        .bind(sample.last_modified)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_sample(&mut self, id: Uuid) -> StoreResult<Option<Sample>> {
        let row = sqlx::query_as::<_, Sample>(
            "SELECT id, instance_id, finalized, last_modified FROM samples WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn list_samples(&mut self, instance_id: Uuid) -> StoreResult<Vec<Sample>> {
        let rows = sqlx::query_as::<_, Sample>(
            "SELECT id, instance_id, finalized, last_modified FROM samples WHERE instance_id = $1 ORDER BY seq ASC",
        )
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn update_sample(&mut self, sample: &Sample) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE samples SET finalized = $2, last_modified = $3 WHERE id = $1")
                .bind(sample.id)
                .bind(sample.finalized)
                .bind(sample.last_modified)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transfer_sample(
        &mut self,
        id: Uuid,
        new_id: Uuid,
        instance_id: Uuid,
    ) -> StoreResult<()> {
        // children follow through ON UPDATE CASCADE
        sqlx::query("UPDATE samples SET id = $2, instance_id = $3 WHERE id = $1")
            .bind(id)
            .bind(new_id)
            .bind(instance_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_sample_data(&mut self, data: &SampleData) -> StoreResult<()> {
        sqlx::query("INSERT INTO sample_data (id, sample_id, key, file) VALUES ($1, $2, $3, $4)")
            .bind(data.id)
            .bind(data.sample_id)
            .bind(&data.key)
            .bind(&data.file)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_sample_data(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleData>> {
        let rows = sqlx::query_as::<_, SampleData>(
            "SELECT id, sample_id, key, file FROM sample_data WHERE sample_id = $1 ORDER BY seq ASC",
        )
        .bind(sample_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn insert_label(&mut self, label: &SampleLabel) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO sample_labels (id, sample_id, key, file, mergeable) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(label.id)
        .bind(label.sample_id)
        .bind(&label.key)
        .bind(&label.file)
        .bind(label.mergeable)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>> {
        let rows = sqlx::query_as::<_, SampleLabel>(
            "SELECT id, sample_id, key, file, mergeable FROM sample_labels WHERE sample_id = $1 ORDER BY seq ASC",
        )
        .bind(sample_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete_unmergeable_labels(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleLabel>> {
        let rows = sqlx::query_as::<_, SampleLabel>(
            r#"DELETE FROM sample_labels WHERE sample_id = $1 AND NOT mergeable
               RETURNING id, sample_id, key, file, mergeable"#,
        )
        .bind(sample_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    // -- Tag Operations --

    async fn insert_tag(&mut self, tag: &Tag) -> StoreResult<()> {
        sqlx::query("INSERT INTO tags (id, instance_id, name) VALUES ($1, $2, $3)")
            .bind(tag.id)
            .bind(tag.instance_id)
            .bind(&tag.name)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_tags(&mut self, instance_id: Uuid) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, Tag>(
            "SELECT id, instance_id, name FROM tags WHERE instance_id = $1 ORDER BY seq ASC",
        )
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn get_tag_by_name(&mut self, instance_id: Uuid, name: &str) -> StoreResult<Option<Tag>> {
        let row = sqlx::query_as::<_, Tag>(
            "SELECT id, instance_id, name FROM tags WHERE instance_id = $1 AND name = $2",
        )
        .bind(instance_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn delete_orphan_tags(&mut self, instance_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM tags t
               WHERE t.instance_id = $1
                 AND NOT EXISTS (SELECT 1 FROM sample_tags st WHERE st.tag_id = t.id)"#,
        )
        .bind(instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_sample_tag(&mut self, assoc: &SampleTag) -> StoreResult<()> {
        sqlx::query("INSERT INTO sample_tags (sample_id, tag_id, mergeable) VALUES ($1, $2, $3)")
            .bind(assoc.sample_id)
            .bind(assoc.tag_id)
            .bind(assoc.mergeable)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<Vec<SampleTag>> {
        let rows = sqlx::query_as::<_, SampleTag>(
            "SELECT sample_id, tag_id, mergeable FROM sample_tags WHERE sample_id = $1 ORDER BY seq ASC",
        )
        .bind(sample_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn delete_unmergeable_sample_tags(&mut self, sample_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sample_tags WHERE sample_id = $1 AND NOT mergeable")
            .bind(sample_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_mergeable_tag_links(&mut self, instance_id: Uuid) -> StoreResult<Vec<SampleTag>> {
        let rows = sqlx::query_as::<_, SampleTag>(
            r#"SELECT st.sample_id, st.tag_id, st.mergeable
               FROM sample_tags st JOIN tags t ON t.id = st.tag_id
               WHERE t.instance_id = $1 AND st.mergeable
               ORDER BY st.seq ASC"#,
        )
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn retarget_sample_tag(
        &mut self,
        sample_id: Uuid,
        from_tag: Uuid,
        to_tag: Uuid,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE sample_tags SET tag_id = $3 WHERE sample_id = $1 AND tag_id = $2")
            .bind(sample_id)
            .bind(from_tag)
            .bind(to_tag)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    // -- Descriptor Operations --

    async fn insert_descriptor(&mut self, descriptor: &Descriptor) -> StoreResult<()> {
        sqlx::query("INSERT INTO descriptors (id, instance_id, key, file) VALUES ($1, $2, $3, $4)")
            .bind(descriptor.id)
            .bind(descriptor.instance_id)
            .bind(&descriptor.key)
            .bind(&descriptor.file)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn list_descriptors(&mut self, instance_id: Uuid) -> StoreResult<Vec<Descriptor>> {
        let rows = sqlx::query_as::<_, Descriptor>(
            "SELECT id, instance_id, key, file FROM descriptors WHERE instance_id = $1 ORDER BY seq ASC",
        )
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }
}
