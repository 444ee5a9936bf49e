//! Bootstrap: seed roles and users from a versioned YAML document.
//!
//! The built-in document (`config/bootstrap.yaml`) carries the essential
//! roles and the admin user. `KOI_BOOTSTRAP_FILE` may point at a second
//! document with additional roles and users, applied after the built-in one.
//!
//! Seeding is idempotent: roles are matched by (scope, name), users by name,
//! grants by (user, role). Existing entries are never modified.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::middleware::auth::hash_password;
use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::role::{CapabilitySet, Role, Scope};
use crate::models::user::User;
use crate::store::Store;

const BUILTIN: &str = include_str!("../config/bootstrap.yaml");

/// Name of the bootstrap administrator, whose password comes from config.
pub const ADMIN_USER: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapDocument {
    /// Schema version. Must be "1".
    pub version: String,
    #[serde(default)]
    pub roles: RoleSeeds,
    #[serde(default)]
    pub users: Vec<UserSeed>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSeeds {
    #[serde(default)]
    pub general: Vec<RoleSeed>,
    #[serde(default)]
    pub model: Vec<RoleSeed>,
    #[serde(default)]
    pub instance: Vec<RoleSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSeed {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub essential: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub essential: bool,
    /// Names of general roles to grant.
    #[serde(default)]
    pub general_roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BootstrapReport {
    pub roles_created: usize,
    pub users_created: usize,
    pub grants_created: usize,
}

impl BootstrapDocument {
    pub fn builtin() -> anyhow::Result<Self> {
        Self::parse(BUILTIN).context("built-in bootstrap document is invalid")
    }

    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        let doc: BootstrapDocument =
            serde_yaml::from_str(yaml).context("failed to parse bootstrap YAML")?;
        if doc.version != "1" {
            anyhow::bail!("unsupported bootstrap schema version: {}", doc.version);
        }
        Ok(doc)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bootstrap file {}", path.display()))?;
        Self::parse(&yaml)
    }
}

/// Seed the built-in document, then the optional extra file.
pub async fn run(
    store: &dyn Store,
    extra: Option<&Path>,
    admin_password: &str,
) -> anyhow::Result<BootstrapReport> {
    let mut report = seed(store, &BootstrapDocument::builtin()?, Some(admin_password)).await?;

    if let Some(path) = extra {
        let extra = seed(store, &BootstrapDocument::load(path)?, None).await?;
        report.roles_created += extra.roles_created;
        report.users_created += extra.users_created;
        report.grants_created += extra.grants_created;
    }

    tracing::info!(
        roles = report.roles_created,
        users = report.users_created,
        grants = report.grants_created,
        "bootstrap complete"
    );
    Ok(report)
}

/// Apply one document in a single transaction. `admin_password` replaces the
/// document's password for [`ADMIN_USER`] when given.
pub async fn seed(
    store: &dyn Store,
    doc: &BootstrapDocument,
    admin_password: Option<&str>,
) -> Result<BootstrapReport, AppError> {
    let mut report = BootstrapReport::default();
    let mut tx = store.begin().await?;

    let scoped = [
        (Scope::General, &doc.roles.general),
        (Scope::Model, &doc.roles.model),
        (Scope::Instance, &doc.roles.instance),
    ];
    for (scope, seeds) in scoped {
        for seed in seeds {
            if tx.get_role_by_name(scope, &seed.name).await?.is_some() {
                continue;
            }
            let capabilities = CapabilitySet::parse(scope, &seed.capabilities)?;
            let mut role = Role::new(scope, &seed.name, &seed.description, capabilities);
            role.essential = seed.essential;
            tx.insert_role(&role).await?;
            report.roles_created += 1;
        }
    }

    for seed in &doc.users {
        let user = match tx.get_user_by_name(&seed.name).await? {
            Some(user) => user,
            None => {
                let password = match admin_password {
                    Some(pw) if seed.name == ADMIN_USER => pw,
                    _ => seed.password.as_str(),
                };
                let mut user = User::new(&seed.name, hash_password(password), Utc::now());
                user.essential = seed.essential;
                tx.insert_user(&user).await?;
                report.users_created += 1;
                user
            }
        };

        for role_name in &seed.general_roles {
            let role = tx
                .get_role_by_name(Scope::General, role_name)
                .await?
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "user '{}' references unknown general role '{}'",
                        seed.name, role_name
                    ))
                })?;
            if tx
                .find_grant(user.id, role.id, ScopeRef::General)
                .await?
                .is_none()
            {
                tx.insert_grant(&AccessGrant::new(user.id, role.id, ScopeRef::General))
                    .await?;
                report.grants_created += 1;
            }
        }
    }

    tx.commit().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::verify_password;
    use crate::models::role::{GeneralCapability, InstanceCapability, ModelCapability};
    use crate::store::memory::MemoryStore;

    #[test]
    fn test_builtin_document_parses() {
        let doc = BootstrapDocument::builtin().unwrap();
        assert_eq!(doc.roles.general.len(), 3);
        assert_eq!(doc.roles.model.len(), 4);
        assert_eq!(doc.roles.instance.len(), 4);
        assert_eq!(doc.users[0].name, ADMIN_USER);
    }

    #[test]
    fn test_rejects_unknown_version() {
        assert!(BootstrapDocument::parse("version: \"2\"\n").is_err());
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let store = MemoryStore::new();
        let doc = BootstrapDocument::builtin().unwrap();

        let first = seed(&store, &doc, Some("s3cret")).await.unwrap();
        assert_eq!(first.roles_created, 11);
        assert_eq!(first.users_created, 1);
        assert_eq!(first.grants_created, 1);

        let second = seed(&store, &doc, Some("s3cret")).await.unwrap();
        assert_eq!(second, BootstrapReport::default());
    }

    #[tokio::test]
    async fn test_seeded_capability_matrix() {
        let store = MemoryStore::new();
        seed(&store, &BootstrapDocument::builtin().unwrap(), Some("s3cret"))
            .await
            .unwrap();

        let mut tx = store.begin().await.unwrap();
        let admin_role = tx.get_role_by_name(Scope::General, "admin").await.unwrap().unwrap();
        assert!(admin_role.essential);
        assert!(admin_role.check(GeneralCapability::EditRoles.into()));

        let worker = tx.get_role_by_name(Scope::Model, "worker").await.unwrap().unwrap();
        assert!(worker.check(ModelCapability::DownloadCode.into()));
        assert!(!worker.check(ModelCapability::Edit.into()));

        let user = tx.get_role_by_name(Scope::Instance, "user").await.unwrap().unwrap();
        assert!(user.check(InstanceCapability::ResponseLabel.into()));
        assert!(!user.check(InstanceCapability::AddSample.into()));

        let admin = tx.get_user_by_name(ADMIN_USER).await.unwrap().unwrap();
        assert!(admin.essential);
        assert!(verify_password("s3cret", &admin.password_hash));
    }

    #[tokio::test]
    async fn test_unknown_capability_in_seed_is_rejected() {
        let store = MemoryStore::new();
        let doc = BootstrapDocument::parse(
            "version: \"1\"\nroles:\n  model:\n    - name: broken\n      capabilities: [fly]\n",
        )
        .unwrap();
        let err = seed(&store, &doc, None).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
