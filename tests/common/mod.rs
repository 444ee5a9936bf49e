//! Shared fixture: an in-process stack with a manual clock and a scripted
//! token generator, seeded with the built-in bootstrap document.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use koi::bootstrap::{self, BootstrapDocument, ADMIN_USER};
use koi::clock::ManualClock;
use koi::config::Config;
use koi::ledger::grant_in;
use koi::middleware::auth::{random_hex, TokenGenerator};
use koi::models::access::{AccessGrant, ScopeRef};
use koi::models::catalog::{Instance, Model};
use koi::models::role::{Role, Scope};
use koi::models::user::User;
use koi::store::blob::ObjectBlobStore;
use koi::store::memory::MemoryStore;
use koi::store::Store;
use koi::AppState;

pub const ADMIN_PASSWORD: &str = "admin-pw";

/// Hands out queued values first, then fresh random ones.
#[derive(Default)]
pub struct ScriptedGenerator {
    queue: Mutex<VecDeque<String>>,
}

impl ScriptedGenerator {
    pub fn push(&self, value: &str) {
        self.queue
            .lock()
            .unwrap()
            .push_back(value.to_string());
    }
}

impl TokenGenerator for ScriptedGenerator {
    fn generate(&self) -> String {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| random_hex(16))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<ObjectBlobStore>,
    pub clock: Arc<ManualClock>,
    pub generator: Arc<ScriptedGenerator>,
    pub state: Arc<AppState>,
    pub admin: User,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(ObjectBlobStore::in_memory());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let generator = Arc::new(ScriptedGenerator::default());

        bootstrap::seed(
            store.as_ref(),
            &BootstrapDocument::builtin().unwrap(),
            Some(ADMIN_PASSWORD),
        )
        .await
        .unwrap();

        let state = Arc::new(AppState::new(
            Config::default(),
            store.clone(),
            blobs.clone(),
            clock.clone(),
            generator.clone(),
        ));

        let mut tx = store.begin().await.unwrap();
        let admin = tx.get_user_by_name(ADMIN_USER).await.unwrap().unwrap();
        drop(tx);

        Self {
            store,
            blobs,
            clock,
            generator,
            state,
            admin,
        }
    }

    pub async fn add_user(&self, name: &str) -> User {
        let created = self
            .state
            .users
            .create(self.admin.id, Some(name.into()), Some("pw".into()))
            .await
            .unwrap();
        self.state.users.get(created.user_uuid).await.unwrap()
    }

    pub async fn role(&self, scope: Scope, name: &str) -> Role {
        let mut tx = self.store.begin().await.unwrap();
        tx.get_role_by_name(scope, name).await.unwrap().unwrap()
    }

    /// Grant a bootstrap role without going through authorization.
    pub async fn grant(&self, user: Uuid, scope: ScopeRef, role_name: &str) -> AccessGrant {
        let role = self.role(scope.scope(), role_name).await;
        let mut tx = self.store.begin().await.unwrap();
        let grant = grant_in(tx.as_mut(), role.id, scope, user).await.unwrap();
        tx.commit().await.unwrap();
        grant
    }

    /// A finalized model owned by the admin.
    pub async fn model(&self) -> Model {
        let catalog = &self.state.catalog;
        let model = catalog.create_model(self.admin.id, "model", "").await.unwrap();
        catalog.finalize_model(self.admin.id, model.id).await.unwrap()
    }

    pub async fn instance(&self, model: &Model, name: &str) -> Instance {
        self.state
            .catalog
            .create_instance(self.admin.id, model.id, name, "")
            .await
            .unwrap()
    }
}
