//! KOI backend: scoped RBAC and instance merging over a model/instance
//! resource tree.
//!
//! The binary in `main.rs` wires these modules into an HTTP server; the
//! integration tests in `tests/` drive them directly.

pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod merge;
pub mod middleware;
pub mod models;
pub mod registry;
pub mod store;
pub mod users;

use std::sync::Arc;

use catalog::Catalog;
use clock::Clock;
use ledger::AccessLedger;
use merge::InstanceMergeEngine;
use middleware::auth::{AuthenticationService, TokenGenerator};
use middleware::rbac::PermissionEvaluator;
use registry::RoleRegistry;
use store::blob::BlobStore;
use store::Store;
use users::UserService;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: AuthenticationService,
    pub evaluator: PermissionEvaluator,
    pub registry: RoleRegistry,
    pub ledger: AccessLedger,
    pub users: UserService,
    pub catalog: Catalog,
    pub merge: InstanceMergeEngine,
    pub config: config::Config,
}

impl AppState {
    pub fn new(
        config: config::Config,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        generator: Arc<dyn TokenGenerator>,
    ) -> Self {
        Self {
            auth: AuthenticationService::new(
                store.clone(),
                clock.clone(),
                generator,
                config.token_policy(),
            ),
            evaluator: PermissionEvaluator::new(store.clone()),
            registry: RoleRegistry::new(store.clone()),
            ledger: AccessLedger::new(store.clone()),
            users: UserService::new(store.clone(), clock.clone()),
            catalog: Catalog::new(store.clone(), blobs.clone(), clock.clone()),
            merge: InstanceMergeEngine::new(store.clone(), blobs.clone(), clock),
            store,
            blobs,
            config,
        }
    }
}
