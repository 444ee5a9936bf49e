use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::merge::MergeReport;
use crate::middleware::auth::Authenticated;
use crate::models::access::{AccessView, ScopeRef};
use crate::models::catalog::{
    Descriptor, Instance, Model, Sample, SampleData, SampleLabel, SampleTag, Tag,
};
use crate::models::role::{CapabilitySet, RoleView, Scope};
use crate::models::token::IssuedToken;
use crate::models::user::UserView;
use crate::models::Page;
use crate::registry::RoleChanges;
use crate::users::{CreatedUser, UserChanges};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

#[derive(Deserialize, Default)]
pub struct UserRequest {
    pub user_name: Option<String>,
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateRoleRequest {
    pub role_name: String,
    #[serde(default)]
    pub role_description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Deserialize, Default)]
pub struct UpdateRoleRequest {
    pub role_name: Option<String>,
    pub role_description: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct GrantRequest {
    pub user_uuid: Uuid,
    pub role_uuid: Uuid,
}

#[derive(Deserialize)]
pub struct CreateModelRequest {
    pub model_name: String,
    #[serde(default)]
    pub model_description: String,
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    pub instance_name: String,
    #[serde(default)]
    pub instance_description: String,
}

#[derive(Deserialize)]
pub struct MergeRequest {
    pub sources: Vec<Uuid>,
}

/// A keyed entry with optional UTF-8 file content (descriptors, sample data, labels).
#[derive(Deserialize)]
pub struct EntryRequest {
    pub key: String,
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct TagRequest {
    pub tag_name: String,
}

#[derive(Serialize)]
pub struct CapabilitiesResponse {
    pub scope: Scope,
    pub capabilities: Vec<String>,
}

fn file_response(content: Option<Vec<u8>>) -> Response {
    match content {
        Some(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn capabilities_response(scope: Scope, held: CapabilitySet) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        scope,
        capabilities: held.names(scope),
    })
}

// ── Session ──────────────────────────────────────────────────

/// POST /api/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<IssuedToken>, AppError> {
    let issued = state.auth.login(&payload.user_name, &payload.password).await?;
    Ok(Json(issued))
}

/// POST /api/logout: invalidates every token of the caller.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
) -> Result<StatusCode, AppError> {
    state.auth.logout(me.user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Users ────────────────────────────────────────────────────

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<UserView>>, AppError> {
    let users = state.users.list(page).await?;
    Ok(Json(users.iter().map(UserView::from).collect()))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Json(payload): Json<UserRequest>,
) -> Result<(StatusCode, Json<CreatedUser>), AppError> {
    let created = state
        .users
        .create(me.user.id, payload.user_name, payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<UserView>, AppError> {
    let user = state.users.get(user_id).await?;
    Ok(Json(UserView::from(&user)))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(user_id): Path<Uuid>,
    Json(payload): Json<UserRequest>,
) -> Result<Json<UserView>, AppError> {
    let changes = UserChanges {
        name: payload.user_name,
        password: payload.password,
    };
    let user = state.users.update(&me.user, user_id, changes).await?;
    Ok(Json(UserView::from(&user)))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.users.delete(&me.user, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Roles ────────────────────────────────────────────────────

pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Path(scope): Path<String>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<RoleView>>, AppError> {
    let roles = state.registry.list(Scope::parse(&scope)?, page).await?;
    Ok(Json(roles.iter().map(RoleView::from).collect()))
}

pub async fn create_role(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(scope): Path<String>,
    Json(payload): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleView>), AppError> {
    let scope = Scope::parse(&scope)?;
    let capabilities = CapabilitySet::parse(scope, &payload.capabilities)?;
    let role = state
        .registry
        .create(
            me.user.id,
            scope,
            &payload.role_name,
            &payload.role_description,
            capabilities,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(RoleView::from(&role))))
}

pub async fn get_role(
    State(state): State<Arc<AppState>>,
    Path((scope, role_id)): Path<(String, Uuid)>,
) -> Result<Json<RoleView>, AppError> {
    let role = state.registry.get(Scope::parse(&scope)?, role_id).await?;
    Ok(Json(RoleView::from(&role)))
}

pub async fn update_role(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((scope, role_id)): Path<(String, Uuid)>,
    Json(payload): Json<UpdateRoleRequest>,
) -> Result<Json<RoleView>, AppError> {
    let scope = Scope::parse(&scope)?;
    let capabilities = payload
        .capabilities
        .map(|caps| CapabilitySet::parse(scope, &caps))
        .transpose()?;
    let changes = RoleChanges {
        name: payload.role_name,
        description: payload.role_description,
        capabilities,
    };
    let role = state
        .registry
        .update(me.user.id, scope, role_id, changes)
        .await?;
    Ok(Json(RoleView::from(&role)))
}

pub async fn delete_role(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((scope, role_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .registry
        .delete(me.user.id, Scope::parse(&scope)?, role_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Access ───────────────────────────────────────────────────

async fn list_access(
    state: &AppState,
    actor: Uuid,
    scope: ScopeRef,
    page: Page,
) -> Result<Json<Vec<AccessView>>, AppError> {
    let grants = state.ledger.list(actor, scope, page).await?;
    Ok(Json(grants.iter().map(AccessView::from).collect()))
}

async fn grant_access(
    state: &AppState,
    actor: Uuid,
    scope: ScopeRef,
    payload: GrantRequest,
) -> Result<(StatusCode, Json<AccessView>), AppError> {
    let grant = state
        .ledger
        .grant(actor, payload.role_uuid, scope, payload.user_uuid)
        .await?;
    Ok((StatusCode::CREATED, Json(AccessView::from(&grant))))
}

pub async fn list_general_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<AccessView>>, AppError> {
    list_access(&state, me.user.id, ScopeRef::General, page).await
}

pub async fn grant_general_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<AccessView>), AppError> {
    grant_access(&state, me.user.id, ScopeRef::General, payload).await
}

pub async fn get_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(grant_id): Path<Uuid>,
) -> Result<Json<AccessView>, AppError> {
    let grant = state.ledger.get(me.user.id, grant_id).await?;
    Ok(Json(AccessView::from(&grant)))
}

pub async fn revoke_general_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(grant_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.ledger.revoke(me.user.id, grant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn general_capabilities(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
) -> Result<Json<CapabilitiesResponse>, AppError> {
    let held = state.evaluator.held(me.user.id, ScopeRef::General).await?;
    Ok(capabilities_response(Scope::General, held))
}

// ── Models ───────────────────────────────────────────────────

pub async fn create_model(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Json(payload): Json<CreateModelRequest>,
) -> Result<(StatusCode, Json<Model>), AppError> {
    let model = state
        .catalog
        .create_model(me.user.id, &payload.model_name, &payload.model_description)
        .await?;
    Ok((StatusCode::CREATED, Json(model)))
}

pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
) -> Result<Json<Model>, AppError> {
    Ok(Json(state.catalog.get_model(me.user.id, model_id).await?))
}

pub async fn finalize_model(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
) -> Result<Json<Model>, AppError> {
    Ok(Json(state.catalog.finalize_model(me.user.id, model_id).await?))
}

pub async fn model_capabilities(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
) -> Result<Json<CapabilitiesResponse>, AppError> {
    let held = state
        .evaluator
        .held(me.user.id, ScopeRef::Model(model_id))
        .await?;
    Ok(capabilities_response(Scope::Model, held))
}

pub async fn list_model_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<AccessView>>, AppError> {
    list_access(&state, me.user.id, ScopeRef::Model(model_id), page).await
}

pub async fn grant_model_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<AccessView>), AppError> {
    grant_access(&state, me.user.id, ScopeRef::Model(model_id), payload).await
}

pub async fn revoke_model_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, grant_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .ledger
        .revoke_on(me.user.id, ScopeRef::Model(model_id), grant_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Instances ────────────────────────────────────────────────

pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path(model_id): Path<Uuid>,
    Json(payload): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Instance>), AppError> {
    let instance = state
        .catalog
        .create_instance(
            me.user.id,
            model_id,
            &payload.instance_name,
            &payload.instance_description,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Instance>, AppError> {
    Ok(Json(
        state
            .catalog
            .get_instance(me.user.id, model_id, instance_id)
            .await?,
    ))
}

pub async fn finalize_instance(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Instance>, AppError> {
    Ok(Json(
        state
            .catalog
            .finalize_instance(me.user.id, model_id, instance_id)
            .await?,
    ))
}

pub async fn instance_capabilities(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<CapabilitiesResponse>, AppError> {
    // 404 for instances outside the model
    state
        .catalog
        .get_instance(me.user.id, model_id, instance_id)
        .await?;
    let held = state
        .evaluator
        .held(me.user.id, ScopeRef::Instance(instance_id))
        .await?;
    Ok(capabilities_response(Scope::Instance, held))
}

pub async fn list_instance_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((_model_id, instance_id)): Path<(Uuid, Uuid)>,
    Query(page): Query<Page>,
) -> Result<Json<Vec<AccessView>>, AppError> {
    list_access(&state, me.user.id, ScopeRef::Instance(instance_id), page).await
}

pub async fn grant_instance_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((_model_id, instance_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<GrantRequest>,
) -> Result<(StatusCode, Json<AccessView>), AppError> {
    grant_access(&state, me.user.id, ScopeRef::Instance(instance_id), payload).await
}

pub async fn revoke_instance_access(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((_model_id, instance_id, grant_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state
        .ledger
        .revoke_on(me.user.id, ScopeRef::Instance(instance_id), grant_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/model/:model_id/instance/:instance_id/merge
pub async fn merge_instances(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<MergeRequest>,
) -> Result<Json<MergeReport>, AppError> {
    state
        .catalog
        .get_instance(me.user.id, model_id, instance_id)
        .await?;
    let report = state
        .merge
        .merge(me.user.id, instance_id, &payload.sources)
        .await?;
    Ok(Json(report))
}

// ── Descriptors ──────────────────────────────────────────────

pub async fn add_descriptor(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<EntryRequest>,
) -> Result<(StatusCode, Json<Descriptor>), AppError> {
    let descriptor = state
        .catalog
        .add_descriptor(
            me.user.id,
            model_id,
            instance_id,
            &payload.key,
            payload.content.map(String::into_bytes),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

pub async fn list_descriptors(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<Descriptor>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_descriptors(me.user.id, model_id, instance_id)
            .await?,
    ))
}

pub async fn get_descriptor_file(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, descriptor_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let content = state
        .catalog
        .descriptor_file(me.user.id, model_id, instance_id, descriptor_id)
        .await?;
    Ok(file_response(content))
}

// ── Samples ──────────────────────────────────────────────────

pub async fn add_sample(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<Sample>), AppError> {
    let sample = state
        .catalog
        .add_sample(me.user.id, model_id, instance_id)
        .await?;
    Ok((StatusCode::CREATED, Json(sample)))
}

pub async fn list_samples(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<Sample>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_samples(me.user.id, model_id, instance_id)
            .await?,
    ))
}

pub async fn finalize_sample(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Sample>, AppError> {
    Ok(Json(
        state
            .catalog
            .finalize_sample(me.user.id, model_id, instance_id, sample_id)
            .await?,
    ))
}

pub async fn add_sample_data(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(payload): Json<EntryRequest>,
) -> Result<(StatusCode, Json<SampleData>), AppError> {
    let data = state
        .catalog
        .add_sample_data(
            me.user.id,
            model_id,
            instance_id,
            sample_id,
            &payload.key,
            payload.content.map(String::into_bytes),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(data)))
}

pub async fn list_sample_data(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Vec<SampleData>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_sample_data(me.user.id, model_id, instance_id, sample_id)
            .await?,
    ))
}

pub async fn get_sample_data_file(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id, data_id)): Path<(Uuid, Uuid, Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let content = state
        .catalog
        .sample_data_file(me.user.id, model_id, instance_id, sample_id, data_id)
        .await?;
    Ok(file_response(content))
}

pub async fn add_label(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(payload): Json<EntryRequest>,
) -> Result<(StatusCode, Json<SampleLabel>), AppError> {
    let label = state
        .catalog
        .add_label(
            me.user.id,
            model_id,
            instance_id,
            sample_id,
            &payload.key,
            payload.content.map(String::into_bytes),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(label)))
}

pub async fn list_labels(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Vec<SampleLabel>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_labels(me.user.id, model_id, instance_id, sample_id)
            .await?,
    ))
}

pub async fn tag_sample(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(payload): Json<TagRequest>,
) -> Result<(StatusCode, Json<SampleTag>), AppError> {
    let link = state
        .catalog
        .tag_sample(me.user.id, model_id, instance_id, sample_id, &payload.tag_name)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn list_sample_tags(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id, sample_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<Json<Vec<SampleTag>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_sample_tags(me.user.id, model_id, instance_id, sample_id)
            .await?,
    ))
}

pub async fn list_tags(
    State(state): State<Arc<AppState>>,
    Extension(me): Extension<Authenticated>,
    Path((model_id, instance_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<Tag>>, AppError> {
    Ok(Json(
        state
            .catalog
            .list_tags(me.user.id, model_id, instance_id)
            .await?,
    ))
}
