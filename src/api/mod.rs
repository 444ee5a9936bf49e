use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::AppState;

pub mod handlers;

/// Full application: health probe plus the API under `/api`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api", api_router(state.clone()))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Build the API router. Everything except `/login` requires a session token.
pub fn api_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let protected = Router::new()
        .route("/logout", post(handlers::logout))
        .route(
            "/user",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/user/:user_id",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        .route(
            "/userroles/:scope",
            get(handlers::list_roles).post(handlers::create_role),
        )
        .route(
            "/userroles/:scope/:role_id",
            get(handlers::get_role)
                .put(handlers::update_role)
                .delete(handlers::delete_role),
        )
        .route(
            "/access",
            get(handlers::list_general_access).post(handlers::grant_general_access),
        )
        .route(
            "/access/:grant_id",
            get(handlers::get_access).delete(handlers::revoke_general_access),
        )
        .route("/capabilities", get(handlers::general_capabilities))
        // Models
        .route("/model", post(handlers::create_model))
        .route("/model/:model_id", get(handlers::get_model))
        .route("/model/:model_id/finalize", post(handlers::finalize_model))
        .route(
            "/model/:model_id/capabilities",
            get(handlers::model_capabilities),
        )
        .route(
            "/model/:model_id/access",
            get(handlers::list_model_access).post(handlers::grant_model_access),
        )
        .route(
            "/model/:model_id/access/:grant_id",
            delete(handlers::revoke_model_access),
        )
        // Instances
        .route(
            "/model/:model_id/instance",
            post(handlers::create_instance),
        )
        .route(
            "/model/:model_id/instance/:instance_id",
            get(handlers::get_instance),
        )
        .route(
            "/model/:model_id/instance/:instance_id/finalize",
            post(handlers::finalize_instance),
        )
        .route(
            "/model/:model_id/instance/:instance_id/capabilities",
            get(handlers::instance_capabilities),
        )
        .route(
            "/model/:model_id/instance/:instance_id/access",
            get(handlers::list_instance_access).post(handlers::grant_instance_access),
        )
        .route(
            "/model/:model_id/instance/:instance_id/access/:grant_id",
            delete(handlers::revoke_instance_access),
        )
        .route(
            "/model/:model_id/instance/:instance_id/merge",
            post(handlers::merge_instances),
        )
        // Instance content
        .route(
            "/model/:model_id/instance/:instance_id/descriptor",
            get(handlers::list_descriptors).post(handlers::add_descriptor),
        )
        .route(
            "/model/:model_id/instance/:instance_id/descriptor/:descriptor_id/file",
            get(handlers::get_descriptor_file),
        )
        .route(
            "/model/:model_id/instance/:instance_id/tag",
            get(handlers::list_tags),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample",
            get(handlers::list_samples).post(handlers::add_sample),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample/:sample_id/finalize",
            post(handlers::finalize_sample),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample/:sample_id/data",
            get(handlers::list_sample_data).post(handlers::add_sample_data),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample/:sample_id/data/:data_id/file",
            get(handlers::get_sample_data_file),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample/:sample_id/label",
            get(handlers::list_labels).post(handlers::add_label),
        )
        .route(
            "/model/:model_id/instance/:instance_id/sample/:sample_id/tag",
            get(handlers::list_sample_tags).post(handlers::tag_sample),
        )
        .route_layer(middleware::from_fn_with_state(state, session_auth));

    Router::new()
        .route("/login", post(handlers::login))
        .merge(protected)
        .fallback(fallback_404)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: resolves the `Authorization` header to a user and attaches
/// the result as a request extension. Tokens inside the renewal window are
/// extended on the way.
async fn session_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let raw = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let principal = match state.auth.resolve(raw.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            if e.is_auth_failure() {
                tracing::warn!(path = %req.uri().path(), "API: {}", e);
            }
            return Err(e);
        }
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}
