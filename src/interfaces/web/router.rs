use axum::{
    Router,
    http::Method,
    routing::get,
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{auth, user};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_origin(tower_http::cors::Any);

    Router::new()
        .route("/auth/{provider}/login", get(auth::begin_login))
        .route("/auth/{provider}/authorized", get(auth::complete_login))
        .route("/logout", get(auth::logout))
        .route("/api/me", get(user::me))
        .route("/api/auth/providers", get(auth::list_providers))
        .layer(cors)
        .with_state(state)
}
