pub mod health;
pub mod notifications;
pub mod web;

use std::path::Path;

use axum::Router;

use crate::state::AppState;

fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(notifications::router())
}

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    api_routes().with_state(state)
}

/// API routes plus the browser UI served from `web_dir`.
pub fn create_router_with_ui(state: AppState, web_dir: &Path) -> Router {
    api_routes().merge(web::router(web_dir)).with_state(state)
}
