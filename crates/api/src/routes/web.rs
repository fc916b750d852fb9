//! Browser UI: `index.html` at `/`, assets under `/static`.

use std::path::Path;

use axum::Router;
use tower_http::services::{ServeDir, ServeFile};

use crate::state::AppState;

pub fn router(web_dir: &Path) -> Router<AppState> {
    Router::new()
        .route_service("/", ServeFile::new(web_dir.join("index.html")))
        .nest_service("/static", ServeDir::new(web_dir.join("static")))
}
