use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::handlers;

/// Create panel routes
pub fn panel_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Scoped file manager
        .route("/sites/{site}/files", get(handlers::list_files))
        .route(
            "/sites/{site}/files/upload",
            // Per-file limits are enforced while the body is read.
            post(handlers::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route("/sites/{site}/files/folder", post(handlers::create_folder))
        .route("/sites/{site}/files/rename", post(handlers::rename_item))
        .route("/sites/{site}/files/delete", post(handlers::delete_items))
        .route("/sites/{site}/files/copy", post(handlers::copy_items))
        .route("/sites/{site}/files/move", post(handlers::move_items))
        // Live logs
        .route("/logs/{service}/stream", get(handlers::stream_logs))
}

/// Build the complete application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(panel_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
