//! Routes of the file server.
//!
//! ## Structure
//! - **Fixed endpoints** (take precedence over file paths)
//!   - `GET /ping`   liveness
//!   - `GET /readyz` readiness
//!   - `GET /stats`  local and bucket totals
//!   - `GET /diff`   paths present in only one tier (`?prefix=`)
//!
//! - **File paths**: every other path, any method, dispatched on the method
//!   and the `x-command` header (see `handlers::file_handlers`).

use crate::{
    handlers::{
        file_handlers::dispatch,
        health_handlers::{ping, readyz},
        stats_handlers::{diff, stats},
    },
    services::file_server::FileServer,
};
use axum::{
    Router,
    routing::{any, get},
};

/// Build the router. The state (`FileServer`) is supplied by the caller.
pub fn routes() -> Router<FileServer> {
    Router::new()
        .route("/ping", get(ping))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        .route("/diff", get(diff))
        .route("/", any(dispatch))
        .route("/{*path}", any(dispatch))
}

/// Router with state attached, ready to serve.
pub fn app(server: FileServer) -> Router {
    routes().with_state(server)
}
