//! Health & readiness handlers.
//!
//! - GET /ping    -> liveness, plain `pong`
//! - GET /readyz  -> readiness that checks the queue database and disk I/O

use crate::services::file_server::FileServer;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;

/// `GET /ping`
///
/// Never performs I/O.
pub async fn ping() -> &'static str {
    "pong"
}

/// `GET /readyz`
///
/// 1. Runs `SELECT 1` against the queue database.
/// 2. Writes, reads back and deletes a scratch file under the local root.
///
/// HTTP 200 when both pass, 503 otherwise, with a JSON entry per check.
pub async fn readyz(State(server): State<FileServer>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(server.queue.pool())
        .await
    {
        Ok(1) => CheckStatus::ok(),
        Ok(v) => CheckStatus::failed(format!("unexpected result: {}", v)),
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    };

    let probe = server.local.scratch_path("readyz");
    let disk_check = match fs::write(&probe, b"readyz").await {
        Ok(()) => {
            let check = match fs::read(&probe).await {
                Ok(bytes) if bytes == b"readyz" => CheckStatus::ok(),
                Ok(_) => CheckStatus::failed("probe content mismatch".to_string()),
                Err(e) => CheckStatus::failed(format!("could not read probe: {}", e)),
            };
            if let Err(e) = fs::remove_file(&probe).await {
                tracing::warn!(path = %probe.display(), error = %e, "could not remove readiness probe");
            }
            check
        }
        Err(e) => CheckStatus::failed(format!("could not write probe: {}", e)),
    };

    let overall_ok = sqlite_check.ok && disk_check.ok;
    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite_check);
    checks.insert("disk", disk_check);

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl CheckStatus {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}
