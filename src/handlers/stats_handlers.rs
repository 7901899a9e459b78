//! `GET /stats` and `GET /diff`.

use crate::{
    errors::AppError,
    models::stats::{DiffReport, StatsReport},
    services::file_server::FileServer,
};
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub prefix: Option<String>,
}

pub async fn stats(State(server): State<FileServer>) -> Result<Json<StatsReport>, AppError> {
    Ok(Json(server.stats().await?))
}

pub async fn diff(
    State(server): State<FileServer>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffReport>, AppError> {
    let prefix = query.prefix.unwrap_or_default();
    Ok(Json(server.diff(&prefix).await?))
}
