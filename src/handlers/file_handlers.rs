//! HTTP command dispatch for file paths.
//!
//! The method plus the optional `x-command` header select the operation:
//!
//! | method   | command   | operation                         |
//! |----------|-----------|-----------------------------------|
//! | `GET`    |           | load (also `HEAD`)                |
//! | `GET`    | `local`   | load without the bucket fallback  |
//! | `GET`    | `ls`      | list paths below the prefix       |
//! | `POST`   |           | save the body                     |
//! | `POST`   | `extract` | unpack a tar+gzip body            |
//! | `DELETE` |           | delete one file                   |
//! | `DELETE` | `rmdir`   | delete a directory tree           |

use crate::{
    errors::AppError,
    services::{
        file_client::COMMAND_HEADER,
        file_server::{FileServer, LoadedObject, ObjectBody},
        local_store::LocalStore,
    },
    models::object::content_type_for,
};
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::percent_decode_str;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Format used for `Last-Modified`.
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[instrument(skip_all, fields(method = %method, path = %uri.path()))]
pub async fn dispatch(
    State(server): State<FileServer>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let path = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|_| AppError::bad_request("path is not valid UTF-8"))?;
    let path = LocalStore::normalize(&path)?;
    let command = match headers.get(COMMAND_HEADER) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| AppError::bad_request("invalid command header"))?
                .trim()
                .to_ascii_lowercase(),
        ),
        None => None,
    }
    .filter(|c| !c.is_empty());

    match (method.as_str(), command.as_deref()) {
        ("GET" | "HEAD", None) => load(&server, &path, &headers, Tiers::Both).await,
        ("GET" | "HEAD", Some("local")) => load(&server, &path, &headers, Tiers::LocalOnly).await,
        ("GET", Some("ls")) => ls(&server, &path).await,
        ("POST", None) => save(&server, &path, body).await,
        ("POST", Some("extract")) => extract(&server, &path, body).await,
        ("DELETE", None) => {
            let path = server.delete(&path).await?;
            Ok(format!("{} deleted", path).into_response())
        }
        ("DELETE", Some("rmdir")) => {
            let path = server.rmdir(&path).await?;
            Ok(format!("{} deleted", path).into_response())
        }
        ("GET" | "HEAD" | "POST" | "DELETE", Some(other)) => Err(AppError::bad_request(format!(
            "unknown command `{}` for {}",
            other, method
        ))),
        _ => Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {} not allowed", method),
        )),
    }
}

fn body_stream(body: Body) -> impl futures::Stream<Item = io::Result<bytes::Bytes>> + Send + 'static {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
}

#[derive(Clone, Copy)]
enum Tiers {
    Both,
    LocalOnly,
}

async fn load(
    server: &FileServer,
    path: &str,
    headers: &HeaderMap,
    tiers: Tiers,
) -> Result<Response, AppError> {
    let found = match tiers {
        Tiers::Both => server.load(path).await?,
        Tiers::LocalOnly => server.load_local(path).await?,
    };
    let Some(object) = found else {
        return Err(AppError::not_found());
    };

    let since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);
    if let (Some(since), Some(modified)) = (since, object.last_modified) {
        if !is_modified_since(modified, since) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            set_last_modified(response.headers_mut(), modified);
            return Ok(response);
        }
    }

    Ok(object_response(object))
}

fn object_response(object: LoadedObject) -> Response {
    let body = match object.body {
        ObjectBody::File(file) => Body::from_stream(ReaderStream::new(file)),
        ObjectBody::Bytes(bytes) => Body::from(bytes),
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&object.path)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes));
    if let Some(modified) = object.last_modified {
        set_last_modified(headers, modified);
    }
    response
}

fn set_last_modified(headers: &mut HeaderMap, modified: DateTime<Utc>) {
    if let Ok(value) = HeaderValue::from_str(&format_http_date(modified)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE).to_string()
}

pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// HTTP dates have whole-second precision, so the modification time is
/// truncated before comparing.
fn is_modified_since(modified: DateTime<Utc>, since: DateTime<Utc>) -> bool {
    modified.timestamp() > since.timestamp()
}

async fn ls(server: &FileServer, path: &str) -> Result<Response, AppError> {
    let paths = server.ls(path).await?;
    if paths.is_empty() {
        return Err(AppError::not_found());
    }
    Ok(Json(paths).into_response())
}

async fn save(server: &FileServer, path: &str, body: Body) -> Result<Response, AppError> {
    server.save(path, body_stream(body)).await?;
    Ok("saved".into_response())
}

async fn extract(server: &FileServer, path: &str, body: Body) -> Result<Response, AppError> {
    server.extract(path, body_stream(body)).await?;
    Ok(format!("{} archive extracted", path).into_response())
}
