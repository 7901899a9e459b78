//! Caller-side HTTP client for the file server.
//!
//! Each method is one request to the matching command. Workers use it as a
//! [`ContentSource`] when they run on a different host than the file server.

use crate::{
    jobs::ContentSource,
    models::stats::{DiffReport, StatsReport},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header::HeaderMap};
use std::time::Duration;

/// Header selecting a non-default command for a method.
pub const COMMAND_HEADER: &str = "x-command";

/// Outcome of a `load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadResponse {
    Found {
        body: Bytes,
        content_type: Option<String>,
        last_modified: Option<String>,
    },
    NotModified,
    NotFound,
}

impl LoadResponse {
    pub fn into_body(self) -> Option<Bytes> {
        match self {
            LoadResponse::Found { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileStoreClient {
    client: Client,
    base_url: String,
}

impl FileStoreClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| {
                percent_encoding::utf8_percent_encode(segment, PATH_SEGMENT).to_string()
            })
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn request(&self, method: Method, path: &str, command: Option<&str>) -> RequestBuilder {
        let request = self.client.request(method, self.url(path));
        match command {
            Some(command) => request.header(COMMAND_HEADER, command),
            None => request,
        }
    }

    async fn send(request: RequestBuilder) -> Result<Response> {
        request.send().await.context("Failed to send request")
    }

    /// Turn a non-success status into an error carrying the response body.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(anyhow!(
            "file server request failed with status {}: {}",
            status,
            error_text
        ))
    }

    async fn text(request: RequestBuilder) -> Result<String> {
        let response = Self::check(Self::send(request).await?).await?;
        response.text().await.context("Failed to read response body")
    }

    pub async fn ping(&self) -> Result<String> {
        Self::text(self.client.get(format!("{}/ping", self.base_url))).await
    }

    /// Paths under `path`, relative to it. `None` when nothing is stored there.
    pub async fn ls(&self, path: &str) -> Result<Option<Vec<String>>> {
        let response = Self::send(self.request(Method::GET, path, Some("ls"))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let paths: Vec<String> = Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response as JSON")?;
        Ok(Some(paths))
    }

    /// Fetch a file. Extra headers (e.g. `If-Modified-Since`) are passed through.
    pub async fn load(&self, path: &str, headers: Option<HeaderMap>) -> Result<LoadResponse> {
        let mut request = self.request(Method::GET, path, None);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        let response = Self::send(request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(LoadResponse::NotFound),
            StatusCode::NOT_MODIFIED => return Ok(LoadResponse::NotModified),
            _ => {}
        }
        let response = Self::check(response).await?;
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let last_modified = header(reqwest::header::LAST_MODIFIED);
        let body = response
            .bytes()
            .await
            .context("Failed to read response body")?;
        Ok(LoadResponse::Found {
            body,
            content_type,
            last_modified,
        })
    }

    /// Fetch a file from the server's local tier only, never the bucket.
    pub async fn load_local(&self, path: &str) -> Result<Option<Bytes>> {
        let response = Self::send(self.request(Method::GET, path, Some("local"))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::check(response)
            .await?
            .bytes()
            .await
            .context("Failed to read response body")?;
        Ok(Some(body))
    }

    pub async fn save(
        &self,
        path: &str,
        content: impl Into<reqwest::Body>,
        headers: Option<HeaderMap>,
    ) -> Result<String> {
        let mut request = self.request(Method::POST, path, None).body(content);
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        Self::text(request).await
    }

    /// Upload a tar+gzip archive to be unpacked under `path`.
    pub async fn extract(&self, path: &str, archive: impl Into<reqwest::Body>) -> Result<String> {
        Self::text(
            self.request(Method::POST, path, Some("extract"))
                .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                .body(archive),
        )
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<String> {
        Self::text(self.request(Method::DELETE, path, None)).await
    }

    pub async fn rmdir(&self, path: &str) -> Result<String> {
        Self::text(self.request(Method::DELETE, path, Some("rmdir"))).await
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        let response =
            Self::check(Self::send(self.client.get(format!("{}/stats", self.base_url))).await?)
                .await?;
        response.json().await.context("Failed to parse response as JSON")
    }

    pub async fn diff(&self, prefix: Option<&str>) -> Result<DiffReport> {
        let mut request = self.client.get(format!("{}/diff", self.base_url));
        if let Some(prefix) = prefix {
            request = request.query(&[("prefix", prefix)]);
        }
        let response = Self::check(Self::send(request).await?).await?;
        response.json().await.context("Failed to parse response as JSON")
    }
}

/// Characters escaped inside one path segment.
const PATH_SEGMENT: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[async_trait]
impl ContentSource for FileStoreClient {
    async fn fetch(&self, path: &str) -> Result<Option<Bytes>> {
        self.load_local(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_escapes_segments_but_keeps_slashes() {
        let client = FileStoreClient::new("http://localhost:3000/").unwrap();
        assert_eq!(
            client.url("/games/my game (1)/index.html"),
            "http://localhost:3000/games/my%20game%20(1)/index.html"
        );
        assert_eq!(client.url("a%b?c"), "http://localhost:3000/a%25b%3Fc");
    }
}
