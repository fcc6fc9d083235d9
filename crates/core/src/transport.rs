//! Transport Adapter
//!
//! Uniform async request/response operations against the remote service. A
//! non-success status is a normal `ApiResponse`; only failures to complete the
//! exchange at all surface as errors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;

/// Host of the remote service plus whether to use its secure variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    host: String,
    secure: bool,
}

impl ServiceEndpoint {
    /// `host` is `host[:port][/prefix]`, without a scheme.
    pub fn new(host: impl Into<String>, secure: bool) -> Self {
        let host = host.into().trim_end_matches('/').to_string();
        Self { host, secure }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Base URL for request/response calls, always ending in `/`.
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}/", scheme, self.host)
    }

    /// Streaming URL for the given relative path.
    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}/{}", scheme, self.host, path.trim_start_matches('/'))
    }
}

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A file to send as one part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Request/response calls the session client depends on.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Issues `GET {base}{path}`.
    async fn get(&self, path: &str) -> Result<ApiResponse>;

    /// Issues `POST {base}{path}` with one multipart part named `field` per file.
    async fn post_multipart(
        &self,
        path: &str,
        field: &str,
        files: Vec<UploadFile>,
    ) -> Result<ApiResponse>;
}

/// An `ApiTransport` over HTTP using `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

impl HttpTransport {
    pub fn new(endpoint: &ServiceEndpoint) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            client,
            base: endpoint.http_base(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }

    async fn into_api_response(response: reqwest::Response) -> Result<ApiResponse> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;
        Ok(ApiResponse { status, body })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn get(&self, path: &str) -> Result<ApiResponse> {
        let url = self.url(path);
        debug!(%url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        Self::into_api_response(response).await
    }

    async fn post_multipart(
        &self,
        path: &str,
        field: &str,
        files: Vec<UploadFile>,
    ) -> Result<ApiResponse> {
        let url = self.url(path);
        debug!(%url, parts = files.len(), "POST multipart");
        let mut form = Form::new();
        for file in files {
            form = form.part(
                field.to_string(),
                Part::bytes(file.bytes).file_name(file.file_name),
            );
        }
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;
        Self::into_api_response(response).await
    }
}
