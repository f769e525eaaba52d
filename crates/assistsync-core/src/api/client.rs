//! HTTP client for the assistant data service.
//!
//! Resource layout:
//! - `GET    {base}/entities/{key}` fetch the authoritative record
//! - `POST   {base}/entities`       create
//! - `PUT    {base}/entities/{key}` update (`If-Match` carries the base version)
//! - `DELETE {base}/entities/{key}` delete
//!
//! The record version travels in the `ETag` header, or in the `version`
//! body field when the server does not send one.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::models::{MutationKind, PendingMutation};

use super::{ApiError, RemoteAck, RemoteApi, RemoteRecord};

/// HTTP request timeout in seconds
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Collection path segment for all entities
const ENTITIES_PATH: &str = "entities";

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBody<'a> {
    key: &'a str,
    payload: &'a Value,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    payload: &'a Value,
}

/// REST client for the remote service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid base URL: {}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Base URL cannot carry a path: {}", base_url);
        }

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Set the bearer token for authenticated requests
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn collection_url(&self) -> Url {
        self.url_with_segments(&[ENTITIES_PATH])
    }

    /// Keys are pushed as a single path segment, so `/` and other reserved
    /// characters are percent-encoded.
    fn entity_url(&self, key: &str) -> Url {
        self.url_with_segments(&[ENTITIES_PATH, key])
    }

    fn url_with_segments(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Check if response is successful, returning a classified error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    fn etag(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
    }

    /// Read the version from the ETag header, falling back to the body.
    async fn read_record(response: Response) -> Result<RemoteRecord, ApiError> {
        let etag = Self::etag(&response);
        let text = response.text().await?;
        let wire: WireRecord = if text.trim().is_empty() {
            WireRecord {
                payload: Value::Null,
                version: None,
            }
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))?
        };
        Ok(RemoteRecord {
            payload: wire.payload,
            version: etag.or(wire.version),
        })
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn fetch(&self, key: &str) -> Result<Option<RemoteRecord>, ApiError> {
        let url = self.entity_url(key);
        debug!(%url, "GET entity");

        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check_response(response).await?;
        Self::read_record(response).await.map(Some)
    }

    async fn push(
        &self,
        mutation: &PendingMutation,
        if_match: Option<&str>,
    ) -> Result<RemoteAck, ApiError> {
        let builder = match mutation.kind {
            MutationKind::Create => self.request(Method::POST, self.collection_url()).json(&CreateBody {
                key: &mutation.key,
                payload: &mutation.payload,
            }),
            MutationKind::Update => self
                .request(Method::PUT, self.entity_url(&mutation.key))
                .json(&UpdateBody {
                    payload: &mutation.payload,
                }),
            MutationKind::Delete => self.request(Method::DELETE, self.entity_url(&mutation.key)),
        };
        let builder = match if_match {
            Some(version) => builder.header(header::IF_MATCH, format!("\"{}\"", version)),
            None => builder,
        };

        debug!(key = %mutation.key, kind = %mutation.kind, id = mutation.id, "Pushing mutation");
        let response = builder.send().await?;

        // Deleting something that is already gone is what we wanted anyway
        if mutation.kind == MutationKind::Delete && response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteAck { version: None });
        }

        let response = Self::check_response(response).await?;
        if mutation.kind == MutationKind::Delete {
            return Ok(RemoteAck { version: None });
        }
        let record = Self::read_record(response).await?;
        Ok(RemoteAck {
            version: record.version,
        })
    }
}
