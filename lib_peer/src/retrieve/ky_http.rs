//! # HTTP Retrieval Utilities
//!
//! A small asynchronous client around `reqwest`, with exponential backoff
//! retries for transient failures and JSON bodies in both directions. The
//! signaling client, the netstate reporter and the candidate source all
//! share it.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{ConfigError, LinkError};

/// Retries applied to transient failures (connect errors, 5xx, 429).
const MAX_RETRIES: u32 = 3;

/// A response with its body decoded, when there was one.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The deserialized body. `None` for an empty body or a failed request.
    pub data: Option<T>,
    /// The raw body returned by the server if the request failed.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
}

/// A retrying HTTP client bound to a base URL.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Creates a client whose requests are resolved against `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        Ok(Self::with_client(parse_base(base_url)?, reqwest::Client::new()))
    }

    fn with_client(base_url: Url, client: reqwest::Client) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let inner = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self { inner, base_url }
    }

    /// Sends `body` as JSON to `path` and decodes a JSON reply, if any.
    pub async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<ApiResponse<T>, LinkError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| LinkError::Signaling(format!("bad path '{path}': {e}")))?;
        let mut req = self.inner.request(method, full_url);

        if let Some(b) = body {
            let json_body = serde_json::to_string(b).map_err(|e| LinkError::Signaling(e.to_string()))?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response = req.send().await?;
        let status = response.status();

        if status.is_success() {
            let raw = response.bytes().await?;
            let data = if raw.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(serde_json::from_slice::<T>(&raw).map_err(|e| LinkError::Signaling(format!("undecodable reply: {e}")))?)
            };
            Ok(ApiResponse {
                data,
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
            })
        }
    }

    /// Fetches `path` as plain text.
    pub async fn get_text(&self, path: &str) -> Result<String, LinkError> {
        let full_url = self
            .base_url
            .join(path)
            .map_err(|e| LinkError::Candidates(format!("bad path '{path}': {e}")))?;
        let response = self.inner.get(full_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LinkError::Candidates(format!("server answered {status}")));
        }
        Ok(response.text().await?)
    }
}

fn parse_base(base_url: &str) -> Result<Url, ConfigError> {
    Url::parse(base_url).map_err(|source| ConfigError::InvalidUrl {
        url: base_url.to_string(),
        source,
    })
}
