//! One-shot HTTP client for price feed snapshot queries.
//!
//! This surface is stateless request/response with bounded retries; the
//! resilient subscription session lives in [`crate::stream`].

use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use crate::feed::{FeedId, PriceFeed};
use crate::retry::{retry_async, with_timeout, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FeedApiDefaults;

impl FeedApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(50);
    pub const JITTER: Duration = Duration::from_millis(25);
}

/// Timeout and retry configuration for [`FeedApiClient`].
#[derive(Clone, Debug)]
pub struct FeedApiOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for FeedApiOptions {
    fn default() -> Self {
        Self {
            connect_timeout: FeedApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: FeedApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: FeedApiDefaults::MAX_ATTEMPTS,
                initial_backoff: FeedApiDefaults::BACKOFF,
                max_backoff: FeedApiDefaults::BACKOFF,
                jitter: FeedApiDefaults::JITTER,
            },
        }
    }
}

/// HTTP client for one-shot snapshot queries.
#[derive(Clone)]
pub struct FeedApiClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl FeedApiClient {
    /// Creates a client for the given base URL with default options.
    pub fn new(base_url: impl Into<String>) -> Result<Self, FeedApiError> {
        Self::with_options(base_url, FeedApiOptions::default())
    }

    /// Creates a client with explicit timeout and retry configuration.
    pub fn with_options(
        base_url: impl Into<String>,
        options: FeedApiOptions,
    ) -> Result<Self, FeedApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(FeedApiError::Transport)?;

        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key: None,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Sets the API key sent as an `x-api-key` header.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Fetches the latest snapshot for the given feed ids.
    ///
    /// `verbose` asks the server to include feed metadata in the response.
    pub async fn latest_price_feeds(
        &self,
        ids: &[impl AsRef<str>],
        verbose: bool,
    ) -> Result<Vec<PriceFeed>, FeedApiError> {
        let mut query: Vec<(&str, String)> = ids
            .iter()
            .map(|id| ("ids[]", FeedId::new(id).as_str().to_string()))
            .collect();
        query.push(("verbose", verbose.to_string()));

        let body = self.get("/api/latest_price_feeds", &query).await?;
        let values: Vec<Value> =
            serde_json::from_str(&body).map_err(|error| FeedApiError::Parse(error.to_string()))?;
        values
            .into_iter()
            .map(|value| {
                PriceFeed::from_json(value).map_err(|error| FeedApiError::Parse(error.to_string()))
            })
            .collect()
    }

    /// Fetches every feed id known to the service.
    pub async fn price_feed_ids(&self) -> Result<Vec<FeedId>, FeedApiError> {
        let body = self.get("/api/price_feed_ids", &[]).await?;
        serde_json::from_str(&body).map_err(|error| FeedApiError::Parse(error.to_string()))
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String, FeedApiError> {
        let endpoint = format!("{}{}", self.base_url, path);
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.send_attempt(&endpoint, query).await }
            },
            FeedApiError::is_retryable,
        )
        .await
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<String, FeedApiError> {
        let mut builder = self.http.get(endpoint).query(query);
        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = with_timeout(self.attempt_timeout, builder.send())
            .await
            .map_err(|_| FeedApiError::AttemptTimeout)?
            .map_err(FeedApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(FeedApiError::Transport)?;

        if !status.is_success() {
            return Err(FeedApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

/// Errors produced by the snapshot API client.
#[derive(Debug, Error)]
pub enum FeedApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("request attempt timed out")]
    AttemptTimeout,

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl FeedApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_timeout() || error.is_connect(),
            Self::AttemptTimeout => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{summarize_error_body, FeedApiClient, FeedApiError, FeedApiOptions};

    #[test]
    fn base_url_is_trimmed() {
        let client = FeedApiClient::with_options(
            "https://feeds.example.dev/  \n",
            FeedApiOptions::default(),
        )
        .expect("build client");
        assert_eq!(client.base_url, "https://feeds.example.dev");
    }

    #[test]
    fn error_body_summary_prefers_error_field() {
        let summary = summarize_error_body(r#"{"error":"bad ids","detail":"x"}"#);
        assert_eq!(summary, "bad ids");
    }

    #[test]
    fn error_body_summary_falls_back_to_snippet() {
        let summary = summarize_error_body("plain text failure");
        assert_eq!(summary, "plain text failure");
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        let throttled = FeedApiError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: String::new(),
        };
        assert!(throttled.is_retryable());

        let server_error = FeedApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(server_error.is_retryable());

        let not_found = FeedApiError::HttpStatus {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(!not_found.is_retryable());
        assert!(!FeedApiError::Parse("bad".to_string()).is_retryable());
        assert!(FeedApiError::AttemptTimeout.is_retryable());
    }
}
