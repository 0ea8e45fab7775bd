//! Low-level request capability shared by every component.
//!
//! Wraps an injected `reqwest::Client` with the headers Twitch's GQL
//! endpoint expects, persisted-query request building, bounded retry with
//! linear backoff, and status-code classification.

use std::time::Duration;

use rand::RngExt;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use crate::error::TwitchApiError;

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";

/// Default client id accepted for non-authenticated web clients.
const CLIENT_ID: &str = "ue6666qo983tsx6so1t0vnawi233wa";

/// Attempts per request, including the first.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts; scaled linearly by attempt number.
const RETRY_DELAY: Duration = Duration::from_secs(1);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    headers: HeaderMap,
}

impl ApiClient {
    /// The client is an injected dependency so that all components share one
    /// connection pool and tests can supply their own.
    pub fn new(client: Client) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("Client-Id", HeaderValue::from_static(CLIENT_ID));
        if let Ok(device_id) = HeaderValue::from_str(&Self::device_id()) {
            headers.insert("Device-Id", device_id);
        }
        Self { client, headers }
    }

    pub fn with_oauth_token(mut self, token: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(&format!("OAuth {token}")) {
            self.headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        self
    }

    fn device_id() -> String {
        // random 16-digit device id
        rand::rng()
            .random_range(1_000_000_000_000_000_i64..9_999_999_999_999_999_i64)
            .to_string()
    }

    fn classify(status: StatusCode, url: &str) -> Result<(), TwitchApiError> {
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TwitchApiError::NotFound {
                url: url.to_string(),
            }),
            StatusCode::FORBIDDEN => Err(TwitchApiError::Forbidden {
                url: url.to_string(),
            }),
            s => Err(TwitchApiError::HttpStatus {
                status: s,
                url: url.to_string(),
            }),
        }
    }

    /// GET returning the response body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, TwitchApiError> {
        self.get_text_with_params(url, &[]).await
    }

    pub async fn get_text_with_params(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<String, TwitchApiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .client
                    .get(url)
                    .headers(self.headers.clone())
                    .query(params)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await?;
                Self::classify(response.status(), url)?;
                Ok::<_, TwitchApiError>(response.text().await?)
            }
            .await;

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(url, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET returning the raw response body.
    pub async fn get_bytes(&self, url: &str) -> Result<bytes::Bytes, TwitchApiError> {
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::classify(response.status(), url)?;
        Ok(response.bytes().await?)
    }

    /// POSTs one or more GQL operations, parsing the response as a list.
    /// Twitch answers single-operation posts with a bare object; both shapes
    /// are accepted.
    pub async fn post_gql<T>(&self, body: serde_json::Value) -> Result<Vec<T>, TwitchApiError>
    where
        T: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                let response = self
                    .client
                    .post(GQL_URL)
                    .headers(self.headers.clone())
                    .json(&body)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await?;
                Self::classify(response.status(), GQL_URL)?;
                Ok::<_, TwitchApiError>(response.text().await?)
            }
            .await;

            match result {
                Ok(text) => {
                    trace!(len = text.len(), "GQL response received");
                    return match serde_json::from_str::<Vec<T>>(&text) {
                        Ok(responses) => Ok(responses),
                        Err(_) => {
                            let single: T = serde_json::from_str(&text).map_err(|e| {
                                debug!("GQL body: {text}");
                                TwitchApiError::parse("GQL response", e.to_string())
                            })?;
                            Ok(vec![single])
                        }
                    };
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "GQL request failed, retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builds a persisted-query GQL operation body.
pub fn persisted_query(
    operation_name: &str,
    sha256_hash: &str,
    variables: serde_json::Value,
) -> serde_json::Value {
    serde_json::json!({
        "operationName": operation_name,
        "extensions": {
            "persistedQuery": {
                "version": 1,
                "sha256Hash": sha256_hash,
            }
        },
        "variables": variables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_sixteen_digits() {
        let id = ApiClient::device_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn classify_maps_status_codes() {
        assert!(ApiClient::classify(StatusCode::OK, "u").is_ok());
        assert!(matches!(
            ApiClient::classify(StatusCode::NOT_FOUND, "u"),
            Err(TwitchApiError::NotFound { .. })
        ));
        assert!(matches!(
            ApiClient::classify(StatusCode::FORBIDDEN, "u"),
            Err(TwitchApiError::Forbidden { .. })
        ));
        assert!(matches!(
            ApiClient::classify(StatusCode::INTERNAL_SERVER_ERROR, "u"),
            Err(TwitchApiError::HttpStatus { .. })
        ));
    }

    #[test]
    fn persisted_query_shape() {
        let body = persisted_query("Op", "abc123", serde_json::json!({"login": "name"}));
        assert_eq!(body["operationName"], "Op");
        assert_eq!(body["extensions"]["persistedQuery"]["sha256Hash"], "abc123");
        assert_eq!(body["variables"]["login"], "name");
    }

    #[test]
    fn gone_errors_are_not_retryable() {
        let e = TwitchApiError::NotFound { url: "u".into() };
        assert!(e.is_gone());
        assert!(!e.is_retryable());
        let e = TwitchApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            url: "u".into(),
        };
        assert!(!e.is_gone());
        assert!(e.is_retryable());
    }
}
