//! JSON-over-HTTP calls to model APIs with retry and backoff.
//!
//! Shared by the embedding, rerank, conflict and generation providers:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use std::time::Duration;

/// Build a client with the provider's request timeout.
pub fn client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Read a bearer token from the named environment variable.
pub fn api_key(env_var: Option<&str>) -> Result<Option<String>> {
    match env_var {
        None => Ok(None),
        Some(var) => match std::env::var(var) {
            Ok(key) => Ok(Some(key)),
            Err(_) => bail!("{} environment variable not set", var),
        },
    }
}

/// POST `body` to `url` and return the parsed JSON response.
///
/// `label` names the remote service in error messages.
pub async fn post_json(
    client: &reqwest::Client,
    label: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(label, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", label)))
}

/// Read a JSON array of numbers as `f32`s.
pub fn as_f32_vec(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_f32_vec() {
        let v = serde_json::json!([1, 0.5, -2]);
        assert_eq!(as_f32_vec(&v), Some(vec![1.0, 0.5, -2.0]));
        assert_eq!(as_f32_vec(&serde_json::json!([1, "x"])), None);
        assert_eq!(as_f32_vec(&serde_json::json!("nope")), None);
    }

    #[test]
    fn test_api_key_missing_var() {
        let err = api_key(Some("EVH_TEST_SURELY_UNSET_VAR")).unwrap_err();
        assert!(err.to_string().contains("EVH_TEST_SURELY_UNSET_VAR"));
        assert_eq!(api_key(None).unwrap(), None);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new().route(
            "/",
            axum::routing::post(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad input") }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = client(5).unwrap();
        let started = std::time::Instant::now();
        let err = post_json(
            &client,
            "Test",
            &format!("http://{}/", addr),
            None,
            &serde_json::json!({}),
            3,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("400"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
