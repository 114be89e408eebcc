use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::providers::{VerificationProvider, VerificationResult};

/// An HTTP probe described by a `verify` check's `scenario`.
#[derive(Debug, Clone, Deserialize)]
struct Scenario {
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_status")]
    expect_status: u16,
    #[serde(default)]
    expect_body_contains: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

fn join_url(endpoint: &str, path: &str) -> String {
    if path.is_empty() {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        endpoint.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Verification provider that issues the scenario's request and checks the response.
pub struct HttpVerifier {
    client: reqwest::Client,
}

impl HttpVerifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("waypoint")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VerificationProvider for HttpVerifier {
    async fn verify(&self, endpoint: &str, scenario: &Value) -> Result<VerificationResult> {
        let scenario: Scenario = if scenario.is_null() {
            serde_json::from_value(Value::Object(Default::default()))?
        } else {
            serde_json::from_value(scenario.clone()).context("Invalid verification scenario")?
        };
        let method = reqwest::Method::from_bytes(scenario.method.to_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method '{}'", scenario.method))?;
        let url = join_url(endpoint, &scenario.path);
        debug!(%method, url, "running verification scenario");

        let mut request = self.client.request(method, &url);
        if let Some(body) = &scenario.body {
            request = request.json(body);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;

        if status != scenario.expect_status {
            return Ok(VerificationResult {
                passed: false,
                details: format!(
                    "{} returned {}, expected {}",
                    url, status, scenario.expect_status
                ),
            });
        }
        if let Some(needle) = &scenario.expect_body_contains
            && !text.contains(needle.as_str())
        {
            return Ok(VerificationResult {
                passed: false,
                details: format!("{} response does not contain '{}'", url, needle),
            });
        }
        Ok(VerificationResult {
            passed: true,
            details: format!("{} returned {}", url, status),
        })
    }
}
