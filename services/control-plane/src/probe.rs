//! Readiness prober.
//!
//! A freshly launched tenant service is not routed to until it answers an
//! HTTP endpoint that echoes its environment and the echoed values match what
//! was injected. This catches containers that came up with someone else's
//! configuration as well as containers that never came up.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

/// Result of probing one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// HTTP readiness prober.
#[derive(Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }

    /// Poll `url` until every `expected` pair is echoed back, at most
    /// `max_attempts` requests spaced `interval` apart.
    pub async fn probe(
        &self,
        url: &str,
        expected: &BTreeMap<String, String>,
        interval: Duration,
        max_attempts: u32,
    ) -> ProbeOutcome {
        let max_attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match self.check(url, expected).await {
                Ok(()) => {
                    info!(url, attempts = attempt, "Instance ready");
                    return ProbeOutcome {
                        ok: true,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => {
                    debug!(url, attempt, max_attempts, error = %e, "Readiness check failed");
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(
            url,
            attempts = max_attempts,
            error = last_error.as_deref().unwrap_or_default(),
            "Instance never became ready"
        );
        ProbeOutcome {
            ok: false,
            attempts: max_attempts,
            last_error,
        }
    }

    async fn check(&self, url: &str, expected: &BTreeMap<String, String>) -> Result<(), String> {
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("failed to read body: {e}"))?;
        let actual = parse_env_document(&body);

        for (key, want) in expected {
            match actual.get(key) {
                Some(got) if got == want => {}
                Some(got) => return Err(format!("{key} is '{got}', expected '{want}'")),
                None => return Err(format!("{key} missing")),
            }
        }
        Ok(())
    }
}

/// Parse a flat key/value document: a JSON object, or `KEY=VALUE` lines.
pub fn parse_env_document(body: &str) -> BTreeMap<String, String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(body) {
        return map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect();
    }

    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}
