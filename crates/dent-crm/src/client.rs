//! The HTTP core: one method, one retry loop, one rate limiter.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::limiter::RateLimiter;
use crate::CrmError;

/// The CRM's error code for request-rate violations; transient by policy.
const RATE_LIMIT_CODE: &str = "QUERY_LIMIT_EXCEEDED";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Client knobs, lifted from the `crm` config section by the daemon.
#[derive(Debug, Clone)]
pub struct CrmClientConfig {
    /// Base webhook URL. Embeds the access token — never log it.
    pub webhook_url: String,
    pub max_attempts: u32,
    /// Backoff between attempts, read in order; last entry reused.
    pub retry_delays: Vec<Duration>,
    pub rate_limit_per_sec: f64,
    pub request_timeout: Duration,
    /// Deal custom field carrying the external id.
    pub external_id_field: String,
    /// Deal custom field carrying the treatment-plan projection.
    pub plan_field: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct CrmClient {
    http: reqwest::Client,
    webhook_url: String,
    limiter: RateLimiter,
    max_attempts: u32,
    retry_delays: Vec<Duration>,
    pub(crate) external_id_field: String,
    pub(crate) plan_field: String,
}

impl CrmClient {
    pub fn new(cfg: CrmClientConfig) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| CrmError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            webhook_url: cfg.webhook_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(cfg.rate_limit_per_sec),
            max_attempts: cfg.max_attempts.max(1),
            retry_delays: cfg.retry_delays,
            external_id_field: cfg.external_id_field,
            plan_field: cfg.plan_field,
        })
    }

    pub fn external_id_field(&self) -> &str {
        &self.external_id_field
    }

    pub fn plan_field(&self) -> &str {
        &self.plan_field
    }

    /// Invoke a CRM method with the client's retry policy.
    ///
    /// This is the ONLY place retry is applied. Everything public on this
    /// client funnels through here; callers compose on top and must not
    /// add their own retry loop around it.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CrmError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.call_once(method, &params).await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(method, attempt, %err, delay_ms = delay.as_millis() as u64,
                          "transient crm error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = ((attempt - 1) as usize).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, CrmError> {
        self.limiter.acquire().await;

        let url = format!("{}/{}.json", self.webhook_url, method);
        let resp = self
            .http
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrmError::Timeout
                } else {
                    CrmError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(CrmError::Server {
                status: status.as_u16(),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| CrmError::Decode(format!("{method}: {e}")))?;

        if let Some(code) = body.get("error").and_then(Value::as_str) {
            if code == RATE_LIMIT_CODE {
                return Err(CrmError::RateLimited);
            }
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            return Err(CrmError::Validation {
                code: code.to_string(),
                description,
            });
        }

        if !status.is_success() {
            // 4xx without a structured error payload.
            return Err(CrmError::Validation {
                code: status.as_u16().to_string(),
                description: "no error payload".to_string(),
            });
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| CrmError::Decode(format!("{method}: response without result")))
    }
}

// ---------------------------------------------------------------------------
// Tests (wire-level, httpmock)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    pub(crate) fn test_config(base_url: &str) -> CrmClientConfig {
        CrmClientConfig {
            webhook_url: base_url.to_string(),
            max_attempts: 3,
            // Keep test wall-clock flat.
            retry_delays: vec![Duration::from_millis(1)],
            rate_limit_per_sec: 10_000.0,
            request_timeout: Duration::from_secs(5),
            external_id_field: "UF_EXT".to_string(),
            plan_field: "UF_PLAN".to_string(),
        }
    }

    #[tokio::test]
    async fn call_unwraps_result_envelope() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/profile.json");
                then.status(200).json_body(json!({"result": {"ID": 1}}));
            })
            .await;

        let client = CrmClient::new(test_config(&server.base_url())).unwrap();
        let result = client.call("profile", json!({})).await.unwrap();
        assert_eq!(result, json!({"ID": 1}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_retried_until_success() {
        let server = MockServer::start_async().await;
        let fail = server
            .mock_async(|when, then| {
                when.method(POST).path("/crm.deal.get.json");
                then.status(502);
            })
            .await;

        let client = CrmClient::new(test_config(&server.base_url())).unwrap();
        let err = client.call("crm.deal.get", json!({"id": 1})).await.unwrap_err();
        assert_eq!(err, CrmError::Server { status: 502 });
        // All attempts were spent on the transient failure.
        assert_eq!(fail.hits_async().await, 3);
    }

    #[tokio::test]
    async fn validation_error_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/crm.deal.update.json");
                then.status(400).json_body(json!({
                    "error": "INVALID_FIELD",
                    "error_description": "unknown custom field"
                }));
            })
            .await;

        let client = CrmClient::new(test_config(&server.base_url())).unwrap();
        let err = client
            .call("crm.deal.update", json!({"id": 1}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CrmError::Validation {
                code: "INVALID_FIELD".to_string(),
                description: "unknown custom field".to_string()
            }
        );
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn rate_limit_code_is_transient() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/crm.deal.list.json");
                then.status(200).json_body(json!({"error": "QUERY_LIMIT_EXCEEDED"}));
            })
            .await;

        let client = CrmClient::new(test_config(&server.base_url())).unwrap();
        let err = client.call("crm.deal.list", json!({})).await.unwrap_err();
        assert_eq!(err, CrmError::RateLimited);
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn missing_result_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/profile.json");
                then.status(200).json_body(json!({"time": {}}));
            })
            .await;

        let client = CrmClient::new(test_config(&server.base_url())).unwrap();
        let err = client.call("profile", json!({})).await.unwrap_err();
        assert!(matches!(err, CrmError::Decode(_)));
    }
}
