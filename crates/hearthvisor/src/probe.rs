use async_trait::async_trait;
use hearthvisor_core::{HealthProbe, OrchestratorError, ProbeOutcome, classify_response};
use std::time::Duration;
use tracing::debug;

/// Health probe issuing `GET <health_check_url>` over loopback HTTP
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, OrchestratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| {
                OrchestratorError::configuration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return ProbeOutcome::unhealthy(format!(
                    "health probe timed out after {}s",
                    self.timeout.as_secs_f32()
                ));
            }
            Err(e) if e.is_connect() => {
                return ProbeOutcome::unhealthy(format!("connection refused: {url}"));
            }
            Err(e) => return ProbeOutcome::unhealthy(format!("health request failed: {e}")),
        };

        let status_code = response.status().as_u16();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return ProbeOutcome::unhealthy(format!("failed to read health body: {e}")),
        };

        let outcome = classify_response(status_code, &body);
        if let ProbeOutcome::Healthy(report) = &outcome {
            debug!(
                url,
                status = %report.status,
                name = ?report.name,
                version = ?report.version,
                timestamp = ?report.timestamp,
                "Health report"
            );
        }
        outcome
    }
}
