//! Quality inspection client
//!
//! The inspection service receives the captured JPEG and answers with a
//! verdict: `{"result": "accept"}` or `{"result": "reject", "reason": "..."}`.

use crate::domain::Verdict;
use crate::error::CollaboratorError;
use crate::infra::config::InspectionConfig;
use crate::io::camera::CapturedImage;
use crate::io::http::{build_client, Endpoint};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::info;

#[async_trait]
pub trait Inspector: Send + Sync {
    async fn inspect(&self, image: &CapturedImage) -> Result<Verdict, CollaboratorError>;
}

pub struct HttpInspector {
    endpoint: Endpoint,
    client: reqwest::Client,
}

impl HttpInspector {
    pub fn new(config: &InspectionConfig) -> Result<Self, CollaboratorError> {
        let client = build_client(Duration::from_millis(config.timeout_ms))?;
        Ok(Self { endpoint: Endpoint::parse(&config.url), client })
    }
}

#[async_trait]
impl Inspector for HttpInspector {
    async fn inspect(&self, image: &CapturedImage) -> Result<Verdict, CollaboratorError> {
        if !self.endpoint.is_configured() {
            return Err(CollaboratorError::Disabled("inspection url"));
        }
        let start = Instant::now();

        let request = self
            .endpoint
            .authorize(self.client.post(&self.endpoint.url))
            .header("Content-Type", "image/jpeg")
            .body(image.bytes.clone());
        let response = request.send().await?.error_for_status()?;
        let body = response.text().await?;
        let verdict = parse_verdict(&body)?;

        info!(
            image = %image.path.display(),
            reject = %verdict.is_reject(),
            latency_ms = %start.elapsed().as_millis(),
            "inspection_verdict"
        );
        Ok(verdict)
    }
}

fn parse_verdict(body: &str) -> Result<Verdict, CollaboratorError> {
    serde_json::from_str(body)
        .map_err(|e| CollaboratorError::Unexpected(format!("invalid verdict ({e}): {body}")))
}

/// Used when `inspection.enabled = false`
pub struct NullInspector;

#[async_trait]
impl Inspector for NullInspector {
    async fn inspect(&self, _image: &CapturedImage) -> Result<Verdict, CollaboratorError> {
        Err(CollaboratorError::Disabled("inspection"))
    }
}
