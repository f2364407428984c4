use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::pipeline::Classifier;

/// Result returned by a classifier replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

/// HTTP client bound to one classifier replica.
///
/// One instance exists per configured endpoint and is owned by exactly
/// one worker, so no two workers ever share a backend concurrently. The
/// request timeout bounds the call even without cancellation.
pub struct HttpClassifier {
    http: Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, ClassifyError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Classification, ClassifyError> {
        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request_body)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<Classification>().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("classification request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed classifier response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("classifier backend error: {0}")]
    Backend(String),
}
