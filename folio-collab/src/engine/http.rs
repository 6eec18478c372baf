//! HTTP client for the external merge/extraction engine.
//!
//! ```text
//! POST {base_url}/apply-updates   {"updates": [b64, ...]}  → {"state": b64}
//! POST {base_url}/extract-blocks  {"state": b64}           → {"blocks": [...]}
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{EngineError, ExtractedBlock, MergeEngine};
use crate::protocol::{decode_bytes, encode_bytes};

#[derive(Serialize)]
struct ApplyRequest {
    updates: Vec<String>,
}

#[derive(Deserialize)]
struct ApplyResponse {
    state: String,
}

#[derive(Serialize)]
struct ExtractRequest {
    state: String,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    blocks: Vec<ExtractedBlock>,
}

/// Remote engine reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: Client,
    base_url: String,
}

impl HttpEngine {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, EngineError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MergeEngine for HttpEngine {
    async fn apply(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        let request = ApplyRequest {
            updates: updates.iter().map(|u| encode_bytes(u)).collect(),
        };
        let response: ApplyResponse = self.post("apply-updates", &request).await?;
        decode_bytes(&response.state).map_err(|e| EngineError::InvalidResponse(e.to_string()))
    }

    async fn extract(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
        let request = ExtractRequest {
            state: encode_bytes(state),
        };
        let response: ExtractResponse = self.post("extract-blocks", &request).await?;
        Ok(response.blocks)
    }
}
