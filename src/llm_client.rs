use crate::completion::ChatCompletionRequest;
use crate::config::LlmParams;
use crate::error::ChatStreamError;
use crate::models::ModelsResponse;
use crate::request_id::RequestId;
use reqwest::header::HeaderValue;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// HTTP side of the OpenAI-compatible endpoint: URL layout, auth and headers.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http_client: Arc<reqwest::Client>,
    params: LlmParams,
}

impl LlmClient {
    pub fn new(http_client: Arc<reqwest::Client>, params: LlmParams) -> Self {
        Self { http_client, params }
    }

    /// Joins `path` (relative to `/v1`) onto the configured base; a base that
    /// already ends in `/v1` is not doubled.
    fn build_target_url(&self, path: &str) -> String {
        let api_base = self.params.api_base.trim_end_matches('/');
        if api_base.ends_with("/v1") {
            format!("{}/{}", api_base, path)
        } else {
            format!("{}/v1/{}", api_base, path)
        }
    }

    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(api_key) = self.params.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        request
    }

    pub fn open_chat_stream(
        &self,
        body: &ChatCompletionRequest,
        request_id: &RequestId,
    ) -> impl Future<Output = Result<reqwest::Response, reqwest::Error>> {
        let target_url = self.build_target_url("chat/completions");

        let mut target_request = self
            .http_client
            .post(&target_url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        target_request = self.authorize(target_request);

        match HeaderValue::from_str(&request_id.0) {
            Ok(val) => target_request = target_request.header("x-request-id", val),
            Err(e) => warn!("Invalid request id {}: {}", request_id, e),
        }

        info!("Opening completion stream: {}", target_url);
        match serde_json::to_string(body) {
            Ok(s) => debug!("request body: {}", s),
            Err(e) => warn!("Failed to render request body for logging: {}", e),
        }
        target_request.json(body).send()
    }

    pub async fn list_models(&self) -> Result<ModelsResponse, ChatStreamError> {
        let target_url = self.build_target_url("models");
        debug!("Listing models: {}", target_url);

        let response = self.authorize(self.http_client.get(&target_url)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Model listing failed with status {}: {}", status, body);
            return Err(ChatStreamError::Status { status, body });
        }
        Ok(response.json::<ModelsResponse>().await?)
    }
}
