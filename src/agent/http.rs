//! `TaskSource` over the orchestrator's HTTP routes.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ProtocolError, Result};
use crate::gateway::protocol::{
    GetTaskRequest, GetTaskResponse, SubmitResultRequest, SubmitResultResponse,
};

use super::TaskSource;

pub struct HttpTaskSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTaskSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(ProtocolError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response.json().await.map_err(ProtocolError::from)?)
    }
}

#[async_trait]
impl TaskSource for HttpTaskSource {
    async fn get_task(&self, agent_id: &str) -> Result<GetTaskResponse> {
        let request = GetTaskRequest {
            agent_id: agent_id.to_string(),
        };
        self.post("/internal/task", &request).await
    }

    async fn submit_result(&self, request: SubmitResultRequest) -> Result<SubmitResultResponse> {
        self.post("/internal/task/result", &request).await
    }
}
