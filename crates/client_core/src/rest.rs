use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::SessionId,
    error::{ApiError, ApiException},
    protocol::{CreateSessionResponse, MessagePage, ScenarioCatalog, SessionConfig, SessionRecord},
};
use tracing::{debug, info};

#[async_trait]
pub trait RestClient: Send + Sync {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionId>;
    async fn fetch_session(&self, session_id: &SessionId) -> Result<SessionRecord>;
    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
        offset: u32,
    ) -> Result<MessagePage>;
    async fn fetch_scenarios(&self) -> Result<ScenarioCatalog>;
}

pub struct HttpRestClient {
    http: Client,
    server_url: String,
}

impl HttpRestClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), server_url)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>) -> Self {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Self { http, server_url }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let res = self
            .http
            .get(format!("{}{path}", self.server_url))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let res = ensure_success(res).await?;
        res.json()
            .await
            .with_context(|| format!("invalid response body from GET {path}"))
    }
}

#[async_trait]
impl RestClient for HttpRestClient {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionId> {
        info!(
            topic = %config.topic,
            rounds = config.rounds,
            participants = config.participants.len(),
            "rest: creating session"
        );
        let res = self
            .http
            .post(format!("{}/api/conference/start", self.server_url))
            .json(config)
            .send()
            .await
            .context("failed to reach conference backend")?;
        let res = ensure_success(res).await?;
        let body: CreateSessionResponse = res
            .json()
            .await
            .context("invalid create-session response body")?;

        if !body.success || body.conference_id.is_empty() {
            return Err(anyhow!(body
                .error
                .unwrap_or_else(|| "backend did not return a session id".to_string())));
        }
        debug!(session_id = %body.conference_id, "rest: session created");
        Ok(SessionId::new(body.conference_id))
    }

    async fn fetch_session(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.get_json(&format!("/api/conference/{session_id}")).await
    }

    async fn fetch_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
        offset: u32,
    ) -> Result<MessagePage> {
        self.get_json(&format!(
            "/api/conference/{session_id}/messages?limit={limit}&offset={offset}"
        ))
        .await
    }

    async fn fetch_scenarios(&self) -> Result<ScenarioCatalog> {
        self.get_json("/api/scenarios").await
    }
}

async fn ensure_success(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body: ApiError = res.json().await.unwrap_or_default();
    Err(ApiException::from_body(status.as_u16(), &body).into())
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
