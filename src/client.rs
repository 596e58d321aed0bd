//! Server API client: registration, heartbeat, event batches, inventory and the
//! pull-based command channel (install approvals, scripts).
//!
//! Every call carries the pre-shared key in `X-API-Key` and expects the
//! `{success, data, error}` envelope back.

use crate::collectors::software::{InstallRequest, InstallStatus};
use crate::config::ServerConfig;
use crate::event::EventBatch;
use crate::inventory::InventoryReport;
use crate::registration::{HeartbeatRequest, RegistrationRequest, RegistrationResponse};
use crate::scripts::{PendingScript, ScriptResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const API_KEY_HEADER: &str = "X-API-Key";

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("invalid server response: {0}")]
    Decode(String),
    #[error("client setup failed: {0}")]
    Setup(String),
}

impl ClientError {
    /// Connection problems, timeouts and 5xx are worth retrying; anything the
    /// server understood and refused is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) | ClientError::Timeout => true,
            ClientError::Status { status, .. } => *status >= 500,
            ClientError::Rejected(_) | ClientError::Decode(_) | ClientError::Setup(_) => false,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ClientError::Timeout
        } else if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else if e.is_builder() {
            ClientError::Setup(e.to_string())
        } else {
            ClientError::Transport(e.to_string())
        }
    }
}

/// Generic response wrapper used by every server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Turn a status code and body into the envelope payload.
pub fn decode_response<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>, ClientError> {
    if !(200..300).contains(&status) {
        let mut body = body.trim().to_string();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }
        return Err(ClientError::Status { status, body });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|e| ClientError::Decode(e.to_string()))?;
    if !envelope.success {
        return Err(ClientError::Rejected(
            envelope.error.unwrap_or_else(|| "unspecified error".to_string()),
        ));
    }
    Ok(envelope.data)
}

fn require<T>(data: Option<T>, what: &str) -> Result<T, ClientError> {
    data.ok_or_else(|| ClientError::Decode(format!("missing {} in response", what)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatus {
    pub status: InstallStatus,
}

/// Outbound calls the agent makes. The HTTP client implements it; tests use fakes.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn register(&self, req: &RegistrationRequest) -> Result<RegistrationResponse, ClientError>;
    async fn heartbeat(&self, hb: &HeartbeatRequest) -> Result<(), ClientError>;
    async fn send_events(&self, batch: &EventBatch) -> Result<(), ClientError>;
    async fn send_inventory(&self, report: &InventoryReport) -> Result<(), ClientError>;
    /// Returns the server-side id of the request.
    async fn submit_install_request(&self, req: &InstallRequest) -> Result<String, ClientError>;
    async fn install_request_status(&self, server_id: &str) -> Result<InstallStatus, ClientError>;
    async fn pending_scripts(&self, agent_id: &str) -> Result<Vec<PendingScript>, ClientError>;
    async fn report_script_result(
        &self,
        agent_id: &str,
        result: &ScriptResult,
    ) -> Result<(), ClientError>;
}

pub struct HttpServerApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpServerApi {
    pub fn new(config: &ServerConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("siem-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<Option<T>, ClientError> {
        let res = req
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        let status = res.status().as_u16();
        let body = res.text().await.map_err(ClientError::from_reqwest)?;
        debug!(status, bytes = body.len(), "server response");
        decode_response(status, &body)
    }

    async fn post<B: Serialize + ?Sized + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, ClientError> {
        self.execute(self.client.post(self.url(path)).json(body)).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ClientError> {
        self.execute(self.client.get(self.url(path))).await
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn register(&self, req: &RegistrationRequest) -> Result<RegistrationResponse, ClientError> {
        let data = self.post("/api/agents/register", req).await?;
        require(data, "agent_id")
    }

    async fn heartbeat(&self, hb: &HeartbeatRequest) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/agents/heartbeat", hb)
            .await
            .map(|_| ())
    }

    async fn send_events(&self, batch: &EventBatch) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/events/batch", batch)
            .await
            .map(|_| ())
    }

    async fn send_inventory(&self, report: &InventoryReport) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/agents/inventory", report)
            .await
            .map(|_| ())
    }

    async fn submit_install_request(&self, req: &InstallRequest) -> Result<String, ClientError> {
        let data: Option<SubmittedRequest> = self.post("/api/software/requests", req).await?;
        require(data, "request id").map(|r| r.id)
    }

    async fn install_request_status(&self, server_id: &str) -> Result<InstallStatus, ClientError> {
        let data: Option<RequestStatus> =
            self.get(&format!("/api/software/requests/{}", server_id)).await?;
        require(data, "status").map(|r| r.status)
    }

    async fn pending_scripts(&self, agent_id: &str) -> Result<Vec<PendingScript>, ClientError> {
        let data: Option<Vec<PendingScript>> = self
            .get(&format!("/api/agents/{}/scripts/pending", agent_id))
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn report_script_result(
        &self,
        agent_id: &str,
        result: &ScriptResult,
    ) -> Result<(), ClientError> {
        let path = format!("/api/agents/{}/scripts/{}/result", agent_id, result.script_id);
        self.post::<_, serde_json::Value>(&path, result)
            .await
            .map(|_| ())
    }
}
