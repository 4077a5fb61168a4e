//! Cliente del plano de control.

use async_trait::async_trait;
use common::{AgentRecord, AgentStateResponse, LogLine, LogsUploadRequest, StatusCondition, StatusUpdateRequest};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::Catalog;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("credenciales rechazadas por el plano de control ({0})")]
    Unauthorized(StatusCode),

    #[error("el plano de control respondió {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuración incompleta: {0}")]
    Config(String),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_))
    }
}

/// Run a la que se reportan estados y logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub owner: String,
    pub project: String,
    pub uuid: Uuid,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_agent(&self) -> Result<AgentRecord, ClientError>;
    async fn get_catalog(&self) -> Result<Catalog, ClientError>;
    async fn get_state(&self) -> Result<AgentStateResponse, ClientError>;
    async fn report_agent_status(&self, condition: StatusCondition) -> Result<(), ClientError>;
    async fn report_run_status(&self, run: &RunRef, condition: StatusCondition) -> Result<(), ClientError>;
    async fn upload_logs(&self, run: &RunRef, logs: Vec<LogLine>) -> Result<(), ClientError>;
}

/// Implementación HTTP contra `/api/v1`.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    token: Option<String>,
    owner: String,
    agent_uuid: String,
}

impl HttpControlPlane {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        owner: &str,
        agent_uuid: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        if base_url.is_empty() {
            return Err(ClientError::Config("POLYAXON_HOST".into()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(HttpControlPlane {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            owner: owner.to_string(),
            agent_uuid: agent_uuid.to_string(),
        })
    }

    fn agent_url(&self, suffix: &str) -> String {
        format!(
            "{}/api/v1/orgs/{}/agents/{}{}",
            self.base_url, self.owner, self.agent_uuid, suffix
        )
    }

    fn run_url(&self, run: &RunRef, suffix: &str) -> String {
        format!(
            "{}/api/v1/{}/{}/runs/{}{}",
            self.base_url,
            run.owner,
            run.project,
            run.uuid.simple(),
            suffix
        )
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.header("Authorization", format!("Token {t}")),
            None => req,
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Unauthorized(status));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        debug!("GET {}", url);
        let resp = self.with_auth(self.client.get(url)).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn post_json<B: Serialize + Sync>(&self, url: &str, body: &B) -> Result<(), ClientError> {
        debug!("POST {}", url);
        let resp = self.with_auth(self.client.post(url)).json(body).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_agent(&self) -> Result<AgentRecord, ClientError> {
        self.get_json(&self.agent_url("")).await
    }

    async fn get_catalog(&self) -> Result<Catalog, ClientError> {
        self.get_json(&self.agent_url("/config")).await
    }

    async fn get_state(&self) -> Result<AgentStateResponse, ClientError> {
        self.get_json(&self.agent_url("/state")).await
    }

    async fn report_agent_status(&self, condition: StatusCondition) -> Result<(), ClientError> {
        self.post_json(&self.agent_url("/statuses"), &StatusUpdateRequest { condition })
            .await
    }

    async fn report_run_status(&self, run: &RunRef, condition: StatusCondition) -> Result<(), ClientError> {
        self.post_json(&self.run_url(run, "/statuses"), &StatusUpdateRequest { condition })
            .await
    }

    async fn upload_logs(&self, run: &RunRef, logs: Vec<LogLine>) -> Result<(), ClientError> {
        if logs.is_empty() {
            return Ok(());
        }
        self.post_json(&self.run_url(run, "/logs"), &LogsUploadRequest { logs })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpControlPlane {
        HttpControlPlane::new(
            "http://cp:8000/",
            Some("abc".into()),
            "acme",
            "agent-1",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn urls_del_plano_de_control() {
        let c = client();
        assert_eq!(c.agent_url("/state"), "http://cp:8000/api/v1/orgs/acme/agents/agent-1/state");
        let run = RunRef {
            owner: "acme".into(),
            project: "mnist".into(),
            uuid: Uuid::parse_str("0b6c8b1e-7d9f-4a8a-9a43-2f3f8a6e7c11").unwrap(),
        };
        assert_eq!(
            c.run_url(&run, "/statuses"),
            "http://cp:8000/api/v1/acme/mnist/runs/0b6c8b1e7d9f4a8a9a432f3f8a6e7c11/statuses"
        );
    }

    #[test]
    fn host_vacio_es_error_de_configuracion() {
        let err = HttpControlPlane::new("", None, "acme", "a", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert!(!err.is_unauthorized());
    }
}
