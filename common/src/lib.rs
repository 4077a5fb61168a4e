use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod compiled;
pub mod component;
pub mod connections;
pub mod environment;
pub mod error;
pub mod fswatcher;
pub mod hooks;
pub mod init;
pub mod io;
pub mod k8s;
pub mod matrix;
pub mod names;
pub mod operation;
pub mod params;
pub mod patch;
pub mod plugins;
pub mod reader;
pub mod runs;
pub mod schedules;
pub mod settings;
pub mod statuses;
pub mod termination;

pub use compiled::CompiledOperation;
pub use component::Component;
pub use error::{SchemaError, SchemaResult};
pub use operation::Operation;
pub use runs::{RunKind, Runtime};
pub use statuses::{Status, StatusCondition};

/* --------- Contrato con el plano de control --------- */

/// Una run entregada al agente: la operación compilada viaja como documento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub uuid: Uuid,
    pub name: String,
    pub kind: RunKind,
    pub owner: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Buckets de trabajo que el agente procesa en cada tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    #[serde(default)]
    pub queued: Vec<RunPayload>,
    #[serde(default)]
    pub stopping: Vec<RunPayload>,
    #[serde(default)]
    pub deleting: Vec<RunPayload>,
    #[serde(default)]
    pub checking: Vec<RunPayload>,
    #[serde(default)]
    pub apply: Vec<RunPayload>,
    #[serde(default)]
    pub delete: Vec<RunPayload>,
}

impl AgentState {
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
            && self.stopping.is_empty()
            && self.deleting.is_empty()
            && self.checking.is_empty()
            && self.apply.is_empty()
            && self.delete.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_state: Option<i32>,
    #[serde(default)]
    pub state: AgentState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    pub condition: StatusCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsUploadRequest {
    pub logs: Vec<LogLine>,
}
