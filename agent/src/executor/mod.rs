//! Executors: aplican los recursos convertidos en un backend.

pub mod blocking;
pub mod docker;
pub mod k8s;

use async_trait::async_trait;
use common::settings::ExecutorKind;
use common::{LogLine, RunKind, Status};
use compiler::DockerPlan;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("cluster no disponible: {0}")]
    ClusterUnavailable(String),

    #[error("el recurso `{0}` ya existe")]
    ResourceConflict(String),

    #[error("recurso `{0}` no encontrado")]
    NotFound(String),

    #[error("acceso denegado: {0}")]
    Forbidden(String),

    #[error("operación no soportada: {0}")]
    UnsupportedOperation(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl ExecutorError {
    /// Errores que se reintentan con backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::ClusterUnavailable(_) | ExecutorError::Timeout(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ExecutorError::ClusterUnavailable(_) | ExecutorError::Timeout(_) => "ClusterUnavailable",
            ExecutorError::ResourceConflict(_) => "ResourceConflict",
            ExecutorError::NotFound(_) => "NotFound",
            ExecutorError::Forbidden(_) => "Forbidden",
            ExecutorError::UnsupportedOperation(_) => "UnsupportedKind",
            ExecutorError::Other(_) => "AgentError",
        }
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Recurso ya convertido para el backend del executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Kubernetes(Value),
    Docker(DockerPlan),
}

/// Estado de un recurso tal como lo ve el backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    pub run_uuid: Uuid,
    pub kind: RunKind,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    async fn create(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus>;

    async fn apply(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus>;

    async fn stop(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()>;

    /// Quita los finalizers para que el borrado no quede colgado.
    async fn clean(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()>;

    async fn get(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<ResourceStatus>;

    async fn list_ops(&self, namespace: Option<&str>) -> ExecutorResult<Vec<ResourceStatus>>;

    async fn logs(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<Vec<LogLine>>;

    /// Recrea la conexión con el backend tras un fallo.
    async fn refresh(&self) -> ExecutorResult<()> {
        Ok(())
    }
}

/// Estado a partir del tipo de la última condición del recurso.
pub fn status_from_condition(kind: &str) -> Status {
    serde_json::from_value(Value::String(kind.to_lowercase())).unwrap_or(Status::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condiciones_a_estados() {
        assert_eq!(status_from_condition("Running"), Status::Running);
        assert_eq!(status_from_condition("upstream_failed"), Status::UpstreamFailed);
        assert_eq!(status_from_condition("Weird"), Status::Unknown);
    }

    #[test]
    fn solo_los_transitorios_se_reintentan() {
        assert!(ExecutorError::ClusterUnavailable("x".into()).is_transient());
        assert!(ExecutorError::Timeout("x".into()).is_transient());
        assert!(!ExecutorError::ResourceConflict("x".into()).is_transient());
        assert_eq!(ExecutorError::UnsupportedOperation("apply".into()).reason(), "UnsupportedKind");
    }
}
