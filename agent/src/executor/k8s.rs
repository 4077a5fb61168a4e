//! Executor de Kubernetes sobre el custom resource `Operation`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::settings::ExecutorKind;
use common::{LogLine, RunKind, Status};
use compiler::converters::k8s::{resource_name, API_GROUP, RESOURCE_KIND, RESOURCE_PLURAL};
use compiler::containers::MAIN_JOB_CONTAINER;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{status_from_condition, Executor, ExecutorError, ExecutorResult, Resource, ResourceStatus};

const FIELD_MANAGER: &str = "polyaxon-agent";

pub fn operation_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(API_GROUP, "v1", RESOURCE_KIND);
    ApiResource::from_gvk_with_plural(&gvk, RESOURCE_PLURAL)
}

pub(crate) fn map_kube_error(name: &str, e: kube::Error) -> ExecutorError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ExecutorError::NotFound(name.to_string()),
            409 => ExecutorError::ResourceConflict(name.to_string()),
            401 | 403 => ExecutorError::Forbidden(resp.message),
            code if code >= 500 => ExecutorError::ClusterUnavailable(resp.message),
            _ => ExecutorError::Other(resp.message),
        },
        kube::Error::HyperError(e) => ExecutorError::ClusterUnavailable(e.to_string()),
        kube::Error::Service(e) => ExecutorError::ClusterUnavailable(e.to_string()),
        other => ExecutorError::Other(other.to_string()),
    }
}

/// Estado según la última condición publicada por el operador.
pub fn status_of(obj: &Value) -> (Status, Option<String>) {
    let last = obj
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .and_then(|c| c.last());
    match last {
        Some(c) => {
            let kind = c.get("type").and_then(Value::as_str).unwrap_or("unknown");
            let message = c.get("message").and_then(Value::as_str).map(str::to_string);
            (status_from_condition(kind), message)
        }
        None => (Status::Scheduled, None),
    }
}

/// Separa el timestamp que antepone `timestamps=true` al resto de la línea.
pub fn parse_log_line(line: &str, pod: &str) -> LogLine {
    let (timestamp, value) = match line.split_once(' ') {
        Some((ts, rest)) => match ts.parse::<DateTime<Utc>>() {
            Ok(ts) => (ts, rest.to_string()),
            Err(_) => (Utc::now(), line.to_string()),
        },
        None => (Utc::now(), line.to_string()),
    };
    LogLine {
        timestamp,
        node: None,
        pod: Some(pod.to_string()),
        container: Some(MAIN_JOB_CONTAINER.to_string()),
        value,
    }
}

pub struct K8sExecutor {
    client: RwLock<Client>,
    namespace: String,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl K8sExecutor {
    pub async fn connect(namespace: &str, read_timeout: Duration, write_timeout: Duration) -> ExecutorResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ExecutorError::ClusterUnavailable(e.to_string()))?;
        info!("executor kubernetes conectado (namespace={})", namespace);
        Ok(K8sExecutor {
            client: RwLock::new(client),
            namespace: namespace.to_string(),
            read_timeout,
            write_timeout,
        })
    }

    async fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let client = self.client.read().await.clone();
        Api::namespaced_with(client, namespace.unwrap_or(&self.namespace), &operation_resource())
    }

    async fn bounded<T, F>(&self, limit: Duration, name: &str, fut: F) -> ExecutorResult<T>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match timeout(limit, fut).await {
            Ok(res) => res.map_err(|e| map_kube_error(name, e)),
            Err(_) => Err(ExecutorError::Timeout(format!("{name} tras {limit:?}"))),
        }
    }

    fn to_status(run_uuid: &Uuid, run_kind: RunKind, obj: &DynamicObject) -> ExecutorResult<ResourceStatus> {
        let value = serde_json::to_value(obj).map_err(|e| ExecutorError::Other(e.to_string()))?;
        let (status, message) = status_of(&value);
        Ok(ResourceStatus {
            name: obj.metadata.name.clone().unwrap_or_default(),
            run_uuid: *run_uuid,
            kind: run_kind,
            status,
            message,
        })
    }

    fn object(resource: &Resource) -> ExecutorResult<DynamicObject> {
        match resource {
            Resource::Kubernetes(v) => {
                serde_json::from_value(v.clone()).map_err(|e| ExecutorError::Other(e.to_string()))
            }
            Resource::Docker(_) => Err(ExecutorError::UnsupportedOperation(
                "plan docker en el executor de kubernetes".into(),
            )),
        }
    }
}

#[async_trait]
impl Executor for K8sExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Kubernetes
    }

    async fn create(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        let name = resource_name(run_kind, run_uuid);
        let obj = Self::object(resource)?;
        let api = self.api(namespace).await;
        let created = self
            .bounded(self.write_timeout, &name, api.create(&PostParams::default(), &obj))
            .await?;
        debug!("creado {}", name);
        Self::to_status(run_uuid, run_kind, &created)
    }

    async fn apply(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        let name = resource_name(run_kind, run_uuid);
        let obj = Self::object(resource)?;
        let api = self.api(namespace).await;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self
            .bounded(self.write_timeout, &name, api.patch(&name, &params, &Patch::Apply(&obj)))
            .await?;
        debug!("aplicado {}", name);
        Self::to_status(run_uuid, run_kind, &applied)
    }

    async fn stop(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()> {
        let name = resource_name(run_kind, run_uuid);
        let api = self.api(namespace).await;
        self.bounded(self.write_timeout, &name, api.delete(&name, &DeleteParams::background()))
            .await?;
        info!("detenido {}", name);
        Ok(())
    }

    async fn clean(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()> {
        let name = resource_name(run_kind, run_uuid);
        let api = self.api(namespace).await;
        let patch = json!({ "metadata": { "finalizers": null } });
        self.bounded(
            self.write_timeout,
            &name,
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await?;
        debug!("finalizers removidos de {}", name);
        Ok(())
    }

    async fn get(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<ResourceStatus> {
        let name = resource_name(run_kind, run_uuid);
        let api = self.api(namespace).await;
        let obj = self.bounded(self.read_timeout, &name, api.get(&name)).await?;
        Self::to_status(run_uuid, run_kind, &obj)
    }

    async fn list_ops(&self, namespace: Option<&str>) -> ExecutorResult<Vec<ResourceStatus>> {
        let api = self.api(namespace).await;
        let params = ListParams::default().labels("app.kubernetes.io/managed-by=polyaxon");
        let list = self.bounded(self.read_timeout, "operations", api.list(&params)).await?;
        let mut out = Vec::new();
        for obj in &list.items {
            let labels = obj.metadata.labels.clone().unwrap_or_default();
            let uuid = labels
                .get("app.kubernetes.io/instance")
                .and_then(|u| Uuid::parse_str(u).ok());
            let kind = labels
                .get("polyaxon.com/kind")
                .and_then(|k| RunKind::parse(k).ok());
            match (uuid, kind) {
                (Some(uuid), Some(kind)) => out.push(Self::to_status(&uuid, kind, obj)?),
                _ => warn!("operación sin etiquetas de run: {:?}", obj.metadata.name),
            }
        }
        Ok(out)
    }

    async fn logs(&self, run_uuid: &Uuid, _run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<Vec<LogLine>> {
        let client = self.client.read().await.clone();
        let pods: Api<Pod> = Api::namespaced(client, namespace.unwrap_or(&self.namespace));
        let selector = format!("app.kubernetes.io/instance={}", run_uuid.simple());
        let list = self
            .bounded(self.read_timeout, "pods", pods.list(&ListParams::default().labels(&selector)))
            .await?;
        let params = LogParams {
            container: Some(MAIN_JOB_CONTAINER.to_string()),
            timestamps: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        for pod in list.items {
            let pod_name = pod.metadata.name.unwrap_or_default();
            let node = pod.spec.and_then(|s| s.node_name);
            let text = self
                .bounded(self.read_timeout, &pod_name, pods.logs(&pod_name, &params))
                .await?;
            out.extend(text.lines().map(|l| {
                let mut line = parse_log_line(l, &pod_name);
                line.node = node.clone();
                line
            }));
        }
        Ok(out)
    }

    async fn refresh(&self) -> ExecutorResult<()> {
        let client = Client::try_default()
            .await
            .map_err(|e| ExecutorError::ClusterUnavailable(e.to_string()))?;
        *self.client.write().await = client;
        info!("cliente de kubernetes reiniciado");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurso_del_crd() {
        let ar = operation_resource();
        assert_eq!(ar.api_version, "core.polyaxon.com/v1");
        assert_eq!(ar.plural, "operations");
    }

    #[test]
    fn estado_desde_condiciones() {
        let obj = json!({"status": {"conditions": [
            {"type": "Running"},
            {"type": "Failed", "message": "OOMKilled"}
        ]}});
        assert_eq!(status_of(&obj), (Status::Failed, Some("OOMKilled".into())));
        assert_eq!(status_of(&json!({})).0, Status::Scheduled);
    }

    #[test]
    fn linea_de_log_con_timestamp() {
        let line = parse_log_line("2024-05-01T10:00:00Z epoch 1 loss=0.3", "p-0");
        assert_eq!(line.value, "epoch 1 loss=0.3");
        assert_eq!(line.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(line.pod.as_deref(), Some("p-0"));
    }
}
