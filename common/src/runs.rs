//! Runtimes: el payload `run` de un componente, discriminado por `kind`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::component::Component;
use crate::environment::Environment;
use crate::error::{SchemaError, SchemaResult};
use crate::init::Init;
use crate::k8s::{Container, Volume};
use crate::matrix::EarlyStopping;
use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunKind {
    #[serde(rename = "job")]
    Job,
    #[serde(rename = "service")]
    Service,
    #[serde(rename = "dag")]
    Dag,
    #[serde(rename = "tfjob")]
    TfJob,
    #[serde(rename = "pytorchjob")]
    PytorchJob,
    #[serde(rename = "mpijob")]
    MpiJob,
    #[serde(rename = "mxjob")]
    MxJob,
    #[serde(rename = "xgbjob")]
    XgbJob,
    #[serde(rename = "paddlejob")]
    PaddleJob,
    #[serde(rename = "daskjob")]
    DaskJob,
    #[serde(rename = "rayjob")]
    RayJob,
    #[serde(rename = "notifier")]
    Notifier,
    #[serde(rename = "cleaner")]
    Cleaner,
    #[serde(rename = "tuner")]
    Tuner,
}

impl RunKind {
    pub const ALL: [RunKind; 14] = [
        RunKind::Job,
        RunKind::Service,
        RunKind::Dag,
        RunKind::TfJob,
        RunKind::PytorchJob,
        RunKind::MpiJob,
        RunKind::MxJob,
        RunKind::XgbJob,
        RunKind::PaddleJob,
        RunKind::DaskJob,
        RunKind::RayJob,
        RunKind::Notifier,
        RunKind::Cleaner,
        RunKind::Tuner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Job => "job",
            RunKind::Service => "service",
            RunKind::Dag => "dag",
            RunKind::TfJob => "tfjob",
            RunKind::PytorchJob => "pytorchjob",
            RunKind::MpiJob => "mpijob",
            RunKind::MxJob => "mxjob",
            RunKind::XgbJob => "xgbjob",
            RunKind::PaddleJob => "paddlejob",
            RunKind::DaskJob => "daskjob",
            RunKind::RayJob => "rayjob",
            RunKind::Notifier => "notifier",
            RunKind::Cleaner => "cleaner",
            RunKind::Tuner => "tuner",
        }
    }

    pub fn parse(value: &str) -> SchemaResult<Self> {
        RunKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == value)
            .ok_or_else(|| SchemaError::UnknownKind(value.to_string()))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(
            self,
            RunKind::TfJob
                | RunKind::PytorchJob
                | RunKind::MpiJob
                | RunKind::MxJob
                | RunKind::XgbJob
                | RunKind::PaddleJob
                | RunKind::DaskJob
                | RunKind::RayJob
        )
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* --------- Plantilla de pod --------- */

/// Vista común sobre cualquier payload que termina en un pod.
pub trait PodTemplate {
    fn environment(&self) -> Option<&Environment>;
    fn connections(&self) -> &[String];
    fn volumes(&self) -> &[Volume];
    fn init(&self) -> &[Init];
    fn sidecars(&self) -> &[Container];
    fn container(&self) -> Option<&Container>;
}

macro_rules! impl_pod_template {
    ($($t:ty),+ $(,)?) => {$(
        impl PodTemplate for $t {
            fn environment(&self) -> Option<&Environment> {
                self.environment.as_ref()
            }
            fn connections(&self) -> &[String] {
                self.connections.as_deref().unwrap_or_default()
            }
            fn volumes(&self) -> &[Volume] {
                self.volumes.as_deref().unwrap_or_default()
            }
            fn init(&self) -> &[Init] {
                self.init.as_deref().unwrap_or_default()
            }
            fn sidecars(&self) -> &[Container] {
                self.sidecars.as_deref().unwrap_or_default()
            }
            fn container(&self) -> Option<&Container> {
                self.container.as_ref()
            }
        }
    )+};
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Init>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Init>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_path: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_external: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

/// Rol de un job distribuido (chief, worker, master, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KfReplica {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Init>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

impl KfReplica {
    /// Un rol declarado sin `replicas` cuenta como una réplica.
    pub fn num_replicas(&self) -> u32 {
        self.replicas.unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RayReplica {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_start_params: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Init>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

/// Jobs batch con imagen predefinida (notifier, cleaner, tuner).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Vec<Init>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecars: Option<Vec<Container>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

impl_pod_template!(JobRun, ServiceRun, KfReplica, RayReplica, BatchRun);

/* --------- Políticas de Kubeflow --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanPodPolicy {
    #[serde(alias = "all")]
    All,
    #[serde(alias = "running")]
    Running,
    #[serde(alias = "none")]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_resources: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdzv_conf: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standalone: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_proc_per_node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MxJobMode {
    #[serde(rename = "MXTrain")]
    Train,
    #[serde(rename = "MXTune")]
    Tune,
}

/* --------- Jobs distribuidos --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TfJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_dynamic_worker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chief: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ps: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PytorchJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic_policy: Option<ElasticPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_proc_per_node: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpiJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots_per_worker: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launcher: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MxJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MxJobMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner_tracker: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner_server: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XgbJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaddleJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaskJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<KfReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<KfReplica>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RayJob {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_env: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ray_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<RayReplica>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<BTreeMap<String, RayReplica>>,
}

/* --------- DAG --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<Component>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
}

impl DagRun {
    pub fn operations(&self) -> &[Operation] {
        self.operations.as_deref().unwrap_or_default()
    }

    /// Índice nombre -> posición de cada op, para resolver `ops.<nombre>`.
    pub fn op_index(&self) -> BTreeMap<String, usize> {
        self.operations()
            .iter()
            .enumerate()
            .filter_map(|(i, op)| op.name.clone().map(|n| (n, i)))
            .collect()
    }

    /// Upstream de cada op: `dependencies` explícitas más los `ops.<x>` de sus params.
    pub fn upstream(&self, op: &Operation) -> Vec<String> {
        let mut deps: Vec<String> = op.dependencies.clone().unwrap_or_default();
        for p in op.params.iter().flat_map(|m| m.values()) {
            if let Some(name) = p.reference.as_deref().and_then(|r| r.strip_prefix("ops.")) {
                if !deps.iter().any(|d| d == name) {
                    deps.push(name.to_string());
                }
            }
        }
        deps
    }

    pub fn validate(&self) -> SchemaResult<()> {
        let index = self.op_index();
        if index.len() != self.operations().len() {
            return Err(SchemaError::validation(
                "run.operations",
                "cada op de un dag necesita un nombre único",
            ));
        }
        for op in self.operations() {
            for dep in self.upstream(op) {
                if !index.contains_key(&dep) {
                    return Err(SchemaError::validation(
                        format!("run.operations.{}", op.name.as_deref().unwrap_or_default()),
                        format!("depende de `{dep}`, que no existe en el dag"),
                    ));
                }
            }
        }
        self.check_cycles(&index)
    }

    fn check_cycles(&self, index: &BTreeMap<String, usize>) -> SchemaResult<()> {
        // 0 = sin visitar, 1 = en la pila, 2 = terminado
        fn visit(
            i: usize,
            dag: &DagRun,
            index: &BTreeMap<String, usize>,
            state: &mut Vec<u8>,
        ) -> bool {
            match state[i] {
                1 => return false,
                2 => return true,
                _ => {}
            }
            state[i] = 1;
            for dep in dag.upstream(&dag.operations()[i]) {
                if let Some(&j) = index.get(&dep) {
                    if !visit(j, dag, index, state) {
                        return false;
                    }
                }
            }
            state[i] = 2;
            true
        }

        let mut state = vec![0u8; self.operations().len()];
        for i in 0..state.len() {
            if !visit(i, self, index, &mut state) {
                return Err(SchemaError::validation("run.operations", "el dag tiene un ciclo"));
            }
        }
        Ok(())
    }
}

/* --------- Runtime --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Runtime {
    #[serde(rename = "job")]
    Job(JobRun),
    #[serde(rename = "service")]
    Service(ServiceRun),
    #[serde(rename = "dag")]
    Dag(DagRun),
    #[serde(rename = "tfjob")]
    TfJob(TfJob),
    #[serde(rename = "pytorchjob")]
    PytorchJob(PytorchJob),
    #[serde(rename = "mpijob")]
    MpiJob(MpiJob),
    #[serde(rename = "mxjob")]
    MxJob(MxJob),
    #[serde(rename = "xgbjob")]
    XgbJob(XgbJob),
    #[serde(rename = "paddlejob")]
    PaddleJob(PaddleJob),
    #[serde(rename = "daskjob")]
    DaskJob(DaskJob),
    #[serde(rename = "rayjob")]
    RayJob(RayJob),
    #[serde(rename = "notifier")]
    Notifier(BatchRun),
    #[serde(rename = "cleaner")]
    Cleaner(BatchRun),
    #[serde(rename = "tuner")]
    Tuner(BatchRun),
}

fn role<'a, T: PodTemplate>(out: &mut Vec<(String, &'a dyn PodTemplate)>, name: &str, r: &'a Option<T>) {
    if let Some(r) = r {
        out.push((name.to_string(), r as &dyn PodTemplate));
    }
}

impl Runtime {
    pub fn kind(&self) -> RunKind {
        match self {
            Runtime::Job(_) => RunKind::Job,
            Runtime::Service(_) => RunKind::Service,
            Runtime::Dag(_) => RunKind::Dag,
            Runtime::TfJob(_) => RunKind::TfJob,
            Runtime::PytorchJob(_) => RunKind::PytorchJob,
            Runtime::MpiJob(_) => RunKind::MpiJob,
            Runtime::MxJob(_) => RunKind::MxJob,
            Runtime::XgbJob(_) => RunKind::XgbJob,
            Runtime::PaddleJob(_) => RunKind::PaddleJob,
            Runtime::DaskJob(_) => RunKind::DaskJob,
            Runtime::RayJob(_) => RunKind::RayJob,
            Runtime::Notifier(_) => RunKind::Notifier,
            Runtime::Cleaner(_) => RunKind::Cleaner,
            Runtime::Tuner(_) => RunKind::Tuner,
        }
    }

    /// Lee un runtime desde JSON; un `kind` desconocido da `UnknownKind`.
    pub fn from_value(value: Value) -> SchemaResult<Self> {
        if let Some(kind) = value.get("kind").and_then(Value::as_str) {
            RunKind::parse(kind)?;
        }
        serde_json::from_value(value).map_err(|e| SchemaError::from_serde("run", e.to_string()))
    }

    /// Roles con pod, en el orden en que se emiten. Un runtime simple tiene un único rol `main`.
    pub fn roles(&self) -> Vec<(String, &dyn PodTemplate)> {
        let mut out: Vec<(String, &dyn PodTemplate)> = Vec::new();
        match self {
            Runtime::Job(r) => out.push(("main".into(), r)),
            Runtime::Service(r) => out.push(("main".into(), r)),
            Runtime::Notifier(r) | Runtime::Cleaner(r) | Runtime::Tuner(r) => {
                out.push(("main".into(), r))
            }
            Runtime::Dag(_) => {}
            Runtime::TfJob(r) => {
                role(&mut out, "Chief", &r.chief);
                role(&mut out, "PS", &r.ps);
                role(&mut out, "Worker", &r.worker);
                role(&mut out, "Evaluator", &r.evaluator);
            }
            Runtime::PytorchJob(r) => {
                role(&mut out, "Master", &r.master);
                role(&mut out, "Worker", &r.worker);
            }
            Runtime::MpiJob(r) => {
                role(&mut out, "Launcher", &r.launcher);
                role(&mut out, "Worker", &r.worker);
            }
            Runtime::MxJob(r) => {
                role(&mut out, "Scheduler", &r.scheduler);
                role(&mut out, "Server", &r.server);
                role(&mut out, "Worker", &r.worker);
                role(&mut out, "Tuner", &r.tuner);
                role(&mut out, "TunerTracker", &r.tuner_tracker);
                role(&mut out, "TunerServer", &r.tuner_server);
            }
            Runtime::XgbJob(r) => {
                role(&mut out, "Master", &r.master);
                role(&mut out, "Worker", &r.worker);
            }
            Runtime::PaddleJob(r) => {
                role(&mut out, "Master", &r.master);
                role(&mut out, "Worker", &r.worker);
            }
            Runtime::DaskJob(r) => {
                role(&mut out, "job", &r.job);
                role(&mut out, "worker", &r.worker);
                role(&mut out, "scheduler", &r.scheduler);
            }
            Runtime::RayJob(r) => {
                role(&mut out, "head", &r.head);
                for (name, w) in r.workers.iter().flatten() {
                    out.push((name.clone(), w as &dyn PodTemplate));
                }
            }
        }
        out
    }

    fn kf_replicas(&self) -> Vec<&KfReplica> {
        let all: Vec<&Option<KfReplica>> = match self {
            Runtime::TfJob(r) => vec![&r.chief, &r.ps, &r.worker, &r.evaluator],
            Runtime::PytorchJob(r) => vec![&r.master, &r.worker],
            Runtime::MpiJob(r) => vec![&r.launcher, &r.worker],
            Runtime::MxJob(r) => vec![
                &r.scheduler,
                &r.server,
                &r.worker,
                &r.tuner,
                &r.tuner_tracker,
                &r.tuner_server,
            ],
            Runtime::XgbJob(r) => vec![&r.master, &r.worker],
            Runtime::PaddleJob(r) => vec![&r.master, &r.worker],
            Runtime::DaskJob(r) => vec![&r.job, &r.worker, &r.scheduler],
            _ => vec![],
        };
        all.into_iter().flatten().collect()
    }

    pub fn validate(&self) -> SchemaResult<()> {
        for (_, r) in self.roles() {
            for init in r.init() {
                init.validate()?;
            }
        }
        match self {
            Runtime::Dag(d) => d.validate(),
            Runtime::RayJob(r) => {
                let head = r.head.as_ref().map_or(0, |h| h.replicas.unwrap_or(1));
                let workers: u32 = r
                    .workers
                    .iter()
                    .flatten()
                    .map(|(_, w)| w.replicas.unwrap_or(1))
                    .sum();
                if head + workers == 0 {
                    return Err(SchemaError::validation(
                        "run",
                        "un rayjob necesita al menos una réplica",
                    ));
                }
                for (name, w) in r.workers.iter().flatten() {
                    if let (Some(min), Some(max)) = (w.min_replicas, w.max_replicas) {
                        if min > max {
                            return Err(SchemaError::validation(
                                format!("run.workers.{name}"),
                                "minReplicas no puede superar maxReplicas",
                            ));
                        }
                    }
                }
                Ok(())
            }
            r if r.kind().is_distributed() => {
                if r.kf_replicas().iter().all(|x| x.num_replicas() == 0) {
                    return Err(SchemaError::validation(
                        "run",
                        format!("`{}` necesita al menos un rol con replicas >= 1", r.kind()),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn as_dag(&self) -> Option<&DagRun> {
        match self {
            Runtime::Dag(d) => Some(d),
            _ => None,
        }
    }

    /// Contenedor principal de los runtimes de un solo rol.
    pub fn main_container_mut(&mut self) -> Option<&mut Container> {
        match self {
            Runtime::Job(r) => r.container.as_mut(),
            Runtime::Service(r) => r.container.as_mut(),
            Runtime::Notifier(r) | Runtime::Cleaner(r) | Runtime::Tuner(r) => r.container.as_mut(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn runtime_discrimina_por_kind() {
        let r = Runtime::from_value(json!({"kind": "job", "container": {"image": "a/b:1"}})).unwrap();
        assert_eq!(r.kind(), RunKind::Job);
        assert_eq!(serde_json::to_value(&r).unwrap()["kind"], json!("job"));
    }

    #[test]
    fn kind_desconocido_es_unknown_kind() {
        let err = Runtime::from_value(json!({"kind": "foojob"})).unwrap_err();
        assert_eq!(err, SchemaError::UnknownKind("foojob".into()));
    }

    #[test]
    fn tfjob_lee_politicas_y_roles() {
        let r = Runtime::from_value(json!({
            "kind": "tfjob",
            "cleanPodPolicy": "Running",
            "schedulingPolicy": {"minAvailable": 1},
            "chief": {"replicas": 1, "container": {"image": "tf"}},
            "worker": {"replicas": 2, "container": {"image": "tf"}}
        }))
        .unwrap();
        let roles: Vec<String> = r.roles().into_iter().map(|(n, _)| n).collect();
        assert_eq!(roles, vec!["Chief", "Worker"]);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn distribuido_con_cero_replicas_es_invalido() {
        let r = Runtime::from_value(json!({
            "kind": "pytorchjob",
            "master": {"replicas": 0},
            "worker": {"replicas": 0}
        }))
        .unwrap();
        assert!(r.validate().is_err());
    }

    #[test]
    fn replicas_negativas_fallan_al_leer() {
        assert!(Runtime::from_value(json!({"kind": "tfjob", "worker": {"replicas": -1}})).is_err());
    }

    #[test]
    fn dag_detecta_ciclos_y_dependencias_faltantes() {
        let cyclic = Runtime::from_value(json!({
            "kind": "dag",
            "operations": [
                {"name": "a", "dependencies": ["b"], "hubRef": "x"},
                {"name": "b", "params": {"p": {"ref": "ops.a", "value": "outputs.y"}}, "hubRef": "x"}
            ]
        }))
        .unwrap();
        assert!(cyclic.validate().is_err());

        let missing = Runtime::from_value(json!({
            "kind": "dag",
            "operations": [{"name": "a", "dependencies": ["z"], "hubRef": "x"}]
        }))
        .unwrap();
        assert!(missing.validate().is_err());
    }

    #[test]
    fn rayjob_min_mayor_que_max_es_invalido() {
        let r = Runtime::from_value(json!({
            "kind": "rayjob",
            "head": {"container": {"image": "ray"}},
            "workers": {"small": {"minReplicas": 3, "maxReplicas": 1}}
        }))
        .unwrap();
        assert!(r.validate().is_err());
    }
}
