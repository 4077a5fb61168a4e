//! Contextos que alimentan el render de plantillas: `globals`, `init`,
//! `connections`, URLs de servicio y un subárbol por réplica u op de dag.

use chrono::{DateTime, Utc};
use common::connections::Connection;
use common::runs::{PodTemplate, Runtime};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const SERVICES_PATH: &str = "/services/v1";
pub const REWRITE_SERVICES_PATH: &str = "/rewrite-services/v1";
pub const EXTERNAL_SERVICES_PATH: &str = "/external/v1";

/// Identidad de la run que se está compilando. Todo es opcional: compilar sin
/// run (por ejemplo al validar) deja esos valores en `null`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    pub owner: Option<String>,
    pub project: Option<String>,
    pub run_uuid: Option<Uuid>,
    pub run_name: Option<String>,
    pub namespace: Option<String>,
    pub iteration: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub compiled_at: Option<DateTime<Utc>>,
    pub schedule_at: Option<DateTime<Utc>>,
    pub artifacts_root: Option<String>,
}

impl RunContext {
    pub fn uuid_str(&self) -> Option<String> {
        self.run_uuid.map(|u| u.simple().to_string())
    }

    /// `<artifactsRoot>/<uuid>`
    pub fn run_artifacts_path(&self) -> Option<String> {
        let root = self.artifacts_root.as_deref()?;
        Some(format!("{}/{}", root.trim_end_matches('/'), self.uuid_str()?))
    }

    pub fn run_outputs_path(&self) -> Option<String> {
        self.run_artifacts_path().map(|p| format!("{p}/outputs"))
    }
}

/// `{service}/{namespace}/{owner}/{project}/runs/{uuid}[/{port}][/{subpath}]`
pub fn service_url(
    service: &str,
    namespace: &str,
    owner: &str,
    project: &str,
    uuid: &str,
    port: Option<u16>,
    subpath: Option<&str>,
) -> String {
    let mut url = format!("{service}/{namespace}/{owner}/{project}/runs/{uuid}");
    if let Some(p) = port {
        url.push_str(&format!("/{p}"));
    }
    if let Some(s) = subpath.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) {
        url.push('/');
        url.push_str(s);
    }
    url
}

fn opt_str(v: Option<String>) -> Value {
    v.map(Value::String).unwrap_or(Value::Null)
}

fn opt_time(v: Option<DateTime<Utc>>) -> Value {
    v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
}

/// Puertos y URLs de un servicio (vacío para el resto de los kinds).
fn service_info(run: &Runtime, ctx: &RunContext, external_host: bool) -> (Vec<u16>, Value, Vec<Value>) {
    let svc = match run {
        Runtime::Service(s) => s,
        _ => return (Vec::new(), Value::Null, Vec::new()),
    };
    let ports = svc.ports.clone().unwrap_or_default();
    let (Some(ns), Some(owner), Some(project), Some(uuid)) = (
        ctx.namespace.as_deref(),
        ctx.owner.as_deref(),
        ctx.project.as_deref(),
        ctx.uuid_str(),
    ) else {
        return (ports, Value::Null, Vec::new());
    };
    let service = if external_host || svc.is_external.unwrap_or(false) {
        EXTERNAL_SERVICES_PATH
    } else if svc.rewrite_path.unwrap_or(false) {
        REWRITE_SERVICES_PATH
    } else {
        SERVICES_PATH
    };
    let base = service_url(service, ns, owner, project, &uuid, None, None);
    let urls = ports
        .iter()
        .map(|p| Value::String(service_url(service, ns, owner, project, &uuid, Some(*p), None)))
        .collect();
    (ports, Value::String(base), urls)
}

pub fn globals(
    run: &Runtime,
    ctx: &RunContext,
    artifacts_store: Option<&Connection>,
    external_host: bool,
) -> Value {
    let (ports, base_url, base_urls) = service_info(run, ctx, external_host);
    let unique = match (&ctx.owner, &ctx.project) {
        (Some(o), Some(p)) => Value::String(format!("{o}.{p}")),
        _ => Value::Null,
    };
    json!({
        "namespace": opt_str(ctx.namespace.clone()),
        "owner_name": opt_str(ctx.owner.clone()),
        "project_name": opt_str(ctx.project.clone()),
        "project_unique_name": unique,
        "uuid": opt_str(ctx.uuid_str()),
        "run_uuid": opt_str(ctx.uuid_str()),
        "name": opt_str(ctx.run_name.clone()),
        "run_name": opt_str(ctx.run_name.clone()),
        "iteration": ctx.iteration.map(Value::from).unwrap_or(Value::Null),
        "created_at": opt_time(ctx.created_at),
        "compiled_at": opt_time(ctx.compiled_at),
        "schedule_at": opt_time(ctx.schedule_at),
        "store_path": opt_str(artifacts_store.and_then(Connection::store_path)),
        "artifacts_path": opt_str(ctx.artifacts_root.clone()),
        "run_artifacts_path": opt_str(ctx.run_artifacts_path()),
        "run_outputs_path": opt_str(ctx.run_outputs_path()),
        "ports": ports,
        "base_url": base_url,
        "base_urls": base_urls,
    })
}

fn pod_contexts(pod: &dyn PodTemplate, connections: &BTreeMap<String, Connection>) -> (Map<String, Value>, Map<String, Value>) {
    let mut init = Map::new();
    for i in pod.init() {
        if let Some(name) = &i.connection {
            let v = connections.get(name).map(Connection::context_value).unwrap_or_else(|| json!({}));
            init.insert(name.clone(), v);
        }
    }
    let mut conns = Map::new();
    for name in pod.connections() {
        let v = connections.get(name).map(Connection::context_value).unwrap_or_else(|| json!({}));
        conns.insert(name.clone(), v);
    }
    (init, conns)
}

/// Contexto completo para el render del `run`.
pub fn resolve_contexts(
    run: &Runtime,
    ctx: &RunContext,
    connections: &BTreeMap<String, Connection>,
    artifacts_store: Option<&Connection>,
    external_host: bool,
) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("globals".into(), globals(run, ctx, artifacts_store, external_host));

    let mut init = Map::new();
    let mut conns = Map::new();
    let mut replicas = Map::new();
    for (role, pod) in run.roles() {
        let (i, c) = pod_contexts(pod, connections);
        init.extend(i.clone());
        conns.extend(c.clone());
        if run.kind().is_distributed() {
            replicas.insert(role, json!({"init": i, "connections": c}));
        }
    }
    if let Runtime::Dag(dag) = run {
        for name in dag.connections.iter().flatten() {
            let v = connections.get(name).map(Connection::context_value).unwrap_or_else(|| json!({}));
            conns.insert(name.clone(), v);
        }
        let mut ops = Map::new();
        for op in dag.operations() {
            if let Some(name) = &op.name {
                ops.insert(
                    name.clone(),
                    json!({"name": name, "upstream": dag.upstream(op)}),
                );
            }
        }
        out.insert("ops".into(), Value::Object(ops));
    }
    out.insert("init".into(), Value::Object(init));
    out.insert("connections".into(), Value::Object(conns));
    if !replicas.is_empty() {
        out.insert("replicas".into(), Value::Object(replicas));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext {
            owner: Some("acme".into()),
            project: Some("mnist".into()),
            run_uuid: Some(Uuid::parse_str("6b1e1e6e-62a8-4a4b-9b1e-6d3d2b8f0c11").unwrap()),
            run_name: Some("train".into()),
            namespace: Some("plx".into()),
            artifacts_root: Some("/plx-context/artifacts".into()),
            ..Default::default()
        }
    }

    fn conns() -> BTreeMap<String, Connection> {
        let c: Connection = serde_json::from_value(json!({
            "name": "data", "kind": "s3", "schema": {"bucket": "s3://data"}
        }))
        .unwrap();
        BTreeMap::from([("data".to_string(), c)])
    }

    #[test]
    fn url_de_servicio_con_puerto_y_subpath() {
        assert_eq!(
            service_url(SERVICES_PATH, "ns", "o", "p", "u", Some(8888), Some("/lab/")),
            "/services/v1/ns/o/p/runs/u/8888/lab"
        );
        assert_eq!(service_url(SERVICES_PATH, "ns", "o", "p", "u", None, None), "/services/v1/ns/o/p/runs/u");
    }

    #[test]
    fn globals_de_un_servicio() {
        let run = Runtime::from_value(json!({"kind": "service", "ports": [6006, 8888]})).unwrap();
        let g = globals(&run, &ctx(), None, false);
        assert_eq!(g["owner_name"], "acme");
        assert_eq!(g["ports"], json!([6006, 8888]));
        assert_eq!(
            g["base_url"],
            "/services/v1/plx/acme/mnist/runs/6b1e1e6e62a84a4b9b1e6d3d2b8f0c11"
        );
        assert_eq!(g["base_urls"].as_array().unwrap().len(), 2);
        assert_eq!(
            g["run_outputs_path"],
            "/plx-context/artifacts/6b1e1e6e62a84a4b9b1e6d3d2b8f0c11/outputs"
        );
    }

    #[test]
    fn init_y_conexiones_con_schema_o_vacio() {
        let run = Runtime::from_value(json!({
            "kind": "job",
            "connections": ["data", "opaca"],
            "init": [{"connection": "data", "artifacts": {"files": ["a"]}}]
        }))
        .unwrap();
        let c = resolve_contexts(&run, &ctx(), &conns(), None, false);
        assert_eq!(c["init"]["data"], json!({"bucket": "s3://data"}));
        assert_eq!(c["connections"]["opaca"], json!({}));
        assert!(c.get("replicas").is_none());
    }

    #[test]
    fn distribuidos_tienen_subarbol_por_rol() {
        let run = Runtime::from_value(json!({
            "kind": "pytorchjob",
            "master": {"replicas": 1, "connections": ["data"]},
            "worker": {"replicas": 2}
        }))
        .unwrap();
        let c = resolve_contexts(&run, &ctx(), &conns(), None, false);
        assert_eq!(c["replicas"]["Master"]["connections"]["data"]["bucket"], "s3://data");
        assert!(c["replicas"]["Worker"].is_object());
    }
}
