//! Custom resource `core.polyaxon.com/v1 Operation`.

use common::environment::Environment;
use common::k8s::Container;
use common::names;
use common::runs::{BatchRun, KfReplica, PodTemplate, RayReplica};
use common::{CompiledOperation, RunKind, Runtime};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::{build_pod, preset_batch_container, ConverterContext, PodParts};
use crate::error::{CompilerError, CompilerResult};

pub const API_GROUP: &str = "core.polyaxon.com";
pub const API_VERSION: &str = "core.polyaxon.com/v1";
pub const RESOURCE_KIND: &str = "Operation";
pub const RESOURCE_PLURAL: &str = "operations";

pub const PART_OF: &str = "polyaxon-core";
pub const COMPONENT: &str = "polyaxon-workers";
pub const MANAGED_BY: &str = "polyaxon";

/// Clave del spec para cada kind; `None` para los que no se emiten (dag).
pub fn kind_spec_key(kind: RunKind) -> Option<&'static str> {
    match kind {
        RunKind::Job => Some("jobSpec"),
        RunKind::Service => Some("serviceSpec"),
        RunKind::TfJob => Some("tfJobSpec"),
        RunKind::PytorchJob => Some("pytorchJobSpec"),
        RunKind::MpiJob => Some("mpiJobSpec"),
        RunKind::MxJob => Some("mxJobSpec"),
        RunKind::XgbJob => Some("xgbJobSpec"),
        RunKind::PaddleJob => Some("paddleJobSpec"),
        RunKind::DaskJob => Some("daskJobSpec"),
        RunKind::RayJob => Some("rayJobSpec"),
        RunKind::Notifier | RunKind::Cleaner | RunKind::Tuner => Some("batchJobSpec"),
        RunKind::Dag => None,
    }
}

pub fn resource_name(kind: RunKind, run_uuid: &uuid::Uuid) -> String {
    match kind {
        RunKind::Cleaner => names::cleaner_resource_name(run_uuid),
        _ => names::resource_name(run_uuid),
    }
}

/* --------- Metadata --------- */

pub fn labels(ctx: &ConverterContext, kind: RunKind) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let name = ctx.run.run_name.as_deref().unwrap_or("operation");
    labels.insert("app.kubernetes.io/name".into(), names::truncate_label(name));
    labels.insert("app.kubernetes.io/instance".into(), ctx.run.uuid_str().unwrap_or_default());
    labels.insert("app.kubernetes.io/version".into(), names::truncate_label(&ctx.version));
    labels.insert("app.kubernetes.io/part-of".into(), PART_OF.into());
    labels.insert("app.kubernetes.io/component".into(), COMPONENT.into());
    labels.insert("app.kubernetes.io/managed-by".into(), MANAGED_BY.into());
    labels.insert("polyaxon.com/kind".into(), kind.to_string());
    if let Some(owner) = &ctx.run.owner {
        labels.insert("polyaxon.com/owner".into(), names::truncate_label(owner));
    }
    if let Some(project) = &ctx.run.project {
        labels.insert("polyaxon.com/project".into(), names::truncate_label(project));
    }
    labels
}

fn to_value<T: Serialize>(v: &T) -> CompilerResult<Value> {
    serde_json::to_value(v).map_err(|e| CompilerError::validation("resource", e.to_string()))
}

fn insert_opt<T: Serialize>(map: &mut Map<String, Value>, key: &str, v: &Option<T>) -> CompilerResult<()> {
    if let Some(v) = v {
        map.insert(key.to_string(), to_value(v)?);
    }
    Ok(())
}

/* --------- Pod template --------- */

fn pod_spec(ctx: &ConverterContext, parts: PodParts, env: Option<&Environment>) -> CompilerResult<Value> {
    let default_env = Environment::default();
    let env = env.unwrap_or(&default_env);
    let mut spec = Map::new();
    if !parts.init_containers.is_empty() {
        spec.insert("initContainers".into(), to_value(&parts.init_containers)?);
    }
    spec.insert("containers".into(), to_value(&parts.containers)?);
    spec.insert("volumes".into(), to_value(&parts.volumes)?);
    spec.insert(
        "restartPolicy".into(),
        Value::from(env.restart_policy.clone().unwrap_or_else(|| "Never".to_string())),
    );
    let sa = env.service_account_name.clone().or_else(|| ctx.settings.default_sa.clone());
    insert_opt(&mut spec, "serviceAccountName", &sa)?;
    insert_opt(&mut spec, "nodeSelector", &env.node_selector)?;
    insert_opt(&mut spec, "affinity", &env.affinity)?;
    insert_opt(&mut spec, "tolerations", &env.tolerations)?;
    insert_opt(&mut spec, "nodeName", &env.node_name)?;
    insert_opt(&mut spec, "hostAliases", &env.host_aliases)?;
    insert_opt(&mut spec, "securityContext", &env.security_context)?;
    if let Some(secrets) = &env.image_pull_secrets {
        let refs: Vec<Value> = secrets.iter().map(|s| json!({ "name": s })).collect();
        spec.insert("imagePullSecrets".into(), Value::Array(refs));
    }
    insert_opt(&mut spec, "hostNetwork", &env.host_network)?;
    insert_opt(&mut spec, "hostPID", &env.host_pid)?;
    insert_opt(&mut spec, "dnsPolicy", &env.dns_policy)?;
    insert_opt(&mut spec, "dnsConfig", &env.dns_config)?;
    insert_opt(&mut spec, "schedulerName", &env.scheduler_name)?;
    insert_opt(&mut spec, "priorityClassName", &env.priority_class_name)?;
    insert_opt(&mut spec, "priority", &env.priority)?;
    Ok(Value::Object(spec))
}

/// `{metadata, spec}` de un rol; las etiquetas del environment se suman a las de la run.
fn template(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    role: &str,
    pod: &dyn PodTemplate,
    ports: &[u16],
) -> CompilerResult<Value> {
    let parts = build_pod(ctx, compiled, role, pod, ports)?;
    let env = pod.environment();
    let mut pod_labels = labels(ctx, compiled.run_kind());
    if let Some(extra) = env.and_then(|e| e.labels.as_ref()) {
        for (k, v) in extra {
            pod_labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    let mut metadata = json!({ "labels": pod_labels });
    if let Some(annotations) = env.and_then(|e| e.annotations.as_ref()) {
        metadata["annotations"] = to_value(annotations)?;
    }
    Ok(json!({
        "metadata": metadata,
        "spec": pod_spec(ctx, parts, env)?,
    }))
}

fn restart_policy(pod: &dyn PodTemplate) -> String {
    pod.environment()
        .and_then(|e| e.restart_policy.clone())
        .unwrap_or_else(|| "Never".to_string())
}

/* --------- Specs por kind --------- */

fn replica_specs(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    roles: &[(&str, &Option<KfReplica>)],
) -> CompilerResult<Value> {
    let mut specs = Map::new();
    for (role, replica) in roles {
        if let Some(r) = replica {
            specs.insert(
                role.to_string(),
                json!({
                    "replicas": r.num_replicas(),
                    "restartPolicy": restart_policy(r),
                    "template": template(ctx, compiled, role, r, &[])?,
                }),
            );
        }
    }
    Ok(Value::Object(specs))
}

fn kubeflow_spec<P: Serialize>(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    policies: &P,
    roles: &[(&str, &Option<KfReplica>)],
) -> CompilerResult<Value> {
    let mut spec = match to_value(policies)? {
        Value::Object(m) => m,
        _ => Map::new(),
    };
    spec.insert("replicaSpecs".into(), replica_specs(ctx, compiled, roles)?);
    Ok(Value::Object(spec))
}

fn batch_spec(ctx: &ConverterContext, compiled: &CompiledOperation, run: &BatchRun) -> CompilerResult<Value> {
    let mut run = run.clone();
    run.container = Some(preset_batch_container(
        compiled.run_kind(),
        run.container.as_ref(),
        &ctx.settings,
    ));
    Ok(json!({ "template": template(ctx, compiled, "main", &run, &[])? }))
}

fn ray_replica(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    role: &str,
    r: &RayReplica,
) -> CompilerResult<Value> {
    let mut spec = Map::new();
    insert_opt(&mut spec, "groupName", &r.group_name)?;
    spec.insert("replicas".into(), Value::from(r.replicas.unwrap_or(1)));
    insert_opt(&mut spec, "minReplicas", &r.min_replicas)?;
    insert_opt(&mut spec, "maxReplicas", &r.max_replicas)?;
    insert_opt(&mut spec, "rayStartParams", &r.ray_start_params)?;
    spec.insert("template".into(), template(ctx, compiled, role, r, &[])?);
    Ok(Value::Object(spec))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Policies<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    clean_pod_policy: Option<&'a common::runs::CleanPodPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduling_policy: Option<&'a common::runs::SchedulingPolicy>,
}

fn kind_spec(ctx: &ConverterContext, compiled: &CompiledOperation) -> CompilerResult<Value> {
    match &compiled.run {
        Runtime::Job(r) => Ok(json!({ "template": template(ctx, compiled, "main", r, &[])? })),
        Runtime::Service(r) => {
            let ports = r.ports.clone().unwrap_or_default();
            let mut spec = Map::new();
            spec.insert("template".into(), template(ctx, compiled, "main", r, &ports)?);
            if !ports.is_empty() {
                spec.insert("ports".into(), to_value(&ports)?);
            }
            spec.insert("replicas".into(), Value::from(r.replicas.unwrap_or(1)));
            spec.insert("isExternal".into(), Value::from(r.is_external.unwrap_or(false)));
            insert_opt(&mut spec, "rewritePath", &r.rewrite_path)?;
            Ok(Value::Object(spec))
        }
        Runtime::TfJob(r) => {
            let mut spec = kubeflow_spec(
                ctx,
                compiled,
                &Policies {
                    clean_pod_policy: r.clean_pod_policy.as_ref(),
                    scheduling_policy: r.scheduling_policy.as_ref(),
                },
                &[("Chief", &r.chief), ("PS", &r.ps), ("Worker", &r.worker), ("Evaluator", &r.evaluator)],
            )?;
            if let Value::Object(m) = &mut spec {
                insert_opt(m, "enableDynamicWorker", &r.enable_dynamic_worker)?;
                insert_opt(m, "successPolicy", &r.success_policy)?;
            }
            Ok(spec)
        }
        Runtime::PytorchJob(r) => {
            let mut spec = kubeflow_spec(
                ctx,
                compiled,
                &Policies {
                    clean_pod_policy: r.clean_pod_policy.as_ref(),
                    scheduling_policy: r.scheduling_policy.as_ref(),
                },
                &[("Master", &r.master), ("Worker", &r.worker)],
            )?;
            if let Value::Object(m) = &mut spec {
                insert_opt(m, "elasticPolicy", &r.elastic_policy)?;
                insert_opt(m, "nprocPerNode", &r.n_proc_per_node)?;
            }
            Ok(spec)
        }
        Runtime::MpiJob(r) => {
            let mut spec = kubeflow_spec(
                ctx,
                compiled,
                &Policies {
                    clean_pod_policy: r.clean_pod_policy.as_ref(),
                    scheduling_policy: r.scheduling_policy.as_ref(),
                },
                &[("Launcher", &r.launcher), ("Worker", &r.worker)],
            )?;
            if let Value::Object(m) = &mut spec {
                insert_opt(m, "slotsPerWorker", &r.slots_per_worker)?;
                insert_opt(m, "implementation", &r.implementation)?;
            }
            Ok(spec)
        }
        Runtime::MxJob(r) => {
            let mut spec = kubeflow_spec(
                ctx,
                compiled,
                &Policies {
                    clean_pod_policy: r.clean_pod_policy.as_ref(),
                    scheduling_policy: r.scheduling_policy.as_ref(),
                },
                &[
                    ("Scheduler", &r.scheduler),
                    ("Server", &r.server),
                    ("Worker", &r.worker),
                    ("Tuner", &r.tuner),
                    ("TunerTracker", &r.tuner_tracker),
                    ("TunerServer", &r.tuner_server),
                ],
            )?;
            if let Value::Object(m) = &mut spec {
                insert_opt(m, "mode", &r.mode)?;
            }
            Ok(spec)
        }
        Runtime::XgbJob(r) => kubeflow_spec(
            ctx,
            compiled,
            &Policies {
                clean_pod_policy: r.clean_pod_policy.as_ref(),
                scheduling_policy: r.scheduling_policy.as_ref(),
            },
            &[("Master", &r.master), ("Worker", &r.worker)],
        ),
        Runtime::PaddleJob(r) => kubeflow_spec(
            ctx,
            compiled,
            &Policies {
                clean_pod_policy: r.clean_pod_policy.as_ref(),
                scheduling_policy: r.scheduling_policy.as_ref(),
            },
            &[("Master", &r.master), ("Worker", &r.worker)],
        ),
        Runtime::DaskJob(r) => {
            let mut spec = Map::new();
            for (role, replica) in [("job", &r.job), ("worker", &r.worker), ("scheduler", &r.scheduler)] {
                if let Some(rep) = replica {
                    spec.insert(
                        role.into(),
                        json!({
                            "replicas": rep.num_replicas(),
                            "template": template(ctx, compiled, role, rep, &[])?,
                        }),
                    );
                }
            }
            Ok(Value::Object(spec))
        }
        Runtime::RayJob(r) => {
            let mut spec = Map::new();
            insert_opt(&mut spec, "entrypoint", &r.entrypoint)?;
            insert_opt(&mut spec, "runtimeEnv", &r.runtime_env)?;
            insert_opt(&mut spec, "metadata", &r.metadata)?;
            insert_opt(&mut spec, "rayVersion", &r.ray_version)?;
            if let Some(head) = &r.head {
                spec.insert("head".into(), ray_replica(ctx, compiled, "head", head)?);
            }
            if let Some(workers) = &r.workers {
                let mut out = Map::new();
                for (name, w) in workers {
                    let mut w = w.clone();
                    w.group_name.get_or_insert_with(|| name.clone());
                    out.insert(name.clone(), ray_replica(ctx, compiled, name, &w)?);
                }
                spec.insert("workers".into(), Value::Object(out));
            }
            Ok(Value::Object(spec))
        }
        Runtime::Notifier(r) | Runtime::Cleaner(r) | Runtime::Tuner(r) => batch_spec(ctx, compiled, r),
        Runtime::Dag(_) => Err(CompilerError::UnsupportedKind(RunKind::Dag.to_string())),
    }
}

/* --------- Recurso --------- */

/// Convierte una operación compilada al custom resource que aplica el executor.
pub fn to_k8s_resource(compiled: &CompiledOperation, ctx: &ConverterContext) -> CompilerResult<Value> {
    let kind = compiled.run_kind();
    let key = kind_spec_key(kind).ok_or_else(|| CompilerError::UnsupportedKind(kind.to_string()))?;
    let uuid = ctx.run_uuid()?;
    let plugins = compiled.plugins();
    let termination = compiled.termination();

    let mut term = Map::new();
    insert_opt(&mut term, "backoffLimit", &termination.max_retries)?;
    insert_opt(&mut term, "activeDeadlineSeconds", &termination.timeout)?;
    insert_opt(&mut term, "ttlSecondsAfterFinished", &termination.ttl)?;

    let mut spec = Map::new();
    spec.insert(key.to_string(), kind_spec(ctx, compiled)?);
    spec.insert("termination".into(), Value::Object(term));
    spec.insert("collectLogs".into(), Value::from(plugins.collect_logs()));
    spec.insert("syncStatuses".into(), Value::from(plugins.sync_statuses()));
    spec.insert("notifications".into(), to_value(&plugins.notifications())?);

    let mut annotations = BTreeMap::new();
    if let Some(name) = &compiled.name {
        annotations.insert("operation.polyaxon.com/name".to_string(), name.clone());
    }
    if let Some(queue) = &compiled.queue {
        annotations.insert("operation.polyaxon.com/queue".to_string(), queue.clone());
    }

    Ok(json!({
        "apiVersion": API_VERSION,
        "kind": RESOURCE_KIND,
        "metadata": {
            "name": resource_name(kind, &uuid),
            "namespace": ctx.namespace(compiled),
            "labels": labels(ctx, kind),
            "annotations": annotations,
        },
        "spec": spec,
    }))
}

/// Contenedor principal del primer rol, útil para inspeccionar el resultado.
pub fn main_container_of(resource: &Value, key: &str) -> Option<Container> {
    let spec = resource.get("spec")?.get(key)?;
    let template = spec.get("template").or_else(|| {
        spec.get("replicaSpecs")
            .and_then(Value::as_object)
            .and_then(|m| m.values().next())
            .and_then(|r| r.get("template"))
    })?;
    let c = template.pointer("/spec/containers/0")?;
    serde_json::from_value(c.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::RunContext;
    use crate::loader::MemoryLoader;
    use crate::resolver::{compile, CompileOptions};
    use common::reader::{read_compiled_operation, read_operation};
    use common::settings::AgentSettings;
    use uuid::Uuid;

    fn ctx(name: &str) -> ConverterContext {
        let run = RunContext {
            run_uuid: Some(Uuid::parse_str("0b6c8b1e-7d9f-4a8a-9a43-2f3f8a6e7c11").unwrap()),
            run_name: Some(name.to_string()),
            owner: Some("acme".into()),
            project: Some("mnist".into()),
            ..Default::default()
        };
        let settings = AgentSettings {
            namespace: Some("polyaxon".into()),
            ..Default::default()
        };
        ConverterContext::new(run, settings)
    }

    const S1: &str = r#"
version: 1.1
kind: operation
params:
  image: {value: "a/b:1"}
component:
  inputs: [{name: image, type: str}]
  run:
    kind: job
    container: {image: "{{ image }}"}
"#;

    #[test]
    fn job_simple_compila_y_convierte() {
        let op = read_operation(S1).unwrap();
        let opts = CompileOptions {
            run: ctx("train").run,
            ..Default::default()
        };
        let compiled = compile(&op, &MemoryLoader::default(), &opts).unwrap();
        let resource = to_k8s_resource(&compiled, &ctx("train")).unwrap();

        assert_eq!(resource["apiVersion"], "core.polyaxon.com/v1");
        assert_eq!(resource["metadata"]["name"], "plx-operation-0b6c8b1e7d9f4a8a9a432f3f8a6e7c11");
        assert_eq!(resource["metadata"]["namespace"], "polyaxon");
        let containers = resource["spec"]["jobSpec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap();
        assert_eq!(containers[0]["image"], "a/b:1");
        let mains = containers.iter().filter(|c| c["name"] == "polyaxon-main").count();
        assert_eq!(mains, 1);
        assert_eq!(resource["spec"]["jobSpec"]["template"]["spec"]["restartPolicy"], "Never");
        assert_eq!(resource["spec"]["collectLogs"], true);
        assert_eq!(
            main_container_of(&resource, "jobSpec").unwrap().image.as_deref(),
            Some("a/b:1")
        );
    }

    const TF: &str = r#"
version: 1.1
kind: compiled_operation
termination: {maxRetries: 4}
plugins: {collectLogs: false, collectArtifacts: false}
run:
  kind: tfjob
  cleanPodPolicy: Running
  schedulingPolicy: {minAvailable: 1}
  chief: {replicas: 1, container: {image: "tf:2"}}
  worker: {replicas: 2, container: {image: "tf:2"}}
"#;

    #[test]
    fn tfjob_distribuido() {
        let compiled = read_compiled_operation(TF).unwrap();
        let resource = to_k8s_resource(&compiled, &ctx("tf")).unwrap();
        let spec = &resource["spec"]["tfJobSpec"];
        assert_eq!(spec["cleanPodPolicy"], "Running");
        assert_eq!(spec["schedulingPolicy"]["minAvailable"], 1);
        assert_eq!(spec["replicaSpecs"]["Chief"]["replicas"], 1);
        assert_eq!(spec["replicaSpecs"]["Worker"]["replicas"], 2);
        assert!(spec["replicaSpecs"].get("PS").is_none());
        assert_eq!(resource["spec"]["termination"]["backoffLimit"], 4);
        let containers = spec["replicaSpecs"]["Worker"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap();
        assert_eq!(containers.len(), 1);
    }

    #[test]
    fn etiquetas_estandar_y_nombre_truncado() {
        let long = "x".repeat(80);
        let compiled = read_compiled_operation(TF).unwrap();
        let resource = to_k8s_resource(&compiled, &ctx(&long)).unwrap();
        let labels = resource["metadata"]["labels"].as_object().unwrap();
        for key in ["name", "instance", "version", "part-of", "component", "managed-by"] {
            assert!(labels.contains_key(&format!("app.kubernetes.io/{key}")), "{key}");
        }
        assert_eq!(labels["app.kubernetes.io/name"].as_str().unwrap().len(), 63);
        assert_eq!(labels["app.kubernetes.io/managed-by"], "polyaxon");
    }

    #[test]
    fn conversion_determinista() {
        let compiled = read_compiled_operation(TF).unwrap();
        let a = serde_json::to_string(&to_k8s_resource(&compiled, &ctx("tf")).unwrap()).unwrap();
        let b = serde_json::to_string(&to_k8s_resource(&compiled, &ctx("tf")).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn nombres_de_contenedores_son_dns_1123() {
        let compiled = read_compiled_operation(
            r#"
version: 1.1
kind: compiled_operation
run:
  kind: job
  init:
    - {file: {content: "hola", filename: "a.txt"}}
    - {container: {name: Custom_Step, image: "busybox"}}
  container: {image: "a/b:1"}
"#,
        )
        .unwrap();
        let resource = to_k8s_resource(&compiled, &ctx("j")).unwrap();
        let inits = resource["spec"]["jobSpec"]["template"]["spec"]["initContainers"]
            .as_array()
            .unwrap();
        assert_eq!(inits.len(), 2);
        for c in inits {
            assert!(names::is_dns_label(c["name"].as_str().unwrap()));
        }
    }

    #[test]
    fn cleaner_usa_imagen_y_nombre_propios() {
        let compiled = read_compiled_operation(
            "version: 1.1\nkind: compiled_operation\nrun: {kind: cleaner}\n",
        )
        .unwrap();
        let resource = to_k8s_resource(&compiled, &ctx("c")).unwrap();
        assert!(resource["metadata"]["name"].as_str().unwrap().starts_with("plx-cleaner-"));
        let c = main_container_of(&resource, "batchJobSpec").unwrap();
        assert_eq!(c.command.unwrap(), vec!["polyaxon", "clean-ops"]);
    }

    #[test]
    fn dag_no_se_convierte() {
        let compiled = read_compiled_operation(
            "version: 1.1\nkind: compiled_operation\nrun: {kind: dag, operations: []}\n",
        )
        .unwrap();
        assert_eq!(
            to_k8s_resource(&compiled, &ctx("d")).unwrap_err(),
            CompilerError::UnsupportedKind("dag".into())
        );
    }
}
