//! Contenedor principal `polyaxon-main`.

use common::init::Init;
use common::io::{Io, IoType};
use common::k8s::{Container, ContainerPort, EnvVar, Volume};
use common::plugins::Plugins;
use common::runs::PodTemplate;
use common::CompiledOperation;
use serde_json::Value;

use super::{
    agent_env, apply_defaults, artifacts_store_parts, connections_parts, context_mount,
    docker_mount, docker_volume, merge_env, merge_env_from, merge_mounts, shm_mount, shm_volume,
    ConnectionParts, MAIN_JOB_CONTAINER,
};
use crate::converters::ConverterContext;
use crate::error::{CompilerError, CompilerResult};

fn env_value(io: &Io, value: &Value) -> String {
    match io.validate_value(value) {
        Ok(v) => v.to_env_string(),
        Err(_) => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Variables pedidas con `toEnv` en los IO.
pub fn io_env(compiled: &CompiledOperation) -> Vec<EnvVar> {
    compiled
        .all_io()
        .filter_map(|io| {
            let name = io.to_env.as_ref()?;
            let value = io.value.as_ref()?;
            Some(EnvVar::new(name.clone(), env_value(io, value)))
        })
        .collect()
}

/// Entradas de init que generan los IO con `toInit`.
pub fn io_inits(compiled: &CompiledOperation) -> Vec<Init> {
    compiled
        .all_io()
        .filter(|io| io.to_init.unwrap_or(false))
        .filter_map(|io| {
            let value = io.value.clone()?;
            let connection = io.connection.clone();
            let init = match io.io_type() {
                IoType::Git => Init {
                    git: serde_json::from_value(value).ok(),
                    connection,
                    ..Default::default()
                },
                IoType::Dockerfile => Init {
                    dockerfile: serde_json::from_value(value).ok(),
                    ..Default::default()
                },
                IoType::File => Init {
                    file: serde_json::from_value(value).ok(),
                    ..Default::default()
                },
                IoType::Tensorboard => Init {
                    tensorboard: serde_json::from_value(value).ok(),
                    connection,
                    ..Default::default()
                },
                IoType::Artifacts => Init {
                    artifacts: serde_json::from_value(value).ok(),
                    connection,
                    ..Default::default()
                },
                _ => {
                    let path = match value {
                        Value::String(s) => s,
                        _ => return None,
                    };
                    Init {
                        paths: Some(vec![path]),
                        connection: Some(connection?),
                        ..Default::default()
                    }
                }
            };
            init.kind().ok().map(|_| init)
        })
        .collect()
}

fn plugin_env(plugins: &Plugins) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar::new("POLYAXON_COLLECT_ARTIFACTS", plugins.collect_artifacts().to_string()),
        EnvVar::new("POLYAXON_COLLECT_RESOURCES", plugins.collect_resources().to_string()),
    ];
    if let Some(level) = &plugins.log_level {
        env.push(EnvVar::new("POLYAXON_LOG_LEVEL", level.clone()));
    }
    env
}

/// El contenedor del usuario con env, mounts y puertos completos.
///
/// Prioridad de env: contenedor > IO `toEnv` > conexiones > plugins > agente.
pub fn main_container(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    pod: &dyn PodTemplate,
    ports: &[u16],
) -> CompilerResult<(Container, Vec<Volume>)> {
    let plugins = compiled.plugins();
    let mut c = pod.container().cloned().unwrap_or_default();
    if c.image.is_none() {
        return Err(CompilerError::validation("run.container.image", "el contenedor principal no tiene imagen"));
    }
    c.name = Some(MAIN_JOB_CONTAINER.to_string());

    let mut conns = connections_parts(ctx, pod.connections())?;
    if plugins.mount_artifacts_store() {
        conns.extend(artifacts_store_parts(ctx));
    }
    let ConnectionParts {
        env: conn_env,
        env_from,
        mounts: conn_mounts,
        mut volumes,
    } = conns;

    c.env = Some(merge_env(vec![
        c.env.take().unwrap_or_default(),
        io_env(compiled),
        conn_env,
        plugin_env(&plugins),
        agent_env(ctx, plugins.auth()),
    ]));
    c.env_from = Some(merge_env_from(vec![c.env_from.take().unwrap_or_default(), env_from]))
        .filter(|e| !e.is_empty());

    let mut plugin_mounts = vec![context_mount()];
    if plugins.shm() {
        plugin_mounts.push(shm_mount());
        volumes.push(shm_volume());
    }
    if plugins.docker() {
        plugin_mounts.push(docker_mount());
        volumes.push(docker_volume());
    }
    c.volume_mounts = Some(merge_mounts(vec![
        c.volume_mounts.take().unwrap_or_default(),
        conn_mounts,
        plugin_mounts,
    ])?);

    if c.ports.is_none() && !ports.is_empty() {
        c.ports = Some(
            ports
                .iter()
                .map(|p| ContainerPort {
                    name: None,
                    container_port: *p,
                    protocol: None,
                })
                .collect(),
        );
    }
    apply_defaults(&mut c, false);
    Ok((c, volumes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::RunContext;
    use common::reader::read_compiled_operation;
    use common::settings::AgentSettings;
    use serde_json::json;

    fn ctx() -> ConverterContext {
        let settings = AgentSettings {
            connections: serde_json::from_value(json!([
                {"name": "data", "kind": "s3", "schema": {"bucket": "s3://data"}, "env": [{"name": "A", "value": "conn"}]}
            ]))
            .unwrap(),
            ..Default::default()
        };
        ConverterContext::new(RunContext::default(), settings)
    }

    const COMPILED: &str = r#"
version: 1.1
kind: compiled_operation
plugins: {docker: true, logLevel: debug}
inputs:
  - {name: lr, type: float, value: 0.1, toEnv: LR}
  - {name: repo, type: git, value: {url: "https://github.com/acme/r.git"}, toInit: true}
run:
  kind: job
  connections: [data]
  container:
    image: "a/b:1"
    env: [{name: A, value: user}]
"#;

    #[test]
    fn env_con_prioridades_y_plugins() {
        let compiled = read_compiled_operation(COMPILED).unwrap();
        let pod = compiled.run.roles()[0].1;
        let (c, volumes) = main_container(&ctx(), &compiled, pod, &[]).unwrap();
        assert_eq!(c.name.as_deref(), Some(MAIN_JOB_CONTAINER));
        assert_eq!(c.image_pull_policy.as_deref(), Some("IfNotPresent"));
        let env = c.env.unwrap();
        let get = |n: &str| env.iter().find(|e| e.name == n).and_then(|e| e.value.clone());
        assert_eq!(get("A").as_deref(), Some("user"));
        assert_eq!(get("LR").as_deref(), Some("0.1"));
        assert_eq!(get("POLYAXON_LOG_LEVEL").as_deref(), Some("debug"));
        assert!(get("POLYAXON_CONNECTION_DATA").is_some());
        let mounts = c.volume_mounts.unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/dev/shm"));
        assert!(mounts.iter().any(|m| m.mount_path == "/var/run/docker.sock"));
        assert!(volumes.iter().any(|v| v.name == "plx-dshm"));
    }

    #[test]
    fn io_con_to_init_genera_un_init_git() {
        let compiled = read_compiled_operation(COMPILED).unwrap();
        let inits = io_inits(&compiled);
        assert_eq!(inits.len(), 1);
        assert_eq!(
            inits[0].git.as_ref().unwrap().url.as_deref(),
            Some("https://github.com/acme/r.git")
        );
    }

    #[test]
    fn sin_imagen_es_error() {
        let compiled = read_compiled_operation("version: 1.1\nkind: compiled_operation\nrun: {kind: job}\n").unwrap();
        let pod = compiled.run.roles()[0].1;
        assert!(main_container(&ctx(), &compiled, pod, &[]).is_err());
    }
}
