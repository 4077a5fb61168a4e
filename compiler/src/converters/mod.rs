//! Conversión de una operación compilada a recursos de un backend.
//!
//! `build_pod` arma los contenedores de un rol (init, main, sidecars) y es
//! común a los dos backends; `k8s` emite el custom resource y `docker` la
//! lista de contenedores a ejecutar en orden.

pub mod docker;
pub mod k8s;

use common::connections::Connection;
use common::k8s::{Container, EnvVar, Volume};
use common::names;
use common::runs::PodTemplate;
use common::settings::AgentSettings;
use common::CompiledOperation;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::containers::init::{auth_init, init_container};
use crate::containers::main_container::{io_inits, main_container};
use crate::containers::sidecar::sidecar_container;
use crate::containers::{apply_defaults, context_volume, merge_volumes, PROXY_ENV_NAMES};
use crate::contexts::RunContext;
use crate::error::{CompilerError, CompilerResult};

/// Todo lo que la conversión necesita además de la operación compilada.
#[derive(Debug, Clone)]
pub struct ConverterContext {
    pub run: RunContext,
    pub settings: AgentSettings,
    pub connections: BTreeMap<String, Connection>,
    pub proxy_env: Vec<EnvVar>,
    pub version: String,
}

impl ConverterContext {
    pub fn new(run: RunContext, settings: AgentSettings) -> Self {
        let connections = settings.connections_by_name();
        ConverterContext {
            run,
            settings,
            connections,
            proxy_env: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Propaga las variables de proxy del proceso si la configuración lo pide.
    pub fn with_proxy_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.settings.use_proxy_env_vars_use_in_ops {
            self.proxy_env = PROXY_ENV_NAMES
                .iter()
                .filter_map(|name| lookup(name).map(|v| EnvVar::new(*name, v)))
                .collect();
        }
        self
    }

    pub fn connection(&self, name: &str) -> CompilerResult<&Connection> {
        self.connections.get(name).ok_or_else(|| {
            CompilerError::validation(
                format!("connections.{name}"),
                "la conexión no está en el catálogo del agente",
            )
        })
    }

    /// Namespace efectivo: el de la operación, el de la run o el del agente.
    pub fn namespace(&self, compiled: &CompiledOperation) -> String {
        compiled
            .namespace
            .clone()
            .or_else(|| self.run.namespace.clone())
            .or_else(|| self.settings.namespace.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn run_uuid(&self) -> CompilerResult<uuid::Uuid> {
        self.run
            .run_uuid
            .ok_or_else(|| CompilerError::validation("run.uuid", "la conversión necesita el uuid de la run"))
    }
}

/* --------- Pod de un rol --------- */

/// Contenedores y volúmenes de un pod, en el orden en que se emiten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodParts {
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    pub volumes: Vec<Volume>,
}

impl PodParts {
    pub fn main(&self) -> Option<&Container> {
        self.containers.first()
    }
}

fn check_unique_names(role: &str, containers: &[&Container]) -> CompilerResult<()> {
    let mut seen = BTreeSet::new();
    for c in containers {
        let name = c.name.as_deref().unwrap_or_default();
        if !names::is_dns_label(name) {
            return Err(CompilerError::validation(
                format!("run.{role}"),
                format!("`{name}` no es un nombre de contenedor válido"),
            ));
        }
        if !seen.insert(name) {
            return Err(CompilerError::validation(
                format!("run.{role}"),
                format!("contenedor `{name}` duplicado en el pod"),
            ));
        }
    }
    Ok(())
}

/// Arma el pod de un rol.
///
/// Init: auth (si el plugin lo pide y hay secreto de agente), los IO con
/// `toInit` y luego los del usuario. Contenedores: main primero, sidecars del
/// usuario y al final el sidecar de recolección.
pub fn build_pod(
    ctx: &ConverterContext,
    compiled: &CompiledOperation,
    role: &str,
    pod: &dyn PodTemplate,
    ports: &[u16],
) -> CompilerResult<PodParts> {
    let plugins = compiled.plugins();
    let mut volumes = vec![context_volume()];
    let mut init_containers = Vec::new();

    if plugins.auth() && ctx.settings.agent_secret.is_some() {
        let (c, v) = auth_init(ctx, role)?;
        init_containers.push(c);
        volumes.extend(v);
    }
    let inits = io_inits(compiled);
    for (idx, init) in inits.iter().chain(pod.init()).enumerate() {
        let (c, v) = init_container(ctx, init, role, idx)?;
        init_containers.push(c);
        volumes.extend(v);
    }

    let (main, main_volumes) = main_container(ctx, compiled, pod, ports)?;
    volumes.extend(main_volumes);
    let mut containers = vec![main];

    for (idx, sidecar) in pod.sidecars().iter().enumerate() {
        let mut c = sidecar.clone();
        let prefix = c.name.clone().unwrap_or_else(|| "sidecar".to_string());
        c.name = Some(names::container_name(
            &prefix,
            &format!("{}/{role}/sidecar/{idx}", ctx.run.uuid_str().unwrap_or_default()),
        ));
        apply_defaults(&mut c, true);
        containers.push(c);
    }
    if let Some((c, v)) = sidecar_container(ctx, &plugins)? {
        containers.push(c);
        volumes.extend(v);
    }
    volumes.extend(pod.volumes().iter().cloned());

    let all: Vec<&Container> = init_containers.iter().chain(containers.iter()).collect();
    check_unique_names(role, &all)?;
    debug!(
        role,
        init = init_containers.len(),
        containers = containers.len(),
        "pod armado"
    );
    Ok(PodParts {
        init_containers,
        containers,
        volumes: merge_volumes(volumes),
    })
}

/// Image, command y args de los batch con imagen predefinida.
pub(crate) fn preset_batch_container(
    kind: common::RunKind,
    container: Option<&Container>,
    settings: &AgentSettings,
) -> Container {
    let mut c = container.cloned().unwrap_or_default();
    if c.image.is_none() {
        c.image = Some(settings.init.image.clone());
        c.image_pull_policy = settings.init.image_pull_policy.clone();
    }
    if c.command.is_none() {
        let cmd = match kind {
            common::RunKind::Notifier => "notify",
            common::RunKind::Cleaner => "clean-ops",
            _ => "tune",
        };
        c.command = Some(vec!["polyaxon".to_string(), cmd.to_string()]);
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::reader::read_compiled_operation;
    use uuid::Uuid;

    fn ctx() -> ConverterContext {
        let run = RunContext {
            run_uuid: Some(Uuid::parse_str("6f1b4bd2-7a3a-4a53-9d0c-16d8a4a7d1f0").unwrap()),
            run_name: Some("train".into()),
            ..Default::default()
        };
        let settings = AgentSettings {
            agent_secret: Some("agent-secret".into()),
            connections: serde_json::from_value(serde_json::json!([
                {"name": "git1", "kind": "git", "schema": {"url": "https://github.com/acme/r.git"}}
            ]))
            .unwrap(),
            ..Default::default()
        };
        ConverterContext::new(run, settings)
    }

    const JOB: &str = r#"
version: 1.1
kind: compiled_operation
run:
  kind: job
  init:
    - {connection: git1, git: {revision: main}}
  sidecars:
    - {name: my_helper, image: "busybox:1"}
  container: {image: "a/b:1"}
"#;

    #[test]
    fn orden_de_contenedores_del_pod() {
        let compiled = read_compiled_operation(JOB).unwrap();
        let pod = compiled.run.roles()[0].1;
        let parts = build_pod(&ctx(), &compiled, "main", pod, &[]).unwrap();
        assert_eq!(parts.init_containers.len(), 2);
        assert!(parts.init_containers[0].name.as_deref().unwrap().starts_with("polyaxon-init-auth"));
        assert!(parts.init_containers[1].name.as_deref().unwrap().starts_with("polyaxon-init-git"));
        let names: Vec<_> = parts.containers.iter().map(|c| c.name.clone().unwrap()).collect();
        assert_eq!(names[0], "polyaxon-main");
        assert!(names[1].starts_with("my-helper-"));
        assert_eq!(names[2], "polyaxon-sidecar");
        assert_eq!(parts.volumes[0].name, "plx-context");
    }

    #[test]
    fn proxy_solo_si_la_configuracion_lo_pide() {
        let lookup = |n: &str| (n == "HTTP_PROXY").then(|| "http://proxy:3128".to_string());
        assert!(ctx().with_proxy_env(lookup).proxy_env.is_empty());

        let mut c = ctx();
        c.settings.use_proxy_env_vars_use_in_ops = true;
        let c = c.with_proxy_env(lookup);
        assert_eq!(c.proxy_env, vec![EnvVar::new("HTTP_PROXY", "http://proxy:3128")]);
    }

    #[test]
    fn conexion_desconocida_es_error_de_validacion() {
        assert!(matches!(
            ctx().connection("nope").unwrap_err(),
            CompilerError::Validation { .. }
        ));
        assert!(ctx().connection("git1").is_ok());
    }
}
