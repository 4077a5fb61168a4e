//! Backend Docker: los contenedores del pod se ejecutan en secuencia.
//!
//! Los init van primero y el main al final. Los sidecars no se emiten: el
//! executor Docker recolecta los logs de cada proceso por su cuenta.

use common::k8s::{Container, Volume};
use common::{CompiledOperation, Runtime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use super::{build_pod, preset_batch_container, ConverterContext};
use crate::error::{CompilerError, CompilerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DockerMount {
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Tmpfs {
        target: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerContainer {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub mounts: Vec<DockerMount>,
    pub ports: Vec<u16>,
}

impl DockerContainer {
    /// Argumentos de `docker run` para este contenedor.
    pub fn run_args(&self) -> Vec<String> {
        let mut out = vec!["run".to_string(), "--rm".to_string(), "--name".to_string(), self.name.clone()];
        for (k, v) in &self.env {
            out.push("-e".into());
            out.push(format!("{k}={v}"));
        }
        for m in &self.mounts {
            match m {
                DockerMount::Bind {
                    source,
                    target,
                    read_only,
                } => {
                    out.push("-v".into());
                    let suffix = if *read_only { ":ro" } else { "" };
                    out.push(format!("{source}:{target}{suffix}"));
                }
                DockerMount::Tmpfs { target } => {
                    out.push("--tmpfs".into());
                    out.push(target.clone());
                }
            }
        }
        for p in &self.ports {
            out.push("-p".into());
            out.push(format!("{p}:{p}"));
        }
        if let Some(wd) = &self.working_dir {
            out.push("-w".into());
            out.push(wd.clone());
        }
        let mut rest = self.command.iter();
        if let Some(entrypoint) = rest.next() {
            out.push("--entrypoint".into());
            out.push(entrypoint.clone());
        }
        out.push(self.image.clone());
        out.extend(rest.cloned());
        out.extend(self.args.iter().cloned());
        out
    }
}

/// Lo que el executor Docker necesita para correr una run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerPlan {
    pub containers: Vec<DockerContainer>,
}

impl DockerPlan {
    pub fn main(&self) -> Option<&DockerContainer> {
        self.containers.last()
    }
}

/// Directorio del host que respalda un volumen del pod.
fn host_volume_dir(ctx: &ConverterContext, volume: &str) -> String {
    format!(
        "{}/{}/.volumes/{}",
        ctx.settings.artifacts_root.trim_end_matches('/'),
        ctx.run.uuid_str().unwrap_or_default(),
        volume
    )
}

fn mount_for(
    ctx: &ConverterContext,
    volumes: &BTreeMap<&str, &Volume>,
    name: &str,
    target: &str,
    read_only: bool,
) -> CompilerResult<DockerMount> {
    let volume = volumes
        .get(name)
        .ok_or_else(|| CompilerError::validation("run.volumes", format!("volumen `{name}` no declarado")))?;
    if let Some(dir) = &volume.empty_dir {
        if dir.medium.as_deref() == Some("Memory") {
            return Ok(DockerMount::Tmpfs {
                target: target.to_string(),
            });
        }
        return Ok(DockerMount::Bind {
            source: host_volume_dir(ctx, name),
            target: target.to_string(),
            read_only,
        });
    }
    if let Some(host) = &volume.host_path {
        return Ok(DockerMount::Bind {
            source: host.path.clone(),
            target: target.to_string(),
            read_only,
        });
    }
    Err(CompilerError::UnsupportedKind(format!("docker volume `{name}`")))
}

fn to_docker_container(
    ctx: &ConverterContext,
    c: &Container,
    volumes: &BTreeMap<&str, &Volume>,
) -> CompilerResult<DockerContainer> {
    let name = c.name.clone().unwrap_or_default();
    let image = c
        .image
        .clone()
        .ok_or_else(|| CompilerError::validation(format!("containers.{name}.image"), "falta la imagen"))?;
    let mut env = BTreeMap::new();
    for e in c.env_vars() {
        match &e.value {
            Some(v) => {
                env.entry(e.name.clone()).or_insert_with(|| v.clone());
            }
            None => warn!(container = %name, var = %e.name, "variable sin valor literal, se omite en docker"),
        }
    }
    let mounts = c
        .mounts()
        .iter()
        .map(|m| mount_for(ctx, volumes, &m.name, &m.mount_path, m.read_only.unwrap_or(false)))
        .collect::<CompilerResult<Vec<_>>>()?;
    Ok(DockerContainer {
        name,
        image,
        command: c.command.clone().unwrap_or_default(),
        args: c.args.clone().unwrap_or_default(),
        env,
        working_dir: c.working_dir.clone(),
        mounts,
        ports: c
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| p.container_port)
            .collect(),
    })
}

/// Convierte una operación de pod único al plan de contenedores en secuencia.
pub fn to_docker_plan(compiled: &CompiledOperation, ctx: &ConverterContext) -> CompilerResult<DockerPlan> {
    let kind = compiled.run_kind();
    let parts = match &compiled.run {
        Runtime::Job(r) => build_pod(ctx, compiled, "main", r, &[])?,
        Runtime::Service(r) => build_pod(ctx, compiled, "main", r, r.ports.as_deref().unwrap_or_default())?,
        Runtime::Notifier(r) | Runtime::Cleaner(r) | Runtime::Tuner(r) => {
            let mut r = r.clone();
            r.container = Some(preset_batch_container(kind, r.container.as_ref(), &ctx.settings));
            build_pod(ctx, compiled, "main", &r, &[])?
        }
        _ => return Err(CompilerError::UnsupportedKind(format!("{kind} en docker"))),
    };

    let volumes: BTreeMap<&str, &Volume> = parts.volumes.iter().map(|v| (v.name.as_str(), v)).collect();
    let mut containers = parts
        .init_containers
        .iter()
        .map(|c| to_docker_container(ctx, c, &volumes))
        .collect::<CompilerResult<Vec<_>>>()?;
    let main = parts
        .main()
        .ok_or_else(|| CompilerError::validation("run.container", "el pod no tiene contenedor principal"))?;
    containers.push(to_docker_container(ctx, main, &volumes)?);
    Ok(DockerPlan { containers })
}
