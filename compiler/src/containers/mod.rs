//! Contenedores auxiliares y principal de cada pod.
//!
//! Todo lo que sale de aquí es independiente del backend: el conversor de
//! Kubernetes lo serializa tal cual y el de Docker lo traduce a `docker run`.

pub mod init;
pub mod main_container;
pub mod sidecar;

use common::connections::Connection;
use common::k8s::{
    Container, EnvFromSource, EnvVar, Quantity, ResourceRequirements, Volume, VolumeMount,
};
use common::names;
use std::collections::{BTreeMap, BTreeSet};

use crate::converters::ConverterContext;
use crate::error::{CompilerError, CompilerResult};

pub const MAIN_JOB_CONTAINER: &str = "polyaxon-main";
pub const SIDECAR_CONTAINER: &str = "polyaxon-sidecar";
pub const INIT_PREFIX: &str = "polyaxon-init";

pub const CONTEXT_VOLUME: &str = "plx-context";
pub const CONTEXT_MOUNT: &str = "/plx-context";
pub const CONTEXT_MOUNT_ARTIFACTS: &str = "/plx-context/artifacts";
pub const CONTEXT_MOUNT_AUTH: &str = "/plx-context/.auth";
pub const SHM_VOLUME: &str = "plx-dshm";
pub const SHM_MOUNT: &str = "/dev/shm";
pub const DOCKER_VOLUME: &str = "plx-docker";
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub const PROXY_ENV_NAMES: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

/* --------- Defaults --------- */

/// Presupuesto de init y sidecar: límite `1 / 500Mi`, request `0.1 / 60Mi`.
pub fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity::new("1")),
            ("memory".to_string(), Quantity::new("500Mi")),
        ])),
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity::new("0.1")),
            ("memory".to_string(), Quantity::new("60Mi")),
        ])),
    }
}

/// `IfNotPresent` si la imagen trae tag o digest, `Always` si no.
pub fn pull_policy(image: &str) -> &'static str {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains('@') || last.contains(':') {
        "IfNotPresent"
    } else {
        "Always"
    }
}

pub(crate) fn apply_defaults(c: &mut Container, with_resources: bool) {
    if c.image_pull_policy.is_none() {
        c.image_pull_policy = c.image.as_deref().map(|i| pull_policy(i).to_string());
    }
    if with_resources && c.resources.is_none() {
        c.resources = Some(default_resources());
    }
}

/* --------- Merge --------- */

/// Une capas de variables de entorno; ante nombres repetidos queda la primera.
pub fn merge_env(layers: Vec<Vec<EnvVar>>) -> Vec<EnvVar> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for env in layers.into_iter().flatten() {
        if seen.insert(env.name.clone()) {
            out.push(env);
        }
    }
    out
}

pub fn merge_env_from(layers: Vec<Vec<EnvFromSource>>) -> Vec<EnvFromSource> {
    let mut out: Vec<EnvFromSource> = Vec::new();
    for e in layers.into_iter().flatten() {
        if !out.contains(&e) {
            out.push(e);
        }
    }
    out
}

/// Une capas de mounts por `(name, mountPath)`. Dentro de una misma capa, dos
/// mounts distintos sobre el mismo `mountPath` son un error.
pub fn merge_mounts(layers: Vec<Vec<VolumeMount>>) -> CompilerResult<Vec<VolumeMount>> {
    let mut out: Vec<VolumeMount> = Vec::new();
    for layer in layers {
        let mut paths: BTreeMap<&str, &VolumeMount> = BTreeMap::new();
        for m in &layer {
            if let Some(prev) = paths.insert(m.mount_path.as_str(), m) {
                if prev != m {
                    return Err(CompilerError::validation(
                        format!("volumeMounts.{}", m.mount_path),
                        format!("`{}` y `{}` se montan en la misma ruta", prev.name, m.name),
                    ));
                }
            }
        }
        for m in layer {
            if !out
                .iter()
                .any(|o| o.name == m.name && o.mount_path == m.mount_path)
            {
                out.push(m);
            }
        }
    }
    Ok(out)
}

/// Volúmenes únicos por nombre, primero gana.
pub fn merge_volumes(volumes: Vec<Volume>) -> Vec<Volume> {
    let mut seen = BTreeSet::new();
    volumes
        .into_iter()
        .filter(|v| seen.insert(v.name.clone()))
        .collect()
}

/* --------- Conexiones --------- */

/// Lo que una conexión aporta a un contenedor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionParts {
    pub env: Vec<EnvVar>,
    pub env_from: Vec<EnvFromSource>,
    pub mounts: Vec<VolumeMount>,
    pub volumes: Vec<Volume>,
}

impl ConnectionParts {
    pub fn extend(&mut self, other: ConnectionParts) {
        self.env.extend(other.env);
        self.env_from.extend(other.env_from);
        self.mounts.extend(other.mounts);
        self.volumes.extend(other.volumes);
    }
}

fn volume_name(prefix: &str, name: &str) -> String {
    names::sanitize_dns_label(&format!("{prefix}-{name}"))
}

pub fn connection_parts(conn: &Connection) -> ConnectionParts {
    let mut parts = ConnectionParts {
        env: vec![EnvVar::new(conn.catalog_env_name(), conn.catalog_value())],
        ..Default::default()
    };
    parts.env.extend(conn.env.iter().flatten().cloned());

    if let Some((mount_path, read_only)) = conn.mount_info() {
        let vname = volume_name("plx-conn", &conn.name);
        let volume = match conn.schema().ok().flatten() {
            Some(common::connections::ConnectionSchema::Claim(c)) => {
                Volume::claim(&vname, &c.volume_claim, c.read_only)
            }
            Some(common::connections::ConnectionSchema::HostPath(h)) => {
                Volume::host_path(&vname, &h.host_path)
            }
            _ => Volume::empty_dir(&vname, None),
        };
        parts.volumes.push(volume);
        parts.mounts.push(VolumeMount::new(vname, mount_path).read_only(read_only));
    }

    if let Some(secret) = &conn.secret {
        match &secret.mount_path {
            Some(path) => {
                let vname = volume_name("plx-secret", &secret.name);
                parts
                    .volumes
                    .push(Volume::secret(&vname, &secret.name, secret.items.as_deref()));
                parts.mounts.push(VolumeMount::new(vname, path).read_only(Some(true)));
            }
            None => parts.env_from.push(EnvFromSource::secret(&secret.name)),
        }
    }
    if let Some(cm) = &conn.config_map {
        match &cm.mount_path {
            Some(path) => {
                let vname = volume_name("plx-config", &cm.name);
                parts
                    .volumes
                    .push(Volume::config_map(&vname, &cm.name, cm.items.as_deref()));
                parts.mounts.push(VolumeMount::new(vname, path).read_only(Some(true)));
            }
            None => parts.env_from.push(EnvFromSource::config_map(&cm.name)),
        }
    }
    parts
}

/// Partes de una lista de conexiones por nombre. Un nombre fuera del catálogo es error.
pub fn connections_parts(ctx: &ConverterContext, conn_names: &[String]) -> CompilerResult<ConnectionParts> {
    let mut parts = ConnectionParts::default();
    for name in conn_names {
        let conn = ctx.connection(name)?;
        parts.extend(connection_parts(conn));
    }
    Ok(parts)
}

/// Variables del artifacts store, para sidecar y main cuando corresponde.
pub fn artifacts_store_parts(ctx: &ConverterContext) -> ConnectionParts {
    match &ctx.settings.artifacts_store {
        Some(store) => {
            let mut parts = connection_parts(store);
            parts
                .env
                .push(EnvVar::new("POLYAXON_ARTIFACTS_STORE_NAME", store.name.clone()));
            parts
        }
        None => ConnectionParts::default(),
    }
}

/* --------- Volúmenes comunes --------- */

pub fn context_volume() -> Volume {
    Volume::empty_dir(CONTEXT_VOLUME, None)
}

pub fn context_mount() -> VolumeMount {
    VolumeMount::new(CONTEXT_VOLUME, CONTEXT_MOUNT)
}

pub fn shm_volume() -> Volume {
    Volume::empty_dir(SHM_VOLUME, Some("Memory"))
}

pub fn shm_mount() -> VolumeMount {
    VolumeMount::new(SHM_VOLUME, SHM_MOUNT)
}

pub fn docker_volume() -> Volume {
    Volume::host_path(DOCKER_VOLUME, DOCKER_SOCKET)
}

pub fn docker_mount() -> VolumeMount {
    VolumeMount::new(DOCKER_VOLUME, DOCKER_SOCKET)
}

/* --------- Entorno del agente --------- */

/// Variables que todo contenedor de la run recibe del agente.
pub fn agent_env(ctx: &ConverterContext, auth: bool) -> Vec<EnvVar> {
    let mut env = Vec::new();
    if let Some(uuid) = ctx.run.uuid_str() {
        env.push(EnvVar::new("POLYAXON_RUN_UUID", uuid));
    }
    if let Some(name) = &ctx.run.run_name {
        env.push(EnvVar::new("POLYAXON_RUN_NAME", name.clone()));
    }
    if let Some(owner) = &ctx.run.owner {
        env.push(EnvVar::new("POLYAXON_OWNER", owner.clone()));
    }
    if let Some(project) = &ctx.run.project {
        env.push(EnvVar::new("POLYAXON_PROJECT", project.clone()));
    }
    if let Some(host) = &ctx.settings.api_host {
        env.push(EnvVar::new("POLYAXON_HOST", host.clone()));
    }
    env.push(EnvVar::new("POLYAXON_ARTIFACTS_ROOT", CONTEXT_MOUNT_ARTIFACTS));
    if auth {
        if let Some(secret) = &ctx.settings.agent_secret {
            env.push(EnvVar::from_secret("POLYAXON_AUTH_TOKEN", secret, "POLYAXON_AUTH_TOKEN"));
        }
    }
    env.push(EnvVar::from_field("POLYAXON_K8S_POD_ID", "metadata.name"));
    env.push(EnvVar::from_field("POLYAXON_K8S_NAMESPACE", "metadata.namespace"));
    env.push(EnvVar::from_field("POLYAXON_K8S_NODE_NAME", "spec.nodeName"));
    env.extend(ctx.proxy_env.iter().cloned());
    env
}
