//! Configuración del agente.
//!
//! Se lee de variables `POLYAXON_*` con defaults compilados, al estilo
//! `env::var(..).unwrap_or_else(..)`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, env};

use crate::connections::{Connection, ConnectionResource};
use crate::error::{SchemaError, SchemaResult};
use crate::names;

pub const DEFAULT_MAX_INTERVAL: u64 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_EXECUTOR_CONCURRENCY: usize = 10;
pub const DEFAULT_SYNC_CONCURRENCY: usize = 50;
pub const DEFAULT_READ_TIMEOUT: u64 = 30;
pub const DEFAULT_WRITE_TIMEOUT: u64 = 120;
pub const DEFAULT_ARTIFACTS_ROOT: &str = "/plx-context/artifacts";
pub const DEFAULT_INIT_IMAGE: &str = "polyaxon/polyaxon-init:latest";
pub const DEFAULT_SIDECAR_IMAGE: &str = "polyaxon/polyaxon-sidecar:latest";
pub const DEFAULT_SIDECAR_SLEEP_INTERVAL: u64 = 10;
pub const DEFAULT_SIDECAR_SYNC_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Kubernetes,
    Docker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSettings {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    pub sleep_interval: u64,
    pub sync_interval: u64,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        SidecarSettings {
            image: DEFAULT_SIDECAR_IMAGE.to_string(),
            image_pull_policy: None,
            sleep_interval: DEFAULT_SIDECAR_SLEEP_INTERVAL,
            sync_interval: DEFAULT_SIDECAR_SYNC_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSettings {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

impl Default for InitSettings {
    fn default() -> Self {
        InitSettings {
            image: DEFAULT_INIT_IMAGE.to_string(),
            image_pull_policy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_store: Option<Connection>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub secret_resources: Vec<ConnectionResource>,
    #[serde(default)]
    pub config_map_resources: Vec<ConnectionResource>,
    #[serde(default)]
    pub use_proxy_env_vars_use_in_ops: bool,
    #[serde(default, rename = "defaultSA", skip_serializing_if = "Option::is_none")]
    pub default_sa: Option<String>,
    pub max_interval: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub is_replica: bool,
    #[serde(default)]
    pub sidecar: SidecarSettings,
    #[serde(default)]
    pub init: InitSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<Vec<String>>,
    #[serde(default)]
    pub compressed_logs: bool,
    pub executor_concurrency: usize,
    pub sync_concurrency: usize,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub artifacts_root: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub executor: ExecutorKind,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            namespace: None,
            artifacts_store: None,
            connections: Vec::new(),
            secret_resources: Vec::new(),
            config_map_resources: Vec::new(),
            use_proxy_env_vars_use_in_ops: false,
            default_sa: None,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            is_replica: false,
            sidecar: SidecarSettings::default(),
            init: InitSettings::default(),
            tmpfs: None,
            compressed_logs: false,
            executor_concurrency: DEFAULT_EXECUTOR_CONCURRENCY,
            sync_concurrency: DEFAULT_SYNC_CONCURRENCY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            artifacts_root: DEFAULT_ARTIFACTS_ROOT.to_string(),
            api_host: None,
            auth_token: None,
            agent_secret: None,
            agent_instance: None,
            owner: None,
            executor: ExecutorKind::default(),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> SchemaResult<T> {
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| SchemaError::validation(key, format!("valor inválido `{raw}`"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str) -> SchemaResult<bool> {
    match env_opt(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "y") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "n") => Ok(false),
        Some(v) => Err(SchemaError::validation(key, format!("`{v}` no es un bool"))),
    }
}

fn env_json<T: DeserializeOwned>(key: &str) -> SchemaResult<Option<T>> {
    env_opt(key)
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|e| SchemaError::validation(key, e.to_string()))
        })
        .transpose()
}

impl AgentSettings {
    /// Lee la configuración del entorno del proceso.
    pub fn from_env() -> SchemaResult<Self> {
        let d = AgentSettings::default();
        let executor = match env_opt("POLYAXON_EXECUTOR").as_deref() {
            None => d.executor,
            Some("kubernetes") | Some("k8s") => ExecutorKind::Kubernetes,
            Some("docker") => ExecutorKind::Docker,
            Some(other) => {
                return Err(SchemaError::validation(
                    "POLYAXON_EXECUTOR",
                    format!("executor `{other}` desconocido"),
                ))
            }
        };
        let settings = AgentSettings {
            namespace: env_opt("POLYAXON_K8S_NAMESPACE"),
            artifacts_store: env_json("POLYAXON_ARTIFACTS_STORE")?,
            connections: env_json("POLYAXON_CONNECTIONS")?.unwrap_or_default(),
            secret_resources: env_json("POLYAXON_SECRET_RESOURCES")?.unwrap_or_default(),
            config_map_resources: env_json("POLYAXON_CONFIG_MAP_RESOURCES")?.unwrap_or_default(),
            use_proxy_env_vars_use_in_ops: env_bool("POLYAXON_USE_PROXY_ENV_VARS_USE_IN_OPS")?,
            default_sa: env_opt("POLYAXON_DEFAULT_SA"),
            max_interval: env_parse("POLYAXON_MAX_INTERVAL", d.max_interval)?,
            max_retries: env_parse("POLYAXON_MAX_RETRIES", d.max_retries)?,
            is_replica: env_bool("POLYAXON_IS_REPLICA")?,
            sidecar: env_json("POLYAXON_SIDECAR")?.unwrap_or_default(),
            init: env_json("POLYAXON_INIT")?.unwrap_or_default(),
            tmpfs: env_json("POLYAXON_TMPFS")?,
            compressed_logs: env_bool("POLYAXON_COMPRESSED_LOGS")?,
            executor_concurrency: env_parse("POLYAXON_EXECUTOR_CONCURRENCY", d.executor_concurrency)?,
            sync_concurrency: env_parse("POLYAXON_SYNC_CONCURRENCY", d.sync_concurrency)?,
            read_timeout: env_parse("POLYAXON_READ_TIMEOUT", d.read_timeout)?,
            write_timeout: env_parse("POLYAXON_WRITE_TIMEOUT", d.write_timeout)?,
            artifacts_root: env_opt("POLYAXON_ARTIFACTS_ROOT").unwrap_or(d.artifacts_root),
            api_host: env_opt("POLYAXON_HOST"),
            auth_token: env_opt("POLYAXON_AUTH_TOKEN"),
            agent_secret: env_opt("POLYAXON_AGENT_SECRET"),
            agent_instance: env_opt("POLYAXON_AGENT_INSTANCE"),
            owner: env_opt("POLYAXON_OWNER"),
            executor,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.max_interval < 1 {
            return Err(SchemaError::validation("maxInterval", "el mínimo es 1 segundo"));
        }
        if self.executor_concurrency == 0 || self.sync_concurrency == 0 {
            return Err(SchemaError::validation(
                "executorConcurrency",
                "la concurrencia debe ser positiva",
            ));
        }
        if self.executor == ExecutorKind::Kubernetes && self.namespace.is_none() {
            return Err(SchemaError::validation(
                "namespace",
                "el executor de kubernetes requiere namespace",
            ));
        }
        if let Some(owner) = &self.owner {
            names::validate_slug("owner", owner)?;
        }
        for c in self.connections.iter().chain(self.artifacts_store.iter()) {
            c.validate()?;
        }
        Ok(())
    }

    /// Catálogo de conexiones por nombre (incluye el artifacts store).
    pub fn connections_by_name(&self) -> BTreeMap<String, Connection> {
        self.connections
            .iter()
            .chain(self.artifacts_store.iter())
            .map(|c| (c.name.clone(), c.clone()))
            .collect()
    }

    pub fn secret(&self, name: &str) -> Option<&ConnectionResource> {
        self.secret_resources.iter().find(|s| s.name == name)
    }

    pub fn config_map(&self, name: &str) -> Option<&ConnectionResource> {
        self.config_map_resources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_compilados() {
        let s = AgentSettings::default();
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.executor_concurrency, 10);
        assert_eq!(s.sync_concurrency, 50);
        assert_eq!(s.read_timeout, 30);
        assert_eq!(s.write_timeout, 120);
        assert_eq!(s.artifacts_root, "/plx-context/artifacts");
    }

    #[test]
    fn kubernetes_requiere_namespace() {
        let mut s = AgentSettings::default();
        assert!(s.validate().is_err());
        s.namespace = Some("polyaxon".into());
        assert!(s.validate().is_ok());
        s.executor = ExecutorKind::Docker;
        s.namespace = None;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn max_interval_minimo() {
        let s = AgentSettings {
            max_interval: 0,
            executor: ExecutorKind::Docker,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn se_lee_en_camel_case() {
        let s: AgentSettings = serde_json::from_value(json!({
            "namespace": "ns",
            "maxInterval": 2,
            "maxRetries": 5,
            "executorConcurrency": 4,
            "syncConcurrency": 8,
            "readTimeout": 1,
            "writeTimeout": 2,
            "artifactsRoot": "/tmp/a",
            "defaultSA": "sa",
            "connections": [{"name": "git1", "kind": "git", "schema": {"url": "https://x"}}]
        }))
        .unwrap();
        assert_eq!(s.default_sa.as_deref(), Some("sa"));
        assert!(s.connections_by_name().contains_key("git1"));
    }
}
