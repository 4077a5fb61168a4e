//! Contexto explícito del agente: settings más el catálogo vigente.

use common::connections::{Connection, ConnectionResource};
use common::settings::AgentSettings;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "agent=info,compiler=info,kube=warn";

/// Catálogo que publica el plano de control para este agente.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_store: Option<Connection>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub secret_resources: Vec<ConnectionResource>,
    #[serde(default)]
    pub config_map_resources: Vec<ConnectionResource>,
}

/// Settings compartidos. Sólo el inicio de cada tick los muta; el resto del
/// ciclo trabaja sobre un snapshot.
#[derive(Debug, Clone)]
pub struct AgentContext {
    settings: Arc<RwLock<AgentSettings>>,
}

impl AgentContext {
    pub fn new(settings: AgentSettings) -> Self {
        AgentContext {
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> AgentSettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reemplaza conexiones, secrets y config maps. Un catálogo vacío no
    /// pisa lo que vino del entorno.
    pub fn apply_catalog(&self, catalog: Catalog) {
        let mut s = match self.settings.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if catalog.artifacts_store.is_some() {
            s.artifacts_store = catalog.artifacts_store;
        }
        if !catalog.connections.is_empty() {
            s.connections = catalog.connections;
        }
        if !catalog.secret_resources.is_empty() {
            s.secret_resources = catalog.secret_resources;
        }
        if !catalog.config_map_resources.is_empty() {
            s.config_map_resources = catalog.config_map_resources;
        }
        info!(
            "catálogo actualizado: {} conexiones, {} secrets, {} config maps",
            s.connections.len(),
            s.secret_resources.len(),
            s.config_map_resources.len()
        );
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot().max_interval.max(1))
    }
}

/// Inicializa tracing; `RUST_LOG` pisa el filtro por defecto. Devuelve `false`
/// si ya había un subscriber global, que se conserva.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            debug!("tracing ya estaba inicializado: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tracing_se_inicializa_una_sola_vez() {
        init_tracing();
        assert!(!init_tracing());
    }

    #[test]
    fn catalogo_reemplaza_conexiones_y_conserva_lo_demas() {
        let settings = AgentSettings {
            namespace: Some("polyaxon".into()),
            ..Default::default()
        };
        let ctx = AgentContext::new(settings);
        let catalog: Catalog = serde_json::from_value(json!({
            "connections": [{"name": "data", "kind": "s3", "schema": {"bucket": "s3://data"}}]
        }))
        .unwrap();
        ctx.apply_catalog(catalog);
        let s = ctx.snapshot();
        assert_eq!(s.connections.len(), 1);
        assert_eq!(s.namespace.as_deref(), Some("polyaxon"));
        assert!(s.artifacts_store.is_none());
    }

    #[test]
    fn intervalo_minimo_de_un_segundo() {
        let ctx = AgentContext::new(AgentSettings {
            max_interval: 0,
            ..Default::default()
        });
        assert_eq!(ctx.poll_interval(), Duration::from_secs(1));
    }
}
