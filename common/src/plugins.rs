use serde::{Deserialize, Serialize};

use crate::patch::Patchable;

/// Eventos que disparan una notificación; se emiten capitalizados.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationTrigger {
    #[serde(alias = "succeeded")]
    Succeeded,
    #[serde(alias = "failed")]
    Failed,
    #[serde(alias = "stopped")]
    Stopped,
    #[serde(alias = "done")]
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub connections: Vec<String>,
    pub trigger: NotificationTrigger,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plugins {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_artifacts: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_logs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_statuses: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_artifacts_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_host: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<Vec<Notification>>,
}

impl Patchable for Plugins {}

impl Plugins {
    pub fn auth(&self) -> bool {
        self.auth.unwrap_or(true)
    }
    pub fn docker(&self) -> bool {
        self.docker.unwrap_or(false)
    }
    pub fn shm(&self) -> bool {
        self.shm.unwrap_or(true)
    }
    pub fn collect_artifacts(&self) -> bool {
        self.collect_artifacts.unwrap_or(true)
    }
    pub fn collect_logs(&self) -> bool {
        self.collect_logs.unwrap_or(true)
    }
    pub fn collect_resources(&self) -> bool {
        self.collect_resources.unwrap_or(true)
    }
    pub fn sync_statuses(&self) -> bool {
        self.sync_statuses.unwrap_or(true)
    }
    pub fn mount_artifacts_store(&self) -> bool {
        self.mount_artifacts_store.unwrap_or(false)
    }
    pub fn external_host(&self) -> bool {
        self.external_host.unwrap_or(false)
    }

    /// El sidecar sólo se agrega si hay algo que recolectar.
    pub fn needs_sidecar(&self) -> bool {
        self.collect_artifacts() || self.collect_logs()
    }

    pub fn notifications(&self) -> &[Notification] {
        self.notifications.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_de_plugins() {
        let p = Plugins::default();
        assert!(p.auth() && p.shm() && p.collect_logs() && p.sync_statuses());
        assert!(!p.docker() && !p.mount_artifacts_store() && !p.external_host());
    }

    #[test]
    fn trigger_acepta_minusculas_y_emite_capitalizado() {
        let n: Notification =
            serde_json::from_value(json!({"connections": ["slack"], "trigger": "succeeded"})).unwrap();
        assert_eq!(n.trigger, NotificationTrigger::Succeeded);
        assert_eq!(serde_json::to_value(&n).unwrap()["trigger"], json!("Succeeded"));
    }
}
