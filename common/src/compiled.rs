use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::component::Component;
use crate::error::{SchemaError, SchemaResult};
use crate::hooks::{Build, Cache, EventTrigger, Hook, TriggerPolicy};
use crate::io::Io;
use crate::matrix::Matrix;
use crate::params::{Join, Param};
use crate::plugins::Plugins;
use crate::runs::{RunKind, Runtime};
use crate::schedules::Schedule;
use crate::termination::Termination;

pub const COMPILED_KIND: &str = "compiled_operation";

/// Resultado de compilar una operación: todo resuelto y tipado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Cache>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<Hook>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventTrigger>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<Matrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joins: Option<Vec<Join>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_on_upstream_skip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<Io>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<Io>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexts: Option<Vec<Io>>,
    pub run: Runtime,
}

impl CompiledOperation {
    pub fn run_kind(&self) -> RunKind {
        self.run.kind()
    }

    pub fn plugins(&self) -> Plugins {
        self.plugins.clone().unwrap_or_default()
    }

    pub fn termination(&self) -> Termination {
        self.termination.clone().unwrap_or_default()
    }

    pub fn inputs(&self) -> &[Io] {
        self.inputs.as_deref().unwrap_or_default()
    }

    pub fn outputs(&self) -> &[Io] {
        self.outputs.as_deref().unwrap_or_default()
    }

    pub fn contexts(&self) -> &[Io] {
        self.contexts.as_deref().unwrap_or_default()
    }

    /// Todos los IO en orden de aplicación: inputs, outputs, contexts.
    pub fn all_io(&self) -> impl Iterator<Item = &Io> {
        self.inputs()
            .iter()
            .chain(self.outputs())
            .chain(self.contexts())
    }

    /// Valores resueltos por nombre de IO.
    pub fn io_values(&self) -> BTreeMap<String, Value> {
        self.all_io()
            .map(|io| (io.name.clone(), io.value.clone().unwrap_or(Value::Null)))
            .collect()
    }

    pub fn is_dag(&self) -> bool {
        self.run.kind() == RunKind::Dag
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if let Some(kind) = &self.kind {
            if kind != COMPILED_KIND {
                return Err(SchemaError::UnknownKind(kind.clone()));
            }
        }
        if self.build.is_some() && self.is_dag() {
            return Err(SchemaError::validation(
                "build",
                "un runtime dag no admite build",
            ));
        }
        let context_names: Vec<&str> = self.contexts().iter().map(|c| c.name.as_str()).collect();
        for io in self.inputs().iter().chain(self.outputs()) {
            if context_names.contains(&io.name.as_str()) {
                return Err(SchemaError::validation(
                    format!("contexts.{}", io.name),
                    "un param contextOnly no puede ser input/output",
                ));
            }
        }
        self.run.validate()
    }

    /// Vuelve a la forma de componente (para recompilar).
    pub fn to_component(&self) -> Component {
        Component {
            version: self.version,
            kind: Some("component".to_string()),
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            cost: self.cost,
            presets: None,
            queue: self.queue.clone(),
            namespace: self.namespace.clone(),
            cache: self.cache.clone(),
            build: self.build.clone(),
            hooks: self.hooks.clone(),
            plugins: self.plugins.clone(),
            termination: self.termination.clone(),
            is_approved: self.is_approved,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            contexts: None,
            run: self.run.clone(),
        }
    }

    /// Params equivalentes a los valores ya resueltos.
    pub fn to_params(&self) -> BTreeMap<String, Param> {
        let mut params = BTreeMap::new();
        for io in self.inputs().iter().chain(self.outputs()) {
            if let Some(v) = &io.value {
                params.insert(
                    io.name.clone(),
                    Param {
                        value: Some(v.clone()),
                        connection: io.connection.clone(),
                        to_init: io.to_init,
                        to_env: io.to_env.clone(),
                        ..Default::default()
                    },
                );
            }
        }
        for io in self.contexts() {
            if io.is_list() {
                continue;
            }
            params.insert(
                io.name.clone(),
                Param {
                    value: io.value.clone().or(Some(Value::Null)),
                    connection: io.connection.clone(),
                    to_init: io.to_init,
                    to_env: io.to_env.clone(),
                    context_only: Some(true),
                    ..Default::default()
                },
            );
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dag_con_build_es_invalido() {
        let c: CompiledOperation = serde_json::from_value(json!({
            "kind": "compiled_operation",
            "build": {"hubRef": "kaniko"},
            "run": {"kind": "dag", "operations": []}
        }))
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn context_only_no_puede_ser_input() {
        let c: CompiledOperation = serde_json::from_value(json!({
            "inputs": [{"name": "a", "type": "str", "value": "x"}],
            "contexts": [{"name": "a", "value": "x"}],
            "run": {"kind": "job"}
        }))
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn to_params_conserva_valores_y_flags() {
        let c: CompiledOperation = serde_json::from_value(json!({
            "inputs": [{"name": "lr", "type": "float", "value": 0.1, "toEnv": "LR"}],
            "contexts": [{"name": "tag", "value": "x"}],
            "run": {"kind": "job"}
        }))
        .unwrap();
        let params = c.to_params();
        assert_eq!(params["lr"].value, Some(json!(0.1)));
        assert_eq!(params["lr"].to_env.as_deref(), Some("LR"));
        assert!(params["tag"].is_context_only());
    }
}
