use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::component::Component;
use crate::error::{SchemaError, SchemaResult};
use crate::hooks::{Build, Cache, EventTrigger, Hook, TriggerPolicy};
use crate::matrix::Matrix;
use crate::params::{Join, Param};
use crate::patch::{PatchStrategy, Patchable};
use crate::plugins::Plugins;
use crate::schedules::Schedule;
use crate::termination::Termination;

/// Operación escrita por el usuario (antes de compilar).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
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
    pub params: Option<BTreeMap<String, Param>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_patch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_strategy: Option<PatchStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_preset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_ref: Option<String>,
}

impl Patchable for Operation {}

/// Origen del componente de una operación.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentRef {
    Inline,
    Hub(String),
    Dag(String),
    Url(String),
    Path(String),
}

impl Operation {
    pub fn is_preset(&self) -> bool {
        self.is_preset.unwrap_or(false)
    }

    pub fn params(&self) -> &BTreeMap<String, Param> {
        static EMPTY: BTreeMap<String, Param> = BTreeMap::new();
        self.params.as_ref().unwrap_or(&EMPTY)
    }

    pub fn component_ref(&self) -> SchemaResult<ComponentRef> {
        let mut refs = Vec::new();
        if self.component.is_some() {
            refs.push(ComponentRef::Inline);
        }
        if let Some(r) = &self.hub_ref {
            refs.push(ComponentRef::Hub(r.clone()));
        }
        if let Some(r) = &self.dag_ref {
            refs.push(ComponentRef::Dag(r.clone()));
        }
        if let Some(r) = &self.url_ref {
            refs.push(ComponentRef::Url(r.clone()));
        }
        if let Some(r) = &self.path_ref {
            refs.push(ComponentRef::Path(r.clone()));
        }
        match refs.len() {
            1 => Ok(refs.remove(0)),
            0 => Err(SchemaError::validation(
                "operation",
                "se requiere component, hubRef, dagRef, urlRef o pathRef",
            )),
            _ => Err(SchemaError::validation(
                "operation",
                "sólo se permite una referencia de componente",
            )),
        }
    }

    /// Deja un preset listo para mezclar: sin metadatos de documento ni de preset.
    pub fn as_preset_patch(&self) -> (Operation, PatchStrategy) {
        let strategy = self.patch_strategy.unwrap_or_default();
        let mut p = self.clone();
        p.is_preset = None;
        p.patch_strategy = None;
        p.kind = None;
        p.version = None;
        (p, strategy)
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if !self.is_preset() {
            self.component_ref()?;
        }
        if let Some(m) = &self.matrix {
            m.validate()?;
        }
        if let Some(s) = &self.schedule {
            s.validate()?;
        }
        for (name, p) in self.params() {
            if p.value.is_none() && p.reference.is_none() {
                return Err(SchemaError::validation(
                    format!("params.{name}"),
                    "un param necesita `value` o `ref`",
                ));
            }
            p.parsed_ref().map_err(|e| match e {
                SchemaError::Validation { cause, .. } => {
                    SchemaError::validation(format!("params.{name}.ref"), cause)
                }
                other => other,
            })?;
        }
        if let Some(c) = &self.component {
            c.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(v: Value) -> Operation {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn requiere_exactamente_una_referencia() {
        assert!(op(json!({"hubRef": "a"})).component_ref().is_ok());
        assert!(op(json!({})).validate().is_err());
        assert!(op(json!({"hubRef": "a", "pathRef": "b"})).validate().is_err());
        assert!(op(json!({"isPreset": true})).validate().is_ok());
    }

    #[test]
    fn preset_se_limpia_antes_del_merge() {
        let p = op(json!({
            "version": 1.1,
            "kind": "operation",
            "isPreset": true,
            "patchStrategy": "replace",
            "queue": "gpu"
        }));
        let (clean, strategy) = p.as_preset_patch();
        assert_eq!(strategy, PatchStrategy::Replace);
        assert_eq!(clean.kind, None);
        assert_eq!(clean.is_preset, None);
        assert_eq!(clean.queue.as_deref(), Some("gpu"));
    }

    #[test]
    fn params_con_runs_invalido() {
        let o = op(json!({"hubRef": "x", "params": {"a": {"ref": "runs.123", "value": "outputs.a"}}}));
        assert!(o.validate().is_err());
    }
}
