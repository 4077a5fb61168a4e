use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{SchemaError, SchemaResult};
use crate::hooks::{Build, Cache, Hook};
use crate::io::Io;
use crate::plugins::Plugins;
use crate::runs::Runtime;
use crate::termination::Termination;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
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
    pub plugins: Option<Plugins>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
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

impl Component {
    pub fn inputs(&self) -> &[Io] {
        self.inputs.as_deref().unwrap_or_default()
    }

    pub fn outputs(&self) -> &[Io] {
        self.outputs.as_deref().unwrap_or_default()
    }

    pub fn validate(&self) -> SchemaResult<()> {
        let mut seen = BTreeSet::new();
        for io in self.inputs().iter().chain(self.outputs()) {
            if !seen.insert(io.name.as_str()) {
                return Err(SchemaError::validation(
                    format!("component.io.{}", io.name),
                    "nombre repetido entre inputs/outputs",
                ));
            }
            if let Some(v) = &io.value {
                if !io.delay_validation.unwrap_or(false) && !is_template(v) {
                    io.validate_value(v)
                        .map_err(|e| SchemaError::validation(format!("component.io.{}", io.name), e))?;
                }
            }
        }
        self.run.validate()
    }
}

/// Valores que contienen `{{ ... }}` se validan después de renderizar.
pub fn is_template(value: &serde_json::Value) -> bool {
    value
        .as_str()
        .map_or(false, |s| s.contains("{{") || s.contains("{%"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn io_repetido_es_invalido() {
        let c: Component = serde_json::from_value(json!({
            "inputs": [{"name": "lr", "type": "float"}],
            "outputs": [{"name": "lr", "type": "float"}],
            "run": {"kind": "job", "container": {"image": "x"}}
        }))
        .unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn valor_por_defecto_se_valida_salvo_plantillas() {
        let bad: Component = serde_json::from_value(json!({
            "inputs": [{"name": "n", "type": "int", "value": "abc"}],
            "run": {"kind": "job"}
        }))
        .unwrap();
        assert!(bad.validate().is_err());

        let templated: Component = serde_json::from_value(json!({
            "inputs": [{"name": "n", "type": "int", "value": "{{ globals.iteration }}"}],
            "run": {"kind": "job"}
        }))
        .unwrap();
        assert!(templated.validate().is_ok());
    }
}
