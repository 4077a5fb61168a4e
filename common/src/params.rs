use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{SchemaError, SchemaResult};

/// Binding de un parámetro: valor literal o referencia (`ops.x`, `runs.<uuid>`, `dag`, `_`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Param {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_only: Option<bool>,
}

impl Param {
    pub fn literal(value: Value) -> Self {
        Param {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn is_literal(&self) -> bool {
        self.reference.is_none()
    }

    pub fn is_context_only(&self) -> bool {
        self.context_only.unwrap_or(false)
    }

    /// Interpreta `ref`; `None` si el parámetro es literal.
    pub fn parsed_ref(&self) -> SchemaResult<Option<ParamRef>> {
        self.reference.as_deref().map(str::parse).transpose()
    }

    /// Clave de búsqueda del valor referenciado: `<ref>.<value>`.
    pub fn ref_key(&self) -> Option<String> {
        let r = self.reference.as_deref()?;
        match &self.value {
            Some(Value::String(path)) if !path.is_empty() => Some(format!("{r}.{path}")),
            _ => Some(r.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    Ops(String),
    Runs(Uuid),
    Dag,
    Current,
}

impl FromStr for ParamRef {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "dag" => return Ok(ParamRef::Dag),
            "_" => return Ok(ParamRef::Current),
            _ => {}
        }
        if let Some(name) = s.strip_prefix("ops.") {
            if name.is_empty() {
                return Err(SchemaError::validation("ref", "`ops.` requiere un nombre"));
            }
            return Ok(ParamRef::Ops(name.to_string()));
        }
        if let Some(id) = s.strip_prefix("runs.") {
            return match Uuid::parse_str(id) {
                Ok(u) if u.get_version_num() == 4 => Ok(ParamRef::Runs(u)),
                _ => Err(SchemaError::validation(
                    "ref",
                    format!("`{id}` no es un UUID v4 válido"),
                )),
            };
        }
        Err(SchemaError::validation(
            "ref",
            format!("referencia `{s}` no soportada (ops.<nombre>, runs.<uuid>, dag, _)"),
        ))
    }
}

impl fmt::Display for ParamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamRef::Ops(name) => write!(f, "ops.{name}"),
            ParamRef::Runs(id) => write!(f, "runs.{id}"),
            ParamRef::Dag => f.write_str("dag"),
            ParamRef::Current => f.write_str("_"),
        }
    }
}

/* --------- Joins --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinParam {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_only: Option<bool>,
}

/// Agrega valores de las runs que cumplan `query` en parámetros tipo lista.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Join {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(default)]
    pub params: BTreeMap<String, JoinParam>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parsea_las_cuatro_formas_de_ref() {
        assert_eq!("ops.train".parse::<ParamRef>().unwrap(), ParamRef::Ops("train".into()));
        assert_eq!("dag".parse::<ParamRef>().unwrap(), ParamRef::Dag);
        assert_eq!("_".parse::<ParamRef>().unwrap(), ParamRef::Current);
        let id = Uuid::new_v4();
        assert_eq!(format!("runs.{id}").parse::<ParamRef>().unwrap(), ParamRef::Runs(id));
    }

    #[test]
    fn runs_exige_uuid_v4() {
        let v5 = Uuid::new_v5(&Uuid::NAMESPACE_DNS, b"x");
        assert!(format!("runs.{v5}").parse::<ParamRef>().is_err());
        assert!("runs.no-es-uuid".parse::<ParamRef>().is_err());
        assert!("otros.x".parse::<ParamRef>().is_err());
    }

    #[test]
    fn param_ref_se_lee_con_alias() {
        let p: Param =
            serde_json::from_value(json!({"ref": "ops.train", "value": "outputs.loss"})).unwrap();
        assert!(!p.is_literal());
        assert_eq!(p.ref_key().as_deref(), Some("ops.train.outputs.loss"));
        assert_eq!(serde_json::to_value(&p).unwrap()["ref"], json!("ops.train"));
    }
}
