//! Lectura de documentos YAML/JSON (`component`, `operation`, `compiled_operation`).

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fs, path::Path};

use crate::compiled::{CompiledOperation, COMPILED_KIND};
use crate::component::Component;
use crate::error::{SchemaError, SchemaResult};
use crate::operation::Operation;
use crate::runs::Runtime;

pub const SUPPORTED_VERSIONS: [f64; 2] = [1.0, 1.1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Component,
    Operation,
    CompiledOperation,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Component => "component",
            DocumentKind::Operation => "operation",
            DocumentKind::CompiledOperation => COMPILED_KIND,
        }
    }

    fn parse(kind: &str) -> SchemaResult<Self> {
        match kind {
            "component" => Ok(DocumentKind::Component),
            "operation" => Ok(DocumentKind::Operation),
            COMPILED_KIND => Ok(DocumentKind::CompiledOperation),
            other => Err(SchemaError::UnknownKind(other.to_string())),
        }
    }
}

/// Parsea YAML (o JSON, que es un subconjunto) a un árbol JSON.
pub fn parse_document(content: &str) -> SchemaResult<Value> {
    let value: Value = serde_yaml::from_str(content)?;
    if !value.is_object() {
        return Err(SchemaError::Parse("el documento debe ser un mapa".into()));
    }
    Ok(value)
}

/// Comprueba `version` y `kind` y devuelve el tipo de documento.
pub fn document_kind(value: &Value) -> SchemaResult<DocumentKind> {
    match value.get("version") {
        Some(v) => {
            let version = v
                .as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| SchemaError::validation("version", "debe ser numérica"))?;
            if !SUPPORTED_VERSIONS.iter().any(|s| (s - version).abs() < f64::EPSILON) {
                return Err(SchemaError::validation(
                    "version",
                    format!("versión `{version}` no soportada"),
                ));
            }
        }
        None => return Err(SchemaError::validation("version", "campo obligatorio")),
    }
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| SchemaError::validation("kind", "campo obligatorio"))?;
    DocumentKind::parse(kind)
}

fn typed<T: DeserializeOwned>(value: Value, path: &str) -> SchemaResult<T> {
    // el discriminador de `run` se chequea antes para devolver UnknownKind limpio
    if let Some(run) = value.get("run") {
        if let Some(kind) = run.get("kind").and_then(Value::as_str) {
            crate::runs::RunKind::parse(kind)?;
        }
    }
    serde_json::from_value(value).map_err(|e| SchemaError::from_serde(path, e.to_string()))
}

fn expect_kind(value: &Value, expected: DocumentKind) -> SchemaResult<()> {
    let kind = document_kind(value)?;
    if kind != expected {
        return Err(SchemaError::validation(
            "kind",
            format!("se esperaba `{}` y llegó `{}`", expected.as_str(), kind.as_str()),
        ));
    }
    Ok(())
}

pub fn read_operation(content: &str) -> SchemaResult<Operation> {
    let value = parse_document(content)?;
    expect_kind(&value, DocumentKind::Operation)?;
    let op: Operation = typed(value, "operation")?;
    op.validate()?;
    Ok(op)
}

pub fn read_component(content: &str) -> SchemaResult<Component> {
    let value = parse_document(content)?;
    expect_kind(&value, DocumentKind::Component)?;
    let c: Component = typed(value, "component")?;
    c.validate()?;
    Ok(c)
}

pub fn read_compiled_operation(content: &str) -> SchemaResult<CompiledOperation> {
    let value = parse_document(content)?;
    expect_kind(&value, DocumentKind::CompiledOperation)?;
    let c: CompiledOperation = typed(value, "compiled_operation")?;
    c.validate()?;
    Ok(c)
}

/// Lee un documento de cualquier tipo; un componente suelto se envuelve en una operación.
pub fn read_as_operation(content: &str) -> SchemaResult<Operation> {
    let value = parse_document(content)?;
    match document_kind(&value)? {
        DocumentKind::Operation => read_operation(content),
        DocumentKind::Component => {
            let component = read_component(content)?;
            Ok(Operation {
                version: component.version,
                kind: Some("operation".to_string()),
                component: Some(component),
                ..Default::default()
            })
        }
        DocumentKind::CompiledOperation => Err(SchemaError::validation(
            "kind",
            "una operación compilada no se puede releer como operación",
        )),
    }
}

pub fn read_file(path: impl AsRef<Path>) -> SchemaResult<String> {
    fs::read_to_string(path.as_ref()).map_err(|e| {
        SchemaError::Parse(format!("no se pudo leer {}: {e}", path.as_ref().display()))
    })
}

/// Chequeo de un `runPatch` contra el tipo de runtime del componente.
pub fn validate_run_patch(kind: crate::runs::RunKind, patch: &Value) -> SchemaResult<()> {
    let mut v = match patch {
        Value::Object(m) => Value::Object(m.clone()),
        Value::Null => return Ok(()),
        _ => return Err(SchemaError::validation("runPatch", "debe ser un mapa")),
    };
    if let Some(k) = v.get("kind").and_then(Value::as_str) {
        if k != kind.as_str() {
            return Err(SchemaError::validation(
                "runPatch.kind",
                format!("`{k}` no coincide con el runtime `{kind}`"),
            ));
        }
    }
    if let Value::Object(m) = &mut v {
        m.insert("kind".into(), Value::String(kind.as_str().to_string()));
    }
    Runtime::from_value(v).map(|_| ()).map_err(|e| match e {
        SchemaError::Validation { cause, .. } => SchemaError::validation("runPatch", cause),
        other => other,
    })
}
