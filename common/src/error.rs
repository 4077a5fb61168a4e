use thiserror::Error;

/// Errores del modelo de esquemas (lectura, validación, discriminadores).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("error de validación en `{path}`: {cause}")]
    Validation { path: String, cause: String },

    #[error("kind desconocido: `{0}`")]
    UnknownKind(String),

    #[error("init inválido: {0}")]
    InvalidInit(String),

    #[error("error de parseo: {0}")]
    Parse(String),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

impl SchemaError {
    pub fn validation(path: impl Into<String>, cause: impl Into<String>) -> Self {
        SchemaError::Validation {
            path: path.into(),
            cause: cause.into(),
        }
    }

    /// Traduce un error de serde a `SchemaError`, detectando discriminadores
    /// desconocidos (`unknown variant`) para devolver `UnknownKind`.
    pub fn from_serde(path: &str, msg: String) -> Self {
        if let Some(kind) = unknown_variant(&msg) {
            return SchemaError::UnknownKind(kind);
        }
        SchemaError::validation(path, msg)
    }
}

fn unknown_variant(msg: &str) -> Option<String> {
    let idx = msg.find("unknown variant `")?;
    let rest = &msg[idx + "unknown variant `".len()..];
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

impl From<serde_yaml::Error> for SchemaError {
    fn from(e: serde_yaml::Error) -> Self {
        SchemaError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        SchemaError::from_serde("", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_serde_detecta_variant_desconocido() {
        let err = SchemaError::from_serde(
            "run",
            "unknown variant `foojob`, expected one of `job`, `service`".to_string(),
        );
        assert_eq!(err, SchemaError::UnknownKind("foojob".to_string()));
    }

    #[test]
    fn from_serde_devuelve_validation_para_otros_errores() {
        let err = SchemaError::from_serde("termination", "invalid type".to_string());
        assert!(matches!(err, SchemaError::Validation { ref path, .. } if path == "termination"));
    }
}
