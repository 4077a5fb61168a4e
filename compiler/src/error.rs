use common::SchemaError;
use thiserror::Error;

/// Errores de compilación y conversión.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompilerError {
    #[error("referencia sin resolver: `{0}`")]
    UnresolvedRef(String),

    #[error("`{0}` no es un UUID v4 válido")]
    BadUuid(String),

    #[error("tipo incorrecto para `{param}`: se esperaba {expected}, llegó `{got}`")]
    TypeMismatch {
        param: String,
        expected: String,
        got: String,
    },

    #[error("error al renderizar `{expr}`: {cause}")]
    TemplateRender { expr: String, cause: String },

    #[error("un runtime dag no admite build")]
    DagWithBuild,

    #[error("kind no soportado: `{0}`")]
    UnsupportedKind(String),

    #[error("no se pudo cargar `{0}`")]
    Loader(String),

    #[error("error de validación en `{path}`: {cause}")]
    Validation { path: String, cause: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type CompilerResult<T> = Result<T, CompilerError>;

impl CompilerError {
    pub fn validation(path: impl Into<String>, cause: impl Into<String>) -> Self {
        CompilerError::Validation {
            path: path.into(),
            cause: cause.into(),
        }
    }

    /// `reason` de la condición que se reporta al plano de control.
    pub fn reason(&self) -> &'static str {
        match self {
            CompilerError::UnresolvedRef(_) | CompilerError::BadUuid(_) => "UnresolvedReference",
            CompilerError::UnsupportedKind(_) | CompilerError::Schema(SchemaError::UnknownKind(_)) => {
                "UnsupportedKind"
            }
            CompilerError::TemplateRender { .. } => "TemplateRender",
            CompilerError::Loader(_) => "ComponentLoader",
            CompilerError::TypeMismatch { .. }
            | CompilerError::DagWithBuild
            | CompilerError::Validation { .. }
            | CompilerError::Schema(_) => "SchemaValidation",
        }
    }

    /// Errores de esquema o de kind terminan con exit code 2 en las herramientas.
    pub fn is_schema(&self) -> bool {
        self.reason() == "SchemaValidation" || self.reason() == "UnsupportedKind"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn razones_para_el_plano_de_control() {
        assert_eq!(CompilerError::UnresolvedRef("ops.a".into()).reason(), "UnresolvedReference");
        assert_eq!(CompilerError::DagWithBuild.reason(), "SchemaValidation");
        assert_eq!(
            CompilerError::from(SchemaError::UnknownKind("foojob".into())).reason(),
            "UnsupportedKind"
        );
        assert!(CompilerError::UnsupportedKind("dag".into()).is_schema());
        assert!(!CompilerError::Loader("x".into()).is_schema());
    }
}
