//! Helpers de nombres: slugs, etiquetas DNS-1123 y nombres de recursos.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::{SchemaError, SchemaResult};

pub const MAX_LABEL_LEN: usize = 63;
pub const OPERATION_RESOURCE_PREFIX: &str = "plx-operation";
pub const CLEANER_RESOURCE_PREFIX: &str = "plx-cleaner";

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("regex de slug"));
static DNS_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("regex dns-1123"));

pub fn is_slug(value: &str) -> bool {
    SLUG_RE.is_match(value)
}

pub fn validate_slug(path: &str, value: &str) -> SchemaResult<()> {
    if is_slug(value) {
        Ok(())
    } else {
        Err(SchemaError::validation(
            path,
            format!("`{value}` no es un slug válido ([a-zA-Z0-9_-]+)"),
        ))
    }
}

pub fn is_dns_label(value: &str) -> bool {
    value.len() <= MAX_LABEL_LEN && DNS_LABEL_RE.is_match(value)
}

/// Convierte un nombre arbitrario en una etiqueta DNS-1123 (`_` -> `-`).
pub fn sanitize_dns_label(value: &str) -> String {
    let lowered: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' || c == ' ' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();
    let truncated: String = lowered.chars().take(MAX_LABEL_LEN).collect();
    truncated.trim_matches('-').to_string()
}

/// Trunca un valor de etiqueta a 63 caracteres.
pub fn truncate_label(value: &str) -> String {
    let t: String = value.chars().take(MAX_LABEL_LEN).collect();
    t.trim_end_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// Sufijo hexadecimal de 10 caracteres, derivado de `seed`.
///
/// Es estable para una misma semilla, así la conversión de una operación
/// compilada produce siempre los mismos nombres de contenedor.
pub fn hex_suffix(seed: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
    id.simple().to_string()[..10].to_string()
}

/// Nombre de contenedor único dentro del pod: `<prefix>-<hex10>`.
pub fn container_name(prefix: &str, seed: &str) -> String {
    let suffix = hex_suffix(seed);
    let max_prefix = MAX_LABEL_LEN - suffix.len() - 1;
    let prefix = sanitize_dns_label(prefix);
    let prefix: String = prefix.chars().take(max_prefix).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), suffix)
}

pub fn resource_name(run_uuid: &Uuid) -> String {
    format!("{}-{}", OPERATION_RESOURCE_PREFIX, run_uuid.simple())
}

pub fn cleaner_resource_name(run_uuid: &Uuid) -> String {
    format!("{}-{}", CLEANER_RESOURCE_PREFIX, run_uuid.simple())
}

/// `my-conn.x` -> `MY_CONN_X`
pub fn to_env_name(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_validos_e_invalidos() {
        assert!(is_slug("acme_org-1"));
        assert!(!is_slug("acme org"));
        assert!(!is_slug(""));
        assert!(validate_slug("owner", "a.b").is_err());
    }

    #[test]
    fn sanitize_reemplaza_guion_bajo_y_minusculas() {
        assert_eq!(sanitize_dns_label("My_Init.Name"), "my-init-name");
        assert_eq!(sanitize_dns_label("__x__"), "x");
    }

    #[test]
    fn container_name_es_dns_label_y_estable() {
        let a = container_name("polyaxon-init-git", "uuid/git1/0");
        let b = container_name("polyaxon-init-git", "uuid/git1/0");
        let c = container_name("polyaxon-init-git", "uuid/git1/1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(is_dns_label(&a));
        assert!(a.starts_with("polyaxon-init-git-"));
        assert_eq!(a.len(), "polyaxon-init-git-".len() + 10);
    }

    #[test]
    fn container_name_con_prefijo_largo_no_pasa_63() {
        let prefix = "x".repeat(100);
        let name = container_name(&prefix, "seed");
        assert!(name.len() <= MAX_LABEL_LEN);
        assert!(is_dns_label(&name));
    }

    #[test]
    fn truncate_label_corta_a_63() {
        let long = "a".repeat(80);
        assert_eq!(truncate_label(&long).len(), 63);
    }

    #[test]
    fn nombres_de_recursos() {
        let id = Uuid::parse_str("6b1e1e6e-62a8-4a4b-9b1e-6d3d2b8f0c11").unwrap();
        assert_eq!(resource_name(&id), "plx-operation-6b1e1e6e62a84a4b9b1e6d3d2b8f0c11");
        assert!(cleaner_resource_name(&id).starts_with("plx-cleaner-"));
    }
}
