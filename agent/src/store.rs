//! Destino de los artefactos que sincroniza el sidecar.

use async_trait::async_trait;
use common::connections::Connection;
use common::names::to_env_name;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error de E/S en `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("clave inválida: {0}")]
    InvalidKey(String),

    #[error("store no soportado: {0}")]
    Unsupported(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operaciones que el syncer necesita de un blob store. Las claves son
/// relativas a la raíz de la run.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_file(&self, local: &Path, key: &str) -> StoreResult<()>;
    async fn rm_file(&self, key: &str) -> StoreResult<()>;
    async fn rm_dir(&self, key: &str) -> StoreResult<()>;
}

/// Store sobre un directorio montado (volume claim o host path).
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalStore { root: root.into() }
    }

    fn target(&self, key: &str) -> StoreResult<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.split('/').any(|p| p == "..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn ignore_missing(res: std::io::Result<()>) -> std::io::Result<()> {
    match res {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Resuelve el store de artefactos de la run a partir del entorno que el
/// compilador inyecta en el sidecar (`POLYAXON_ARTIFACTS_STORE_NAME` y la
/// entrada `POLYAXON_CONNECTION_<NAME>` del catálogo).
pub fn store_from_env<F>(lookup: F, run_uuid: &str) -> StoreResult<LocalStore>
where
    F: Fn(&str) -> Option<String>,
{
    let name = lookup("POLYAXON_ARTIFACTS_STORE_NAME")
        .ok_or_else(|| StoreError::Unsupported("falta POLYAXON_ARTIFACTS_STORE_NAME".into()))?;
    let var = format!("POLYAXON_CONNECTION_{}", to_env_name(&name));
    let raw = lookup(&var).ok_or_else(|| StoreError::Unsupported(format!("falta {var}")))?;
    let entry: Value = serde_json::from_str(&raw).map_err(|e| StoreError::Unsupported(format!("{var}: {e}")))?;
    // El catálogo guarda secret/configMap como nombres; sólo interesan kind y schema.
    let conn: Connection = serde_json::from_value(json!({
        "name": entry.get("name").cloned().unwrap_or(Value::String(name.clone())),
        "kind": entry.get("kind").cloned().unwrap_or(Value::Null),
        "schema": entry.get("schema").cloned().unwrap_or(Value::Null),
    }))
    .map_err(|e| StoreError::Unsupported(format!("{var}: {e}")))?;

    match conn.mount_info() {
        Some((mount_path, _)) => {
            let root = Path::new(&mount_path).join(run_uuid);
            debug!("store de artefactos en {}", root.display());
            Ok(LocalStore::new(root))
        }
        None => Err(StoreError::Unsupported(format!(
            "la conexión `{}` de tipo {} no está montada",
            conn.name, conn.kind
        ))),
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    async fn put_file(&self, local: &Path, key: &str) -> StoreResult<()> {
        let target = self.target(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        tokio::fs::copy(local, &target).await.map_err(io_err(local))?;
        Ok(())
    }

    async fn rm_file(&self, key: &str) -> StoreResult<()> {
        let target = self.target(key)?;
        ignore_missing(tokio::fs::remove_file(&target).await).map_err(io_err(&target))
    }

    async fn rm_dir(&self, key: &str) -> StoreResult<()> {
        let target = self.target(key)?;
        ignore_missing(tokio::fs::remove_dir_all(&target).await).map_err(io_err(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(sub: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("plx_agent_store_tests").join(sub);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn put_y_rm_en_directorio_local() {
        let base = temp_dir("put_rm");
        let src = base.join("a.txt");
        std::fs::write(&src, "hola").unwrap();
        let store = LocalStore::new(base.join("store"));

        store.put_file(&src, "outputs/a.txt").await.unwrap();
        assert_eq!(std::fs::read_to_string(base.join("store/outputs/a.txt")).unwrap(), "hola");

        store.rm_file("outputs/a.txt").await.unwrap();
        assert!(!base.join("store/outputs/a.txt").exists());
        store.rm_file("outputs/a.txt").await.unwrap();
        store.rm_dir("outputs").await.unwrap();
        assert!(!base.join("store/outputs").exists());
    }

    #[test]
    fn store_desde_el_catalogo_del_entorno() {
        let env = |k: &str| match k {
            "POLYAXON_ARTIFACTS_STORE_NAME" => Some("store".to_string()),
            "POLYAXON_CONNECTION_STORE" => Some(
                r#"{"name":"store","kind":"volume_claim","schema":{"volumeClaim":"pvc","mountPath":"/plx-store"},"secret":"s"}"#
                    .to_string(),
            ),
            _ => None,
        };
        let store = store_from_env(env, "abc").unwrap();
        assert_eq!(store.root, PathBuf::from("/plx-store/abc"));

        let bucket = |k: &str| match k {
            "POLYAXON_ARTIFACTS_STORE_NAME" => Some("s3".to_string()),
            "POLYAXON_CONNECTION_S3" => Some(r#"{"name":"s3","kind":"s3","schema":{"bucket":"s3://b"}}"#.to_string()),
            _ => None,
        };
        assert!(matches!(store_from_env(bucket, "abc"), Err(StoreError::Unsupported(_))));
        assert!(matches!(store_from_env(|_| None, "abc"), Err(StoreError::Unsupported(_))));
    }

    #[tokio::test]
    async fn claves_que_escapan_de_la_raiz_se_rechazan() {
        let store = LocalStore::new(temp_dir("escape"));
        assert!(matches!(
            store.rm_file("../etc/passwd").await,
            Err(StoreError::InvalidKey(_))
        ));
    }
}
