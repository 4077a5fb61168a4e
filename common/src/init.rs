use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{SchemaError, SchemaResult};
use crate::k8s::Container;

/* --------- Tipos de inicialización --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

impl GitType {
    /// Nombre del repo a partir de la URL (`.../repo.git` -> `repo`).
    pub fn repo_name(&self) -> Option<String> {
        let url = self.url.as_deref()?.trim_end_matches('/');
        let last = url.rsplit(['/', ':']).next()?;
        let name = last.trim_end_matches(".git");
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerfileType {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<Vec<CopyStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_run_copy: Option<Vec<CopyStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Paso `COPY`: una ruta (`src` se copia al workdir) o un par `[src, dest]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyStep {
    Path(String),
    Pair(Vec<String>),
}

impl DockerfileType {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("Dockerfile")
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.image.trim().is_empty() {
            return Err(SchemaError::validation("dockerfile.image", "la imagen es obligatoria"));
        }
        if self.uid.is_some() != self.gid.is_some() {
            return Err(SchemaError::validation(
                "dockerfile.uid",
                "uid y gid deben definirse juntos",
            ));
        }
        for step in self.copy.iter().flatten().chain(self.post_run_copy.iter().flatten()) {
            if let CopyStep::Pair(p) = step {
                if p.len() != 2 {
                    return Err(SchemaError::validation(
                        "dockerfile.copy",
                        "cada copia debe ser `src` o `[src, dest]`",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileType {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chmod: Option<String>,
}

impl FileType {
    pub fn filename(&self) -> &str {
        self.filename.as_deref().unwrap_or("file")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TensorboardType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_names: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
}

impl ArtifactsType {
    pub fn is_empty(&self) -> bool {
        self.files.as_ref().map_or(true, |f| f.is_empty())
            && self.dirs.as_ref().map_or(true, |d| d.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthType {
    pub user: String,
    pub password: String,
}

/* --------- Init --------- */

/// Una entrada de `init`: como mucho uno de los tipos puede estar definido.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Init {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactsType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<DockerfileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensorboard: Option<TensorboardType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitKind {
    Artifacts,
    Paths,
    Git,
    Dockerfile,
    File,
    Tensorboard,
    Auth,
    /// Sólo `connection`: descarga del store de esa conexión.
    Connection,
    /// Sólo `container`: contenedor de usuario.
    Container,
}

impl Init {
    /// Valida la exclusión mutua y devuelve el tipo efectivo.
    pub fn kind(&self) -> SchemaResult<InitKind> {
        let mut kinds = Vec::new();
        if self.artifacts.is_some() {
            kinds.push(InitKind::Artifacts);
        }
        if self.paths.is_some() {
            kinds.push(InitKind::Paths);
        }
        if self.git.is_some() {
            kinds.push(InitKind::Git);
        }
        if self.dockerfile.is_some() {
            kinds.push(InitKind::Dockerfile);
        }
        if self.file.is_some() {
            kinds.push(InitKind::File);
        }
        if self.tensorboard.is_some() {
            kinds.push(InitKind::Tensorboard);
        }
        if self.auth == Some(true) {
            kinds.push(InitKind::Auth);
        }
        match kinds.len() {
            0 => {
                if self.connection.is_some() {
                    Ok(InitKind::Connection)
                } else if self.container.is_some() {
                    Ok(InitKind::Container)
                } else {
                    Err(SchemaError::InvalidInit(
                        "se requiere uno de artifacts, paths, git, dockerfile, file, tensorboard, auth, connection o container".into(),
                    ))
                }
            }
            1 => {
                let kind = kinds[0];
                // auth y dockerfile/file no usan conexión
                if self.connection.is_some()
                    && matches!(kind, InitKind::Auth | InitKind::Dockerfile | InitKind::File)
                {
                    return Err(SchemaError::InvalidInit(format!(
                        "`connection` no se puede combinar con {:?}",
                        kind
                    )));
                }
                Ok(kind)
            }
            _ => Err(SchemaError::InvalidInit(format!(
                "sólo se permite un tipo por init, se recibieron {:?}",
                kinds
            ))),
        }
    }

    pub fn validate(&self) -> SchemaResult<()> {
        match self.kind()? {
            InitKind::Dockerfile => self.dockerfile.as_ref().map_or(Ok(()), |d| d.validate()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init(v: serde_json::Value) -> Init {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn git_con_conexion_es_valido() {
        let i = init(json!({"connection": "git1", "git": {"revision": "branchA"}}));
        assert_eq!(i.kind().unwrap(), InitKind::Git);
    }

    #[test]
    fn dos_tipos_a_la_vez_es_invalido() {
        let i = init(json!({"git": {}, "file": {"content": "x"}}));
        assert!(matches!(i.kind(), Err(SchemaError::InvalidInit(_))));
    }

    #[test]
    fn init_vacio_es_invalido() {
        assert!(matches!(Init::default().kind(), Err(SchemaError::InvalidInit(_))));
    }

    #[test]
    fn solo_conexion_o_solo_contenedor() {
        assert_eq!(init(json!({"connection": "s3"})).kind().unwrap(), InitKind::Connection);
        assert_eq!(
            init(json!({"container": {"image": "busybox"}})).kind().unwrap(),
            InitKind::Container
        );
    }

    #[test]
    fn dockerfile_con_conexion_es_invalido() {
        let i = init(json!({"connection": "x", "dockerfile": {"image": "python:3"}}));
        assert!(i.kind().is_err());
    }

    #[test]
    fn repo_name_desde_url() {
        let g = GitType {
            url: Some("https://github.com/acme/models.git".into()),
            ..Default::default()
        };
        assert_eq!(g.repo_name().as_deref(), Some("models"));
    }
}
