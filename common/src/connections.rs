use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{SchemaError, SchemaResult};
use crate::k8s::EnvVar;
use crate::names;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    HostPath,
    VolumeClaim,
    Gcs,
    S3,
    Wasb,
    Registry,
    Git,
    Aws,
    Azure,
    Gcp,
    Ssh,
    Slack,
    Discord,
    Mattermost,
    Teams,
    Webhook,
    Pagerduty,
    Custom,
}

impl ConnectionKind {
    pub fn is_bucket(&self) -> bool {
        matches!(self, ConnectionKind::Gcs | ConnectionKind::S3 | ConnectionKind::Wasb)
    }

    pub fn is_mount(&self) -> bool {
        matches!(self, ConnectionKind::HostPath | ConnectionKind::VolumeClaim)
    }

    pub fn is_artifact(&self) -> bool {
        self.is_bucket() || self.is_mount()
    }

    pub fn is_notifier(&self) -> bool {
        matches!(
            self,
            ConnectionKind::Slack
                | ConnectionKind::Discord
                | ConnectionKind::Mattermost
                | ConnectionKind::Teams
                | ConnectionKind::Webhook
                | ConnectionKind::Pagerduty
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::HostPath => "host_path",
            ConnectionKind::VolumeClaim => "volume_claim",
            ConnectionKind::Gcs => "gcs",
            ConnectionKind::S3 => "s3",
            ConnectionKind::Wasb => "wasb",
            ConnectionKind::Registry => "registry",
            ConnectionKind::Git => "git",
            ConnectionKind::Aws => "aws",
            ConnectionKind::Azure => "azure",
            ConnectionKind::Gcp => "gcp",
            ConnectionKind::Ssh => "ssh",
            ConnectionKind::Slack => "slack",
            ConnectionKind::Discord => "discord",
            ConnectionKind::Mattermost => "mattermost",
            ConnectionKind::Teams => "teams",
            ConnectionKind::Webhook => "webhook",
            ConnectionKind::Pagerduty => "pagerduty",
            ConnectionKind::Custom => "custom",
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* --------- Schemas por tipo de conexión --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketConnection {
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimConnection {
    pub volume_claim: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathConnection {
    pub host_path: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConnection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UriConnection {
    pub url: String,
}

/// Schema ya interpretado según el `kind` de la conexión.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionSchema {
    Bucket(BucketConnection),
    Claim(ClaimConnection),
    HostPath(HostPathConnection),
    Git(GitConnection),
    Uri(UriConnection),
    Custom(BTreeMap<String, Value>),
}

/// Secret o config map que una conexión (o el agente) puede referenciar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_requested: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub name: String,
    pub kind: ConnectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, rename = "schema", skip_serializing_if = "Option::is_none")]
    pub schema_: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ConnectionResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConnectionResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Connection {
    pub fn is_bucket(&self) -> bool {
        self.kind.is_bucket()
    }

    pub fn is_mount(&self) -> bool {
        self.kind.is_mount()
    }

    pub fn is_artifact(&self) -> bool {
        self.kind.is_artifact()
    }

    pub fn is_git(&self) -> bool {
        self.kind == ConnectionKind::Git
    }

    /// Interpreta `schema` según el `kind`.
    pub fn schema(&self) -> SchemaResult<Option<ConnectionSchema>> {
        let path = format!("connections.{}.schema", self.name);
        let raw = match &self.schema_ {
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                if self.is_artifact() {
                    return Err(SchemaError::validation(
                        path,
                        format!("la conexión de tipo `{}` requiere un schema", self.kind),
                    ));
                }
                return Ok(None);
            }
        };
        let parse_err = |e: serde_json::Error| SchemaError::validation(path.clone(), e.to_string());
        let schema = match self.kind {
            ConnectionKind::Gcs | ConnectionKind::S3 | ConnectionKind::Wasb => {
                ConnectionSchema::Bucket(serde_json::from_value(raw).map_err(parse_err)?)
            }
            ConnectionKind::VolumeClaim => {
                ConnectionSchema::Claim(serde_json::from_value(raw).map_err(parse_err)?)
            }
            ConnectionKind::HostPath => {
                ConnectionSchema::HostPath(serde_json::from_value(raw).map_err(parse_err)?)
            }
            ConnectionKind::Git => ConnectionSchema::Git(serde_json::from_value(raw).map_err(parse_err)?),
            ConnectionKind::Registry
            | ConnectionKind::Slack
            | ConnectionKind::Discord
            | ConnectionKind::Mattermost
            | ConnectionKind::Teams
            | ConnectionKind::Webhook
            | ConnectionKind::Pagerduty => {
                ConnectionSchema::Uri(serde_json::from_value(raw).map_err(parse_err)?)
            }
            _ => ConnectionSchema::Custom(serde_json::from_value(raw).map_err(parse_err)?),
        };
        Ok(Some(schema))
    }

    pub fn validate(&self) -> SchemaResult<()> {
        names::validate_slug(&format!("connections.{}", self.name), &self.name)?;
        self.schema()?;
        Ok(())
    }

    /// Ruta base del store: bucket (`s3://...`) o ruta de montaje.
    pub fn store_path(&self) -> Option<String> {
        match self.schema().ok().flatten()? {
            ConnectionSchema::Bucket(b) => Some(b.bucket.trim_end_matches('/').to_string()),
            ConnectionSchema::Claim(c) => Some(c.mount_path),
            ConnectionSchema::HostPath(h) => Some(h.mount_path),
            _ => None,
        }
    }

    /// Ruta de montaje y read-only para conexiones de volumen.
    pub fn mount_info(&self) -> Option<(String, Option<bool>)> {
        match self.schema().ok().flatten()? {
            ConnectionSchema::Claim(c) => Some((c.mount_path, c.read_only)),
            ConnectionSchema::HostPath(h) => Some((h.mount_path, h.read_only)),
            _ => None,
        }
    }

    /// Diccionario que se expone en los contextos de plantillas.
    pub fn context_value(&self) -> Value {
        match &self.schema_ {
            Some(Value::Object(m)) => Value::Object(m.clone()),
            _ => Value::Object(Default::default()),
        }
    }

    /// Nombre de la variable de entorno del catálogo de esta conexión.
    pub fn catalog_env_name(&self) -> String {
        format!("POLYAXON_CONNECTION_{}", names::to_env_name(&self.name))
    }

    /// Entrada del catálogo serializada (sin valores de secretos).
    pub fn catalog_value(&self) -> String {
        let mut catalog = serde_json::Map::new();
        catalog.insert("name".into(), Value::String(self.name.clone()));
        catalog.insert("kind".into(), Value::String(self.kind.to_string()));
        if let Some(schema) = &self.schema_ {
            catalog.insert("schema".into(), schema.clone());
        }
        if let Some(secret) = &self.secret {
            catalog.insert("secret".into(), Value::String(secret.name.clone()));
        }
        if let Some(cm) = &self.config_map {
            catalog.insert("configMap".into(), Value::String(cm.name.clone()));
        }
        Value::Object(catalog).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(v: Value) -> Connection {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn schema_bucket_y_store_path() {
        let c = conn(json!({"name": "store", "kind": "s3", "schema": {"bucket": "s3://foo/"}}));
        assert!(c.is_bucket());
        assert_eq!(c.store_path().as_deref(), Some("s3://foo"));
    }

    #[test]
    fn schema_claim_expone_mount() {
        let c = conn(json!({
            "name": "data",
            "kind": "volume_claim",
            "schema": {"volumeClaim": "pvc1", "mountPath": "/data", "readOnly": true}
        }));
        assert_eq!(c.mount_info(), Some(("/data".to_string(), Some(true))));
    }

    #[test]
    fn artifact_sin_schema_es_invalido() {
        let c = conn(json!({"name": "data", "kind": "host_path"}));
        assert!(c.validate().is_err());
    }

    #[test]
    fn nombre_de_catalogo_en_mayusculas() {
        let c = conn(json!({"name": "git-1", "kind": "git", "schema": {"url": "https://x"}}));
        assert_eq!(c.catalog_env_name(), "POLYAXON_CONNECTION_GIT_1");
        assert!(c.catalog_value().contains("\"kind\":\"git\""));
    }
}
