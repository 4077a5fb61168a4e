//! Declaraciones de inputs/outputs y validación tipada de sus valores.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::init::{ArtifactsType, AuthType, DockerfileType, FileType, GitType, TensorboardType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    #[default]
    Any,
    Int,
    Float,
    Bool,
    Str,
    Dict,
    List,
    Date,
    Datetime,
    Uri,
    Auth,
    Image,
    Path,
    S3,
    Gcs,
    Wasb,
    Dockerfile,
    Git,
    File,
    Tensorboard,
    Artifacts,
    Metric,
    Metadata,
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(v.as_str().unwrap_or("any"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketPath {
    pub bucket: String,
    pub blob: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UriType {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub host: String,
}

/// Valor de un parámetro ya validado contra su tipo declarado.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Any(Value),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Dict(Map<String, Value>),
    Date(NaiveDate),
    DateTime(DateTime<FixedOffset>),
    List(Vec<ParamValue>),
    Image(String),
    Path(String),
    Uri(UriType),
    Auth(AuthType),
    S3(BucketPath),
    Gcs(BucketPath),
    Wasb(BucketPath),
    Dockerfile(DockerfileType),
    Git(GitType),
    File(FileType),
    Tensorboard(TensorboardType),
    Artifacts(ArtifactsType),
}

impl ParamValue {
    /// Forma canónica en JSON; las rutas de bucket vuelven a su URL original.
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Null => Value::Null,
            ParamValue::Any(v) => v.clone(),
            ParamValue::Str(s) | ParamValue::Image(s) | ParamValue::Path(s) => Value::String(s.clone()),
            ParamValue::Int(i) => Value::from(*i),
            ParamValue::Float(f) => Value::from(*f),
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Dict(m) => Value::Object(m.clone()),
            ParamValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            ParamValue::DateTime(d) => Value::String(d.to_rfc3339()),
            ParamValue::List(items) => Value::Array(items.iter().map(|i| i.to_json()).collect()),
            ParamValue::Uri(u) => Value::String(match (&u.user, &u.password) {
                (Some(user), Some(pass)) => format!("{user}:{pass}@{}", u.host),
                _ => u.host.clone(),
            }),
            ParamValue::Auth(a) => Value::String(format!("{}:{}", a.user, a.password)),
            ParamValue::S3(b) => Value::String(join_bucket("s3://", b)),
            ParamValue::Gcs(b) => Value::String(join_bucket("gs://", b)),
            ParamValue::Wasb(b) => Value::String(format!("wasbs://{}", join_blob(&b.bucket, &b.blob))),
            ParamValue::Dockerfile(d) => serde_json::to_value(d).unwrap_or(Value::Null),
            ParamValue::Git(g) => serde_json::to_value(g).unwrap_or(Value::Null),
            ParamValue::File(f) => serde_json::to_value(f).unwrap_or(Value::Null),
            ParamValue::Tensorboard(t) => serde_json::to_value(t).unwrap_or(Value::Null),
            ParamValue::Artifacts(a) => serde_json::to_value(a).unwrap_or(Value::Null),
        }
    }

    /// Representación en texto para variables de entorno y argumentos.
    pub fn to_env_string(&self) -> String {
        match self.to_json() {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

fn join_blob(bucket: &str, blob: &str) -> String {
    if blob.is_empty() {
        bucket.to_string()
    } else {
        format!("{bucket}/{blob}")
    }
}

fn join_bucket(scheme: &str, b: &BucketPath) -> String {
    format!("{scheme}{}", join_blob(&b.bucket, &b.blob))
}

/* --------- Parsers por tipo --------- */

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                Ok(f as i64)
            } else {
                Err(format!("`{n}` no es un entero"))
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| format!("`{s}` no es un entero")),
        other => Err(format!("`{other}` no es un entero")),
    }
}

fn parse_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| format!("`{n}` no es un float")),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| format!("`{s}` no es un float")),
        other => Err(format!("`{other}` no es un float")),
    }
}

fn parse_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
        Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(true),
            "false" | "0" | "no" | "n" => Ok(false),
            _ => Err(format!("`{s}` no es un bool")),
        },
        other => Err(format!("`{other}` no es un bool")),
    }
}

fn parse_bucket(value: &Value, schemes: &[&str]) -> Result<BucketPath, String> {
    let text = as_text(value).ok_or_else(|| format!("`{value}` no es una ruta de bucket"))?;
    let rest = schemes
        .iter()
        .find_map(|s| text.strip_prefix(s))
        .ok_or_else(|| format!("`{text}` debe empezar con uno de {schemes:?}"))?;
    let (bucket, blob) = match rest.split_once('/') {
        Some((b, p)) => (b, p.trim_end_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(format!("`{text}` no define bucket"));
    }
    Ok(BucketPath {
        bucket: bucket.to_string(),
        blob: blob.to_string(),
    })
}

fn parse_uri(value: &Value) -> Result<UriType, String> {
    match value {
        Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        _ => {
            let text = as_text(value).ok_or_else(|| format!("`{value}` no es una URI"))?;
            match text.rsplit_once('@') {
                Some((creds, host)) => {
                    let (user, password) = creds
                        .split_once(':')
                        .ok_or_else(|| format!("`{text}` tiene credenciales inválidas"))?;
                    Ok(UriType {
                        user: Some(user.to_string()),
                        password: Some(password.to_string()),
                        host: host.to_string(),
                    })
                }
                None if !text.is_empty() => Ok(UriType {
                    user: None,
                    password: None,
                    host: text,
                }),
                None => Err("URI vacía".to_string()),
            }
        }
    }
}

fn parse_auth(value: &Value) -> Result<AuthType, String> {
    match value {
        Value::Object(_) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        _ => {
            let text = as_text(value).ok_or_else(|| format!("`{value}` no es auth"))?;
            let (user, password) = text
                .split_once(':')
                .ok_or_else(|| "auth debe tener la forma `user:password`".to_string())?;
            Ok(AuthType {
                user: user.to_string(),
                password: password.to_string(),
            })
        }
    }
}

fn parse_image(value: &Value) -> Result<String, String> {
    let text = as_text(value).ok_or_else(|| format!("`{value}` no es una imagen"))?;
    if text.is_empty() || text.chars().any(char::is_whitespace) {
        return Err(format!("`{text}` no es una imagen válida"));
    }
    Ok(text)
}

fn parse_object<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T, String> {
    let v = match value {
        Value::String(s) => serde_json::from_str(s).map_err(|e| format!("{what}: {e}"))?,
        other => other.clone(),
    };
    serde_json::from_value(v).map_err(|e| format!("{what}: {e}"))
}

impl IoType {
    /// Valida un valor escalar (no lista) contra el tipo.
    pub fn parse(&self, value: &Value) -> Result<ParamValue, String> {
        if value.is_null() {
            return Ok(ParamValue::Null);
        }
        match self {
            IoType::Any | IoType::Metric | IoType::Metadata => Ok(ParamValue::Any(value.clone())),
            IoType::Str => as_text(value)
                .map(ParamValue::Str)
                .ok_or_else(|| format!("`{value}` no es un string")),
            IoType::Int => parse_int(value).map(ParamValue::Int),
            IoType::Float => parse_float(value).map(ParamValue::Float),
            IoType::Bool => parse_bool(value).map(ParamValue::Bool),
            IoType::Dict => match value {
                Value::Object(m) => Ok(ParamValue::Dict(m.clone())),
                Value::String(s) => serde_json::from_str::<Map<String, Value>>(s)
                    .map(ParamValue::Dict)
                    .map_err(|_| format!("`{s}` no es un dict")),
                other => Err(format!("`{other}` no es un dict")),
            },
            IoType::List => match value {
                Value::Array(items) => Ok(ParamValue::List(
                    items.iter().map(|i| ParamValue::Any(i.clone())).collect(),
                )),
                other => Err(format!("`{other}` no es una lista")),
            },
            IoType::Date => {
                let text = as_text(value).ok_or_else(|| format!("`{value}` no es una fecha"))?;
                NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map(ParamValue::Date)
                    .map_err(|e| format!("`{text}` no es una fecha: {e}"))
            }
            IoType::Datetime => {
                let text = as_text(value).ok_or_else(|| format!("`{value}` no es un datetime"))?;
                DateTime::parse_from_rfc3339(&text)
                    .map(ParamValue::DateTime)
                    .map_err(|e| format!("`{text}` no es un datetime ISO-8601: {e}"))
            }
            IoType::Uri => parse_uri(value).map(ParamValue::Uri),
            IoType::Auth => parse_auth(value).map(ParamValue::Auth),
            IoType::Image => parse_image(value).map(ParamValue::Image),
            IoType::Path => as_text(value)
                .map(ParamValue::Path)
                .ok_or_else(|| format!("`{value}` no es una ruta")),
            IoType::S3 => parse_bucket(value, &["s3://"]).map(ParamValue::S3),
            IoType::Gcs => parse_bucket(value, &["gs://", "gcs://"]).map(ParamValue::Gcs),
            IoType::Wasb => parse_bucket(value, &["wasbs://", "wasb://"]).map(ParamValue::Wasb),
            IoType::Dockerfile => parse_object::<DockerfileType>(value, "dockerfile")
                .and_then(|d| d.validate().map(|_| d).map_err(|e| e.to_string()))
                .map(ParamValue::Dockerfile),
            IoType::Git => parse_object(value, "git").map(ParamValue::Git),
            IoType::File => parse_object(value, "file").map(ParamValue::File),
            IoType::Tensorboard => parse_object(value, "tensorboard").map(ParamValue::Tensorboard),
            IoType::Artifacts => parse_object(value, "artifacts").map(ParamValue::Artifacts),
        }
    }
}

/* --------- IO --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Io {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub iotype: Option<IoType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_list: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_flag: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_validation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_init: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_env: Option<String>,
}

impl Io {
    pub fn io_type(&self) -> IoType {
        self.iotype.unwrap_or_default()
    }

    pub fn is_optional(&self) -> bool {
        self.is_optional.unwrap_or(false)
    }

    pub fn is_list(&self) -> bool {
        self.is_list.unwrap_or(false)
    }

    /// Valida `value` contra el tipo declarado (y contra `options` si existen).
    pub fn validate_value(&self, value: &Value) -> Result<ParamValue, String> {
        let parsed = if self.is_list() {
            match value {
                Value::Null => ParamValue::Null,
                Value::Array(items) => ParamValue::List(
                    items
                        .iter()
                        .map(|i| self.io_type().parse(i))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                Value::String(s) => {
                    let items: Vec<Value> = serde_json::from_str(s)
                        .map_err(|_| format!("`{s}` no es una lista"))?;
                    ParamValue::List(
                        items
                            .iter()
                            .map(|i| self.io_type().parse(i))
                            .collect::<Result<Vec<_>, _>>()?,
                    )
                }
                other => return Err(format!("`{other}` no es una lista")),
            }
        } else {
            self.io_type().parse(value)?
        };

        if let Some(options) = &self.options {
            let v = parsed.to_json();
            if !v.is_null() && !options.contains(&v) {
                return Err(format!("`{v}` no está entre las opciones {options:?}"));
            }
        }
        Ok(parsed)
    }

    /// Renderiza el valor como argumento CLI usando `argFormat` o `isFlag`.
    pub fn as_arg(&self) -> Option<String> {
        let value = self.value.as_ref()?;
        if self.is_flag.unwrap_or(false) {
            return match value {
                Value::Bool(true) => Some(format!("--{}", self.name)),
                _ => None,
            };
        }
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        Some(match &self.arg_format {
            Some(fmt) => fmt.replace("{{ value }}", &text).replace("{{value}}", &text),
            None => format!("--{}={}", self.name, text),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn io(t: IoType) -> Io {
        Io {
            name: "x".into(),
            iotype: Some(t),
            ..Default::default()
        }
    }

    #[test]
    fn int_acepta_strings_numericos() {
        assert_eq!(io(IoType::Int).validate_value(&json!("12")).unwrap(), ParamValue::Int(12));
        assert!(io(IoType::Int).validate_value(&json!("1.5")).is_err());
    }

    #[test]
    fn float_y_bool() {
        assert_eq!(
            io(IoType::Float).validate_value(&json!("0.001")).unwrap(),
            ParamValue::Float(0.001)
        );
        assert_eq!(io(IoType::Bool).validate_value(&json!("yes")).unwrap(), ParamValue::Bool(true));
    }

    #[test]
    fn s3_parsea_bucket_y_blob() {
        let v = io(IoType::S3).validate_value(&json!("s3://bucket/a/b/")).unwrap();
        assert_eq!(
            v,
            ParamValue::S3(BucketPath {
                bucket: "bucket".into(),
                blob: "a/b".into()
            })
        );
        assert_eq!(v.to_json(), json!("s3://bucket/a/b"));
        assert!(io(IoType::S3).validate_value(&json!("gs://bucket")).is_err());
    }

    #[test]
    fn image_rechaza_espacios() {
        assert!(io(IoType::Image).validate_value(&json!("acme/x:v1")).is_ok());
        assert!(io(IoType::Image).validate_value(&json!("acme x")).is_err());
    }

    #[test]
    fn listas_validan_cada_elemento() {
        let mut i = io(IoType::Int);
        i.is_list = Some(true);
        assert_eq!(
            i.validate_value(&json!([1, "2"])).unwrap(),
            ParamValue::List(vec![ParamValue::Int(1), ParamValue::Int(2)])
        );
        assert!(i.validate_value(&json!(["a"])).is_err());
    }

    #[test]
    fn opciones_restringen_valores() {
        let mut i = io(IoType::Str);
        i.options = Some(vec![json!("a"), json!("b")]);
        assert!(i.validate_value(&json!("a")).is_ok());
        assert!(i.validate_value(&json!("c")).is_err());
    }

    #[test]
    fn uri_y_auth() {
        let u = io(IoType::Uri).validate_value(&json!("user:pass@host.com")).unwrap();
        assert_eq!(u.to_json(), json!("user:pass@host.com"));
        assert!(io(IoType::Auth).validate_value(&json!("nouser")).is_err());
    }

    #[test]
    fn datetime_iso8601_con_offset() {
        let v = io(IoType::Datetime)
            .validate_value(&json!("2024-01-02T03:04:05+02:00"))
            .unwrap();
        assert!(matches!(v, ParamValue::DateTime(_)));
    }

    #[test]
    fn as_arg_usa_formato_o_flag() {
        let mut i = io(IoType::Float);
        i.name = "lr".into();
        i.value = Some(json!(0.1));
        assert_eq!(i.as_arg().as_deref(), Some("--lr=0.1"));
        i.arg_format = Some("-l {{ value }}".into());
        assert_eq!(i.as_arg().as_deref(), Some("-l 0.1"));

        let mut f = io(IoType::Bool);
        f.name = "debug".into();
        f.is_flag = Some(true);
        f.value = Some(json!(true));
        assert_eq!(f.as_arg().as_deref(), Some("--debug"));
    }
}
