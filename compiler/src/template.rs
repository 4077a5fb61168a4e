//! Render de expresiones `{{ ... }}` con tera.
//!
//! Las variables no definidas son error. Además de los filtros de tera se
//! registra `map_format`.

use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as _;
use tera::{Context, Tera};

use crate::error::{CompilerError, CompilerResult};

/// `{{ values | map_format(format="--x={}") }}` -> `["--x=1", "--x=2"]`
fn map_format(value: &Value, args: &HashMap<String, Value>) -> tera::Result<Value> {
    let fmt = args
        .get("format")
        .and_then(Value::as_str)
        .ok_or_else(|| tera::Error::msg("map_format requiere el argumento `format`"))?;
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    Ok(Value::Array(
        items
            .iter()
            .map(|i| {
                let text = match i {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Value::String(fmt.replace("{}", &text))
            })
            .collect(),
    ))
}

fn error_chain(e: &tera::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str(": ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

pub fn is_template_str(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

pub struct Renderer {
    tera: Tera,
    context: Context,
}

impl Renderer {
    /// `context` debe ser un objeto JSON.
    pub fn new(context: &Value) -> CompilerResult<Self> {
        let context = Context::from_value(context.clone()).map_err(|e| CompilerError::TemplateRender {
            expr: "<context>".into(),
            cause: error_chain(&e),
        })?;
        let mut tera = Tera::default();
        tera.register_filter("map_format", map_format);
        Ok(Renderer { tera, context })
    }

    pub fn render_str(&mut self, expr: &str) -> CompilerResult<String> {
        self.tera
            .render_str(expr, &self.context)
            .map_err(|e| CompilerError::TemplateRender {
                expr: expr.to_string(),
                cause: error_chain(&e),
            })
    }

    /// Renderiza en sitio cada string con plantillas. Las claves en `skip` (sólo
    /// en el primer nivel) se dejan intactas.
    pub fn render_value(&mut self, value: &mut Value, skip: &[&str]) -> CompilerResult<()> {
        match value {
            Value::String(s) if is_template_str(s) => {
                *s = self.render_str(s)?;
            }
            Value::Array(items) => {
                for item in items {
                    self.render_value(item, &[])?;
                }
            }
            Value::Object(map) => {
                for (k, v) in map.iter_mut() {
                    if skip.contains(&k.as_str()) {
                        continue;
                    }
                    self.render_value(v, &[])?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Atajo para un único string.
pub fn render(expr: &str, context: &Value) -> CompilerResult<String> {
    Renderer::new(context)?.render_str(expr)
}
