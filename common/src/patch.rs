use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SchemaError, SchemaResult};

/// Estrategias de merge entre dos nodos del esquema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatchStrategy {
    Replace,
    Isnull,
    #[default]
    PostMerge,
    PreMerge,
}

/// Aplica `right` sobre `left` según la estrategia.
///
/// - `replace`: cada campo presente en `right` sobreescribe.
/// - `isnull`: sólo escribe si el campo de `left` no está definido.
/// - `post_merge`: gana `right`, dicts se mezclan en profundidad, listas se
///   concatenan al final sin duplicados.
/// - `pre_merge`: gana `left`, dicts en profundidad, listas se anteponen sin
///   duplicados.
///
/// Los `null` de `right` se consideran "no definidos" y nunca pisan nada.
pub fn patch_value(left: &mut Value, right: &Value, strategy: PatchStrategy) {
    match (left, right) {
        (_, Value::Null) => {}
        (Value::Object(l), Value::Object(r)) => patch_object(l, r, strategy),
        (l, r) => {
            if let Some(merged) = merge_leaf(l, r, strategy) {
                *l = merged;
            }
        }
    }
}

fn patch_object(left: &mut Map<String, Value>, right: &Map<String, Value>, strategy: PatchStrategy) {
    for (key, rvalue) in right {
        if rvalue.is_null() {
            continue;
        }
        match left.get_mut(key) {
            None => {
                left.insert(key.clone(), rvalue.clone());
            }
            Some(lvalue) if lvalue.is_null() => {
                *lvalue = rvalue.clone();
            }
            Some(lvalue) => match strategy {
                PatchStrategy::Replace => *lvalue = rvalue.clone(),
                PatchStrategy::Isnull => {}
                PatchStrategy::PostMerge | PatchStrategy::PreMerge => {
                    if lvalue.is_object() && rvalue.is_object() {
                        patch_value(lvalue, rvalue, strategy);
                    } else if let Some(merged) = merge_leaf(lvalue, rvalue, strategy) {
                        *lvalue = merged;
                    }
                }
            },
        }
    }
}

/// Merge de valores no-dict. Devuelve `None` cuando `left` se conserva.
fn merge_leaf(left: &Value, right: &Value, strategy: PatchStrategy) -> Option<Value> {
    if left.is_null() {
        return Some(right.clone());
    }
    match strategy {
        PatchStrategy::Replace => Some(right.clone()),
        PatchStrategy::Isnull => None,
        PatchStrategy::PostMerge => match (left, right) {
            (Value::Array(l), Value::Array(r)) => Some(Value::Array(append_unique(l, r))),
            _ => Some(right.clone()),
        },
        PatchStrategy::PreMerge => match (left, right) {
            (Value::Array(l), Value::Array(r)) => Some(Value::Array(append_unique(r, l))),
            _ => None,
        },
    }
}

fn append_unique(first: &[Value], second: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(first.len() + second.len());
    for v in first.iter().chain(second.iter()) {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

/// Nodos del esquema que se pueden mezclar con otro del mismo tipo.
///
/// El merge trabaja sobre la forma serializada (JSON) y vuelve a validar el
/// resultado, así cualquier tipo `Serialize + DeserializeOwned` lo obtiene gratis.
pub trait Patchable: Serialize + DeserializeOwned {
    fn patch(&self, other: &Self, strategy: PatchStrategy) -> SchemaResult<Self> {
        let right = serde_json::to_value(other)?;
        self.patch_with_value(&right, strategy)
    }

    fn patch_with_value(&self, right: &Value, strategy: PatchStrategy) -> SchemaResult<Self> {
        let mut left = serde_json::to_value(self)?;
        patch_value(&mut left, right, strategy);
        serde_json::from_value(left).map_err(|e| SchemaError::from_serde("patch", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_sobreescribe_sin_mezclar() {
        let mut left = json!({"a": 1, "d": {"x": 1, "y": 2}, "l": [1, 2]});
        patch_value(
            &mut left,
            &json!({"d": {"x": 5}, "l": [3]}),
            PatchStrategy::Replace,
        );
        assert_eq!(left, json!({"a": 1, "d": {"x": 5}, "l": [3]}));
    }

    #[test]
    fn isnull_solo_completa_campos_vacios() {
        let mut left = json!({"a": 1, "b": null});
        patch_value(&mut left, &json!({"a": 2, "b": 3, "c": 4}), PatchStrategy::Isnull);
        assert_eq!(left, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn post_merge_gana_derecha_y_agrega_listas() {
        let mut left = json!({"a": 1, "d": {"x": 1, "y": 2}, "l": [1, 2]});
        patch_value(
            &mut left,
            &json!({"a": 2, "d": {"x": 5, "z": 0}, "l": [2, 3]}),
            PatchStrategy::PostMerge,
        );
        assert_eq!(left, json!({"a": 2, "d": {"x": 5, "y": 2, "z": 0}, "l": [1, 2, 3]}));
    }

    #[test]
    fn pre_merge_gana_izquierda_y_antepone_listas() {
        let mut left = json!({"a": 1, "d": {"x": 1}, "l": [1, 2]});
        patch_value(
            &mut left,
            &json!({"a": 2, "d": {"x": 5, "z": 0}, "l": [2, 3]}),
            PatchStrategy::PreMerge,
        );
        assert_eq!(left, json!({"a": 1, "d": {"x": 1, "z": 0}, "l": [3, 1, 2]}));
    }

    #[test]
    fn null_en_derecha_nunca_pisa() {
        let mut left = json!({"a": 1});
        patch_value(&mut left, &json!({"a": null}), PatchStrategy::Replace);
        assert_eq!(left, json!({"a": 1}));
    }
}
