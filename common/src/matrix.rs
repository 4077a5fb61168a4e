//! Espacios de búsqueda de hiperparámetros.
//!
//! Aquí sólo vive el modelo y su validación; la enumeración de sugerencias
//! está en `compiler::matrix`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{SchemaError, SchemaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimization {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationMetric {
    pub name: String,
    pub optimization: Optimization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EarlyStopping {
    #[serde(rename_all = "camelCase")]
    MetricEarlyStopping {
        metric: String,
        value: f64,
        optimization: Optimization,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    FailureEarlyStopping { percent: f64 },
}

/* --------- Distribuciones --------- */

/// Un hiperparámetro. `value` admite lista (`[0, 1, 5]`), dict
/// (`{start: 0, stop: 1, num: 5}`) o string (`"0:1:5"`) según el tipo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HpParam {
    Choice { value: Vec<Value> },
    Pchoice { value: Vec<(Value, f64)> },
    Range { value: Value },
    Linspace { value: Value },
    Logspace { value: Value },
    Geomspace { value: Value },
    Uniform { value: Value },
    Quniform { value: Value },
    Loguniform { value: Value },
    Qloguniform { value: Value },
    Normal { value: Value },
    Qnormal { value: Value },
    Lognormal { value: Value },
    Qlognormal { value: Value },
}

/// Tope de valores que una distribución discreta puede enumerar.
pub const MAX_ENUMERATED_VALUES: usize = 10_000;

fn enumerated_len(count: f64) -> SchemaResult<usize> {
    if !count.is_finite() || count > MAX_ENUMERATED_VALUES as f64 {
        return Err(SchemaError::validation(
            "matrix.params",
            format!("la distribución enumera más de {MAX_ENUMERATED_VALUES} valores"),
        ));
    }
    Ok(count.max(0.0) as usize)
}

fn numbers(value: &Value, keys: &[&str], min: usize) -> SchemaResult<Vec<f64>> {
    let bad = |cause: String| SchemaError::validation("matrix.params", cause);
    let nums: Vec<f64> = match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| bad(format!("`{v}` no es numérico"))))
            .collect::<SchemaResult<_>>()?,
        Value::String(s) => s
            .split(':')
            .map(|p| p.trim().parse::<f64>().map_err(|_| bad(format!("`{s}` no es `a:b:c`"))))
            .collect::<SchemaResult<_>>()?,
        Value::Object(m) => keys
            .iter()
            .map_while(|k| m.get(*k))
            .map(|v| v.as_f64().ok_or_else(|| bad(format!("`{v}` no es numérico"))))
            .collect::<SchemaResult<_>>()?,
        other => return Err(bad(format!("`{other}` no es una distribución válida"))),
    };
    if nums.len() < min {
        return Err(bad(format!("se esperaban al menos {min} valores: {keys:?}")));
    }
    Ok(nums)
}

fn as_number(f: f64, ints: bool) -> Value {
    if ints && f.fract() == 0.0 {
        Value::from(f as i64)
    } else {
        Value::from(f)
    }
}

fn is_int(v: &Value) -> bool {
    v.as_i64().is_some() || v.as_str().map_or(false, |s| s.split(':').all(|p| p.trim().parse::<i64>().is_ok()))
}

fn all_ints(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(is_int),
        Value::Object(m) => m.values().all(is_int),
        other => is_int(other),
    }
}

impl HpParam {
    /// Las discretas se pueden enumerar (grid); las continuas sólo muestrear.
    pub fn is_discrete(&self) -> bool {
        matches!(
            self,
            HpParam::Choice { .. }
                | HpParam::Pchoice { .. }
                | HpParam::Range { .. }
                | HpParam::Linspace { .. }
                | HpParam::Logspace { .. }
                | HpParam::Geomspace { .. }
        )
    }

    pub fn is_continuous(&self) -> bool {
        !self.is_discrete()
    }

    /// Valores de una distribución discreta, en orden.
    pub fn to_values(&self) -> SchemaResult<Vec<Value>> {
        match self {
            HpParam::Choice { value } => Ok(value.clone()),
            HpParam::Pchoice { value } => Ok(value.iter().map(|(v, _)| v.clone()).collect()),
            HpParam::Range { value } => {
                let n = numbers(value, &["start", "stop", "step"], 3)?;
                let (start, stop, step) = (n[0], n[1], n[2]);
                if step == 0.0 {
                    return Err(SchemaError::validation("matrix.params", "range con step 0"));
                }
                let len = enumerated_len(((stop - start) / step).ceil())?;
                let ints = all_ints(value);
                let mut out = Vec::with_capacity(len);
                let mut x = start;
                while (step > 0.0 && x < stop) || (step < 0.0 && x > stop) {
                    out.push(as_number(x, ints));
                    x += step;
                }
                Ok(out)
            }
            HpParam::Linspace { value } => {
                let n = numbers(value, &["start", "stop", "num"], 3)?;
                Ok(linspace(n[0], n[1], enumerated_len(n[2])?)
                    .into_iter()
                    .map(Value::from)
                    .collect())
            }
            HpParam::Logspace { value } => {
                let n = numbers(value, &["start", "stop", "num", "base"], 3)?;
                let base = n.get(3).copied().unwrap_or(10.0);
                Ok(linspace(n[0], n[1], enumerated_len(n[2])?)
                    .into_iter()
                    .map(|e| Value::from(base.powf(e)))
                    .collect())
            }
            HpParam::Geomspace { value } => {
                let n = numbers(value, &["start", "stop", "num"], 3)?;
                if n[0] <= 0.0 || n[1] <= 0.0 {
                    return Err(SchemaError::validation(
                        "matrix.params",
                        "geomspace requiere extremos positivos",
                    ));
                }
                Ok(linspace(n[0].ln(), n[1].ln(), enumerated_len(n[2])?)
                    .into_iter()
                    .map(|e| Value::from(e.exp()))
                    .collect())
            }
            _ => Err(SchemaError::validation(
                "matrix.params",
                "una distribución continua no se puede enumerar",
            )),
        }
    }

    /// Parámetros numéricos de una distribución continua:
    /// `[low, high]`, `[low, high, q]`, `[loc, scale]` o `[loc, scale, q]`.
    pub fn bounds(&self) -> SchemaResult<Vec<f64>> {
        match self {
            HpParam::Uniform { value } | HpParam::Loguniform { value } => {
                numbers(value, &["low", "high"], 2)
            }
            HpParam::Quniform { value } | HpParam::Qloguniform { value } => {
                numbers(value, &["low", "high", "q"], 3)
            }
            HpParam::Normal { value } | HpParam::Lognormal { value } => {
                numbers(value, &["loc", "scale"], 2)
            }
            HpParam::Qnormal { value } | HpParam::Qlognormal { value } => {
                numbers(value, &["loc", "scale", "q"], 3)
            }
            _ => Err(SchemaError::validation("matrix.params", "distribución discreta")),
        }
    }

    pub fn validate(&self, name: &str) -> SchemaResult<()> {
        let path = format!("matrix.params.{name}");
        let res = if self.is_discrete() {
            self.to_values().and_then(|v| {
                if v.is_empty() {
                    Err(SchemaError::validation(&path, "la distribución no tiene valores"))
                } else {
                    Ok(())
                }
            })
        } else {
            self.bounds().map(|_| ())
        };
        if let HpParam::Pchoice { value } = self {
            let total: f64 = value.iter().map(|(_, p)| p).sum();
            if (total - 1.0).abs() > 1e-6 {
                return Err(SchemaError::validation(path, "las probabilidades de pchoice deben sumar 1"));
            }
        }
        res.map_err(|e| match e {
            SchemaError::Validation { cause, .. } => SchemaError::validation(path, cause),
            other => other,
        })
    }
}

fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}

/* --------- Matrix --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingMatrix {
    pub values: Vec<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridMatrix {
    pub params: BTreeMap<String, HpParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RandomMatrix {
    pub params: BTreeMap<String, HpParam>,
    pub num_runs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BayesMatrix {
    pub params: BTreeMap<String, HpParam>,
    pub num_initial_runs: u32,
    pub max_iterations: u32,
    pub metric: OptimizationMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utility_function: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperbandMatrix {
    pub params: BTreeMap<String, HpParam>,
    pub max_iterations: u32,
    pub eta: f64,
    pub resource: Value,
    pub metric: OptimizationMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HyperoptMatrix {
    pub params: BTreeMap<String, HpParam>,
    pub num_runs: u32,
    pub metric: OptimizationMetric,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterativeMatrix {
    pub params: BTreeMap<String, HpParam>,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stopping: Option<Vec<EarlyStopping>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Matrix {
    Mapping(MappingMatrix),
    Grid(GridMatrix),
    Random(RandomMatrix),
    Bayes(BayesMatrix),
    Hyperband(HyperbandMatrix),
    Hyperopt(HyperoptMatrix),
    Iterative(IterativeMatrix),
}

impl Matrix {
    pub fn kind(&self) -> &'static str {
        match self {
            Matrix::Mapping(_) => "mapping",
            Matrix::Grid(_) => "grid",
            Matrix::Random(_) => "random",
            Matrix::Bayes(_) => "bayes",
            Matrix::Hyperband(_) => "hyperband",
            Matrix::Hyperopt(_) => "hyperopt",
            Matrix::Iterative(_) => "iterative",
        }
    }

    pub fn concurrency(&self) -> u32 {
        let c = match self {
            Matrix::Mapping(m) => m.concurrency,
            Matrix::Grid(m) => m.concurrency,
            Matrix::Random(m) => m.concurrency,
            Matrix::Bayes(m) => m.concurrency,
            Matrix::Hyperband(m) => m.concurrency,
            Matrix::Hyperopt(m) => m.concurrency,
            Matrix::Iterative(m) => m.concurrency,
        };
        c.unwrap_or(1)
    }

    pub fn params(&self) -> Option<&BTreeMap<String, HpParam>> {
        match self {
            Matrix::Mapping(_) => None,
            Matrix::Grid(m) => Some(&m.params),
            Matrix::Random(m) => Some(&m.params),
            Matrix::Bayes(m) => Some(&m.params),
            Matrix::Hyperband(m) => Some(&m.params),
            Matrix::Hyperopt(m) => Some(&m.params),
            Matrix::Iterative(m) => Some(&m.params),
        }
    }

    /// Las estrategias adaptativas necesitan un tuner; no se enumeran localmente.
    pub fn requires_tuner(&self) -> bool {
        matches!(
            self,
            Matrix::Bayes(_) | Matrix::Hyperband(_) | Matrix::Hyperopt(_) | Matrix::Iterative(_)
        )
    }

    pub fn validate(&self) -> SchemaResult<()> {
        let positive = |field: &str, v: Option<u32>| -> SchemaResult<()> {
            match v {
                Some(0) => Err(SchemaError::validation(
                    format!("matrix.{field}"),
                    "debe ser un entero positivo",
                )),
                _ => Ok(()),
            }
        };
        let concurrency = match self {
            Matrix::Mapping(m) => m.concurrency,
            Matrix::Grid(m) => m.concurrency,
            Matrix::Random(m) => m.concurrency,
            Matrix::Bayes(m) => m.concurrency,
            Matrix::Hyperband(m) => m.concurrency,
            Matrix::Hyperopt(m) => m.concurrency,
            Matrix::Iterative(m) => m.concurrency,
        };
        positive("concurrency", concurrency)?;
        match self {
            Matrix::Mapping(m) => {
                if m.values.is_empty() {
                    return Err(SchemaError::validation("matrix.values", "mapping sin valores"));
                }
            }
            Matrix::Grid(m) => {
                positive("numRuns", m.num_runs)?;
                for (name, p) in &m.params {
                    if p.is_continuous() {
                        return Err(SchemaError::validation(
                            format!("matrix.params.{name}"),
                            "grid sólo admite distribuciones discretas",
                        ));
                    }
                }
            }
            Matrix::Random(m) => positive("numRuns", Some(m.num_runs))?,
            Matrix::Bayes(m) => {
                positive("numInitialRuns", Some(m.num_initial_runs))?;
                positive("maxIterations", Some(m.max_iterations))?;
            }
            Matrix::Hyperband(m) => {
                positive("maxIterations", Some(m.max_iterations))?;
                if m.eta <= 1.0 {
                    return Err(SchemaError::validation("matrix.eta", "eta debe ser > 1"));
                }
            }
            Matrix::Hyperopt(m) => {
                positive("numRuns", Some(m.num_runs))?;
                positive("maxIterations", m.max_iterations)?;
            }
            Matrix::Iterative(m) => positive("maxIterations", Some(m.max_iterations))?,
        }
        for (name, p) in self.params().into_iter().flatten() {
            p.validate(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matrix(v: Value) -> Matrix {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn grid_con_choice() {
        let m = matrix(json!({
            "kind": "grid",
            "params": {"lr": {"kind": "choice", "value": [0.01, 0.1]}},
            "concurrency": 2
        }));
        assert_eq!(m.kind(), "grid");
        assert_eq!(m.concurrency(), 2);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn concurrency_cero_es_invalida() {
        let m = matrix(json!({"kind": "random", "params": {}, "numRuns": 3, "concurrency": 0}));
        assert!(m.validate().is_err());
    }

    #[test]
    fn kind_desconocido_falla() {
        assert!(serde_json::from_value::<Matrix>(json!({"kind": "foo"})).is_err());
    }

    #[test]
    fn range_linspace_y_logspace() {
        let r = HpParam::Range { value: json!("0:10:5") };
        assert_eq!(r.to_values().unwrap(), vec![json!(0), json!(5)]);
        let l = HpParam::Linspace {
            value: json!({"start": 0, "stop": 1, "num": 3}),
        };
        assert_eq!(l.to_values().unwrap(), vec![json!(0.0), json!(0.5), json!(1.0)]);
        let g = HpParam::Logspace { value: json!([0, 2, 3]) };
        assert_eq!(g.to_values().unwrap(), vec![json!(1.0), json!(10.0), json!(100.0)]);
    }

    #[test]
    fn enumeraciones_enormes_se_rechazan() {
        let huge = HpParam::Range { value: json!("0:1000000000:1") };
        assert!(matches!(huge.to_values(), Err(SchemaError::Validation { .. })));
        let tiny_step = HpParam::Range { value: json!([0, 1, 1e-12]) };
        assert!(tiny_step.to_values().is_err());
        let l = HpParam::Linspace { value: json!([0, 1, 1e9]) };
        assert!(l.to_values().is_err());

        let edge = HpParam::Range { value: json!([0, MAX_ENUMERATED_VALUES, 1]) };
        assert_eq!(edge.to_values().unwrap().len(), MAX_ENUMERATED_VALUES);

        let m = matrix(json!({
            "kind": "grid",
            "params": {"lr": {"kind": "range", "value": "0:1000000000:1"}}
        }));
        assert!(m.validate().is_err());
    }

    #[test]
    fn grid_rechaza_continuas() {
        let m = matrix(json!({
            "kind": "grid",
            "params": {"lr": {"kind": "uniform", "value": [0, 1]}}
        }));
        assert!(m.validate().is_err());
    }

    #[test]
    fn hyperband_conserva_resume() {
        let m = matrix(json!({
            "kind": "hyperband",
            "params": {"lr": {"kind": "uniform", "value": [0, 1]}},
            "maxIterations": 81,
            "eta": 3,
            "resource": {"name": "epochs", "type": "int"},
            "metric": {"name": "loss", "optimization": "minimize"},
            "resume": true
        }));
        assert!(m.requires_tuner());
        assert_eq!(serde_json::to_value(&m).unwrap()["resume"], json!(true));
    }
}
