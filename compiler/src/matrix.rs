//! Sugerencias locales para `mapping`, `grid` y `random`.
//!
//! Las estrategias adaptativas (bayes, hyperband, hyperopt, iterative) las
//! resuelve un tuner externo.

use common::matrix::{GridMatrix, HpParam, Matrix, RandomMatrix};
use common::params::Param;
use common::Operation;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CompilerError, CompilerResult};

pub type Suggestion = BTreeMap<String, Value>;

pub fn get_suggestions(matrix: &Matrix) -> CompilerResult<Vec<Suggestion>> {
    matrix.validate()?;
    match matrix {
        Matrix::Mapping(m) => Ok(m.values.clone()),
        Matrix::Grid(g) => grid_suggestions(g),
        Matrix::Random(r) => random_suggestions(r),
        other => Err(CompilerError::UnsupportedKind(other.kind().to_string())),
    }
}

/* --------- Grid --------- */

fn grid_suggestions(grid: &GridMatrix) -> CompilerResult<Vec<Suggestion>> {
    let mut axes = Vec::with_capacity(grid.params.len());
    for (name, p) in &grid.params {
        if !p.is_discrete() {
            return Err(CompilerError::validation(
                format!("matrix.params.{name}"),
                "grid sólo admite distribuciones discretas",
            ));
        }
        axes.push((name, p.to_values()?));
    }

    let limit = grid.num_runs.map(|n| n as usize);
    let mut out: Vec<Suggestion> = vec![BTreeMap::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(out.len() * values.len());
        for partial in &out {
            for v in &values {
                let mut s = partial.clone();
                s.insert(name.clone(), v.clone());
                next.push(s);
            }
        }
        out = next;
    }
    if let Some(n) = limit {
        out.truncate(n);
    }
    Ok(out)
}

/* --------- Random --------- */

fn quantize(x: f64, q: f64) -> f64 {
    if q > 0.0 {
        (x / q).round() * q
    } else {
        x
    }
}

/// Box-Muller.
fn normal(rng: &mut StdRng, loc: f64, scale: f64) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    loc + scale * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn uniform(rng: &mut StdRng, low: f64, high: f64) -> f64 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}

fn sample(rng: &mut StdRng, name: &str, p: &HpParam) -> CompilerResult<Value> {
    let v = match p {
        HpParam::Pchoice { value } => {
            let mut roll: f64 = rng.gen();
            let mut chosen = value.last().map(|(v, _)| v.clone());
            for (v, w) in value {
                if roll < *w {
                    chosen = Some(v.clone());
                    break;
                }
                roll -= w;
            }
            return chosen.ok_or_else(|| {
                CompilerError::validation(format!("matrix.params.{name}"), "pchoice vacío")
            });
        }
        p if p.is_discrete() => {
            let values = p.to_values()?;
            if values.is_empty() {
                return Err(CompilerError::validation(
                    format!("matrix.params.{name}"),
                    "la distribución no tiene valores",
                ));
            }
            return Ok(values[rng.gen_range(0..values.len())].clone());
        }
        HpParam::Uniform { .. } => {
            let b = p.bounds()?;
            uniform(rng, b[0], b[1])
        }
        HpParam::Quniform { .. } => {
            let b = p.bounds()?;
            quantize(uniform(rng, b[0], b[1]), b[2])
        }
        HpParam::Loguniform { .. } => {
            let b = p.bounds()?;
            uniform(rng, b[0], b[1]).exp()
        }
        HpParam::Qloguniform { .. } => {
            let b = p.bounds()?;
            quantize(uniform(rng, b[0], b[1]).exp(), b[2])
        }
        HpParam::Normal { .. } => {
            let b = p.bounds()?;
            normal(rng, b[0], b[1])
        }
        HpParam::Qnormal { .. } => {
            let b = p.bounds()?;
            quantize(normal(rng, b[0], b[1]), b[2])
        }
        HpParam::Lognormal { .. } => {
            let b = p.bounds()?;
            normal(rng, b[0], b[1]).exp()
        }
        HpParam::Qlognormal { .. } => {
            let b = p.bounds()?;
            quantize(normal(rng, b[0], b[1]).exp(), b[2])
        }
        _ => {
            return Err(CompilerError::validation(
                format!("matrix.params.{name}"),
                "distribución no soportada",
            ))
        }
    };
    Ok(Value::from(v))
}

fn random_suggestions(random: &RandomMatrix) -> CompilerResult<Vec<Suggestion>> {
    let mut rng = match random.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..random.num_runs)
        .map(|_| {
            random
                .params
                .iter()
                .map(|(name, p)| Ok((name.clone(), sample(&mut rng, name, p)?)))
                .collect()
        })
        .collect()
}

/* --------- Operaciones --------- */

/// Una operación por sugerencia, sin `matrix` ni `schedule` y con los params fijados.
pub fn get_ops_from_suggestions(op: &Operation, suggestions: &[Suggestion]) -> Vec<Operation> {
    suggestions
        .iter()
        .map(|s| {
            let mut out = op.clone();
            out.matrix = None;
            out.schedule = None;
            let params = out.params.get_or_insert_with(BTreeMap::new);
            for (k, v) in s {
                params.insert(k.clone(), Param::literal(v.clone()));
            }
            out
        })
        .collect()
}
