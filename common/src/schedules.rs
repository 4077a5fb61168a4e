use chrono::{DateTime, FixedOffset};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{SchemaError, SchemaResult};

/// Duración en segundos. En el documento puede venir como entero o como
/// tupla `(días, segundos, microsegundos)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frequency(pub f64);

impl Frequency {
    pub fn seconds(&self) -> f64 {
        self.0
    }
}

impl Serialize for Frequency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.fract() == 0.0 {
            serializer.serialize_i64(self.0 as i64)
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Frequency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_f64()
                .map(Frequency)
                .ok_or_else(|| de::Error::custom("frecuencia inválida")),
            Value::Array(parts) if parts.len() == 3 => {
                let nums: Option<Vec<f64>> = parts.iter().map(Value::as_f64).collect();
                let nums = nums.ok_or_else(|| de::Error::custom("la tupla debe ser numérica"))?;
                Ok(Frequency(nums[0] * 86_400.0 + nums[1] + nums[2] / 1_000_000.0))
            }
            other => Err(de::Error::custom(format!(
                "frecuencia debe ser segundos o (días, segundos, microsegundos): {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalSchedule {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on_past: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub cron: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on_past: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeSchedule {
    pub start_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    Interval(IntervalSchedule),
    Cron(CronSchedule),
    Datetime(DateTimeSchedule),
}

fn check_window(
    start: Option<&DateTime<FixedOffset>>,
    end: Option<&DateTime<FixedOffset>>,
) -> SchemaResult<()> {
    if let (Some(s), Some(e)) = (start, end) {
        if e < s {
            return Err(SchemaError::validation(
                "schedule.endAt",
                "endAt debe ser posterior o igual a startAt",
            ));
        }
    }
    Ok(())
}

impl Schedule {
    pub fn validate(&self) -> SchemaResult<()> {
        match self {
            Schedule::Interval(s) => {
                if s.frequency.seconds() < 1.0 {
                    return Err(SchemaError::validation(
                        "schedule.frequency",
                        "la frecuencia mínima es 1 segundo",
                    ));
                }
                check_window(s.start_at.as_ref(), s.end_at.as_ref())
            }
            Schedule::Cron(s) => {
                validate_cron(&s.cron)?;
                check_window(s.start_at.as_ref(), s.end_at.as_ref())
            }
            Schedule::Datetime(_) => Ok(()),
        }
    }
}

/* --------- Cron --------- */

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

fn cron_value(raw: &str, min: u32, max: u32, names: &[&str]) -> Option<u32> {
    if let Ok(n) = raw.parse::<u32>() {
        return (min..=max).contains(&n).then_some(n);
    }
    let lower = raw.to_lowercase();
    names
        .iter()
        .position(|n| *n == lower)
        .map(|i| i as u32 + min)
}

fn validate_cron_field(field: &str, min: u32, max: u32, names: &[&str]) -> bool {
    field.split(',').all(|part| {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (part, None),
        };
        if let Some(step) = step {
            match step.parse::<u32>() {
                Ok(s) if s > 0 => {}
                _ => return false,
            }
        }
        if range == "*" {
            return true;
        }
        match range.split_once('-') {
            Some((a, b)) => match (cron_value(a, min, max, names), cron_value(b, min, max, names)) {
                (Some(a), Some(b)) => a <= b,
                _ => false,
            },
            None => cron_value(range, min, max, names).is_some(),
        }
    })
}

/// Valida una expresión cron de 5 campos (`min hora día-mes mes día-semana`).
pub fn validate_cron(expr: &str) -> SchemaResult<()> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let err = |cause: &str| SchemaError::validation("schedule.cron", format!("`{expr}`: {cause}"));
    if fields.len() != 5 {
        return Err(err("se esperan 5 campos"));
    }
    let specs: [(u32, u32, &[&str]); 5] = [
        (0, 59, &[]),
        (0, 23, &[]),
        (1, 31, &[]),
        (1, 12, &MONTHS),
        (0, 7, &DAYS),
    ];
    for (field, (min, max, names)) in fields.iter().zip(specs.iter()) {
        if !validate_cron_field(field, *min, *max, names) {
            return Err(err(&format!("campo `{field}` inválido")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cron_validos() {
        for expr in ["* * * * *", "0 12 * * mon-fri", "*/15 0-6 1,15 jan *", "5 4 * * 7"] {
            assert!(validate_cron(expr).is_ok(), "{expr}");
        }
    }

    #[test]
    fn cron_invalidos() {
        for expr in ["* * * *", "60 * * * *", "* * * foo *", "*/0 * * * *", "5-1 * * * *"] {
            assert!(validate_cron(expr).is_err(), "{expr}");
        }
    }

    #[test]
    fn frecuencia_como_tupla() {
        let s: Schedule =
            serde_json::from_value(json!({"kind": "interval", "frequency": [1, 30, 0]})).unwrap();
        match &s {
            Schedule::Interval(i) => assert_eq!(i.frequency.seconds(), 86_430.0),
            _ => panic!("se esperaba interval"),
        }
        assert!(s.validate().is_ok());
    }

    #[test]
    fn frecuencia_menor_a_un_segundo_es_invalida() {
        let s: Schedule =
            serde_json::from_value(json!({"kind": "interval", "frequency": 0})).unwrap();
        assert!(s.validate().is_err());
    }

    #[test]
    fn end_at_antes_de_start_at_es_invalido() {
        let s: Schedule = serde_json::from_value(json!({
            "kind": "cron",
            "cron": "0 0 * * *",
            "startAt": "2024-01-02T00:00:00+00:00",
            "endAt": "2024-01-01T00:00:00+00:00"
        }))
        .unwrap();
        assert!(s.validate().is_err());
    }
}
