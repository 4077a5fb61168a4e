use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Estados de una run, compartidos con el plano de control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Compiled,
    Queued,
    Scheduled,
    Starting,
    Running,
    Processing,
    Stopping,
    Retrying,
    Succeeded,
    Failed,
    Stopped,
    Skipped,
    UpstreamFailed,
    Unschedulable,
    Warning,
    Unknown,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Compiled => "compiled",
            Status::Queued => "queued",
            Status::Scheduled => "scheduled",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Processing => "processing",
            Status::Stopping => "stopping",
            Status::Retrying => "retrying",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
            Status::Skipped => "skipped",
            Status::UpstreamFailed => "upstream_failed",
            Status::Unschedulable => "unschedulable",
            Status::Warning => "warning",
            Status::Unknown => "unknown",
            Status::Done => "done",
        }
    }

    /// Estados absorbentes.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Stopped
                | Status::Skipped
                | Status::UpstreamFailed
                | Status::Done
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Status::Scheduled | Status::Starting | Status::Running | Status::Processing | Status::Retrying
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Created | Status::Compiled | Status::Queued)
    }

    fn rank(&self) -> u8 {
        match self {
            Status::Created => 0,
            Status::Compiled => 1,
            Status::Queued => 2,
            Status::Scheduled => 3,
            Status::Starting | Status::Retrying => 4,
            Status::Running => 5,
            Status::Processing | Status::Stopping => 6,
            Status::Unschedulable | Status::Warning | Status::Unknown => 7,
            Status::Succeeded
            | Status::Failed
            | Status::Stopped
            | Status::Skipped
            | Status::UpstreamFailed => 8,
            Status::Done => 9,
        }
    }

    /// Transiciones válidas. Los terminales sólo avanzan a `done`; `retrying`
    /// vuelve a `starting`; stop/skip se permiten desde cualquier estado vivo.
    pub fn can_transition(from: Status, to: Status) -> bool {
        if from == to {
            return false;
        }
        if from.is_done() {
            return to == Status::Done && from != Status::Done;
        }
        match to {
            Status::Stopping | Status::Stopped | Status::Skipped | Status::Failed | Status::UpstreamFailed => true,
            Status::Retrying => from.is_running() || matches!(from, Status::Warning | Status::Unknown),
            Status::Starting if from == Status::Retrying => true,
            Status::Warning | Status::Unknown | Status::Unschedulable => true,
            Status::Done => false,
            _ => {
                to.rank() > from.rank()
                    || matches!(from, Status::Warning | Status::Unknown | Status::Unschedulable)
            }
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condición que se reporta al plano de control en cada transición.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub kind: Status,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl StatusCondition {
    pub fn new(kind: Status, reason: impl Into<String>, message: impl Into<String>) -> Self {
        StatusCondition {
            kind,
            status: true,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Utc::now(),
        }
    }

    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Status::Failed, reason, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminales_son_absorbentes() {
        assert!(Status::Succeeded.is_done());
        assert!(!Status::Warning.is_done());
        assert!(!Status::can_transition(Status::Failed, Status::Running));
        assert!(Status::can_transition(Status::Failed, Status::Done));
        assert!(!Status::can_transition(Status::Done, Status::Done));
    }

    #[test]
    fn ciclo_feliz_y_reintentos() {
        let path = [
            Status::Created,
            Status::Compiled,
            Status::Queued,
            Status::Scheduled,
            Status::Starting,
            Status::Running,
            Status::Succeeded,
            Status::Done,
        ];
        for w in path.windows(2) {
            assert!(Status::can_transition(w[0], w[1]), "{} -> {}", w[0], w[1]);
        }
        assert!(Status::can_transition(Status::Running, Status::Retrying));
        assert!(Status::can_transition(Status::Retrying, Status::Starting));
        assert!(!Status::can_transition(Status::Running, Status::Queued));
    }

    #[test]
    fn condicion_serializa_type() {
        let c = StatusCondition::failed("SchemaValidation", "campo inválido");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "failed");
        assert_eq!(v["reason"], "SchemaValidation");
        assert!(v.get("lastTransitionTime").is_some());
    }
}
