use serde::{Deserialize, Serialize};

use crate::patch::Patchable;

/// `timeout` corre desde el arranque; `ttl` desde que la run termina.
/// Los tipos sin signo hacen que un valor negativo falle al leer el documento.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Termination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Patchable for Termination {}
