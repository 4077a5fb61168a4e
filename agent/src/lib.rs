//! Agente: reconcilia las operaciones del plano de control contra un
//! backend (Kubernetes o Docker) y sincroniza artefactos desde el sidecar.

pub mod client;
pub mod config;
pub mod executor;
pub mod healthz;
pub mod reconcile;
pub mod retry;
pub mod sidecar;
pub mod store;
pub mod sync;

pub use client::{ClientError, ControlPlane, HttpControlPlane};
pub use config::{AgentContext, Catalog};
pub use executor::{Executor, ExecutorError, Resource, ResourceStatus};
pub use reconcile::{Agent, TickReport};
