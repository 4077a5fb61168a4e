//! Loop del sidecar: sigue al contenedor principal y sincroniza artefactos.

use async_trait::async_trait;
use common::fswatcher::FsWatcher;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::executor::k8s::map_kube_error;
use crate::executor::{ExecutorError, ExecutorResult};
use crate::retry::RetryPolicy;
use crate::store::ArtifactStore;
use crate::sync::{sync_paths, sync_roots, SyncReport};

/// Estado del contenedor principal que el sidecar vigila.
#[async_trait]
pub trait MainState: Send + Sync {
    async fn is_done(&self) -> ExecutorResult<bool>;
}

/// Lee el estado del contenedor principal desde el propio pod.
pub struct PodMainState {
    pods: Api<Pod>,
    pod: String,
    container: String,
}

impl PodMainState {
    pub async fn from_env(container: &str) -> ExecutorResult<Self> {
        let pod = std::env::var("POLYAXON_K8S_POD_ID")
            .map_err(|_| ExecutorError::Other("falta POLYAXON_K8S_POD_ID".into()))?;
        let namespace = std::env::var("POLYAXON_K8S_NAMESPACE")
            .map_err(|_| ExecutorError::Other("falta POLYAXON_K8S_NAMESPACE".into()))?;
        let client = Client::try_default()
            .await
            .map_err(|e| ExecutorError::ClusterUnavailable(e.to_string()))?;
        Ok(PodMainState {
            pods: Api::namespaced(client, &namespace),
            pod,
            container: container.to_string(),
        })
    }
}

#[async_trait]
impl MainState for PodMainState {
    async fn is_done(&self) -> ExecutorResult<bool> {
        let pod = self
            .pods
            .get(&self.pod)
            .await
            .map_err(|e| map_kube_error(&self.pod, e))?;
        let terminated = pod
            .status
            .and_then(|s| s.container_statuses)
            .unwrap_or_default()
            .into_iter()
            .find(|c| c.name == self.container)
            .and_then(|c| c.state)
            .and_then(|s| s.terminated);
        Ok(terminated.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct SidecarOptions {
    /// Raíz local de la run: `<artifactsRoot>/<uuid>`.
    pub run_path: PathBuf,
    pub sleep_interval: Duration,
    pub sync_interval: Duration,
    pub monitor_logs: bool,
    pub monitor_spec: bool,
    pub concurrency: usize,
    pub exclude: Vec<String>,
}

/// Corre hasta que el contenedor principal termina y hace un último sync.
/// Sólo devuelve error si el estado del principal no se puede leer.
pub async fn run_sidecar(
    main: &dyn MainState,
    store: &dyn ArtifactStore,
    opts: &SidecarOptions,
    retry: &RetryPolicy,
) -> ExecutorResult<SyncReport> {
    let watcher_path = FsWatcher::default_path(&opts.run_path);
    let mut watcher = FsWatcher::read(&watcher_path).unwrap_or_else(|e| {
        warn!("no se pudo leer {}: {}", watcher_path.display(), e);
        FsWatcher::new()
    });
    let mut last_sync: Option<Instant> = None;
    let mut total = SyncReport::default();

    loop {
        let done = retry
            .run("estado del contenedor principal", ExecutorError::is_transient, || async {}, || {
                main.is_done()
            })
            .await?;

        let due = last_sync.map_or(true, |t| t.elapsed() >= opts.sync_interval);
        if (due || done) && (opts.monitor_spec || opts.monitor_logs) {
            let roots = if opts.monitor_spec {
                sync_roots(&opts.run_path, opts.monitor_logs)
            } else {
                vec![opts.run_path.join("logs")]
            };
            let report = sync_paths(
                &mut watcher,
                store,
                &opts.run_path,
                &roots,
                opts.concurrency,
                &opts.exclude,
            )
            .await;
            if let Err(e) = watcher.write(&watcher_path) {
                warn!("no se pudo guardar {}: {}", watcher_path.display(), e);
            }
            total.put += report.put;
            total.removed_files += report.removed_files;
            total.removed_dirs += report.removed_dirs;
            total.errors.extend(report.errors);
            last_sync = Some(Instant::now());
        }

        if done {
            info!(
                "contenedor principal terminado; {} archivos subidos en total",
                total.put
            );
            return Ok(total);
        }
        debug!("contenedor principal en curso");
        sleep(opts.sleep_interval).await;
    }
}
