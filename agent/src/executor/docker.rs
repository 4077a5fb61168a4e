//! Executor local: cada run es una secuencia de `docker run` en su propio
//! grupo de procesos.

use async_trait::async_trait;
use chrono::Utc;
use common::settings::ExecutorKind;
use common::{LogLine, RunKind, Status};
use compiler::converters::k8s::resource_name;
use compiler::DockerPlan;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Executor, ExecutorError, ExecutorResult, Resource, ResourceStatus};

#[derive(Debug, Clone)]
struct DockerRun {
    kind: RunKind,
    status: Status,
    pid: Option<i32>,
    message: Option<String>,
}

type Runs = Arc<Mutex<HashMap<Uuid, DockerRun>>>;

pub struct DockerExecutor {
    runs: Runs,
    artifacts_root: PathBuf,
    docker_bin: String,
}

fn lock(runs: &Runs) -> std::sync::MutexGuard<'_, HashMap<Uuid, DockerRun>> {
    match runs.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn update(runs: &Runs, uuid: &Uuid, f: impl FnOnce(&mut DockerRun)) {
    if let Some(run) = lock(runs).get_mut(uuid) {
        f(run);
    }
}

fn halted(status: Status) -> bool {
    matches!(status, Status::Stopping | Status::Stopped)
}

/// Una run borrada del mapa también cuenta como detenida.
fn is_halted(runs: &Runs, uuid: &Uuid) -> bool {
    lock(runs).get(uuid).map(|r| halted(r.status)).unwrap_or(true)
}

fn term_group(pid: i32) -> ExecutorResult<()> {
    match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ExecutorError::Other(e.to_string())),
    }
}

impl DockerExecutor {
    pub fn new(artifacts_root: impl Into<PathBuf>) -> Self {
        Self::with_binary(artifacts_root, "docker")
    }

    pub fn with_binary(artifacts_root: impl Into<PathBuf>, docker_bin: &str) -> Self {
        DockerExecutor {
            runs: Arc::new(Mutex::new(HashMap::new())),
            artifacts_root: artifacts_root.into(),
            docker_bin: docker_bin.to_string(),
        }
    }

    pub fn logs_dir(&self, run_uuid: &Uuid) -> PathBuf {
        logs_dir(&self.artifacts_root, run_uuid)
    }

    fn status_of(&self, uuid: &Uuid) -> ExecutorResult<ResourceStatus> {
        let runs = lock(&self.runs);
        let run = runs
            .get(uuid)
            .ok_or_else(|| ExecutorError::NotFound(uuid.simple().to_string()))?;
        Ok(ResourceStatus {
            name: resource_name(run.kind, uuid),
            run_uuid: *uuid,
            kind: run.kind,
            status: run.status,
            message: run.message.clone(),
        })
    }
}

fn logs_dir(root: &Path, run_uuid: &Uuid) -> PathBuf {
    root.join(run_uuid.simple().to_string()).join("logs")
}

/// Corre los contenedores en orden; el primero que falla corta la secuencia.
/// Una run detenida nunca vuelve a `Running` ni termina en `Succeeded`.
async fn run_plan(runs: Runs, uuid: Uuid, plan: DockerPlan, docker_bin: String, logs: PathBuf) {
    if let Err(e) = std::fs::create_dir_all(&logs) {
        warn!("no se pudo crear {}: {}", logs.display(), e);
    }
    let total = plan.containers.len();
    for (idx, c) in plan.containers.iter().enumerate() {
        if is_halted(&runs, &uuid) {
            debug!("run {}: detenida antes de lanzar {}", uuid.simple(), c.name);
            break;
        }
        let out = match File::create(logs.join(format!("{}.log", c.name))) {
            Ok(f) => f,
            Err(e) => {
                warn!("no se pudo abrir el log de {}: {}", c.name, e);
                update(&runs, &uuid, |r| {
                    if !halted(r.status) {
                        r.status = Status::Failed;
                        r.message = Some(e.to_string());
                    }
                });
                break;
            }
        };
        let err = match out.try_clone() {
            Ok(f) => Stdio::from(f),
            Err(_) => Stdio::null(),
        };
        let spawned = Command::new(&docker_bin)
            .args(c.run_args())
            .stdout(Stdio::from(out))
            .stderr(err)
            .process_group(0)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("no se pudo lanzar {}: {}", c.name, e);
                update(&runs, &uuid, |r| {
                    if !halted(r.status) {
                        r.status = Status::Failed;
                        r.message = Some(format!("{}: {}", c.name, e));
                    }
                });
                break;
            }
        };
        let is_main = idx + 1 == total;
        let pid = child.id().map(|p| p as i32);
        // Un stop que llegó entre el chequeo y el spawn no vio el pid.
        let stopped_meanwhile = match lock(&runs).get_mut(&uuid) {
            Some(r) if !halted(r.status) => {
                r.pid = pid;
                if is_main {
                    r.status = Status::Running;
                }
                false
            }
            _ => true,
        };
        if stopped_meanwhile {
            if let Some(pid) = pid {
                if let Err(e) = term_group(pid) {
                    warn!("no se pudo detener {}: {}", c.name, e);
                }
            }
            let _ = child.wait().await;
            break;
        }
        debug!("run {}: contenedor {} lanzado", uuid.simple(), c.name);

        let result = child.wait().await;
        update(&runs, &uuid, |r| r.pid = None);
        match result {
            Ok(code) if code.success() => continue,
            Ok(code) => {
                update(&runs, &uuid, |r| {
                    if !halted(r.status) {
                        r.status = Status::Failed;
                        r.message = Some(format!("{} terminó con {}", c.name, code));
                    }
                });
                break;
            }
            Err(e) => {
                update(&runs, &uuid, |r| {
                    if !halted(r.status) {
                        r.status = Status::Failed;
                        r.message = Some(e.to_string());
                    }
                });
                break;
            }
        }
    }
    update(&runs, &uuid, |r| match r.status {
        Status::Stopping | Status::Stopped => r.status = Status::Stopped,
        Status::Failed => {}
        _ => r.status = Status::Succeeded,
    });
    info!("run {} terminada", uuid.simple());
}

#[async_trait]
impl Executor for DockerExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Docker
    }

    async fn create(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        _namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        let plan = match resource {
            Resource::Docker(plan) => plan.clone(),
            Resource::Kubernetes(_) => {
                return Err(ExecutorError::UnsupportedOperation(
                    "recurso de kubernetes en el executor docker".into(),
                ))
            }
        };
        {
            let mut runs = lock(&self.runs);
            if runs.contains_key(run_uuid) {
                return Err(ExecutorError::ResourceConflict(resource_name(run_kind, run_uuid)));
            }
            runs.insert(
                *run_uuid,
                DockerRun {
                    kind: run_kind,
                    status: Status::Starting,
                    pid: None,
                    message: None,
                },
            );
        }
        tokio::spawn(run_plan(
            self.runs.clone(),
            *run_uuid,
            plan,
            self.docker_bin.clone(),
            self.logs_dir(run_uuid),
        ));
        self.status_of(run_uuid)
    }

    async fn apply(
        &self,
        _run_uuid: &Uuid,
        _run_kind: RunKind,
        _resource: &Resource,
        _namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        Err(ExecutorError::UnsupportedOperation("apply".into()))
    }

    async fn stop(&self, run_uuid: &Uuid, _run_kind: RunKind, _namespace: Option<&str>) -> ExecutorResult<()> {
        let pid = {
            let mut runs = lock(&self.runs);
            let run = runs
                .get_mut(run_uuid)
                .ok_or_else(|| ExecutorError::NotFound(run_uuid.simple().to_string()))?;
            if run.status.is_done() {
                return Ok(());
            }
            run.status = Status::Stopping;
            run.pid
        };
        if let Some(pid) = pid {
            term_group(pid)?;
            info!("SIGTERM al grupo {} de la run {}", pid, run_uuid.simple());
        } else {
            // Sin contenedor vivo: run_plan ve el estado y no lanza el siguiente.
            update(&self.runs, run_uuid, |r| r.status = Status::Stopped);
        }
        Ok(())
    }

    async fn clean(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()> {
        self.stop(run_uuid, run_kind, namespace).await?;
        lock(&self.runs).remove(run_uuid);
        Ok(())
    }

    async fn get(&self, run_uuid: &Uuid, _run_kind: RunKind, _namespace: Option<&str>) -> ExecutorResult<ResourceStatus> {
        self.status_of(run_uuid)
    }

    async fn list_ops(&self, _namespace: Option<&str>) -> ExecutorResult<Vec<ResourceStatus>> {
        let uuids: Vec<Uuid> = lock(&self.runs).keys().copied().collect();
        uuids.iter().map(|u| self.status_of(u)).collect()
    }

    async fn logs(&self, run_uuid: &Uuid, _run_kind: RunKind, _namespace: Option<&str>) -> ExecutorResult<Vec<LogLine>> {
        let dir = self.logs_dir(run_uuid);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutorError::NotFound(dir.display().to_string()))
            }
            Err(e) => return Err(ExecutorError::Other(e.to_string())),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ExecutorError::Other(e.to_string()))?
        {
            files.push(entry.path());
        }
        files.sort();
        let node = hostname::get().ok().map(|h| h.to_string_lossy().to_string());
        let mut out = Vec::new();
        for path in files {
            let container = path.file_stem().map(|s| s.to_string_lossy().to_string());
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ExecutorError::Other(e.to_string()))?;
            out.extend(text.lines().map(|l| LogLine {
                timestamp: Utc::now(),
                node: node.clone(),
                pod: None,
                container: container.clone(),
                value: l.to_string(),
            }));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::converters::docker::DockerContainer;
    use std::time::Duration;

    fn temp_dir(sub: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("plx_agent_docker_tests").join(sub);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn plan() -> Resource {
        Resource::Docker(DockerPlan {
            containers: vec![
                DockerContainer {
                    name: "polyaxon-init-file-abc".into(),
                    image: "busybox".into(),
                    ..Default::default()
                },
                DockerContainer {
                    name: "polyaxon-main".into(),
                    image: "busybox".into(),
                    ..Default::default()
                },
            ],
        })
    }

    /// Binario falso: el contenedor principal duerme, los init salen enseguida.
    fn slow_main_bin(root: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let bin = root.join("fake-docker.sh");
        std::fs::write(&bin, "#!/bin/sh\ncase \"$*\" in *polyaxon-main*) exec sleep 30;; esac\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        bin.display().to_string()
    }

    async fn wait_done(exec: &DockerExecutor, uuid: &Uuid) -> ResourceStatus {
        for _ in 0..100 {
            let s = exec.get(uuid, RunKind::Job, None).await.unwrap();
            if s.status.is_done() {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("la run no terminó");
    }

    #[tokio::test]
    async fn secuencia_exitosa_deja_logs_por_contenedor() {
        let root = temp_dir("ok");
        let exec = DockerExecutor::with_binary(&root, "echo");
        let uuid = Uuid::new_v4();
        exec.create(&uuid, RunKind::Job, &plan(), None).await.unwrap();
        assert_eq!(wait_done(&exec, &uuid).await.status, Status::Succeeded);

        let logs = exec.logs(&uuid, RunKind::Job, None).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.container.as_deref() == Some("polyaxon-main")));
        assert!(logs[0].value.starts_with("run --rm --name"));
    }

    #[tokio::test]
    async fn fallo_corta_la_secuencia() {
        let root = temp_dir("fail");
        let exec = DockerExecutor::with_binary(&root, "false");
        let uuid = Uuid::new_v4();
        exec.create(&uuid, RunKind::Job, &plan(), None).await.unwrap();
        let s = wait_done(&exec, &uuid).await;
        assert_eq!(s.status, Status::Failed);
        assert!(s.message.unwrap().contains("polyaxon-init-file-abc"));
    }

    #[tokio::test]
    async fn crear_dos_veces_es_conflicto_y_apply_no_se_soporta() {
        let root = temp_dir("conflict");
        let exec = DockerExecutor::with_binary(&root, "true");
        let uuid = Uuid::new_v4();
        exec.create(&uuid, RunKind::Job, &plan(), None).await.unwrap();
        assert!(matches!(
            exec.create(&uuid, RunKind::Job, &plan(), None).await,
            Err(ExecutorError::ResourceConflict(_))
        ));
        assert!(matches!(
            exec.apply(&uuid, RunKind::Job, &plan(), None).await,
            Err(ExecutorError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            exec.stop(&Uuid::new_v4(), RunKind::Job, None).await,
            Err(ExecutorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_antes_del_primer_contenedor_no_lanza_nada() {
        let root = temp_dir("stop_early");
        let exec = DockerExecutor::with_binary(&root, "true");
        let uuid = Uuid::new_v4();
        exec.create(&uuid, RunKind::Job, &plan(), None).await.unwrap();
        exec.stop(&uuid, RunKind::Job, None).await.unwrap();
        assert_eq!(exec.get(&uuid, RunKind::Job, None).await.unwrap().status, Status::Stopped);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(exec.get(&uuid, RunKind::Job, None).await.unwrap().status, Status::Stopped);
        let launched = std::fs::read_dir(exec.logs_dir(&uuid))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(launched, 0);
    }

    #[tokio::test]
    async fn stop_con_el_principal_corriendo_termina_detenida() {
        let root = temp_dir("stop_running");
        let exec = DockerExecutor::with_binary(&root, &slow_main_bin(&root));
        let uuid = Uuid::new_v4();
        exec.create(&uuid, RunKind::Job, &plan(), None).await.unwrap();
        let mut running = false;
        for _ in 0..250 {
            if exec.get(&uuid, RunKind::Job, None).await.unwrap().status == Status::Running {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(running, "el principal nunca arrancó");

        exec.stop(&uuid, RunKind::Job, None).await.unwrap();
        let s = wait_done(&exec, &uuid).await;
        assert_eq!(s.status, Status::Stopped);
        assert!(s.message.is_none());
    }
}
