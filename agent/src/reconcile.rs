//! Loop de reconciliación del agente.
//!
//! Cada tick pide el estado al plano de control y despacha cada bucket al
//! executor: `stopping` → stop, `deleting`/`delete` → clean + stop,
//! `queued` → create, `apply` → apply, `checking` → get.

use chrono::Utc;
use common::reader::{document_kind, parse_document, read_as_operation, read_compiled_operation, DocumentKind};
use common::settings::{AgentSettings, ExecutorKind};
use common::{CompiledOperation, RunPayload, Status, StatusCondition};
use compiler::{
    compile, to_docker_plan, to_k8s_resource, CompileOptions, CompilerError, CompilerResult, ComponentLoader,
    ConverterContext, RunContext,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, ControlPlane, RunRef};
use crate::config::AgentContext;
use crate::executor::{Executor, ExecutorError, ExecutorResult, Resource, ResourceStatus};
use crate::healthz::Health;
use crate::retry::{Backoff, RetryPolicy};

/// Contadores de un tick, para logs y tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub created: usize,
    pub applied: usize,
    pub stopped: usize,
    pub deleted: usize,
    pub checked: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Submit {
    Create,
    Apply,
}

fn run_ref(p: &RunPayload) -> RunRef {
    RunRef {
        owner: p.owner.clone(),
        project: p.project.clone(),
        uuid: p.uuid,
    }
}

pub struct Agent {
    ctx: AgentContext,
    client: Arc<dyn ControlPlane>,
    executor: Arc<dyn Executor>,
    loader: Arc<dyn ComponentLoader>,
    health: Health,
    retry: RetryPolicy,
}

impl Agent {
    pub fn new(
        ctx: AgentContext,
        client: Arc<dyn ControlPlane>,
        executor: Arc<dyn Executor>,
        loader: Arc<dyn ComponentLoader>,
        health: Health,
    ) -> Self {
        let retry = RetryPolicy::new(ctx.snapshot().max_retries, Backoff::Linear);
        Agent {
            ctx,
            client,
            executor,
            loader,
            health,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn sync_catalog(&self) -> Result<(), ClientError> {
        match self.client.get_catalog().await {
            Ok(catalog) => {
                self.ctx.apply_catalog(catalog);
                Ok(())
            }
            Err(e) if e.is_unauthorized() => Err(e),
            Err(e) => {
                warn!("no se pudo leer el catálogo: {}", e);
                Ok(())
            }
        }
    }

    /// Registro inicial: credenciales, catálogo y primer estado.
    pub async fn enter(&self) -> Result<(), ClientError> {
        let record = self.client.get_agent().await?;
        info!("agente {} registrado", record.uuid.simple());
        self.sync_catalog().await?;
        self.client
            .report_agent_status(StatusCondition::new(Status::Running, "AgentStarted", "agente en marcha"))
            .await?;
        Ok(())
    }

    /// Loop principal; sólo termina ante credenciales rechazadas.
    pub async fn run(&self) -> Result<(), ClientError> {
        self.enter().await?;
        loop {
            match self.tick().await {
                Ok(report) => debug!("tick: {:?}", report),
                Err(e) if e.is_unauthorized() => return Err(e),
                Err(e) => warn!("tick fallido: {}", e),
            }
            sleep(self.ctx.poll_interval()).await;
        }
    }

    pub async fn tick(&self) -> Result<TickReport, ClientError> {
        self.sync_catalog().await?;
        let response = self.client.get_state().await?;
        let state = response.state;
        let settings = self.ctx.snapshot();
        let mut report = TickReport::default();

        let halted: BTreeSet<Uuid> = state
            .stopping
            .iter()
            .chain(&state.deleting)
            .chain(&state.delete)
            .map(|p| p.uuid)
            .collect();

        for p in &state.stopping {
            self.stop(p, &mut report).await;
        }
        for p in state.deleting.iter().chain(&state.delete) {
            self.delete(p, &mut report).await;
        }

        let cap = settings.executor_concurrency.max(1);
        let mut dispatched = 0;
        let pending = state
            .queued
            .iter()
            .map(|p| (p, Submit::Create))
            .chain(state.apply.iter().map(|p| (p, Submit::Apply)));
        for (p, mode) in pending {
            if halted.contains(&p.uuid) {
                debug!("run {} detenida en este tick, no se despacha", p.uuid.simple());
                report.skipped += 1;
                continue;
            }
            if dispatched >= cap {
                report.deferred += 1;
                continue;
            }
            dispatched += 1;
            self.submit(p, mode, &settings, &mut report).await;
        }

        for p in &state.checking {
            self.check(p, &settings, &mut report).await;
        }

        self.health.touch();
        if report.deferred > 0 {
            info!("{} operaciones quedan para el próximo tick", report.deferred);
        }
        Ok(report)
    }

    /* --------- Compilación --------- */

    fn run_context(p: &RunPayload, settings: &AgentSettings) -> RunContext {
        RunContext {
            owner: Some(p.owner.clone()),
            project: Some(p.project.clone()),
            run_uuid: Some(p.uuid),
            run_name: Some(p.name.clone()),
            namespace: p.namespace.clone().or_else(|| settings.namespace.clone()),
            iteration: None,
            created_at: p.created_at,
            compiled_at: Some(Utc::now()),
            schedule_at: None,
            artifacts_root: Some(settings.artifacts_root.clone()),
        }
    }

    /// Lee el contenido de la run; una operación sin compilar se compila aquí.
    fn compiled_of(&self, p: &RunPayload, settings: &AgentSettings) -> CompilerResult<CompiledOperation> {
        let content = p
            .content
            .as_deref()
            .ok_or_else(|| CompilerError::validation("content", "la run no trae contenido"))?;
        let value = parse_document(content)?;
        if document_kind(&value)? == DocumentKind::CompiledOperation {
            return Ok(read_compiled_operation(content)?);
        }
        let op = read_as_operation(content)?;
        let opts = CompileOptions {
            run: Self::run_context(p, settings),
            connections: settings.connections_by_name(),
            artifacts_store: settings.artifacts_store.clone(),
            ..Default::default()
        };
        compile(&op, self.loader.as_ref(), &opts)
    }

    fn prepare(&self, p: &RunPayload, settings: &AgentSettings) -> CompilerResult<(CompiledOperation, Resource)> {
        let compiled = self.compiled_of(p, settings)?;
        let ctx = ConverterContext::new(Self::run_context(p, settings), settings.clone())
            .with_proxy_env(|name| std::env::var(name).ok());
        let resource = match self.executor.kind() {
            ExecutorKind::Kubernetes => Resource::Kubernetes(to_k8s_resource(&compiled, &ctx)?),
            ExecutorKind::Docker => Resource::Docker(to_docker_plan(&compiled, &ctx)?),
        };
        Ok((compiled, resource))
    }

    /* --------- Despacho --------- */

    async fn with_retries<T, F, Fut>(&self, what: &str, op: F) -> ExecutorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ExecutorResult<T>>,
    {
        let executor = self.executor.clone();
        self.retry
            .run(
                what,
                ExecutorError::is_transient,
                move || {
                    let executor = executor.clone();
                    async move {
                        if let Err(e) = executor.refresh().await {
                            warn!("no se pudo reiniciar el cliente del backend: {}", e);
                        }
                    }
                },
                op,
            )
            .await
    }

    async fn report(&self, p: &RunPayload, condition: StatusCondition) {
        if let Err(e) = self.client.report_run_status(&run_ref(p), condition).await {
            warn!("no se pudo reportar el estado de {}: {}", p.uuid.simple(), e);
        }
    }

    async fn submit(&self, p: &RunPayload, mode: Submit, settings: &AgentSettings, report: &mut TickReport) {
        let (compiled, resource) = match self.prepare(p, settings) {
            Ok(r) => r,
            Err(e) => {
                warn!("run {} no compila: {}", p.uuid.simple(), e);
                report.failed += 1;
                self.report(p, StatusCondition::failed(e.reason(), e.to_string())).await;
                return;
            }
        };
        let kind = compiled.run_kind();
        let ns = p.namespace.as_deref();
        let exec = &self.executor;

        let mut result = match mode {
            Submit::Create => {
                self.with_retries("create", || exec.create(&p.uuid, kind, &resource, ns))
                    .await
            }
            Submit::Apply => Err(ExecutorError::ResourceConflict(p.uuid.simple().to_string())),
        };
        if let Err(ExecutorError::ResourceConflict(_)) = result {
            debug!("run {}: el recurso existe, se aplica", p.uuid.simple());
            result = self
                .with_retries("apply", || exec.apply(&p.uuid, kind, &resource, ns))
                .await;
            if result.is_ok() {
                report.applied += 1;
            }
        } else if result.is_ok() {
            report.created += 1;
        }

        match result {
            Ok(status) => {
                info!("run {} despachada ({})", p.uuid.simple(), status.name);
                self.report(
                    p,
                    StatusCondition::new(Status::Scheduled, "AgentScheduled", format!("recurso {} enviado", status.name)),
                )
                .await;
            }
            Err(e) => {
                warn!("run {}: {}", p.uuid.simple(), e);
                report.failed += 1;
                self.report(p, StatusCondition::failed(e.reason(), e.to_string())).await;
            }
        }
    }

    async fn stop(&self, p: &RunPayload, report: &mut TickReport) {
        let exec = &self.executor;
        let ns = p.namespace.as_deref();
        match self.with_retries("stop", || exec.stop(&p.uuid, p.kind, ns)).await {
            Ok(()) | Err(ExecutorError::NotFound(_)) => {
                report.stopped += 1;
                self.report(p, StatusCondition::new(Status::Stopped, "AgentStopped", "run detenida"))
                    .await;
            }
            Err(e) => warn!("no se pudo detener {}: {}", p.uuid.simple(), e),
        }
    }

    async fn delete(&self, p: &RunPayload, report: &mut TickReport) {
        let exec = &self.executor;
        let ns = p.namespace.as_deref();
        let cleaned = self.with_retries("clean", || exec.clean(&p.uuid, p.kind, ns)).await;
        let stopped = self.with_retries("stop", || exec.stop(&p.uuid, p.kind, ns)).await;
        let failure = [cleaned, stopped]
            .into_iter()
            .filter_map(Result::err)
            .find(|e| !matches!(e, ExecutorError::NotFound(_)));
        match failure {
            None => report.deleted += 1,
            Some(e) => warn!("no se pudo borrar {}: {}", p.uuid.simple(), e),
        }
    }

    async fn check(&self, p: &RunPayload, settings: &AgentSettings, report: &mut TickReport) {
        let exec = &self.executor;
        let ns = p.namespace.as_deref();
        let status: ResourceStatus = match self.with_retries("get", || exec.get(&p.uuid, p.kind, ns)).await {
            Ok(s) => s,
            Err(ExecutorError::NotFound(_)) => {
                debug!("run {} sin recurso en el backend", p.uuid.simple());
                return;
            }
            Err(e) => {
                warn!("no se pudo consultar {}: {}", p.uuid.simple(), e);
                return;
            }
        };
        report.checked += 1;
        let message = status.message.clone().unwrap_or_default();
        self.report(p, StatusCondition::new(status.status, "AgentCheck", message)).await;

        if !status.status.is_done() {
            return;
        }
        let collect_logs = self
            .compiled_of(p, settings)
            .map(|c| c.plugins().collect_logs())
            .unwrap_or(true);
        if collect_logs {
            match exec.logs(&p.uuid, p.kind, ns).await {
                Ok(logs) => {
                    if let Err(e) = self.client.upload_logs(&run_ref(p), logs).await {
                        warn!("no se pudieron subir los logs de {}: {}", p.uuid.simple(), e);
                    }
                }
                Err(e) => warn!("no se pudieron leer los logs de {}: {}", p.uuid.simple(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Catalog;
    use crate::executor::ResourceStatus;
    use async_trait::async_trait;
    use common::{AgentRecord, AgentState, AgentStateResponse, LogLine, RunKind};
    use compiler::MemoryLoader;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /* --------- Stubs --------- */

    #[derive(Default)]
    struct StubPlane {
        state: Mutex<AgentState>,
        statuses: Mutex<Vec<(Uuid, StatusCondition)>>,
        uploaded: Mutex<usize>,
        unauthorized: bool,
    }

    #[async_trait]
    impl ControlPlane for StubPlane {
        async fn get_agent(&self) -> Result<AgentRecord, ClientError> {
            if self.unauthorized {
                return Err(ClientError::Unauthorized(reqwest::StatusCode::UNAUTHORIZED));
            }
            Ok(AgentRecord {
                uuid: Uuid::new_v4(),
                name: Some("agent".into()),
                namespace: None,
                status: None,
            })
        }
        async fn get_catalog(&self) -> Result<Catalog, ClientError> {
            Ok(Catalog::default())
        }
        async fn get_state(&self) -> Result<AgentStateResponse, ClientError> {
            Ok(AgentStateResponse {
                state: self.state.lock().unwrap().clone(),
                ..Default::default()
            })
        }
        async fn report_agent_status(&self, _c: StatusCondition) -> Result<(), ClientError> {
            Ok(())
        }
        async fn report_run_status(&self, run: &RunRef, c: StatusCondition) -> Result<(), ClientError> {
            self.statuses.lock().unwrap().push((run.uuid, c));
            Ok(())
        }
        async fn upload_logs(&self, _run: &RunRef, logs: Vec<LogLine>) -> Result<(), ClientError> {
            *self.uploaded.lock().unwrap() += logs.len();
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubExecutor {
        calls: Mutex<Vec<String>>,
        conflict: bool,
        transient_failures: AtomicU32,
        refreshes: AtomicU32,
        status: Option<Status>,
    }

    impl StubExecutor {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn ok(uuid: &Uuid, kind: RunKind, status: Status) -> ResourceStatus {
            ResourceStatus {
                name: format!("plx-operation-{}", uuid.simple()),
                run_uuid: *uuid,
                kind,
                status,
                message: None,
            }
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::Kubernetes
        }
        async fn create(&self, u: &Uuid, k: RunKind, r: &Resource, _ns: Option<&str>) -> ExecutorResult<ResourceStatus> {
            self.record(format!("create {k}"));
            assert!(matches!(r, Resource::Kubernetes(_)));
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecutorError::ClusterUnavailable("conexión rechazada".into()));
            }
            if self.conflict {
                return Err(ExecutorError::ResourceConflict(u.simple().to_string()));
            }
            Ok(Self::ok(u, k, Status::Scheduled))
        }
        async fn apply(&self, u: &Uuid, k: RunKind, _r: &Resource, _ns: Option<&str>) -> ExecutorResult<ResourceStatus> {
            self.record(format!("apply {k}"));
            Ok(Self::ok(u, k, Status::Scheduled))
        }
        async fn stop(&self, _u: &Uuid, k: RunKind, _ns: Option<&str>) -> ExecutorResult<()> {
            self.record(format!("stop {k}"));
            Err(ExecutorError::NotFound("ya no existe".into()))
        }
        async fn clean(&self, _u: &Uuid, k: RunKind, _ns: Option<&str>) -> ExecutorResult<()> {
            self.record(format!("clean {k}"));
            Ok(())
        }
        async fn get(&self, u: &Uuid, k: RunKind, _ns: Option<&str>) -> ExecutorResult<ResourceStatus> {
            self.record(format!("get {k}"));
            Ok(Self::ok(u, k, self.status.unwrap_or(Status::Running)))
        }
        async fn list_ops(&self, _ns: Option<&str>) -> ExecutorResult<Vec<ResourceStatus>> {
            Ok(Vec::new())
        }
        async fn logs(&self, _u: &Uuid, _k: RunKind, _ns: Option<&str>) -> ExecutorResult<Vec<LogLine>> {
            Ok(vec![LogLine {
                timestamp: Utc::now(),
                node: None,
                pod: None,
                container: Some("polyaxon-main".into()),
                value: "listo".into(),
            }])
        }
        async fn refresh(&self) -> ExecutorResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const S1: &str = r#"
version: 1.1
kind: operation
params:
  image: {value: "a/b:1"}
component:
  inputs: [{name: image, type: str}]
  run:
    kind: job
    container: {image: "{{ image }}"}
"#;

    fn payload(content: &str) -> RunPayload {
        RunPayload {
            uuid: Uuid::new_v4(),
            name: "train".into(),
            kind: RunKind::Job,
            owner: "acme".into(),
            project: "mnist".into(),
            namespace: Some("polyaxon".into()),
            content: Some(content.into()),
            created_at: None,
        }
    }

    fn agent(plane: Arc<StubPlane>, exec: Arc<StubExecutor>, settings: AgentSettings) -> Agent {
        Agent::new(
            AgentContext::new(settings),
            plane,
            exec,
            Arc::new(MemoryLoader::default()),
            Health::new(),
        )
        .with_retry(RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Linear,
            unit: Duration::ZERO,
        })
    }

    /* --------- Escenarios --------- */

    #[tokio::test]
    async fn run_en_cola_genera_un_create_y_un_estado() {
        let plane = Arc::new(StubPlane::default());
        let p = payload(S1);
        plane.state.lock().unwrap().queued = vec![p.clone()];
        let exec = Arc::new(StubExecutor::default());
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(exec.calls(), vec!["create job"]);
        let statuses = plane.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, p.uuid);
        assert_eq!(statuses[0].1.kind, Status::Scheduled);
        assert!(agent.health.pong(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn conflicto_se_convierte_en_apply() {
        let plane = Arc::new(StubPlane::default());
        plane.state.lock().unwrap().queued = vec![payload(S1)];
        let exec = Arc::new(StubExecutor {
            conflict: true,
            ..Default::default()
        });
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(exec.calls(), vec!["create job", "apply job"]);
        assert_eq!(plane.statuses.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn errores_transitorios_se_reintentan_reiniciando_el_cliente() {
        let plane = Arc::new(StubPlane::default());
        plane.state.lock().unwrap().queued = vec![payload(S1)];
        let exec = Arc::new(StubExecutor {
            transient_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(exec.calls().len(), 3);
        assert_eq!(exec.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn operacion_invalida_se_reporta_como_fallida() {
        let plane = Arc::new(StubPlane::default());
        let bad = S1.replace("type: str", "type: int");
        plane.state.lock().unwrap().queued = vec![payload(&bad)];
        let exec = Arc::new(StubExecutor::default());
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(exec.calls().is_empty());
        let statuses = plane.statuses.lock().unwrap();
        assert_eq!(statuses[0].1.kind, Status::Failed);
        assert_eq!(statuses[0].1.reason.as_deref(), Some("SchemaValidation"));
    }

    #[tokio::test]
    async fn stopping_corta_el_create_del_mismo_tick() {
        let plane = Arc::new(StubPlane::default());
        let p = payload(S1);
        {
            let mut state = plane.state.lock().unwrap();
            state.queued = vec![p.clone()];
            state.stopping = vec![p.clone()];
        }
        let exec = Arc::new(StubExecutor::default());
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.stopped, 1);
        assert_eq!(exec.calls(), vec!["stop job"]);
        assert_eq!(plane.statuses.lock().unwrap()[0].1.kind, Status::Stopped);
    }

    #[tokio::test]
    async fn backpressure_deja_el_resto_para_el_proximo_tick() {
        let plane = Arc::new(StubPlane::default());
        plane.state.lock().unwrap().queued = (0..3).map(|_| payload(S1)).collect();
        let exec = Arc::new(StubExecutor::default());
        let settings = AgentSettings {
            executor_concurrency: 2,
            ..Default::default()
        };
        let agent = agent(plane.clone(), exec.clone(), settings);

        let report = agent.tick().await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn deleting_limpia_y_detiene() {
        let plane = Arc::new(StubPlane::default());
        plane.state.lock().unwrap().deleting = vec![payload(S1)];
        let exec = Arc::new(StubExecutor::default());
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(exec.calls(), vec!["clean job", "stop job"]);
    }

    #[tokio::test]
    async fn checking_reporta_estado_y_sube_logs_al_terminar() {
        let plane = Arc::new(StubPlane::default());
        plane.state.lock().unwrap().checking = vec![payload(S1)];
        let exec = Arc::new(StubExecutor {
            status: Some(Status::Succeeded),
            ..Default::default()
        });
        let agent = agent(plane.clone(), exec.clone(), AgentSettings::default());

        let report = agent.tick().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(plane.statuses.lock().unwrap()[0].1.kind, Status::Succeeded);
        assert_eq!(*plane.uploaded.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn credenciales_rechazadas_cortan_el_arranque() {
        let plane = Arc::new(StubPlane {
            unauthorized: true,
            ..Default::default()
        });
        let agent = agent(plane, Arc::new(StubExecutor::default()), AgentSettings::default());
        assert!(agent.enter().await.unwrap_err().is_unauthorized());
    }
}
