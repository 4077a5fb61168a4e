use agent::client::HttpControlPlane;
use agent::config::{init_tracing, AgentContext};
use agent::executor::docker::DockerExecutor;
use agent::executor::k8s::K8sExecutor;
use agent::executor::{Executor, ExecutorError};
use agent::healthz::{self, Health};
use agent::reconcile::Agent;
use agent::retry::{Backoff, RetryPolicy};
use agent::sidecar::{run_sidecar, PodMainState, SidecarOptions};
use agent::store::store_from_env;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::reader::{read_as_operation, read_file};
use common::settings::{AgentSettings, ExecutorKind};
use common::SchemaError;
use compiler::{
    compile, to_docker_plan, to_k8s_resource, CompileOptions, CompilerError, ComponentLoader, ConverterContext,
    MemoryLoader, PathLoader, RunContext,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "plx-agent")]
#[command(about = "Agente que compila y ejecuta operaciones de Polyaxon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Arranca el loop de reconciliación
    Start {
        #[arg(long, default_value_t = 8000)]
        healthz_port: u16,
        /// Carpeta con componentes y presets referenciados por las operaciones
        #[arg(long)]
        components: Option<PathBuf>,
    },
    /// Consulta el endpoint de salud de un agente en marcha
    Healthz {
        #[arg(long, default_value = "http://localhost:8000")]
        url: String,
    },
    /// Sigue al contenedor principal y sincroniza artefactos
    Sidecar {
        #[arg(long, default_value = "polyaxon-main")]
        container_id: String,
        #[arg(long)]
        sleep_interval: Option<u64>,
        #[arg(long)]
        sync_interval: Option<u64>,
        #[arg(long)]
        monitor_logs: bool,
        #[arg(long)]
        monitor_spec: bool,
    },
    /// Compila una operación y muestra el recurso resultante
    Compile {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long)]
        uuid: Option<Uuid>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, value_enum, default_value_t = Backend::Kubernetes)]
        backend: Backend,
        #[arg(long)]
        components: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Kubernetes,
    Docker,
}

#[derive(Debug, Error)]
#[error("configuración inválida: {0}")]
struct ConfigError(String);

fn config_err(e: impl std::fmt::Display) -> anyhow::Error {
    ConfigError(e.to_string()).into()
}

/// 1 configuración, 2 esquema o kind no soportado, 3 cluster inalcanzable.
fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(c) = e.downcast_ref::<CompilerError>() {
        return if c.is_schema() { 2 } else { 1 };
    }
    if e.downcast_ref::<SchemaError>().is_some() {
        return 2;
    }
    match e.downcast_ref::<ExecutorError>() {
        Some(x) if x.is_transient() => 3,
        _ => 1,
    }
}

fn settings_from_env() -> Result<AgentSettings> {
    let settings = AgentSettings::from_env().map_err(config_err)?;
    settings.validate().map_err(config_err)?;
    Ok(settings)
}

fn loader(components: Option<PathBuf>) -> Arc<dyn ComponentLoader> {
    match components {
        Some(root) => Arc::new(PathLoader::new(root)),
        None => Arc::new(MemoryLoader::new()),
    }
}

/* --------- Subcomandos --------- */

async fn start(healthz_port: u16, components: Option<PathBuf>) -> Result<()> {
    let settings = settings_from_env()?;
    let host = settings.api_host.clone().ok_or_else(|| config_err("falta POLYAXON_HOST"))?;
    let owner = settings.owner.clone().ok_or_else(|| config_err("falta POLYAXON_OWNER"))?;
    let instance = settings
        .agent_instance
        .clone()
        .ok_or_else(|| config_err("falta POLYAXON_AGENT_INSTANCE"))?;
    let client = HttpControlPlane::new(
        &host,
        settings.auth_token.clone(),
        &owner,
        &instance,
        Duration::from_secs(settings.read_timeout),
    )
    .map_err(config_err)?;

    let executor: Arc<dyn Executor> = match settings.executor {
        ExecutorKind::Kubernetes => {
            let ns = settings
                .namespace
                .as_deref()
                .ok_or_else(|| config_err("falta POLYAXON_K8S_NAMESPACE"))?;
            Arc::new(
                K8sExecutor::connect(
                    ns,
                    Duration::from_secs(settings.read_timeout),
                    Duration::from_secs(settings.write_timeout),
                )
                .await?,
            )
        }
        ExecutorKind::Docker => Arc::new(DockerExecutor::new(&settings.artifacts_root)),
    };
    info!("agente {} con executor {:?}", instance, settings.executor);

    let ctx = AgentContext::new(settings);
    let health = Health::new();
    // Tres ciclos sin tick exitoso cuentan como agente caído.
    let grace = ctx.poll_interval() * 3;
    let server = health.clone();
    tokio::spawn(async move {
        if let Err(e) = healthz::serve(server, grace, healthz_port).await {
            error!("healthz no pudo arrancar: {}", e);
        }
    });

    let agent = Agent::new(ctx, Arc::new(client), executor, loader(components), health);
    agent.run().await?;
    Ok(())
}

async fn check_healthz(url: &str) -> Result<()> {
    let resp = reqwest::get(format!("{}/healthz", url.trim_end_matches('/'))).await?;
    if resp.status().is_success() {
        println!("ok");
        Ok(())
    } else {
        Err(anyhow!("agente sin ticks recientes ({})", resp.status()))
    }
}

async fn sidecar(
    container_id: String,
    sleep_interval: Option<u64>,
    sync_interval: Option<u64>,
    monitor_logs: bool,
    monitor_spec: bool,
) -> Result<()> {
    let settings = AgentSettings::from_env().map_err(config_err)?;
    let run_uuid = std::env::var("POLYAXON_RUN_UUID").map_err(|_| config_err("falta POLYAXON_RUN_UUID"))?;
    let store = store_from_env(|k| std::env::var(k).ok(), &run_uuid).map_err(config_err)?;
    let main = PodMainState::from_env(&container_id).await?;
    let opts = SidecarOptions {
        run_path: Path::new(&settings.artifacts_root).join(&run_uuid),
        sleep_interval: Duration::from_secs(sleep_interval.unwrap_or(settings.sidecar.sleep_interval).max(1)),
        sync_interval: Duration::from_secs(sync_interval.unwrap_or(settings.sidecar.sync_interval)),
        monitor_logs,
        monitor_spec,
        concurrency: settings.sync_concurrency,
        exclude: Vec::new(),
    };
    let retry = RetryPolicy::new(settings.max_retries, Backoff::Quadratic);
    let report = run_sidecar(&main, &store, &opts, &retry).await?;
    if !report.errors.is_empty() {
        warn!("sidecar terminó con {} errores de sincronización", report.errors.len());
    }
    Ok(())
}

async fn compile_file(
    file: &Path,
    uuid: Option<Uuid>,
    name: Option<String>,
    backend: Backend,
    components: Option<PathBuf>,
) -> Result<()> {
    let settings = AgentSettings::from_env().map_err(config_err)?;
    let content = read_file(file)?;
    let op = read_as_operation(&content)?;
    let run = RunContext {
        run_uuid: Some(uuid.unwrap_or_else(Uuid::new_v4)),
        run_name: name,
        namespace: settings.namespace.clone(),
        compiled_at: Some(chrono::Utc::now()),
        artifacts_root: Some(settings.artifacts_root.clone()),
        ..Default::default()
    };
    let opts = CompileOptions {
        run: run.clone(),
        connections: settings.connections_by_name(),
        artifacts_store: settings.artifacts_store.clone(),
        ..Default::default()
    };
    let compiled = compile(&op, loader(components).as_ref(), &opts)?;
    println!("{}", serde_yaml::to_string(&compiled)?);

    let ctx = ConverterContext::new(run, settings).with_proxy_env(|n| std::env::var(n).ok());
    let resource = match backend {
        Backend::Kubernetes => serde_json::to_string_pretty(&to_k8s_resource(&compiled, &ctx)?)?,
        Backend::Docker => serde_json::to_string_pretty(&to_docker_plan(&compiled, &ctx)?)?,
    };
    println!("{resource}");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Start {
            healthz_port,
            components,
        } => start(healthz_port, components).await,
        Commands::Healthz { url } => check_healthz(&url).await,
        Commands::Sidecar {
            container_id,
            sleep_interval,
            sync_interval,
            monitor_logs,
            monitor_spec,
        } => sidecar(container_id, sleep_interval, sync_interval, monitor_logs, monitor_spec).await,
        Commands::Compile {
            file,
            uuid,
            name,
            backend,
            components,
        } => compile_file(&file, uuid, name, backend, components).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    tokio::select! {
        res = run(cli) => match res {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(exit_code(&e))
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("interrumpido por el usuario");
            ExitCode::from(130)
        }
    }
}
