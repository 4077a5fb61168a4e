//! Fábricas de init containers: auth, git, dockerfile, file, tensorboard,
//! artifacts y contenedores de usuario.

use common::connections::{Connection, ConnectionSchema};
use common::init::{ArtifactsType, CopyStep, DockerfileType, FileType, GitType, Init, InitKind, TensorboardType};
use common::k8s::{Container, Volume};
use common::names;
use serde_json::{json, Value};

use super::{
    agent_env, apply_defaults, connection_parts, context_mount, merge_env, merge_env_from,
    merge_mounts, ConnectionParts, CONTEXT_MOUNT_ARTIFACTS, CONTEXT_MOUNT_AUTH, INIT_PREFIX,
};
use crate::converters::ConverterContext;
use crate::error::{CompilerError, CompilerResult};
use crate::template::Renderer;

const DEFAULT_WORKDIR: &str = "/code";
const DEFAULT_TENSORBOARD_PORT: u16 = 6006;

const DOCKERFILE_TEMPLATE: &str = r#"FROM {{ image }}
{% if lang_env %}
ENV LC_ALL {{ lang_env }}
ENV LANG {{ lang_env }}
ENV LANGUAGE {{ lang_env }}
{% endif %}
{% if uid and gid %}
RUN groupadd -g {{ gid }} -r {{ username }} && useradd -r -m -g {{ gid }} -u {{ uid }} {{ username }}
{% endif %}
{% for e in env %}
ENV {{ e.0 }} {{ e.1 }}
{% endfor %}
{% for p in path %}
ENV PATH="${PATH}:{{ p }}"
{% endfor %}
WORKDIR {{ workdir }}
{% for c in copy %}
COPY {{ c }}
{% endfor %}
{% for r in run %}
RUN {{ r }}
{% endfor %}
{% for c in post_run_copy %}
COPY {{ c }}
{% endfor %}
{% if uid and gid %}
USER {{ username }}
{% endif %}
{% if shell %}
SHELL ["{{ shell }}"]
{% endif %}
"#;

fn init_name(ctx: &ConverterContext, role: &str, kind: &str, idx: usize) -> String {
    let uuid = ctx.run.uuid_str().unwrap_or_default();
    names::container_name(
        &format!("{INIT_PREFIX}-{kind}"),
        &format!("{uuid}/{role}/{kind}/{idx}"),
    )
}

fn base_container(ctx: &ConverterContext, name: String) -> Container {
    Container {
        name: Some(name),
        image: Some(ctx.settings.init.image.clone()),
        image_pull_policy: ctx.settings.init.image_pull_policy.clone(),
        ..Default::default()
    }
}

/// Completa env, mounts y defaults de un init con lo que aportan sus conexiones.
fn finish(
    ctx: &ConverterContext,
    mut container: Container,
    parts: ConnectionParts,
    auth: bool,
) -> CompilerResult<(Container, Vec<Volume>)> {
    container.env = Some(merge_env(vec![
        container.env.take().unwrap_or_default(),
        parts.env,
        agent_env(ctx, auth),
    ]))
    .filter(|e| !e.is_empty());
    let env_from = merge_env_from(vec![container.env_from.take().unwrap_or_default(), parts.env_from]);
    container.env_from = Some(env_from).filter(|e| !e.is_empty());
    container.volume_mounts = Some(merge_mounts(vec![
        container.volume_mounts.take().unwrap_or_default(),
        vec![context_mount()],
        parts.mounts,
    ])?);
    apply_defaults(&mut container, true);
    Ok((container, parts.volumes))
}

/// Ruta de destino dentro del contexto: absoluta tal cual, relativa bajo artifacts.
fn destination(path: Option<&str>, default: &str) -> String {
    match path {
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("{CONTEXT_MOUNT_ARTIFACTS}/{}", p.trim_matches('/')),
        None if default.is_empty() => CONTEXT_MOUNT_ARTIFACTS.to_string(),
        None => format!("{CONTEXT_MOUNT_ARTIFACTS}/{default}"),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Script que deja `content` en `<dir>/<filename>`.
fn write_file_script(dir: &str, filename: &str, content: &str, chmod: Option<&str>) -> String {
    let target = format!("{}/{}", dir.trim_end_matches('/'), filename);
    let mut script = format!(
        "mkdir -p {} && printf '%s' {} > {}",
        shell_quote(dir),
        shell_quote(content),
        shell_quote(&target)
    );
    if let Some(mode) = chmod {
        script.push_str(&format!(" && chmod {} {}", shell_quote(mode), shell_quote(&target)));
    }
    script
}

/* --------- Fábricas --------- */

pub fn auth_init(ctx: &ConverterContext, role: &str) -> CompilerResult<(Container, Vec<Volume>)> {
    let mut c = base_container(ctx, init_name(ctx, role, "auth", 0));
    c.command = Some(vec!["polyaxon".into(), "initializer".into(), "auth".into()]);
    c.args = Some(vec![format!("--path={CONTEXT_MOUNT_AUTH}")]);
    finish(ctx, c, ConnectionParts::default(), true)
}

pub fn git_init(
    ctx: &ConverterContext,
    git: &GitType,
    conn: Option<&Connection>,
    path: Option<&str>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let conn_git = match conn.map(Connection::schema).transpose()?.flatten() {
        Some(ConnectionSchema::Git(g)) => Some(g),
        _ => None,
    };
    let url = git
        .url
        .clone()
        .or_else(|| conn_git.as_ref().and_then(|g| g.url.clone()))
        .ok_or_else(|| CompilerError::validation("init.git", "no hay url de repositorio"))?;
    let revision = git
        .revision
        .clone()
        .or_else(|| conn_git.as_ref().and_then(|g| g.revision.clone()));
    let mut flags: Vec<String> = conn_git
        .as_ref()
        .and_then(|g| g.flags.clone())
        .unwrap_or_default();
    flags.extend(git.flags.iter().flatten().cloned());

    let effective = GitType {
        url: Some(url.clone()),
        ..Default::default()
    };
    let repo = effective
        .repo_name()
        .or_else(|| conn.map(|c| c.name.clone()))
        .unwrap_or_else(|| "repo".to_string());

    let mut args = vec![
        format!("--repo-path={}", destination(path, &repo)),
        format!("--url={url}"),
    ];
    if let Some(r) = revision {
        args.push(format!("--revision={r}"));
    }
    if !flags.is_empty() {
        args.push(format!("--flags={}", Value::from(flags)));
    }

    let mut c = base_container(ctx, init_name(ctx, role, "git", idx));
    c.command = Some(vec!["polyaxon".into(), "initializer".into(), "git".into()]);
    c.args = Some(args);
    let parts = conn.map(connection_parts).unwrap_or_default();
    finish(ctx, c, parts, false)
}

fn copy_line(step: &CopyStep, workdir: &str) -> String {
    match step {
        CopyStep::Path(p) => format!("{p} {workdir}"),
        CopyStep::Pair(pair) => pair.join(" "),
    }
}

/// Contenido del Dockerfile.
pub fn render_dockerfile(d: &DockerfileType) -> CompilerResult<String> {
    let workdir = d.workdir.clone().unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
    let env: Vec<Value> = d
        .env
        .iter()
        .flatten()
        .map(|(k, v)| json!([k, v]))
        .collect();
    let copy: Vec<String> = d.copy.iter().flatten().map(|s| copy_line(s, &workdir)).collect();
    let post_run_copy: Vec<String> = d
        .post_run_copy
        .iter()
        .flatten()
        .map(|s| copy_line(s, &workdir))
        .collect();
    let context = json!({
        "image": d.image,
        "lang_env": d.lang_env,
        "uid": d.uid,
        "gid": d.gid,
        "username": d.username.clone().unwrap_or_else(|| "polyaxon".to_string()),
        "env": env,
        "path": d.path.clone().unwrap_or_default(),
        "workdir": workdir,
        "copy": copy,
        "run": d.run.clone().unwrap_or_default(),
        "post_run_copy": post_run_copy,
        "shell": d.shell,
    });
    let rendered = Renderer::new(&context)?.render_str(DOCKERFILE_TEMPLATE)?;
    let lines: Vec<&str> = rendered.lines().filter(|l| !l.trim().is_empty()).collect();
    Ok(format!("{}\n", lines.join("\n")))
}

pub fn dockerfile_init(
    ctx: &ConverterContext,
    d: &DockerfileType,
    path: Option<&str>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let content = render_dockerfile(d)?;
    let dir = destination(path.or(d.workdir_path.as_deref()), "build");
    let mut c = base_container(ctx, init_name(ctx, role, "dockerfile", idx));
    c.command = Some(vec!["/bin/sh".into(), "-c".into()]);
    c.args = Some(vec![write_file_script(&dir, d.filename(), &content, None)]);
    finish(ctx, c, ConnectionParts::default(), false)
}

pub fn file_init(
    ctx: &ConverterContext,
    f: &FileType,
    path: Option<&str>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let dir = destination(path, "");
    let mut c = base_container(ctx, init_name(ctx, role, "file", idx));
    c.command = Some(vec!["/bin/sh".into(), "-c".into()]);
    c.args = Some(vec![write_file_script(&dir, f.filename(), &f.content, f.chmod.as_deref())]);
    finish(ctx, c, ConnectionParts::default(), false)
}

/// Script `start_tensorboard` que queda junto a los logs hidratados.
pub fn tensorboard_script(tb: &TensorboardType, logdir: &str) -> String {
    let mut script = String::from("#!/bin/sh\n");
    if let Some(plugins) = tb.plugins.as_ref().filter(|p| !p.is_empty()) {
        script.push_str(&format!("pip install --no-cache-dir {}\n", plugins.join(" ")));
    }
    script.push_str(&format!(
        "tensorboard --logdir={logdir} --port={} --host=0.0.0.0",
        tb.port.unwrap_or(DEFAULT_TENSORBOARD_PORT)
    ));
    if let Some(prefix) = &tb.path_prefix {
        script.push_str(&format!(" --path_prefix={prefix}"));
    }
    script.push('\n');
    script
}

pub fn tensorboard_init(
    ctx: &ConverterContext,
    tb: &TensorboardType,
    conn: Option<&Connection>,
    path: Option<&str>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let dest = destination(path, "tensorboard");
    let store = conn
        .or(ctx.settings.artifacts_store.as_ref())
        .and_then(Connection::store_path)
        .unwrap_or_default();
    let mut cmd = format!(
        "polyaxon initializer tensorboard --context-from={} --context-to={} --uuids={}",
        shell_quote(&store),
        shell_quote(&dest),
        shell_quote(&tb.uuids.clone().unwrap_or_default().join(","))
    );
    if tb.use_names.unwrap_or(false) {
        cmd.push_str(" --use-names");
    }
    let script = write_file_script(&dest, "start_tensorboard", &tensorboard_script(tb, &dest), Some("+x"));

    let mut c = base_container(ctx, init_name(ctx, role, "tb", idx));
    c.command = Some(vec!["/bin/sh".into(), "-c".into()]);
    c.args = Some(vec![format!("{cmd} && {script}")]);
    let mut parts = conn.map(connection_parts).unwrap_or_default();
    if conn.is_none() {
        parts.extend(super::artifacts_store_parts(ctx));
    }
    finish(ctx, c, parts, true)
}

/// Descarga desde el store de una conexión: archivos, dirs, paths o la conexión completa.
pub fn artifacts_init(
    ctx: &ConverterContext,
    artifacts: Option<&ArtifactsType>,
    paths: Option<&[String]>,
    conn: &Connection,
    path: Option<&str>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let mut args = vec![
        format!("--connection-name={}", conn.name),
        format!("--connection-kind={}", conn.kind),
    ];
    if let Some(store) = conn.store_path() {
        args.push(format!("--path-from={store}"));
    }
    args.push(format!("--path-to={}", destination(path, "")));
    if let Some(a) = artifacts {
        if let Some(files) = a.files.as_ref().filter(|f| !f.is_empty()) {
            args.push(format!("--files={}", Value::from(files.clone())));
        }
        if let Some(dirs) = a.dirs.as_ref().filter(|d| !d.is_empty()) {
            args.push(format!("--dirs={}", Value::from(dirs.clone())));
        }
        if let Some(w) = a.workers {
            args.push(format!("--workers={w}"));
        }
    }
    if let Some(p) = paths.filter(|p| !p.is_empty()) {
        args.push(format!("--paths={}", Value::from(p.to_vec())));
    }

    let mut c = base_container(ctx, init_name(ctx, role, "artifacts", idx));
    c.command = Some(vec!["polyaxon".into(), "initializer".into(), "artifacts".into()]);
    c.args = Some(args);
    finish(ctx, c, connection_parts(conn), false)
}

pub fn custom_init(
    ctx: &ConverterContext,
    container: &Container,
    conn: Option<&Connection>,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let mut c = container.clone();
    // El nombre del usuario es sólo el prefijo; el sufijo evita choques entre inits.
    let name = match &c.name {
        Some(n) => names::container_name(
            n,
            &format!("{}/{role}/custom/{idx}/{n}", ctx.run.uuid_str().unwrap_or_default()),
        ),
        None => init_name(ctx, role, "custom", idx),
    };
    c.name = Some(name);
    if c.image.is_none() {
        c.image = Some(ctx.settings.init.image.clone());
    }
    finish(ctx, c, conn.map(connection_parts).unwrap_or_default(), false)
}

/// Despacha un `Init` a su fábrica.
pub fn init_container(
    ctx: &ConverterContext,
    init: &Init,
    role: &str,
    idx: usize,
) -> CompilerResult<(Container, Vec<Volume>)> {
    let conn = init.connection.as_deref().map(|n| ctx.connection(n)).transpose()?;
    let path = init.path.as_deref();
    match init.kind()? {
        InitKind::Auth => auth_init(ctx, role),
        InitKind::Git => git_init(ctx, init.git.as_ref().unwrap_or(&GitType::default()), conn, path, role, idx),
        InitKind::Dockerfile => match &init.dockerfile {
            Some(d) => dockerfile_init(ctx, d, path, role, idx),
            None => Err(CompilerError::validation("init.dockerfile", "vacío")),
        },
        InitKind::File => match &init.file {
            Some(f) => file_init(ctx, f, path, role, idx),
            None => Err(CompilerError::validation("init.file", "vacío")),
        },
        InitKind::Tensorboard => match &init.tensorboard {
            Some(tb) => tensorboard_init(ctx, tb, conn, path, role, idx),
            None => Err(CompilerError::validation("init.tensorboard", "vacío")),
        },
        InitKind::Artifacts | InitKind::Paths | InitKind::Connection => {
            let conn = conn
                .or(ctx.settings.artifacts_store.as_ref())
                .ok_or_else(|| CompilerError::validation("init.connection", "no hay conexión ni artifacts store"))?;
            if conn.is_git() && init.artifacts.is_none() && init.paths.is_none() {
                return git_init(ctx, &GitType::default(), Some(conn), path, role, idx);
            }
            artifacts_init(ctx, init.artifacts.as_ref(), init.paths.as_deref(), conn, path, role, idx)
        }
        InitKind::Container => match &init.container {
            Some(c) => custom_init(ctx, c, conn, role, idx),
            None => Err(CompilerError::validation("init.container", "vacío")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::RunContext;
    use common::settings::AgentSettings;
    use uuid::Uuid;

    fn ctx_with(conns: serde_json::Value) -> ConverterContext {
        let settings = AgentSettings {
            connections: serde_json::from_value(conns).unwrap(),
            ..Default::default()
        };
        let run = RunContext {
            run_uuid: Some(Uuid::parse_str("6b1e1e6e-62a8-4a4b-9b1e-6d3d2b8f0c11").unwrap()),
            ..Default::default()
        };
        ConverterContext::new(run, settings)
    }

    fn init(v: serde_json::Value) -> Init {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn git_con_conexion_y_revision() {
        let ctx = ctx_with(json!([{
            "name": "git1",
            "kind": "git",
            "schema": {"url": "https://github.com/acme/repo.git"},
            "secret": {"name": "git-creds"}
        }]));
        let (c, _) = init_container(&ctx, &init(json!({"connection": "git1", "git": {"revision": "branchA"}})), "main", 0).unwrap();
        let name = c.name.clone().unwrap();
        assert!(name.starts_with("polyaxon-init-git-"));
        assert!(names::is_dns_label(&name));
        let args = c.args.unwrap();
        assert!(args.contains(&"--revision=branchA".to_string()));
        assert!(args.contains(&format!("--repo-path={CONTEXT_MOUNT_ARTIFACTS}/repo")));
        assert!(c.env.unwrap().iter().any(|e| e.name == "POLYAXON_CONNECTION_GIT1"));
        assert_eq!(c.env_from.unwrap()[0].secret_ref.as_ref().unwrap().name, "git-creds");
        assert!(c.volume_mounts.unwrap().iter().any(|m| m.mount_path == "/plx-context"));
        assert!(c.resources.is_some());
    }

    #[test]
    fn nombres_estables_y_distintos_por_indice() {
        let ctx = ctx_with(json!([]));
        let f = init(json!({"file": {"content": "hola", "filename": "a.txt"}}));
        let (a, _) = init_container(&ctx, &f, "main", 0).unwrap();
        let (b, _) = init_container(&ctx, &f, "main", 0).unwrap();
        let (c, _) = init_container(&ctx, &f, "main", 1).unwrap();
        assert_eq!(a.name, b.name);
        assert_ne!(a.name, c.name);
    }

    #[test]
    fn inits_propios_con_el_mismo_nombre_no_chocan() {
        let ctx = ctx_with(json!([]));
        let custom = init(json!({"container": {"name": "Prepare_Data", "image": "busybox"}}));
        let (a, _) = init_container(&ctx, &custom, "main", 0).unwrap();
        let (b, _) = init_container(&ctx, &custom, "main", 1).unwrap();
        let (a, b) = (a.name.unwrap(), b.name.unwrap());
        assert_ne!(a, b);
        assert!(a.starts_with("prepare-data-"));
        assert!(names::is_dns_label(&a) && names::is_dns_label(&b));

        let built_in = init(json!({"container": {"name": "polyaxon-init-custom", "image": "busybox"}}));
        let (c, _) = init_container(&ctx, &built_in, "main", 2).unwrap();
        let (d, _) = init_container(&ctx, &init(json!({"container": {"image": "busybox"}})), "main", 2).unwrap();
        assert_ne!(c.name, d.name);
    }

    #[test]
    fn dockerfile_renderizado() {
        let d: DockerfileType = serde_json::from_value(json!({
            "image": "python:3.11",
            "env": {"A": "1"},
            "run": ["pip install -r requirements.txt"],
            "copy": ["requirements.txt", ["src", "/code/src"]],
            "langEnv": "en_US.UTF-8"
        }))
        .unwrap();
        let content = render_dockerfile(&d).unwrap();
        assert_eq!(
            content,
            "FROM python:3.11\nENV LC_ALL en_US.UTF-8\nENV LANG en_US.UTF-8\nENV LANGUAGE en_US.UTF-8\nENV A 1\nWORKDIR /code\nCOPY requirements.txt /code\nCOPY src /code/src\nRUN pip install -r requirements.txt\n"
        );
    }

    #[test]
    fn conexion_desconocida_es_error() {
        let ctx = ctx_with(json!([]));
        assert!(init_container(&ctx, &init(json!({"connection": "nada"})), "main", 0).is_err());
    }

    #[test]
    fn script_de_tensorboard() {
        let tb = TensorboardType {
            port: Some(7000),
            path_prefix: Some("/p".into()),
            plugins: Some(vec!["tensorboard-plugin-profile".into()]),
            ..Default::default()
        };
        let s = tensorboard_script(&tb, "/plx-context/artifacts/tensorboard");
        assert!(s.contains("pip install --no-cache-dir tensorboard-plugin-profile"));
        assert!(s.contains("--port=7000"));
        assert!(s.contains("--path_prefix=/p"));
    }
}
