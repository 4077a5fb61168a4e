//! Compilación `Operation` -> `CompiledOperation`.
//!
//! Pasos: cargar el componente, mezclar presets en orden, aplicar `runPatch`,
//! resolver params (literales y refs) contra los IO declarados, armar los
//! contexts, renderizar el `run` y validar el resultado.

use common::compiled::COMPILED_KIND;
use common::component::is_template;
use common::connections::Connection;
use common::io::Io;
use common::operation::ComponentRef;
use common::params::{Param, ParamRef};
use common::patch::{patch_value, PatchStrategy, Patchable};
use common::reader;
use common::{CompiledOperation, Component, Operation, Runtime, SchemaError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::contexts::{resolve_contexts, RunContext};
use crate::error::{CompilerError, CompilerResult};
use crate::loader::ComponentLoader;
use crate::template::Renderer;

pub const DEFAULT_VERSION: f64 = 1.1;

/// Claves reservadas del contexto de plantillas; un IO con ese nombre sólo
/// se expone bajo `params`.
const RESERVED_KEYS: [&str; 9] = [
    "globals",
    "init",
    "connections",
    "replicas",
    "ops",
    "params",
    "inputs",
    "outputs",
    "contexts",
];

/// Campos de la operación que pisan (post_merge) a los del componente.
const OVERRIDE_FIELDS: [&str; 13] = [
    "name",
    "description",
    "tags",
    "cost",
    "presets",
    "queue",
    "namespace",
    "cache",
    "build",
    "hooks",
    "plugins",
    "termination",
    "isApproved",
];

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub run: RunContext,
    /// Valores de referencias ya resueltas, por clave `<ref>.<path>`
    /// (`ops.a.outputs.loss`, `runs.<uuid>.outputs.x`, `dag.inputs.lr`).
    pub refs: BTreeMap<String, Value>,
    /// Valores agregados de cada join param.
    pub joins: BTreeMap<String, Vec<Value>>,
    pub connections: BTreeMap<String, Connection>,
    pub artifacts_store: Option<Connection>,
    /// Componentes del dag padre, para `dagRef`.
    pub dag_components: Vec<Component>,
}

/* --------- Pasos --------- */

fn check_run_refs(op: &Operation) -> CompilerResult<()> {
    for p in op.params().values() {
        if let Some(r) = p.reference.as_deref() {
            if r.trim().starts_with("runs.") && p.parsed_ref().is_err() {
                return Err(CompilerError::BadUuid(r.to_string()));
            }
        }
    }
    Ok(())
}

fn apply_presets(op: &Operation, loader: &dyn ComponentLoader) -> CompilerResult<Operation> {
    let mut current = op.clone();
    for name in op.presets.iter().flatten() {
        let preset = loader.load_preset(name)?;
        if !preset.is_preset() {
            return Err(CompilerError::validation(
                format!("presets.{name}"),
                "el documento no está marcado como isPreset",
            ));
        }
        let (patch, strategy) = preset.as_preset_patch();
        debug!("aplicando preset {name} con {strategy:?}");
        current = current.patch(&patch, strategy)?;
    }
    Ok(current)
}

fn load_component(
    op: &Operation,
    loader: &dyn ComponentLoader,
    opts: &CompileOptions,
) -> CompilerResult<Component> {
    match op.component_ref()? {
        ComponentRef::Inline => op
            .component
            .clone()
            .ok_or_else(|| CompilerError::Loader("inline".into())),
        ComponentRef::Dag(name) => opts
            .dag_components
            .iter()
            .find(|c| c.name.as_deref() == Some(name.as_str()))
            .cloned()
            .ok_or(CompilerError::Loader(format!("dagRef {name}"))),
        other => loader.load_component(&other),
    }
}

fn apply_run_patch(op: &Operation, component: &mut Component) -> CompilerResult<()> {
    let Some(run_patch) = &op.run_patch else {
        return Ok(());
    };
    reader::validate_run_patch(component.run.kind(), run_patch)?;
    let mut run = serde_json::to_value(&component.run).map_err(SchemaError::from)?;
    patch_value(&mut run, run_patch, op.patch_strategy.unwrap_or_default());
    component.run = Runtime::from_value(run)?;
    Ok(())
}

/// Campos del componente con los de la operación encima, sin IO todavía.
fn merge_fields(op: &Operation, component: &Component) -> CompilerResult<CompiledOperation> {
    let mut doc = serde_json::to_value(component).map_err(SchemaError::from)?;
    let op_value = serde_json::to_value(op).map_err(SchemaError::from)?;
    let mut overrides = Map::new();
    for key in OVERRIDE_FIELDS {
        if let Some(v) = op_value.get(key) {
            overrides.insert(key.to_string(), v.clone());
        }
    }
    patch_value(&mut doc, &Value::Object(overrides), PatchStrategy::PostMerge);
    if let Value::Object(m) = &mut doc {
        m.remove("inputs");
        m.remove("outputs");
        m.remove("contexts");
        m.insert("kind".into(), Value::String(COMPILED_KIND.into()));
        let version = op.version.or(component.version).unwrap_or(DEFAULT_VERSION);
        m.insert("version".into(), Value::from(version));
    }
    let mut compiled: CompiledOperation = serde_json::from_value(doc)
        .map_err(|e| SchemaError::from_serde("compiled_operation", e.to_string()))?;
    compiled.events = op.events.clone();
    compiled.matrix = op.matrix.clone();
    compiled.joins = op.joins.clone();
    compiled.schedule = op.schedule.clone();
    compiled.dependencies = op.dependencies.clone();
    compiled.trigger = op.trigger;
    compiled.conditions = op.conditions.clone();
    compiled.skip_on_upstream_skip = op.skip_on_upstream_skip;
    compiled.is_approved = op.is_approved.or(component.is_approved);
    Ok(compiled)
}

/// Busca `a.b.c` dentro de un árbol JSON.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(root, |node, key| node.get(key))
}

struct ParamResolver<'a> {
    opts: &'a CompileOptions,
    renderer: Renderer,
    context: Value,
}

impl<'a> ParamResolver<'a> {
    fn new(opts: &'a CompileOptions, context: Value) -> CompilerResult<Self> {
        Ok(ParamResolver {
            opts,
            renderer: Renderer::new(&context)?,
            context,
        })
    }

    fn raw_value(&mut self, name: &str, p: &Param) -> CompilerResult<Option<Value>> {
        let value = match p.parsed_ref() {
            Ok(None) => p.value.clone(),
            Ok(Some(r)) => {
                let key = p.ref_key().unwrap_or_else(|| r.to_string());
                let found = self.opts.refs.get(&key).cloned().or_else(|| match r {
                    // `_` apunta al contexto de la run actual
                    ParamRef::Current => p
                        .value
                        .as_ref()
                        .and_then(Value::as_str)
                        .and_then(|path| lookup_path(&self.context, path))
                        .cloned(),
                    _ => None,
                });
                Some(found.ok_or(CompilerError::UnresolvedRef(key))?)
            }
            Err(e) => {
                return Err(match p.reference.as_deref() {
                    Some(r) if r.trim().starts_with("runs.") => CompilerError::BadUuid(r.to_string()),
                    _ => CompilerError::validation(format!("params.{name}.ref"), e.to_string()),
                })
            }
        };
        self.render(value)
    }

    fn render(&mut self, value: Option<Value>) -> CompilerResult<Option<Value>> {
        match value {
            Some(mut v) if is_template(&v) => {
                self.renderer.render_value(&mut v, &[])?;
                Ok(Some(v))
            }
            other => Ok(other),
        }
    }
}

fn type_mismatch(io: &Io, raw: &Value) -> CompilerError {
    let expected = if io.is_list() {
        format!("list<{}>", io.io_type())
    } else {
        io.io_type().to_string()
    };
    CompilerError::TypeMismatch {
        param: io.name.clone(),
        expected,
        got: match raw {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn context_io(name: &str, value: Option<Value>, connection: Option<String>, to_init: Option<bool>, to_env: Option<String>) -> Io {
    Io {
        name: name.to_string(),
        value: value.filter(|v| !v.is_null()),
        connection,
        to_init,
        to_env,
        ..Default::default()
    }
}

type ResolvedIo = (Vec<Io>, Vec<Io>, Vec<Io>);

fn resolve_params(
    op: &Operation,
    component: &Component,
    opts: &CompileOptions,
    globals: Value,
) -> CompilerResult<ResolvedIo> {
    let params = op.params();
    let io_names: Vec<&str> = component
        .inputs()
        .iter()
        .chain(component.outputs())
        .map(|io| io.name.as_str())
        .collect();
    for (name, p) in params {
        let declared = io_names.contains(&name.as_str());
        if p.is_context_only() && declared {
            return Err(CompilerError::validation(
                format!("params.{name}"),
                "un param contextOnly no puede ser input/output",
            ));
        }
        if !p.is_context_only() && !declared {
            return Err(CompilerError::validation(
                format!("params.{name}"),
                "el param no está declarado en inputs/outputs",
            ));
        }
    }

    // los literales sin plantilla quedan disponibles para renderizar el resto
    let mut seed = Map::new();
    seed.insert("globals".into(), globals);
    for (name, p) in params {
        if let (true, Some(v)) = (p.is_literal(), &p.value) {
            if !is_template(v) && !RESERVED_KEYS.contains(&name.as_str()) {
                seed.insert(name.clone(), v.clone());
            }
        }
    }
    let mut resolver = ParamResolver::new(opts, Value::Object(seed))?;

    let mut resolve_io = |io: &Io, is_input: bool| -> CompilerResult<Io> {
        let mut out = io.clone();
        let raw = match params.get(&io.name) {
            Some(p) => {
                out.connection = p.connection.clone().or(out.connection);
                out.to_init = p.to_init.or(out.to_init);
                out.to_env = p.to_env.clone().or(out.to_env);
                resolver.raw_value(&io.name, p)?
            }
            None => resolver.render(io.value.clone())?,
        };
        out.value = match raw {
            None | Some(Value::Null) => {
                if is_input && !io.is_optional() {
                    return Err(CompilerError::validation(
                        format!("inputs.{}", io.name),
                        "input requerido sin valor",
                    ));
                }
                None
            }
            Some(v) if io.delay_validation.unwrap_or(false) => Some(v),
            Some(v) => Some(
                io.validate_value(&v)
                    .map_err(|_| type_mismatch(io, &v))?
                    .to_json(),
            ),
        };
        Ok(out)
    };

    let inputs = component
        .inputs()
        .iter()
        .map(|io| resolve_io(io, true))
        .collect::<CompilerResult<Vec<_>>>()?;
    let outputs = component
        .outputs()
        .iter()
        .map(|io| resolve_io(io, false))
        .collect::<CompilerResult<Vec<_>>>()?;

    let mut contexts: BTreeMap<String, Io> = BTreeMap::new();
    for io in component.contexts.iter().flatten() {
        let value = resolver.render(io.value.clone())?;
        contexts.insert(
            io.name.clone(),
            context_io(&io.name, value, io.connection.clone(), io.to_init, io.to_env.clone()),
        );
    }
    for (name, p) in params.iter().filter(|(_, p)| p.is_context_only()) {
        let value = resolver.raw_value(name, p)?;
        contexts.insert(
            name.clone(),
            context_io(name, value, p.connection.clone(), p.to_init, p.to_env.clone()),
        );
    }
    for join in op.joins.iter().flatten() {
        for (name, jp) in &join.params {
            let values = opts.joins.get(name).cloned().unwrap_or_default();
            let mut io = context_io(name, Some(Value::Array(values)), jp.connection.clone(), jp.to_init, jp.to_env.clone());
            io.is_list = Some(true);
            contexts.insert(name.clone(), io);
        }
    }
    Ok((inputs, outputs, contexts.into_values().collect()))
}

fn io_map<'a>(ios: impl Iterator<Item = &'a Io>) -> Map<String, Value> {
    ios.map(|io| (io.name.clone(), io.value.clone().unwrap_or(Value::Null)))
        .collect()
}

/// Contexto de plantillas para el `run`: IO por nombre, `params.<x>.{value,as_arg,as_str}`,
/// `inputs`, `outputs` y los contextos de la run.
pub fn template_context(compiled: &CompiledOperation, opts: &CompileOptions) -> Value {
    let plugins = compiled.plugins();
    let mut ctx = resolve_contexts(
        &compiled.run,
        &opts.run,
        &opts.connections,
        opts.artifacts_store.as_ref(),
        plugins.external_host(),
    );
    let mut params = Map::new();
    for io in compiled.all_io() {
        let value = io.value.clone().unwrap_or(Value::Null);
        let as_str = match &value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let mut entry = Map::new();
        entry.insert("value".into(), value.clone());
        entry.insert("as_arg".into(), Value::String(io.as_arg().unwrap_or_default()));
        entry.insert("as_str".into(), Value::String(as_str));
        params.insert(io.name.clone(), Value::Object(entry));
        if !RESERVED_KEYS.contains(&io.name.as_str()) {
            ctx.insert(io.name.clone(), value);
        }
    }
    ctx.insert("params".into(), Value::Object(params));
    ctx.insert("inputs".into(), Value::Object(io_map(compiled.inputs().iter())));
    ctx.insert("outputs".into(), Value::Object(io_map(compiled.outputs().iter())));
    Value::Object(ctx)
}

fn render_run(compiled: &mut CompiledOperation, opts: &CompileOptions) -> CompilerResult<()> {
    let context = template_context(compiled, opts);
    let mut run = serde_json::to_value(&compiled.run).map_err(SchemaError::from)?;
    // las ops de un dag se renderizan cuando se compila cada una
    let skip: &[&str] = if compiled.is_dag() {
        &["operations", "components"]
    } else {
        &[]
    };
    Renderer::new(&context)?.render_value(&mut run, skip)?;
    compiled.run = Runtime::from_value(run)?;
    Ok(())
}

/* --------- API --------- */

pub fn compile(
    op: &Operation,
    loader: &dyn ComponentLoader,
    opts: &CompileOptions,
) -> CompilerResult<CompiledOperation> {
    check_run_refs(op)?;
    op.validate()?;
    let op = apply_presets(op, loader)?;
    let mut component = load_component(&op, loader, opts)?;
    apply_run_patch(&op, &mut component)?;
    component.validate()?;

    let mut compiled = merge_fields(&op, &component)?;
    if compiled.build.is_some() && compiled.is_dag() {
        return Err(CompilerError::DagWithBuild);
    }

    let globals = crate::contexts::globals(
        &compiled.run,
        &opts.run,
        opts.artifacts_store.as_ref(),
        compiled.plugins().external_host(),
    );
    let (inputs, outputs, contexts) = resolve_params(&op, &component, opts, globals)?;
    compiled.inputs = component.inputs.as_ref().map(|_| inputs);
    compiled.outputs = component.outputs.as_ref().map(|_| outputs);
    compiled.contexts = if contexts.is_empty() { None } else { Some(contexts) };

    render_run(&mut compiled, opts)?;
    compiled.validate()?;
    debug!(
        "operación compilada: kind={} name={:?}",
        compiled.run_kind(),
        compiled.name
    );
    Ok(compiled)
}

/// Vuelve a compilar un resultado; debe devolver lo mismo.
pub fn recompile(
    compiled: &CompiledOperation,
    loader: &dyn ComponentLoader,
    opts: &CompileOptions,
) -> CompilerResult<CompiledOperation> {
    let op = Operation {
        version: compiled.version,
        kind: Some("operation".to_string()),
        events: compiled.events.clone(),
        matrix: compiled.matrix.clone(),
        joins: compiled.joins.clone(),
        schedule: compiled.schedule.clone(),
        dependencies: compiled.dependencies.clone(),
        trigger: compiled.trigger,
        conditions: compiled.conditions.clone(),
        skip_on_upstream_skip: compiled.skip_on_upstream_skip,
        params: Some(compiled.to_params()),
        component: Some(compiled.to_component()),
        ..Default::default()
    };
    let mut out = compile(&op, loader, opts)?;
    out.presets = compiled.presets.clone();
    Ok(out)
}

/// Compila la op `name` de un dag ya compilado. Los `dagRef` se resuelven con
/// los componentes del dag y las refs `dag.*` con sus IO.
pub fn compile_dag_operation(
    dag: &CompiledOperation,
    name: &str,
    loader: &dyn ComponentLoader,
    opts: &CompileOptions,
) -> CompilerResult<CompiledOperation> {
    let run = dag
        .run
        .as_dag()
        .ok_or_else(|| CompilerError::UnsupportedKind(dag.run_kind().to_string()))?;
    let op = run
        .operations()
        .iter()
        .find(|o| o.name.as_deref() == Some(name))
        .ok_or_else(|| CompilerError::UnresolvedRef(format!("ops.{name}")))?;
    let mut opts = opts.clone();
    opts.dag_components = run.components.clone().unwrap_or_default();
    for io in dag.inputs() {
        if let Some(v) = &io.value {
            opts.refs.entry(format!("dag.inputs.{}", io.name)).or_insert_with(|| v.clone());
        }
    }
    for io in dag.outputs() {
        if let Some(v) = &io.value {
            opts.refs.entry(format!("dag.outputs.{}", io.name)).or_insert_with(|| v.clone());
        }
    }
    compile(op, loader, &opts)
}

/// Fija la imagen del contenedor principal tras un build.
pub fn apply_build_image(compiled: &mut CompiledOperation, image: &str) -> CompilerResult<()> {
    let kind = compiled.run_kind();
    let container = compiled
        .run
        .main_container_mut()
        .ok_or_else(|| CompilerError::UnsupportedKind(kind.to_string()))?;
    container.image = Some(image.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;
    use common::reader::read_operation;
    use serde_json::json;

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

    fn compile_str(content: &str) -> CompilerResult<CompiledOperation> {
        compile(&read_operation(content)?, &MemoryLoader::new(), &CompileOptions::default())
    }

    fn main_image(c: &CompiledOperation) -> Option<String> {
        match &c.run {
            Runtime::Job(j) => j.container.as_ref().and_then(|c| c.image.clone()),
            _ => None,
        }
    }

    #[test]
    fn job_simple_resuelve_la_imagen() {
        let c = compile_str(S1).unwrap();
        assert_eq!(c.kind.as_deref(), Some(COMPILED_KIND));
        assert_eq!(main_image(&c).as_deref(), Some("a/b:1"));
        assert_eq!(c.inputs()[0].value, Some(json!("a/b:1")));
    }

    #[test]
    fn compilar_dos_veces_da_lo_mismo() {
        let op = read_operation(
            r#"
version: 1.1
kind: operation
tags: [a]
params:
  image: {value: "a/b:1"}
  lr: {value: "0.01"}
  tag: {value: "x", contextOnly: true}
plugins: {collectLogs: false}
component:
  tags: [b]
  inputs: [{name: image, type: str}, {name: lr, type: float}]
  outputs: [{name: loss, type: float, isOptional: true}]
  run:
    kind: job
    container: {image: "{{ image }}", args: ["--lr={{ lr }}", "{{ params.lr.as_arg }}", "{{ tag }}"]}
"#,
        )
        .unwrap();
        let loader = MemoryLoader::new();
        let opts = CompileOptions::default();
        let once = compile(&op, &loader, &opts).unwrap();
        let twice = recompile(&once, &loader, &opts).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.inputs()[1].value, Some(json!(0.01)));
        assert_eq!(once.tags, Some(vec!["b".to_string(), "a".to_string()]));
        assert_eq!(once.contexts().len(), 1);
        match &once.run {
            Runtime::Job(j) => assert_eq!(
                j.container.as_ref().unwrap().args,
                Some(vec!["--lr=0.01".into(), "--lr=0.01".into(), "x".into()])
            ),
            other => panic!("runtime inesperado {other:?}"),
        }
    }

    #[test]
    fn dag_con_build_falla() {
        let err = compile_str(
            r#"
version: 1.1
kind: operation
build: {hubRef: kaniko}
component:
  run: {kind: dag, operations: []}
"#,
        )
        .unwrap_err();
        assert_eq!(err, CompilerError::DagWithBuild);
    }

    #[test]
    fn tipo_incorrecto_es_type_mismatch() {
        let err = compile_str(
            r#"
version: 1.1
kind: operation
params: {n: {value: "abc"}}
component:
  inputs: [{name: n, type: int}]
  run: {kind: job}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::TypeMismatch { ref param, .. } if param == "n"));
    }

    #[test]
    fn input_requerido_sin_valor() {
        let err = compile_str(
            "version: 1.1\nkind: operation\ncomponent:\n  inputs: [{name: n, type: int}]\n  run: {kind: job}\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::Validation { .. }));
    }

    #[test]
    fn param_no_declarado_es_error() {
        let err = compile_str(
            "version: 1.1\nkind: operation\nparams: {x: {value: 1}}\ncomponent:\n  run: {kind: job}\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::Validation { ref path, .. } if path == "params.x"));
    }

    #[test]
    fn refs_se_resuelven_o_fallan() {
        let content = r#"
version: 1.1
kind: operation
params:
  loss: {ref: ops.train, value: outputs.loss}
component:
  inputs: [{name: loss, type: float}]
  run: {kind: job}
"#;
        let op = read_operation(content).unwrap();
        let loader = MemoryLoader::new();
        let err = compile(&op, &loader, &CompileOptions::default()).unwrap_err();
        assert_eq!(err, CompilerError::UnresolvedRef("ops.train.outputs.loss".into()));

        let mut opts = CompileOptions::default();
        opts.refs.insert("ops.train.outputs.loss".into(), json!("0.25"));
        let c = compile(&op, &loader, &opts).unwrap();
        assert_eq!(c.inputs()[0].value, Some(json!(0.25)));
    }

    #[test]
    fn runs_ref_exige_uuid_v4() {
        let err = compile_str(
            r#"
version: 1.1
kind: operation
params:
  loss: {ref: runs.1234, value: outputs.loss}
component:
  inputs: [{name: loss, type: float}]
  run: {kind: job}
"#,
        )
        .unwrap_err();
        assert_eq!(err, CompilerError::BadUuid("runs.1234".into()));
    }

    #[test]
    fn presets_en_orden_el_ultimo_gana() {
        let loader = MemoryLoader::new()
            .with_preset_yaml(
                "p1",
                "version: 1.1\nkind: operation\nisPreset: true\nqueue: q1\ntags: [t1]\nplugins: {docker: true, logLevel: info}\n",
            )
            .unwrap()
            .with_preset_yaml(
                "p2",
                "version: 1.1\nkind: operation\nisPreset: true\nqueue: q2\ntags: [t2]\nplugins: {logLevel: debug}\n",
            )
            .unwrap();
        let op = read_operation(
            "version: 1.1\nkind: operation\npresets: [p1, p2]\ncomponent:\n  run: {kind: job}\n",
        )
        .unwrap();
        let c = compile(&op, &loader, &CompileOptions::default()).unwrap();
        assert_eq!(c.queue.as_deref(), Some("q2"));
        assert_eq!(c.tags, Some(vec!["t1".to_string(), "t2".to_string()]));
        let plugins = c.plugins();
        assert!(plugins.docker());
        assert_eq!(plugins.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn run_patch_se_mezcla_en_el_runtime() {
        let c = compile_str(
            r#"
version: 1.1
kind: operation
runPatch:
  container: {image: "patched:2"}
  environment: {nodeSelector: {gpu: "true"}}
component:
  run: {kind: job, container: {image: "orig:1", command: ["python"]}}
"#,
        )
        .unwrap();
        match &c.run {
            Runtime::Job(j) => {
                let container = j.container.as_ref().unwrap();
                assert_eq!(container.image.as_deref(), Some("patched:2"));
                assert_eq!(container.command, Some(vec!["python".to_string()]));
                assert!(j.environment.is_some());
            }
            other => panic!("runtime inesperado {other:?}"),
        }
    }

    #[test]
    fn run_patch_de_otro_kind_es_invalido() {
        assert!(compile_str(
            "version: 1.1\nkind: operation\nrunPatch: {kind: service}\ncomponent:\n  run: {kind: job}\n"
        )
        .is_err());
    }

    #[test]
    fn joins_son_contexts_de_lista() {
        let op = read_operation(
            r#"
version: 1.1
kind: operation
joins:
  - query: "metrics.loss:<0.1"
    params:
      losses: {value: outputs.loss}
component:
  run: {kind: job, container: {args: ["{{ losses | join(sep=',') }}"]}}
"#,
        )
        .unwrap();
        let mut opts = CompileOptions::default();
        opts.joins.insert("losses".into(), vec![json!(0.05), json!(0.07)]);
        let c = compile(&op, &MemoryLoader::new(), &opts).unwrap();
        assert_eq!(c.contexts()[0].is_list, Some(true));
        match &c.run {
            Runtime::Job(j) => assert_eq!(
                j.container.as_ref().unwrap().args,
                Some(vec!["0.05,0.07".to_string()])
            ),
            other => panic!("runtime inesperado {other:?}"),
        }
    }

    #[test]
    fn plantilla_con_variable_inexistente_falla() {
        let err = compile_str(
            "version: 1.1\nkind: operation\ncomponent:\n  run: {kind: job, container: {image: '{{ params.nada.value }}'}}\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompilerError::TemplateRender { .. }));
    }

    #[test]
    fn op_de_dag_usa_dag_ref_e_inputs_del_dag() {
        let dag = compile_str(
            r#"
version: 1.1
kind: operation
params: {lr: {value: 0.1}}
component:
  inputs: [{name: lr, type: float}]
  run:
    kind: dag
    components:
      - name: trainer
        inputs: [{name: lr, type: float}]
        run: {kind: job, container: {image: "t:1", args: ["--lr={{ lr }}"]}}
    operations:
      - name: train
        dagRef: trainer
        params: {lr: {ref: dag, value: inputs.lr}}
"#,
        )
        .unwrap();
        let c = compile_dag_operation(&dag, "train", &MemoryLoader::new(), &CompileOptions::default()).unwrap();
        match &c.run {
            Runtime::Job(j) => assert_eq!(
                j.container.as_ref().unwrap().args,
                Some(vec!["--lr=0.1".to_string()])
            ),
            other => panic!("runtime inesperado {other:?}"),
        }
    }

    #[test]
    fn imagen_del_build_pisa_el_contenedor() {
        let mut c = compile_str(S1).unwrap();
        apply_build_image(&mut c, "registry/built:abc").unwrap();
        assert_eq!(main_image(&c).as_deref(), Some("registry/built:abc"));
    }
}
