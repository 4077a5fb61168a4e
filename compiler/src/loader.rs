//! Carga de componentes referenciados y de presets.

use common::operation::ComponentRef;
use common::reader;
use common::{Component, Operation};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CompilerError, CompilerResult};

/// Resuelve `hubRef`, `pathRef`, `urlRef` y los presets por nombre.
///
/// Los `dagRef` se resuelven contra los componentes del dag padre y no pasan
/// por aquí.
pub trait ComponentLoader {
    fn load_component(&self, reference: &ComponentRef) -> CompilerResult<Component>;
    fn load_preset(&self, name: &str) -> CompilerResult<Operation>;
}

fn read_preset(content: &str, name: &str) -> CompilerResult<Operation> {
    let value = reader::parse_document(content)?;
    let mut op: Operation = serde_json::from_value(value)
        .map_err(|e| CompilerError::validation(format!("presets.{name}"), e.to_string()))?;
    if !op.is_preset() {
        return Err(CompilerError::validation(
            format!("presets.{name}"),
            "el documento no está marcado como isPreset",
        ));
    }
    op.validate()?;
    op.is_preset = Some(true);
    Ok(op)
}

/// Lee componentes y presets de un directorio:
/// `<root>/<ref>.yaml` para hub/path y `<root>/presets/<name>.yaml` para presets.
#[derive(Debug, Clone)]
pub struct PathLoader {
    root: PathBuf,
}

impl PathLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PathLoader { root: root.into() }
    }

    fn locate(&self, base: &Path, name: &str) -> Option<PathBuf> {
        let direct = base.join(name);
        if direct.is_file() {
            return Some(direct);
        }
        ["yaml", "yml", "json"]
            .iter()
            .map(|ext| base.join(format!("{name}.{ext}")))
            .find(|p| p.is_file())
    }
}

impl ComponentLoader for PathLoader {
    fn load_component(&self, reference: &ComponentRef) -> CompilerResult<Component> {
        let name = match reference {
            // `org/comp:version` -> `org/comp-version`
            ComponentRef::Hub(h) => h.replace(':', "-"),
            ComponentRef::Path(p) => p.clone(),
            ComponentRef::Url(u) => return Err(CompilerError::Loader(u.clone())),
            ComponentRef::Dag(d) => return Err(CompilerError::Loader(format!("dagRef {d}"))),
            ComponentRef::Inline => return Err(CompilerError::Loader("inline".into())),
        };
        let path = self
            .locate(&self.root, &name)
            .ok_or_else(|| CompilerError::Loader(name.clone()))?;
        debug!("cargando componente {}", path.display());
        let content = reader::read_file(&path)?;
        Ok(reader::read_component(&content)?)
    }

    fn load_preset(&self, name: &str) -> CompilerResult<Operation> {
        let path = self
            .locate(&self.root.join("presets"), name)
            .ok_or_else(|| CompilerError::Loader(format!("preset {name}")))?;
        let content = reader::read_file(&path)?;
        read_preset(&content, name)
    }
}

/// Loader en memoria, útil para tests y para compilar dags con componentes embebidos.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    components: BTreeMap<String, Component>,
    presets: BTreeMap<String, Operation>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, reference: &str, component: Component) -> Self {
        self.components.insert(reference.to_string(), component);
        self
    }

    pub fn with_preset(mut self, name: &str, preset: Operation) -> Self {
        self.presets.insert(name.to_string(), preset);
        self
    }

    pub fn with_preset_yaml(self, name: &str, content: &str) -> CompilerResult<Self> {
        let preset = read_preset(content, name)?;
        Ok(self.with_preset(name, preset))
    }
}

impl ComponentLoader for MemoryLoader {
    fn load_component(&self, reference: &ComponentRef) -> CompilerResult<Component> {
        let key = match reference {
            ComponentRef::Hub(r) | ComponentRef::Path(r) | ComponentRef::Url(r) | ComponentRef::Dag(r) => r,
            ComponentRef::Inline => return Err(CompilerError::Loader("inline".into())),
        };
        self.components
            .get(key)
            .cloned()
            .ok_or_else(|| CompilerError::Loader(key.clone()))
    }

    fn load_preset(&self, name: &str) -> CompilerResult<Operation> {
        self.presets
            .get(name)
            .cloned()
            .ok_or_else(|| CompilerError::Loader(format!("preset {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("loader_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(base.join("presets")).unwrap();
        base
    }

    #[test]
    fn path_loader_lee_componentes_y_presets() {
        let root = temp_dir("path");
        fs::write(
            root.join("train.yaml"),
            "version: 1.1\nkind: component\nrun: {kind: job, container: {image: x}}\n",
        )
        .unwrap();
        fs::write(
            root.join("presets").join("gpu.yaml"),
            "version: 1.1\nkind: operation\nisPreset: true\nqueue: gpu\n",
        )
        .unwrap();

        let loader = PathLoader::new(&root);
        let c = loader.load_component(&ComponentRef::Path("train".into())).unwrap();
        assert_eq!(c.run.kind(), common::RunKind::Job);
        let p = loader.load_preset("gpu").unwrap();
        assert_eq!(p.queue.as_deref(), Some("gpu"));
        assert!(loader.load_preset("nada").is_err());
    }

    #[test]
    fn preset_sin_marca_es_rechazado() {
        let err = MemoryLoader::new()
            .with_preset_yaml("x", "version: 1.1\nkind: operation\nqueue: gpu\n")
            .unwrap_err();
        assert!(matches!(err, CompilerError::Validation { .. }));
    }
}
