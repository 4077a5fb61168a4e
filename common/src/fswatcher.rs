//! Snapshot de archivos y carpetas de una run para sincronizar artefactos.
//!
//! Cada ciclo: `init()` marca todo como `RM`, `sync(path)` vuelve a marcar lo
//! que existe (`PUT` si es nuevo o cambió, `NOOP` si no). Lo que queda en `RM`
//! ya no existe en disco.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tracing::debug;
use walkdir::WalkDir;

pub const WATCHER_FILENAME: &str = ".plxwatcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsOp {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "RM")]
    Rm,
    #[serde(rename = "NOOP")]
    Noop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsEntry {
    pub base: String,
    pub ts: f64,
    pub op: FsOp,
}

impl FsEntry {
    pub fn path(&self, rel: &str) -> PathBuf {
        Path::new(&self.base).join(rel)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsWatcher {
    files: BTreeMap<String, FsEntry>,
    dirs: BTreeMap<String, FsEntry>,
    /// Rutas que cambiaron de tipo (archivo <-> carpeta) desde el último drenado.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stale_files: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    stale_dirs: Vec<PathBuf>,
}

fn mtime(meta: &fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn is_excluded(name: &str, rel: &str, exclude: &[glob::Pattern]) -> bool {
    exclude.iter().any(|p| p.matches(name) || p.matches(rel))
}

fn upsert(map: &mut BTreeMap<String, FsEntry>, rel: String, base: &str, ts: f64) {
    match map.get_mut(&rel) {
        Some(entry) if entry.ts < ts => {
            entry.ts = ts;
            entry.base = base.to_string();
            entry.op = FsOp::Put;
        }
        Some(entry) => entry.op = FsOp::Noop,
        None => {
            map.insert(
                rel,
                FsEntry {
                    base: base.to_string(),
                    ts,
                    op: FsOp::Put,
                },
            );
        }
    }
}

impl FsWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marca todas las entradas como borrado tentativo.
    pub fn init(&mut self) {
        for entry in self.files.values_mut().chain(self.dirs.values_mut()) {
            entry.op = FsOp::Rm;
        }
    }

    /// Recorre `path` y actualiza el snapshot. Las rutas relativas incluyen el
    /// nombre de `path` (son relativas a su carpeta padre).
    pub fn sync(&mut self, path: &Path, exclude: &[String]) -> io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let patterns: Vec<glob::Pattern> = exclude
            .iter()
            .filter_map(|e| glob::Pattern::new(e).ok())
            .collect();
        let base_dir = path.parent().unwrap_or_else(|| Path::new("/"));
        let base = base_dir.to_string_lossy().to_string();

        let walker = WalkDir::new(path)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                let rel = e.path().strip_prefix(base_dir).unwrap_or(e.path());
                !is_excluded(&name, &rel.to_string_lossy(), &patterns)
            });

        for entry in walker {
            let entry = entry.map_err(io::Error::other)?;
            let rel = match entry.path().strip_prefix(base_dir) {
                Ok(r) => r.to_string_lossy().to_string(),
                Err(_) => continue,
            };
            let meta = entry.metadata().map_err(io::Error::other)?;
            let ts = mtime(&meta);
            if meta.is_dir() {
                if let Some(old) = self.files.remove(&rel) {
                    self.stale_files.push(old.path(&rel));
                }
                upsert(&mut self.dirs, rel, &base, ts);
            } else {
                if let Some(old) = self.dirs.remove(&rel) {
                    self.stale_dirs.push(old.path(&rel));
                }
                upsert(&mut self.files, rel, &base, ts);
            }
        }
        debug!(
            "fswatcher sync de {}: {} archivos, {} carpetas",
            path.display(),
            self.files.len(),
            self.dirs.len()
        );
        Ok(())
    }

    fn with_op(map: &BTreeMap<String, FsEntry>, op: FsOp) -> Vec<PathBuf> {
        map.iter()
            .filter(|(_, e)| e.op == op)
            .map(|(rel, e)| e.path(rel))
            .collect()
    }

    fn drain_rm(map: &mut BTreeMap<String, FsEntry>) -> Vec<PathBuf> {
        let rm: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.op == FsOp::Rm)
            .map(|(rel, _)| rel.clone())
            .collect();
        rm.into_iter()
            .filter_map(|rel| map.remove(&rel).map(|e| e.path(&rel)))
            .collect()
    }

    pub fn get_files_to_put(&self) -> Vec<PathBuf> {
        Self::with_op(&self.files, FsOp::Put)
    }

    pub fn get_dirs_to_put(&self) -> Vec<PathBuf> {
        Self::with_op(&self.dirs, FsOp::Put)
    }

    /// Devuelve y olvida los archivos borrados, incluidos los que ahora son carpetas.
    pub fn get_files_to_rm(&mut self) -> Vec<PathBuf> {
        let mut rm = std::mem::take(&mut self.stale_files);
        rm.extend(Self::drain_rm(&mut self.files));
        rm
    }

    pub fn get_dirs_to_rm(&mut self) -> Vec<PathBuf> {
        let mut rm = std::mem::take(&mut self.stale_dirs);
        rm.extend(Self::drain_rm(&mut self.dirs));
        rm
    }

    pub fn get(&self, rel: &str) -> Option<&FsEntry> {
        self.files.get(rel).or_else(|| self.dirs.get(rel))
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_path(ctx: &Path) -> PathBuf {
        ctx.join(WATCHER_FILENAME)
    }

    /// Persiste el snapshot como JSON.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(self).map_err(io::Error::other)?;
        fs::write(path, data)
    }

    /// Lee un snapshot previo; si no existe arranca vacío.
    pub fn read(path: &Path) -> io::Result<Self> {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).map_err(io::Error::other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}
