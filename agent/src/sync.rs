//! Ciclo de sincronización de artefactos de una run.
//!
//! Orden por ciclo: borrar archivos, borrar carpetas, subir archivos. Las
//! carpetas se crean implícitamente al subir.

use common::fswatcher::FsWatcher;
use futures::future::join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::store::{ArtifactStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub put: usize,
    pub removed_files: usize,
    pub removed_dirs: usize,
    pub errors: Vec<String>,
}

/// Clave remota de `path`, relativa a la raíz de la run.
pub fn key_for(path: &Path, run_path: &Path) -> Option<String> {
    path.strip_prefix(run_path)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .filter(|k| !k.is_empty())
}

/// Ejecuta `f` sobre `items` con a lo sumo `size` operaciones en vuelo.
/// Los errores se juntan; ninguno corta el resto.
pub async fn run_in_chunks<T, F, Fut>(items: Vec<T>, size: usize, f: F) -> Vec<StoreError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let size = size.max(1);
    let mut errors = Vec::new();
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let chunk: Vec<Fut> = items.by_ref().take(size).map(&f).collect();
        for res in join_all(chunk).await {
            if let Err(e) = res {
                errors.push(e);
            }
        }
    }
    errors
}

/// Carpetas `related/*` de la run, para los fan-in de pipelines.
fn related_paths(run_path: &Path) -> Vec<PathBuf> {
    let pattern = run_path.join("related").join("*");
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_dir()).collect(),
        Err(e) => {
            warn!("patrón inválido {}: {}", pattern.display(), e);
            Vec::new()
        }
    }
}

fn keys(paths: Vec<PathBuf>, run_path: &Path) -> Vec<String> {
    paths.iter().filter_map(|p| key_for(p, run_path)).collect()
}

/// Carpetas que sigue el sidecar: `outputs`, `related/*` y, si se piden,
/// los logs de la run.
pub fn sync_roots(run_path: &Path, with_logs: bool) -> Vec<PathBuf> {
    let mut roots = vec![run_path.join("outputs")];
    roots.extend(related_paths(run_path));
    if with_logs {
        roots.push(run_path.join("logs"));
    }
    roots
}

pub async fn sync_artifacts(
    watcher: &mut FsWatcher,
    store: &dyn ArtifactStore,
    run_path: &Path,
    concurrency: usize,
    exclude: &[String],
) -> SyncReport {
    sync_paths(watcher, store, run_path, &sync_roots(run_path, false), concurrency, exclude).await
}

/// Un ciclo de sincronización sobre `roots`; las claves remotas son relativas
/// a `run_path`.
///
/// Los globs de `exclude` se comparan contra el nombre de cada entrada o contra
/// su ruta relativa a la carpeta padre de cada raíz, no contra la clave remota:
/// bajo `related/upstream` se excluye con `upstream/*.tmp`, no con
/// `related/upstream/*.tmp`.
pub async fn sync_paths(
    watcher: &mut FsWatcher,
    store: &dyn ArtifactStore,
    run_path: &Path,
    roots: &[PathBuf],
    concurrency: usize,
    exclude: &[String],
) -> SyncReport {
    let mut report = SyncReport::default();
    watcher.init();
    for root in roots {
        if let Err(e) = watcher.sync(root, exclude) {
            warn!("no se pudo recorrer {}: {}", root.display(), e);
            report.errors.push(e.to_string());
        }
    }

    let rm_files = keys(watcher.get_files_to_rm(), run_path);
    let rm_dirs = keys(watcher.get_dirs_to_rm(), run_path);
    let puts: Vec<(PathBuf, String)> = watcher
        .get_files_to_put()
        .into_iter()
        .filter_map(|p| key_for(&p, run_path).map(|k| (p, k)))
        .collect();

    report.removed_files = rm_files.len();
    let errs = run_in_chunks(rm_files, concurrency, |k| async move { store.rm_file(&k).await }).await;
    report.errors.extend(errs.iter().map(|e| e.to_string()));

    report.removed_dirs = rm_dirs.len();
    let errs = run_in_chunks(rm_dirs, concurrency, |k| async move { store.rm_dir(&k).await }).await;
    report.errors.extend(errs.iter().map(|e| e.to_string()));

    report.put = puts.len();
    let errs = run_in_chunks(puts, concurrency, |(p, k)| async move { store.put_file(&p, &k).await }).await;
    report.errors.extend(errs.iter().map(|e| e.to_string()));

    for e in &report.errors {
        warn!("sync de artefactos: {}", e);
    }
    debug!(
        "sync: {} subidos, {} archivos y {} carpetas borrados",
        report.put, report.removed_files, report.removed_dirs
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn temp_dir(sub: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("plx_agent_sync_tests").join(sub);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ArtifactStore for RecordingStore {
        async fn put_file(&self, _local: &Path, key: &str) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(format!("put {key}"));
            if key.ends_with("bad.txt") {
                return Err(StoreError::InvalidKey(key.into()));
            }
            Ok(())
        }
        async fn rm_file(&self, key: &str) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(format!("rm {key}"));
            Ok(())
        }
        async fn rm_dir(&self, key: &str) -> Result<(), StoreError> {
            self.calls.lock().unwrap().push(format!("rmdir {key}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn orden_borrar_y_luego_subir() {
        let run = temp_dir("order");
        std::fs::create_dir_all(run.join("outputs/sub")).unwrap();
        std::fs::write(run.join("outputs/a.txt"), "a").unwrap();
        std::fs::write(run.join("outputs/sub/b.txt"), "b").unwrap();
        let store = RecordingStore::default();
        let mut fw = FsWatcher::new();

        let first = sync_artifacts(&mut fw, &store, &run, 2, &[]).await;
        assert_eq!(first.put, 2);
        assert!(first.errors.is_empty());

        std::fs::remove_dir_all(run.join("outputs/sub")).unwrap();
        store.calls.lock().unwrap().clear();
        let second = sync_artifacts(&mut fw, &store, &run, 2, &[]).await;
        assert_eq!(second.removed_files, 1);
        assert_eq!(second.removed_dirs, 1);
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["rm outputs/sub/b.txt", "rmdir outputs/sub"]);
    }

    #[tokio::test]
    async fn archivo_que_pasa_a_carpeta_se_borra_antes_de_subir() {
        let run = temp_dir("retype");
        std::fs::create_dir_all(run.join("outputs")).unwrap();
        std::fs::write(run.join("outputs/x"), "f").unwrap();
        let store = RecordingStore::default();
        let mut fw = FsWatcher::new();
        sync_artifacts(&mut fw, &store, &run, 2, &[]).await;

        std::fs::remove_file(run.join("outputs/x")).unwrap();
        std::fs::create_dir_all(run.join("outputs/x")).unwrap();
        std::fs::write(run.join("outputs/x/y"), "y").unwrap();
        store.calls.lock().unwrap().clear();
        let report = sync_artifacts(&mut fw, &store, &run, 2, &[]).await;
        assert_eq!(report.removed_files, 1);
        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["rm outputs/x", "put outputs/x/y"]);
    }

    #[tokio::test]
    async fn exclusiones_relativas_a_cada_raiz() {
        let run = temp_dir("exclude_roots");
        std::fs::create_dir_all(run.join("outputs")).unwrap();
        std::fs::create_dir_all(run.join("related/upstream")).unwrap();
        std::fs::write(run.join("related/upstream/a.tmp"), "a").unwrap();
        std::fs::write(run.join("related/upstream/b.json"), "b").unwrap();
        let roots = sync_roots(&run, false);

        let store = RecordingStore::default();
        let by_run_key = vec!["related/upstream/*.tmp".to_string()];
        sync_paths(&mut FsWatcher::new(), &store, &run, &roots, 2, &by_run_key).await;
        assert_eq!(store.calls.lock().unwrap().len(), 2);

        let store = RecordingStore::default();
        let by_root = vec!["upstream/*.tmp".to_string()];
        sync_paths(&mut FsWatcher::new(), &store, &run, &roots, 2, &by_root).await;
        assert_eq!(store.calls.lock().unwrap().clone(), vec!["put related/upstream/b.json"]);
    }

    #[tokio::test]
    async fn errores_por_archivo_no_cortan_el_ciclo() {
        let run = temp_dir("errors");
        std::fs::create_dir_all(run.join("outputs")).unwrap();
        std::fs::write(run.join("outputs/bad.txt"), "x").unwrap();
        std::fs::write(run.join("outputs/good.txt"), "y").unwrap();
        let store = RecordingStore::default();
        let report = sync_artifacts(&mut FsWatcher::new(), &store, &run, 1, &[]).await;
        assert_eq!(report.put, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(store.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn incluye_related_y_copia_al_store_local() {
        let run = temp_dir("related");
        std::fs::create_dir_all(run.join("outputs")).unwrap();
        std::fs::create_dir_all(run.join("related/upstream")).unwrap();
        std::fs::write(run.join("related/upstream/m.json"), "{}").unwrap();
        let dest = temp_dir("related_store");
        let store = LocalStore::new(&dest);
        let report = sync_artifacts(&mut FsWatcher::new(), &store, &run, 4, &[]).await;
        assert_eq!(report.put, 1);
        assert!(dest.join("related/upstream/m.json").exists());
    }

    #[test]
    fn claves_relativas_a_la_run() {
        let run = Path::new("/plx/abc");
        assert_eq!(key_for(Path::new("/plx/abc/outputs/a.txt"), run).as_deref(), Some("outputs/a.txt"));
        assert_eq!(key_for(Path::new("/otra/a.txt"), run), None);
    }
}
