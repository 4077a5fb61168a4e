//! Variante síncrona de un executor, para herramientas sin runtime propio.

use common::{LogLine, RunKind};
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

use super::{Executor, ExecutorError, ExecutorResult, Resource, ResourceStatus};

pub struct BlockingExecutor {
    inner: Arc<dyn Executor>,
    rt: Runtime,
}

impl BlockingExecutor {
    pub fn new(inner: Arc<dyn Executor>) -> ExecutorResult<Self> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ExecutorError::Other(e.to_string()))?;
        Ok(BlockingExecutor { inner, rt })
    }

    pub fn create(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        self.rt.block_on(self.inner.create(run_uuid, run_kind, resource, namespace))
    }

    pub fn apply(
        &self,
        run_uuid: &Uuid,
        run_kind: RunKind,
        resource: &Resource,
        namespace: Option<&str>,
    ) -> ExecutorResult<ResourceStatus> {
        self.rt.block_on(self.inner.apply(run_uuid, run_kind, resource, namespace))
    }

    pub fn stop(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()> {
        self.rt.block_on(self.inner.stop(run_uuid, run_kind, namespace))
    }

    pub fn clean(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<()> {
        self.rt.block_on(self.inner.clean(run_uuid, run_kind, namespace))
    }

    pub fn get(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<ResourceStatus> {
        self.rt.block_on(self.inner.get(run_uuid, run_kind, namespace))
    }

    pub fn list_ops(&self, namespace: Option<&str>) -> ExecutorResult<Vec<ResourceStatus>> {
        self.rt.block_on(self.inner.list_ops(namespace))
    }

    pub fn logs(&self, run_uuid: &Uuid, run_kind: RunKind, namespace: Option<&str>) -> ExecutorResult<Vec<LogLine>> {
        self.rt.block_on(self.inner.logs(run_uuid, run_kind, namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::docker::DockerExecutor;
    use compiler::DockerPlan;

    #[test]
    fn envuelve_un_executor_async() {
        let root = std::env::temp_dir().join("plx_agent_blocking_tests");
        let exec = BlockingExecutor::new(Arc::new(DockerExecutor::with_binary(&root, "true"))).unwrap();
        let uuid = Uuid::new_v4();
        let status = exec
            .create(&uuid, RunKind::Job, &Resource::Docker(DockerPlan::default()), None)
            .unwrap();
        assert_eq!(status.run_uuid, uuid);
        assert_eq!(exec.list_ops(None).unwrap().len(), 1);
        assert!(matches!(
            exec.apply(&uuid, RunKind::Job, &Resource::Docker(DockerPlan::default()), None),
            Err(ExecutorError::UnsupportedOperation(_))
        ));
    }
}
