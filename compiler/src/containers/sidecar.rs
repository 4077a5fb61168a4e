use common::k8s::{Container, Volume};
use common::plugins::Plugins;

use super::{
    agent_env, apply_defaults, artifacts_store_parts, context_mount, merge_env, merge_env_from,
    merge_mounts, MAIN_JOB_CONTAINER, SIDECAR_CONTAINER,
};
use crate::converters::ConverterContext;
use crate::error::CompilerResult;

/// Sidecar de recolección. `None` si los plugins no piden logs ni artifacts.
pub fn sidecar_container(
    ctx: &ConverterContext,
    plugins: &Plugins,
) -> CompilerResult<Option<(Container, Vec<Volume>)>> {
    if !plugins.needs_sidecar() {
        return Ok(None);
    }
    let sidecar = &ctx.settings.sidecar;
    let mut args = vec![
        format!("--container-id={MAIN_JOB_CONTAINER}"),
        format!("--sleep-interval={}", sidecar.sleep_interval),
        format!("--sync-interval={}", sidecar.sync_interval),
    ];
    if plugins.collect_logs() {
        args.push("--monitor-logs".to_string());
    }
    if plugins.collect_artifacts() {
        args.push("--monitor-spec".to_string());
    }

    let store = artifacts_store_parts(ctx);
    let mut c = Container {
        name: Some(SIDECAR_CONTAINER.to_string()),
        image: Some(sidecar.image.clone()),
        image_pull_policy: sidecar.image_pull_policy.clone(),
        command: Some(vec!["plx-agent".to_string(), "sidecar".to_string()]),
        args: Some(args),
        ..Default::default()
    };
    c.env = Some(merge_env(vec![store.env, agent_env(ctx, plugins.auth())]));
    c.env_from = Some(merge_env_from(vec![store.env_from])).filter(|e| !e.is_empty());
    c.volume_mounts = Some(merge_mounts(vec![vec![context_mount()], store.mounts])?);
    apply_defaults(&mut c, true);
    Ok(Some((c, store.volumes)))
}
