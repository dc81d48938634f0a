pub mod apply;
pub mod auto;
pub mod completions;
pub mod init;
pub mod list;
pub mod prune;
pub mod review;
pub mod run;
pub mod spec;

use std::collections::BTreeMap;

use voratiq_core::model::{AgentDefinition, AgentId};

use crate::context::Context;

/// Resolve `--agent` flags against the agent catalog, preserving order and
/// rejecting duplicates (§6).
///
/// Falls back to `fallback` (an orchestration stage's configured agents)
/// when no `--agent` flags were given.
pub fn resolve_agents(
    ctx: &Context,
    requested: &[String],
    fallback: &[AgentId],
) -> anyhow::Result<Vec<AgentDefinition>> {
    let ids: Vec<AgentId> = if requested.is_empty() {
        fallback.to_vec()
    } else {
        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::with_capacity(requested.len());
        for raw in requested {
            let id = AgentId::new(raw.clone())
                .map_err(|e| anyhow::anyhow!("invalid agent id `{raw}`: {e}"))?;
            if !seen.insert(id.clone()) {
                anyhow::bail!("`--agent` was passed more than once with the same value `{raw}`");
            }
            ids.push(id);
        }
        ids
    };

    if ids.is_empty() {
        anyhow::bail!("no agent resolved; pass `--agent` or configure one in orchestration.yaml");
    }

    ids.into_iter()
        .map(|id| {
            ctx.agents
                .find_enabled(&id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("agent `{id}` is not an enabled entry in agents.yaml"))
        })
        .collect()
}

/// Build each resolved agent's watchdog tunables from `sandbox.yaml`.
#[must_use]
pub fn watchdog_configs(
    ctx: &Context,
    agents: &[AgentDefinition],
) -> BTreeMap<AgentId, voratiq::watchdog::WatchdogConfig> {
    agents
        .iter()
        .map(|agent| {
            let config = voratiq::watchdog::WatchdogConfig::from_sandbox_config(&ctx.sandbox, agent.provider);
            (agent.id.clone(), config)
        })
        .collect()
}

#[must_use]
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[must_use]
pub fn id_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string()
}
