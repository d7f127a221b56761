//! conveyor: runs the story backlog through the dual-agent pipeline until
//! nothing more can start.

use std::sync::Arc;

use anyhow::{Context, Result};
use cv_agents::agent_pool::{AgentPool, AgentType};
use cv_core::config::Config;
use cv_core::events::EventBus;
use cv_core::git::RealGitRunner;
use cv_daemon::context::{load_backlog, OrchestratorContext};
use cv_daemon::pr_automator::PrCreationAutomator;
use cv_daemon::scheduler::StoryScheduler;
use cv_integrations::github::GitHubClient;
use cv_intelligence::{ProviderFactory, RetryPolicy};
use tracing::{error, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    cv_telemetry::logging::init(
        "conveyor",
        &config.general.log_level,
        &config.general.log_format,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project_id = %config.general.project_id,
        repo_root = %config.general.repo_root.display(),
        "conveyor starting"
    );

    let backlog_path = config.general.repo_root.join(&config.general.stories_file);
    let stories = load_backlog(&backlog_path)
        .await
        .with_context(|| format!("failed to load backlog {}", backlog_path.display()))?;
    info!(stories = stories.len(), "backlog loaded");

    let events = EventBus::new();
    let factory = ProviderFactory::new(config.providers.clone());
    let pool = AgentPool::from_config(
        &config.agents,
        &factory,
        RetryPolicy::from(&config.llm),
        events.clone(),
    )
    .context("failed to configure agents")?;
    for agent_type in [AgentType::Amelia, AgentType::Alex] {
        let (provider, model) = pool.model_for(agent_type);
        info!(agent_type = %agent_type, provider, model, "agent bound");
    }
    let host = Arc::new(GitHubClient::from_config(&config.github).context("failed to configure GitHub")?);

    let ctx = Arc::new(
        OrchestratorContext::open(config, stories, pool, host, Arc::new(RealGitRunner), events)
            .await
            .context("failed to open orchestrator state")?,
    );

    let recovered = ctx
        .worktrees
        .reconcile(ctx.base_branch())
        .await
        .context("failed to reconcile worktrees")?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "re-registered existing worktrees");
    }

    let prs = Arc::new(PrCreationAutomator::new(ctx.clone()).context("invalid GitHub settings")?);
    let scheduler = StoryScheduler::new(ctx.clone(), prs);

    let summary = tokio::select! {
        summary = scheduler.run() => summary.context("scheduling run failed")?,
        _ = tokio::signal::ctrl_c() => {
            error!("interrupted; in-flight stories keep their worktrees for reconcile");
            return Ok(());
        }
    };

    for (story_id, outcome) in &summary.outcomes {
        info!(story_id = %story_id, outcome = outcome.label(), "story result");
    }
    for escalation in ctx.escalations.list_pending(Some(ctx.project_id())).await {
        warn!(
            escalation_id = %escalation.id,
            story_id = ?escalation.story_id,
            escalation_type = ?escalation.escalation_type,
            "escalation awaiting a human response"
        );
    }
    info!(
        run_id = %summary.run_id,
        merged = summary.merged(),
        status = %summary.status,
        halted = ?summary.halted,
        cost_usd = ctx.pool.total_cost_usd(),
        "conveyor finished"
    );
    Ok(())
}
