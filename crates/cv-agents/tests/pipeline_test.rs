//! Dual-agent pipeline scenarios driven by scripted mock providers.

use std::path::Path;
use std::sync::Arc;

use cv_agents::agent_pool::AgentPool;
use cv_agents::decision::{DecisionEngine, RunScope};
use cv_agents::pipeline::{
    DualAgentPipeline, PipelineError, PipelineOutcome, PipelineRun, StepError, StoryContext,
};
use cv_agents::prompts::PromptRegistry;
use cv_agents::state_machine::{PipelineStage, PipelineStep};
use cv_core::escalation::EscalationQueue;
use cv_core::events::{ConveyorEvent, EventBus};
use cv_core::state::StateManager;
use cv_core::types::{ActivityStatus, Story};
use cv_intelligence::llm::LlmConfig;
use cv_intelligence::{LlmClient, MockProvider, RetryPolicy};

const PROJECT: &str = "proj";
const RUN: &str = "run-1";

// ===========================================================================
// Fixtures
// ===========================================================================

const IMPLEMENTATION: &str = r#"{
  "files": [{"path": "src/login.rs", "content": "pub fn login() {}\n", "operation": "create"}],
  "commitMessage": "feat: login",
  "implementationNotes": "adds login",
  "acceptanceCriteriaMapping": {"user can log in": "src/login.rs"}
}"#;

const TESTS: &str = r##"{
  "files": [{"path": "tests/login.rs", "content": "#[test] fn t() {}\n"}],
  "framework": "cargo test",
  "testCount": 1,
  "results": {"passed": 1, "failed": 0, "skipped": 0, "durationMs": 12}
}"##;

const SELF_REVIEW: &str = r#"{"confidence": 0.85, "criticalIssues": [], "summary": "fine"}"#;

const SECTION: &str = r#"{"score": 90, "passed": true, "findings": [], "summary": "ok"}"#;

fn verdict(decision: &str, confidence: f64) -> String {
    format!(
        r#"Here is my verdict:
```json
{{"overallScore": 88, "confidence": {confidence}, "decision": "{decision}", "findings": [], "recommendations": []}}
```"#
    )
}

fn amelia_script() -> MockProvider {
    MockProvider::named("anthropic")
        .with_text(IMPLEMENTATION)
        .with_text(TESTS)
        .with_text(SELF_REVIEW)
}

fn alex_script(decision: &str, confidence: f64) -> MockProvider {
    MockProvider::named("openai")
        .with_text(SECTION)
        .with_text(SECTION)
        .with_text(SECTION)
        .with_text(verdict(decision, confidence))
}

struct Harness {
    _tmp: tempfile::TempDir,
    worktree: tempfile::TempDir,
    pipeline: DualAgentPipeline,
    pool: Arc<AgentPool>,
    state: Arc<StateManager>,
    queue: Arc<EscalationQueue>,
    events: EventBus,
    amelia: Arc<MockProvider>,
    alex: Arc<MockProvider>,
}

impl Harness {
    async fn new(amelia: MockProvider, alex: MockProvider) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let worktree = tempfile::tempdir().unwrap();
        let events = EventBus::new();
        let amelia = Arc::new(amelia);
        let alex = Arc::new(alex);

        let client = |provider: Arc<MockProvider>, model: &str| {
            LlmClient::new(
                provider,
                LlmConfig {
                    model: model.into(),
                    ..LlmConfig::default()
                },
                RetryPolicy::none(),
            )
        };
        let pool = Arc::new(
            AgentPool::new(
                client(amelia.clone(), "claude-sonnet-4-20250514"),
                client(alex.clone(), "gpt-4o"),
                events.clone(),
            )
            .unwrap(),
        );

        let state = Arc::new(StateManager::new(tmp.path()));
        state.start_run(PROJECT, "Project", "sprint").await.unwrap();
        let queue = Arc::new(EscalationQueue::open(tmp.path(), 3).await.unwrap());
        let decisions = Arc::new(DecisionEngine::new(queue.clone(), events.clone()));
        let pipeline = DualAgentPipeline::new(
            pool.clone(),
            state.clone(),
            decisions,
            Arc::new(PromptRegistry::new()),
        );

        Self {
            _tmp: tmp,
            worktree,
            pipeline,
            pool,
            state,
            queue,
            events,
            amelia,
            alex,
        }
    }

    fn context(&self) -> StoryContext {
        let mut story = Story::new("1-2", 1, 2, "User login");
        story.acceptance_criteria = vec!["user can log in".into()];
        StoryContext {
            story,
            worktree_path: self.worktree.path().to_path_buf(),
            scope: RunScope::new(PROJECT, RUN),
        }
    }

    fn file(&self, rel: &str) -> bool {
        Path::new(self.worktree.path()).join(rel).exists()
    }
}

fn completed(run: PipelineRun) -> PipelineOutcome {
    match run {
        PipelineRun::Completed(outcome) => outcome,
        other => panic!("expected completion, got {other:?}"),
    }
}

// ===========================================================================
// Decisions
// ===========================================================================

#[tokio::test]
async fn test_pass_runs_seven_fresh_agents() {
    let h = Harness::new(amelia_script(), alex_script("pass", 0.9)).await;
    let rx = h.events.subscribe();

    let outcome = completed(h.pipeline.run(&h.context()).await.unwrap());
    let PipelineOutcome::Passed(artifacts) = outcome else {
        panic!("expected pass");
    };
    assert_eq!(artifacts.implementation.commit_message, "feat: login");
    assert_eq!(artifacts.tests.test_count, 1);
    assert!(h.file("src/login.rs"));
    assert!(h.file("tests/login.rs"));

    assert_eq!(h.amelia.call_count(), 3);
    assert_eq!(h.alex.call_count(), 4);
    assert_eq!(h.pool.active_count(), 0);

    let created = rx
        .drain()
        .filter(|e| matches!(e, ConveyorEvent::AgentCreated { .. }))
        .count();
    assert_eq!(created, 7);

    let state = h.state.load_state(PROJECT).await.unwrap().unwrap();
    assert_eq!(state.agent_activity.len(), 7);
    assert!(state
        .agent_activity
        .iter()
        .all(|a| a.status == ActivityStatus::Completed));
    assert_eq!(state.agent_activity[0].agent_name, "Amelia");
    assert_eq!(state.agent_activity[6].agent_name, "Alex");
    assert_eq!(state.current_step.as_deref(), Some("1-2:generate_report"));
}

#[tokio::test]
async fn test_fail_halts_without_escalation() {
    let h = Harness::new(amelia_script(), alex_script("fail", 0.9)).await;
    let outcome = completed(h.pipeline.run(&h.context()).await.unwrap());
    assert_eq!(outcome.stage(), PipelineStage::Failed);
    assert_eq!(h.queue.count_pending(RUN).await, 0);
}

#[tokio::test]
async fn test_escalate_persists_pending_escalation() {
    let h = Harness::new(amelia_script(), alex_script("escalate", 0.6)).await;
    let rx = h.events.subscribe();

    let outcome = completed(h.pipeline.run(&h.context()).await.unwrap());
    let PipelineOutcome::Escalated { escalation, .. } = outcome else {
        panic!("expected escalation");
    };
    assert_eq!(escalation.story_id.as_deref(), Some("1-2"));
    assert_eq!(h.queue.count_pending(RUN).await, 1);
    assert!(rx
        .drain()
        .any(|e| matches!(e, ConveyorEvent::EscalationCreated { .. })));
}

#[tokio::test]
async fn test_low_confidence_pass_is_escalated() {
    let h = Harness::new(amelia_script(), alex_script("pass", 0.1)).await;
    let outcome = completed(h.pipeline.run(&h.context()).await.unwrap());
    assert_eq!(outcome.stage(), PipelineStage::Escalated);
}

// ===========================================================================
// Failures
// ===========================================================================

#[tokio::test]
async fn test_unparseable_implementation_is_fatal() {
    let amelia = MockProvider::named("anthropic").with_text("Sorry, I cannot help with that.");
    let h = Harness::new(amelia, alex_script("pass", 0.9)).await;

    let err = h.pipeline.run(&h.context()).await.unwrap_err();
    match &err {
        PipelineError::Step { story_id, step, source } => {
            assert_eq!(story_id, "1-2");
            assert_eq!(*step, PipelineStep::Implement);
            assert!(matches!(source, StepError::Parse { .. }));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.alex.call_count(), 0);
    assert_eq!(h.pool.active_count(), 0);

    let state = h.state.load_state(PROJECT).await.unwrap().unwrap();
    assert_eq!(state.agent_activity.len(), 1);
    assert_eq!(state.agent_activity[0].status, ActivityStatus::Failed);
}

#[tokio::test]
async fn test_agent_error_carries_step_context() {
    let alex = MockProvider::named("openai")
        .with_text(SECTION)
        .with_error(cv_intelligence::LlmError::ApiError {
            status: 400,
            message: "bad request".into(),
        });
    let h = Harness::new(amelia_script(), alex).await;

    let err = h.pipeline.run(&h.context()).await.unwrap_err();
    assert_eq!(err.step(), Some(PipelineStep::AnalyzeQuality));
    assert!(err.to_string().contains("analyze_quality"));
    assert_eq!(h.pool.active_count(), 0);
}

// ===========================================================================
// Pause
// ===========================================================================

#[tokio::test]
async fn test_paused_project_starts_nothing() {
    let h = Harness::new(amelia_script(), alex_script("pass", 0.9)).await;
    h.state.pause(PROJECT).await.unwrap();

    let run = h.pipeline.run(&h.context()).await.unwrap();
    assert!(matches!(
        run,
        PipelineRun::Paused {
            at: PipelineStage::Implementing
        }
    ));
    assert_eq!(h.amelia.call_count(), 0);

    h.state.resume(PROJECT).await.unwrap();
    let outcome = completed(h.pipeline.run(&h.context()).await.unwrap());
    assert_eq!(outcome.stage(), PipelineStage::Passed);
}
