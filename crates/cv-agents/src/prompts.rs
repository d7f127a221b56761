//! Prompt templates for the pipeline steps.
//!
//! Each [`PipelineStep`] has a built-in template. Projects can override any
//! of them with `{state_root}/prompts/{step}.md`, e.g. `implement.md`.
//! Placeholders use `{name}` syntax; unknown placeholders are left as-is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent_pool::AgentType;
use crate::state_machine::PipelineStep;

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub step: PipelineStep,
    /// The raw template text with `{variable}` placeholders.
    pub template: String,
    pub source: PromptSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptTemplate {
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut output = self.template.clone();
        for (key, value) in vars {
            output = output.replace(&format!("{{{}}}", key), value);
        }
        output
    }
}

// ---------------------------------------------------------------------------
// PromptRegistry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PromptRegistry {
    templates: HashMap<PipelineStep, PromptTemplate>,
}

impl PromptRegistry {
    /// Create a new registry pre-loaded with built-in defaults.
    pub fn new() -> Self {
        let templates = PipelineStep::ALL
            .into_iter()
            .map(|step| {
                (
                    step,
                    PromptTemplate {
                        step,
                        template: built_in_template(step).to_string(),
                        source: PromptSource::BuiltIn,
                    },
                )
            })
            .collect();
        Self { templates }
    }

    pub fn get(&self, step: PipelineStep) -> &PromptTemplate {
        // Every step is populated by `new`; `set` only replaces.
        &self.templates[&step]
    }

    pub fn set(&mut self, template: PromptTemplate) {
        self.templates.insert(template.step, template);
    }

    /// Load overrides from `{dir}/*.md`. Files whose stem is not a step name
    /// are ignored. Returns the number of overrides applied.
    pub fn load_overrides(&mut self, dir: &Path) -> usize {
        let mut applied = 0;
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            let Some(step) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(PipelineStep::from_name)
            else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    tracing::debug!(step = %step, path = %path.display(), "prompt override loaded");
                    self.set(PromptTemplate {
                        step,
                        template: content,
                        source: PromptSource::File(path),
                    });
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable prompt override")
                }
            }
        }
        applied
    }

    pub fn render(&self, step: PipelineStep, vars: &HashMap<&str, String>) -> String {
        self.get(step).render(vars)
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// System prompt for an agent persona.
pub fn system_prompt(agent: AgentType) -> &'static str {
    match agent {
        AgentType::Amelia => AMELIA_SYSTEM_PROMPT,
        AgentType::Alex => ALEX_SYSTEM_PROMPT,
    }
}

// ---------------------------------------------------------------------------
// Built-in prompt templates
// ---------------------------------------------------------------------------

fn built_in_template(step: PipelineStep) -> &'static str {
    match step {
        PipelineStep::Implement => IMPLEMENT_PROMPT,
        PipelineStep::WriteTests => WRITE_TESTS_PROMPT,
        PipelineStep::SelfReview => SELF_REVIEW_PROMPT,
        PipelineStep::ReviewSecurity => REVIEW_SECURITY_PROMPT,
        PipelineStep::AnalyzeQuality => ANALYZE_QUALITY_PROMPT,
        PipelineStep::ValidateTests => VALIDATE_TESTS_PROMPT,
        PipelineStep::GenerateReport => GENERATE_REPORT_PROMPT,
    }
}

const AMELIA_SYSTEM_PROMPT: &str = "You are Amelia, a senior software developer. \
You implement user stories completely, with production-quality code and tests. \
Always answer with a single JSON document matching the requested schema and nothing else.";

const ALEX_SYSTEM_PROMPT: &str = "You are Alex, an independent code reviewer. \
You did not write the code under review and you judge it on its merits. \
Be specific, cite files, and never approve work you have doubts about. \
Always answer with a single JSON document matching the requested schema and nothing else.";

const IMPLEMENT_PROMPT: &str = r#"Implement story {story_id}: {title}

## Description
{description}

## Acceptance criteria
{acceptance_criteria}

The repository is checked out at {worktree_path}.

Respond with JSON:
{
  "files": [{"path": "relative/path", "content": "full file content", "operation": "create|modify|delete"}],
  "commitMessage": "conventional commit message",
  "implementationNotes": "what you did and why",
  "acceptanceCriteriaMapping": {"<criterion>": "<where it is satisfied>"}
}
"#;

const WRITE_TESTS_PROMPT: &str = r#"Write tests for story {story_id}: {title}

## Acceptance criteria
{acceptance_criteria}

## Implementation
{implementation}

Respond with JSON:
{
  "files": [{"path": "relative/path", "content": "full file content", "operation": "create|modify"}],
  "framework": "test framework",
  "testCount": 0,
  "coverage": {"lines": 0.0, "functions": 0.0, "branches": 0.0, "statements": 0.0},
  "results": {"passed": 0, "failed": 0, "skipped": 0, "durationMs": 0}
}
"#;

const SELF_REVIEW_PROMPT: &str = r#"Review your own work on story {story_id}: {title}

## Implementation
{implementation}

## Tests
{tests}

Respond with JSON:
{"confidence": 0.0, "criticalIssues": ["..."], "summary": "..."}
"#;

const REVIEW_SECURITY_PROMPT: &str = r#"Security review of story {story_id}: {title}

## Implementation
{implementation}

## Developer self-review
{self_review}

Look for injection, authn/authz gaps, secret handling, unsafe input handling.
Respond with JSON:
{"score": 0, "passed": true, "findings": [{"severity": "info|low|medium|high|critical", "category": "...", "description": "...", "file": "..."}], "summary": "..."}
"#;

const ANALYZE_QUALITY_PROMPT: &str = r#"Code quality analysis of story {story_id}: {title}

## Implementation
{implementation}

## Developer self-review
{self_review}

Assess readability, error handling, duplication and fit with the codebase.
Respond with JSON:
{"score": 0, "passed": true, "findings": [], "summary": "..."}
"#;

const VALIDATE_TESTS_PROMPT: &str = r#"Validate the tests for story {story_id}: {title}

## Acceptance criteria
{acceptance_criteria}

## Implementation
{implementation}

## Tests
{tests}

Check that every acceptance criterion is exercised and that assertions are meaningful.
Respond with JSON:
{"score": 0, "passed": true, "findings": [], "summary": "..."}
"#;

const GENERATE_REPORT_PROMPT: &str = r#"Produce the final review verdict for story {story_id}: {title}

## Security review
{security_review}

## Quality analysis
{quality_analysis}

## Test validation
{test_validation}

## Developer self-review
{self_review}

Decide "pass" when the work is ready to merge, "fail" when it must be redone,
"escalate" when a human has to decide.
Respond with JSON:
{
  "architectureCompliance": {"score": 0, "passed": true, "findings": [], "summary": "..."},
  "overallScore": 0,
  "confidence": 0.0,
  "decision": "pass|fail|escalate",
  "findings": [],
  "recommendations": ["..."]
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_step_has_a_built_in_template() {
        let reg = PromptRegistry::new();
        for step in PipelineStep::ALL {
            let tpl = reg.get(step);
            assert_eq!(tpl.source, PromptSource::BuiltIn);
            assert!(tpl.template.contains("{story_id}"), "{step}");
        }
    }

    #[test]
    fn render_replaces_known_and_keeps_unknown() {
        let reg = PromptRegistry::new();
        let vars = HashMap::from([
            ("story_id", "1-2".to_string()),
            ("title", "Login".to_string()),
        ]);
        let text = reg.render(PipelineStep::Implement, &vars);
        assert!(text.starts_with("Implement story 1-2: Login"));
        assert!(text.contains("{description}"));
    }

    #[test]
    fn overrides_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("implement.md"), "Do {story_id} now").unwrap();
        std::fs::write(tmp.path().join("unrelated.md"), "ignored").unwrap();
        std::fs::write(tmp.path().join("write_tests.txt"), "ignored").unwrap();

        let mut reg = PromptRegistry::new();
        assert_eq!(reg.load_overrides(tmp.path()), 1);
        let vars = HashMap::from([("story_id", "9-9".to_string())]);
        assert_eq!(reg.render(PipelineStep::Implement, &vars), "Do 9-9 now");
        assert!(matches!(reg.get(PipelineStep::Implement).source, PromptSource::File(_)));
        assert_eq!(reg.get(PipelineStep::WriteTests).source, PromptSource::BuiltIn);
    }

    #[test]
    fn missing_override_dir_is_fine() {
        let mut reg = PromptRegistry::new();
        assert_eq!(reg.load_overrides(Path::new("/nonexistent/prompts")), 0);
    }

    #[test]
    fn personas_differ() {
        assert!(system_prompt(AgentType::Amelia).contains("Amelia"));
        assert!(system_prompt(AgentType::Alex).contains("independent"));
    }
}
