use uuid::Uuid;

/// Correlation id for one run (32 hex characters).
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one scheduling run.
pub fn run_span(project_id: &str, run_id: &str) -> tracing::Span {
    tracing::info_span!("run", project_id = %project_id, run_id = %run_id)
}

/// Span wrapping one story's pipeline, so every event it logs carries the
/// story id and a fresh trace id.
pub fn story_span(run_id: &str, story_id: &str) -> tracing::Span {
    let trace_id = generate_trace_id();
    tracing::info_span!(
        "story",
        run_id = %run_id,
        story_id = %story_id,
        trace_id = %trace_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_format() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_trace_id());
    }

    #[test]
    fn test_spans_can_be_entered() {
        let run = run_span("proj", "run-1");
        let _outer = run.enter();
        let story = story_span("run-1", "1-2");
        let _inner = story.enter();
        tracing::info!("inside story span");
    }
}
