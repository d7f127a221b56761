use cv_agents::state_machine::{PipelineEvent, PipelineStage, PipelineStateMachine, PipelineStep};
use cv_agents::AgentType;

#[test]
fn happy_path_reaches_passed() {
    let mut sm = PipelineStateMachine::new();
    assert_eq!(sm.stage(), PipelineStage::Implementing);

    sm.transition(PipelineEvent::CodeWritten).unwrap();
    sm.transition(PipelineEvent::TestsWritten).unwrap();
    sm.transition(PipelineEvent::SelfReviewed).unwrap();
    assert_eq!(sm.stage(), PipelineStage::IndependentReviewing);

    let s = sm.transition(PipelineEvent::Approved).unwrap();
    assert_eq!(s, PipelineStage::Passed);
    assert!(s.is_terminal());
    assert_eq!(sm.history().len(), 4);
}

#[test]
fn review_can_reject_or_escalate() {
    for (event, stage) in [
        (PipelineEvent::Rejected, PipelineStage::Failed),
        (PipelineEvent::Escalate, PipelineStage::Escalated),
    ] {
        let mut sm = PipelineStateMachine::new();
        sm.transition(PipelineEvent::CodeWritten).unwrap();
        sm.transition(PipelineEvent::TestsWritten).unwrap();
        sm.transition(PipelineEvent::SelfReviewed).unwrap();
        assert_eq!(sm.transition(event).unwrap(), stage);
    }
}

#[test]
fn stages_cannot_be_skipped() {
    let mut sm = PipelineStateMachine::new();
    assert!(sm.transition(PipelineEvent::TestsWritten).is_err());
    assert!(sm.transition(PipelineEvent::Approved).is_err());
    // Rejected transitions leave the stage alone.
    assert_eq!(sm.stage(), PipelineStage::Implementing);
    assert!(sm.history().is_empty());
}

#[test]
fn fail_from_any_running_stage() {
    let mut sm = PipelineStateMachine::new();
    sm.transition(PipelineEvent::CodeWritten).unwrap();
    assert_eq!(sm.transition(PipelineEvent::Fail).unwrap(), PipelineStage::Failed);
}

#[test]
fn terminal_stages_accept_nothing() {
    let mut sm = PipelineStateMachine::new();
    sm.transition(PipelineEvent::Fail).unwrap();
    assert!(sm.transition(PipelineEvent::Fail).is_err());
    assert!(sm.transition(PipelineEvent::CodeWritten).is_err());
}

#[test]
fn steps_map_to_agents_and_stages() {
    let amelia: Vec<_> = PipelineStep::ALL
        .into_iter()
        .filter(|s| s.agent_type() == AgentType::Amelia)
        .collect();
    assert_eq!(
        amelia,
        vec![PipelineStep::Implement, PipelineStep::WriteTests, PipelineStep::SelfReview]
    );
    assert_eq!(PipelineStep::GenerateReport.stage(), PipelineStage::IndependentReviewing);
    assert_eq!(PipelineStep::from_name("validate_tests"), Some(PipelineStep::ValidateTests));
    assert_eq!(PipelineStep::from_name("deploy"), None);
}
