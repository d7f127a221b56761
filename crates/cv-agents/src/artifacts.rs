//! Structured outputs exchanged between the pipeline steps.
//!
//! Field names are camelCase on the wire because that is what the prompts
//! ask the models to produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Amelia's artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    #[default]
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub operation: FileOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeImplementation {
    pub files: Vec<FileChange>,
    pub commit_message: String,
    #[serde(default)]
    pub implementation_notes: String,
    /// Acceptance criterion -> where/how it is satisfied.
    #[serde(default)]
    pub acceptance_criteria_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coverage {
    #[serde(default)]
    pub lines: f64,
    #[serde(default)]
    pub functions: f64,
    #[serde(default)]
    pub branches: f64,
    #[serde(default)]
    pub statements: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuite {
    pub files: Vec<FileChange>,
    pub framework: String,
    pub test_count: u32,
    #[serde(default)]
    pub coverage: Coverage,
    #[serde(default)]
    pub results: TestResults,
}

/// Amelia's review of her own work. Context for Alex, never a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfReviewReport {
    /// 0.0 ..= 1.0
    pub confidence: f64,
    #[serde(default)]
    pub critical_issues: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Alex's artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: FindingSeverity,
    #[serde(default)]
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub file: Option<String>,
}

/// Output of one focused Alex review (security, quality or tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewSection {
    /// 0 ..= 100
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Fail,
    Escalate,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Pass => write!(f, "pass"),
            Decision::Fail => write!(f, "fail"),
            Decision::Escalate => write!(f, "escalate"),
        }
    }
}

/// What the final aggregation call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportVerdict {
    #[serde(default)]
    pub architecture_compliance: Option<ReviewSection>,
    pub overall_score: f64,
    pub confidence: f64,
    pub decision: Decision,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndependentReviewReport {
    pub security_review: ReviewSection,
    pub quality_analysis: ReviewSection,
    pub test_validation: ReviewSection,
    pub architecture_compliance: Option<ReviewSection>,
    pub overall_score: f64,
    pub confidence: f64,
    pub decision: Decision,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<String>,
}

impl IndependentReviewReport {
    pub fn assemble(
        security_review: ReviewSection,
        quality_analysis: ReviewSection,
        test_validation: ReviewSection,
        verdict: ReportVerdict,
    ) -> Self {
        Self {
            security_review,
            quality_analysis,
            test_validation,
            architecture_compliance: verdict.architecture_compliance,
            overall_score: verdict.overall_score,
            confidence: verdict.confidence,
            decision: verdict.decision,
            findings: verdict.findings,
            recommendations: verdict.recommendations,
        }
    }

    /// Every finding, from the sections and the aggregate.
    pub fn all_findings(&self) -> impl Iterator<Item = &Finding> {
        self.security_review
            .findings
            .iter()
            .chain(&self.quality_analysis.findings)
            .chain(&self.test_validation.findings)
            .chain(
                self.architecture_compliance
                    .iter()
                    .flat_map(|s| s.findings.iter()),
            )
            .chain(&self.findings)
    }

    pub fn max_severity(&self) -> Option<FindingSeverity> {
        self.all_findings().map(|f| f.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(score: f64, findings: Vec<Finding>) -> ReviewSection {
        ReviewSection {
            score,
            passed: true,
            findings,
            summary: String::new(),
        }
    }

    #[test]
    fn implementation_parses_model_shape() {
        let raw = r#"{
            "files": [{"path": "src/lib.rs", "content": "pub fn a() {}", "operation": "modify"},
                      {"path": "old.rs", "operation": "delete"}],
            "commitMessage": "feat: add a",
            "implementationNotes": "small",
            "acceptanceCriteriaMapping": {"AC1": "src/lib.rs::a"}
        }"#;
        let code: CodeImplementation = serde_json::from_str(raw).unwrap();
        assert_eq!(code.files[0].operation, FileOperation::Modify);
        assert_eq!(code.files[1].content, "");
        assert_eq!(code.acceptance_criteria_mapping["AC1"], "src/lib.rs::a");
    }

    #[test]
    fn test_suite_defaults_missing_metrics() {
        let raw = r#"{"files": [], "framework": "cargo test", "testCount": 4}"#;
        let suite: TestSuite = serde_json::from_str(raw).unwrap();
        assert_eq!(suite.results, TestResults::default());
        assert_eq!(suite.coverage.lines, 0.0);
    }

    #[test]
    fn max_severity_covers_every_section() {
        let high = Finding {
            severity: FindingSeverity::High,
            category: "security".into(),
            description: "sql injection".into(),
            file: None,
        };
        let report = IndependentReviewReport::assemble(
            section(60.0, vec![high]),
            section(90.0, vec![]),
            section(90.0, vec![]),
            ReportVerdict {
                architecture_compliance: None,
                overall_score: 70.0,
                confidence: 0.8,
                decision: Decision::Escalate,
                findings: vec![],
                recommendations: vec![],
            },
        );
        assert_eq!(report.max_severity(), Some(FindingSeverity::High));
        assert_eq!(report.all_findings().count(), 1);
    }

    #[test]
    fn decision_wire_format() {
        let d: Decision = serde_json::from_str("\"escalate\"").unwrap();
        assert_eq!(d, Decision::Escalate);
        assert_eq!(Decision::Pass.to_string(), "pass");
    }
}
