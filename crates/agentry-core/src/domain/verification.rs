//! Verification results, build artifacts and promotion decisions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::agent::AgentState;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// One file written by a builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArtifactFile {
    /// Path relative to the target directory.
    pub path: String,
    /// SHA-256 hex digest of the written content.
    pub digest: String,
}

/// The build output that verification decides on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    /// SHA-256 over the sorted `(path, digest)` pairs.
    pub artifact_id: String,
    pub files: Vec<ArtifactFile>,
}

impl BuildArtifact {
    /// Build an artifact from written files. Later writes to the same path win.
    pub fn from_files(files: impl IntoIterator<Item = ArtifactFile>) -> Self {
        let mut by_path = std::collections::BTreeMap::new();
        for file in files {
            by_path.insert(file.path.clone(), file);
        }
        let files: Vec<ArtifactFile> = by_path.into_values().collect();

        let mut hasher = Sha256::new();
        for file in &files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.digest.as_bytes());
            hasher.update([b'\n']);
        }
        Self {
            artifact_id: hex::encode(hasher.finalize()),
            files,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// SHA-256 hex digest of file content.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Metrics reported with one verification outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutcomeMetrics {
    /// Coverage percentage (0–100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_issues: Option<u32>,

    /// Free-form extra metrics.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of one test run by one verifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationOutcome {
    pub test_type: String,

    pub passed: bool,

    #[serde(default)]
    pub metrics: OutcomeMetrics,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VerificationOutcome {
    pub fn passed(test_type: impl Into<String>, metrics: OutcomeMetrics) -> Self {
        Self {
            test_type: test_type.into(),
            passed: true,
            metrics,
            detail: None,
        }
    }

    pub fn failed(test_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            test_type: test_type.into(),
            passed: false,
            metrics: OutcomeMetrics::default(),
            detail: Some(detail.into()),
        }
    }

    /// Failing outcome for a verifier that missed its deadline.
    pub fn timed_out(agent_id: &str, timeout_secs: u64) -> Self {
        Self::failed(
            "timeout",
            format!("verifier {agent_id} did not report within {timeout_secs}s"),
        )
    }

    /// Failing outcome for a verifier that ended without a report.
    pub fn unreported(agent_id: &str, state: AgentState) -> Self {
        Self::failed(
            "unreported",
            format!("verifier {agent_id} ended {state} without a report"),
        )
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.metrics.coverage = Some(coverage);
        self
    }

    pub fn with_critical_issues(mut self, critical_issues: u32) -> Self {
        self.metrics.critical_issues = Some(critical_issues);
        self
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// A promotion rule that can reject an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// Every outcome must have `passed = true`.
    AllPassed,
    /// Every outcome must report coverage of at least `min`.
    MinTestCoverage { min: f64 },
    /// Critical issues summed over outcomes must not exceed `max`.
    MaxCriticalIssues { max: u32 },
}

/// A single rule violation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: GateRule,
    pub reason: String,
}

/// Final, one-shot decision for an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Promoted,
    Rejected { violations: Vec<Violation> },
}

impl PromotionDecision {
    pub fn is_promoted(&self) -> bool {
        matches!(self, PromotionDecision::Promoted)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            PromotionDecision::Promoted => &[],
            PromotionDecision::Rejected { violations } => violations,
        }
    }
}
