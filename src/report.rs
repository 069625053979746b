//! Run report: one markdown and one JSON rendering of every case in a
//! session.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{StepStatus, TestResult};
use crate::artifacts::{Artifact, ArtifactKind, ArtifactStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub cases: Vec<TestResult>,
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn seconds(ms: u64) -> String {
    format!("{:.2}s", ms as f64 / 1000.0)
}

impl RunReport {
    pub fn new(cases: Vec<TestResult>) -> Self {
        Self {
            generated_at: Utc::now(),
            cases,
        }
    }

    pub fn passed(&self) -> usize {
        self.cases.iter().filter(|case| case.success).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.len() - self.passed()
    }

    /// Percentage of passing cases; 0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.cases.is_empty() {
            return 0.0;
        }
        self.passed() as f64 * 100.0 / self.cases.len() as f64
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Test Run Report\n\n");
        out.push_str(&format!(
            "Generated: {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str("## Summary\n\n");
        out.push_str(&format!("- Cases: {}\n", self.cases.len()));
        out.push_str(&format!("- Passed: {}\n", self.passed()));
        out.push_str(&format!("- Failed: {}\n", self.failed()));
        out.push_str(&format!("- Success rate: {:.1}%\n\n", self.success_rate()));

        if self.cases.is_empty() {
            return out;
        }

        out.push_str("| Case | Status | Steps passed | Duration | Description |\n");
        out.push_str("|---|---|---|---|---|\n");
        for case in &self.cases {
            out.push_str(&format!(
                "| {} | {} | {}/{} | {} | {} |\n",
                case.case_id,
                if case.success { "Passed" } else { "Failed" },
                case.passed_steps(),
                case.steps.len(),
                seconds(case.duration_ms()),
                cell(&case.description),
            ));
        }

        for case in &self.cases {
            out.push_str(&format!("\n## {}: {}\n\n", case.case_id, cell(&case.description)));
            if case.success {
                out.push_str("**Status:** Passed\n\n");
            } else {
                out.push_str(&format!("**Status:** Failed: {}\n\n", case.message));
            }
            out.push_str("| # | Step | Status | Attempts | Duration | Detail | Artifact |\n");
            out.push_str("|---|---|---|---|---|---|---|\n");
            for step in &case.steps {
                let status = match (step.status, step.tolerated) {
                    (StepStatus::Failed, true) => "failed (tolerated)".to_string(),
                    (status, _) => status.to_string(),
                };
                let duration = match step.status {
                    StepStatus::Skipped => "-".to_string(),
                    _ => seconds(step.duration_ms),
                };
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | {} |\n",
                    step.index + 1,
                    cell(&step.step.summary()),
                    status,
                    step.attempts(),
                    duration,
                    cell(&step.message),
                    step.artifact.as_ref().map(artifact_cell).unwrap_or_default(),
                ));
            }
            let snippets: Vec<&Artifact> = case
                .artifacts()
                .filter(|artifact| artifact.snippet.is_some())
                .collect();
            if !snippets.is_empty() {
                out.push_str("\nExtracted content:\n\n");
                for artifact in snippets {
                    out.push_str(&format!(
                        "> {}: {}\n",
                        artifact.path.display(),
                        artifact.snippet.as_deref().unwrap_or_default()
                    ));
                }
            }
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes `report.md` and `report.json` into the session directory.
    pub async fn write(&self, store: &ArtifactStore) -> io::Result<(Artifact, Artifact)> {
        let markdown = store
            .write(
                None,
                "report.md",
                ArtifactKind::Report,
                self.to_markdown().as_bytes(),
                None,
            )
            .await?;
        let json = self.to_json().map_err(io::Error::other)?;
        let structured = store
            .write(None, "report.json", ArtifactKind::Report, json.as_bytes(), None)
            .await?;
        Ok((markdown, structured))
    }
}

fn artifact_cell(artifact: &Artifact) -> String {
    format!("`{}`", cell(&artifact.path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::aggregate::{AbortReason, PlanOutcome, StepResult, aggregate};
    use crate::schema::{RawStep, validate};

    fn sample() -> RunReport {
        let now = Utc::now();
        let click = |target: &str| validate(&RawStep::new("click").target(target)).unwrap();
        let passed = aggregate(
            "case-001",
            "open the menu",
            vec![StepResult::succeeded(0, click("#menu"), "clicked", None, 120, 0)],
            PlanOutcome::Finished,
            now,
            now,
        );
        let shot = Artifact {
            kind: ArtifactKind::Screenshot,
            path: PathBuf::from("runs/x/case-002/step-01-screenshot-failure.png"),
            bytes: 10,
            snippet: None,
        };
        let failed = aggregate(
            "case-002",
            "join | rewards",
            vec![
                StepResult::failed(0, click("text=Join"), "element not found", Some(shot), 900, 2, false),
                StepResult::skipped(1, click("#next"), "skipped"),
            ],
            PlanOutcome::Aborted {
                reason: AbortReason::StepFailed { step: 0 },
            },
            now,
            now,
        );
        RunReport::new(vec![passed, failed])
    }

    #[test]
    fn summary_counts_and_rate() {
        let report = sample();
        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert!((report.success_rate() - 50.0).abs() < f64::EPSILON);
        assert_eq!(RunReport::new(Vec::new()).success_rate(), 0.0);
    }

    #[test]
    fn markdown_lists_cases_steps_and_artifacts() {
        let markdown = sample().to_markdown();
        assert!(markdown.contains("- Success rate: 50.0%"));
        assert!(markdown.contains("| case-001 | Passed | 1/1 |"));
        assert!(markdown.contains("join \\| rewards"));
        assert!(markdown.contains("**Status:** Failed: FAILED: step 1 (click text=Join)"));
        assert!(markdown.contains("| 1 | click text=Join | failed | 3 | 0.90s |"));
        assert!(markdown.contains("step-01-screenshot-failure.png"));
        assert!(markdown.contains("| 2 | click #next | skipped | 0 | - |"));
    }

    #[tokio::test]
    async fn writes_both_renderings() {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(root.path()).await.unwrap();
        let (markdown, json) = sample().write(&store).await.unwrap();
        assert!(markdown.path.ends_with("report.md"));
        let parsed: RunReport =
            serde_json::from_str(&std::fs::read_to_string(&json.path).unwrap()).unwrap();
        assert_eq!(parsed.cases.len(), 2);
    }
}
