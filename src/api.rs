//! Wire contract between workers and the runner.
//!
//! These structs are stable: workers in the fleet are updated
//! independently of the control plane.

use crate::vcs::VcsType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Branch the worker should operate on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Branch {
    /// The URL for the branch. None for nascent branches.
    pub url: Option<Url>,

    /// Whether an empty branch is expected (no prior history).
    #[serde(rename = "default-empty")]
    pub default_empty: bool,

    /// Path inside of the branch.
    pub subpath: Option<String>,

    pub vcs_type: VcsType,
}

/// Where the worker should upload its results.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Target {
    /// Base URL for result uploads.
    pub url_prefix: String,

    /// Bearer token scoped to this run.
    pub token: String,
}

/// Prior branch state the worker may resume from.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResumeBranch {
    pub branch_url: Url,
    pub result: serde_json::Value,
}

/// Everything a worker needs to execute one run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AssignmentBundle {
    /// Run id (a ULID).
    pub id: String,
    pub campaign: String,
    pub codebase: String,
    pub branch: Branch,
    /// Command with the campaign context already expanded.
    pub command: Vec<String>,
    /// Environment used for both the build and the codemod.
    pub env: HashMap<String, String>,
    /// Opaque campaign-specific build configuration.
    pub build: serde_json::Value,
    pub target: Target,
    pub resume: Option<ResumeBranch>,
}

/// Per-role branch record in a finish report.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReportBranch {
    pub role: String,
    pub name: Option<String>,
    pub base_revision: Option<String>,
    pub revision: Option<String>,
}

/// Final result a worker submits for a run.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FinishReport {
    /// Result code; must be one of [`KNOWN_RESULT_CODES`].
    pub code: String,
    pub description: Option<String>,
    pub value: Option<i32>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub finish_time: chrono::DateTime<chrono::Utc>,
    pub target_branch_url: Option<Url>,
    /// Revision the codebase ended up at.
    pub revision: Option<String>,
    #[serde(default)]
    pub branches: Vec<ReportBranch>,
    #[serde(default)]
    pub tags: Vec<(String, String)>,
    /// Codemod output, passed through to the publisher templates.
    #[serde(default)]
    pub codemod: Option<serde_json::Value>,
    pub failure_details: Option<serde_json::Value>,
    #[serde(default)]
    pub failure_stage: Option<String>,
    pub transient: Option<bool>,
}

/// Result codes the ingestor accepts from workers.
pub const KNOWN_RESULT_CODES: &[&str] = &[
    "success",
    "success-unchanged",
    "nothing-to-do",
    "build-failed",
    "missing-dependency",
    "branch-unavailable",
    "worker-failure",
    "internal-error",
];

impl FinishReport {
    /// Whether the declared result code is in the known enum.
    pub fn code_known(&self) -> bool {
        KNOWN_RESULT_CODES.contains(&self.code.as_str())
    }
}

/// Capabilities a worker declares when asking for an assignment.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AssignRequest {
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Campaign filter; the worker only wants runs of this campaign.
    pub campaign: Option<String>,
    /// Link to the jenkins job executing this worker, if any.
    pub jenkins_link: Option<Url>,
}

/// Body of a heartbeat / log-append response.
///
/// `kill` tells the worker to abort the run on its next opportunity.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    pub kill: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_bundle_wire_format() {
        let bundle = AssignmentBundle {
            id: "01hgw27s1qmvp3z9e6e6p06g64".to_string(),
            campaign: "lintian-fixes".to_string(),
            codebase: "pkg-a".to_string(),
            branch: Branch {
                url: Some("https://example.com/pkg-a".parse().unwrap()),
                default_empty: false,
                subpath: None,
                vcs_type: VcsType::Git,
            },
            command: vec!["lintian-brush".to_string()],
            env: maplit::hashmap! {"CAMPAIGN".to_string() => "lintian-fixes".to_string()},
            build: serde_json::json!({}),
            target: Target {
                url_prefix: "https://runner.example.com/active-runs".to_string(),
                token: "secret".to_string(),
            },
            resume: None,
        };
        let js = serde_json::to_value(&bundle).unwrap();
        assert_eq!(js["branch"]["default-empty"], serde_json::json!(false));
        assert_eq!(js["branch"]["vcs_type"], serde_json::json!("git"));
        assert_eq!(js["resume"], serde_json::Value::Null);
        let round: AssignmentBundle = serde_json::from_value(js).unwrap();
        assert_eq!(round, bundle);
    }

    #[test]
    fn test_finish_report_defaults() {
        let report: FinishReport = serde_json::from_value(serde_json::json!({
            "code": "success",
            "description": "Applied fixes",
            "value": 10,
            "start_time": "2024-01-01T00:00:00Z",
            "finish_time": "2024-01-01T00:10:00Z",
            "target_branch_url": "https://example.com/pkg-a",
            "revision": "bbbb",
            "branches": [
                {"role": "main", "name": "lintian-fixes",
                 "base_revision": "aaaa", "revision": "bbbb"}
            ],
            "failure_details": null,
            "transient": null
        }))
        .unwrap();
        assert!(report.code_known());
        assert_eq!(report.branches.len(), 1);
        assert!(report.tags.is_empty());

        let bad: FinishReport = serde_json::from_value(serde_json::json!({
            "code": "made-up-code",
            "description": null,
            "value": null,
            "start_time": "2024-01-01T00:00:00Z",
            "finish_time": "2024-01-01T00:10:00Z",
            "target_branch_url": null,
            "revision": null,
            "failure_details": null,
            "transient": null
        }))
        .unwrap();
        assert!(!bad.code_known());
    }
}
