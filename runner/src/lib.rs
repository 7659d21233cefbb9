//! Runner crate for the Janitor project.
//!
//! The runner owns the queue front-end and the life-cycle of every active
//! run: it hands out assignments to workers, tracks their heartbeats,
//! ingests their results and feeds finished runs to the publisher.

use chrono::{DateTime, Utc};
use janitor::api::{AssignRequest, AssignmentBundle, Branch, FinishReport, ResumeBranch, Target};
use janitor::config::{Config, ConfigHandle};
use janitor::vcs::VcsType;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Module for worker authentication and security.
pub mod auth;
/// Module for database operations.
pub mod database;
/// Module for Prometheus metrics collection.
pub mod metrics;
/// Module for monitoring active runs.
pub mod watchdog;
/// Module for the web interface.
pub mod web;

pub use database::{AssignError, FinishError, RunnerDatabase};
pub use watchdog::{TerminationReason, Watchdog};

/// State machine position of an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Created by assign; the worker has not called back yet.
    Assigning,
    /// The worker is executing and heartbeating.
    Running,
    /// A result was posted and is being validated and persisted.
    Finishing,
}

/// A queue entry that has been assigned to a worker.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ActiveRun {
    /// Run id; doubles as the log id.
    pub id: String,
    pub queue_id: i32,
    pub codebase: String,
    pub suite: String,
    pub command: Option<String>,
    pub state: String,
    pub worker_name: String,
    pub worker_link: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_ping: Option<DateTime<Utc>>,
    pub log_position: i64,
    pub kill_requested: bool,
    #[serde(skip_serializing)]
    pub token: String,
}

impl ActiveRun {
    /// Introspection JSON; the upload token never leaves the process.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "queue_id": self.queue_id,
            "codebase": self.codebase,
            "campaign": self.suite,
            "command": self.command,
            "state": self.state,
            "worker": self.worker_name,
            "worker_link": self.worker_link,
            "start_time": self.start_time.to_rfc3339(),
            "last_ping": self.last_ping.map(|t| t.to_rfc3339()),
            "log_position": self.log_position,
            "kill_requested": self.kill_requested,
        })
    }
}

/// Generate environment variables for committing changes.
///
/// # Arguments
/// * `committer` - Optional committer string in the format "Name <email>"
pub fn committer_env(committer: Option<&str>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(committer) = committer {
        let (user, email) = parse_username(committer);
        if !user.is_empty() {
            env.insert("GIT_COMMITTER_NAME".to_string(), user.to_string());
            env.insert("GIT_AUTHOR_NAME".to_string(), user.to_string());
        }
        if !email.is_empty() {
            env.insert("GIT_COMMITTER_EMAIL".to_string(), email.to_string());
            env.insert("GIT_AUTHOR_EMAIL".to_string(), email.to_string());
            env.insert("EMAIL".to_string(), email.to_string());
        }
        env.insert("COMMITTER".to_string(), committer.to_string());
        env.insert("BRZ_EMAIL".to_string(), committer.to_string());
    }
    env
}

fn parse_username(committer: &str) -> (&str, &str) {
    match (committer.find('<'), committer.rfind('>')) {
        (Some(start), Some(end)) if start < end => (
            committer[..start].trim(),
            committer[start + 1..end].trim(),
        ),
        _ => (committer.trim(), ""),
    }
}

/// Shared state of the runner service.
pub struct AppState {
    pub database: Arc<RunnerDatabase>,
    pub config: ConfigHandle,
    pub log_manager: Box<dyn janitor::logs::LogFileManager>,
    pub artifact_manager: Box<dyn janitor::artifacts::ArtifactManager>,
    pub redis: Option<redis::aio::ConnectionManager>,
    /// Base URL handed to workers for uploads.
    pub external_url: url::Url,
    pub avoid_hosts: HashSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("nothing assignable")]
    Empty,
    #[error("codebase {0} has no branch URL")]
    MissingBranchUrl(String),
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

/// Campaigns whose requirements the declared capabilities satisfy.
///
/// Control runs (branch refreshes) have no requirements and are always
/// eligible.
pub fn eligible_campaigns(config: &Config, capabilities: &[String]) -> Vec<String> {
    let mut campaigns: Vec<String> = config
        .campaigns
        .iter()
        .filter(|campaign| {
            campaign
                .required_capabilities
                .iter()
                .all(|needed| capabilities.iter().any(|c| c == needed))
        })
        .map(|campaign| campaign.name.clone())
        .collect();
    campaigns.push("control".to_string());
    campaigns
}

impl AppState {
    /// Handle a worker's request for work.
    ///
    /// Returns None when nothing in the queue is assignable for this
    /// worker right now.
    pub async fn assign(
        &self,
        worker_name: &str,
        worker_link: Option<&str>,
        request: &AssignRequest,
    ) -> Result<Option<AssignmentBundle>, AssignmentError> {
        let config = self.config.get();
        let campaigns = eligible_campaigns(&config, &request.capabilities);
        if campaigns.is_empty() {
            return Ok(None);
        }

        let run_id = janitor::generate_run_id();
        let token = ulid::Ulid::new().to_string();

        let (item, vcs_info) = match self
            .database
            .assign_next(
                &run_id,
                worker_name,
                request
                    .jenkins_link
                    .as_ref()
                    .map(|u| u.as_str())
                    .or(worker_link),
                &token,
                &campaigns,
                request.campaign.as_deref(),
                &self.avoid_hosts,
                config.runner.codebase_cooldown,
            )
            .await
        {
            Ok(assigned) => assigned,
            Err(AssignError::Empty) => return Ok(None),
            Err(AssignError::Sql(e)) => return Err(e.into()),
        };

        metrics::ASSIGNMENT_COUNT.inc();

        let vcs_type = vcs_info
            .vcs_type
            .as_deref()
            .and_then(|v| v.parse::<VcsType>().ok())
            .unwrap_or(VcsType::Git);

        let campaign = config.get_campaign(&item.campaign);

        let command = item
            .command
            .clone()
            .or_else(|| campaign.map(|c| c.command.clone()))
            .unwrap_or_default();
        let mut argv = shlex::split(&command).unwrap_or_else(|| vec![command.clone()]);
        if let Some(context) = item.context.as_deref() {
            argv = argv
                .into_iter()
                .map(|arg| arg.replace("$CONTEXT", context))
                .collect();
        }

        let mut env = committer_env(config.committer.as_deref());
        env.insert("CAMPAIGN".to_string(), item.campaign.clone());
        env.insert("CODEBASE".to_string(), item.codebase.clone());
        if let Some(context) = item.context.as_deref() {
            env.insert("CONTEXT".to_string(), context.to_string());
        }

        let resume = if item.refresh {
            None
        } else {
            match self
                .database
                .get_resume_run(&item.codebase, &item.campaign)
                .await?
            {
                Some((_resume_id, Some(branch_url), result)) => branch_url
                    .parse()
                    .ok()
                    .map(|branch_url| ResumeBranch { branch_url, result }),
                _ => None,
            }
        };

        log::info!(
            "Assigned queue item {} ({}/{}) to worker {} as run {}",
            item.id,
            item.codebase,
            item.campaign,
            worker_name,
            run_id
        );

        Ok(Some(AssignmentBundle {
            id: run_id,
            campaign: item.campaign.clone(),
            codebase: item.codebase.clone(),
            branch: Branch {
                url: vcs_info.branch_url.as_deref().and_then(|u| u.parse().ok()),
                default_empty: vcs_info.branch_url.is_none(),
                subpath: vcs_info.subpath.clone(),
                vcs_type,
            },
            command: argv,
            env,
            build: campaign
                .map(|c| c.build.clone())
                .unwrap_or(serde_json::Value::Null),
            target: Target {
                url_prefix: self
                    .external_url
                    .join("active-runs")
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| self.external_url.to_string()),
                token,
            },
            resume,
        }))
    }

    /// Validate and persist a worker-submitted result.
    ///
    /// Commits the run, its branch results and the queue-entry deletion in
    /// one transaction, then emits a `run-finished` event.
    pub async fn finish_run(
        &self,
        run_id: &str,
        worker_name: &str,
        report: &FinishReport,
        files: Vec<(String, Vec<u8>)>,
    ) -> janitor::error::Result<serde_json::Value> {
        use janitor::error::JanitorError;

        if !report.code_known() {
            return Err(JanitorError::validation(format!(
                "unknown result code: {}",
                report.code
            )));
        }

        let active = match self.database.start_finishing(run_id).await {
            Ok(active) => active,
            Err(FinishError::NoSuchRun(id)) => {
                return Err(JanitorError::not_found("active run", id))
            }
            Err(FinishError::AlreadyFinished(id)) => {
                return Err(JanitorError::conflict(format!(
                    "run {} already finished",
                    id
                )))
            }
            Err(FinishError::Sql(e)) => return Err(e.into()),
        };

        if active.worker_name != worker_name {
            self.database.abort_finishing(run_id).await?;
            return Err(JanitorError::conflict(format!(
                "run {} belongs to worker {}",
                run_id, active.worker_name
            )));
        }

        if let Err(e) = self.validate_report(&active, report).await {
            self.database.abort_finishing(run_id).await?;
            return Err(e);
        }

        let mut logfilenames = vec![];
        let mut artifact_names = vec![];
        for (name, content) in files {
            if janitor::logs::is_log_filename(&name) {
                if let Err(e) = self
                    .log_manager
                    .import_log(&active.codebase, run_id, &name, &content)
                    .await
                {
                    log::error!("Failed to import log {} for {}: {}", name, run_id, e);
                } else {
                    logfilenames.push(name);
                }
            } else {
                match self.artifact_manager.store_artifact(run_id, &name, &content).await {
                    Ok(hash) => {
                        log::debug!("Stored artifact {} for {} ({})", name, run_id, hash);
                        artifact_names.push(name);
                    }
                    Err(e) => {
                        log::error!("Failed to store artifact {} for {}: {}", name, run_id, e);
                    }
                }
            }
        }

        if let Err(e) = self
            .database
            .persist_finished_run(&active, report, &logfilenames)
            .await
        {
            self.database.abort_finishing(run_id).await?;
            return Err(match e {
                FinishError::Sql(e) => e.into(),
                other => JanitorError::internal(other.to_string()),
            });
        }

        metrics::FINISH_COUNT.with_label_values(&[&report.code]).inc();

        self.publish_run_finished(&active, report).await;

        Ok(serde_json::json!({
            "id": run_id,
            "filenames": logfilenames.iter().chain(artifact_names.iter()).collect::<Vec<_>>(),
            "result": {
                "code": report.code,
                "description": report.description,
            },
        }))
    }

    async fn validate_report(
        &self,
        active: &ActiveRun,
        report: &FinishReport,
    ) -> janitor::error::Result<()> {
        use janitor::error::JanitorError;

        let codebase = janitor::state::get_codebase(self.database.pool(), &active.codebase)
            .await?
            .ok_or_else(|| JanitorError::not_found("codebase", active.codebase.clone()))?;
        let vcs_type = codebase
            .vcs_type
            .as_deref()
            .and_then(|v| v.parse::<VcsType>().ok())
            .unwrap_or(VcsType::Git);
        let backend = janitor::vcs::get_backend(vcs_type);

        for branch in &report.branches {
            for revision in [branch.base_revision.as_deref(), branch.revision.as_deref()]
                .into_iter()
                .flatten()
            {
                if !backend.revision_valid(revision) {
                    return Err(JanitorError::validation(format!(
                        "invalid {} revision for role {}: {}",
                        vcs_type, branch.role, revision
                    )));
                }
            }
        }

        if report.code == "success"
            && !report
                .branches
                .iter()
                .any(|branch| branch.revision.is_some())
        {
            return Err(JanitorError::validation(
                "successful run without a proposed revision".to_string(),
            ));
        }

        Ok(())
    }

    async fn publish_run_finished(&self, active: &ActiveRun, report: &FinishReport) {
        let Some(mut redis) = self.redis.clone() else {
            return;
        };
        let payload = serde_json::json!({
            "id": active.id,
            "codebase": active.codebase,
            "campaign": active.suite,
            "result_code": report.code,
        });
        use redis::AsyncCommands;
        let result: Result<(), redis::RedisError> =
            redis.publish("runner", payload.to_string()).await;
        if let Err(e) = result {
            log::warn!("Failed to publish run-finished event for {}: {}", active.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use janitor::config::Campaign;
    use janitor::publish::Mode;

    fn campaign(name: &str, caps: &[&str]) -> Campaign {
        Campaign {
            name: name.to_string(),
            command: "do-thing".to_string(),
            branch_name: None,
            default_mode: Mode::Propose,
            publish: vec![],
            rate_limit_bucket: None,
            run_timeout: None,
            required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
            merge_proposal: Default::default(),
            build: serde_json::Value::Null,
        }
    }

    fn config_with_campaigns(campaigns: Vec<Campaign>) -> Config {
        let mut config: Config = toml::from_str(
            r#"
[database]
url = "postgresql://localhost/janitor"
"#,
        )
        .unwrap();
        config.campaigns = campaigns;
        config
    }

    #[test]
    fn test_committer_env() {
        let env = committer_env(Some("John Doe <john@example.com>"));
        assert_eq!(env.get("GIT_COMMITTER_NAME"), Some(&"John Doe".to_string()));
        assert_eq!(
            env.get("GIT_COMMITTER_EMAIL"),
            Some(&"john@example.com".to_string())
        );
        assert_eq!(env.get("EMAIL"), Some(&"john@example.com".to_string()));
        assert_eq!(
            env.get("COMMITTER"),
            Some(&"John Doe <john@example.com>".to_string())
        );

        assert!(committer_env(None).is_empty());

        let env = committer_env(Some("invalid"));
        assert_eq!(env.get("COMMITTER"), Some(&"invalid".to_string()));
        assert!(env.get("EMAIL").is_none());
    }

    #[test]
    fn test_eligible_campaigns_filters_on_capabilities() {
        let config = config_with_campaigns(vec![
            campaign("lintian-fixes", &["debian"]),
            campaign("fresh-releases", &[]),
        ]);

        let eligible = eligible_campaigns(&config, &["debian".to_string()]);
        assert_eq!(eligible, vec!["lintian-fixes", "fresh-releases", "control"]);

        // Control runs stay eligible regardless of capabilities.
        let eligible = eligible_campaigns(&config, &[]);
        assert_eq!(eligible, vec!["fresh-releases", "control"]);
    }

    #[test]
    fn test_active_run_json_hides_token() {
        let run = ActiveRun {
            id: "01hgw27s1qmvp3z9e6e6p06g64".to_string(),
            queue_id: 1,
            codebase: "pkg-a".to_string(),
            suite: "lintian-fixes".to_string(),
            command: Some("lintian-brush".to_string()),
            state: "running".to_string(),
            worker_name: "worker-1".to_string(),
            worker_link: None,
            start_time: Utc::now(),
            last_ping: None,
            log_position: 0,
            kill_requested: false,
            token: "secret".to_string(),
        };
        let js = run.to_json();
        assert_eq!(js["campaign"], "lintian-fixes");
        assert!(js.get("token").is_none());
        assert!(!js.to_string().contains("secret"));
    }
}
