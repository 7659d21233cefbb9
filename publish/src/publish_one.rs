//! Publication of a single result branch.
//!
//! The caller has already resolved the mode and acquired the distributed
//! lock; this module does the forge and VCS legwork.

use crate::forge::{self, ForgeError, ProposalRequest};
use crate::state::{PublishReadyRun, UnpublishedBranch};
use crate::{AppState, PublishError};
use janitor::publish::Mode;
use janitor::vcs::{self, VcsType};
use url::Url;

/// Result of a publish operation.
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone)]
pub struct PublishOneResult {
    /// The URL of the created merge proposal, if any.
    pub proposal_url: Option<Url>,
    /// The web URL of the created merge proposal, if any.
    pub proposal_web_url: Option<Url>,
    /// Whether the merge proposal is new.
    pub is_new: Option<bool>,
    /// The name of the branch.
    pub branch_name: Option<String>,
    /// The URL of the target branch.
    pub target_branch_url: Url,
    /// The mode the publish ended up using.
    pub mode: Mode,
    /// Human-readable summary.
    pub description: Option<String>,
}

/// The derived branch name for a campaign role.
pub fn derived_branch_name(
    campaign_config: &janitor::config::Campaign,
    role: &str,
    remote_name: Option<&str>,
) -> String {
    if let Some(remote_name) = remote_name {
        return remote_name.to_string();
    }
    let base = campaign_config
        .branch_name
        .as_deref()
        .unwrap_or(&campaign_config.name);
    if role == "main" {
        base.to_string()
    } else {
        format!("{}/{}", base, role)
    }
}

/// Stable footer appended to every proposal body; the scanner relies on it
/// to associate forge-side proposals with runs.
pub fn proposal_footer(external_url: Option<&Url>, run_id: &str) -> String {
    let mut footer = String::from("\n--\n");
    if let Some(external_url) = external_url {
        footer.push_str(&format!(
            "This merge proposal was created automatically ({}).\n",
            external_url
        ));
    } else {
        footer.push_str("This merge proposal was created automatically.\n");
    }
    footer.push_str(&format!("Janitor run id: {}\n", run_id));
    footer
}

/// Run id recovered from a proposal body, if the footer is present.
pub fn run_id_from_body(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.strip_prefix("Janitor run id: "))
        .map(str::trim)
}

fn render_template(
    template: Option<&str>,
    template_env_path: Option<&str>,
    default: &str,
    context: &serde_json::Value,
) -> Result<String, PublishError> {
    let mut env = minijinja::Environment::new();
    if let Some(path) = template_env_path {
        env.set_loader(minijinja::path_loader(path));
    }
    let rendered = match (template, template_env_path) {
        (Some(name), Some(_)) => env
            .get_template(name)
            .and_then(|t| t.render(context)),
        (Some(inline), None) => env.render_str(inline, context),
        _ => env.render_str(default, context),
    };
    rendered.map_err(|e| PublishError::Failure {
        code: "template-error".to_string(),
        description: e.to_string(),
    })
}

/// Publish one branch according to `mode`.
pub async fn publish_one(
    state: &AppState,
    ready: &PublishReadyRun,
    campaign_config: &janitor::config::Campaign,
    branch: &UnpublishedBranch,
    mode: Mode,
) -> Result<PublishOneResult, PublishError> {
    let run = &ready.run;
    let revision = branch
        .revision
        .as_deref()
        .ok_or_else(|| PublishError::NothingToDo("branch has no revision".to_string()))?;

    let target_branch_url: Url = run
        .target_branch_url
        .as_deref()
        .or(run.branch_url.as_deref())
        .and_then(|u| u.parse().ok())
        .ok_or_else(|| PublishError::NothingToDo("run has no target branch URL".to_string()))?;

    let config = state.config.get();

    let vcs_type = run
        .vcs_type
        .as_deref()
        .and_then(|v| v.parse::<VcsType>().ok())
        .unwrap_or(VcsType::Git);
    let backend = vcs::get_backend(vcs_type);

    let source_url: Url = config
        .vcs
        .location
        .as_ref()
        .and_then(|base| base.join(&run.codebase).ok())
        .or_else(|| run.branch_url.as_deref().and_then(|u| u.parse().ok()))
        .ok_or_else(|| PublishError::Failure {
            code: "no-source-branch".to_string(),
            description: format!("no result branch location for {}", run.codebase),
        })?;

    let branch_name = derived_branch_name(campaign_config, &branch.role, branch.remote_name.as_deref());

    if branch.base_revision.as_deref() == branch.revision.as_deref() {
        return Err(PublishError::NothingToDo(
            "resulting branch is unchanged".to_string(),
        ));
    }

    // Idempotence: a successful publish of this exact revision is a no-op.
    let absorbing_modes: &[Mode] = match mode {
        Mode::Propose | Mode::AttemptPush => &[Mode::Propose, Mode::Push, Mode::AttemptPush],
        Mode::Push => &[Mode::Push],
        Mode::PushDerived => &[Mode::PushDerived],
        _ => &[],
    };
    if crate::state::already_published(
        &state.conn,
        &target_branch_url,
        &branch_name,
        revision,
        absorbing_modes,
    )
    .await
    .map_err(|e| PublishError::Failure {
        code: "database-error".to_string(),
        description: e.to_string(),
    })? {
        return Err(PublishError::NothingToDo(format!(
            "{} was already published to {}",
            revision, target_branch_url
        )));
    }

    match mode {
        Mode::Skip | Mode::BuildOnly => Err(PublishError::NothingToDo(format!(
            "publish mode is {}",
            mode
        ))),
        Mode::Push | Mode::PushDerived | Mode::AttemptPush => {
            let (push_target_branch, force) = match mode {
                Mode::PushDerived => (Some(branch_name.as_str()), true),
                _ => (None, false),
            };
            match push_branch(
                backend.as_ref(),
                &source_url,
                &target_branch_url,
                revision,
                push_target_branch,
                force,
            )
            .await
            {
                Ok(()) => Ok(PublishOneResult {
                    proposal_url: None,
                    proposal_web_url: None,
                    is_new: None,
                    branch_name: Some(branch_name.clone()),
                    target_branch_url,
                    mode: if mode == Mode::PushDerived {
                        Mode::PushDerived
                    } else {
                        Mode::Push
                    },
                    description: Some(if mode == Mode::PushDerived {
                        format!("pushed derived branch {}", branch_name)
                    } else {
                        "pushed to upstream branch".to_string()
                    }),
                }),
                Err(PublishError::Failure { code, .. }) if push_escalates_to_propose(&code) => {
                    log::info!(
                        "Push to {} not permitted, falling back to propose",
                        target_branch_url
                    );
                    propose(
                        state,
                        ready,
                        campaign_config,
                        branch,
                        backend.as_ref(),
                        &source_url,
                        target_branch_url,
                        &branch_name,
                        revision,
                    )
                    .await
                }
                Err(e) => Err(e),
            }
        }
        Mode::Propose => {
            propose(
                state,
                ready,
                campaign_config,
                branch,
                backend.as_ref(),
                &source_url,
                target_branch_url,
                &branch_name,
                revision,
            )
            .await
        }
    }
}

/// Whether a failed push falls back to opening a proposal.
///
/// Auth failures escalate for every push mode; everything else surfaces
/// to the caller.
pub fn push_escalates_to_propose(code: &str) -> bool {
    code == "push-denied"
}

async fn push_branch(
    backend: &dyn vcs::VcsBackend,
    source: &Url,
    target: &Url,
    revision: &str,
    branch_name: Option<&str>,
    force: bool,
) -> Result<(), PublishError> {
    backend
        .push(source, target, revision, branch_name, force)
        .await
        .map_err(|e| match e {
            vcs::Error::PermissionDenied(_) => PublishError::Failure {
                code: "push-denied".to_string(),
                description: e.to_string(),
            },
            vcs::Error::BranchMissing(_) => PublishError::Failure {
                code: "branch-unavailable".to_string(),
                description: e.to_string(),
            },
            vcs::Error::Diverged(_) => PublishError::Failure {
                code: "diverged".to_string(),
                description: e.to_string(),
            },
            other => PublishError::Failure {
                code: "push-failed".to_string(),
                description: other.to_string(),
            },
        })
}

#[allow(clippy::too_many_arguments)]
async fn propose(
    state: &AppState,
    ready: &PublishReadyRun,
    campaign_config: &janitor::config::Campaign,
    branch: &UnpublishedBranch,
    backend: &dyn vcs::VcsBackend,
    source_url: &Url,
    target_branch_url: Url,
    branch_name: &str,
    revision: &str,
) -> Result<PublishOneResult, PublishError> {
    let run = &ready.run;
    let config = state.config.get();
    let forge = forge::get_forge(&config, &target_branch_url).map_err(forge_failure)?;

    // The proposal branch lives in the target repository; keep it current.
    push_branch(
        backend,
        source_url,
        &target_branch_url,
        revision,
        Some(branch_name),
        true,
    )
    .await?;

    let context = serde_json::json!({
        "codebase": run.codebase,
        "campaign": run.suite,
        "role": branch.role,
        "codemod": run.result,
        "description": run.description,
    });
    let template_env_path = config.publisher.template_env_path.as_deref();
    let title = render_template(
        campaign_config.merge_proposal.title_template.as_deref(),
        template_env_path,
        "{{ campaign }}: automated changes for {{ codebase }}",
        &context,
    )?;
    let mut body = render_template(
        campaign_config.merge_proposal.body_template.as_deref(),
        template_env_path,
        "{{ description or 'Automated changes.' }}",
        &context,
    )?;
    body.push_str(&proposal_footer(config.external_url.as_ref(), &run.id));

    let request = ProposalRequest {
        source_branch: branch_name.to_string(),
        target_branch: None,
        title: title.trim().to_string(),
        body,
        labels: campaign_config.merge_proposal.labels.clone(),
    };

    let existing = forge
        .find_open_proposal(&target_branch_url, branch_name)
        .await
        .map_err(forge_failure)?;

    let (info, is_new) = match existing {
        Some(existing) => {
            let info = forge
                .update_proposal(&existing.url, &request)
                .await
                .map_err(forge_failure)?;
            (info, false)
        }
        None => {
            let info = forge
                .create_proposal(&target_branch_url, &request)
                .await
                .map_err(|e| match e {
                    ForgeError::RateLimited { retry_after } => {
                        if let (Some(retry_after), Some(host)) =
                            (retry_after, target_branch_url.host_str())
                        {
                            state.set_forge_backoff(host, retry_after);
                        }
                        PublishError::BranchRateLimited {
                            bucket: target_branch_url
                                .host_str()
                                .unwrap_or("forge")
                                .to_string(),
                            retry_after,
                        }
                    }
                    other => forge_failure(other),
                })?;
            (info, true)
        }
    };

    Ok(PublishOneResult {
        proposal_url: Some(info.url.clone()),
        proposal_web_url: info.web_url.clone(),
        is_new: Some(is_new),
        branch_name: Some(branch_name.to_string()),
        target_branch_url,
        mode: Mode::Propose,
        description: Some(if is_new {
            format!("opened merge proposal {}", info.url)
        } else {
            format!("updated merge proposal {}", info.url)
        }),
    })
}

fn forge_failure(e: ForgeError) -> PublishError {
    let code = match &e {
        ForgeError::LoginRequired => "forge-login-required",
        ForgeError::NotFound(_) => "forge-not-found",
        ForgeError::Transient(_) => "forge-transient-error",
        ForgeError::RateLimited { .. } => "forge-rate-limited",
        ForgeError::Permanent(_) => "forge-error",
        ForgeError::UnsupportedUrl(_) => "unsupported-forge",
    };
    PublishError::Failure {
        code: code.to_string(),
        description: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign() -> janitor::config::Campaign {
        toml::from_str(
            r#"
name = "lintian-fixes"
command = "lintian-brush"
branch_name = "lintian-fixes"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_derived_branch_name() {
        let campaign = campaign();
        assert_eq!(derived_branch_name(&campaign, "main", None), "lintian-fixes");
        assert_eq!(
            derived_branch_name(&campaign, "pristine-tar", None),
            "lintian-fixes/pristine-tar"
        );
        assert_eq!(
            derived_branch_name(&campaign, "main", Some("custom")),
            "custom"
        );
    }

    #[test]
    fn test_proposal_footer_round_trip() {
        let footer = proposal_footer(None, "01hgw27s1qmvp3z9e6e6p06g64");
        assert!(footer.contains("Janitor run id: 01hgw27s1qmvp3z9e6e6p06g64"));
        let body = format!("Fixed some lintian tags.\n{}", footer);
        assert_eq!(run_id_from_body(&body), Some("01hgw27s1qmvp3z9e6e6p06g64"));
        assert_eq!(run_id_from_body("no footer here"), None);
    }

    #[test]
    fn test_render_template_inline() {
        let rendered = render_template(
            Some("{{ campaign }} for {{ codebase }}"),
            None,
            "unused",
            &serde_json::json!({"campaign": "lintian-fixes", "codebase": "pkg-a"}),
        )
        .unwrap();
        assert_eq!(rendered, "lintian-fixes for pkg-a");
    }

    #[test]
    fn test_render_template_default() {
        let rendered = render_template(
            None,
            None,
            "{{ campaign }}: automated changes for {{ codebase }}",
            &serde_json::json!({"campaign": "lintian-fixes", "codebase": "pkg-a"}),
        )
        .unwrap();
        assert_eq!(rendered, "lintian-fixes: automated changes for pkg-a");
    }

    struct DeniedBackend;

    #[async_trait::async_trait]
    impl vcs::VcsBackend for DeniedBackend {
        fn vcs_type(&self) -> VcsType {
            VcsType::Git
        }

        fn revision_valid(&self, _revision: &str) -> bool {
            true
        }

        async fn push(
            &self,
            _source: &Url,
            target: &Url,
            _revision: &str,
            _branch_name: Option<&str>,
            _force: bool,
        ) -> Result<(), vcs::Error> {
            Err(vcs::Error::PermissionDenied(target.clone()))
        }
    }

    #[tokio::test]
    async fn test_push_auth_failure_escalates() {
        let target: Url = "https://example.com/pkg-a".parse().unwrap();
        let err = push_branch(
            &DeniedBackend,
            &"https://vcs.example.com/pkg-a".parse().unwrap(),
            &target,
            &"b".repeat(40),
            None,
            false,
        )
        .await
        .unwrap_err();
        // An auth failure maps to push-denied, which every push mode
        // escalates to propose.
        match err {
            PublishError::Failure { code, .. } => {
                assert_eq!(code, "push-denied");
                assert!(push_escalates_to_propose(&code));
            }
            other => panic!("expected push-denied failure, got {}", other),
        }
    }

    #[test]
    fn test_other_push_failures_surface() {
        assert!(!push_escalates_to_propose("diverged"));
        assert!(!push_escalates_to_propose("branch-unavailable"));
        assert!(!push_escalates_to_propose("push-failed"));
    }
}
