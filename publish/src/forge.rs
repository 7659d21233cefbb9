//! Forge capability interface.
//!
//! Merge proposals are created and tracked through this trait. The set of
//! implementations is closed (GitHub and GitLab REST clients) and the
//! client for a host is selected at config load; there is no runtime
//! plugin discovery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use janitor::config::{Config, ForgeConfig, ForgeKind};
use janitor::publish::MergeProposalStatus;
use url::Url;

const FORGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Errors talking to a forge, classified for retry behaviour.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// The forge asked us to slow down.
    #[error("forge rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.num_seconds())).unwrap_or_default())]
    RateLimited {
        retry_after: Option<chrono::Duration>,
    },
    /// Authoritative negative response; do not retry.
    #[error("permanent forge error: {0}")]
    Permanent(String),
    /// Network or forge flake; retry with backoff.
    #[error("transient forge error: {0}")]
    Transient(String),
    /// Credentials missing or revoked.
    #[error("forge login required")]
    LoginRequired,
    /// The proposal or repository does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The URL does not belong to a repository on this forge.
    #[error("unsupported URL: {0}")]
    UnsupportedUrl(Url),
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ForgeError::Transient(e.to_string())
        } else {
            ForgeError::Permanent(e.to_string())
        }
    }
}

/// What to open or update a proposal with.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    /// Branch in the repository holding the proposed changes.
    pub source_branch: String,
    /// Branch the proposal targets; forge default when None.
    pub target_branch: Option<String>,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Forge-side state of a proposal, as last observed.
#[derive(Debug, Clone)]
pub struct ProposalInfo {
    /// Canonical URL; the local mirror key.
    pub url: Url,
    pub web_url: Option<Url>,
    pub status: MergeProposalStatus,
    pub merged_by: Option<String>,
    pub merged_at: Option<DateTime<Utc>>,
    /// Head of the source branch.
    pub revision: Option<String>,
    /// Head of the target branch, for rebase detection.
    pub target_head: Option<String>,
    /// Base the proposal was created against.
    pub base_revision: Option<String>,
}

impl ProposalInfo {
    /// Whether the target branch advanced past the proposal's base.
    pub fn needs_rebase(&self) -> bool {
        match (&self.base_revision, &self.target_head) {
            (Some(base), Some(head)) => base != head,
            _ => false,
        }
    }
}

/// Narrow interface over a code-hosting service.
#[async_trait]
pub trait Forge: Send + Sync {
    fn kind(&self) -> &'static str;

    fn host(&self) -> &str;

    /// Open a proposal merging `source_branch` into the target branch of
    /// the repository at `target_branch_url`.
    async fn create_proposal(
        &self,
        target_branch_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError>;

    /// Update the title/body of an existing proposal.
    async fn update_proposal(
        &self,
        proposal_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError>;

    /// Current state of a proposal.
    async fn get_proposal(&self, proposal_url: &Url) -> Result<ProposalInfo, ForgeError>;

    /// Find an open proposal from `source_branch` against the repository,
    /// if one exists.
    async fn find_open_proposal(
        &self,
        target_branch_url: &Url,
        source_branch: &str,
    ) -> Result<Option<ProposalInfo>, ForgeError>;

    /// Close a proposal without merging it.
    async fn close_proposal(&self, proposal_url: &Url) -> Result<(), ForgeError>;
}

/// Select the forge client covering a URL's host.
pub fn get_forge(config: &Config, url: &Url) -> Result<Box<dyn Forge>, ForgeError> {
    let host = url
        .host_str()
        .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
    let entry = config
        .get_forge(host)
        .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
    Ok(from_config(entry))
}

/// Instantiate the client for a config entry.
pub fn from_config(entry: &ForgeConfig) -> Box<dyn Forge> {
    let token = entry
        .token_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    match entry.kind {
        ForgeKind::Github => Box::new(GitHubForge::new(
            entry.host.clone(),
            entry.api_base.clone(),
            token,
        )),
        ForgeKind::Gitlab => Box::new(GitLabForge::new(
            entry.host.clone(),
            entry.api_base.clone(),
            token,
        )),
    }
}

fn check_response(response: &reqwest::Response) -> Result<(), ForgeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(chrono::Duration::seconds);
    match status.as_u16() {
        401 => Err(ForgeError::LoginRequired),
        403 | 429 if retry_after.is_some() || status.as_u16() == 429 => {
            Err(ForgeError::RateLimited { retry_after })
        }
        403 => Err(ForgeError::Permanent("forbidden".to_string())),
        404 | 410 => Err(ForgeError::NotFound(status.to_string())),
        500..=599 => Err(ForgeError::Transient(format!("server error: {}", status))),
        _ => Err(ForgeError::Permanent(format!(
            "unexpected status: {}",
            status
        ))),
    }
}

/// owner/repo from a branch URL path.
fn github_repo_path(url: &Url) -> Result<(String, String), ForgeError> {
    let mut segments = url
        .path_segments()
        .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
    let owner = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
    let repo = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
    Ok((
        owner.to_string(),
        repo.trim_end_matches(".git").to_string(),
    ))
}

/// GitHub REST client.
pub struct GitHubForge {
    host: String,
    api_base: Url,
    client: reqwest::Client,
}

impl GitHubForge {
    pub fn new(host: String, api_base: Option<Url>, token: Option<String>) -> Self {
        let api_base = api_base.unwrap_or_else(|| {
            format!("https://api.{}/", host)
                .parse()
                .expect("valid api URL")
        });
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            "application/vnd.github+json".parse().expect("valid header"),
        );
        if let Some(token) = token {
            if let Ok(mut value) =
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
            {
                value.set_sensitive(true);
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent("janitor-publish")
            .default_headers(headers)
            .timeout(FORGE_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            host,
            api_base,
            client,
        }
    }

    fn api_url(&self, path: &str) -> Result<Url, ForgeError> {
        self.api_base
            .join(path)
            .map_err(|_| ForgeError::Permanent(format!("bad api path: {}", path)))
    }

    /// (owner, repo, number) from a pull request web URL.
    fn parse_proposal_url(&self, url: &Url) -> Result<(String, String, u64), ForgeError> {
        let segments: Vec<_> = url
            .path_segments()
            .map(|s| s.collect::<Vec<_>>())
            .unwrap_or_default();
        match segments.as_slice() {
            [owner, repo, "pull", number] => Ok((
                owner.to_string(),
                repo.to_string(),
                number
                    .parse()
                    .map_err(|_| ForgeError::UnsupportedUrl(url.clone()))?,
            )),
            _ => Err(ForgeError::UnsupportedUrl(url.clone())),
        }
    }

    fn proposal_from_json(&self, value: &serde_json::Value) -> Result<ProposalInfo, ForgeError> {
        let web_url: Url = value["html_url"]
            .as_str()
            .and_then(|u| u.parse().ok())
            .ok_or_else(|| ForgeError::Permanent("proposal without html_url".to_string()))?;
        let status = if value["merged_at"].is_string() {
            MergeProposalStatus::Merged
        } else {
            match value["state"].as_str() {
                Some("open") => MergeProposalStatus::Open,
                Some("closed") => MergeProposalStatus::Closed,
                _ => MergeProposalStatus::Open,
            }
        };
        Ok(ProposalInfo {
            url: web_url.clone(),
            web_url: Some(web_url),
            status,
            merged_by: value["merged_by"]["login"].as_str().map(|s| s.to_string()),
            merged_at: value["merged_at"]
                .as_str()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
            revision: value["head"]["sha"].as_str().map(|s| s.to_string()),
            target_head: None,
            base_revision: value["base"]["sha"].as_str().map(|s| s.to_string()),
        })
    }

    async fn branch_head(&self, owner: &str, repo: &str, branch: &str) -> Result<Option<String>, ForgeError> {
        let url = self.api_url(&format!("repos/{}/{}/branches/{}", owner, repo, branch))?;
        let response = self.client.get(url).send().await?;
        match check_response(&response) {
            Ok(()) => {
                let value: serde_json::Value = response.json().await?;
                Ok(value["commit"]["sha"].as_str().map(|s| s.to_string()))
            }
            Err(ForgeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Forge for GitHubForge {
    fn kind(&self) -> &'static str {
        "github"
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn create_proposal(
        &self,
        target_branch_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError> {
        let (owner, repo) = github_repo_path(target_branch_url)?;
        let url = self.api_url(&format!("repos/{}/{}/pulls", owner, repo))?;
        let mut body = serde_json::json!({
            "title": request.title,
            "body": request.body,
            "head": request.source_branch,
        });
        if let Some(target_branch) = &request.target_branch {
            body["base"] = serde_json::json!(target_branch);
        } else {
            // The pulls API requires an explicit base.
            let repo_url = self.api_url(&format!("repos/{}/{}", owner, repo))?;
            let response = self.client.get(repo_url).send().await?;
            check_response(&response)?;
            let value: serde_json::Value = response.json().await?;
            body["base"] = value["default_branch"].clone();
        }
        let response = self.client.post(url).json(&body).send().await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        let mut info = self.proposal_from_json(&value)?;
        if !request.labels.is_empty() {
            let number = value["number"].as_u64().unwrap_or_default();
            let url =
                self.api_url(&format!("repos/{}/{}/issues/{}/labels", owner, repo, number))?;
            let response = self
                .client
                .post(url)
                .json(&serde_json::json!({"labels": request.labels}))
                .send()
                .await?;
            if let Err(e) = check_response(&response) {
                log::warn!("Failed to label proposal {}: {}", info.url, e);
            }
        }
        info.target_head = info.base_revision.clone();
        Ok(info)
    }

    async fn update_proposal(
        &self,
        proposal_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError> {
        let (owner, repo, number) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("repos/{}/{}/pulls/{}", owner, repo, number))?;
        let response = self
            .client
            .patch(url)
            .json(&serde_json::json!({
                "title": request.title,
                "body": request.body,
            }))
            .send()
            .await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        self.proposal_from_json(&value)
    }

    async fn get_proposal(&self, proposal_url: &Url) -> Result<ProposalInfo, ForgeError> {
        let (owner, repo, number) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("repos/{}/{}/pulls/{}", owner, repo, number))?;
        let response = self.client.get(url).send().await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        let mut info = self.proposal_from_json(&value)?;
        if let Some(base_ref) = value["base"]["ref"].as_str() {
            info.target_head = self.branch_head(&owner, &repo, base_ref).await?;
        }
        Ok(info)
    }

    async fn find_open_proposal(
        &self,
        target_branch_url: &Url,
        source_branch: &str,
    ) -> Result<Option<ProposalInfo>, ForgeError> {
        let (owner, repo) = github_repo_path(target_branch_url)?;
        let url = self.api_url(&format!(
            "repos/{}/{}/pulls?state=open&head={}:{}",
            owner, repo, owner, source_branch
        ))?;
        let response = self.client.get(url).send().await?;
        check_response(&response)?;
        let values: Vec<serde_json::Value> = response.json().await?;
        values
            .first()
            .map(|value| self.proposal_from_json(value))
            .transpose()
    }

    async fn close_proposal(&self, proposal_url: &Url) -> Result<(), ForgeError> {
        let (owner, repo, number) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("repos/{}/{}/pulls/{}", owner, repo, number))?;
        let response = self
            .client
            .patch(url)
            .json(&serde_json::json!({"state": "closed"}))
            .send()
            .await?;
        check_response(&response)
    }
}

/// GitLab REST client.
pub struct GitLabForge {
    host: String,
    api_base: Url,
    client: reqwest::Client,
}

impl GitLabForge {
    pub fn new(host: String, api_base: Option<Url>, token: Option<String>) -> Self {
        let api_base = api_base.unwrap_or_else(|| {
            format!("https://{}/api/v4/", host)
                .parse()
                .expect("valid api URL")
        });
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            if let Ok(mut value) = reqwest::header::HeaderValue::from_str(&token) {
                value.set_sensitive(true);
                headers.insert("PRIVATE-TOKEN", value);
            }
        }
        let client = reqwest::Client::builder()
            .user_agent("janitor-publish")
            .default_headers(headers)
            .timeout(FORGE_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            host,
            api_base,
            client,
        }
    }

    fn api_url(&self, path: &str) -> Result<Url, ForgeError> {
        self.api_base
            .join(path)
            .map_err(|_| ForgeError::Permanent(format!("bad api path: {}", path)))
    }

    fn project_id(&self, url: &Url) -> Result<String, ForgeError> {
        let path = url.path().trim_matches('/').trim_end_matches(".git");
        if path.is_empty() {
            return Err(ForgeError::UnsupportedUrl(url.clone()));
        }
        Ok(
            percent_encoding::utf8_percent_encode(path, percent_encoding::NON_ALPHANUMERIC)
                .to_string(),
        )
    }

    /// (project path, iid) from a merge request web URL.
    fn parse_proposal_url(&self, url: &Url) -> Result<(String, u64), ForgeError> {
        let path = url.path();
        let (project, iid) = path
            .split_once("/-/merge_requests/")
            .ok_or_else(|| ForgeError::UnsupportedUrl(url.clone()))?;
        Ok((
            percent_encoding::utf8_percent_encode(
                project.trim_matches('/'),
                percent_encoding::NON_ALPHANUMERIC,
            )
            .to_string(),
            iid.trim_matches('/')
                .parse()
                .map_err(|_| ForgeError::UnsupportedUrl(url.clone()))?,
        ))
    }

    fn proposal_from_json(&self, value: &serde_json::Value) -> Result<ProposalInfo, ForgeError> {
        let web_url: Url = value["web_url"]
            .as_str()
            .and_then(|u| u.parse().ok())
            .ok_or_else(|| ForgeError::Permanent("proposal without web_url".to_string()))?;
        let status = match value["state"].as_str() {
            Some("opened") | Some("locked") => MergeProposalStatus::Open,
            Some("merged") => MergeProposalStatus::Merged,
            Some("closed") => MergeProposalStatus::Closed,
            _ => MergeProposalStatus::Open,
        };
        Ok(ProposalInfo {
            url: web_url.clone(),
            web_url: Some(web_url),
            status,
            merged_by: value["merged_by"]["username"]
                .as_str()
                .map(|s| s.to_string()),
            merged_at: value["merged_at"]
                .as_str()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
            revision: value["sha"].as_str().map(|s| s.to_string()),
            target_head: None,
            base_revision: value["diff_refs"]["base_sha"]
                .as_str()
                .map(|s| s.to_string()),
        })
    }

    async fn branch_head(
        &self,
        project: &str,
        branch: &str,
    ) -> Result<Option<String>, ForgeError> {
        let url = self.api_url(&format!(
            "projects/{}/repository/branches/{}",
            project, branch
        ))?;
        let response = self.client.get(url).send().await?;
        match check_response(&response) {
            Ok(()) => {
                let value: serde_json::Value = response.json().await?;
                Ok(value["commit"]["id"].as_str().map(|s| s.to_string()))
            }
            Err(ForgeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn default_branch(&self, project: &str) -> Result<String, ForgeError> {
        let url = self.api_url(&format!("projects/{}", project))?;
        let response = self.client.get(url).send().await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        value["default_branch"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ForgeError::Permanent("project without default branch".to_string()))
    }
}

#[async_trait]
impl Forge for GitLabForge {
    fn kind(&self) -> &'static str {
        "gitlab"
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn create_proposal(
        &self,
        target_branch_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError> {
        let project = self.project_id(target_branch_url)?;
        let target_branch = match &request.target_branch {
            Some(branch) => branch.clone(),
            None => self.default_branch(&project).await?,
        };
        let url = self.api_url(&format!("projects/{}/merge_requests", project))?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "source_branch": request.source_branch,
                "target_branch": target_branch,
                "title": request.title,
                "description": request.body,
                "labels": request.labels.join(","),
                "remove_source_branch": true,
            }))
            .send()
            .await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        self.proposal_from_json(&value)
    }

    async fn update_proposal(
        &self,
        proposal_url: &Url,
        request: &ProposalRequest,
    ) -> Result<ProposalInfo, ForgeError> {
        let (project, iid) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("projects/{}/merge_requests/{}", project, iid))?;
        let response = self
            .client
            .put(url)
            .json(&serde_json::json!({
                "title": request.title,
                "description": request.body,
            }))
            .send()
            .await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        self.proposal_from_json(&value)
    }

    async fn get_proposal(&self, proposal_url: &Url) -> Result<ProposalInfo, ForgeError> {
        let (project, iid) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("projects/{}/merge_requests/{}", project, iid))?;
        let response = self.client.get(url).send().await?;
        check_response(&response)?;
        let value: serde_json::Value = response.json().await?;
        let mut info = self.proposal_from_json(&value)?;
        if let Some(target_branch) = value["target_branch"].as_str() {
            info.target_head = self.branch_head(&project, target_branch).await?;
        }
        Ok(info)
    }

    async fn find_open_proposal(
        &self,
        target_branch_url: &Url,
        source_branch: &str,
    ) -> Result<Option<ProposalInfo>, ForgeError> {
        let project = self.project_id(target_branch_url)?;
        let url = self.api_url(&format!(
            "projects/{}/merge_requests?state=opened&source_branch={}",
            project, source_branch
        ))?;
        let response = self.client.get(url).send().await?;
        check_response(&response)?;
        let values: Vec<serde_json::Value> = response.json().await?;
        values
            .first()
            .map(|value| self.proposal_from_json(value))
            .transpose()
    }

    async fn close_proposal(&self, proposal_url: &Url) -> Result<(), ForgeError> {
        let (project, iid) = self.parse_proposal_url(proposal_url)?;
        let url = self.api_url(&format!("projects/{}/merge_requests/{}", project, iid))?;
        let response = self
            .client
            .put(url)
            .json(&serde_json::json!({"state_event": "close"}))
            .send()
            .await?;
        check_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_repo_path() {
        let (owner, repo) =
            github_repo_path(&"https://github.com/jelmer/janitor.git".parse().unwrap()).unwrap();
        assert_eq!(owner, "jelmer");
        assert_eq!(repo, "janitor");
        assert!(github_repo_path(&"https://github.com/".parse().unwrap()).is_err());
    }

    #[test]
    fn test_github_parse_proposal_url() {
        let forge = GitHubForge::new("github.com".to_string(), None, None);
        let (owner, repo, number) = forge
            .parse_proposal_url(&"https://github.com/jelmer/janitor/pull/42".parse().unwrap())
            .unwrap();
        assert_eq!((owner.as_str(), repo.as_str(), number), ("jelmer", "janitor", 42));
        assert!(forge
            .parse_proposal_url(&"https://github.com/jelmer/janitor".parse().unwrap())
            .is_err());
    }

    #[test]
    fn test_gitlab_parse_proposal_url() {
        let forge = GitLabForge::new("salsa.debian.org".to_string(), None, None);
        let (project, iid) = forge
            .parse_proposal_url(
                &"https://salsa.debian.org/jelmer/dulwich/-/merge_requests/7"
                    .parse()
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(project, "jelmer%2Fdulwich");
        assert_eq!(iid, 7);
    }

    #[test]
    fn test_gitlab_project_id_escapes() {
        let forge = GitLabForge::new("salsa.debian.org".to_string(), None, None);
        let project = forge
            .project_id(&"https://salsa.debian.org/python-team/dulwich.git".parse().unwrap())
            .unwrap();
        assert_eq!(project, "python%2Dteam%2Fdulwich");
    }

    #[test]
    fn test_proposal_needs_rebase() {
        let info = ProposalInfo {
            url: "https://example.com/mr/1".parse().unwrap(),
            web_url: None,
            status: MergeProposalStatus::Open,
            merged_by: None,
            merged_at: None,
            revision: Some("bbbb".to_string()),
            target_head: Some("cccc".to_string()),
            base_revision: Some("aaaa".to_string()),
        };
        assert!(info.needs_rebase());

        let fresh = ProposalInfo {
            target_head: Some("aaaa".to_string()),
            ..info
        };
        assert!(!fresh.needs_rebase());
    }

    #[test]
    fn test_get_forge_selects_by_host() {
        let config: Config = toml::from_str(
            r#"
[database]
url = "postgresql://localhost/janitor"

[[forge]]
kind = "gitlab"
host = "salsa.debian.org"

[[forge]]
kind = "github"
host = "github.com"
"#,
        )
        .unwrap();
        let forge = get_forge(&config, &"https://salsa.debian.org/x/y".parse().unwrap()).unwrap();
        assert_eq!(forge.kind(), "gitlab");
        let forge = get_forge(&config, &"https://github.com/x/y".parse().unwrap()).unwrap();
        assert_eq!(forge.kind(), "github");
        assert!(get_forge(&config, &"https://example.com/x/y".parse().unwrap()).is_err());
    }
}
