//! VCS capability interface.
//!
//! The control plane never implements a VCS; it drives the git and bzr
//! clients through a narrow interface. The set of backends is closed and
//! selected at config load.

use async_trait::async_trait;
use std::path::Path;
use url::Url;

/// Supported version control systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsType {
    Git,
    Bzr,
}

impl std::fmt::Display for VcsType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VcsType::Git => write!(f, "git"),
            VcsType::Bzr => write!(f, "bzr"),
        }
    }
}

impl std::str::FromStr for VcsType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(VcsType::Git),
            "bzr" => Ok(VcsType::Bzr),
            _ => Err(format!("unknown vcs type: {}", s)),
        }
    }
}

pub fn is_authenticated_url(url: &Url) -> bool {
    ["git+ssh", "bzr+ssh", "ssh"].contains(&url.scheme())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote rejected our credentials.
    #[error("permission denied pushing to {0}")]
    PermissionDenied(Url),
    /// The remote branch does not exist.
    #[error("branch unavailable: {0}")]
    BranchMissing(Url),
    /// The target advanced past the revision being pushed.
    #[error("non-fast-forward push to {0}")]
    Diverged(Url),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The client exited non-zero for another reason.
    #[error("vcs client failed ({code:?}): {stderr}")]
    Other {
        code: Option<i32>,
        stderr: String,
    },
}

/// Narrow interface over a VCS client.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// The VCS this backend drives.
    fn vcs_type(&self) -> VcsType;

    /// Whether `revision` parses as a revision id for this VCS.
    fn revision_valid(&self, revision: &str) -> bool;

    /// Fetch `revision` from `source` into a working area, then push it to
    /// `target` as `branch_name` (or the default branch when None). The
    /// push is fast-forward only unless `force`.
    async fn push(
        &self,
        source: &Url,
        target: &Url,
        revision: &str,
        branch_name: Option<&str>,
        force: bool,
    ) -> Result<(), Error>;
}

/// Select a backend for a VCS type.
pub fn get_backend(vcs_type: VcsType) -> Box<dyn VcsBackend> {
    match vcs_type {
        VcsType::Git => Box::new(GitBackend),
        VcsType::Bzr => Box::new(BzrBackend),
    }
}

async fn run_client(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<std::process::Output, Error> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    // Forge credentials come from the agent, not from the environment of
    // whoever started us.
    if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
        cmd.env("SSH_AUTH_SOCK", sock);
    }
    Ok(cmd.output().await?)
}

fn classify_output(output: &std::process::Output, target: &Url) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied")
        || lowered.contains("authentication failed")
        || lowered.contains("403")
    {
        Error::PermissionDenied(target.clone())
    } else if lowered.contains("not found") || lowered.contains("does not appear to be a") {
        Error::BranchMissing(target.clone())
    } else if lowered.contains("non-fast-forward") || lowered.contains("diverged") {
        Error::Diverged(target.clone())
    } else {
        Error::Other {
            code: output.status.code(),
            stderr,
        }
    }
}

/// The branch the remote's HEAD points at.
async fn remote_default_branch(remote: &Url, cwd: &Path) -> Result<String, Error> {
    let output = run_client(
        "git",
        &["ls-remote", "--symref", remote.as_str(), "HEAD"],
        Some(cwd),
    )
    .await?;
    if !output.status.success() {
        return Err(classify_output(&output, remote));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| {
            line.strip_prefix("ref: refs/heads/")
                .and_then(|rest| rest.split_whitespace().next())
        })
        .map(|name| name.to_string())
        .ok_or_else(|| Error::BranchMissing(remote.clone()))
}

/// Backend driving the git client.
pub struct GitBackend;

#[async_trait]
impl VcsBackend for GitBackend {
    fn vcs_type(&self) -> VcsType {
        VcsType::Git
    }

    fn revision_valid(&self, revision: &str) -> bool {
        revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn push(
        &self,
        source: &Url,
        target: &Url,
        revision: &str,
        branch_name: Option<&str>,
        force: bool,
    ) -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let output = run_client("git", &["init", "--bare", "--quiet", "."], Some(tmp.path())).await?;
        if !output.status.success() {
            return Err(classify_output(&output, target));
        }
        let output = run_client(
            "git",
            &["fetch", "--quiet", source.as_str(), revision],
            Some(tmp.path()),
        )
        .await?;
        if !output.status.success() {
            return Err(classify_output(&output, source));
        }
        let branch = match branch_name {
            Some(branch) => branch.to_string(),
            None => remote_default_branch(target, tmp.path()).await?,
        };
        let refspec = format!("{}:refs/heads/{}", revision, branch);
        let mut args = vec!["push", "--quiet"];
        if force {
            args.push("--force");
        }
        args.push(target.as_str());
        args.push(&refspec);
        let output = run_client("git", &args, Some(tmp.path())).await?;
        if !output.status.success() {
            return Err(classify_output(&output, target));
        }
        Ok(())
    }
}

/// Backend driving the bzr client.
pub struct BzrBackend;

#[async_trait]
impl VcsBackend for BzrBackend {
    fn vcs_type(&self) -> VcsType {
        VcsType::Bzr
    }

    fn revision_valid(&self, revision: &str) -> bool {
        // Breezy revision ids look like "<committer>-<timestamp>-<suffix>";
        // accept any non-empty ascii token without whitespace.
        !revision.is_empty() && revision.is_ascii() && !revision.contains(char::is_whitespace)
    }

    async fn push(
        &self,
        source: &Url,
        target: &Url,
        revision: &str,
        branch_name: Option<&str>,
        force: bool,
    ) -> Result<(), Error> {
        let tmp = tempfile::tempdir()?;
        let revspec = format!("revid:{}", revision);
        let output = run_client(
            "bzr",
            &["branch", "--quiet", "-r", &revspec, source.as_str(), "work"],
            Some(tmp.path()),
        )
        .await?;
        if !output.status.success() {
            return Err(classify_output(&output, source));
        }
        let mut target = target.clone();
        if let Some(branch_name) = branch_name {
            // Colocated branch selection.
            target.set_query(Some(&format!("branch={}", branch_name)));
        }
        let mut args = vec!["push", "--quiet"];
        if force {
            args.push("--overwrite");
        }
        args.push(target.as_str());
        let output = run_client("bzr", &args, Some(&tmp.path().join("work"))).await?;
        if !output.status.success() {
            return Err(classify_output(&output, &target));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_authenticated_url() {
        assert!(is_authenticated_url(
            &Url::parse("git+ssh://example.com").unwrap()
        ));
        assert!(is_authenticated_url(
            &Url::parse("bzr+ssh://example.com").unwrap()
        ));
        assert!(!is_authenticated_url(
            &Url::parse("http://example.com").unwrap()
        ));
    }

    #[test]
    fn test_git_revision_valid() {
        let backend = GitBackend;
        assert!(backend.revision_valid(&"a".repeat(40)));
        assert!(!backend.revision_valid("HEAD"));
        assert!(!backend.revision_valid(&"a".repeat(39)));
        assert!(!backend.revision_valid(&"z".repeat(40)));
    }

    #[test]
    fn test_bzr_revision_valid() {
        let backend = BzrBackend;
        assert!(backend.revision_valid("jelmer@jelmer.uk-20240101000000-abcdef"));
        assert!(!backend.revision_valid(""));
        assert!(!backend.revision_valid("rev id with spaces"));
    }

    #[test]
    fn test_vcs_type_round_trip() {
        assert_eq!("git".parse::<VcsType>().unwrap(), VcsType::Git);
        assert_eq!(VcsType::Bzr.to_string(), "bzr");
        assert!("svn".parse::<VcsType>().is_err());
    }
}
