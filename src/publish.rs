use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

/// Forge-side status of a merge proposal, mirrored locally.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeProposalStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "merged")]
    Merged,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "abandoned")]
    Abandoned,
}

impl std::fmt::Display for MergeProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MergeProposalStatus::Open => write!(f, "open"),
            MergeProposalStatus::Merged => write!(f, "merged"),
            MergeProposalStatus::Closed => write!(f, "closed"),
            MergeProposalStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for MergeProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(MergeProposalStatus::Open),
            "merged" => Ok(MergeProposalStatus::Merged),
            "closed" => Ok(MergeProposalStatus::Closed),
            "abandoned" => Ok(MergeProposalStatus::Abandoned),
            _ => Err(format!("unknown merge proposal status: {}", s)),
        }
    }
}

/// How a successful run is surfaced to the world.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Do nothing.
    #[serde(rename = "skip")]
    Skip,
    /// Build but do nothing visible.
    #[serde(rename = "build-only")]
    BuildOnly,
    /// Fast-forward push to the upstream branch.
    #[serde(rename = "push")]
    Push,
    /// Push to a derived branch without opening a proposal.
    #[serde(rename = "push-derived")]
    PushDerived,
    /// Always open a merge proposal.
    #[serde(rename = "propose")]
    #[default]
    Propose,
    /// Push if permitted, fall back to propose otherwise.
    #[serde(rename = "attempt-push")]
    AttemptPush,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Mode::Skip => write!(f, "skip"),
            Mode::BuildOnly => write!(f, "build-only"),
            Mode::Push => write!(f, "push"),
            Mode::PushDerived => write!(f, "push-derived"),
            Mode::Propose => write!(f, "propose"),
            Mode::AttemptPush => write!(f, "attempt-push"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Mode::Skip),
            "build-only" => Ok(Mode::BuildOnly),
            "push" => Ok(Mode::Push),
            "push-derived" => Ok(Mode::PushDerived),
            "propose" => Ok(Mode::Propose),
            "attempt-push" => Ok(Mode::AttemptPush),
            _ => Err(format!("unknown publish mode: {}", s)),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct MergeProposalNotification {
    pub url: Url,
    pub web_url: Option<Url>,
    pub rate_limit_bucket: Option<String>,
    pub status: MergeProposalStatus,
    pub merged_by: Option<String>,
    pub merged_at: Option<String>,
    pub codebase: String,
    pub campaign: String,
    pub target_branch_url: Url,
}

fn serialize_duration<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if let Some(d) = duration {
        serializer.serialize_f64(d.num_seconds() as f64)
    } else {
        serializer.serialize_none()
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    if let Some(d) = Option::<f64>::deserialize(deserializer)? {
        Ok(Some(Duration::seconds(d as i64)))
    } else {
        Ok(None)
    }
}

#[derive(Serialize, Deserialize)]
pub struct PublishNotification {
    pub id: String,
    pub codebase: String,
    pub campaign: String,
    pub proposal_url: Option<Url>,
    pub mode: Mode,
    pub main_branch_url: Option<Url>,
    pub branch_name: Option<String>,
    pub result_code: String,
    pub run_id: String,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub publish_delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in [
            Mode::Skip,
            Mode::BuildOnly,
            Mode::Push,
            Mode::PushDerived,
            Mode::Propose,
            Mode::AttemptPush,
        ] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert!("bogus".parse::<Mode>().is_err());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "merged".parse::<MergeProposalStatus>().unwrap(),
            MergeProposalStatus::Merged
        );
        assert!("frobbed".parse::<MergeProposalStatus>().is_err());
    }
}
