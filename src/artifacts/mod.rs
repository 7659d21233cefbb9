use async_trait::async_trait;
use std::io;

mod local;

pub use local::LocalArtifactManager;

#[derive(Debug)]
pub enum Error {
    ServiceUnavailable,
    ArtifactsMissing,
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ServiceUnavailable => write!(f, "Service unavailable"),
            Error::ArtifactsMissing => write!(f, "Artifacts missing"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Write-once, read-many blob store addressed by (run id, artifact name).
///
/// Blobs are content-hashed so identical artifacts from different runs are
/// stored once.
#[async_trait]
pub trait ArtifactManager: Send + Sync {
    /// Store an artifact.
    ///
    /// # Returns
    /// The SHA-256 content hash of the blob.
    async fn store_artifact(
        &self,
        run_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<String, Error>;

    /// Retrieve an artifact's contents.
    async fn get_artifact(&self, run_id: &str, name: &str) -> Result<Vec<u8>, Error>;

    /// List artifact names for a run.
    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>, Error>;

    /// Verify that the store is accessible.
    async fn health_check(&self) -> Result<(), Error>;
}

/// Create an artifact manager based on the location string.
pub async fn create_artifact_manager(location: &str) -> Result<Box<dyn ArtifactManager>, Error> {
    let path = location.strip_prefix("file://").unwrap_or(location);
    if path.contains("://") {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported artifact location: {}", location),
        )));
    }
    Ok(Box::new(LocalArtifactManager::new(path)?))
}

/// Hex SHA-256 digest of a blob.
pub fn content_hash(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_content_hash_stable() {
        assert_eq!(
            super::content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(super::content_hash(b"abc"), super::content_hash(b"abc"));
        assert_ne!(super::content_hash(b"abc"), super::content_hash(b"abd"));
    }
}
