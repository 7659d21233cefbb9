use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifacts::{content_hash, ArtifactManager, Error};

/// Artifact store on the local filesystem.
///
/// Layout: `blobs/<sha256>` holds the content; `runs/<run-id>/<name>` holds
/// the hash of the blob the artifact points at.
pub struct LocalArtifactManager {
    base: PathBuf,
}

impl LocalArtifactManager {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, Error> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("blobs"))?;
        fs::create_dir_all(base.join("runs"))?;
        Ok(Self { base })
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf, Error> {
        if run_id.contains('/') || run_id.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid run id: {}", run_id),
            )));
        }
        Ok(self.base.join("runs").join(run_id))
    }

    fn ref_path(&self, run_id: &str, name: &str) -> Result<PathBuf, Error> {
        if name.contains('/') || name.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid artifact name: {}", name),
            )));
        }
        Ok(self.run_dir(run_id)?.join(name))
    }
}

#[async_trait]
impl ArtifactManager for LocalArtifactManager {
    async fn store_artifact(
        &self,
        run_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<String, Error> {
        let hash = content_hash(content);
        let blob_path = self.base.join("blobs").join(&hash);
        if !blob_path.exists() {
            // Write-then-rename so readers never see a partial blob.
            let tmp_path = self.base.join("blobs").join(format!(".{}.tmp", hash));
            fs::write(&tmp_path, content)?;
            fs::rename(&tmp_path, &blob_path)?;
        }

        let ref_path = self.ref_path(run_id, name)?;
        fs::create_dir_all(ref_path.parent().expect("ref path has a parent"))?;
        fs::write(ref_path, &hash)?;
        Ok(hash)
    }

    async fn get_artifact(&self, run_id: &str, name: &str) -> Result<Vec<u8>, Error> {
        let ref_path = self.ref_path(run_id, name)?;
        let hash = match fs::read_to_string(&ref_path) {
            Ok(hash) => hash,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ArtifactsMissing)
            }
            Err(e) => return Err(e.into()),
        };
        Ok(fs::read(self.base.join("blobs").join(hash.trim()))?)
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<String>, Error> {
        let dir = self.run_dir(run_id)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut names = vec![];
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn health_check(&self) -> Result<(), Error> {
        if self.base.join("blobs").is_dir() && self.base.join("runs").is_dir() {
            Ok(())
        } else {
            Err(Error::ServiceUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalArtifactManager::new(dir.path()).unwrap();

        let hash = manager
            .store_artifact("run-1", "result.tar.gz", b"payload")
            .await
            .unwrap();
        assert_eq!(hash, content_hash(b"payload"));
        assert_eq!(
            manager.get_artifact("run-1", "result.tar.gz").await.unwrap(),
            b"payload"
        );
        assert_eq!(
            manager.list_artifacts("run-1").await.unwrap(),
            vec!["result.tar.gz".to_string()]
        );
    }

    #[tokio::test]
    async fn test_duplicate_content_shares_blob() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalArtifactManager::new(dir.path()).unwrap();

        let h1 = manager
            .store_artifact("run-1", "a.bin", b"same")
            .await
            .unwrap();
        let h2 = manager
            .store_artifact("run-2", "b.bin", b"same")
            .await
            .unwrap();
        assert_eq!(h1, h2);

        let blobs: Vec<_> = fs::read_dir(dir.path().join("blobs"))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalArtifactManager::new(dir.path()).unwrap();
        assert!(matches!(
            manager.get_artifact("run-1", "nope").await,
            Err(Error::ArtifactsMissing)
        ));
    }
}
