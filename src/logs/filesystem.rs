use async_trait::async_trait;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::logs::{Error, LogFileManager};

#[derive(Debug)]
pub struct FileSystemLogFileManager {
    log_directory: PathBuf,
}

impl FileSystemLogFileManager {
    pub fn new<P: AsRef<Path>>(log_directory: P) -> Result<Self, Error> {
        let log_directory = log_directory.as_ref().to_path_buf();
        Ok(Self { log_directory })
    }

    fn get_paths(&self, codebase: &str, run_id: &str, name: &str) -> Vec<PathBuf> {
        if codebase.contains('/') || run_id.contains('/') || name.contains('/') {
            return vec![];
        }
        vec![
            self.log_directory.join(codebase).join(run_id).join(name),
            self.log_directory
                .join(codebase)
                .join(run_id)
                .join(format!("{}.gz", name)),
        ]
    }

    fn live_path(&self, codebase: &str, run_id: &str, name: &str) -> Result<PathBuf, Error> {
        if codebase.contains('/') || run_id.contains('/') || name.contains('/') {
            return Err(Error::Other(format!("invalid log name: {}", name)));
        }
        Ok(self.log_directory.join(codebase).join(run_id).join(name))
    }
}

#[async_trait]
impl LogFileManager for FileSystemLogFileManager {
    async fn has_log(&self, codebase: &str, run_id: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .get_paths(codebase, run_id, name)
            .iter()
            .any(|path| path.exists()))
    }

    async fn get_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send + Sync>, Error> {
        for path in self.get_paths(codebase, run_id, name) {
            if path.exists() {
                if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
                    let file = fs::File::open(path)?;
                    let gz = flate2::read::GzDecoder::new(file);
                    return Ok(Box::new(gz));
                } else {
                    let file = fs::File::open(path)?;
                    return Ok(Box::new(file));
                }
            }
        }
        Err(Error::NotFound)
    }

    async fn append_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
        chunk: &[u8],
    ) -> Result<u64, Error> {
        let path = self.live_path(codebase, run_id, name)?;
        fs::create_dir_all(path.parent().expect("log path has a parent"))?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(chunk)?;
        Ok(file.metadata()?.len())
    }

    async fn import_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), Error> {
        let dest_dir = self.log_directory.join(codebase).join(run_id);
        fs::create_dir_all(&dest_dir)?;

        let dest_path = dest_dir.join(format!("{}.gz", name));
        let outf = fs::File::create(&dest_path)?;
        let mut encoder = flate2::write::GzEncoder::new(outf, flate2::Compression::default());
        encoder.write_all(content)?;
        encoder.finish()?;

        // An import supersedes any live stream of the same name.
        let live = dest_dir.join(name);
        if live.exists() {
            fs::remove_file(live)?;
        }

        Ok(())
    }

    async fn list_logs(&self, codebase: &str, run_id: &str) -> Result<Vec<String>, Error> {
        let dir = self.log_directory.join(codebase).join(run_id);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut names = vec![];
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            names.push(
                name.strip_suffix(".gz")
                    .map(|n| n.to_string())
                    .unwrap_or(name),
            );
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn health_check(&self) -> Result<(), Error> {
        match fs::metadata(&self.log_directory) {
            Ok(metadata) => {
                if metadata.is_dir() {
                    match fs::read_dir(&self.log_directory) {
                        Ok(_) => Ok(()),
                        Err(e) => match e.kind() {
                            std::io::ErrorKind::PermissionDenied => Err(Error::PermissionDenied),
                            _ => Err(Error::Io(e)),
                        },
                    }
                } else {
                    Err(Error::Other("Log directory is not a directory".to_string()))
                }
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    fs::create_dir_all(&self.log_directory)?;
                    Ok(())
                }
                std::io::ErrorKind::PermissionDenied => Err(Error::PermissionDenied),
                _ => Err(Error::Io(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogFileManager;

    #[tokio::test]
    async fn test_append_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileSystemLogFileManager::new(dir.path()).unwrap();

        let offset = manager
            .append_log("pkg-a", "run-1", "worker.log", b"hello ")
            .await
            .unwrap();
        assert_eq!(offset, 6);
        let offset = manager
            .append_log("pkg-a", "run-1", "worker.log", b"world\n")
            .await
            .unwrap();
        assert_eq!(offset, 12);

        assert!(manager.has_log("pkg-a", "run-1", "worker.log").await.unwrap());
        let mut content = String::new();
        manager
            .get_log("pkg-a", "run-1", "worker.log")
            .await
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello world\n");
    }

    #[tokio::test]
    async fn test_import_compresses_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileSystemLogFileManager::new(dir.path()).unwrap();

        manager
            .import_log("pkg-a", "run-1", "build.log", b"output\n")
            .await
            .unwrap();

        assert_eq!(
            manager.list_logs("pkg-a", "run-1").await.unwrap(),
            vec!["build.log".to_string()]
        );

        let mut content = String::new();
        manager
            .get_log("pkg-a", "run-1", "build.log")
            .await
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "output\n");
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileSystemLogFileManager::new(dir.path()).unwrap();
        assert!(manager
            .append_log("../evil", "run-1", "worker.log", b"x")
            .await
            .is_err());
        assert!(!manager
            .has_log("pkg-a", "run-1", "../../etc/passwd")
            .await
            .unwrap());
    }
}
