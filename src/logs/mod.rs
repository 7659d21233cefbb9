use async_trait::async_trait;
use std::io::{self, Read};

mod filesystem;
pub use filesystem::FileSystemLogFileManager;

#[derive(Debug)]
pub enum Error {
    NotFound,
    ServiceUnavailable,
    PermissionDenied,
    Io(io::Error),
    Other(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "Not found"),
            Error::ServiceUnavailable => write!(f, "Service unavailable"),
            Error::PermissionDenied => write!(f, "Permission denied"),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// A trait for managing log streams.
///
/// Logs are addressed by (codebase, run id, name). Workers stream chunks
/// while the run is live; finished logs are compressed at rest.
#[async_trait]
pub trait LogFileManager: Send + Sync {
    /// Check if a log exists.
    async fn has_log(&self, codebase: &str, run_id: &str, name: &str) -> Result<bool, Error>;

    /// Get a log.
    async fn get_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
    ) -> Result<Box<dyn Read + Send + Sync>, Error>;

    /// Append a chunk to a live log stream.
    ///
    /// # Returns
    /// The byte offset after the append.
    async fn append_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
        chunk: &[u8],
    ) -> Result<u64, Error>;

    /// Store a complete log in one go, compressed at rest.
    async fn import_log(
        &self,
        codebase: &str,
        run_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<(), Error>;

    /// List log names for a run.
    async fn list_logs(&self, codebase: &str, run_id: &str) -> Result<Vec<String>, Error>;

    /// Verify that the log storage backend is accessible.
    async fn health_check(&self) -> Result<(), Error>;
}

/// Create a log file manager based on the location string.
pub async fn create_log_manager(location: &str) -> Result<Box<dyn LogFileManager>, Error> {
    let path = location.strip_prefix("file://").unwrap_or(location);
    if path.contains("://") {
        return Err(Error::Other(format!(
            "unsupported log location: {}",
            location
        )));
    }
    Ok(Box::new(FileSystemLogFileManager::new(path)?))
}

/// Check if a filename is a log file.
pub fn is_log_filename(name: &str) -> bool {
    let parts = name.split('.').collect::<Vec<_>>();

    if parts.len() < 2 || parts[0].is_empty() {
        return false;
    }

    // foo.log
    if parts.last() == Some(&"log") {
        return true;
    }

    // foo.log.gz and friends
    if parts.len() >= 3 {
        let compression_extensions = ["gz", "bz2", "xz", "lzma", "Z"];
        if let Some(&last_part) = parts.last() {
            if compression_extensions.contains(&last_part) && parts[parts.len() - 2] == "log" {
                return true;
            }
        }
    }

    // foo.log.1
    if parts.len() == 3 {
        let mut rev = parts.iter().rev();
        let last = rev.next().unwrap();
        let middle = rev.next().unwrap();

        if last.chars().all(char::is_numeric) && *middle == "log" {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_log_filename() {
        assert!(is_log_filename("worker.log"));
        assert!(is_log_filename("build.log.gz"));
        assert!(is_log_filename("build.log.1"));
        assert!(!is_log_filename("result.json"));
        assert!(!is_log_filename(".log"));
        assert!(!is_log_filename("log"));
    }

    #[tokio::test]
    async fn test_create_log_manager_rejects_remote() {
        assert!(create_log_manager("gs://bucket/logs").await.is_err());
        assert!(create_log_manager("/tmp/logs").await.is_ok());
        assert!(create_log_manager("file:///tmp/logs").await.is_ok());
    }
}
