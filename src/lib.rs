pub mod api;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod logging;
pub mod logs;
pub mod publish;
pub mod queue;
pub mod schedule;
pub mod schema;
pub mod state;
pub mod vcs;

/// The type of a run ID.
pub type RunId = String;

/// Generate a fresh run ID.
///
/// Run IDs are ULIDs: sortable by creation time and unique across the fleet.
pub fn generate_run_id() -> RunId {
    ulid::Ulid::new().to_string().to_lowercase()
}

#[cfg(test)]
mod run_id_tests {
    #[test]
    fn test_generate_run_id() {
        let a = super::generate_run_id();
        let b = super::generate_run_id();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }
}
