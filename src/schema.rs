/// Core janitor database schema
pub const CORE_SCHEMA: &str = include_str!("../schema.sql");

#[cfg(feature = "testing")]
/// Set up a test database with the core janitor schema
pub async fn setup_test_database(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(CORE_SCHEMA).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_schema_is_not_empty() {
        assert!(!CORE_SCHEMA.is_empty());
        assert!(CORE_SCHEMA.len() > 1000);
    }

    #[test]
    fn test_core_schema_contains_expected_tables() {
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS codebase"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS candidate"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS queue"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS active_run"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS run"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS new_result_branch"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS merge_proposal"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS publish"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS rate_limit_bucket"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS policy"));
        assert!(CORE_SCHEMA.contains("CREATE TABLE IF NOT EXISTS worker"));
    }
}
