//! Database connection and initialization.

pub use conductor_core::db::DatabaseError;

conductor_core::define_database!(Database, "Database migrations complete");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conductor.db");
        let db = Database::open(&path).await.unwrap();
        db.close().await;
        let reopened = Database::open(&path).await;
        assert!(reopened.is_ok());
    }
}
