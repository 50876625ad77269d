//! Session and log entry queries.

use async_trait::async_trait;

use super::db::{Database, DatabaseError};
use crate::models::{LogEntry, Session};
use crate::ports::{LogStore, SessionStore};

#[async_trait]
impl SessionStore for Database {
    async fn save_session(&self, session: &Session) -> Result<(), DatabaseError> {
        // Upsert rather than REPLACE: REPLACE deletes the row first and would
        // cascade to the session's log entries. A terminal row is final, so a
        // stop recorded by another process is never overwritten.
        sqlx::query(
            r"
            INSERT INTO sessions (
                id, agent_name, model, prompt, status, working_directory,
                conversation_id, resumed_from, error_reason, result_text,
                started_at, ended_at, input_tokens, output_tokens, cost_usd, pid
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                agent_name = excluded.agent_name,
                model = excluded.model,
                prompt = excluded.prompt,
                status = excluded.status,
                working_directory = excluded.working_directory,
                conversation_id = excluded.conversation_id,
                resumed_from = excluded.resumed_from,
                error_reason = excluded.error_reason,
                result_text = excluded.result_text,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                cost_usd = excluded.cost_usd,
                pid = excluded.pid
            WHERE sessions.status NOT IN ('completed', 'error', 'stopped')
            ",
        )
        .bind(&session.id)
        .bind(&session.agent_name)
        .bind(&session.model)
        .bind(&session.prompt)
        .bind(session.status.as_str())
        .bind(&session.working_directory)
        .bind(&session.conversation_id)
        .bind(&session.resumed_from)
        .bind(&session.error_reason)
        .bind(&session.result_text)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.input_tokens)
        .bind(session.output_tokens)
        .bind(session.cost_usd)
        .bind(session.pid)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, DatabaseError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(session)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        let sessions = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions ORDER BY started_at DESC, rowid DESC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(sessions)
    }
}

#[async_trait]
impl LogStore for Database {
    async fn append_logs(&self, entries: &[LogEntry]) -> Result<(), DatabaseError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool().begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO log_entries (session_id, sequence, message_type, content, timestamp) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&entry.session_id)
            .bind(entry.sequence)
            .bind(entry.message_type.as_str())
            .bind(&entry.content)
            .bind(entry.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_logs(
        &self,
        session_id: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let entries = sqlx::query_as::<_, LogEntry>(
            r"
            SELECT session_id, sequence, message_type, content, timestamp
            FROM log_entries
            WHERE session_id = ?
            ORDER BY sequence ASC, id ASC
            LIMIT ? OFFSET ?
            ",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(entries)
    }

    async fn count_logs(&self, session_id: &str) -> Result<u64, DatabaseError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_entries WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(self.pool())
            .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
impl Database {
    /// Minimal `starting` session row so log entries satisfy the foreign key.
    pub(crate) async fn insert_test_session(&self, id: &str) {
        let session = Session {
            id: id.to_string(),
            agent_name: "tester".to_string(),
            model: "sonnet".to_string(),
            prompt: "test".to_string(),
            status: crate::models::SessionStatus::Starting,
            working_directory: "/tmp".to_string(),
            conversation_id: Some(id.to_string()),
            resumed_from: None,
            error_reason: None,
            result_text: None,
            started_at: conductor_core::db::unix_timestamp(),
            ended_at: None,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            pid: None,
        };
        if let Err(e) = self.save_session(&session).await {
            panic!("failed to insert test session: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{MessageType, SessionStatus};

    fn entry(session_id: &str, sequence: i64, message_type: MessageType) -> LogEntry {
        LogEntry {
            session_id: session_id.to_string(),
            sequence,
            message_type,
            content: format!("entry {sequence}"),
            timestamp: 1_700_000_000_000 + sequence,
        }
    }

    #[tokio::test]
    async fn save_and_get_session() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("s-1").await;

        let session = db.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.conversation_id.as_deref(), Some("s-1"));
        assert!(db.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_again_updates_without_losing_logs() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("s-1").await;
        db.append_logs(&[entry("s-1", 1, MessageType::System)])
            .await
            .unwrap();

        let mut session = db.get_session("s-1").await.unwrap().unwrap();
        session.status = SessionStatus::Completed;
        session.ended_at = Some(42);
        session.input_tokens = 100;
        db.save_session(&session).await.unwrap();

        let stored = db.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.ended_at, Some(42));
        assert_eq!(stored.input_tokens, 100);
        assert_eq!(db.count_logs("s-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_session_is_not_overwritten() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("s-1").await;
        let mut session = db.get_session("s-1").await.unwrap().unwrap();
        session.status = SessionStatus::Stopped;
        session.ended_at = Some(7);
        db.save_session(&session).await.unwrap();

        session.status = SessionStatus::Running;
        session.ended_at = None;
        session.pid = Some(4242);
        db.save_session(&session).await.unwrap();

        let stored = db.get_session("s-1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Stopped);
        assert_eq!(stored.ended_at, Some(7));
        assert_eq!(stored.pid, None);
    }

    #[tokio::test]
    async fn pid_round_trips() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("s-1").await;
        let mut session = db.get_session("s-1").await.unwrap().unwrap();
        session.pid = Some(31337);
        db.save_session(&session).await.unwrap();
        assert_eq!(
            db.get_session("s-1").await.unwrap().unwrap().pid,
            Some(31337)
        );
    }

    #[tokio::test]
    async fn list_sessions_newest_first() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("a").await;
        db.insert_test_session("b").await;
        let ids: Vec<String> = db
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn logs_are_paged_in_sequence_order() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_test_session("s").await;
        let entries: Vec<_> = (1..=5)
            .map(|i| entry("s", i, MessageType::Stderr))
            .collect();
        db.append_logs(&entries).await.unwrap();

        let page = db.list_logs("s", 1, 2).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(page[0].message_type, MessageType::Stderr);
        assert_eq!(db.count_logs("s").await.unwrap(), 5);
        assert_eq!(db.count_logs("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn logs_for_unknown_session_violate_foreign_key() {
        let db = Database::open_in_memory().await.unwrap();
        let err = db
            .append_logs(&[entry("ghost", 1, MessageType::Raw)])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }
}
