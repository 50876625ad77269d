//! Workflow, step and edge queries.

use async_trait::async_trait;

use conductor_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use crate::models::{StepStatus, Workflow, WorkflowEdge, WorkflowStatus, WorkflowStep};
use crate::ports::WorkflowStore;

#[async_trait]
impl WorkflowStore for Database {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO workflows (id, name, description, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.as_str())
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Workflow, DatabaseError> {
        sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Workflow {id}")))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, DatabaseError> {
        let workflows = sqlx::query_as::<_, Workflow>(
            "SELECT * FROM workflows ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Workflow {id}")));
        }
        Ok(())
    }

    async fn set_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Workflow {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn save_step(&self, step: &WorkflowStep) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO workflow_steps (
                id, workflow_id, agent_name, model, prompt, spec_path, status,
                session_id, position_x, position_y, pass_context, result_output, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                agent_name = excluded.agent_name,
                model = excluded.model,
                prompt = excluded.prompt,
                spec_path = excluded.spec_path,
                status = excluded.status,
                session_id = excluded.session_id,
                position_x = excluded.position_x,
                position_y = excluded.position_y,
                pass_context = excluded.pass_context,
                result_output = excluded.result_output
            ",
        )
        .bind(&step.id)
        .bind(&step.workflow_id)
        .bind(&step.agent_name)
        .bind(&step.model)
        .bind(&step.prompt)
        .bind(&step.spec_path)
        .bind(step.status.as_str())
        .bind(&step.session_id)
        .bind(step.position_x)
        .bind(step.position_y)
        .bind(step.pass_context)
        .bind(&step.result_output)
        .bind(step.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn get_step(&self, id: &str) -> Result<WorkflowStep, DatabaseError> {
        sqlx::query_as::<_, WorkflowStep>("SELECT * FROM workflow_steps WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Step {id}")))
    }

    async fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>, DatabaseError> {
        let steps = sqlx::query_as::<_, WorkflowStep>(
            "SELECT * FROM workflow_steps WHERE workflow_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await?;

        Ok(steps)
    }

    async fn delete_step(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM workflow_steps WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Step {id}")));
        }
        Ok(())
    }

    async fn set_step_run(
        &self,
        id: &str,
        status: StepStatus,
        session_id: Option<&str>,
        result_output: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE workflow_steps SET status = ?, session_id = ?, result_output = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(session_id)
        .bind(result_output)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Step {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Edges
    // =========================================================================

    async fn insert_edge(&self, edge: &WorkflowEdge) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO workflow_edges (id, workflow_id, source_step_id, target_step_id) VALUES (?, ?, ?, ?)",
        )
        .bind(&edge.id)
        .bind(&edge.workflow_id)
        .bind(&edge.source_step_id)
        .bind(&edge.target_step_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn delete_edge(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM workflow_edges WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Edge {id}")));
        }
        Ok(())
    }

    async fn list_edges(&self, workflow_id: &str) -> Result<Vec<WorkflowEdge>, DatabaseError> {
        let edges = sqlx::query_as::<_, WorkflowEdge>(
            "SELECT * FROM workflow_edges WHERE workflow_id = ? ORDER BY rowid ASC",
        )
        .bind(workflow_id)
        .fetch_all(self.pool())
        .await?;

        Ok(edges)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn workflow(id: &str) -> Workflow {
        Workflow {
            id: id.to_string(),
            name: format!("wf {id}"),
            description: None,
            status: WorkflowStatus::Draft,
            created_at: 1,
            updated_at: 1,
        }
    }

    fn step(id: &str, workflow_id: &str) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            workflow_id: workflow_id.to_string(),
            agent_name: "coder".to_string(),
            model: "sonnet".to_string(),
            prompt: format!("do {id}"),
            spec_path: None,
            status: StepStatus::Pending,
            session_id: None,
            position_x: 10.0,
            position_y: 20.0,
            pass_context: true,
            result_output: None,
            created_at: 1,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> WorkflowEdge {
        WorkflowEdge {
            id: id.to_string(),
            workflow_id: "wf".to_string(),
            source_step_id: source.to_string(),
            target_step_id: target.to_string(),
        }
    }

    async fn seeded() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_workflow(&workflow("wf")).await.unwrap();
        for id in ["a", "b", "c"] {
            db.save_step(&step(id, "wf")).await.unwrap();
        }
        db.insert_edge(&edge("e1", "a", "c")).await.unwrap();
        db.insert_edge(&edge("e2", "b", "c")).await.unwrap();
        db
    }

    #[tokio::test]
    async fn steps_roundtrip_with_flags() {
        let db = seeded().await;
        let stored = db.get_step("a").await.unwrap();
        assert!(stored.pass_context);
        assert_eq!(stored.status, StepStatus::Pending);
        let ids: Vec<_> = db
            .list_steps("wf")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn set_step_run_updates_execution_fields_only() {
        let db = seeded().await;
        db.set_step_run("a", StepStatus::Completed, Some("sess-1"), Some("X"))
            .await
            .unwrap();
        let stored = db.get_step("a").await.unwrap();
        assert_eq!(stored.status, StepStatus::Completed);
        assert_eq!(stored.session_id.as_deref(), Some("sess-1"));
        assert_eq!(stored.result_output.as_deref(), Some("X"));
        assert_eq!(stored.prompt, "do a");
        assert!(matches!(
            db.set_step_run("zz", StepStatus::Failed, None, None).await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_edge_is_a_constraint_violation() {
        let db = seeded().await;
        let err = db.insert_edge(&edge("e3", "a", "c")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn deleting_a_step_cascades_to_its_edges() {
        let db = seeded().await;
        db.delete_step("a").await.unwrap();
        let edges = db.list_edges("wf").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id, "e2");
    }

    #[tokio::test]
    async fn deleting_a_workflow_cascades_everything() {
        let db = seeded().await;
        db.delete_workflow("wf").await.unwrap();
        assert!(db.list_steps("wf").await.unwrap().is_empty());
        assert!(db.list_edges("wf").await.unwrap().is_empty());
        assert!(matches!(
            db.get_workflow("wf").await,
            Err(DatabaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn workflow_status_updates() {
        let db = seeded().await;
        db.set_workflow_status("wf", WorkflowStatus::Ready)
            .await
            .unwrap();
        assert_eq!(
            db.get_workflow("wf").await.unwrap().status,
            WorkflowStatus::Ready
        );
        assert_eq!(db.list_workflows().await.unwrap().len(), 1);
    }
}
