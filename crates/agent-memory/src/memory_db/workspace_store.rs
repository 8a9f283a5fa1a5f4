//! Minimal project and task rows, enough to index and hydrate search hits
use crate::error::Result;
use crate::memory_db::schema::*;
use crate::memory_db::session_store::parse_agent_column;
use rusqlite::{params, Row};
use serde_json::{Map, Value};
use uuid::Uuid;
use tracing::debug;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const PROJECT_COLUMNS: &str = "id, name, description, status, metadata, created_at";
const TASK_COLUMNS: &str = "id, project_id, title, description, status, assigned_agent, metadata, created_at";

pub struct WorkspaceStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl WorkspaceStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn insert_project(
        &self,
        name: &str,
        description: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<Project> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            status: "active".to_string(),
            metadata,
            created_at: now_micros(),
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO projects (id, name, description, status, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &project.id,
                &project.name,
                &project.description,
                &project.status,
                serde_json::to_string(&project.metadata)?,
                format_timestamp(&project.created_at),
            ],
        )?;
        debug!("Inserted project {}", project.id);
        Ok(project)
    }

    pub fn insert_task(
        &self,
        project_id: Option<&str>,
        title: &str,
        description: Option<&str>,
        assigned_agent: Option<Agent>,
        metadata: Map<String, Value>,
    ) -> Result<Task> {
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.map(str::to_string),
            title: title.to_string(),
            description: description.map(str::to_string),
            status: "todo".to_string(),
            assigned_agent,
            metadata,
            created_at: now_micros(),
        };
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO tasks (id, project_id, title, description, status, assigned_agent, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &task.id,
                &task.project_id,
                &task.title,
                &task.description,
                &task.status,
                task.assigned_agent.map(|a| a.as_str()),
                serde_json::to_string(&task.metadata)?,
                format_timestamp(&task.created_at),
            ],
        )?;
        debug!("Inserted task {}", task.id);
        Ok(task)
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        Ok(self.get_projects(&[project_id.to_string()])?.into_iter().next())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.get_tasks(&[task_id.to_string()])?.into_iter().next())
    }

    pub fn get_projects(&self, ids: &[String]) -> Result<Vec<Project>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE id IN ({})",
            PROJECT_COLUMNS, placeholders
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(row_to_project(row)?);
        }
        Ok(projects)
    }

    pub fn get_tasks(&self, ids: &[String]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE id IN ({})",
            TASK_COLUMNS, placeholders
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)?);
        }
        Ok(tasks)
    }

    pub fn projects_missing_embedding(&self, limit: usize) -> Result<Vec<Project>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects p
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.space = 'project' AND e.entity_id = p.id)
             ORDER BY p.created_at LIMIT ?1",
            PROJECT_COLUMNS
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(row_to_project(row)?);
        }
        Ok(projects)
    }

    pub fn tasks_missing_embedding(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks t
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.space = 'task' AND e.entity_id = t.id)
             ORDER BY t.created_at LIMIT ?1",
            TASK_COLUMNS
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)?);
        }
        Ok(tasks)
    }
}

fn row_to_project(row: &Row) -> Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        status: row.get(3)?,
        metadata: parse_object(&row.get::<_, String>(4)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_task(row: &Row) -> Result<Task> {
    let assigned: Option<String> = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assigned_agent: assigned.as_deref().map(parse_agent_column).transpose()?,
        metadata: parse_object(&row.get::<_, String>(6)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    #[test]
    fn test_project_and_task_roundtrip() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let project = db.workspace.insert_project("Billing", Some("Invoice pipeline"), Map::new()).unwrap();
        let task = db
            .workspace
            .insert_task(Some(&project.id), "Fix rounding", None, Some(Agent::Gpt), Map::new())
            .unwrap();

        let loaded = db.workspace.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.project_id.as_deref(), Some(project.id.as_str()));
        assert_eq!(loaded.assigned_agent, Some(Agent::Gpt));
        assert_eq!(db.workspace.get_project(&project.id).unwrap().unwrap().name, "Billing");
        assert!(db.workspace.get_task("missing").unwrap().is_none());
    }

    #[test]
    fn test_missing_embedding_listing() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = db.workspace.insert_project("A", None, Map::new()).unwrap();
        let b = db.workspace.insert_project("B", None, Map::new()).unwrap();
        db.embeddings.upsert(EmbeddingSpace::Project, &a.id, &[1.0], "m").unwrap();

        let missing = db.workspace.projects_missing_embedding(10).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, b.id);
    }
}
