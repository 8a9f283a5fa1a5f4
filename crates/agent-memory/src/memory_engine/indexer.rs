//! Embedding maintenance for projects, tasks and anything stored while the
//! embedding backend was down.
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::{EmbeddingSpace, MemoryDatabase};
use crate::memory_engine::embedder::Embedder;
use crate::memory_engine::run_blocking;
use crate::utils::TextUtils;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub sessions: usize,
    pub tasks: usize,
    pub projects: usize,
    pub patterns: usize,
    pub failed: usize,
}

impl BackfillReport {
    pub fn total(&self) -> usize {
        self.sessions + self.tasks + self.projects + self.patterns
    }
}

pub struct EntityIndexer {
    database: Arc<MemoryDatabase>,
    embedder: Arc<Embedder>,
}

impl EntityIndexer {
    pub fn new(database: Arc<MemoryDatabase>, embedder: Arc<Embedder>) -> Self {
        Self { database, embedder }
    }

    /// Embed a project's name and description. Returns whether a vector was stored.
    pub async fn reindex_project(&self, project_id: &str) -> Result<bool> {
        let id = project_id.to_string();
        let project = run_blocking(&self.database, move |db| db.workspace.get_project(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("Project", project_id))?;
        let text = TextUtils::join_nonempty([Some(project.name.as_str()), project.description.as_deref()]);
        self.store(EmbeddingSpace::Project, &project.id, &text).await
    }

    /// Embed a task's title and description. Returns whether a vector was stored.
    pub async fn reindex_task(&self, task_id: &str) -> Result<bool> {
        let id = task_id.to_string();
        let task = run_blocking(&self.database, move |db| db.workspace.get_task(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("Task", task_id))?;
        let text = TextUtils::join_nonempty([Some(task.title.as_str()), task.description.as_deref()]);
        self.store(EmbeddingSpace::Task, &task.id, &text).await
    }

    /// Embed up to `limit` entities of each kind that have no vector yet.
    /// Sessions without a summary are left alone.
    pub async fn backfill(&self, limit: usize) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        let sessions = run_blocking(&self.database, move |db| db.sessions.sessions_missing_embedding(limit)).await?;
        for session in sessions {
            let Some(summary) = session.summary.as_deref() else { continue };
            tally(&mut report.sessions, &mut report.failed, self.store(EmbeddingSpace::Session, &session.id, summary).await?);
        }

        let projects = run_blocking(&self.database, move |db| db.workspace.projects_missing_embedding(limit)).await?;
        for project in projects {
            let text = TextUtils::join_nonempty([Some(project.name.as_str()), project.description.as_deref()]);
            tally(&mut report.projects, &mut report.failed, self.store(EmbeddingSpace::Project, &project.id, &text).await?);
        }

        let tasks = run_blocking(&self.database, move |db| db.workspace.tasks_missing_embedding(limit)).await?;
        for task in tasks {
            let text = TextUtils::join_nonempty([Some(task.title.as_str()), task.description.as_deref()]);
            tally(&mut report.tasks, &mut report.failed, self.store(EmbeddingSpace::Task, &task.id, &text).await?);
        }

        let patterns = run_blocking(&self.database, move |db| db.patterns.patterns_missing_embedding(limit)).await?;
        for pattern in patterns {
            let text = pattern.embedding_text();
            tally(&mut report.patterns, &mut report.failed, self.store(EmbeddingSpace::Pattern, &pattern.id, &text).await?);
        }

        info!(
            "Backfill embedded {} entities ({} failed)",
            report.total(),
            report.failed
        );
        Ok(report)
    }

    async fn store(&self, space: EmbeddingSpace, entity_id: &str, text: &str) -> Result<bool> {
        let Some(vector) = self.embedder.embed(text).await else {
            warn!("Could not embed {} {}", space, entity_id);
            return Ok(false);
        };
        let id = entity_id.to_string();
        let model = self.embedder.model_name().to_string();
        run_blocking(&self.database, move |db| db.embeddings.upsert(space, &id, &vector, &model)).await?;
        Ok(true)
    }
}

fn tally(done: &mut usize, failed: &mut usize, stored: bool) {
    if stored {
        *done += 1;
    } else {
        *failed += 1;
    }
}
