//! Vector index: one embedding per (space, entity) with cosine nearest-neighbor search
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use tracing::{debug, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub per_space: HashMap<String, usize>,
    pub dimension: usize,
    pub index_type: String,
}

pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    cache: DashMap<(EmbeddingSpace, String), Vec<f32>>,
    /// Set once the cache mirrors the whole table; searches then skip SQLite.
    warmed: AtomicBool,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
            warmed: AtomicBool::new(false),
        }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Load every stored vector into memory.
    pub fn initialize_index(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT space, entity_id, embedding FROM embeddings")?;
        let mut rows = stmt.query([])?;

        let mut loaded = 0;
        while let Some(row) = rows.next()? {
            let space: String = row.get(0)?;
            let Some(space) = parse_space(&space) else {
                continue;
            };
            let entity_id: String = row.get(1)?;
            let bytes: Vec<u8> = row.get(2)?;
            let embedding: Vec<f32> = bincode::deserialize(&bytes)?;
            self.cache.insert((space, entity_id), embedding);
            loaded += 1;
        }

        self.warmed.store(true, Ordering::Release);
        info!("Embedding index warmed with {} vectors", loaded);
        Ok(loaded)
    }

    /// Insert or replace the vector for an entity.
    pub fn upsert(&self, space: EmbeddingSpace, entity_id: &str, embedding: &[f32], model: &str) -> Result<()> {
        if embedding.is_empty() {
            return Err(MemoryError::invalid_argument("embedding must not be empty"));
        }
        let bytes = bincode::serialize(embedding)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (space, entity_id, embedding, dimension, embedding_model, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                space.as_str(),
                entity_id,
                bytes,
                embedding.len() as i64,
                model,
                format_timestamp(&now_micros()),
            ],
        )?;
        self.cache.insert((space, entity_id.to_string()), embedding.to_vec());
        debug!("Stored {}-dim {} embedding for {}", embedding.len(), space, entity_id);
        Ok(())
    }

    pub fn get(&self, space: EmbeddingSpace, entity_id: &str) -> Result<Option<Vec<f32>>> {
        let key = (space, entity_id.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit.value().clone()));
        }
        if self.warmed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT embedding FROM embeddings WHERE space = ?1 AND entity_id = ?2")?;
        let mut rows = stmt.query(params![space.as_str(), entity_id])?;
        match rows.next()? {
            Some(row) => {
                let bytes: Vec<u8> = row.get(0)?;
                let embedding: Vec<f32> = bincode::deserialize(&bytes)?;
                self.cache.insert(key, embedding.clone());
                Ok(Some(embedding))
            }
            None => Ok(None),
        }
    }

    /// Vectors for a set of entities. Entities without a vector are absent.
    pub fn get_many(&self, space: EmbeddingSpace, ids: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(embedding) = self.get(space, id)? {
                found.insert(id.clone(), embedding);
            }
        }
        Ok(found)
    }

    pub fn delete(&self, space: EmbeddingSpace, entity_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            "DELETE FROM embeddings WHERE space = ?1 AND entity_id = ?2",
            params![space.as_str(), entity_id],
        )?;
        self.evict(space, entity_id);
        Ok(removed > 0)
    }

    /// Drop a cached vector whose row was removed elsewhere.
    pub fn evict(&self, space: EmbeddingSpace, entity_id: &str) {
        self.cache.remove(&(space, entity_id.to_string()));
    }

    /// Top `k` entities in `space` by cosine similarity, best first.
    pub fn nearest_neighbors(
        &self,
        space: EmbeddingSpace,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<Neighbor>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches = if self.warmed.load(Ordering::Acquire) {
            self.cache
                .iter()
                .filter(|entry| entry.key().0 == space)
                .map(|entry| Neighbor {
                    id: entry.key().1.clone(),
                    similarity: cosine_similarity(query, entry.value()),
                })
                .filter(|n| n.similarity >= min_similarity)
                .collect::<Vec<_>>()
        } else {
            self.nearest_neighbors_linear(space, query, min_similarity)?
        };

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    fn nearest_neighbors_linear(&self, space: EmbeddingSpace, query: &[f32], min_similarity: f32) -> Result<Vec<Neighbor>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT entity_id, embedding FROM embeddings WHERE space = ?1")?;
        let mut rows = stmt.query([space.as_str()])?;

        let mut matches = Vec::new();
        while let Some(row) = rows.next()? {
            let entity_id: String = row.get(0)?;
            let bytes: Vec<u8> = row.get(1)?;
            let embedding: Vec<f32> = bincode::deserialize(&bytes)?;
            let similarity = cosine_similarity(query, &embedding);
            if similarity >= min_similarity {
                matches.push(Neighbor { id: entity_id, similarity });
            }
        }
        Ok(matches)
    }

    pub fn get_stats(&self) -> Result<EmbeddingStats> {
        let conn = self.get_conn()?;
        let mut per_space = HashMap::new();
        let mut total = 0usize;
        {
            let mut stmt = conn.prepare("SELECT space, COUNT(*) FROM embeddings GROUP BY space")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let space: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                total += count as usize;
                per_space.insert(space, count as usize);
            }
        }
        let dimension: i64 = conn
            .query_row("SELECT COALESCE(MAX(dimension), 0) FROM embeddings", [], |row| row.get(0))?;

        let index_type = if self.warmed.load(Ordering::Acquire) {
            "in-memory".to_string()
        } else {
            "linear".to_string()
        };

        Ok(EmbeddingStats {
            total_embeddings: total,
            per_space,
            dimension: dimension as usize,
            index_type,
        })
    }
}

fn parse_space(raw: &str) -> Option<EmbeddingSpace> {
    EmbeddingSpace::ALL.into_iter().find(|s| s.as_str() == raw)
}

/// Cosine similarity; mismatched or zero-length vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    #[test]
    fn test_cosine_similarity_edges() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_neighbors_same_before_and_after_warmup() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let store = &db.embeddings;
        store.upsert(EmbeddingSpace::Session, "a", &[1.0, 0.0], "m").unwrap();
        store.upsert(EmbeddingSpace::Session, "b", &[0.7, 0.7], "m").unwrap();
        store.upsert(EmbeddingSpace::Session, "c", &[0.0, 1.0], "m").unwrap();
        store.upsert(EmbeddingSpace::Task, "t", &[1.0, 0.0], "m").unwrap();

        let cold = store.nearest_neighbors(EmbeddingSpace::Session, &[1.0, 0.1], 2, 0.0).unwrap();
        store.initialize_index().unwrap();
        let warm = store.nearest_neighbors(EmbeddingSpace::Session, &[1.0, 0.1], 2, 0.0).unwrap();

        assert_eq!(cold, warm);
        let ids: Vec<&str> = warm.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_delete_removes_vector() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        db.embeddings.upsert(EmbeddingSpace::Pattern, "p", &[0.5, 0.5], "m").unwrap();
        assert!(db.embeddings.delete(EmbeddingSpace::Pattern, "p").unwrap());
        assert!(db.embeddings.get(EmbeddingSpace::Pattern, "p").unwrap().is_none());
        assert!(db
            .embeddings
            .nearest_neighbors(EmbeddingSpace::Pattern, &[0.5, 0.5], 5, 0.0)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let err = db.embeddings.upsert(EmbeddingSpace::Task, "t", &[], "m").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }
}
