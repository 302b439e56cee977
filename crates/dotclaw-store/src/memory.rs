//! Typed memory persistence (`memory.db`).
//!
//! Rows live in `memories`; an FTS5 table mirrors a "matchable" document
//! combining content and normalized tags. Embeddings are optional BLOB
//! columns (little-endian f32), back-filled by a batch worker; vector
//! search is brute-force cosine over the group's embedded rows.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};

use dotclaw_types::memory::{MemoryItem, MemoryScope, MemoryStats};

use crate::db::Db;
use crate::error::Result;

const MEMORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id           TEXT PRIMARY KEY,
    group_folder TEXT NOT NULL,
    scope        TEXT NOT NULL,
    subject_id   TEXT,
    type         TEXT NOT NULL,
    content      TEXT NOT NULL,
    tags         TEXT NOT NULL DEFAULT '[]',
    metadata     TEXT NOT NULL DEFAULT '{}',
    importance   REAL NOT NULL DEFAULT 0.5,
    confidence   REAL NOT NULL DEFAULT 0.5,
    conflict_key TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    embedding    BLOB
);
CREATE INDEX IF NOT EXISTS idx_memories_group ON memories (group_folder, scope, subject_id);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(id UNINDEXED, matchable);
"#;

/// Filter for list/forget operations.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Restrict to one scope.
    pub scope: Option<MemoryScope>,
    /// Restrict to one subject.
    pub subject_id: Option<String>,
    /// Restrict to one type tag.
    pub kind: Option<String>,
}

/// A memory row with its retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    /// The row.
    pub item: MemoryItem,
    /// Higher is better; keyword and vector paths are normalized to the
    /// same direction before merging.
    pub score: f64,
}

/// Handle over `memory.db`.
#[derive(Clone)]
pub struct MemoryStore {
    db: Db,
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

fn matchable(content: &str, tags: &[String]) -> String {
    let mut doc = content.to_lowercase();
    for tag in tags {
        doc.push(' ');
        doc.push_str(&tag.to_lowercase());
    }
    doc
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<MemoryItem> {
    let scope: String = row.get("scope")?;
    let tags: String = row.get("tags")?;
    let metadata: String = row.get("metadata")?;
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(MemoryItem {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        scope: MemoryScope::parse(&scope).unwrap_or(MemoryScope::Group),
        subject_id: row.get("subject_id")?,
        kind: row.get("type")?,
        content: row.get("content")?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        importance: row.get("importance")?,
        confidence: row.get("confidence")?,
        conflict_key: row.get("conflict_key")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        embedding: embedding.map(|b| decode_embedding(&b)),
    })
}

fn insert_item(conn: &Connection, item: &MemoryItem) -> Result<()> {
    // Newest write wins on a conflict key.
    if let Some(key) = &item.conflict_key {
        let mut stmt = conn.prepare(
            "SELECT id FROM memories
             WHERE group_folder = ?1 AND scope = ?2 AND subject_id IS ?3 AND conflict_key = ?4",
        )?;
        let old_ids: Vec<String> = stmt
            .query_map(
                params![item.group_folder, item.scope.as_str(), item.subject_id, key],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<_>>()?;
        for old in old_ids {
            conn.execute("DELETE FROM memories WHERE id = ?1", params![old])?;
            conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![old])?;
        }
    }

    conn.execute(
        "INSERT OR REPLACE INTO memories (id, group_folder, scope, subject_id, type, content,
            tags, metadata, importance, confidence, conflict_key, created_at, updated_at, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            item.id,
            item.group_folder,
            item.scope.as_str(),
            item.subject_id,
            item.kind,
            item.content,
            serde_json::to_string(&item.tags)?,
            serde_json::to_string(&item.metadata)?,
            item.importance,
            item.confidence,
            item.conflict_key,
            item.created_at,
            item.updated_at,
            item.embedding.as_deref().map(encode_embedding)
        ],
    )?;
    conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![item.id])?;
    conn.execute(
        "INSERT INTO memories_fts (id, matchable) VALUES (?1, ?2)",
        params![item.id, matchable(&item.content, &item.tags)],
    )?;
    Ok(())
}

impl MemoryStore {
    /// Open (or create) the memory store at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Db::open(path.as_ref().to_path_buf(), MEMORY_SCHEMA).await?;
        Ok(Self { db })
    }

    /// Insert or replace memories in one transaction.
    ///
    /// For each item with a `conflict_key`, any prior row with the same
    /// `(group_folder, scope, subject_id, conflict_key)` is replaced.
    pub async fn upsert(&self, items: Vec<MemoryItem>) -> Result<()> {
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                for item in &items {
                    insert_item(&tx, item)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Keyword search via the FTS index, scoped to one group plus
    /// global-scope memories. Tokens are OR-combined; the bm25 rank is
    /// negated so higher is better.
    pub async fn search_keyword(
        &self,
        group_folder: &str,
        tokens: &[String],
        limit: u32,
    ) -> Result<Vec<ScoredMemory>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let group_folder = group_folder.to_string();
        let match_expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.*, bm25(memories_fts) AS rank
                     FROM memories_fts
                     JOIN memories m ON m.id = memories_fts.id
                     WHERE memories_fts MATCH ?1
                       AND (m.group_folder = ?2 OR m.scope = 'global')
                     ORDER BY rank ASC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![match_expr, group_folder, limit as i64], |row| {
                    let rank: f64 = row.get("rank")?;
                    Ok(ScoredMemory {
                        item: row_to_item(row)?,
                        score: -rank,
                    })
                })?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }

    /// Vector search: cosine similarity against every embedded row of the
    /// group (plus global scope), top-k by descending score.
    pub async fn search_vector(
        &self,
        group_folder: &str,
        query: Vec<f32>,
        limit: u32,
    ) -> Result<Vec<ScoredMemory>> {
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let group_folder = group_folder.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memories
                     WHERE embedding IS NOT NULL AND (group_folder = ?1 OR scope = 'global')",
                )?;
                let rows = stmt.query_map(params![group_folder], row_to_item)?;
                let mut scored: Vec<ScoredMemory> = rows
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .map(|item| {
                        let score = item
                            .embedding
                            .as_deref()
                            .map(|e| cosine_similarity(&query, e))
                            .unwrap_or(0.0);
                        ScoredMemory { item, score }
                    })
                    .collect();
                scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(limit as usize);
                Ok(scored)
            })
            .await
    }

    /// List memories for a group with an optional filter, newest first.
    pub async fn list(
        &self,
        group_folder: &str,
        filter: MemoryFilter,
        limit: u32,
    ) -> Result<Vec<MemoryItem>> {
        let group_folder = group_folder.to_string();
        self.db
            .call(move |conn| {
                let mut sql =
                    String::from("SELECT * FROM memories WHERE group_folder = ?1");
                let mut args: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(group_folder)];
                if let Some(scope) = filter.scope {
                    args.push(Box::new(scope.as_str().to_string()));
                    sql.push_str(&format!(" AND scope = ?{}", args.len()));
                }
                if let Some(subject) = filter.subject_id {
                    args.push(Box::new(subject));
                    sql.push_str(&format!(" AND subject_id = ?{}", args.len()));
                }
                if let Some(kind) = filter.kind {
                    args.push(Box::new(kind));
                    sql.push_str(&format!(" AND type = ?{}", args.len()));
                }
                args.push(Box::new(limit as i64));
                sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    row_to_item,
                )?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }

    /// Delete a memory by id within a group. Returns whether a row was
    /// removed.
    pub async fn forget(&self, group_folder: &str, id: &str) -> Result<bool> {
        let (group_folder, id) = (group_folder.to_string(), id.to_string());
        self.db
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM memories WHERE id = ?1 AND group_folder = ?2",
                    params![id, group_folder],
                )?;
                if n > 0 {
                    conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![id])?;
                }
                Ok(n > 0)
            })
            .await
    }

    /// Aggregate statistics for a group.
    pub async fn stats(&self, group_folder: &str) -> Result<MemoryStats> {
        let group_folder = group_folder.to_string();
        self.db
            .call(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE group_folder = ?1",
                    params![group_folder],
                    |row| row.get(0),
                )?;
                let embedded: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE group_folder = ?1 AND embedding IS NOT NULL",
                    params![group_folder],
                    |row| row.get(0),
                )?;
                let mut by_type = HashMap::new();
                let mut stmt = conn.prepare(
                    "SELECT type, COUNT(*) FROM memories WHERE group_folder = ?1 GROUP BY type",
                )?;
                let rows = stmt.query_map(params![group_folder], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (kind, count) = row?;
                    by_type.insert(kind, count as u64);
                }
                Ok(MemoryStats {
                    total: total as u64,
                    by_type,
                    embedded: embedded as u64,
                })
            })
            .await
    }

    /// Rows without an embedding, oldest first, for the backfill worker.
    pub async fn missing_embeddings(&self, limit: u32) -> Result<Vec<(String, String)>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, content FROM memories WHERE embedding IS NULL
                     ORDER BY created_at ASC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<_>>().map_err(Into::into)
            })
            .await
    }

    /// Backfill one row's embedding.
    pub async fn set_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<()> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE memories SET embedding = ?2 WHERE id = ?1",
                    params![id, encode_embedding(&embedding)],
                )?;
                Ok(())
            })
            .await
    }

    /// Fetch one memory by id.
    pub async fn get(&self, id: &str) -> Result<Option<MemoryItem>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_item)
                    .optional()
                    .map_err(Into::into)
            })
            .await
    }
}
