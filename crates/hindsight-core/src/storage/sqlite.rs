//! SQLite-backed storage: one file per engine instance, WAL mode, FTS5 for
//! lexical search. A writer and a reader connection share the file so reads
//! never block behind a write transaction.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::model::*;

pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> StorageResult<()> {
        #[cfg(feature = "encryption")]
        {
            if let Ok(key) = std::env::var("HINDSIGHT_ENCRYPTION_KEY") {
                if !key.is_empty() {
                    conn.pragma_update(None, "key", &key)?;
                }
            }
        }

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    pub fn open(db_path: Option<PathBuf>) -> StorageResult<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("com", "hindsight", "core")
                    .ok_or_else(|| StorageError::Init("could not determine project directories".into()))?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700));
                }
                data_dir.join("hindsight.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self { writer: Mutex::new(writer_conn), reader: Mutex::new(reader_conn) })
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let writer_conn = Connection::open_in_memory()?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;
        // a second in-memory connection would be a distinct empty database,
        // so tests share one connection for both roles.
        let reader_conn = Connection::open(":memory:")?;
        Self::configure_connection(&reader_conn)?;
        super::migrations::apply_migrations(&reader_conn)?;
        Ok(Self { writer: Mutex::new(writer_conn), reader: Mutex::new(reader_conn) })
    }

    /// Run `f` inside a single writer transaction. `spec.md` §5 requires the
    /// retain pipeline's persist step to land in one transaction.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut conn = self.writer.lock().expect("writer lock poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn reader(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().expect("reader lock poisoned")
    }

    // ------------------------------------------------------------------
    // Banks
    // ------------------------------------------------------------------

    pub fn create_bank(&self, bank: &Bank) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute(
            "INSERT INTO banks (id, name, description, config, disposition, mission, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                bank.id,
                bank.name,
                bank.description,
                serde_json::to_string(&bank.config)?,
                serde_json::to_string(&bank.disposition)?,
                bank.mission,
                bank.created_at.to_rfc3339(),
                bank.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_bank(&self, bank_id: &str) -> StorageResult<Option<Bank>> {
        self.reader()
            .query_row("SELECT * FROM banks WHERE id = ?1", params![bank_id], |row| row_to_bank(row))
            .optional()
            .map_err(StorageError::from)
    }

    pub fn update_bank_config(&self, bank_id: &str, config: &BankConfig) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        let changed = conn.execute(
            "UPDATE banks SET config = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(config)?, Utc::now().to_rfc3339(), bank_id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("bank {bank_id}")));
        }
        Ok(())
    }

    pub fn delete_bank(&self, bank_id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute("DELETE FROM banks WHERE id = ?1", params![bank_id])?;
        Ok(())
    }

    pub fn list_banks(&self) -> StorageResult<Vec<Bank>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM banks ORDER BY created_at, id")?;
        let rows = stmt.query_map([], row_to_bank)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    // ------------------------------------------------------------------
    // Documents / chunks
    // ------------------------------------------------------------------

    pub fn insert_document_tx(tx: &rusqlite::Transaction, document: &Document) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO documents (id, bank_id, content, content_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![document.id, document.bank_id, document.content, document.content_hash, document.created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn find_document_by_hash(&self, bank_id: &str, content_hash: &str) -> StorageResult<Option<Document>> {
        self.reader()
            .query_row(
                "SELECT * FROM documents WHERE bank_id = ?1 AND content_hash = ?2",
                params![bank_id, content_hash],
                row_to_document,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn insert_chunk_tx(tx: &rusqlite::Transaction, chunk: &Chunk) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO chunks (id, document_id, bank_id, content, ordinal) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chunk.id, chunk.document_id, chunk.bank_id, chunk.content, chunk.ordinal],
        )?;
        Ok(())
    }

    /// Delete a document and every memory that was extracted from it,
    /// cascading to chunks/links/entity mentions via foreign keys.
    pub fn delete_document_cascade(&self, document_id: &str) -> StorageResult<usize> {
        self.transaction(|tx| {
            let deleted = tx.execute("DELETE FROM memory_units WHERE document_id = ?1", params![document_id])?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;
            Ok(deleted)
        })
    }

    // ------------------------------------------------------------------
    // Memory units
    // ------------------------------------------------------------------

    pub fn insert_memory_tx(tx: &rusqlite::Transaction, m: &MemoryUnit) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO memory_units (
                id, bank_id, content, fact_type, confidence, document_id, chunk_id,
                event_date_ms, occurred_start_ms, occurred_end_ms, mentioned_at_ms,
                metadata, tags, source_text, access_count, last_accessed,
                encoding_strength, gist, scope, consolidated_at, proof_count,
                source_memory_ids, history, created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
            params![
                m.id, m.bank_id, m.content, m.fact_type.as_str(), m.confidence,
                m.document_id, m.chunk_id, m.event_date_ms, m.occurred_start_ms, m.occurred_end_ms,
                m.mentioned_at_ms, serde_json::to_string(&m.metadata)?, serde_json::to_string(&m.tags)?,
                m.source_text, m.access_count, m.last_accessed.to_rfc3339(), m.encoding_strength,
                m.gist, m.scope.as_str(), m.consolidated_at.map(|d| d.to_rfc3339()), m.proof_count,
                serde_json::to_string(&m.source_memory_ids)?, serde_json::to_string(&m.history)?,
                m.created_at.to_rfc3339(), m.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_memory(&self, bank_id: &str, memory_id: &str) -> StorageResult<Option<MemoryUnit>> {
        self.reader()
            .query_row(
                "SELECT * FROM memory_units WHERE id = ?1 AND bank_id = ?2",
                params![memory_id, bank_id],
                row_to_memory,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn get_memories(&self, bank_id: &str, ids: &[String]) -> StorageResult<Vec<MemoryUnit>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM memory_units WHERE bank_id = ? AND id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let mut bind_params: Vec<&dyn rusqlite::ToSql> = vec![&bank_id];
        for id in ids {
            bind_params.push(id);
        }
        let rows = stmt.query_map(bind_params.as_slice(), row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    /// Introspection listing (`spec.md` §6 `listMemoryUnits`): newest first,
    /// cursor-paginated on `(event_date_ms, id)` so pages don't shift under
    /// concurrent writes.
    pub fn list_memory_units(
        &self,
        bank_id: &str,
        before: Option<(i64, &str)>,
        limit: usize,
    ) -> StorageResult<Vec<MemoryUnit>> {
        let conn = self.reader();
        match before {
            Some((event_date_ms, id)) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memory_units WHERE bank_id = ?1
                     AND (event_date_ms < ?2 OR (event_date_ms = ?2 AND id < ?3))
                     ORDER BY event_date_ms DESC, id DESC LIMIT ?4",
                )?;
                let rows = stmt.query_map(params![bank_id, event_date_ms, id, limit as i64], row_to_memory)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM memory_units WHERE bank_id = ?1 ORDER BY event_date_ms DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![bank_id, limit as i64], row_to_memory)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
            }
        }
    }

    /// Distinct tags across every memory in the bank (`spec.md` §6 `listTags`).
    /// `tags` is stored as a JSON array column rather than a normalized
    /// table, so this aggregates in Rust after a single scan.
    pub fn list_tags(&self, bank_id: &str) -> StorageResult<Vec<String>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT tags FROM memory_units WHERE bank_id = ?1")?;
        let rows = stmt.query_map(params![bank_id], |row| row.get::<_, String>(0))?;
        let mut tags: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for raw in rows {
            let raw = raw?;
            let parsed: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
            tags.extend(parsed);
        }
        Ok(tags.into_iter().collect())
    }

    /// Reinforce, reconsolidate, and consolidation updates all rewrite the
    /// full row; callers build the new `MemoryUnit` in memory first.
    pub fn update_memory_tx(tx: &rusqlite::Transaction, m: &MemoryUnit) -> StorageResult<()> {
        tx.execute(
            "UPDATE memory_units SET
                content = ?1, confidence = ?2, metadata = ?3, tags = ?4,
                access_count = ?5, last_accessed = ?6, encoding_strength = ?7,
                gist = ?8, consolidated_at = ?9, proof_count = ?10,
                source_memory_ids = ?11, history = ?12, updated_at = ?13
             WHERE id = ?14 AND bank_id = ?15",
            params![
                m.content, m.confidence, serde_json::to_string(&m.metadata)?, serde_json::to_string(&m.tags)?,
                m.access_count, m.last_accessed.to_rfc3339(), m.encoding_strength, m.gist,
                m.consolidated_at.map(|d| d.to_rfc3339()), m.proof_count,
                serde_json::to_string(&m.source_memory_ids)?, serde_json::to_string(&m.history)?,
                m.updated_at.to_rfc3339(), m.id, m.bank_id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_memory(&self, bank_id: &str, memory_id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute("DELETE FROM memory_units WHERE id = ?1 AND bank_id = ?2", params![memory_id, bank_id])?;
        Ok(())
    }

    /// Candidates for the router: memories within `window_ms` of `event_date_ms`,
    /// newest first, for the kNN + temporal-proximity pass (`spec.md` §4.4).
    pub fn memories_in_temporal_window(
        &self,
        bank_id: &str,
        event_date_ms: i64,
        window_ms: i64,
        limit: usize,
    ) -> StorageResult<Vec<MemoryUnit>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM memory_units
             WHERE bank_id = ?1 AND event_date_ms BETWEEN ?2 AND ?3
             ORDER BY event_date_ms DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![bank_id, event_date_ms - window_ms, event_date_ms + window_ms, limit as i64],
            row_to_memory,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn fts_search(&self, bank_id: &str, query: &str, limit: usize) -> StorageResult<Vec<(String, f32)>> {
        if query.trim().is_empty() {
            return Ok(vec![]);
        }
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT id, bm25(hs_memory_fts) AS rank FROM hs_memory_fts
             WHERE hs_memory_fts MATCH ?1 AND bank_id = ?2 ORDER BY rank LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![query, bank_id, limit as i64], |row| {
            let id: String = row.get(0)?;
            let rank: f64 = row.get(1)?;
            // bm25() is negative and lower-is-better; flip sign for a
            // higher-is-better score consistent with the other sources.
            Ok((id, -rank as f32))
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn unconsolidated_memories(&self, bank_id: &str, limit: usize) -> StorageResult<Vec<MemoryUnit>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM memory_units WHERE bank_id = ?1 AND consolidated_at IS NULL
             AND fact_type != 'observation' ORDER BY created_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bank_id, limit as i64], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn observations(&self, bank_id: &str) -> StorageResult<Vec<MemoryUnit>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM memory_units WHERE bank_id = ?1 AND fact_type = 'observation' ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![bank_id], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn entities_by_bank(&self, bank_id: &str) -> StorageResult<Vec<Entity>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM entities WHERE bank_id = ?1")?;
        let rows = stmt.query_map(params![bank_id], row_to_entity)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn get_entity(&self, bank_id: &str, entity_id: &str) -> StorageResult<Option<Entity>> {
        self.reader()
            .query_row(
                "SELECT * FROM entities WHERE id = ?1 AND bank_id = ?2",
                params![entity_id, bank_id],
                row_to_entity,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn insert_entity_tx(tx: &rusqlite::Transaction, e: &Entity) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO entities (id, bank_id, name, entity_type, mention_count, first_seen, last_updated, description, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                e.id, e.bank_id, e.name, e.entity_type.as_str(), e.mention_count,
                e.first_seen.to_rfc3339(), e.last_updated.to_rfc3339(), e.description,
                serde_json::to_string(&e.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn touch_entity_tx(tx: &rusqlite::Transaction, entity_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        tx.execute(
            "UPDATE entities SET mention_count = mention_count + 1, last_updated = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), entity_id],
        )?;
        Ok(())
    }

    pub fn link_entity_mention_tx(tx: &rusqlite::Transaction, entity_id: &str, memory_id: &str) -> StorageResult<()> {
        tx.execute(
            "INSERT OR IGNORE INTO entity_mentions (entity_id, memory_id) VALUES (?1, ?2)",
            params![entity_id, memory_id],
        )?;
        Ok(())
    }

    /// Most recently created memory already linked to `entity_id`, if any —
    /// lets the link builder chain entity links across retain calls instead
    /// of only within the current write's batch.
    pub fn latest_memory_for_entity_tx(
        tx: &rusqlite::Transaction,
        entity_id: &str,
    ) -> StorageResult<Option<String>> {
        tx.query_row(
            "SELECT em.memory_id FROM entity_mentions em JOIN memory_units m ON m.id = em.memory_id
             WHERE em.entity_id = ?1 ORDER BY m.created_at DESC LIMIT 1",
            params![entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub fn entities_for_memory(&self, memory_id: &str) -> StorageResult<Vec<Entity>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT e.* FROM entities e JOIN entity_mentions em ON em.entity_id = e.id WHERE em.memory_id = ?1",
        )?;
        let rows = stmt.query_map(params![memory_id], row_to_entity)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    /// Memories mentioning `entity_id`, newest first — backs reflect's
    /// `get_entity` tool (`spec.md` §4.10 `relatedMemories`).
    pub fn memories_for_entity(&self, entity_id: &str, limit: usize) -> StorageResult<Vec<MemoryUnit>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT m.* FROM memory_units m JOIN entity_mentions em ON em.memory_id = m.id
             WHERE em.entity_id = ?1 ORDER BY m.created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![entity_id, limit as i64], row_to_memory)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn bump_cooccurrence_tx(tx: &rusqlite::Transaction, bank_id: &str, entity_a: &str, entity_b: &str) -> StorageResult<()> {
        let (a, b) = if entity_a < entity_b { (entity_a, entity_b) } else { (entity_b, entity_a) };
        tx.execute(
            "INSERT INTO entity_cooccurrences (bank_id, entity_a, entity_b, count) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(entity_a, entity_b) DO UPDATE SET count = count + 1",
            params![bank_id, a, b],
        )?;
        Ok(())
    }

    pub fn cooccurrence_count(&self, entity_a: &str, entity_b: &str) -> StorageResult<i64> {
        let (a, b) = if entity_a < entity_b { (entity_a, entity_b) } else { (entity_b, entity_a) };
        self.reader()
            .query_row(
                "SELECT count FROM entity_cooccurrences WHERE entity_a = ?1 AND entity_b = ?2",
                params![a, b],
                |row| row.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
            .map_err(StorageError::from)
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    pub fn insert_link_tx(tx: &rusqlite::Transaction, link: &MemoryLink) -> StorageResult<()> {
        tx.execute(
            "INSERT OR IGNORE INTO memory_links (id, bank_id, source_id, target_id, link_type, weight, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                link.id, link.bank_id, link.source_id, link.target_id,
                link.link_type.as_str(), link.weight, link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn links_from(&self, memory_id: &str) -> StorageResult<Vec<MemoryLink>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM memory_links WHERE source_id = ?1 OR target_id = ?1",
        )?;
        let rows = stmt.query_map(params![memory_id], row_to_link)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    /// Graph candidate source for recall: memories within `hops` of `seed_ids`.
    pub fn graph_neighbors(&self, seed_ids: &[String], hops: u32) -> StorageResult<Vec<(String, f32)>> {
        use std::collections::{HashMap, HashSet, VecDeque};
        let mut frontier: VecDeque<(String, u32)> = seed_ids.iter().map(|id| (id.clone(), 0)).collect();
        let mut visited: HashSet<String> = seed_ids.iter().cloned().collect();
        let mut scores: HashMap<String, f32> = HashMap::new();

        while let Some((id, depth)) = frontier.pop_front() {
            if depth >= hops {
                continue;
            }
            for link in self.links_from(&id)? {
                let neighbor = if link.source_id == id { link.target_id } else { link.source_id };
                if visited.insert(neighbor.clone()) {
                    let decay = 1.0 / (depth as f32 + 2.0);
                    scores.insert(neighbor.clone(), link.weight * decay);
                    frontier.push_back((neighbor, depth + 1));
                }
            }
        }

        let mut out: Vec<(String, f32)> = scores.into_iter().collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    pub fn latest_episode(&self, bank_id: &str, scope: Scope) -> StorageResult<Option<Episode>> {
        self.reader()
            .query_row(
                "SELECT * FROM episodes WHERE bank_id = ?1 AND scope = ?2 ORDER BY last_event_at DESC LIMIT 1",
                params![bank_id, scope.as_str()],
                row_to_episode,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn insert_episode_tx(tx: &rusqlite::Transaction, ep: &Episode) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO episodes (id, bank_id, scope, start_at, end_at, last_event_at, event_count, boundary_reason)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                ep.id, ep.bank_id, ep.scope.as_str(), ep.start_at.to_rfc3339(),
                ep.end_at.map(|d| d.to_rfc3339()), ep.last_event_at.to_rfc3339(),
                ep.event_count, ep.boundary_reason.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn touch_episode_tx(tx: &rusqlite::Transaction, episode_id: &str, at: DateTime<Utc>) -> StorageResult<()> {
        tx.execute(
            "UPDATE episodes SET last_event_at = ?1, event_count = event_count + 1 WHERE id = ?2",
            params![at.to_rfc3339(), episode_id],
        )?;
        Ok(())
    }

    pub fn close_episode_tx(tx: &rusqlite::Transaction, episode_id: &str, end_at: DateTime<Utc>) -> StorageResult<()> {
        tx.execute("UPDATE episodes SET end_at = ?1 WHERE id = ?2", params![end_at.to_rfc3339(), episode_id])?;
        Ok(())
    }

    pub fn insert_episode_event_tx(tx: &rusqlite::Transaction, event: &EpisodeEvent) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO episode_events (id, episode_id, memory_id, route, event_time) VALUES (?1,?2,?3,?4,?5)",
            params![event.id, event.episode_id, event.memory_id, event.route, event.event_time.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_episode_temporal_link_tx(tx: &rusqlite::Transaction, link: &EpisodeTemporalLink) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO episode_temporal_links (id, bank_id, prior_episode_id, next_episode_id, gap_ms) VALUES (?1,?2,?3,?4,?5)",
            params![link.id, link.bank_id, link.prior_episode_id, link.next_episode_id, link.gap_ms],
        )?;
        Ok(())
    }

    /// Episodes for `bank_id` ordered newest-first, with a cursor on
    /// `last_event_at` for narrative pagination (`spec.md` §4.7).
    pub fn list_episodes(&self, bank_id: &str, before_ms: Option<i64>, limit: usize) -> StorageResult<Vec<Episode>> {
        let conn = self.reader();
        let (sql, before) = match before_ms {
            Some(ms) => (
                "SELECT * FROM episodes WHERE bank_id = ?1 AND last_event_at < ?2 ORDER BY last_event_at DESC LIMIT ?3",
                DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default().to_rfc3339(),
            ),
            None => (
                "SELECT * FROM episodes WHERE bank_id = ?1 AND last_event_at < ?2 ORDER BY last_event_at DESC LIMIT ?3",
                Utc::now().to_rfc3339(),
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![bank_id, before, limit as i64], row_to_episode)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn episode_events(&self, episode_id: &str) -> StorageResult<Vec<EpisodeEvent>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM episode_events WHERE episode_id = ?1 ORDER BY event_time ASC")?;
        let rows = stmt.query_map(params![episode_id], row_to_episode_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn episode_by_id(&self, episode_id: &str) -> StorageResult<Option<Episode>> {
        self.reader()
            .query_row("SELECT * FROM episodes WHERE id = ?1", params![episode_id], row_to_episode)
            .optional()
            .map_err(StorageError::from)
    }

    /// The episode a given memory's write landed in, via its `episode_events` row.
    pub fn episode_for_memory(&self, memory_id: &str) -> StorageResult<Option<String>> {
        self.reader()
            .query_row(
                "SELECT episode_id FROM episode_events WHERE memory_id = ?1 ORDER BY event_time DESC LIMIT 1",
                params![memory_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(StorageError::from)
    }

    /// Walk one step toward the past along the episode chain (`spec.md` §4.6 narrative).
    pub fn prior_episode(&self, episode_id: &str) -> StorageResult<Option<Episode>> {
        self.reader()
            .query_row(
                "SELECT e.* FROM episodes e JOIN episode_temporal_links l ON l.prior_episode_id = e.id
                 WHERE l.next_episode_id = ?1",
                params![episode_id],
                row_to_episode,
            )
            .optional()
            .map_err(StorageError::from)
    }

    /// Walk one step toward the future along the episode chain. `episode_temporal_links`
    /// only indexes `prior_episode_id`, so this scans the (typically tiny) per-bank link
    /// set rather than a dedicated index on `next_episode_id`.
    pub fn next_episode(&self, bank_id: &str, episode_id: &str) -> StorageResult<Option<Episode>> {
        self.reader()
            .query_row(
                "SELECT e.* FROM episodes e JOIN episode_temporal_links l ON l.next_episode_id = e.id
                 WHERE l.prior_episode_id = ?1 AND l.bank_id = ?2",
                params![episode_id, bank_id],
                row_to_episode,
            )
            .optional()
            .map_err(StorageError::from)
    }

    // ------------------------------------------------------------------
    // Mental models / directives
    // ------------------------------------------------------------------

    pub fn upsert_mental_model(&self, mm: &MentalModel) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute(
            "INSERT INTO mental_models (id, bank_id, name, source_query, content, source_memory_ids, tags, auto_refresh, last_refreshed_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
             ON CONFLICT(id) DO UPDATE SET content = excluded.content, source_memory_ids = excluded.source_memory_ids,
                last_refreshed_at = excluded.last_refreshed_at, updated_at = excluded.updated_at",
            params![
                mm.id, mm.bank_id, mm.name, mm.source_query, mm.content,
                serde_json::to_string(&mm.source_memory_ids)?, serde_json::to_string(&mm.tags)?,
                mm.auto_refresh, mm.last_refreshed_at.map(|d| d.to_rfc3339()),
                mm.created_at.to_rfc3339(), mm.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn mental_models_by_bank(&self, bank_id: &str) -> StorageResult<Vec<MentalModel>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM mental_models WHERE bank_id = ?1")?;
        let rows = stmt.query_map(params![bank_id], row_to_mental_model)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn get_mental_model(&self, bank_id: &str, mental_model_id: &str) -> StorageResult<Option<MentalModel>> {
        self.reader()
            .query_row(
                "SELECT * FROM mental_models WHERE id = ?1 AND bank_id = ?2",
                params![mental_model_id, bank_id],
                row_to_mental_model,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn delete_mental_model(&self, bank_id: &str, mental_model_id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute(
            "DELETE FROM mental_models WHERE id = ?1 AND bank_id = ?2",
            params![mental_model_id, bank_id],
        )?;
        Ok(())
    }

    pub fn active_directives(&self, bank_id: &str) -> StorageResult<Vec<Directive>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM directives WHERE bank_id = ?1 AND is_active = 1 ORDER BY priority DESC",
        )?;
        let rows = stmt.query_map(params![bank_id], row_to_directive)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn directives_by_bank(&self, bank_id: &str) -> StorageResult<Vec<Directive>> {
        let conn = self.reader();
        let mut stmt = conn.prepare("SELECT * FROM directives WHERE bank_id = ?1 ORDER BY priority DESC")?;
        let rows = stmt.query_map(params![bank_id], row_to_directive)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    pub fn get_directive(&self, bank_id: &str, directive_id: &str) -> StorageResult<Option<Directive>> {
        self.reader()
            .query_row(
                "SELECT * FROM directives WHERE id = ?1 AND bank_id = ?2",
                params![directive_id, bank_id],
                row_to_directive,
            )
            .optional()
            .map_err(StorageError::from)
    }

    pub fn create_directive(&self, directive: &Directive) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute(
            "INSERT INTO directives (id, bank_id, name, content, priority, is_active, tags, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                directive.id,
                directive.bank_id,
                directive.name,
                directive.content,
                directive.priority,
                directive.is_active,
                serde_json::to_string(&directive.tags)?,
                directive.created_at.to_rfc3339(),
                directive.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_directive(&self, directive: &Directive) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        let changed = conn.execute(
            "UPDATE directives SET name = ?1, content = ?2, priority = ?3, is_active = ?4, tags = ?5, updated_at = ?6
             WHERE id = ?7 AND bank_id = ?8",
            params![
                directive.name,
                directive.content,
                directive.priority,
                directive.is_active,
                serde_json::to_string(&directive.tags)?,
                directive.updated_at.to_rfc3339(),
                directive.id,
                directive.bank_id,
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("directive {}", directive.id)));
        }
        Ok(())
    }

    pub fn delete_directive(&self, bank_id: &str, directive_id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        conn.execute(
            "DELETE FROM directives WHERE id = ?1 AND bank_id = ?2",
            params![directive_id, bank_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Async operations
    // ------------------------------------------------------------------

    pub fn enqueue_op(&self, op: &AsyncOperation) -> StorageResult<Option<String>> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM async_operations WHERE bank_id = ?1 AND dedup_key = ?2 AND status IN ('pending', 'processing')",
                params![op.bank_id, op.dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(Some(id));
        }

        conn.execute(
            "INSERT INTO async_operations (id, bank_id, task_type, status, payload, items_count, document_id, error_message, dedup_key, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                op.id, op.bank_id, op.task_type.as_str(), op.status.as_str(),
                serde_json::to_string(&op.payload)?, op.items_count, op.document_id,
                op.error_message, op.dedup_key, op.created_at.to_rfc3339(), op.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(None)
    }

    pub fn get_op(&self, op_id: &str) -> StorageResult<Option<AsyncOperation>> {
        self.reader()
            .query_row("SELECT * FROM async_operations WHERE id = ?1", params![op_id], row_to_op)
            .optional()
            .map_err(StorageError::from)
    }

    /// Strict transition: `pending -> processing -> completed|failed`; any
    /// other transition is rejected (`spec.md` §4.12).
    pub fn transition_op(&self, op_id: &str, to: OpStatus, error_message: Option<&str>) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        let current: String = conn.query_row(
            "SELECT status FROM async_operations WHERE id = ?1",
            params![op_id],
            |row| row.get(0),
        )?;
        let current = OpStatus::parse(&current);
        let valid = matches!(
            (current, to),
            (OpStatus::Pending, OpStatus::Processing)
                | (OpStatus::Pending, OpStatus::Failed)
                | (OpStatus::Processing, OpStatus::Completed)
                | (OpStatus::Processing, OpStatus::Failed)
        );
        if !valid {
            return Err(StorageError::Aborted(format!(
                "invalid async op transition {current:?} -> {to:?}"
            )));
        }
        conn.execute(
            "UPDATE async_operations SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![to.as_str(), error_message, Utc::now().to_rfc3339(), op_id],
        )?;
        Ok(())
    }

    /// Cancel a pending op; processing/terminal ops cannot be cancelled.
    pub fn cancel_op(&self, op_id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().expect("writer lock poisoned");
        let changed = conn.execute(
            "UPDATE async_operations SET status = 'failed', error_message = 'cancelled', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), op_id],
        )?;
        if changed == 0 {
            return Err(StorageError::Aborted("op is not pending, cannot cancel".into()));
        }
        Ok(())
    }

    pub fn list_ops(&self, bank_id: &str, status: Option<OpStatus>) -> StorageResult<Vec<AsyncOperation>> {
        let conn = self.reader();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM async_operations WHERE bank_id = ?1 AND status = ?2 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![bank_id, s.as_str()], row_to_op)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM async_operations WHERE bank_id = ?1 ORDER BY created_at DESC")?;
                let rows = stmt.query_map(params![bank_id], row_to_op)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing decisions
    // ------------------------------------------------------------------

    pub fn insert_routing_decision_tx(tx: &rusqlite::Transaction, decision: &RoutingDecisionRecord) -> StorageResult<()> {
        tx.execute(
            "INSERT INTO routing_decisions (id, bank_id, route, candidate_memory_id, candidate_score, conflict_detected, conflict_keys, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                decision.id, decision.bank_id, decision.route, decision.candidate_memory_id,
                decision.candidate_score, decision.conflict_detected,
                serde_json::to_string(&decision.conflict_keys)?, decision.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_routing_decisions(&self, bank_id: &str, limit: usize) -> StorageResult<Vec<RoutingDecisionRecord>> {
        let conn = self.reader();
        let mut stmt = conn.prepare(
            "SELECT * FROM routing_decisions WHERE bank_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bank_id, limit as i64], row_to_routing_decision)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StorageError::from)
    }

    // ------------------------------------------------------------------
    // Aggregate stats
    // ------------------------------------------------------------------

    pub fn bank_stats(&self, bank_id: &str) -> StorageResult<BankStats> {
        let conn = self.reader();
        let memory_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_units WHERE bank_id = ?1",
            params![bank_id],
            |row| row.get(0),
        )?;
        let entity_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE bank_id = ?1",
            params![bank_id],
            |row| row.get(0),
        )?;
        let episode_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM episodes WHERE bank_id = ?1",
            params![bank_id],
            |row| row.get(0),
        )?;
        let observation_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_units WHERE bank_id = ?1 AND fact_type = 'observation'",
            params![bank_id],
            |row| row.get(0),
        )?;
        let pending_ops: i64 = conn.query_row(
            "SELECT COUNT(*) FROM async_operations WHERE bank_id = ?1 AND status IN ('pending', 'processing')",
            params![bank_id],
            |row| row.get(0),
        )?;
        Ok(BankStats { memory_count, entity_count, episode_count, observation_count, pending_ops })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BankStats {
    pub memory_count: i64,
    pub entity_count: i64,
    pub episode_count: i64,
    pub observation_count: i64,
    pub pending_ops: i64,
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

fn json_col<T: serde::de::DeserializeOwned + Default>(row: &Row, idx: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn row_to_bank(row: &Row) -> rusqlite::Result<Bank> {
    let config_raw: String = row.get("config")?;
    let disposition_raw: String = row.get("disposition")?;
    Ok(Bank {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        config: serde_json::from_str(&config_raw).unwrap_or_default(),
        disposition: serde_json::from_str(&disposition_raw).unwrap_or([3, 3, 3]),
        mission: row.get("mission")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        content: row.get("content")?,
        content_hash: row.get("content_hash")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_memory(row: &Row) -> rusqlite::Result<MemoryUnit> {
    let fact_type: String = row.get("fact_type")?;
    let scope: String = row.get("scope")?;
    Ok(MemoryUnit {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        content: row.get("content")?,
        fact_type: FactType::parse(&fact_type),
        confidence: row.get("confidence")?,
        document_id: row.get("document_id")?,
        chunk_id: row.get("chunk_id")?,
        event_date_ms: row.get("event_date_ms")?,
        occurred_start_ms: row.get("occurred_start_ms")?,
        occurred_end_ms: row.get("occurred_end_ms")?,
        mentioned_at_ms: row.get("mentioned_at_ms")?,
        metadata: json_col(row, "metadata")?,
        tags: json_col(row, "tags")?,
        source_text: row.get("source_text")?,
        access_count: row.get("access_count")?,
        last_accessed: parse_dt(&row.get::<_, String>("last_accessed")?),
        encoding_strength: row.get("encoding_strength")?,
        gist: row.get("gist")?,
        scope: Scope::parse(&scope),
        consolidated_at: row.get::<_, Option<String>>("consolidated_at")?.map(|s| parse_dt(&s)),
        proof_count: row.get("proof_count")?,
        source_memory_ids: json_col(row, "source_memory_ids")?,
        history: json_col(row, "history")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_entity(row: &Row) -> rusqlite::Result<Entity> {
    let entity_type: String = row.get("entity_type")?;
    Ok(Entity {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        name: row.get("name")?,
        entity_type: EntityType::parse(&entity_type),
        mention_count: row.get("mention_count")?,
        first_seen: parse_dt(&row.get::<_, String>("first_seen")?),
        last_updated: parse_dt(&row.get::<_, String>("last_updated")?),
        description: row.get("description")?,
        metadata: json_col(row, "metadata")?,
    })
}

fn row_to_link(row: &Row) -> rusqlite::Result<MemoryLink> {
    let link_type: String = row.get("link_type")?;
    Ok(MemoryLink {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        link_type: LinkType::parse(&link_type),
        weight: row.get("weight")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_episode(row: &Row) -> rusqlite::Result<Episode> {
    let scope: String = row.get("scope")?;
    let boundary_reason: String = row.get("boundary_reason")?;
    Ok(Episode {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        scope: Scope::parse(&scope),
        start_at: parse_dt(&row.get::<_, String>("start_at")?),
        end_at: row.get::<_, Option<String>>("end_at")?.map(|s| parse_dt(&s)),
        last_event_at: parse_dt(&row.get::<_, String>("last_event_at")?),
        event_count: row.get("event_count")?,
        boundary_reason: match boundary_reason.as_str() {
            "time_gap" => BoundaryReason::TimeGap,
            "scope_change" => BoundaryReason::ScopeChange,
            "phrase_boundary" => BoundaryReason::PhraseBoundary,
            _ => BoundaryReason::Initial,
        },
    })
}

fn row_to_episode_event(row: &Row) -> rusqlite::Result<EpisodeEvent> {
    Ok(EpisodeEvent {
        id: row.get("id")?,
        episode_id: row.get("episode_id")?,
        memory_id: row.get("memory_id")?,
        route: row.get("route")?,
        event_time: parse_dt(&row.get::<_, String>("event_time")?),
    })
}

fn row_to_mental_model(row: &Row) -> rusqlite::Result<MentalModel> {
    Ok(MentalModel {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        name: row.get("name")?,
        source_query: row.get("source_query")?,
        content: row.get("content")?,
        source_memory_ids: json_col(row, "source_memory_ids")?,
        tags: json_col(row, "tags")?,
        auto_refresh: row.get("auto_refresh")?,
        last_refreshed_at: row.get::<_, Option<String>>("last_refreshed_at")?.map(|s| parse_dt(&s)),
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_directive(row: &Row) -> rusqlite::Result<Directive> {
    Ok(Directive {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        name: row.get("name")?,
        content: row.get("content")?,
        priority: row.get("priority")?,
        is_active: row.get("is_active")?,
        tags: json_col(row, "tags")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_op(row: &Row) -> rusqlite::Result<AsyncOperation> {
    let task_type: String = row.get("task_type")?;
    let status: String = row.get("status")?;
    Ok(AsyncOperation {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        task_type: match task_type.as_str() {
            "consolidation" => TaskType::Consolidation,
            "refresh_mental_model" => TaskType::RefreshMentalModel,
            _ => TaskType::Retain,
        },
        status: OpStatus::parse(&status),
        payload: json_col(row, "payload")?,
        items_count: row.get("items_count")?,
        document_id: row.get("document_id")?,
        error_message: row.get("error_message")?,
        dedup_key: row.get("dedup_key")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
        updated_at: parse_dt(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_routing_decision(row: &Row) -> rusqlite::Result<RoutingDecisionRecord> {
    Ok(RoutingDecisionRecord {
        id: row.get("id")?,
        bank_id: row.get("bank_id")?,
        route: row.get("route")?,
        candidate_memory_id: row.get("candidate_memory_id")?,
        candidate_score: row.get("candidate_score")?,
        conflict_detected: row.get("conflict_detected")?,
        conflict_keys: json_col(row, "conflict_keys")?,
        created_at: parse_dt(&row.get::<_, String>("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{new_id, new_monotonic_id};

    fn sample_bank() -> Bank {
        let now = Utc::now();
        Bank {
            id: new_id(),
            name: "test bank".into(),
            description: None,
            config: BankConfig::default(),
            disposition: [3, 3, 3],
            mission: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_memory(bank_id: &str) -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            id: new_monotonic_id(),
            bank_id: bank_id.to_string(),
            content: "met alice at the coffee shop".into(),
            fact_type: FactType::Experience,
            confidence: 0.9,
            document_id: None,
            chunk_id: None,
            event_date_ms: now.timestamp_millis(),
            occurred_start_ms: None,
            occurred_end_ms: None,
            mentioned_at_ms: None,
            metadata: serde_json::json!({}),
            tags: vec![],
            source_text: None,
            access_count: 0,
            last_accessed: now,
            encoding_strength: 1.0,
            gist: "met alice".into(),
            scope: Scope::Profile,
            consolidated_at: None,
            proof_count: None,
            source_memory_ids: vec![],
            history: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn bank_and_memory_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let bank = sample_bank();
        storage.create_bank(&bank).unwrap();
        assert_eq!(storage.get_bank(&bank.id).unwrap().unwrap().name, "test bank");

        let memory = sample_memory(&bank.id);
        storage.transaction(|tx| Storage::insert_memory_tx(tx, &memory)).unwrap();
        let fetched = storage.get_memory(&bank.id, &memory.id).unwrap().unwrap();
        assert_eq!(fetched.content, memory.content);
    }

    #[test]
    fn fts_search_finds_inserted_memory() {
        let storage = Storage::open_in_memory().unwrap();
        let bank = sample_bank();
        storage.create_bank(&bank).unwrap();
        let memory = sample_memory(&bank.id);
        storage.transaction(|tx| Storage::insert_memory_tx(tx, &memory)).unwrap();

        let hits = storage.fts_search(&bank.id, "alice", 10).unwrap();
        assert!(hits.iter().any(|(id, _)| id == &memory.id));
    }

    #[test]
    fn async_op_dedup_returns_existing_id() {
        let storage = Storage::open_in_memory().unwrap();
        let bank = sample_bank();
        storage.create_bank(&bank).unwrap();
        let now = Utc::now();
        let op = AsyncOperation {
            id: new_monotonic_id(),
            bank_id: bank.id.clone(),
            task_type: TaskType::Retain,
            status: OpStatus::Pending,
            payload: serde_json::json!({"text": "hi"}),
            items_count: 1,
            document_id: None,
            error_message: None,
            dedup_key: "abc123".into(),
            created_at: now,
            updated_at: now,
        };
        assert!(storage.enqueue_op(&op).unwrap().is_none());

        let duplicate = AsyncOperation { id: new_monotonic_id(), ..op.clone() };
        assert_eq!(storage.enqueue_op(&duplicate).unwrap(), Some(op.id.clone()));
    }

    #[test]
    fn op_transition_rejects_skipping_processing() {
        let storage = Storage::open_in_memory().unwrap();
        let bank = sample_bank();
        storage.create_bank(&bank).unwrap();
        let now = Utc::now();
        let op = AsyncOperation {
            id: new_monotonic_id(),
            bank_id: bank.id.clone(),
            task_type: TaskType::Retain,
            status: OpStatus::Pending,
            payload: serde_json::json!({}),
            items_count: 0,
            document_id: None,
            error_message: None,
            dedup_key: "xyz".into(),
            created_at: now,
            updated_at: now,
        };
        storage.enqueue_op(&op).unwrap();
        assert!(storage.transition_op(&op.id, OpStatus::Completed, None).is_err());
        storage.transition_op(&op.id, OpStatus::Processing, None).unwrap();
        storage.transition_op(&op.id, OpStatus::Completed, None).unwrap();
    }

    #[test]
    fn delete_document_cascade_removes_memories() {
        let storage = Storage::open_in_memory().unwrap();
        let bank = sample_bank();
        storage.create_bank(&bank).unwrap();
        let now = Utc::now();
        let document = Document {
            id: new_id(),
            bank_id: bank.id.clone(),
            content: "source text".into(),
            content_hash: "hash1".into(),
            created_at: now,
        };
        storage.transaction(|tx| Storage::insert_document_tx(tx, &document)).unwrap();
        let mut memory = sample_memory(&bank.id);
        memory.document_id = Some(document.id.clone());
        storage.transaction(|tx| Storage::insert_memory_tx(tx, &memory)).unwrap();

        let deleted = storage.delete_document_cascade(&document.id).unwrap();
        assert_eq!(deleted, 1);
        assert!(storage.get_memory(&bank.id, &memory.id).unwrap().is_none());
    }
}
