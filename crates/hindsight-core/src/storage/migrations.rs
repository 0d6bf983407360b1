//! Schema migrations for the single SQLite file backing an engine instance.

/// A database migration: a version number and the batch of SQL that brings
/// the schema from `version - 1` to `version`.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: banks, memories, entities, links, episodes, documents, mental models, async ops",
    up: MIGRATION_V1_UP,
}];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS banks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    config TEXT NOT NULL,
    disposition TEXT NOT NULL,
    mission TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_bank ON documents(bank_id);
CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(bank_id, content_hash);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    ordinal INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

CREATE TABLE IF NOT EXISTS memory_units (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    fact_type TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    document_id TEXT REFERENCES documents(id) ON DELETE SET NULL,
    chunk_id TEXT REFERENCES chunks(id) ON DELETE SET NULL,
    event_date_ms INTEGER NOT NULL,
    occurred_start_ms INTEGER,
    occurred_end_ms INTEGER,
    mentioned_at_ms INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    tags TEXT NOT NULL DEFAULT '[]',
    source_text TEXT,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    encoding_strength REAL NOT NULL DEFAULT 1.0,
    gist TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'profile',
    consolidated_at TEXT,
    proof_count INTEGER,
    source_memory_ids TEXT NOT NULL DEFAULT '[]',
    history TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memory_bank ON memory_units(bank_id);
CREATE INDEX IF NOT EXISTS idx_memory_bank_event_date ON memory_units(bank_id, event_date_ms);
CREATE INDEX IF NOT EXISTS idx_memory_bank_fact_type ON memory_units(bank_id, fact_type);
CREATE INDEX IF NOT EXISTS idx_memory_document ON memory_units(document_id);
CREATE INDEX IF NOT EXISTS idx_memory_consolidated ON memory_units(bank_id, consolidated_at);

CREATE VIRTUAL TABLE IF NOT EXISTS hs_memory_fts USING fts5(
    id UNINDEXED,
    bank_id UNINDEXED,
    content,
    gist,
    tokenize = 'porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS trg_memory_fts_insert AFTER INSERT ON memory_units BEGIN
    INSERT INTO hs_memory_fts(id, bank_id, content, gist)
    VALUES (new.id, new.bank_id, new.content, new.gist);
END;

CREATE TRIGGER IF NOT EXISTS trg_memory_fts_update AFTER UPDATE ON memory_units BEGIN
    DELETE FROM hs_memory_fts WHERE id = old.id;
    INSERT INTO hs_memory_fts(id, bank_id, content, gist)
    VALUES (new.id, new.bank_id, new.content, new.gist);
END;

CREATE TRIGGER IF NOT EXISTS trg_memory_fts_delete AFTER DELETE ON memory_units BEGIN
    DELETE FROM hs_memory_fts WHERE id = old.id;
END;

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    mention_count INTEGER NOT NULL DEFAULT 0,
    first_seen TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    description TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_entities_bank ON entities(bank_id);
CREATE INDEX IF NOT EXISTS idx_entities_bank_name ON entities(bank_id, name);

CREATE TABLE IF NOT EXISTS entity_mentions (
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    PRIMARY KEY (entity_id, memory_id)
);
CREATE INDEX IF NOT EXISTS idx_entity_mentions_memory ON entity_mentions(memory_id);

CREATE TABLE IF NOT EXISTS entity_cooccurrences (
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    entity_a TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    entity_b TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (entity_a, entity_b)
);

CREATE TABLE IF NOT EXISTS memory_links (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    source_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    target_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    link_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    UNIQUE (source_id, target_id, link_type)
);
CREATE INDEX IF NOT EXISTS idx_links_source ON memory_links(source_id);
CREATE INDEX IF NOT EXISTS idx_links_target ON memory_links(target_id);
CREATE INDEX IF NOT EXISTS idx_links_bank ON memory_links(bank_id);

CREATE TABLE IF NOT EXISTS episodes (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    scope TEXT NOT NULL DEFAULT 'profile',
    start_at TEXT NOT NULL,
    end_at TEXT,
    last_event_at TEXT NOT NULL,
    event_count INTEGER NOT NULL DEFAULT 0,
    boundary_reason TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_bank ON episodes(bank_id, last_event_at);

CREATE TABLE IF NOT EXISTS episode_events (
    id TEXT PRIMARY KEY,
    episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    memory_id TEXT NOT NULL REFERENCES memory_units(id) ON DELETE CASCADE,
    route TEXT NOT NULL,
    event_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episode_events_episode ON episode_events(episode_id, event_time);

CREATE TABLE IF NOT EXISTS episode_temporal_links (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    prior_episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    next_episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    gap_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episode_temporal_prior ON episode_temporal_links(prior_episode_id);

CREATE TABLE IF NOT EXISTS mental_models (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    source_query TEXT NOT NULL,
    content TEXT,
    source_memory_ids TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    auto_refresh INTEGER NOT NULL DEFAULT 0,
    last_refreshed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mental_models_bank ON mental_models(bank_id);

CREATE TABLE IF NOT EXISTS directives (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_directives_bank ON directives(bank_id, is_active);

CREATE TABLE IF NOT EXISTS async_operations (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payload TEXT NOT NULL DEFAULT '{}',
    items_count INTEGER NOT NULL DEFAULT 0,
    document_id TEXT REFERENCES documents(id) ON DELETE SET NULL,
    error_message TEXT,
    dedup_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (bank_id, dedup_key, status)
);
CREATE INDEX IF NOT EXISTS idx_async_ops_bank_status ON async_operations(bank_id, status);

CREATE TABLE IF NOT EXISTS routing_decisions (
    id TEXT PRIMARY KEY,
    bank_id TEXT NOT NULL REFERENCES banks(id) ON DELETE CASCADE,
    route TEXT NOT NULL,
    candidate_memory_id TEXT REFERENCES memory_units(id) ON DELETE SET NULL,
    candidate_score REAL,
    conflict_detected INTEGER NOT NULL DEFAULT 0,
    conflict_keys TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_routing_decisions_bank ON routing_decisions(bank_id, created_at);

INSERT INTO schema_version (version) VALUES (1);
"#;

/// Current schema version applied to `conn`, or 0 if `schema_version` is empty.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !table_exists {
        return Ok(0);
    }
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
}

/// Apply every migration newer than the schema's current version, in order.
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(version = migration.version, description = migration.description, "applying migration");
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn fresh_connection_applies_all_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(get_current_version(&conn).unwrap(), 1);
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let applied_again = apply_migrations(&conn).unwrap();
        assert_eq!(applied_again, 0);
    }

    #[test]
    fn fts_table_is_queryable_after_migration() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM hs_memory_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
