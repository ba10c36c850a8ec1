//! SQLite schema and migrations for the evidence graph store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for concurrent readers alongside the writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    // Migrations are monotonic; no destructive rewrites.
    if current_version < 1 {
        apply_v1_schema(conn)?;
    }

    Ok(())
}

/// Apply version 1 schema.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            central_hypothesis TEXT NOT NULL,
            budget TEXT NOT NULL,
            priority_domains TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'created',
            metrics TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Pages are global: one row per canonical URL, shared across tasks.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pages (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            domain TEXT NOT NULL,
            page_type TEXT NOT NULL,
            fetched_at TEXT,
            title TEXT,
            paper_metadata TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fragments (
            id TEXT PRIMARY KEY,
            page_id TEXT NOT NULL,
            fragment_type TEXT NOT NULL,
            text_content TEXT NOT NULL,
            heading_hierarchy TEXT NOT NULL DEFAULT '[]',
            position INTEGER NOT NULL DEFAULT 0,
            bm25_score REAL,
            embed_score REAL,
            rerank_score REAL,
            embedding BLOB,
            FOREIGN KEY (page_id) REFERENCES pages(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS claims (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            claim_text TEXT NOT NULL,
            claim_type TEXT NOT NULL,
            granularity TEXT NOT NULL DEFAULT 'atomic',
            llm_confidence REAL NOT NULL DEFAULT 0.5,
            adoption_status TEXT NOT NULL DEFAULT 'pending',
            supporting_count INTEGER NOT NULL DEFAULT 0,
            refuting_count INTEGER NOT NULL DEFAULT 0,
            embedding BLOB,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        )",
        [],
    )?;

    // Derived evidence_source edges are never written here; the store
    // rejects them before this constraint would.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation TEXT NOT NULL CHECK (relation IN ('supports','refutes','neutral','cites')),
            nli_label TEXT,
            nli_confidence REAL,
            citation_source TEXT,
            human_corrected INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // At most one NLI edge per (fragment, claim); re-judgement replaces.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_nli_pair
         ON edges(source_id, target_id)
         WHERE relation IN ('supports','refutes','neutral')",
        [],
    )?;

    // Citation edges are idempotent per (source, target).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_cites_pair
         ON edges(source_id, target_id)
         WHERE relation = 'cites'",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 1,
            state TEXT NOT NULL DEFAULT 'queued',
            dedup_key TEXT NOT NULL,
            queued_at TEXT NOT NULL DEFAULT (datetime('now')),
            started_at TEXT,
            finished_at TEXT,
            input TEXT NOT NULL,
            error_message TEXT,
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        )",
        [],
    )?;

    // queue_targets idempotency: one live job per dedup key.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_dedup
         ON jobs(dedup_key)
         WHERE state IN ('queued','running','awaiting_auth')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS auth_queue (
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            challenge_type TEXT NOT NULL,
            blocking_job_ids TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            resolved_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS nli_corrections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            edge_id TEXT NOT NULL,
            predicted_label TEXT NOT NULL,
            correct_label TEXT NOT NULL,
            predicted_confidence REAL NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calibration_params (
            source TEXT PRIMARY KEY,
            method TEXT NOT NULL,
            params TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calibration_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            method TEXT NOT NULL,
            params TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS serp_cache (
            cache_key TEXT PRIMARY KEY,
            normalized_query TEXT NOT NULL,
            engines TEXT NOT NULL,
            time_range TEXT,
            page INTEGER NOT NULL DEFAULT 1,
            response TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS domain_policy (
            domain TEXT PRIMARY KEY,
            policy TEXT NOT NULL CHECK (policy IN ('blocked','allowed')),
            note TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Indexes for the hot queries
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fragments_page ON fragments(page_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_claims_task ON claims(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_edges_relation ON edges(relation)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, priority, queued_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auth_status ON auth_queue(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_serp_created ON serp_cache(created_at)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;

    Ok(())
}

/// Get the current schema version.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Check if the schema is initialized.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tasks'",
        [],
        |row| row.get::<_, i32>(0),
    )
    .map(|count| count > 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        assert!(is_initialized(&conn));
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_idempotent_initialization() {
        let conn = Connection::open_in_memory().unwrap();

        initialize_schema(&conn).unwrap();
        initialize_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_page_url_unique() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO pages (id, url, domain, page_type) VALUES ('a', 'https://x.org/1', 'x.org', 'article')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO pages (id, url, domain, page_type) VALUES ('b', 'https://x.org/1', 'x.org', 'article')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_evidence_source_relation_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        let res = conn.execute(
            "INSERT INTO edges (id, source_kind, source_id, target_kind, target_id, relation)
             VALUES ('e1', 'claim', 'c1', 'page', 'p1', 'evidence_source')",
            [],
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_nli_pair_unique_but_cites_independent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO edges (id, source_kind, source_id, target_kind, target_id, relation, nli_confidence)
             VALUES ('e1', 'fragment', 'f1', 'claim', 'c1', 'supports', 0.9)",
            [],
        )
        .unwrap();

        // Second NLI edge on the same pair violates the partial index.
        let dup = conn.execute(
            "INSERT INTO edges (id, source_kind, source_id, target_kind, target_id, relation, nli_confidence)
             VALUES ('e2', 'fragment', 'f1', 'claim', 'c1', 'refutes', 0.4)",
            [],
        );
        assert!(dup.is_err());

        // A cites edge between unrelated ids is fine.
        conn.execute(
            "INSERT INTO edges (id, source_kind, source_id, target_kind, target_id, relation)
             VALUES ('e3', 'page', 'p1', 'page', 'p2', 'cites')",
            [],
        )
        .unwrap();
    }
}
