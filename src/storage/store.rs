//! SQLite-backed store for the evidence graph, job table and caches.
//!
//! Mutating operations are exposed only to internal components; the client
//! reaches persisted state through the read-only surface in
//! [`crate::storage::readonly`] and the named views.

use crate::error::{Error, Result};
use crate::graph::types::*;
use crate::jobs::types::*;
use crate::storage::schema::initialize_schema;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Maximum bound parameters per statement; IN-lists are chunked under this.
pub const MAX_BOUND_PARAMS: usize = 900;

/// SQLite-backed store shared by all components.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;

        // Idempotent; applies any pending migrations.
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> rusqlite::Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::storage(e.to_string()))?;
        let out = f(&tx).map_err(|e| Error::storage(e.to_string()))?;
        tx.commit().map_err(|e| Error::storage(e.to_string()))?;
        Ok(out)
    }

    // ==================== Tasks ====================

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, central_hypothesis, budget, priority_domains, status, metrics, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    task.id.to_string(),
                    task.central_hypothesis,
                    serde_json::to_string(&task.budget).unwrap_or_default(),
                    serde_json::to_string(&task.priority_domains).unwrap_or_default(),
                    task.status.to_string(),
                    serde_json::to_string(&task.metrics).unwrap_or_default(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, central_hypothesis, budget, priority_domains, status, metrics, created_at, updated_at
                 FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_task(row),
            )
            .optional()
        })
    }

    pub fn set_task_status(&self, id: &TaskId, status: TaskStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn set_task_metrics(&self, id: &TaskId, metrics: &TaskMetrics) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET metrics = ?2, updated_at = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    serde_json::to_string(metrics).unwrap_or_default(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Recompute task metrics from persisted rows.
    ///
    /// Pages and fragments are global, so the task slice is taken through
    /// claim-incident edges: a fragment belongs to the snapshot when it has
    /// an NLI edge into one of the task's claims.
    pub fn compute_task_metrics(&self, id: &TaskId) -> Result<TaskMetrics> {
        self.with_conn(|conn| {
            let task = id.to_string();
            let claims: u32 = conn.query_row(
                "SELECT COUNT(*) FROM claims WHERE task_id = ?1",
                params![task],
                |row| row.get(0),
            )?;
            let edges: u32 = conn.query_row(
                "SELECT COUNT(*) FROM edges e
                 JOIN claims c ON c.id = e.target_id
                 WHERE c.task_id = ?1 AND e.relation IN ('supports','refutes','neutral')",
                params![task],
                |row| row.get(0),
            )?;
            let fragments: u32 = conn.query_row(
                "SELECT COUNT(DISTINCT e.source_id) FROM edges e
                 JOIN claims c ON c.id = e.target_id
                 WHERE c.task_id = ?1 AND e.relation IN ('supports','refutes','neutral')",
                params![task],
                |row| row.get(0),
            )?;
            let pages: u32 = conn.query_row(
                "SELECT COUNT(DISTINCT f.page_id) FROM fragments f
                 JOIN edges e ON e.source_id = f.id
                 JOIN claims c ON c.id = e.target_id
                 WHERE c.task_id = ?1 AND e.relation IN ('supports','refutes','neutral')",
                params![task],
                |row| row.get(0),
            )?;
            Ok(TaskMetrics {
                pages,
                fragments,
                claims,
                edges,
            })
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let id_str: String = row.get(0)?;
        let status_str: String = row.get(4)?;
        Ok(Task {
            id: TaskId::parse(&id_str).unwrap_or_default(),
            central_hypothesis: row.get(1)?,
            budget: json_or_default(row.get::<_, String>(2)?),
            priority_domains: json_or_default(row.get::<_, String>(3)?),
            status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Created),
            metrics: json_or_default(row.get::<_, String>(5)?),
            created_at: parse_datetime(row.get::<_, String>(6)?),
            updated_at: parse_datetime(row.get::<_, String>(7)?),
        })
    }

    // ==================== Pages ====================

    /// Insert a page, or merge metadata into the existing row for its URL.
    ///
    /// Returns the stable page id and whether the row was newly created.
    /// Metadata merge is fill-nulls-only under source priority; the page
    /// type is upgraded to academic when metadata carries a DOI.
    pub fn upsert_page(&self, page: &Page) -> Result<(PageId, bool)> {
        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, paper_metadata, title, fetched_at, page_type FROM pages WHERE url = ?1",
                    params![page.url],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            match existing {
                Some((id, meta_json, title, fetched_at, page_type)) => {
                    let mut merged: PaperMetadata = meta_json
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_default();
                    if let Some(incoming) = &page.paper_metadata {
                        let source = incoming.source_api.unwrap_or(SourceApi::Extraction);
                        merged.merge_from(incoming, source);
                    }
                    let title = title.or_else(|| page.title.clone());
                    let fetched_at =
                        fetched_at.or_else(|| page.fetched_at.map(|t| t.to_rfc3339()));
                    let page_type = if page_type == "empty" || page_type == "other" {
                        page.page_type.to_string()
                    } else {
                        page_type
                    };
                    tx.execute(
                        "UPDATE pages SET paper_metadata = ?2, title = ?3, fetched_at = ?4, page_type = ?5
                         WHERE id = ?1",
                        params![
                            id,
                            serde_json::to_string(&merged).ok(),
                            title,
                            fetched_at,
                            page_type,
                        ],
                    )?;
                    Ok((PageId::parse(&id).unwrap_or_default(), false))
                }
                None => {
                    tx.execute(
                        "INSERT INTO pages (id, url, domain, page_type, fetched_at, title, paper_metadata)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            page.id.to_string(),
                            page.url,
                            page.domain,
                            page.page_type.to_string(),
                            page.fetched_at.map(|t| t.to_rfc3339()),
                            page.title,
                            page.paper_metadata
                                .as_ref()
                                .and_then(|m| serde_json::to_string(m).ok()),
                        ],
                    )?;
                    Ok((page.id.clone(), true))
                }
            }
        })
    }

    pub fn get_page(&self, id: &PageId) -> Result<Option<Page>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, domain, page_type, fetched_at, title, paper_metadata
                 FROM pages WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_page(row),
            )
            .optional()
        })
    }

    pub fn get_page_by_url(&self, url: &str) -> Result<Option<Page>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, domain, page_type, fetched_at, title, paper_metadata
                 FROM pages WHERE url = ?1",
                params![url],
                |row| Self::row_to_page(row),
            )
            .optional()
        })
    }

    pub fn get_page_by_doi(&self, doi: &str) -> Result<Option<Page>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, url, domain, page_type, fetched_at, title, paper_metadata
                 FROM pages
                 WHERE LOWER(COALESCE(json_extract(paper_metadata, '$.doi'), '')) = LOWER(?1)",
                params![doi],
                |row| Self::row_to_page(row),
            )
            .optional()
        })
    }

    pub fn mark_page_fetched(&self, id: &PageId, page_type: PageType) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE pages SET fetched_at = ?2, page_type = ?3 WHERE id = ?1",
                params![
                    id.to_string(),
                    Utc::now().to_rfc3339(),
                    page_type.to_string()
                ],
            )?;
            Ok(())
        })
    }

    /// Fetch pages by id, chunked under the driver parameter limit.
    pub fn pages_by_ids(&self, ids: &[PageId]) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        for chunk in ids.chunks(MAX_BOUND_PARAMS) {
            let mut chunk_pages = self.with_conn(|conn| {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "SELECT id, url, domain, page_type, fetched_at, title, paper_metadata
                     FROM pages WHERE id IN ({})",
                    placeholders.join(",")
                );
                let params_vec: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params_from_iter(params_vec.iter()),
                        |row| Self::row_to_page(row),
                    )?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<_>>();
                Ok(rows)
            })?;
            pages.append(&mut chunk_pages);
        }
        Ok(pages)
    }

    fn row_to_page(row: &rusqlite::Row) -> rusqlite::Result<Page> {
        let id_str: String = row.get(0)?;
        let type_str: String = row.get(3)?;
        // Malformed metadata JSON projects to None, never a query failure.
        let metadata: Option<PaperMetadata> = row
            .get::<_, Option<String>>(6)?
            .and_then(|s| serde_json::from_str(&s).ok());
        Ok(Page {
            id: PageId::parse(&id_str).unwrap_or_default(),
            url: row.get(1)?,
            domain: row.get(2)?,
            page_type: PageType::parse(&type_str).unwrap_or(PageType::Other),
            fetched_at: row
                .get::<_, Option<String>>(4)?
                .map(parse_datetime),
            title: row.get(5)?,
            paper_metadata: metadata,
        })
    }

    // ==================== Fragments ====================

    pub fn insert_fragment(&self, fragment: &Fragment) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fragments (id, page_id, fragment_type, text_content, heading_hierarchy,
                                        position, bm25_score, embed_score, rerank_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fragment.id.to_string(),
                    fragment.page_id.to_string(),
                    fragment.fragment_type.to_string(),
                    fragment.text_content,
                    serde_json::to_string(&fragment.heading_hierarchy).unwrap_or_default(),
                    fragment.position,
                    fragment.bm25_score,
                    fragment.embed_score,
                    fragment.rerank_score,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_fragment(&self, id: &FragmentId) -> Result<Option<Fragment>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, page_id, fragment_type, text_content, heading_hierarchy,
                        position, bm25_score, embed_score, rerank_score
                 FROM fragments WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_fragment(row),
            )
            .optional()
        })
    }

    pub fn fragments_for_page(&self, page_id: &PageId) -> Result<Vec<Fragment>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, page_id, fragment_type, text_content, heading_hierarchy,
                        position, bm25_score, embed_score, rerank_score
                 FROM fragments WHERE page_id = ?1 ORDER BY position ASC",
            )?;
            let fragments = stmt
                .query_map(params![page_id.to_string()], |row| {
                    Self::row_to_fragment(row)
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(fragments)
        })
    }

    /// Fetch fragments by id, chunked under the driver parameter limit.
    pub fn fragments_by_ids(&self, ids: &[FragmentId]) -> Result<Vec<Fragment>> {
        let mut fragments = Vec::new();
        for chunk in ids.chunks(MAX_BOUND_PARAMS) {
            let mut chunk_fragments = self.with_conn(|conn| {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "SELECT id, page_id, fragment_type, text_content, heading_hierarchy,
                            position, bm25_score, embed_score, rerank_score
                     FROM fragments WHERE id IN ({})",
                    placeholders.join(",")
                );
                let params_vec: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                        Self::row_to_fragment(row)
                    })?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<_>>();
                Ok(rows)
            })?;
            fragments.append(&mut chunk_fragments);
        }
        Ok(fragments)
    }

    pub fn page_has_abstract(&self, page_id: &PageId) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM fragments WHERE page_id = ?1 AND fragment_type = 'abstract'",
                params![page_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn set_fragment_embedding(&self, id: &FragmentId, embedding: &[f32]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE fragments SET embedding = ?2 WHERE id = ?1",
                params![id.to_string(), encode_embedding(embedding)],
            )?;
            Ok(())
        })
    }

    /// All fragment embeddings, optionally restricted to a task's slice.
    pub fn fragment_embeddings(
        &self,
        task_id: Option<&TaskId>,
    ) -> Result<Vec<(FragmentId, String, Vec<f32>)>> {
        self.with_conn(|conn| {
            let (sql, task_param) = match task_id {
                Some(id) => (
                    "SELECT DISTINCT f.id, f.text_content, f.embedding FROM fragments f
                     JOIN edges e ON e.source_id = f.id
                     JOIN claims c ON c.id = e.target_id
                     WHERE c.task_id = ?1 AND f.embedding IS NOT NULL",
                    Some(id.to_string()),
                ),
                None => (
                    "SELECT id, text_content, embedding FROM fragments WHERE embedding IS NOT NULL",
                    None,
                ),
            };
            let mut stmt = conn.prepare(sql)?;
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(FragmentId, String, Vec<f32>)> {
                let id_str: String = row.get(0)?;
                let text: String = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                Ok((
                    FragmentId::parse(&id_str).unwrap_or_default(),
                    text,
                    decode_embedding(&blob),
                ))
            };
            let rows = match task_param {
                Some(task) => stmt
                    .query_map(params![task], map_row)?
                    .filter_map(|r| r.ok())
                    .collect(),
                None => stmt
                    .query_map([], map_row)?
                    .filter_map(|r| r.ok())
                    .collect(),
            };
            Ok(rows)
        })
    }

    fn row_to_fragment(row: &rusqlite::Row) -> rusqlite::Result<Fragment> {
        let id_str: String = row.get(0)?;
        let page_str: String = row.get(1)?;
        let type_str: String = row.get(2)?;
        Ok(Fragment {
            id: FragmentId::parse(&id_str).unwrap_or_default(),
            page_id: PageId::parse(&page_str).unwrap_or_default(),
            fragment_type: FragmentType::parse(&type_str).unwrap_or(FragmentType::Paragraph),
            text_content: row.get(3)?,
            heading_hierarchy: json_or_default(row.get::<_, String>(4)?),
            position: row.get(5)?,
            bm25_score: row.get(6)?,
            embed_score: row.get(7)?,
            rerank_score: row.get(8)?,
        })
    }

    // ==================== Claims ====================

    pub fn insert_claim(&self, claim: &Claim) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO claims (id, task_id, claim_text, claim_type, granularity,
                                     llm_confidence, adoption_status, supporting_count,
                                     refuting_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    claim.id.to_string(),
                    claim.task_id.to_string(),
                    claim.claim_text,
                    claim.claim_type.to_string(),
                    claim.granularity.to_string(),
                    claim.llm_confidence,
                    claim.adoption_status.to_string(),
                    claim.supporting_count,
                    claim.refuting_count,
                    claim.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_claim(&self, id: &ClaimId) -> Result<Option<Claim>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, claim_text, claim_type, granularity, llm_confidence,
                        adoption_status, supporting_count, refuting_count, created_at
                 FROM claims WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_claim(row),
            )
            .optional()
        })
    }

    pub fn claims_for_task(&self, task_id: &TaskId) -> Result<Vec<Claim>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, claim_text, claim_type, granularity, llm_confidence,
                        adoption_status, supporting_count, refuting_count, created_at
                 FROM claims WHERE task_id = ?1 ORDER BY created_at ASC",
            )?;
            let claims = stmt
                .query_map(params![task_id.to_string()], |row| Self::row_to_claim(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(claims)
        })
    }

    pub fn set_adoption_status(&self, id: &ClaimId, status: AdoptionStatus) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE claims SET adoption_status = ?2 WHERE id = ?1",
                params![id.to_string(), status.to_string()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Refresh supporting/refuting counters from persisted edges.
    pub fn refresh_claim_counts(&self, id: &ClaimId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE claims SET
                    supporting_count = (SELECT COUNT(*) FROM edges
                        WHERE target_id = claims.id AND relation = 'supports'),
                    refuting_count = (SELECT COUNT(*) FROM edges
                        WHERE target_id = claims.id AND relation = 'refutes')
                 WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn set_claim_embedding(&self, id: &ClaimId, embedding: &[f32]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE claims SET embedding = ?2 WHERE id = ?1",
                params![id.to_string(), encode_embedding(embedding)],
            )?;
            Ok(())
        })
    }

    pub fn claim_embeddings(
        &self,
        task_id: Option<&TaskId>,
    ) -> Result<Vec<(ClaimId, String, Vec<f32>)>> {
        self.with_conn(|conn| {
            let (sql, task_param) = match task_id {
                Some(id) => (
                    "SELECT id, claim_text, embedding FROM claims
                     WHERE task_id = ?1 AND embedding IS NOT NULL",
                    Some(id.to_string()),
                ),
                None => (
                    "SELECT id, claim_text, embedding FROM claims WHERE embedding IS NOT NULL",
                    None,
                ),
            };
            let mut stmt = conn.prepare(sql)?;
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<(ClaimId, String, Vec<f32>)> {
                let id_str: String = row.get(0)?;
                let text: String = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                Ok((
                    ClaimId::parse(&id_str).unwrap_or_default(),
                    text,
                    decode_embedding(&blob),
                ))
            };
            let rows = match task_param {
                Some(task) => stmt
                    .query_map(params![task], map_row)?
                    .filter_map(|r| r.ok())
                    .collect(),
                None => stmt
                    .query_map([], map_row)?
                    .filter_map(|r| r.ok())
                    .collect(),
            };
            Ok(rows)
        })
    }

    fn row_to_claim(row: &rusqlite::Row) -> rusqlite::Result<Claim> {
        let id_str: String = row.get(0)?;
        let task_str: String = row.get(1)?;
        let type_str: String = row.get(3)?;
        let gran_str: String = row.get(4)?;
        let adoption_str: String = row.get(6)?;
        Ok(Claim {
            id: ClaimId::parse(&id_str).unwrap_or_default(),
            task_id: TaskId::parse(&task_str).unwrap_or_default(),
            claim_text: row.get(2)?,
            claim_type: ClaimType::parse(&type_str).unwrap_or(ClaimType::Factual),
            granularity: Granularity::parse(&gran_str).unwrap_or(Granularity::Atomic),
            llm_confidence: row.get(5)?,
            adoption_status: AdoptionStatus::parse(&adoption_str)
                .unwrap_or(AdoptionStatus::Pending),
            supporting_count: row.get(7)?,
            refuting_count: row.get(8)?,
            created_at: parse_datetime(row.get::<_, String>(9)?),
        })
    }

    // ==================== Edges ====================

    /// Upsert an NLI judgement edge, replacing any prior edge for the same
    /// (fragment, claim) pair. Human-corrected edges win over re-judgement.
    pub fn upsert_nli_edge(&self, edge: &Edge) -> Result<EdgeId> {
        if !edge.relation.is_nli() {
            return Err(Error::Invariant(format!(
                "upsert_nli_edge given relation {}",
                edge.relation
            )));
        }
        if !edge.relation.is_persistable() || !edge.endpoints_valid() {
            return Err(Error::Invariant("illegal edge endpoints".to_string()));
        }
        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id, human_corrected FROM edges
                     WHERE source_id = ?1 AND target_id = ?2
                       AND relation IN ('supports','refutes','neutral')",
                    params![edge.source_id, edge.target_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            match existing {
                Some((id, human)) if human != 0 => {
                    // A human said otherwise; the classifier does not undo it.
                    Ok(EdgeId::parse(&id).unwrap_or_default())
                }
                Some((id, _)) => {
                    tx.execute(
                        "UPDATE edges SET relation = ?2, nli_label = ?3, nli_confidence = ?4,
                                          created_at = ?5
                         WHERE id = ?1",
                        params![
                            id,
                            edge.relation.to_string(),
                            edge.nli_label,
                            edge.nli_confidence,
                            edge.created_at.to_rfc3339(),
                        ],
                    )?;
                    Ok(EdgeId::parse(&id).unwrap_or_default())
                }
                None => {
                    tx.execute(
                        "INSERT INTO edges (id, source_kind, source_id, target_kind, target_id,
                                            relation, nli_label, nli_confidence, citation_source,
                                            human_corrected, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, 0, ?9)",
                        params![
                            edge.id.to_string(),
                            edge.source_kind.to_string(),
                            edge.source_id,
                            edge.target_kind.to_string(),
                            edge.target_id,
                            edge.relation.to_string(),
                            edge.nli_label,
                            edge.nli_confidence,
                            edge.created_at.to_rfc3339(),
                        ],
                    )?;
                    Ok(edge.id.clone())
                }
            }
        })
    }

    /// Insert a citation edge; duplicates on (source, target) are ignored.
    pub fn insert_cites_edge(&self, edge: &Edge) -> Result<()> {
        if edge.relation != Relation::Cites || !edge.endpoints_valid() {
            return Err(Error::Invariant("not a cites edge".to_string()));
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO edges (id, source_kind, source_id, target_kind, target_id,
                                              relation, citation_source, human_corrected, created_at)
                 VALUES (?1, 'page', ?2, 'page', ?3, 'cites', ?4, 0, ?5)",
                params![
                    edge.id.to_string(),
                    edge.source_id,
                    edge.target_id,
                    edge.citation_source.map(|s| s.to_string()),
                    edge.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_edge(&self, id: &EdgeId) -> Result<Option<Edge>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, source_kind, source_id, target_kind, target_id, relation,
                        nli_label, nli_confidence, citation_source, human_corrected, created_at
                 FROM edges WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_edge(row),
            )
            .optional()
        })
    }

    /// All claim-incident NLI edges for a task.
    pub fn nli_edges_for_task(&self, task_id: &TaskId) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.id, e.source_kind, e.source_id, e.target_kind, e.target_id, e.relation,
                        e.nli_label, e.nli_confidence, e.citation_source, e.human_corrected, e.created_at
                 FROM edges e
                 JOIN claims c ON c.id = e.target_id
                 WHERE c.task_id = ?1 AND e.relation IN ('supports','refutes','neutral')",
            )?;
            let edges = stmt
                .query_map(params![task_id.to_string()], |row| Self::row_to_edge(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(edges)
        })
    }

    pub fn nli_edges_for_claim(&self, claim_id: &ClaimId) -> Result<Vec<Edge>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_kind, source_id, target_kind, target_id, relation,
                        nli_label, nli_confidence, citation_source, human_corrected, created_at
                 FROM edges
                 WHERE target_id = ?1 AND relation IN ('supports','refutes','neutral')",
            )?;
            let edges = stmt
                .query_map(params![claim_id.to_string()], |row| Self::row_to_edge(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(edges)
        })
    }

    /// Cites edges whose source page is in the given set, chunked.
    pub fn cites_edges_from_pages(&self, page_ids: &[PageId]) -> Result<Vec<Edge>> {
        let mut edges = Vec::new();
        for chunk in page_ids.chunks(MAX_BOUND_PARAMS) {
            let mut chunk_edges = self.with_conn(|conn| {
                let placeholders: Vec<String> =
                    (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "SELECT id, source_kind, source_id, target_kind, target_id, relation,
                            nli_label, nli_confidence, citation_source, human_corrected, created_at
                     FROM edges WHERE relation = 'cites' AND source_id IN ({})",
                    placeholders.join(",")
                );
                let params_vec: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                        Self::row_to_edge(row)
                    })?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<_>>();
                Ok(rows)
            })?;
            edges.append(&mut chunk_edges);
        }
        Ok(edges)
    }

    fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<Edge> {
        let id_str: String = row.get(0)?;
        let source_kind: String = row.get(1)?;
        let target_kind: String = row.get(3)?;
        let relation_str: String = row.get(5)?;
        let citation: Option<String> = row.get(8)?;
        Ok(Edge {
            id: EdgeId::parse(&id_str).unwrap_or_default(),
            source_kind: EntityKind::parse(&source_kind).unwrap_or(EntityKind::Fragment),
            source_id: row.get(2)?,
            target_kind: EntityKind::parse(&target_kind).unwrap_or(EntityKind::Claim),
            target_id: row.get(4)?,
            relation: Relation::parse(&relation_str).unwrap_or(Relation::Neutral),
            nli_label: row.get(6)?,
            nli_confidence: row.get(7)?,
            citation_source: citation.as_deref().and_then(CitationSource::parse),
            human_corrected: row.get::<_, i64>(9)? != 0,
            created_at: parse_datetime(row.get::<_, String>(10)?),
        })
    }

    // ==================== Jobs ====================

    /// Enqueue a job. Duplicate enqueues of the same dedup key while a live
    /// job exists return the live job's id, keeping queue_targets idempotent.
    pub fn enqueue_job(&self, job: &Job) -> Result<(JobId, bool)> {
        let dedup_key = job.input.dedup_key(&job.task_id);
        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    "SELECT id FROM jobs WHERE dedup_key = ?1
                     AND state IN ('queued','running','awaiting_auth')",
                    params![dedup_key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;

            if let Some(id) = existing {
                return Ok((JobId::parse(&id).unwrap_or_default(), false));
            }

            tx.execute(
                "INSERT INTO jobs (id, task_id, kind, priority, state, dedup_key, queued_at, input)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7)",
                params![
                    job.id.to_string(),
                    job.task_id.to_string(),
                    job.kind.to_string(),
                    job.priority.rank(),
                    dedup_key,
                    job.queued_at.to_rfc3339(),
                    serde_json::to_string(&job.input).unwrap_or_default(),
                ],
            )?;
            Ok((job.id.clone(), true))
        })
    }

    /// Atomically claim the next queued job: priority ASC then queued_at ASC.
    ///
    /// The conditional update succeeds exactly once under concurrent
    /// attempts; a worker that loses the race retries the selection loop.
    pub fn claim_next_job(&self) -> Result<Option<Job>> {
        loop {
            // Jobs of paused or failed tasks are never claimed.
            let candidate = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT j.id FROM jobs j
                     JOIN tasks t ON t.id = j.task_id
                     WHERE j.state = 'queued' AND t.status NOT IN ('paused','failed')
                     ORDER BY j.priority ASC, j.queued_at ASC LIMIT 1",
                    [],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })?;

            let id = match candidate {
                Some(id) => id,
                None => return Ok(None),
            };

            let claimed = self.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE jobs SET state = 'running', started_at = ?2
                     WHERE id = ?1 AND state = 'queued'",
                    params![id, Utc::now().to_rfc3339()],
                )?;
                Ok(rows > 0)
            })?;

            if claimed {
                return self.get_job(&JobId::parse(&id).unwrap_or_default());
            }
            // Lost the race; select again.
        }
    }

    pub fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, kind, priority, state, queued_at, started_at, finished_at,
                        input, error_message
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_job(row),
            )
            .optional()
        })
    }

    pub fn jobs_for_task(&self, task_id: &TaskId) -> Result<Vec<Job>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, kind, priority, state, queued_at, started_at, finished_at,
                        input, error_message
                 FROM jobs WHERE task_id = ?1 ORDER BY queued_at ASC",
            )?;
            let jobs = stmt
                .query_map(params![task_id.to_string()], |row| Self::row_to_job(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(jobs)
        })
    }

    /// Transition a job, enforcing the state DAG. Returns false when the
    /// current state does not admit the transition (e.g. already terminal).
    pub fn transition_job(
        &self,
        id: &JobId,
        next: JobState,
        error_message: Option<&str>,
    ) -> Result<bool> {
        self.with_tx(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT state FROM jobs WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let current = match current.as_deref().and_then(JobState::parse) {
                Some(s) => s,
                None => return Ok(false),
            };
            if !current.can_transition_to(next) {
                return Ok(false);
            }

            let now = Utc::now().to_rfc3339();
            let finished_at = if next.is_terminal() { Some(now.clone()) } else { None };
            let rows = tx.execute(
                "UPDATE jobs SET state = ?2, finished_at = COALESCE(?3, finished_at),
                        error_message = COALESCE(?4, error_message)
                 WHERE id = ?1 AND state = ?5",
                params![
                    id.to_string(),
                    next.to_string(),
                    finished_at,
                    error_message,
                    current.to_string(),
                ],
            )?;
            Ok(rows > 0)
        })
    }

    /// How many jobs with this dedup key have already failed; drives the
    /// optional automatic retry policy.
    pub fn failed_attempts(&self, dedup_key: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE dedup_key = ?1 AND state = 'failed'",
                params![dedup_key],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
    }

    /// Pending awaiting_auth jobs of a task matching the scope; cancelled
    /// by a full-mode stop.
    pub fn awaiting_auth_jobs(&self, task_id: &TaskId, scope: CancelScope) -> Result<Vec<Job>> {
        Ok(self
            .jobs_for_task(task_id)?
            .into_iter()
            .filter(|j| j.state == JobState::AwaitingAuth && scope.includes(j.kind))
            .collect())
    }

    /// Requeue an awaiting_auth job, preserving its original priority.
    pub fn requeue_blocked_job(&self, id: &JobId) -> Result<bool> {
        self.transition_job(id, JobState::Queued, None)
    }

    /// Cancel queued jobs of a task matching the scope. Returns count.
    pub fn cancel_queued_jobs(&self, task_id: &TaskId, scope: CancelScope) -> Result<u32> {
        let kinds: Vec<&str> = [JobKind::TargetQueue, JobKind::VerifyNli, JobKind::CitationGraph]
            .iter()
            .filter(|k| scope.includes(**k))
            .map(|k| match k {
                JobKind::TargetQueue => "target_queue",
                JobKind::VerifyNli => "verify_nli",
                JobKind::CitationGraph => "citation_graph",
            })
            .collect();
        if kinds.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (3..3 + kinds.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE jobs SET state = 'cancelled', finished_at = ?2
                 WHERE task_id = ?1 AND state = 'queued' AND kind IN ({})",
                placeholders.join(",")
            );
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(task_id.to_string()),
                Box::new(Utc::now().to_rfc3339()),
            ];
            for k in &kinds {
                bound.push(Box::new(k.to_string()));
            }
            let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = conn.execute(&sql, refs.as_slice())?;
            Ok(rows as u32)
        })
    }

    /// Running jobs of a task, optionally filtered by scope.
    pub fn running_jobs(&self, task_id: &TaskId, scope: CancelScope) -> Result<Vec<Job>> {
        Ok(self
            .jobs_for_task(task_id)?
            .into_iter()
            .filter(|j| j.state == JobState::Running && scope.includes(j.kind))
            .collect())
    }

    /// Whether any job of the task is queued or running.
    pub fn has_live_jobs(&self, task_id: &TaskId) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE task_id = ?1 AND state IN ('queued','running')",
                params![task_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    /// Derive milestone flags from the job table.
    pub fn milestones(&self, task_id: &TaskId) -> Result<Milestones> {
        self.with_conn(|conn| {
            let live = |kind: &str| -> rusqlite::Result<i64> {
                conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM jobs
                         WHERE task_id = ?1 AND kind = '{}'
                           AND state IN ('queued','running','awaiting_auth')",
                        kind
                    ),
                    params![task_id.to_string()],
                    |row| row.get(0),
                )
            };

            let tq_total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE task_id = ?1 AND kind = 'target_queue'",
                params![task_id.to_string()],
                |row| row.get(0),
            )?;
            let tq_live = live("target_queue")?;
            let vn_live = live("verify_nli")?;
            let cg_live = live("citation_graph")?;

            // Follow-ups are only spawned by target jobs, so once the
            // target queue drains, no live follow-ups means the phase is
            // done. A task whose pages spawned zero follow-ups (all
            // non-academic) is done, not stuck.
            let drained = tq_total > 0 && tq_live == 0;
            Ok(Milestones {
                target_queue_drained: drained,
                nli_verification_done: drained && vn_live == 0,
                citation_chase_ready: drained && cg_live == 0,
            })
        })
    }

    // ==================== Auth queue ====================

    pub fn insert_auth_item(&self, item: &crate::auth::AuthItem) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_queue (id, domain, challenge_type, blocking_job_ids, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    item.id.to_string(),
                    item.domain,
                    item.challenge_type.to_string(),
                    serde_json::to_string(&item.blocking_job_ids).unwrap_or_default(),
                    item.status.to_string(),
                    item.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn pending_auth_items(&self) -> Result<Vec<crate::auth::AuthItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, domain, challenge_type, blocking_job_ids, status, created_at
                 FROM auth_queue WHERE status = 'pending' ORDER BY created_at ASC",
            )?;
            let items = stmt
                .query_map([], |row| Self::row_to_auth_item(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(items)
        })
    }

    pub fn get_auth_item(&self, id: &crate::auth::AuthItemId) -> Result<Option<crate::auth::AuthItem>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, domain, challenge_type, blocking_job_ids, status, created_at
                 FROM auth_queue WHERE id = ?1",
                params![id.to_string()],
                |row| Self::row_to_auth_item(row),
            )
            .optional()
        })
    }

    pub fn set_auth_item_status(
        &self,
        id: &crate::auth::AuthItemId,
        status: crate::auth::AuthStatus,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "UPDATE auth_queue SET status = ?2, resolved_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), status.to_string(), Utc::now().to_rfc3339()],
            )?;
            Ok(rows > 0)
        })
    }

    /// Pending auth items blocking jobs of the given task.
    pub fn auth_items_for_task(&self, task_id: &TaskId) -> Result<Vec<crate::auth::AuthItem>> {
        let jobs: std::collections::HashSet<String> = self
            .jobs_for_task(task_id)?
            .into_iter()
            .map(|j| j.id.to_string())
            .collect();
        Ok(self
            .pending_auth_items()?
            .into_iter()
            .filter(|item| {
                item.blocking_job_ids
                    .iter()
                    .any(|id| jobs.contains(&id.to_string()))
            })
            .collect())
    }

    fn row_to_auth_item(row: &rusqlite::Row) -> rusqlite::Result<crate::auth::AuthItem> {
        use crate::auth::{AuthItem, AuthItemId, AuthStatus, ChallengeType};
        let id_str: String = row.get(0)?;
        let challenge_str: String = row.get(2)?;
        let status_str: String = row.get(4)?;
        let blocking: Vec<String> =
            serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
        Ok(AuthItem {
            id: AuthItemId::parse(&id_str).unwrap_or_default(),
            domain: row.get(1)?,
            challenge_type: ChallengeType::parse(&challenge_str)
                .unwrap_or(ChallengeType::Captcha),
            blocking_job_ids: blocking
                .iter()
                .filter_map(|s| JobId::parse(s))
                .collect(),
            status: AuthStatus::parse(&status_str).unwrap_or(AuthStatus::Pending),
            created_at: parse_datetime(row.get::<_, String>(5)?),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let id_str: String = row.get(0)?;
        let task_str: String = row.get(1)?;
        let kind_str: String = row.get(2)?;
        let state_str: String = row.get(4)?;
        let input: JobInput = serde_json::from_str(&row.get::<_, String>(8)?)
            .unwrap_or(JobInput::VerifyNli { attempt: 0 });
        Ok(Job {
            id: JobId::parse(&id_str).unwrap_or_default(),
            task_id: TaskId::parse(&task_str).unwrap_or_default(),
            kind: JobKind::parse(&kind_str).unwrap_or(JobKind::TargetQueue),
            priority: Priority::from_rank(row.get(3)?),
            state: JobState::parse(&state_str).unwrap_or(JobState::Queued),
            queued_at: parse_datetime(row.get::<_, String>(5)?),
            started_at: row.get::<_, Option<String>>(6)?.map(parse_datetime),
            finished_at: row.get::<_, Option<String>>(7)?.map(parse_datetime),
            input,
            error_message: row.get(9)?,
        })
    }

    // ==================== Feedback ====================

    /// Correct an edge label. Returns true when the label actually changed;
    /// a same-label correction is a no-op and appends nothing.
    pub fn correct_edge(&self, edge_id: &EdgeId, correct_label: Relation) -> Result<bool> {
        if !correct_label.is_nli() {
            return Err(Error::invalid_input("label", "supports|refutes|neutral"));
        }
        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    "SELECT relation, nli_confidence FROM edges
                     WHERE id = ?1 AND relation IN ('supports','refutes','neutral')",
                    params![edge_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<f64>>(1)?,
                        ))
                    },
                )
                .optional()?;

            let (predicted, confidence) = match existing {
                Some(v) => v,
                None => return Ok(false),
            };

            if predicted == correct_label.to_string() {
                return Ok(false);
            }

            tx.execute(
                "UPDATE edges SET relation = ?2, nli_label = ?2, human_corrected = 1 WHERE id = ?1",
                params![edge_id.to_string(), correct_label.to_string()],
            )?;
            tx.execute(
                "INSERT INTO nli_corrections (edge_id, predicted_label, correct_label, predicted_confidence)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    edge_id.to_string(),
                    predicted,
                    correct_label.to_string(),
                    confidence.unwrap_or(0.0),
                ],
            )?;
            Ok(true)
        })
    }

    pub fn corrections_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM nli_corrections", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    // ==================== Domain policy ====================

    pub fn set_domain_policy(&self, domain: &str, policy: &str, note: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO domain_policy (domain, policy, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(domain) DO UPDATE SET policy = ?2, note = ?3, updated_at = ?4",
                params![domain, policy, note, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn clear_domain_policy(&self, domain: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM domain_policy WHERE domain = ?1",
                params![domain],
            )?;
            Ok(rows > 0)
        })
    }

    pub fn is_domain_blocked(&self, domain: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let policy: Option<String> = conn
                .query_row(
                    "SELECT policy FROM domain_policy WHERE domain = ?1",
                    params![domain],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(policy.as_deref() == Some("blocked"))
        })
    }

    /// Cancel queued jobs whose target references the blocked domain.
    pub fn cancel_jobs_for_domain(&self, domain: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let pattern = format!("%{}%", domain);
            let rows = conn.execute(
                "UPDATE jobs SET state = 'cancelled', finished_at = ?2,
                        error_message = 'domain blocked'
                 WHERE state = 'queued' AND kind = 'target_queue' AND input LIKE ?1",
                params![pattern, Utc::now().to_rfc3339()],
            )?;
            Ok(rows as u32)
        })
    }

    // ==================== SERP cache ====================

    pub fn serp_cache_get(&self, key: &str, ttl_secs: u64) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT response, created_at FROM serp_cache WHERE cache_key = ?1",
                    params![key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(response, created)| {
                let age = Utc::now() - parse_datetime(created);
                if age < Duration::seconds(ttl_secs as i64) {
                    Some(response)
                } else {
                    None
                }
            }))
        })
    }

    pub fn serp_cache_put(
        &self,
        key: &str,
        normalized_query: &str,
        engines: &str,
        time_range: Option<&str>,
        page: u32,
        response: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO serp_cache (cache_key, normalized_query, engines, time_range, page, response, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(cache_key) DO UPDATE SET response = ?6, created_at = ?7",
                params![
                    key,
                    normalized_query,
                    engines,
                    time_range,
                    page,
                    response,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Calibration ====================

    pub fn calibration_params(&self, source: &str) -> Result<Option<(String, String)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT method, params FROM calibration_params WHERE source = ?1",
                params![source],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    pub fn set_calibration_params(
        &self,
        source: &str,
        method: &str,
        params_json: &str,
        note: Option<&str>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO calibration_params (source, method, params, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(source) DO UPDATE SET method = ?2, params = ?3, updated_at = ?4",
                params![source, method, params_json, Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "INSERT INTO calibration_history (source, method, params, note)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source, method, params_json, note],
            )?;
            Ok(())
        })
    }

    /// Roll calibration for a source back to its previous history entry.
    /// Returns the restored (method, params) or None when no prior exists.
    pub fn rollback_calibration(&self, source: &str) -> Result<Option<(String, String)>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT method, params FROM calibration_history
                 WHERE source = ?1 ORDER BY id DESC LIMIT 2",
            )?;
            let entries: Vec<(String, String)> = stmt
                .query_map(params![source], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();

            if entries.len() < 2 {
                return Ok(None);
            }
            let (method, params_json) = entries[1].clone();
            tx.execute(
                "UPDATE calibration_params SET method = ?2, params = ?3, updated_at = ?4
                 WHERE source = ?1",
                params![source, method, params_json, Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "INSERT INTO calibration_history (source, method, params, note)
                 VALUES (?1, ?2, ?3, 'rollback')",
                params![source, method, params_json],
            )?;
            Ok(Some((method, params_json)))
        })
    }
}

/// Decode a little-endian f32 embedding blob.
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Encode an embedding as a little-endian f32 blob.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn json_or_default<T: serde::de::DeserializeOwned + Default>(s: String) -> T {
    serde_json::from_str(&s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    #[test]
    fn test_task_roundtrip() {
        let store = store();
        let task = Task::new("coffee improves memory");
        store.insert_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.central_hypothesis, "coffee improves memory");
        assert_eq!(loaded.status, TaskStatus::Created);

        store
            .set_task_status(&task.id, TaskStatus::Exploring)
            .unwrap();
        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Exploring);
    }

    #[test]
    fn test_upsert_page_merges_metadata() {
        let store = store();
        let mut page = Page::new("https://doi.org/10.1/x", "doi.org", PageType::Academic);
        page.paper_metadata = Some(PaperMetadata {
            doi: Some("10.1/x".to_string()),
            year: Some(2020),
            source_api: Some(SourceApi::OpenAlex),
            ..Default::default()
        });
        let (id1, created) = store.upsert_page(&page).unwrap();
        assert!(created);

        // Same URL from semantic_scholar overrides year, fills venue.
        let mut again = Page::new("https://doi.org/10.1/x", "doi.org", PageType::Academic);
        again.paper_metadata = Some(PaperMetadata {
            doi: Some("10.1/x".to_string()),
            year: Some(2021),
            venue: Some("Nature".to_string()),
            source_api: Some(SourceApi::SemanticScholar),
            ..Default::default()
        });
        let (id2, created) = store.upsert_page(&again).unwrap();
        assert!(!created);
        assert_eq!(id1, id2);

        let loaded = store.get_page(&id1).unwrap().unwrap();
        let meta = loaded.paper_metadata.unwrap();
        assert_eq!(meta.year, Some(2021));
        assert_eq!(meta.venue, Some("Nature".to_string()));
        assert_eq!(meta.source_api, Some(SourceApi::SemanticScholar));
    }

    #[test]
    fn test_lower_priority_never_downgrades() {
        let store = store();
        let mut page = Page::new("https://x.org/p", "x.org", PageType::Academic);
        page.paper_metadata = Some(PaperMetadata {
            year: Some(2020),
            source_api: Some(SourceApi::SemanticScholar),
            ..Default::default()
        });
        let (id, _) = store.upsert_page(&page).unwrap();

        let mut worse = Page::new("https://x.org/p", "x.org", PageType::Academic);
        worse.paper_metadata = Some(PaperMetadata {
            year: Some(1999),
            source_api: Some(SourceApi::Extraction),
            ..Default::default()
        });
        store.upsert_page(&worse).unwrap();

        let meta = store.get_page(&id).unwrap().unwrap().paper_metadata.unwrap();
        assert_eq!(meta.year, Some(2020));
        assert_eq!(meta.source_api, Some(SourceApi::SemanticScholar));
    }

    #[test]
    fn test_malformed_metadata_projects_null() {
        let store = store();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO pages (id, url, domain, page_type, paper_metadata)
                     VALUES (?1, 'https://bad.org/x', 'bad.org', 'article', '{not json')",
                    params![PageId::new().to_string()],
                )?;
                Ok(())
            })
            .unwrap();

        let page = store.get_page_by_url("https://bad.org/x").unwrap().unwrap();
        assert!(page.paper_metadata.is_none());
    }

    #[test]
    fn test_nli_edge_replaces_not_duplicates() {
        let store = store();
        let frag = FragmentId::new();
        let claim = ClaimId::new();

        store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Supports, 0.9))
            .unwrap();
        let id2 = store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Refutes, 0.7))
            .unwrap();

        let edge = store.get_edge(&id2).unwrap().unwrap();
        assert_eq!(edge.relation, Relation::Refutes);
        assert_eq!(edge.nli_confidence, Some(0.7));

        let all = store.nli_edges_for_claim(&claim).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_human_correction_wins_over_rejudgement() {
        let store = store();
        let frag = FragmentId::new();
        let claim = ClaimId::new();

        let id = store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Supports, 0.9))
            .unwrap();
        assert!(store.correct_edge(&id, Relation::Refutes).unwrap());

        // Re-judgement does not override the human label.
        store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Supports, 0.95))
            .unwrap();
        let edge = store.get_edge(&id).unwrap().unwrap();
        assert_eq!(edge.relation, Relation::Refutes);
        assert!(edge.human_corrected);
    }

    #[test]
    fn test_same_label_correction_is_noop() {
        let store = store();
        let frag = FragmentId::new();
        let claim = ClaimId::new();
        let id = store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Supports, 0.9))
            .unwrap();

        assert!(!store.correct_edge(&id, Relation::Supports).unwrap());
        assert_eq!(store.corrections_count().unwrap(), 0);

        assert!(store.correct_edge(&id, Relation::Neutral).unwrap());
        assert_eq!(store.corrections_count().unwrap(), 1);
    }

    #[test]
    fn test_evidence_source_edges_rejected() {
        let store = store();
        let claim = ClaimId::new();
        let page = PageId::new();
        let edge = Edge {
            id: EdgeId::new(),
            source_kind: EntityKind::Claim,
            source_id: claim.to_string(),
            target_kind: EntityKind::Page,
            target_id: page.to_string(),
            relation: Relation::EvidenceSource,
            nli_label: None,
            nli_confidence: None,
            citation_source: None,
            human_corrected: false,
            created_at: Utc::now(),
        };
        assert!(store.upsert_nli_edge(&edge).is_err());
        assert!(store.insert_cites_edge(&edge).is_err());
    }

    #[test]
    fn test_cites_edges_idempotent() {
        let store = store();
        let a = PageId::new();
        let b = PageId::new();
        store
            .insert_cites_edge(&Edge::cites(&a, &b, CitationSource::OpenAlex))
            .unwrap();
        store
            .insert_cites_edge(&Edge::cites(&a, &b, CitationSource::SemanticScholar))
            .unwrap();

        let edges = store.cites_edges_from_pages(&[a.clone()]).unwrap();
        assert_eq!(edges.len(), 1);
    }

    #[test]
    fn test_chunked_page_lookup_with_many_ids() {
        let store = store();
        let mut ids = Vec::new();
        for i in 0..50 {
            let page = Page::new(format!("https://x.org/{}", i), "x.org", PageType::Article);
            let (id, _) = store.upsert_page(&page).unwrap();
            ids.push(id);
        }
        // Pad with unknown ids to exercise the chunking path well past one
        // statement's worth of parameters.
        for _ in 0..10_000 {
            ids.push(PageId::new());
        }
        let pages = store.pages_by_ids(&ids).unwrap();
        assert_eq!(pages.len(), 50);
    }

    #[test]
    fn test_serp_cache_ttl() {
        let store = store();
        store
            .serp_cache_put("k1", "q", "ddg", None, 1, "{\"results\":[]}")
            .unwrap();
        assert!(store.serp_cache_get("k1", 3600).unwrap().is_some());
        assert!(store.serp_cache_get("k1", 0).unwrap().is_none());
        assert!(store.serp_cache_get("missing", 3600).unwrap().is_none());
    }

    #[test]
    fn test_domain_policy() {
        let store = store();
        store
            .set_domain_policy("paywall.example", "blocked", Some("manual"))
            .unwrap();
        assert!(store.is_domain_blocked("paywall.example").unwrap());
        store.set_domain_policy("paywall.example", "allowed", None).unwrap();
        assert!(!store.is_domain_blocked("paywall.example").unwrap());
        assert!(store.clear_domain_policy("paywall.example").unwrap());
        assert!(!store.clear_domain_policy("paywall.example").unwrap());
    }

    #[test]
    fn test_calibration_rollback() {
        let store = store();
        assert!(store.rollback_calibration("nli-v1").unwrap().is_none());

        store
            .set_calibration_params("nli-v1", "platt", r#"{"a":1.0,"b":0.0}"#, None)
            .unwrap();
        store
            .set_calibration_params("nli-v1", "temperature", r#"{"t":1.4}"#, None)
            .unwrap();

        let (method, params_json) = store.rollback_calibration("nli-v1").unwrap().unwrap();
        assert_eq!(method, "platt");
        assert!(params_json.contains("\"a\""));

        let (current_method, _) = store.calibration_params("nli-v1").unwrap().unwrap();
        assert_eq!(current_method, "platt");
    }

    #[test]
    fn test_enqueue_job_idempotent() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();

        let job = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("dpp-4 inhibitors")),
            Priority::Medium,
        );
        let (id1, created1) = store.enqueue_job(&job).unwrap();
        assert!(created1);

        // Same value, different Job instance: returns the live job's id.
        let dup = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("DPP-4 Inhibitors")),
            Priority::Medium,
        );
        let (id2, created2) = store.enqueue_job(&dup).unwrap();
        assert!(!created2);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_claim_order_priority_then_fifo() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();

        let low = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("low")),
            Priority::Low,
        );
        let high = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("high")),
            Priority::High,
        );
        store.enqueue_job(&low).unwrap();
        store.enqueue_job(&high).unwrap();

        let first = store.claim_next_job().unwrap().unwrap();
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.state, JobState::Running);

        let second = store.claim_next_job().unwrap().unwrap();
        assert_eq!(second.priority, Priority::Low);

        assert!(store.claim_next_job().unwrap().is_none());
    }

    #[test]
    fn test_transition_enforces_dag() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let job = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("q")),
            Priority::Medium,
        );
        let (id, _) = store.enqueue_job(&job).unwrap();

        // queued -> completed is illegal.
        assert!(!store.transition_job(&id, JobState::Completed, None).unwrap());

        let claimed = store.claim_next_job().unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(store.transition_job(&id, JobState::Completed, None).unwrap());

        // Terminal states admit nothing further.
        assert!(!store.transition_job(&id, JobState::Queued, None).unwrap());
        let job = store.get_job(&id).unwrap().unwrap();
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_awaiting_auth_requeue_cycle() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let job = Job::new(
            task.id.clone(),
            JobInput::Target(Target::url("https://blocked.example/a")),
            Priority::Medium,
        );
        let (id, _) = store.enqueue_job(&job).unwrap();
        store.claim_next_job().unwrap().unwrap();

        assert!(store
            .transition_job(&id, JobState::AwaitingAuth, None)
            .unwrap());
        assert!(store.requeue_blocked_job(&id).unwrap());
        let job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.priority, Priority::Medium);
    }

    #[test]
    fn test_cancel_scope_leaves_other_kinds() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();

        store
            .enqueue_job(&Job::new(
                task.id.clone(),
                JobInput::Target(Target::query("q")),
                Priority::Medium,
            ))
            .unwrap();
        store
            .enqueue_job(&Job::new(
                task.id.clone(),
                JobInput::CitationGraph {
                    page_id: PageId::new(),
                    attempt: 0,
                },
                Priority::Low,
            ))
            .unwrap();

        let cancelled = store
            .cancel_queued_jobs(&task.id, CancelScope::TargetQueueOnly)
            .unwrap();
        assert_eq!(cancelled, 1);

        let jobs = store.jobs_for_task(&task.id).unwrap();
        let citation = jobs
            .iter()
            .find(|j| j.kind == JobKind::CitationGraph)
            .unwrap();
        assert_eq!(citation.state, JobState::Queued);
    }

    #[test]
    fn test_milestones_from_job_table() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();

        // No jobs at all: nothing is drained, so nothing is done.
        let m = store.milestones(&task.id).unwrap();
        assert!(!m.target_queue_drained);
        assert!(!m.nli_verification_done);
        assert!(!m.citation_chase_ready);

        let job = Job::new(
            task.id.clone(),
            JobInput::Target(Target::query("q")),
            Priority::Medium,
        );
        let (id, _) = store.enqueue_job(&job).unwrap();
        let m = store.milestones(&task.id).unwrap();
        assert!(!m.target_queue_drained);

        // Drained with zero follow-ups ever spawned: done, not stuck.
        store.claim_next_job().unwrap().unwrap();
        store.transition_job(&id, JobState::Completed, None).unwrap();
        let m = store.milestones(&task.id).unwrap();
        assert!(m.target_queue_drained);
        assert!(m.nli_verification_done);
        assert!(m.citation_chase_ready);

        // A live follow-up flips its milestone back off.
        let verify = Job::new(task.id.clone(), JobInput::VerifyNli { attempt: 0 }, Priority::Medium);
        let (verify_id, _) = store.enqueue_job(&verify).unwrap();
        let m = store.milestones(&task.id).unwrap();
        assert!(m.target_queue_drained);
        assert!(!m.nli_verification_done);
        assert!(m.citation_chase_ready);

        store.claim_next_job().unwrap().unwrap();
        store
            .transition_job(&verify_id, JobState::Completed, None)
            .unwrap();
        let m = store.milestones(&task.id).unwrap();
        assert!(m.nli_verification_done);
    }

    #[test]
    fn test_embedding_roundtrip() {
        let store = store();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let claim = Claim::new(task.id.clone(), "c", ClaimType::Factual);
        store.insert_claim(&claim).unwrap();

        store
            .set_claim_embedding(&claim.id, &[0.1, -0.5, 2.0])
            .unwrap();
        let rows = store.claim_embeddings(Some(&task.id)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.len(), 3);
        assert!((rows[0].2[2] - 2.0).abs() < 1e-6);
    }
}
