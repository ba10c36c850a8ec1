//! Named SQL views over the evidence graph.
//!
//! Each view is a fixed SQL template with named parameter slots; binding
//! is parameter-only, never string interpolation. The registry is the only
//! path from view names to SQL.

use crate::error::{Error, Result};
use crate::storage::store::Store;
use rusqlite::types::ValueRef;
use serde_json::{Map, Value};

/// A registered view template.
#[derive(Debug, Clone, Copy)]
pub struct ViewDef {
    pub name: &'static str,
    pub description: &'static str,
    /// Named parameters the template requires, without the leading colon.
    pub params: &'static [&'static str],
    pub sql: &'static str,
}

/// Task source pages: pages whose fragments carry claim edges into the task.
const SOURCE_PAGES: &str = "SELECT DISTINCT f.page_id FROM fragments f
     JOIN edges e ON e.source_id = f.id AND e.relation IN ('supports','refutes','neutral')
     JOIN claims c ON c.id = e.target_id
     WHERE c.task_id = :task_id";

/// The fixed view registry.
pub static VIEWS: &[ViewDef] = &[
    ViewDef {
        name: "v_claim_evidence_summary",
        description: "Per-claim evidence counts and Bayesian aggregate",
        params: &["task_id"],
        sql: "SELECT c.id AS claim_id, c.claim_text, c.claim_type, c.adoption_status,
                     c.llm_confidence,
                     COALESCE(SUM(CASE WHEN e.relation = 'supports' THEN 1 ELSE 0 END), 0) AS supporting_count,
                     COALESCE(SUM(CASE WHEN e.relation = 'refutes' THEN 1 ELSE 0 END), 0) AS refuting_count,
                     COALESCE(SUM(CASE WHEN e.relation = 'neutral' THEN 1 ELSE 0 END), 0) AS neutral_count,
                     1.0 + COALESCE(SUM(CASE WHEN e.relation = 'supports' THEN e.nli_confidence ELSE 0 END), 0) AS alpha,
                     1.0 + COALESCE(SUM(CASE WHEN e.relation = 'refutes' THEN e.nli_confidence ELSE 0 END), 0) AS beta,
                     (1.0 + COALESCE(SUM(CASE WHEN e.relation = 'supports' THEN e.nli_confidence ELSE 0 END), 0))
                     / (2.0 + COALESCE(SUM(CASE WHEN e.relation = 'supports' THEN e.nli_confidence ELSE 0 END), 0)
                            + COALESCE(SUM(CASE WHEN e.relation = 'refutes' THEN e.nli_confidence ELSE 0 END), 0))
                       AS bayesian_truth_confidence
              FROM claims c
              LEFT JOIN edges e ON e.target_id = c.id
                   AND e.relation IN ('supports','refutes','neutral')
              WHERE c.task_id = :task_id
              GROUP BY c.id
              ORDER BY c.created_at ASC",
    },
    ViewDef {
        name: "v_claim_origins",
        description: "Pages each claim's evidence came from",
        params: &["task_id"],
        sql: "SELECT c.id AS claim_id, c.claim_text, p.id AS page_id, p.url, p.title,
                     COUNT(e.id) AS fragment_edges
              FROM claims c
              JOIN edges e ON e.target_id = c.id
                   AND e.relation IN ('supports','refutes','neutral')
              JOIN fragments f ON f.id = e.source_id
              JOIN pages p ON p.id = f.page_id
              WHERE c.task_id = :task_id
              GROUP BY c.id, p.id
              ORDER BY c.created_at ASC, p.url ASC",
    },
    ViewDef {
        name: "v_contradictions",
        description: "Claims with both supporting and refuting evidence",
        params: &["task_id"],
        sql: "SELECT c.id AS claim_id, c.claim_text,
                     SUM(CASE WHEN e.relation = 'supports' THEN 1 ELSE 0 END) AS supporting_count,
                     SUM(CASE WHEN e.relation = 'refutes' THEN 1 ELSE 0 END) AS refuting_count
              FROM claims c
              JOIN edges e ON e.target_id = c.id
                   AND e.relation IN ('supports','refutes','neutral')
              WHERE c.task_id = :task_id
              GROUP BY c.id
              HAVING supporting_count > 0 AND refuting_count > 0
              ORDER BY c.created_at ASC",
    },
    ViewDef {
        name: "v_unsupported_claims",
        description: "Claims with no supporting or refuting evidence",
        params: &["task_id"],
        sql: "SELECT c.id AS claim_id, c.claim_text, c.claim_type, c.llm_confidence
              FROM claims c
              WHERE c.task_id = :task_id
                AND NOT EXISTS (
                    SELECT 1 FROM edges e
                    WHERE e.target_id = c.id AND e.relation IN ('supports','refutes'))
              ORDER BY c.created_at ASC",
    },
    ViewDef {
        name: "v_evidence_chain",
        description: "Fragment evidence behind one claim, with page context",
        params: &["claim_id"],
        sql: "SELECT e.id AS edge_id, e.relation, e.nli_confidence, e.human_corrected,
                     f.id AS fragment_id, f.fragment_type, f.text_content, f.position,
                     p.id AS page_id, p.url, p.title
              FROM edges e
              JOIN fragments f ON f.id = e.source_id
              JOIN pages p ON p.id = f.page_id
              WHERE e.target_id = :claim_id
                AND e.relation IN ('supports','refutes','neutral')
              ORDER BY e.nli_confidence DESC",
    },
    ViewDef {
        name: "v_source_impact",
        description: "Per source page: claims touched and mean confidence",
        params: &["task_id"],
        sql: "SELECT p.id AS page_id, p.url, p.title, p.page_type,
                     COUNT(DISTINCT e.target_id) AS claims_touched,
                     COUNT(e.id) AS edge_count,
                     AVG(e.nli_confidence) AS mean_confidence
              FROM pages p
              JOIN fragments f ON f.page_id = p.id
              JOIN edges e ON e.source_id = f.id
                   AND e.relation IN ('supports','refutes','neutral')
              JOIN claims c ON c.id = e.target_id
              WHERE c.task_id = :task_id
              GROUP BY p.id
              ORDER BY claims_touched DESC, p.url ASC",
    },
    ViewDef {
        name: "v_reference_candidates",
        description: "Cited pages not yet fetched for this task",
        params: &["task_id"],
        sql: "SELECT DISTINCT p.id AS page_id, p.url, p.title,
                     json_extract(p.paper_metadata, '$.doi') AS doi,
                     json_extract(p.paper_metadata, '$.citation_count') AS citation_count
              FROM edges e
              JOIN pages p ON p.id = e.target_id
              WHERE e.relation = 'cites'
                AND e.source_id IN (SOURCE_PAGES)
                AND p.fetched_at IS NULL
              ORDER BY citation_count DESC NULLS LAST, p.url ASC",
    },
    ViewDef {
        name: "v_citation_flow",
        description: "Cites edges out of the task's source pages",
        params: &["task_id"],
        sql: "SELECT src.url AS source_url, dst.url AS target_url,
                     e.citation_source, dst.fetched_at IS NOT NULL AS target_fetched
              FROM edges e
              JOIN pages src ON src.id = e.source_id
              JOIN pages dst ON dst.id = e.target_id
              WHERE e.relation = 'cites'
                AND e.source_id IN (SOURCE_PAGES)
              ORDER BY src.url ASC, dst.url ASC",
    },
    ViewDef {
        name: "v_multi_source_claims",
        description: "Claims with evidence from more than one page",
        params: &["task_id"],
        sql: "SELECT c.id AS claim_id, c.claim_text,
                     COUNT(DISTINCT f.page_id) AS source_pages
              FROM claims c
              JOIN edges e ON e.target_id = c.id
                   AND e.relation IN ('supports','refutes','neutral')
              JOIN fragments f ON f.id = e.source_id
              WHERE c.task_id = :task_id
              GROUP BY c.id
              HAVING source_pages > 1
              ORDER BY source_pages DESC",
    },
    ViewDef {
        name: "v_claim_adoption",
        description: "Claim counts by adoption status",
        params: &["task_id"],
        sql: "SELECT adoption_status, COUNT(*) AS count
              FROM claims WHERE task_id = :task_id
              GROUP BY adoption_status ORDER BY adoption_status",
    },
    ViewDef {
        name: "v_edge_inventory",
        description: "Claim-incident edge counts by relation",
        params: &["task_id"],
        sql: "SELECT e.relation, COUNT(*) AS count, AVG(e.nli_confidence) AS mean_confidence
              FROM edges e
              JOIN claims c ON c.id = e.target_id
              WHERE c.task_id = :task_id
                AND e.relation IN ('supports','refutes','neutral')
              GROUP BY e.relation ORDER BY e.relation",
    },
    ViewDef {
        name: "v_page_inventory",
        description: "The task's source pages",
        params: &["task_id"],
        sql: "SELECT p.id AS page_id, p.url, p.domain, p.page_type, p.title, p.fetched_at,
                     json_extract(p.paper_metadata, '$.doi') AS doi,
                     json_extract(p.paper_metadata, '$.source_api') AS source_api
              FROM pages p
              WHERE p.id IN (SOURCE_PAGES)
              ORDER BY p.url ASC",
    },
    ViewDef {
        name: "v_fragment_counts",
        description: "Fragment counts per source page",
        params: &["task_id"],
        sql: "SELECT p.url, COUNT(f.id) AS fragment_count,
                     SUM(CASE WHEN f.fragment_type = 'abstract' THEN 1 ELSE 0 END) AS abstracts
              FROM pages p
              JOIN fragments f ON f.page_id = p.id
              WHERE p.id IN (SOURCE_PAGES)
              GROUP BY p.id ORDER BY p.url ASC",
    },
    ViewDef {
        name: "v_task_list",
        description: "All tasks with status and metrics",
        params: &[],
        sql: "SELECT id AS task_id, central_hypothesis, status, metrics, created_at, updated_at
              FROM tasks ORDER BY created_at DESC",
    },
    ViewDef {
        name: "v_budget_usage",
        description: "Task metrics against its budget caps",
        params: &["task_id"],
        sql: "SELECT id AS task_id, status,
                     json_extract(metrics, '$.pages') AS pages_used,
                     json_extract(budget, '$.max_pages') AS max_pages,
                     json_extract(metrics, '$.fragments') AS fragments_used,
                     json_extract(budget, '$.max_fragments') AS max_fragments,
                     json_extract(metrics, '$.claims') AS claims_used,
                     json_extract(budget, '$.max_claims') AS max_claims
              FROM tasks WHERE id = :task_id",
    },
    ViewDef {
        name: "v_jobs_by_state",
        description: "Job counts by kind and state for a task",
        params: &["task_id"],
        sql: "SELECT kind, state, COUNT(*) AS count
              FROM jobs WHERE task_id = :task_id
              GROUP BY kind, state ORDER BY kind, state",
    },
    ViewDef {
        name: "v_auth_pending",
        description: "Pending auth intervention items",
        params: &[],
        sql: "SELECT id AS item_id, domain, challenge_type, blocking_job_ids, created_at
              FROM auth_queue WHERE status = 'pending' ORDER BY created_at ASC",
    },
    ViewDef {
        name: "v_correction_log",
        description: "Recent NLI corrections, newest first",
        params: &[],
        sql: "SELECT edge_id, predicted_label, correct_label, predicted_confidence, created_at
              FROM nli_corrections ORDER BY id DESC LIMIT 200",
    },
    ViewDef {
        name: "v_calibration_history",
        description: "Calibration parameter history for a source tag",
        params: &["source"],
        sql: "SELECT source, method, params, note, created_at
              FROM calibration_history WHERE source = :source
              ORDER BY id DESC LIMIT 100",
    },
    ViewDef {
        name: "v_domain_policy",
        description: "Domain block/allow overrides",
        params: &[],
        sql: "SELECT domain, policy, note, updated_at
              FROM domain_policy ORDER BY domain ASC",
    },
    ViewDef {
        name: "v_serp_cache_stats",
        description: "SERP cache size and age range",
        params: &[],
        sql: "SELECT COUNT(*) AS entries, MIN(created_at) AS oldest, MAX(created_at) AS newest
              FROM serp_cache",
    },
    ViewDef {
        name: "v_recent_pages",
        description: "Most recently fetched pages",
        params: &[],
        sql: "SELECT url, domain, page_type, title, fetched_at
              FROM pages WHERE fetched_at IS NOT NULL
              ORDER BY fetched_at DESC LIMIT 100",
    },
];

/// Look up a view by name.
pub fn find_view(name: &str) -> Option<&'static ViewDef> {
    VIEWS.iter().find(|v| v.name == name)
}

/// List all view names with descriptions and parameter slots.
pub fn list_views() -> Vec<Value> {
    VIEWS
        .iter()
        .map(|v| {
            serde_json::json!({
                "name": v.name,
                "description": v.description,
                "params": v.params,
            })
        })
        .collect()
}

/// Run a named view with the given parameters. Rows come back as objects
/// keyed by column name.
pub fn run_view(store: &Store, name: &str, params: &Map<String, Value>) -> Result<Vec<Value>> {
    let view = find_view(name)
        .ok_or_else(|| Error::invalid_input("view_name", "a registered view"))?;

    for required in view.params {
        if !params.contains_key(*required) {
            return Err(Error::invalid_input(
                format!("params.{}", required),
                "a value for this view parameter",
            ));
        }
    }
    for key in params.keys() {
        if !view.params.contains(&key.as_str()) {
            return Err(Error::invalid_input(
                format!("params.{}", key),
                "no such parameter on this view",
            ));
        }
    }

    let sql = view.sql.replace("SOURCE_PAGES", SOURCE_PAGES);

    store.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;

        let bound: Vec<(String, String)> = view
            .params
            .iter()
            .map(|p| {
                let value = match params.get(*p) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                (format!(":{}", p), value)
            })
            .collect();
        let named: Vec<(&str, &dyn rusqlite::ToSql)> = bound
            .iter()
            .map(|(k, v)| (k.as_str(), v as &dyn rusqlite::ToSql))
            .collect();

        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(named.as_slice())?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (i, column) in columns.iter().enumerate() {
                object.insert(column.clone(), ref_to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(object));
        }
        Ok(out)
    })
}

fn ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::from(format!("<blob {} bytes>", b.len())),
    }
}
