//! Read-only SQL surface for the client.
//!
//! query_sql goes through here: a SELECT-only guard, a wall-clock deadline
//! and a VM-step budget enforced by a progress handler, and row truncation.

use crate::error::{DeadlineKind, Error, Result};
use crate::storage::store::Store;
use rusqlite::types::ValueRef;
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default row cap when the caller does not set one.
pub const DEFAULT_ROW_LIMIT: usize = 200;
/// Hard row cap regardless of caller options.
pub const MAX_ROW_LIMIT: usize = 5_000;
/// Progress handler callback interval in VM instructions.
const PROGRESS_INTERVAL: u64 = 100;

/// Options for a capped read query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_vm_steps")]
    pub max_vm_steps: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            timeout_ms: default_timeout_ms(),
            max_vm_steps: default_max_vm_steps(),
        }
    }
}

fn default_limit() -> usize {
    DEFAULT_ROW_LIMIT
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_max_vm_steps() -> u64 {
    1_000_000
}

/// Result of a read query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

/// Execute a read-only SQL statement with positional parameters.
pub fn execute(
    store: &Store,
    sql: &str,
    params: &[serde_json::Value],
    options: &QueryOptions,
) -> Result<QueryResult> {
    ensure_read_only(sql)?;

    let limit = options.limit.clamp(1, MAX_ROW_LIMIT);
    let deadline_flag = Arc::new(AtomicU8::new(0));
    let steps = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let flag = deadline_flag.clone();
    let step_counter = steps.clone();
    let timeout_ms = options.timeout_ms;
    let max_vm_steps = options.max_vm_steps.max(1);

    let result = store.with_conn(move |conn| {
        // Interrupt on whichever budget is exceeded first. The handler
        // fires every PROGRESS_INTERVAL VM instructions.
        conn.progress_handler(
            PROGRESS_INTERVAL as std::os::raw::c_int,
            Some(move || {
                let total = step_counter.fetch_add(PROGRESS_INTERVAL, Ordering::Relaxed)
                    + PROGRESS_INTERVAL;
                if total > max_vm_steps {
                    flag.store(2, Ordering::Relaxed);
                    return true;
                }
                if started.elapsed().as_millis() as u64 > timeout_ms {
                    flag.store(1, Ordering::Relaxed);
                    return true;
                }
                false
            }),
        );

        let out = run_select(conn, sql, params, limit);
        conn.progress_handler(0, None::<fn() -> bool>);
        out
    });

    match result {
        Ok((columns, rows, truncated)) => Ok(QueryResult {
            columns,
            rows,
            truncated,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
        Err(e) => match deadline_flag.load(Ordering::Relaxed) {
            1 => Err(Error::QueryLimit {
                kind: DeadlineKind::WallClock,
            }),
            2 => Err(Error::QueryLimit {
                kind: DeadlineKind::VmSteps,
            }),
            _ => Err(e),
        },
    }
}

fn run_select(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[serde_json::Value],
    limit: usize,
) -> rusqlite::Result<(Vec<String>, Vec<Vec<serde_json::Value>>, bool)> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        // Belt and braces on top of the keyword guard.
        return Err(rusqlite::Error::InvalidQuery);
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let bound: Vec<SqlParam> = params.iter().cloned().map(SqlParam).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;

    let mut out: Vec<Vec<serde_json::Value>> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if out.len() >= limit {
            truncated = true;
            break;
        }
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(value_to_json(row.get_ref(i)?));
        }
        out.push(values);
    }

    Ok((columns, out, truncated))
}

/// Reject anything that is not a single SELECT (or CTE-prefixed SELECT).
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_input("sql", "a SELECT statement"));
    }

    // Quoted literals are opaque to the guard: a claim text containing
    // "insert" or a semicolon must not trip it. SQL-level structure is
    // judged on the stripped text only.
    let stripped = strip_string_literals(trimmed);
    if stripped.contains(';') {
        return Err(Error::invalid_input("sql", "a single statement"));
    }

    let lowered = stripped.to_lowercase();
    let first_word = lowered.split_whitespace().next().unwrap_or("");
    if first_word != "select" && first_word != "with" {
        return Err(Error::invalid_input("sql", "a SELECT statement"));
    }

    // Word-level denylist catches CTE-wrapped writes ("WITH x AS ... INSERT
    // INTO") before SQLite sees them.
    const BANNED: &[&str] = &[
        "insert", "update", "delete", "drop", "alter", "create", "attach", "detach",
        "pragma", "vacuum", "reindex", "into",
    ];
    for word in lowered.split(|c: char| !c.is_alphanumeric() && c != '_') {
        if BANNED.contains(&word) {
            return Err(Error::invalid_input("sql", "a read-only statement"));
        }
    }
    Ok(())
}

/// Blank out the contents of single-quoted string literals, keeping the
/// quotes. The doubled-quote escape ('') stays inside its literal.
fn strip_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    in_string = false;
                    out.push('\'');
                }
            }
        } else if c == '\'' {
            in_string = true;
            out.push('\'');
        } else {
            out.push(c);
        }
    }
    out
}

/// JSON parameter bound into a prepared statement.
struct SqlParam(serde_json::Value);

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        let v = match &self.0 {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Integer(*b as i64),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        };
        Ok(ToSqlOutput::Owned(v))
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Value::from(f),
        ValueRef::Text(t) => serde_json::Value::from(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => serde_json::Value::from(format!("<blob {} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::Task;

    fn seeded_store() -> Store {
        let store = Store::in_memory().unwrap();
        for i in 0..10 {
            let task = Task::new(format!("hypothesis {}", i));
            store.insert_task(&task).unwrap();
        }
        store
    }

    #[test]
    fn test_basic_select() {
        let store = seeded_store();
        let result = execute(
            &store,
            "SELECT id, central_hypothesis FROM tasks ORDER BY created_at",
            &[],
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(result.columns, vec!["id", "central_hypothesis"]);
        assert_eq!(result.rows.len(), 10);
        assert!(!result.truncated);
    }

    #[test]
    fn test_parameter_binding() {
        let store = seeded_store();
        let result = execute(
            &store,
            "SELECT central_hypothesis FROM tasks WHERE central_hypothesis = ?1",
            &[serde_json::json!("hypothesis 3")],
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_truncation_flag() {
        let store = seeded_store();
        let options = QueryOptions {
            limit: 4,
            ..Default::default()
        };
        let result = execute(&store, "SELECT id FROM tasks", &[], &options).unwrap();
        assert_eq!(result.rows.len(), 4);
        assert!(result.truncated);
    }

    #[test]
    fn test_non_select_rejected() {
        let store = seeded_store();
        for sql in [
            "DELETE FROM tasks",
            "INSERT INTO tasks (id) VALUES ('x')",
            "UPDATE tasks SET status = 'failed'",
            "DROP TABLE tasks",
            "PRAGMA journal_mode = DELETE",
            "CREATE TABLE x (id)",
            "WITH c AS (SELECT 1) INSERT INTO tasks (id) SELECT * FROM c",
            "SELECT 1; DELETE FROM tasks",
            "",
        ] {
            let err = execute(&store, sql, &[], &QueryOptions::default());
            assert!(err.is_err(), "should reject: {}", sql);
        }
        // Tasks table untouched.
        let result = execute(
            &store,
            "SELECT COUNT(*) FROM tasks",
            &[],
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(10));
    }

    #[test]
    fn test_keywords_inside_string_literals_allowed() {
        let store = seeded_store();
        // Extracted research text routinely contains denylist words; quoted
        // literals must not trip the guard.
        for sql in [
            "SELECT id FROM tasks WHERE central_hypothesis LIKE '%insert coin%'",
            "SELECT COUNT(*) FROM tasks WHERE central_hypothesis = 'Into the Wild'",
            "SELECT COUNT(*) FROM tasks WHERE central_hypothesis = 'it''s an update'",
            "SELECT COUNT(*) FROM tasks WHERE central_hypothesis = 'a;b'",
        ] {
            let result = execute(&store, sql, &[], &QueryOptions::default());
            assert!(result.is_ok(), "should accept: {}", sql);
        }
    }

    #[test]
    fn test_strip_string_literals() {
        assert_eq!(strip_string_literals("SELECT 'insert into'"), "SELECT ''");
        assert_eq!(
            strip_string_literals("SELECT 'it''s', x FROM t"),
            "SELECT '', x FROM t"
        );
        assert_eq!(strip_string_literals("SELECT ';'"), "SELECT ''");
        assert_eq!(strip_string_literals("no quotes"), "no quotes");
    }

    #[test]
    fn test_cte_select_allowed() {
        let store = seeded_store();
        let result = execute(
            &store,
            "WITH c AS (SELECT status FROM tasks) SELECT COUNT(*) FROM c",
            &[],
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(result.rows[0][0], serde_json::json!(10));
    }

    #[test]
    fn test_vm_step_budget_fires() {
        let store = seeded_store();
        let options = QueryOptions {
            max_vm_steps: 1,
            ..Default::default()
        };
        // A cross join is comfortably past one VM step.
        let err = execute(
            &store,
            "SELECT COUNT(*) FROM tasks a, tasks b, tasks c, tasks d",
            &[],
            &options,
        )
        .unwrap_err();
        match err {
            Error::QueryLimit { kind } => assert_eq!(kind, DeadlineKind::VmSteps),
            other => panic!("expected query limit, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_semicolon_tolerated() {
        let store = seeded_store();
        let result = execute(
            &store,
            "SELECT COUNT(*) FROM tasks;",
            &[],
            &QueryOptions::default(),
        )
        .unwrap();
        assert_eq!(result.rows.len(), 1);
    }
}
