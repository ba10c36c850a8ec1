//! Tool handlers: the client-facing operations over scheduler and store.

use crate::auth::{AuthAction, AuthItemId, validate_domain_granularity};
use crate::calibrate;
use crate::error::{Error, Result};
use crate::extract::nli::cosine_similarity;
use crate::extract::EmbeddingClient;
use crate::graph::types::*;
use crate::graph::views;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::types::{CancelMode, CancelScope, Priority, Target, TargetKind};
use crate::storage::readonly::{self, QueryOptions};
use crate::storage::store::Store;
use crate::tools::registry::{ToolDef, ToolHandler, ToolRegistry};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Shared state behind every tool handler.
pub struct ServerState {
    pub scheduler: Arc<Scheduler>,
    pub store: Store,
    pub embedding: Arc<dyn EmbeddingClient>,
    pub calibration_source: String,
}

/// Build the full tool registry.
pub fn build_registry(state: Arc<ServerState>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_create_task(&mut registry, state.clone());
    register_queue_targets(&mut registry, state.clone());
    register_queue_reference_candidates(&mut registry, state.clone());
    register_get_status(&mut registry, state.clone());
    register_stop_task(&mut registry, state.clone());
    register_query_sql(&mut registry, state.clone());
    register_vector_search(&mut registry, state.clone());
    register_query_view(&mut registry, state.clone());
    register_list_views(&mut registry, state.clone());
    register_get_auth_queue(&mut registry, state.clone());
    register_resolve_auth(&mut registry, state.clone());
    register_feedback(&mut registry, state.clone());
    register_calibration_metrics(&mut registry, state.clone());
    register_calibration_rollback(&mut registry, state);
    registry
}

fn parse_task_id(params: &Value) -> Result<TaskId> {
    params
        .get("task_id")
        .and_then(Value::as_str)
        .and_then(TaskId::parse)
        .ok_or_else(|| Error::invalid_input("task_id", "a task uuid"))
}

fn handler<F>(f: F) -> ToolHandler
where
    F: Fn(Value) -> futures::future::BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
{
    Arc::new(f)
}

// ==================== Task lifecycle ====================

fn register_create_task(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "create_task",
        "Create a research task around a central hypothesis. No work starts \
         until targets are queued.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "central_hypothesis": {"type": "string"},
            "config": {
                "type": "object",
                "properties": {
                    "max_pages": {"type": "integer"},
                    "max_fragments": {"type": "integer"},
                    "max_claims": {"type": "integer"},
                    "wall_clock_secs": {"type": "integer"},
                    "priority_domains": {"type": "array", "items": {"type": "string"}}
                },
                "additionalProperties": false
            }
        },
        "required": ["central_hypothesis"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {"task_id": {"type": "string"}}
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let hypothesis = params["central_hypothesis"].as_str().unwrap_or_default();
                if hypothesis.trim().is_empty() {
                    return Err(Error::invalid_input(
                        "central_hypothesis",
                        "a non-empty string",
                    ));
                }

                let config = params.get("config");
                let defaults = TaskBudget::default();
                let budget = config.map(|c| TaskBudget {
                    max_pages: c["max_pages"].as_u64().unwrap_or(defaults.max_pages as u64) as u32,
                    max_fragments: c["max_fragments"]
                        .as_u64()
                        .unwrap_or(defaults.max_fragments as u64)
                        as u32,
                    max_claims: c["max_claims"].as_u64().unwrap_or(defaults.max_claims as u64)
                        as u32,
                    wall_clock_secs: c["wall_clock_secs"]
                        .as_u64()
                        .unwrap_or(defaults.wall_clock_secs),
                });
                let priority_domains = config
                    .and_then(|c| c["priority_domains"].as_array().cloned())
                    .map(|domains| {
                        domains
                            .iter()
                            .filter_map(|d| d.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();

                let task = state
                    .scheduler
                    .create_task(hypothesis, budget, priority_domains)?;
                Ok(json!({"task_id": task.id.to_string()}))
            })
        }),
    );
}

fn register_queue_targets(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "queue_targets",
        "Queue research targets (queries, urls or dois) for a task. \
         Idempotent per (task, kind, value).",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string"},
            "targets": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "kind": {"type": "string", "enum": ["query", "url", "doi"]},
                        "value": {"type": "string"},
                        "priority": {"type": "string", "enum": ["high", "medium", "low"]}
                    },
                    "required": ["kind", "value"],
                    "additionalProperties": false
                }
            },
            "options": {
                "type": "object",
                "properties": {"resume": {"type": "boolean"}},
                "additionalProperties": false
            }
        },
        "required": ["task_id", "targets"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "queued_count": {"type": "integer"},
            "ids": {"type": "array", "items": {"type": "string"}}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let task_id = parse_task_id(&params)?;
                let resume = params["options"]["resume"].as_bool().unwrap_or(false);

                let mut targets = Vec::new();
                for (i, raw) in params["targets"].as_array().unwrap_or(&Vec::new()).iter().enumerate() {
                    let kind = raw["kind"]
                        .as_str()
                        .and_then(TargetKind::parse)
                        .ok_or_else(|| {
                            Error::invalid_input(format!("targets[{}].kind", i), "query|url|doi")
                        })?;
                    let value = raw["value"].as_str().unwrap_or_default().trim().to_string();
                    if value.is_empty() {
                        return Err(Error::invalid_input(
                            format!("targets[{}].value", i),
                            "a non-empty string",
                        ));
                    }
                    let priority = raw["priority"]
                        .as_str()
                        .and_then(Priority::parse)
                        .unwrap_or_default();
                    targets.push(Target {
                        kind,
                        value,
                        priority,
                    });
                }

                let ids = state.scheduler.queue_targets(&task_id, &targets, resume)?;
                Ok(json!({
                    "queued_count": ids.len(),
                    "ids": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
                }))
            })
        }),
    );
}

fn register_queue_reference_candidates(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "queue_reference_candidates",
        "Queue unfetched cited pages as new targets. Requires the citation \
         chase milestone unless dry_run.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string"},
            "include_ids": {"type": "array", "items": {"type": "string"}},
            "exclude_ids": {"type": "array", "items": {"type": "string"}},
            "limit": {"type": "integer"},
            "dry_run": {"type": "boolean"}
        },
        "required": ["task_id"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "queued_count": {"type": "integer"},
            "ids": {"type": "array", "items": {"type": "string"}}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let task_id = parse_task_id(&params)?;
                let parse_ids = |key: &str| -> Option<Vec<PageId>> {
                    params[key].as_array().map(|ids| {
                        ids.iter()
                            .filter_map(|v| v.as_str().and_then(PageId::parse))
                            .collect()
                    })
                };
                let include_ids = parse_ids("include_ids");
                let exclude_ids = parse_ids("exclude_ids");
                let limit = params["limit"].as_u64().unwrap_or(20) as usize;
                let dry_run = params["dry_run"].as_bool().unwrap_or(false);

                let (queued_count, ids) = state.scheduler.queue_reference_candidates(
                    &task_id,
                    include_ids,
                    exclude_ids,
                    limit,
                    dry_run,
                )?;
                Ok(json!({
                    "queued_count": queued_count,
                    "ids": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
                }))
            })
        }),
    );
}

fn register_get_status(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "get_status",
        "Task status with progress, metrics, budget and milestones. With \
         wait > 0, long-polls until a change or the deadline.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string"},
            "wait": {"type": "integer"},
            "detail": {"type": "boolean"}
        },
        "required": ["task_id"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "status": {"type": "string"},
            "progress": {"type": "object"},
            "metrics": {"type": "object"},
            "budget": {"type": "object"},
            "milestones": {"type": "object"},
            "waiting_for": {"type": "array", "items": {"type": "string"}},
            "evidence_summary": {"type": "array"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let task_id = parse_task_id(&params)?;
                let wait = params["wait"].as_u64().unwrap_or(0);
                let detail = params["detail"].as_bool().unwrap_or(false);

                let snapshot = state.scheduler.wait_status(&task_id, wait, detail).await?;
                Ok(serde_json::to_value(snapshot)?)
            })
        }),
    );
}

fn register_stop_task(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "stop_task",
        "Stop a task. Graceful lets running jobs finish; immediate signals \
         them; full also cascades to follow-ups and auth items.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "task_id": {"type": "string"},
            "reason": {"type": "string"},
            "mode": {"type": "string", "enum": ["graceful", "immediate", "full"]},
            "scope": {"type": "string", "enum": ["all", "target_queue_only", "follow_ups_only"]}
        },
        "required": ["task_id"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {"ok": {"type": "boolean"}, "status": {"type": "string"}}
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let task_id = parse_task_id(&params)?;
                let mode = params["mode"]
                    .as_str()
                    .and_then(CancelMode::parse)
                    .unwrap_or(CancelMode::Graceful);
                let scope = params["scope"]
                    .as_str()
                    .and_then(CancelScope::parse)
                    .unwrap_or_default();
                if let Some(reason) = params["reason"].as_str() {
                    tracing::info!(task = %task_id, reason, "stop_task");
                }

                let status = state.scheduler.stop_task(&task_id, mode, scope).await?;
                Ok(json!({"ok": true, "status": status.to_string()}))
            })
        }),
    );
}

// ==================== Query surface ====================

fn register_query_sql(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "query_sql",
        "Read-only SQL over the evidence store, with wall-clock and VM-step \
         deadlines.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "sql": {"type": "string"},
            "params": {"type": "array"},
            "options": {
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "timeout_ms": {"type": "integer"},
                    "max_vm_steps": {"type": "integer"}
                },
                "additionalProperties": false
            }
        },
        "required": ["sql"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "columns": {"type": "array", "items": {"type": "string"}},
            "rows": {"type": "array"},
            "truncated": {"type": "boolean"},
            "elapsed_ms": {"type": "integer"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let sql = params["sql"].as_str().unwrap_or_default().to_string();
                let bound: Vec<Value> = params["params"].as_array().cloned().unwrap_or_default();
                let options: QueryOptions = params
                    .get("options")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();

                let result = readonly::execute(&state.store, &sql, &bound, &options)?;
                Ok(serde_json::to_value(result)?)
            })
        }),
    );
}

fn register_vector_search(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "vector_search",
        "Similarity search over stored claim or fragment embeddings.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"},
            "target": {"type": "string", "enum": ["claims", "fragments"]},
            "task_id": {"type": "string"},
            "top_k": {"type": "integer"},
            "min_similarity": {"type": "number"}
        },
        "required": ["query", "target"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "text": {"type": "string"},
                        "similarity": {"type": "number"}
                    }
                }
            },
            "total_searched": {"type": "integer"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let query = params["query"].as_str().unwrap_or_default().to_string();
                let target = params["target"].as_str().unwrap_or("claims").to_string();
                let task_id = params["task_id"].as_str().and_then(TaskId::parse);
                let top_k = params["top_k"].as_u64().unwrap_or(10) as usize;
                let min_similarity = params["min_similarity"].as_f64().unwrap_or(0.0);

                let vectors = state.embedding.embed(&[query]).await?;
                let query_vector = vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Internal("embedding service returned nothing".into()))?;

                let rows: Vec<(String, String, Vec<f32>)> = match target.as_str() {
                    "claims" => state
                        .store
                        .claim_embeddings(task_id.as_ref())?
                        .into_iter()
                        .map(|(id, text, vector)| (id.to_string(), text, vector))
                        .collect(),
                    _ => state
                        .store
                        .fragment_embeddings(task_id.as_ref())?
                        .into_iter()
                        .map(|(id, text, vector)| (id.to_string(), text, vector))
                        .collect(),
                };

                let total_searched = rows.len();
                let mut scored: Vec<(f64, String, String)> = rows
                    .into_iter()
                    .map(|(id, text, vector)| {
                        (cosine_similarity(&query_vector, &vector), id, text)
                    })
                    .filter(|(similarity, _, _)| *similarity >= min_similarity)
                    .collect();
                scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                scored.truncate(top_k);

                Ok(json!({
                    "results": scored
                        .into_iter()
                        .map(|(similarity, id, text)| json!({
                            "id": id,
                            "text": text,
                            "similarity": similarity
                        }))
                        .collect::<Vec<_>>(),
                    "total_searched": total_searched
                }))
            })
        }),
    );
}

fn register_query_view(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new("query_view", "Run a named view with bound parameters.")
        .with_input_schema(json!({
            "type": "object",
            "properties": {
                "view_name": {"type": "string"},
                "params": {"type": "object"}
            },
            "required": ["view_name"],
            "additionalProperties": false
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {"rows": {"type": "array"}}
        }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let view_name = params["view_name"].as_str().unwrap_or_default().to_string();
                let view_params: Map<String, Value> = params["params"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let rows = views::run_view(&state.store, &view_name, &view_params)?;
                Ok(json!({"rows": rows}))
            })
        }),
    );
}

fn register_list_views(registry: &mut ToolRegistry, _state: Arc<ServerState>) {
    let tool = ToolDef::new("list_views", "List registered views and their parameters.")
        .with_input_schema(json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {"views": {"type": "array"}}
        }));

    registry.register(
        tool,
        handler(move |_params| {
            Box::pin(async move { Ok(json!({"views": views::list_views()})) })
        }),
    );
}

// ==================== Auth queue ====================

fn register_get_auth_queue(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new("get_auth_queue", "List pending auth intervention items.")
        .with_input_schema(json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }))
        .with_output_schema(json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "domain": {"type": "string"},
                            "challenge_type": {"type": "string"},
                            "blocking_job_ids": {"type": "array", "items": {"type": "string"}},
                            "created_at": {"type": "string"}
                        }
                    }
                }
            }
        }));

    registry.register(
        tool,
        handler(move |_params| {
            let state = state.clone();
            Box::pin(async move {
                let items = state.scheduler.auth_queue().pending()?;
                Ok(json!({
                    "items": items
                        .iter()
                        .map(|item| json!({
                            "id": item.id.to_string(),
                            "domain": item.domain,
                            "challenge_type": item.challenge_type.to_string(),
                            "blocking_job_ids": item
                                .blocking_job_ids
                                .iter()
                                .map(|id| id.to_string())
                                .collect::<Vec<_>>(),
                            "created_at": item.created_at.to_rfc3339()
                        }))
                        .collect::<Vec<_>>()
                }))
            })
        }),
    );
}

fn register_resolve_auth(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "resolve_auth",
        "Resolve a pending auth item; solved requeues its blocked jobs.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "item_id": {"type": "string"},
            "action": {"type": "string", "enum": ["solved", "skipped"]}
        },
        "required": ["item_id", "action"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "ok": {"type": "boolean"},
            "requeued": {"type": "integer"},
            "cancelled": {"type": "integer"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let item_id = params["item_id"]
                    .as_str()
                    .and_then(AuthItemId::parse)
                    .ok_or_else(|| Error::invalid_input("item_id", "an auth item uuid"))?;
                let action = params["action"]
                    .as_str()
                    .and_then(AuthAction::parse)
                    .ok_or_else(|| Error::invalid_input("action", "solved|skipped"))?;

                let outcome = state.scheduler.resolve_auth(&item_id, action)?;
                Ok(json!({
                    "ok": true,
                    "requeued": outcome.requeued.len(),
                    "cancelled": outcome.cancelled.len()
                }))
            })
        }),
    );
}

// ==================== Feedback ====================

fn register_feedback(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "feedback",
        "Human feedback: edge corrections, claim adoption flips and domain \
         policy overrides.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": [
                    "edge_correct", "claim_reject", "claim_restore",
                    "domain_block", "domain_unblock", "domain_clear_override"
                ]
            },
            "payload": {"type": "object"}
        },
        "required": ["action", "payload"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "ok": {"type": "boolean"},
            "changed": {"type": "boolean"},
            "cancelled_jobs": {"type": "integer"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let action = params["action"].as_str().unwrap_or_default().to_string();
                let payload = &params["payload"];
                match action.as_str() {
                    "edge_correct" => {
                        let edge_id = payload["edge_id"]
                            .as_str()
                            .and_then(EdgeId::parse)
                            .ok_or_else(|| Error::invalid_input("payload.edge_id", "an edge uuid"))?;
                        let label = payload["correct_label"]
                            .as_str()
                            .and_then(Relation::parse)
                            .filter(Relation::is_nli)
                            .ok_or_else(|| {
                                Error::invalid_input(
                                    "payload.correct_label",
                                    "supports|refutes|neutral",
                                )
                            })?;
                        let changed = state.store.correct_edge(&edge_id, label)?;
                        Ok(json!({"ok": true, "changed": changed}))
                    }
                    "claim_reject" | "claim_restore" => {
                        let claim_id = payload["claim_id"]
                            .as_str()
                            .and_then(ClaimId::parse)
                            .ok_or_else(|| {
                                Error::invalid_input("payload.claim_id", "a claim uuid")
                            })?;
                        let status = if action == "claim_reject" {
                            AdoptionStatus::NotAdopted
                        } else {
                            AdoptionStatus::Adopted
                        };
                        let changed = state.store.set_adoption_status(&claim_id, status)?;
                        Ok(json!({"ok": true, "changed": changed}))
                    }
                    "domain_block" => {
                        let domain = required_domain(payload)?;
                        state.store.set_domain_policy(&domain, "blocked", payload["note"].as_str())?;
                        let cancelled = state.store.cancel_jobs_for_domain(&domain)?;
                        Ok(json!({"ok": true, "cancelled_jobs": cancelled}))
                    }
                    "domain_unblock" => {
                        let domain = required_domain(payload)?;
                        state.store.set_domain_policy(&domain, "allowed", payload["note"].as_str())?;
                        Ok(json!({"ok": true}))
                    }
                    "domain_clear_override" => {
                        let domain = required_domain(payload)?;
                        let changed = state.store.clear_domain_policy(&domain)?;
                        Ok(json!({"ok": true, "changed": changed}))
                    }
                    other => Err(Error::invalid_input("action", format!("unknown action {}", other))),
                }
            })
        }),
    );
}

fn required_domain(payload: &Value) -> Result<String> {
    let domain = payload["domain"]
        .as_str()
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    validate_domain_granularity(&domain)?;
    Ok(domain)
}

// ==================== Calibration admin ====================

fn register_calibration_metrics(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "calibration_metrics",
        "Calibration stats or evaluation history for a source tag.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {
            "query": {"type": "string", "enum": ["get_stats", "get_evaluations"]},
            "source": {"type": "string"}
        },
        "required": ["query"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "source": {"type": "string"},
            "method": {"type": "string"},
            "params": {"type": "object"},
            "corrections_recorded": {"type": "integer"},
            "evaluations": {"type": "array"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let query = params["query"].as_str().unwrap_or("get_stats");
                let source = params["source"]
                    .as_str()
                    .unwrap_or(&state.calibration_source)
                    .to_string();

                match query {
                    "get_evaluations" => {
                        let mut view_params = Map::new();
                        view_params.insert("source".to_string(), Value::from(source.clone()));
                        let rows =
                            views::run_view(&state.store, "v_calibration_history", &view_params)?;
                        Ok(json!({"source": source, "evaluations": rows}))
                    }
                    _ => {
                        let stats = calibrate::stats(&state.store, &source)?;
                        Ok(serde_json::to_value(stats)?)
                    }
                }
            })
        }),
    );
}

fn register_calibration_rollback(registry: &mut ToolRegistry, state: Arc<ServerState>) {
    let tool = ToolDef::new(
        "calibration_rollback",
        "Roll calibration parameters for a source back one step.",
    )
    .with_input_schema(json!({
        "type": "object",
        "properties": {"source": {"type": "string"}},
        "required": ["source"],
        "additionalProperties": false
    }))
    .with_output_schema(json!({
        "type": "object",
        "properties": {
            "ok": {"type": "boolean"},
            "method": {"type": "string"},
            "params": {"type": "string"}
        }
    }));

    registry.register(
        tool,
        handler(move |params| {
            let state = state.clone();
            Box::pin(async move {
                let source = params["source"].as_str().unwrap_or_default();
                match state.store.rollback_calibration(source)? {
                    Some((method, rolled_params)) => Ok(json!({
                        "ok": true,
                        "method": method,
                        "params": rolled_params
                    })),
                    None => Ok(json!({"ok": false})),
                }
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Calibration;
    use crate::config::{ExtractionConfig, RetryPolicy, SerpConfig, WorkerConfig};
    use crate::extract::{
        FragmentClaimExtractor, LlmExtractor, NliClassifier, NliJudgement,
    };
    use crate::search::academic::{AcademicClient, PaperRecord};
    use crate::search::fetch::{FetchOutcome, FetchedPage, PageFetcher};
    use crate::search::serp::{EngineBreaker, SerpClient, SerpResult};
    use crate::search::SearchPipeline;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::Semaphore;

    struct StubAcademic;

    #[async_trait]
    impl AcademicClient for StubAcademic {
        async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
            Ok(Some(PaperRecord {
                title: Some("Paper".to_string()),
                doi: Some(doi.to_string()),
                abstract_text: Some("Findings were observed.".to_string()),
                source: SourceApi::SemanticScholar,
                ..Default::default()
            }))
        }
        async fn search(&self, _q: &str, _l: usize) -> Result<Vec<PaperRecord>> {
            Ok(Vec::new())
        }
        async fn references(&self, _d: &str) -> Result<Vec<PaperRecord>> {
            Ok(Vec::new())
        }
        async fn doi_for_external_id(&self, _s: &str, _i: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn source(&self) -> SourceApi {
            SourceApi::SemanticScholar
        }
    }

    struct StubSerp;

    #[async_trait]
    impl SerpClient for StubSerp {
        async fn search(&self, _q: &str, _e: &str, _p: u32) -> Result<Vec<SerpResult>> {
            Ok(Vec::new())
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
            Ok(FetchOutcome::Content(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                content: "<html>".to_string(),
                content_type: None,
            }))
        }
    }

    struct StubLlm;

    #[async_trait]
    impl LlmExtractor for StubLlm {
        async fn extract_fragments(&self, _u: &str, _c: &str, _f: Option<&str>) -> Result<String> {
            Ok(r#"{"fragments": []}"#.to_string())
        }
        async fn extract_claims(&self, _t: &str, _h: &str, _f: Option<&str>) -> Result<String> {
            Ok(r#"{"claims": [{"text": "It works", "type": "factual"}]}"#.to_string())
        }
    }

    struct StubNli;

    #[async_trait]
    impl NliClassifier for StubNli {
        async fn classify(&self, _p: &str, _h: &str) -> Result<NliJudgement> {
            Ok(NliJudgement {
                label: Relation::Supports,
                score: 0.9,
            })
        }
    }

    struct StubEmbedding;

    #[async_trait]
    impl EmbeddingClient for StubEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn registry() -> (ToolRegistry, Store) {
        let store = Store::in_memory().unwrap();
        let academic: Arc<dyn AcademicClient> = Arc::new(StubAcademic);
        let nli: Arc<dyn NliClassifier> = Arc::new(StubNli);
        let embedding: Arc<dyn EmbeddingClient> = Arc::new(StubEmbedding);

        let extractor = Arc::new(FragmentClaimExtractor::new(
            store.clone(),
            Arc::new(StubLlm),
            nli.clone(),
            embedding.clone(),
            Calibration::Identity,
            ExtractionConfig::default(),
        ));
        let pipeline = Arc::new(SearchPipeline::new(
            store.clone(),
            academic.clone(),
            Arc::new(StubSerp),
            Arc::new(StubFetcher),
            extractor,
            Arc::new(Semaphore::new(1)),
            Arc::new(EngineBreaker::new(3)),
            SerpConfig::default(),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            pipeline,
            academic,
            nli,
            Calibration::Identity,
            ExtractionConfig::default(),
            WorkerConfig::default(),
            RetryPolicy::default(),
        );

        let state = Arc::new(ServerState {
            scheduler,
            store: store.clone(),
            embedding,
            calibration_source: "default".to_string(),
        });
        (build_registry(state), store)
    }

    #[tokio::test]
    async fn test_all_tools_registered() {
        let (registry, _store) = registry();
        let names = registry.tool_names();
        for expected in [
            "create_task",
            "queue_targets",
            "queue_reference_candidates",
            "get_status",
            "stop_task",
            "query_sql",
            "vector_search",
            "query_view",
            "list_views",
            "get_auth_queue",
            "resolve_auth",
            "feedback",
            "calibration_metrics",
            "calibration_rollback",
        ] {
            assert!(names.contains(&expected), "missing tool {}", expected);
        }
        assert_eq!(registry.count(), 14);
    }

    #[tokio::test]
    async fn test_create_then_queue_then_status() {
        let (registry, _store) = registry();

        let created = registry
            .execute(
                "create_task",
                json!({"central_hypothesis": "it works", "config": {"max_pages": 5}}),
            )
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap().to_string();

        let queued = registry
            .execute(
                "queue_targets",
                json!({
                    "task_id": task_id,
                    "targets": [{"kind": "doi", "value": "10.1/x"}]
                }),
            )
            .await
            .unwrap();
        assert_eq!(queued["queued_count"], json!(1));

        let status = registry
            .execute("get_status", json!({"task_id": task_id, "wait": 0}))
            .await
            .unwrap();
        assert_eq!(status["status"], json!("exploring"));
        assert!(status["milestones"]["target_queue_drained"] == json!(false));
    }

    #[tokio::test]
    async fn test_invalid_target_kind_rejected_by_schema() {
        let (registry, _store) = registry();
        let created = registry
            .execute("create_task", json!({"central_hypothesis": "h"}))
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap();

        let err = registry
            .execute(
                "queue_targets",
                json!({
                    "task_id": task_id,
                    "targets": [{"kind": "isbn", "value": "x"}]
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_query_sql_read_only() {
        let (registry, _store) = registry();
        let result = registry
            .execute("query_sql", json!({"sql": "SELECT COUNT(*) AS n FROM tasks"}))
            .await
            .unwrap();
        assert_eq!(result["columns"], json!(["n"]));

        let err = registry
            .execute("query_sql", json!({"sql": "DELETE FROM tasks"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_list_and_query_views() {
        let (registry, _store) = registry();
        let views = registry.execute("list_views", json!({})).await.unwrap();
        assert!(views["views"].as_array().unwrap().len() >= 20);

        let created = registry
            .execute("create_task", json!({"central_hypothesis": "h"}))
            .await
            .unwrap();
        let rows = registry
            .execute(
                "query_view",
                json!({
                    "view_name": "v_claim_evidence_summary",
                    "params": {"task_id": created["task_id"]}
                }),
            )
            .await
            .unwrap();
        assert_eq!(rows["rows"], json!([]));
    }

    #[tokio::test]
    async fn test_feedback_claim_flip() {
        let (registry, store) = registry();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let claim = Claim::new(task.id.clone(), "c", ClaimType::Factual);
        store.insert_claim(&claim).unwrap();

        let rejected = registry
            .execute(
                "feedback",
                json!({
                    "action": "claim_reject",
                    "payload": {"claim_id": claim.id.to_string()}
                }),
            )
            .await
            .unwrap();
        assert_eq!(rejected["ok"], json!(true));
        assert_eq!(
            store.get_claim(&claim.id).unwrap().unwrap().adoption_status,
            AdoptionStatus::NotAdopted
        );

        registry
            .execute(
                "feedback",
                json!({
                    "action": "claim_restore",
                    "payload": {"claim_id": claim.id.to_string()}
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            store.get_claim(&claim.id).unwrap().unwrap().adoption_status,
            AdoptionStatus::Adopted
        );
    }

    #[tokio::test]
    async fn test_feedback_edge_correct_noop_and_change() {
        let (registry, store) = registry();
        let frag = FragmentId::new();
        let claim = ClaimId::new();
        let edge_id = store
            .upsert_nli_edge(&Edge::nli(&frag, &claim, Relation::Supports, 0.9))
            .unwrap();

        // Same label: no-op, no corrections row.
        let noop = registry
            .execute(
                "feedback",
                json!({
                    "action": "edge_correct",
                    "payload": {"edge_id": edge_id.to_string(), "correct_label": "supports"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(noop["changed"], json!(false));
        assert_eq!(store.corrections_count().unwrap(), 0);

        let changed = registry
            .execute(
                "feedback",
                json!({
                    "action": "edge_correct",
                    "payload": {"edge_id": edge_id.to_string(), "correct_label": "refutes"}
                }),
            )
            .await
            .unwrap();
        assert_eq!(changed["changed"], json!(true));
        assert_eq!(store.corrections_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_feedback_domain_block_rejects_tld() {
        let (registry, _store) = registry();
        let err = registry
            .execute(
                "feedback",
                json!({"action": "domain_block", "payload": {"domain": "com"}}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_vector_search_over_claims() {
        let (registry, store) = registry();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let claim = Claim::new(task.id.clone(), "aligned claim", ClaimType::Factual);
        store.insert_claim(&claim).unwrap();
        store.set_claim_embedding(&claim.id, &[1.0, 0.0]).unwrap();

        let result = registry
            .execute(
                "vector_search",
                json!({
                    "query": "anything",
                    "target": "claims",
                    "task_id": task.id.to_string(),
                    "top_k": 5
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["total_searched"], json!(1));
        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0]["similarity"].as_f64().unwrap() > 0.99);
    }

    #[tokio::test]
    async fn test_calibration_tools() {
        let (registry, store) = registry();
        store
            .set_calibration_params("nli-v1", "platt", r#"{"a":1.1,"b":0.0}"#, None)
            .unwrap();
        store
            .set_calibration_params("nli-v1", "temperature", r#"{"t":1.4}"#, None)
            .unwrap();

        let stats = registry
            .execute(
                "calibration_metrics",
                json!({"query": "get_stats", "source": "nli-v1"}),
            )
            .await
            .unwrap();
        assert_eq!(stats["method"], json!("temperature"));

        let rolled = registry
            .execute("calibration_rollback", json!({"source": "nli-v1"}))
            .await
            .unwrap();
        assert_eq!(rolled["ok"], json!(true));
        assert_eq!(rolled["method"], json!("platt"));
    }
}
