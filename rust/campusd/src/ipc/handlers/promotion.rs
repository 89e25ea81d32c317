use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster::{self, RevalidationPolicy};
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn promotion_preview(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // A blank source is an intentionally empty roster, not an error, and it
    // never touches the store.
    let Some(source_id) = opt_str(params, "sourceBatchId") else {
        return Ok(json!({
            "sourceBatchId": serde_json::Value::Null,
            "sourceLabel": serde_json::Value::Null,
            "matched": 0,
            "students": []
        }));
    };

    let source = roster::find_batch(conn, &source_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let Some(source) = source else {
        // Indistinguishable from an existing batch with no students: the
        // operator sees zero matches either way.
        return Ok(json!({
            "sourceBatchId": source_id,
            "sourceLabel": serde_json::Value::Null,
            "matched": 0,
            "students": []
        }));
    };

    let members = roster::capture_roster(conn, &source.id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students: Vec<serde_json::Value> = members
        .iter()
        .map(|m| json!({ "uid": m.uid, "name": m.name }))
        .collect();
    Ok(json!({
        "sourceBatchId": source.id,
        "sourceLabel": source.label,
        "matched": members.len(),
        "students": students
    }))
}

fn promotion_commit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // Refusals are ordered; every one of them happens before any write.
    let confirmed = params.get("confirm").and_then(|v| v.as_bool()) == Some(true);
    if !confirmed {
        return Err(HandlerErr::new(
            "not_confirmed",
            "promotion requires explicit confirmation",
        ));
    }

    let Some(target_id) = opt_str(params, "targetBatchId") else {
        return Err(HandlerErr::new("bad_params", "missing targetBatchId"));
    };
    let Some(source_id) = opt_str(params, "sourceBatchId") else {
        return Err(HandlerErr::new("bad_params", "missing sourceBatchId"));
    };

    let target = roster::find_batch(conn, &target_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "target batch not found"))?;

    if source_id == target.id {
        // Accepted and observably a no-op.
        return Ok(json!({
            "promoted": 0,
            "noOp": true,
            "sourceBatchId": source_id,
            "targetBatchId": target.id,
            "targetLabel": target.label
        }));
    }

    let policy = roster::load_revalidation_policy(conn);
    let expected_count = params.get("expectedCount").and_then(|v| v.as_u64());
    if policy == RevalidationPolicy::Strict && expected_count.is_none() {
        return Err(HandlerErr::new(
            "bad_params",
            "missing expectedCount (revalidation policy is strict)",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Snapshot the cohort once; the write below targets exactly this list,
    // never a re-query.
    let members = roster::capture_roster(&tx, &source_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if members.is_empty() {
        return Err(HandlerErr::new(
            "nothing_to_promote",
            "source batch has no students",
        ));
    }

    if policy == RevalidationPolicy::Strict {
        let expected = expected_count.unwrap_or(0) as usize;
        if expected != members.len() {
            return Err(HandlerErr {
                code: "roster_changed",
                message: "roster changed since confirmation".to_string(),
                details: Some(json!({
                    "expectedCount": expected,
                    "actualCount": members.len()
                })),
            });
        }
    }

    let uids: Vec<String> = members.iter().map(|m| m.uid.clone()).collect();
    let promoted = roster::apply_reassignment(&tx, &uids, &target.id, &target.label)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "promoted": promoted,
        "sourceBatchId": source_id,
        "targetBatchId": target.id,
        "targetLabel": target.label
    }))
}

fn handle_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match promotion_preview(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_commit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match promotion_commit(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotion.preview" => Some(handle_preview(state, req)),
        "promotion.commit" => Some(handle_commit(state, req)),
        _ => None,
    }
}
