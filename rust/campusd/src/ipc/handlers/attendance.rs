use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const STATUS_PRESENT: &str = "present";
const STATUS_ABSENT: &str = "absent";
const DEFAULT_HOURS_PER_DAY: i64 = 7;

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

    fn db_query(e: impl std::fmt::Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn hours_per_day(conn: &Connection) -> i64 {
    db::settings_get_json(conn, "setup.attendance")
        .ok()
        .flatten()
        .as_ref()
        .and_then(|v| v.get("hoursPerDay"))
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_HOURS_PER_DAY)
}

fn parse_date(value: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "date must be a valid YYYY-MM-DD date".to_string(),
        details: Some(json!({ "date": value })),
    })?;
    Ok(value.to_string())
}

fn parse_hour(conn: &Connection, params: &serde_json::Value) -> Result<i64, HandlerErr> {
    let hour = params
        .get("hour")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing hour"))?;
    let max = hours_per_day(conn);
    if hour < 1 || hour > max {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("hour must be between 1 and {}", max),
            details: Some(json!({ "hour": hour })),
        });
    }
    Ok(hour)
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn attendance_sheet(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let hour = parse_hour(conn, params)?;

    let batch = roster::find_batch(conn, &batch_id)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::new("not_found", "batch not found"))?;
    if !subject_exists(conn, &subject_id)? {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }

    let members = roster::capture_roster(conn, &batch.id)
        .map_err(HandlerErr::db_query)?;

    let mut recorded: HashMap<String, String> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_uid, status FROM attendance_entries
             WHERE batch_id = ? AND subject_id = ? AND date = ? AND hour = ?",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((&batch.id, &subject_id, &date, hour), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;
    for (uid, status) in rows {
        recorded.insert(uid, status);
    }

    let students: Vec<serde_json::Value> = members
        .iter()
        .enumerate()
        .map(|(i, m)| {
            json!({
                "uid": m.uid,
                "name": m.name,
                "rollNo": i + 1,
                "status": recorded.get(&m.uid).cloned(),
            })
        })
        .collect();

    Ok(json!({
        "batchId": batch.id,
        "batchLabel": batch.label,
        "subjectId": subject_id,
        "date": date,
        "hour": hour,
        "students": students
    }))
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let date = parse_date(&get_required_str(params, "date")?)?;
    let hour = parse_hour(conn, params)?;
    let marked_by = params
        .get("markedBy")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    // Structural problems reject the whole call before anything is written.
    let mut parsed: Vec<(String, String)> = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let uid = entry
            .get("uid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("entries[{}] missing uid", i),
                details: None,
            })?;
        let status = entry
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("entries[{}] missing status", i),
                details: None,
            })?;
        if status != STATUS_PRESENT && status != STATUS_ABSENT {
            return Err(HandlerErr {
                code: "bad_params",
                message: "status must be present or absent".to_string(),
                details: Some(json!({ "uid": uid, "status": status })),
            });
        }
        parsed.push((uid, status));
    }

    let batch = roster::find_batch(conn, &batch_id)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::new("not_found", "batch not found"))?;
    if !subject_exists(conn, &subject_id)? {
        return Err(HandlerErr::new("not_found", "subject not found"));
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut marked = 0usize;
    let mut failed: Vec<serde_json::Value> = Vec::new();
    for (uid, status) in parsed {
        let member = tx
            .query_row(
                "SELECT 1 FROM students WHERE uid = ? AND batch_id = ?",
                (&uid, &batch.id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?
            .is_some();
        if !member {
            failed.push(json!({ "uid": uid, "reason": "not a member of this batch" }));
            continue;
        }
        tx.execute(
            "INSERT INTO attendance_entries(batch_id, subject_id, date, hour, student_uid,
                                            status, marked_by, marked_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
             ON CONFLICT(batch_id, subject_id, date, hour, student_uid) DO UPDATE SET
               status = excluded.status,
               marked_by = excluded.marked_by,
               marked_at = excluded.marked_at",
            (&batch.id, &subject_id, &date, hour, &uid, &status, &marked_by),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_entries" })),
        })?;
        marked += 1;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "marked": marked, "failed": failed }))
}

fn handle_attendance_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_sheet(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_mark(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.sheet" => Some(handle_attendance_sheet(state, req)),
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        _ => None,
    }
}
