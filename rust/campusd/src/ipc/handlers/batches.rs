use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn department_code_exists(conn: &Connection, code: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM departments WHERE code = ?", [code], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn batches_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, year, department, semester, program, display_name, created_at
             FROM batches
             ORDER BY year, display_name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let batches = stmt
        .query_map([], |r| {
            let year: String = r.get(1)?;
            let display_name: String = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "year": year.clone(),
                "department": r.get::<_, String>(2)?,
                "semester": r.get::<_, String>(3)?,
                "program": r.get::<_, String>(4)?,
                "displayName": display_name.clone(),
                "label": roster::batch_label(&display_name, &year),
                "createdAt": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(json!({ "batches": batches }))
}

fn batches_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let year = get_required_str(params, "year")?;
    let department = get_required_str(params, "department")?.to_uppercase();
    let semester = get_required_str(params, "semester")?;
    let program = get_required_str(params, "program")?;

    if !year.chars().all(|c| c.is_ascii_digit()) {
        return Err(HandlerErr::new("bad_params", "year must be numeric"));
    }
    if !roster::SEMESTERS.contains(&semester.as_str()) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "semester must be one of S1..S6".to_string(),
            details: Some(json!({ "semester": semester })),
        });
    }
    if program != roster::PROGRAM_REGULAR && program != roster::PROGRAM_WP {
        return Err(HandlerErr {
            code: "bad_params",
            message: "program must be Regular or WP".to_string(),
            details: Some(json!({ "program": program })),
        });
    }
    if !department_code_exists(conn, &department)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "department not found".to_string(),
            details: Some(json!({ "department": department })),
        });
    }

    let id = Uuid::new_v4().to_string();
    let display_name = roster::batch_display_name(&semester, &department, &program);
    conn.execute(
        "INSERT INTO batches(id, year, department, semester, program, display_name, created_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &year, &department, &semester, &program, &display_name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "id": id,
        "year": year.clone(),
        "department": department,
        "semester": semester,
        "program": program,
        "displayName": display_name.clone(),
        "label": roster::batch_label(&display_name, &year)
    }))
}

fn batches_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let confirmed = params.get("confirm").and_then(|v| v.as_bool()) == Some(true);
    if !confirmed {
        return Err(HandlerErr::new(
            "not_confirmed",
            "deleting a batch requires explicit confirmation",
        ));
    }

    let exists = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [&batch_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "batch not found"));
    }

    // Students are never cascaded; they keep their dangling batch_id and the
    // caller is told how many were left behind.
    let orphaned: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE batch_id = ?",
            [&batch_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    conn.execute("DELETE FROM batches WHERE id = ?", [&batch_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

    Ok(json!({ "deleted": true, "orphanedStudents": orphaned }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match batches_list(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match batches_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match batches_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.list" => Some(handle_list(state, req)),
        "batches.create" => Some(handle_create(state, req)),
        "batches.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
