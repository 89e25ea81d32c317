use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::auth;

const DEFAULT_DESIGNATION: &str = "Lecturer";

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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

fn department_code_exists(conn: &Connection, code: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM departments WHERE code = ?", [code], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db_query)
}

fn faculty_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let department = get_optional_str(params, "department")
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase());

    let mut rows: Vec<serde_json::Value> = Vec::new();
    match department {
        Some(code) => {
            let mut stmt = conn
                .prepare(
                    "SELECT uid, name, email, department, phone, designation, created_at, updated_at
                     FROM faculty WHERE department = ? ORDER BY name",
                )
                .map_err(HandlerErr::db_query)?;
            let it = stmt
                .query_map([&code], faculty_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            rows.extend(it);
        }
        None => {
            let mut stmt = conn
                .prepare(
                    "SELECT uid, name, email, department, phone, designation, created_at, updated_at
                     FROM faculty ORDER BY name",
                )
                .map_err(HandlerErr::db_query)?;
            let it = stmt
                .query_map([], faculty_row_json)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::db_query)?;
            rows.extend(it);
        }
    }
    Ok(json!({ "faculty": rows }))
}

fn faculty_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "uid": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "department": r.get::<_, String>(3)?,
        "phone": r.get::<_, Option<String>>(4)?,
        "designation": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, Option<String>>(7)?,
    }))
}

fn faculty_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let department = get_required_str(params, "department")?.to_uppercase();
    let phone = get_optional_str(params, "phone").filter(|s| !s.is_empty());
    let designation = get_optional_str(params, "designation")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_DESIGNATION.to_string());

    if !department_code_exists(conn, &department)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "department not found".to_string(),
            details: Some(json!({ "department": department })),
        });
    }
    let taken = conn
        .query_row("SELECT 1 FROM accounts WHERE email = ?", [&email], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if taken {
        return Err(HandlerErr {
            code: "email_taken",
            message: "an account with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    let uid = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO accounts(uid, email, display_name, claim_role, created_at)
         VALUES(?, ?, ?, 'faculty', strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&uid, &email, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO faculty(uid, name, email, department, phone, designation, created_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&uid, &name, &email, &department, &phone, &designation),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let profile = auth::faculty_profile_json(conn, &uid)
        .map_err(HandlerErr::db_query)?
        .unwrap_or(serde_json::Value::Null);
    Ok(json!({ "uid": uid, "faculty": profile }))
}

fn faculty_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = get_required_str(params, "uid")?;
    let current = conn
        .query_row(
            "SELECT name, email, department, phone, designation FROM faculty WHERE uid = ?",
            [&uid],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    let (mut name, mut email, mut department, mut phone, mut designation) =
        current.ok_or_else(|| HandlerErr::new("not_found", "faculty member not found"))?;

    if let Some(v) = get_optional_str(params, "name") {
        if v.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        name = v;
    }
    if let Some(v) = get_optional_str(params, "department") {
        let code = v.to_uppercase();
        if !department_code_exists(conn, &code)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "department not found".to_string(),
                details: Some(json!({ "department": code })),
            });
        }
        department = code;
    }
    if let Some(v) = get_optional_str(params, "phone") {
        phone = if v.is_empty() { None } else { Some(v) };
    }
    if let Some(v) = get_optional_str(params, "designation") {
        if !v.is_empty() {
            designation = v;
        }
    }

    let email_changed = match get_optional_str(params, "email") {
        Some(v) if !v.is_empty() && v != email => {
            let taken = conn
                .query_row(
                    "SELECT 1 FROM accounts WHERE email = ? AND uid != ?",
                    (&v, &uid),
                    |r| r.get::<_, i64>(0),
                )
                .optional()
                .map_err(HandlerErr::db_query)?
                .is_some();
            if taken {
                return Err(HandlerErr {
                    code: "email_taken",
                    message: "an account with this email already exists".to_string(),
                    details: Some(json!({ "email": v })),
                });
            }
            email = v;
            true
        }
        _ => false,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if email_changed {
        tx.execute("UPDATE accounts SET email = ? WHERE uid = ?", (&email, &uid))
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.execute(
        "UPDATE faculty
         SET name = ?, email = ?, department = ?, phone = ?, designation = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE uid = ?",
        (&name, &email, &department, &phone, &designation, &uid),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let profile = auth::faculty_profile_json(conn, &uid)
        .map_err(HandlerErr::db_query)?
        .unwrap_or(serde_json::Value::Null);
    Ok(json!({ "faculty": profile }))
}

fn faculty_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = get_required_str(params, "uid")?;
    let exists = conn
        .query_row("SELECT 1 FROM faculty WHERE uid = ?", [&uid], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "faculty member not found"));
    }
    conn.execute("DELETE FROM faculty WHERE uid = ?", [&uid])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    Ok(json!({ "deleted": true, "accountRetained": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match faculty_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match faculty_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match faculty_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match faculty_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "faculty.list" => Some(handle_list(state, req)),
        "faculty.create" => Some(handle_create(state, req)),
        "faculty.update" => Some(handle_update(state, req)),
        "faculty.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
