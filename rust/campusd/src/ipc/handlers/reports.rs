use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn institution_name(conn: &Connection) -> String {
    db::settings_get_json(conn, "setup.general")
        .ok()
        .flatten()
        .as_ref()
        .and_then(|v| v.get("institutionName"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn department_line(conn: &Connection, code: &str) -> rusqlite::Result<String> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM departments WHERE code = ?", [code], |r| {
            r.get(0)
        })
        .optional()?;
    Ok(format!("Department of {}", name.as_deref().unwrap_or(code)))
}

struct RosterDetails {
    reg_no: Option<String>,
    student_type: String,
    phone: Option<String>,
    blood_group: Option<String>,
}

fn handle_roster_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let batch = match roster::find_batch(conn, &batch_id) {
        Ok(Some(b)) => b,
        Ok(None) => return err(&req.id, "not_found", "batch not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let department_code: String = match conn.query_row(
        "SELECT department FROM batches WHERE id = ?",
        [&batch.id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let dept_line = match department_line(conn, &department_code) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Ordering comes from the roster; the detail columns are joined in by uid.
    let members = match roster::capture_roster(conn, &batch.id) {
        Ok(m) => m,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut details: HashMap<String, RosterDetails> = HashMap::new();
    {
        let mut stmt = match conn.prepare(
            "SELECT uid, reg_no, student_type, phone, blood_group
             FROM students WHERE batch_id = ?",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([&batch.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    RosterDetails {
                        reg_no: r.get(1)?,
                        student_type: r.get(2)?,
                        phone: r.get(3)?,
                        blood_group: r.get(4)?,
                    },
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(list) => {
                for (uid, d) in list {
                    details.insert(uid, d);
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let rows: Vec<serde_json::Value> = members
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let d = details.get(&m.uid);
            let category = match d.map(|d| d.student_type.as_str()) {
                Some(roster::STUDENT_TYPE_LET) => "Lat. Entry",
                _ => "Regular",
            };
            let cell = |v: Option<&str>| v.filter(|s| !s.is_empty()).unwrap_or("-").to_string();
            json!({
                "rollNo": i + 1,
                "regNo": cell(d.and_then(|d| d.reg_no.as_deref())),
                "name": m.name.to_uppercase(),
                "category": category,
                "phone": cell(d.and_then(|d| d.phone.as_deref())),
                "bloodGroup": cell(d.and_then(|d| d.blood_group.as_deref())),
            })
        })
        .collect();

    let generated_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    ok(
        &req.id,
        json!({
            "header": {
                "institution": institution_name(conn),
                "departmentLine": dept_line,
                "batchLabel": batch.label,
                "generatedAt": generated_at,
            },
            "columns": ["Roll No", "Reg No", "Name", "Category", "Phone", "Blood Group"],
            "rows": rows
        }),
    )
}

fn handle_stats_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let count = |table: &str| -> rusqlite::Result<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
    };
    let students = match count("students") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let faculty = match count("faculty") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let batches = match count("batches") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let departments = match count("departments") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "students": students,
            "faculty": faculty,
            "batches": batches,
            "departments": departments
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.rosterModel" => Some(handle_roster_model(state, req)),
        "stats.overview" => Some(handle_stats_overview(state, req)),
        _ => None,
    }
}
