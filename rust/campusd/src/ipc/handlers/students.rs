use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::roster;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::auth;

const BLOOD_GROUPS: [&str; 8] = ["A+", "A-", "B+", "B-", "AB+", "AB-", "O+", "O-"];

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

/// Absent and null both mean "not provided"; a present empty string clears
/// the field.
fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

fn validate_student_type(value: &str) -> Result<(), HandlerErr> {
    if value != roster::STUDENT_TYPE_REGULAR && value != roster::STUDENT_TYPE_LET {
        return Err(HandlerErr {
            code: "bad_params",
            message: "studentType must be Regular or LET".to_string(),
            details: Some(json!({ "studentType": value })),
        });
    }
    Ok(())
}

fn validate_dob(value: &str) -> Result<(), HandlerErr> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "bad_params",
        message: "dob must be a valid YYYY-MM-DD date".to_string(),
        details: Some(json!({ "dob": value })),
    })?;
    Ok(())
}

fn validate_blood_group(value: &str) -> Result<(), HandlerErr> {
    if !BLOOD_GROUPS.contains(&value) {
        return Err(HandlerErr {
            code: "bad_params",
            message: "bloodGroup is not a recognized group".to_string(),
            details: Some(json!({ "bloodGroup": value })),
        });
    }
    Ok(())
}

fn email_taken(conn: &Connection, email: &str, exclude_uid: Option<&str>) -> Result<bool, HandlerErr> {
    let found: Option<i64> = match exclude_uid {
        Some(uid) => conn
            .query_row(
                "SELECT 1 FROM accounts WHERE email = ? AND uid != ?",
                (email, uid),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db_query)?,
        None => conn
            .query_row("SELECT 1 FROM accounts WHERE email = ?", [email], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db_query)?,
    };
    Ok(found.is_some())
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let batch_id = get_required_str(params, "batchId")?;
    let mut stmt = conn
        .prepare(
            "SELECT uid, name, email, reg_no, batch_id, batch_label, student_type,
                    phone, dob, blood_group, created_at, updated_at
             FROM students
             WHERE batch_id = ?",
        )
        .map_err(HandlerErr::db_query)?;

    struct Row {
        json: serde_json::Value,
        name: String,
        student_type: String,
    }

    let mut rows = stmt
        .query_map([&batch_id], |r| {
            let name: String = r.get(1)?;
            let student_type: String = r.get(6)?;
            Ok(Row {
                json: json!({
                    "uid": r.get::<_, String>(0)?,
                    "name": name.clone(),
                    "email": r.get::<_, String>(2)?,
                    "regNo": r.get::<_, Option<String>>(3)?,
                    "batchId": r.get::<_, String>(4)?,
                    "batchLabel": r.get::<_, String>(5)?,
                    "studentType": student_type.clone(),
                    "phone": r.get::<_, Option<String>>(7)?,
                    "dob": r.get::<_, Option<String>>(8)?,
                    "bloodGroup": r.get::<_, Option<String>>(9)?,
                    "createdAt": r.get::<_, String>(10)?,
                    "updatedAt": r.get::<_, Option<String>>(11)?,
                }),
                name,
                student_type,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    // Same ordering the roster uses for roll numbers.
    rows.sort_by(|a, b| {
        let ra = if a.student_type == roster::STUDENT_TYPE_LET { 1 } else { 0 };
        let rb = if b.student_type == roster::STUDENT_TYPE_LET { 1 } else { 0 };
        ra.cmp(&rb)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    let students: Vec<serde_json::Value> = rows.into_iter().map(|r| r.json).collect();
    Ok(json!({ "students": students }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?;
    let batch_id = get_required_str(params, "batchId")?;
    let student_type = get_optional_str(params, "studentType")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| roster::STUDENT_TYPE_REGULAR.to_string());
    let reg_no = get_optional_str(params, "regNo").filter(|s| !s.is_empty());
    let phone = get_optional_str(params, "phone").filter(|s| !s.is_empty());
    let dob = get_optional_str(params, "dob").filter(|s| !s.is_empty());
    let blood_group = get_optional_str(params, "bloodGroup").filter(|s| !s.is_empty());

    validate_student_type(&student_type)?;
    if let Some(d) = dob.as_deref() {
        validate_dob(d)?;
    }
    if let Some(bg) = blood_group.as_deref() {
        validate_blood_group(bg)?;
    }

    let batch = roster::find_batch(conn, &batch_id)
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::new("not_found", "batch not found"))?;

    if email_taken(conn, &email, None)? {
        return Err(HandlerErr {
            code: "email_taken",
            message: "an account with this email already exists".to_string(),
            details: Some(json!({ "email": email })),
        });
    }

    // Same sequence the admin console runs: create the login, set the role
    // claim, then write the profile keyed by the new uid.
    let uid = Uuid::new_v4().to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO accounts(uid, email, display_name, claim_role, created_at)
         VALUES(?, ?, ?, 'student', strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&uid, &email, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO students(uid, name, email, reg_no, batch_id, batch_label, student_type,
                              phone, dob, blood_group, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &uid,
            &name,
            &email,
            &reg_no,
            &batch.id,
            &batch.label,
            &student_type,
            &phone,
            &dob,
            &blood_group,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let profile = auth::student_profile_json(conn, &uid)
        .map_err(HandlerErr::db_query)?
        .unwrap_or(serde_json::Value::Null);
    Ok(json!({ "uid": uid, "student": profile }))
}

struct StudentRow {
    name: String,
    email: String,
    reg_no: Option<String>,
    batch_id: String,
    batch_label: String,
    student_type: String,
    phone: Option<String>,
    dob: Option<String>,
    blood_group: Option<String>,
}

fn load_student(conn: &Connection, uid: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        "SELECT name, email, reg_no, batch_id, batch_label, student_type, phone, dob, blood_group
         FROM students WHERE uid = ?",
        [uid],
        |r| {
            Ok(StudentRow {
                name: r.get(0)?,
                email: r.get(1)?,
                reg_no: r.get(2)?,
                batch_id: r.get(3)?,
                batch_label: r.get(4)?,
                student_type: r.get(5)?,
                phone: r.get(6)?,
                dob: r.get(7)?,
                blood_group: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::db_query)
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = get_required_str(params, "uid")?;
    let mut row = load_student(conn, &uid)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    if let Some(name) = get_optional_str(params, "name") {
        if name.is_empty() {
            return Err(HandlerErr::new("bad_params", "name must not be empty"));
        }
        row.name = name;
    }
    if let Some(st) = get_optional_str(params, "studentType") {
        validate_student_type(&st)?;
        row.student_type = st;
    }
    if let Some(reg_no) = get_optional_str(params, "regNo") {
        row.reg_no = if reg_no.is_empty() { None } else { Some(reg_no) };
    }
    if let Some(phone) = get_optional_str(params, "phone") {
        row.phone = if phone.is_empty() { None } else { Some(phone) };
    }
    if let Some(dob) = get_optional_str(params, "dob") {
        if dob.is_empty() {
            row.dob = None;
        } else {
            validate_dob(&dob)?;
            row.dob = Some(dob);
        }
    }
    if let Some(bg) = get_optional_str(params, "bloodGroup") {
        if bg.is_empty() {
            row.blood_group = None;
        } else {
            validate_blood_group(&bg)?;
            row.blood_group = Some(bg);
        }
    }

    // A batch move re-checks the reference and refreshes the denormalized
    // label in the same write.
    if let Some(batch_id) = get_optional_str(params, "batchId") {
        if batch_id.is_empty() {
            return Err(HandlerErr::new("bad_params", "batchId must not be empty"));
        }
        let batch = roster::find_batch(conn, &batch_id)
            .map_err(HandlerErr::db_query)?
            .ok_or_else(|| HandlerErr::new("not_found", "batch not found"))?;
        row.batch_id = batch.id;
        row.batch_label = batch.label;
    }

    let email_changed = match get_optional_str(params, "email") {
        Some(email) if !email.is_empty() && email != row.email => {
            if email_taken(conn, &email, Some(&uid))? {
                return Err(HandlerErr {
                    code: "email_taken",
                    message: "an account with this email already exists".to_string(),
                    details: Some(json!({ "email": email })),
                });
            }
            row.email = email;
            true
        }
        _ => false,
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    if email_changed {
        tx.execute(
            "UPDATE accounts SET email = ? WHERE uid = ?",
            (&row.email, &uid),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    }
    tx.execute(
        "UPDATE students
         SET name = ?, email = ?, reg_no = ?, batch_id = ?, batch_label = ?,
             student_type = ?, phone = ?, dob = ?, blood_group = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE uid = ?",
        (
            &row.name,
            &row.email,
            &row.reg_no,
            &row.batch_id,
            &row.batch_label,
            &row.student_type,
            &row.phone,
            &row.dob,
            &row.blood_group,
            &uid,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    let profile = auth::student_profile_json(conn, &uid)
        .map_err(HandlerErr::db_query)?
        .unwrap_or(serde_json::Value::Null);
    Ok(json!({ "student": profile }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let uid = get_required_str(params, "uid")?;
    let exists = conn
        .query_row("SELECT 1 FROM students WHERE uid = ?", [&uid], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db_query)?
        .is_some();
    if !exists {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    // Profile only. The login account stays and resolves as unauthorized
    // until an admin re-provisions it.
    conn.execute("DELETE FROM students WHERE uid = ?", [&uid])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    Ok(json!({ "deleted": true, "accountRetained": true }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_delete(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
