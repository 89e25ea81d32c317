use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Portal role, resolved once when a session starts. The claim on the
/// account is the fast path; accounts without one (admins are seeded
/// without claims) fall back to the profile probe chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Faculty,
    Student,
    Unauthorized,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Faculty => "faculty",
            Role::Student => "student",
            Role::Unauthorized => "unauthorized",
        }
    }

    fn from_claim(claim: &str) -> Option<Role> {
        match claim {
            "student" => Some(Role::Student),
            "faculty" => Some(Role::Faculty),
            _ => None,
        }
    }
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn query_err(req: &Request, e: impl std::fmt::Display) -> serde_json::Value {
    err(&req.id, "db_query_failed", e.to_string(), None)
}

pub fn student_profile_json(
    conn: &Connection,
    uid: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT uid, name, email, reg_no, batch_id, batch_label, student_type,
                phone, dob, blood_group, created_at, updated_at
         FROM students WHERE uid = ?",
        [uid],
        |r| {
            Ok(json!({
                "uid": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "regNo": r.get::<_, Option<String>>(3)?,
                "batchId": r.get::<_, String>(4)?,
                "batchLabel": r.get::<_, String>(5)?,
                "studentType": r.get::<_, String>(6)?,
                "phone": r.get::<_, Option<String>>(7)?,
                "dob": r.get::<_, Option<String>>(8)?,
                "bloodGroup": r.get::<_, Option<String>>(9)?,
                "createdAt": r.get::<_, String>(10)?,
                "updatedAt": r.get::<_, Option<String>>(11)?,
            }))
        },
    )
    .optional()
}

pub fn faculty_profile_json(
    conn: &Connection,
    uid: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT uid, name, email, department, phone, designation, created_at, updated_at
         FROM faculty WHERE uid = ?",
        [uid],
        |r| {
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
        },
    )
    .optional()
}

fn admin_user_json(conn: &Connection, uid: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT uid, name, email, role, created_at
         FROM users WHERE uid = ? AND role = 'admin'",
        [uid],
        |r| {
            Ok(json!({
                "uid": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        },
    )
    .optional()
}

fn resolve_role(conn: &Connection, uid: &str) -> rusqlite::Result<(Role, serde_json::Value)> {
    let claim: Option<Option<String>> = conn
        .query_row("SELECT claim_role FROM accounts WHERE uid = ?", [uid], |r| {
            r.get(0)
        })
        .optional()?;
    if let Some(Some(claim)) = claim {
        if let Some(role) = Role::from_claim(&claim) {
            let profile = match role {
                Role::Student => student_profile_json(conn, uid)?,
                Role::Faculty => faculty_profile_json(conn, uid)?,
                _ => None,
            };
            // A claim whose profile was deleted is stale; fall through to
            // the probe chain instead of trusting it.
            if let Some(profile) = profile {
                return Ok((role, profile));
            }
        }
    }

    // Probe order matters: student, then faculty, then the admin directory.
    if let Some(profile) = student_profile_json(conn, uid)? {
        return Ok((Role::Student, profile));
    }
    if let Some(profile) = faculty_profile_json(conn, uid)? {
        return Ok((Role::Faculty, profile));
    }
    if let Some(profile) = admin_user_json(conn, uid)? {
        return Ok((Role::Admin, profile));
    }
    Ok((Role::Unauthorized, serde_json::Value::Null))
}

fn handle_resolve_role(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let uid = match required_str(req, "uid") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match resolve_role(conn, &uid) {
        Ok((role, profile)) => ok(
            &req.id,
            json!({ "role": role.as_str(), "profile": profile }),
        ),
        Err(e) => query_err(req, e),
    }
}

fn handle_admins_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let taken = match conn
        .query_row("SELECT 1 FROM accounts WHERE email = ?", [&email], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return query_err(req, e),
    };
    if taken {
        return err(
            &req.id,
            "email_taken",
            "an account with this email already exists",
            Some(json!({ "email": email })),
        );
    }

    let uid = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // No claim on purpose: admins resolve through the directory probe.
    if let Err(e) = tx.execute(
        "INSERT INTO accounts(uid, email, display_name, claim_role, created_at)
         VALUES(?, ?, ?, NULL, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&uid, &email, &name),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "INSERT INTO users(uid, name, email, role, created_at)
         VALUES(?, ?, ?, 'admin', strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&uid, &name, &email),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "uid": uid, "name": name, "email": email, "role": "admin" }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.resolveRole" => Some(handle_resolve_role(state, req)),
        "admins.create" => Some(handle_admins_create(state, req)),
        _ => None,
    }
}
