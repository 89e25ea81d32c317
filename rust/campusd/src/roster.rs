use rusqlite::{Connection, OptionalExtension, Transaction};
use std::cmp::Ordering;

pub const SEMESTERS: [&str; 6] = ["S1", "S2", "S3", "S4", "S5", "S6"];
pub const PROGRAM_REGULAR: &str = "Regular";
pub const PROGRAM_WP: &str = "WP";
pub const STUDENT_TYPE_REGULAR: &str = "Regular";
pub const STUDENT_TYPE_LET: &str = "LET";

/// Display name shown in batch pickers: "S1 EEE", with a "(WP)" tag for
/// working-professional batches.
pub fn batch_display_name(semester: &str, department: &str, program: &str) -> String {
    let mut name = format!("{} {}", semester, department);
    if program == PROGRAM_WP {
        name.push_str(" (WP)");
    }
    name
}

/// Full roster label: the display name with the admission year appended,
/// e.g. "S1 EEE (2024)". The year is skipped when the display name already
/// carries it.
pub fn batch_label(display_name: &str, year: &str) -> String {
    if year.is_empty() || display_name.contains(year) {
        return display_name.to_string();
    }
    format!("{} ({})", display_name, year)
}

#[derive(Debug, Clone)]
pub struct BatchRef {
    pub id: String,
    pub label: String,
}

pub fn find_batch(conn: &Connection, batch_id: &str) -> rusqlite::Result<Option<BatchRef>> {
    conn.query_row(
        "SELECT id, display_name, year FROM batches WHERE id = ?",
        [batch_id],
        |r| {
            let id: String = r.get(0)?;
            let display_name: String = r.get(1)?;
            let year: String = r.get(2)?;
            Ok(BatchRef {
                id,
                label: batch_label(&display_name, &year),
            })
        },
    )
    .optional()
}

#[derive(Debug, Clone)]
pub struct RosterMember {
    pub uid: String,
    pub name: String,
    pub student_type: String,
}

/// Roll-call order: regular students alphabetically, lateral entries after
/// them, also alphabetically. Serial roll numbers are assigned from this
/// ordering.
pub fn roll_order(members: &mut [RosterMember]) {
    members.sort_by(|a, b| {
        let ra = if a.student_type == STUDENT_TYPE_LET { 1 } else { 0 };
        let rb = if b.student_type == STUDENT_TYPE_LET { 1 } else { 0 };
        match ra.cmp(&rb) {
            Ordering::Equal => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            other => other,
        }
    });
}

/// Snapshot of the cohort currently assigned to a batch, in roll order.
/// This is the identifier list the batched reassignment writes against; it
/// is never re-queried between capture and write.
pub fn capture_roster(conn: &Connection, batch_id: &str) -> rusqlite::Result<Vec<RosterMember>> {
    let mut stmt = conn.prepare(
        "SELECT uid, name, student_type
         FROM students
         WHERE batch_id = ?",
    )?;
    let mut members = stmt
        .query_map([batch_id], |r| {
            Ok(RosterMember {
                uid: r.get(0)?,
                name: r.get(1)?,
                student_type: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    roll_order(&mut members);
    Ok(members)
}

/// Rewrite the batch assignment for exactly the captured identifier list.
/// Runs inside the caller's transaction; any row failure propagates so the
/// whole write rolls back as one unit.
pub fn apply_reassignment(
    tx: &Transaction<'_>,
    uids: &[String],
    target_batch_id: &str,
    target_label: &str,
) -> rusqlite::Result<usize> {
    let mut changed = 0usize;
    for uid in uids {
        changed += tx.execute(
            "UPDATE students
             SET batch_id = ?, batch_label = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE uid = ?",
            (target_batch_id, target_label, uid),
        )?;
    }
    Ok(changed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationPolicy {
    Strict,
    BestEffort,
}

impl RevalidationPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(Self::Strict),
            "best_effort" => Some(Self::BestEffort),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::BestEffort => "best_effort",
        }
    }
}

/// The setup default: enforce the confirmed count unless the operator has
/// opted into the original best-effort behavior.
pub fn load_revalidation_policy(conn: &Connection) -> RevalidationPolicy {
    let saved = crate::db::settings_get_json(conn, "setup.promotion")
        .ok()
        .flatten();
    saved
        .as_ref()
        .and_then(|v| v.get("revalidation"))
        .and_then(|v| v.as_str())
        .and_then(RevalidationPolicy::parse)
        .unwrap_or(RevalidationPolicy::Strict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "CREATE TABLE students(
                uid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                reg_no TEXT,
                batch_id TEXT NOT NULL,
                batch_label TEXT NOT NULL,
                student_type TEXT NOT NULL,
                phone TEXT,
                dob TEXT,
                blood_group TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT
            );
            CREATE TABLE batches(
                id TEXT PRIMARY KEY,
                year TEXT NOT NULL,
                department TEXT NOT NULL,
                semester TEXT NOT NULL,
                program TEXT NOT NULL,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .expect("create schema");
        conn
    }

    fn insert_student(conn: &Connection, uid: &str, name: &str, batch_id: &str, kind: &str) {
        conn.execute(
            "INSERT INTO students(uid, name, email, batch_id, batch_label, student_type, created_at)
             VALUES(?, ?, ?, ?, ?, ?, '2026-01-01T00:00:00Z')",
            (uid, name, format!("{}@example.edu", uid), batch_id, "L", kind),
        )
        .expect("insert student");
    }

    #[test]
    fn display_name_tags_working_professional() {
        assert_eq!(batch_display_name("S1", "EEE", PROGRAM_REGULAR), "S1 EEE");
        assert_eq!(batch_display_name("S3", "CT", PROGRAM_WP), "S3 CT (WP)");
    }

    #[test]
    fn label_appends_year_exactly_once() {
        assert_eq!(batch_label("S1 EEE", "2024"), "S1 EEE (2024)");
        assert_eq!(batch_label("S1 EEE (2024)", "2024"), "S1 EEE (2024)");
        assert_eq!(batch_label("S1 EEE", ""), "S1 EEE");
    }

    #[test]
    fn roll_order_puts_lateral_entries_last() {
        let mut members = vec![
            RosterMember {
                uid: "a".into(),
                name: "Zara".into(),
                student_type: STUDENT_TYPE_REGULAR.into(),
            },
            RosterMember {
                uid: "b".into(),
                name: "anil".into(),
                student_type: STUDENT_TYPE_LET.into(),
            },
            RosterMember {
                uid: "c".into(),
                name: "Binu".into(),
                student_type: STUDENT_TYPE_REGULAR.into(),
            },
            RosterMember {
                uid: "d".into(),
                name: "Chacko".into(),
                student_type: STUDENT_TYPE_LET.into(),
            },
        ];
        roll_order(&mut members);
        let uids: Vec<&str> = members.iter().map(|m| m.uid.as_str()).collect();
        assert_eq!(uids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn revalidation_policy_parse_round_trip() {
        assert_eq!(
            RevalidationPolicy::parse("strict"),
            Some(RevalidationPolicy::Strict)
        );
        assert_eq!(
            RevalidationPolicy::parse("best_effort"),
            Some(RevalidationPolicy::BestEffort)
        );
        assert_eq!(RevalidationPolicy::parse("sometimes"), None);
        assert_eq!(RevalidationPolicy::Strict.as_str(), "strict");
    }

    #[test]
    fn capture_roster_matches_only_the_batch() {
        let conn = test_conn();
        insert_student(&conn, "s1", "Binu", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s2", "Anil", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s3", "Maya", "b-other", STUDENT_TYPE_REGULAR);

        let members = capture_roster(&conn, "b-src").expect("capture");
        let uids: Vec<&str> = members.iter().map(|m| m.uid.as_str()).collect();
        assert_eq!(uids, vec!["s2", "s1"]);

        let empty = capture_roster(&conn, "b-none").expect("capture empty");
        assert!(empty.is_empty());
    }

    #[test]
    fn apply_reassignment_touches_exactly_the_captured_set() {
        let mut conn = test_conn();
        insert_student(&conn, "s1", "Binu", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s2", "Anil", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s3", "Maya", "b-other", STUDENT_TYPE_REGULAR);

        let captured = vec!["s1".to_string(), "s2".to_string()];
        let tx = conn.transaction().expect("begin tx");
        let changed =
            apply_reassignment(&tx, &captured, "b-dst", "S2 EEE (2024)").expect("apply");
        tx.commit().expect("commit");
        assert_eq!(changed, 2);

        let moved: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE batch_id = 'b-dst'",
                [],
                |r| r.get(0),
            )
            .expect("count moved");
        assert_eq!(moved, 2);
        let other: String = conn
            .query_row(
                "SELECT batch_id FROM students WHERE uid = 's3'",
                [],
                |r| r.get(0),
            )
            .expect("outside row");
        assert_eq!(other, "b-other");
    }

    #[test]
    fn failed_reassignment_rolls_back_every_row() {
        let mut conn = test_conn();
        insert_student(&conn, "s1", "Binu", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s2", "Anil", "b-src", STUDENT_TYPE_REGULAR);
        insert_student(&conn, "s3", "Maya", "b-src", STUDENT_TYPE_REGULAR);

        // Abort the write on the last row after the first two have applied.
        conn.execute_batch(
            "CREATE TRIGGER fail_s3 BEFORE UPDATE ON students
             WHEN OLD.uid = 's3'
             BEGIN SELECT RAISE(ABORT, 'simulated backend fault'); END;",
        )
        .expect("install trigger");

        let captured = vec!["s1".to_string(), "s2".to_string(), "s3".to_string()];
        let tx = conn.transaction().expect("begin tx");
        let result = apply_reassignment(&tx, &captured, "b-dst", "S2 EEE (2024)");
        assert!(result.is_err());
        tx.rollback().expect("rollback");

        let still_src: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE batch_id = 'b-src'",
                [],
                |r| r.get(0),
            )
            .expect("count source");
        assert_eq!(still_src, 3);
        let in_dst: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM students WHERE batch_id = 'b-dst'",
                [],
                |r| r.get(0),
            )
            .expect("count target");
        assert_eq!(in_dst, 0);
    }
}
