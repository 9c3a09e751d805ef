use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct AssignmentRow {
    id: String,
    classroom_id: String,
    name: String,
    subject: String,
    max_score: f64,
    due_date: Option<String>,
    created_at: String,
    marks: Vec<serde_json::Value>,
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn valid_timestamp(raw: &str) -> bool {
    DateTime::parse_from_rfc3339(raw).is_ok()
        || NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
}

fn assignment_exists(
    conn: &Connection,
    req: &Request,
    assignment_id: &str,
) -> Result<bool, serde_json::Value> {
    conn.query_row(
        "SELECT 1 FROM assignments WHERE id = ?",
        [assignment_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = optional_str(&req.params, "classId");

    let select = "SELECT id, classroom_id, name, subject, max_score, due_date, created_at
                  FROM assignments";
    let (sql, args) = match &classroom_id {
        Some(cid) => (
            format!(
                "{} WHERE classroom_id = ? ORDER BY created_at DESC, rowid DESC",
                select
            ),
            vec![Value::Text(cid.clone())],
        ),
        None => (
            format!("{} ORDER BY created_at DESC, rowid DESC", select),
            Vec::new(),
        ),
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            Ok(AssignmentRow {
                id: row.get(0)?,
                classroom_id: row.get(1)?,
                name: row.get(2)?,
                subject: row.get(3)?,
                max_score: row.get(4)?,
                due_date: row.get(5)?,
                created_at: row.get(6)?,
                marks: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let mut assignments = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if !assignments.is_empty() {
        let index: HashMap<String, usize> = assignments
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        let placeholders = std::iter::repeat("?")
            .take(assignments.len())
            .collect::<Vec<_>>()
            .join(",");
        let marks_sql = format!(
            "SELECT assignment_id, student_id, student_name, score
             FROM marks
             WHERE assignment_id IN ({})
             ORDER BY rowid",
            placeholders
        );
        let binds: Vec<Value> = assignments
            .iter()
            .map(|a| Value::Text(a.id.clone()))
            .collect();
        let mut marks_stmt = match conn.prepare(&marks_sql) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let marks_rows = marks_stmt
            .query_map(params_from_iter(binds), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match marks_rows {
            Ok(list) => {
                for (assignment_id, student_id, student_name, score) in list {
                    if let Some(&i) = index.get(&assignment_id) {
                        assignments[i].marks.push(json!({
                            "studentId": student_id,
                            "studentName": student_name,
                            "score": score
                        }));
                    }
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let assignments_json: Vec<serde_json::Value> = assignments
        .into_iter()
        .map(|a| {
            json!({
                "id": a.id,
                "classroomId": a.classroom_id,
                "name": a.name,
                "subject": a.subject,
                "maxScore": a.max_score,
                "dueDate": a.due_date,
                "createdAt": a.created_at,
                "marks": a.marks
            })
        })
        .collect();

    ok(&req.id, json!({ "assignments": assignments_json }))
}

fn handle_assignments_subjects(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT DISTINCT subject FROM assignments
         WHERE TRIM(subject) != ''
         ORDER BY subject",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = optional_str(&req.params, "subject").unwrap_or_default();

    let Some(max_score) = req.params.get("maxScore").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing maxScore", None);
    };
    if max_score < 1.0 {
        return err(&req.id, "bad_params", "maxScore must be at least 1", None);
    }

    let classroom_known = match conn
        .query_row(
            "SELECT 1 FROM classrooms WHERE id = ?",
            [&classroom_id],
            |r| r.get::<_, i64>(0),
        )
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !classroom_known {
        return err(&req.id, "not_found", "classroom not found", None);
    }

    let due_date = optional_str(&req.params, "dueDate");
    if let Some(due) = &due_date {
        if !valid_timestamp(due) {
            return err(
                &req.id,
                "bad_params",
                "dueDate must be YYYY-MM-DD or RFC 3339",
                None,
            );
        }
    }

    // createdAt override lets imports keep their original timeline.
    let created_at = match optional_str(&req.params, "createdAt") {
        Some(raw) => {
            if !valid_timestamp(&raw) {
                return err(
                    &req.id,
                    "bad_params",
                    "createdAt must be YYYY-MM-DD or RFC 3339",
                    None,
                );
            }
            raw
        }
        None => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, classroom_id, name, subject, max_score, due_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &classroom_id,
            &name,
            &subject,
            max_score,
            &due_date,
            &created_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_set_marks(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(marks) = req.params.get("marks").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing marks", None);
    };

    match assignment_exists(conn, req, &assignment_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "assignment not found", None),
        Err(e) => return e,
    }

    let mut parsed: Vec<(String, String, f64)> = Vec::with_capacity(marks.len());
    for mark in marks {
        let Some(student_id) = mark.get("studentId").and_then(|v| v.as_str()) else {
            return err(&req.id, "bad_params", "marks[].studentId must be string", None);
        };
        let student_id = student_id.trim();
        if student_id.is_empty() {
            return err(&req.id, "bad_params", "marks[].studentId must not be empty", None);
        }
        let Some(student_name) = mark.get("studentName").and_then(|v| v.as_str()) else {
            return err(&req.id, "bad_params", "marks[].studentName must be string", None);
        };
        let Some(score) = mark.get("score").and_then(|v| v.as_f64()) else {
            return err(&req.id, "bad_params", "marks[].score must be a number", None);
        };
        if score < 0.0 {
            return err(&req.id, "bad_params", "marks[].score must not be negative", None);
        }
        parsed.push((student_id.to_string(), student_name.trim().to_string(), score));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM marks WHERE assignment_id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }
    for (student_id, student_name, score) in &parsed {
        // Replays of the same student keep the last submission.
        if let Err(e) = tx.execute(
            "INSERT INTO marks(assignment_id, student_id, student_name, score)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(assignment_id, student_id) DO UPDATE SET
               student_name = excluded.student_name,
               score = excluded.score",
            (&assignment_id, student_id, student_name, score),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "marks" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "count": parsed.len() }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match assignment_exists(conn, req, &assignment_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "assignment not found", None),
        Err(e) => return e,
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM marks WHERE assignment_id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.subjects" => Some(handle_assignments_subjects(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.setMarks" => Some(handle_assignments_set_marks(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
