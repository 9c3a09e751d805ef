use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use uuid::Uuid;

struct StudentRow {
    id: String,
    classroom_id: String,
    name: String,
    date_of_birth: Option<String>,
    address: Option<String>,
    father_name: Option<String>,
    father_contact: Option<String>,
    mother_name: Option<String>,
    mother_contact: Option<String>,
    observation: Option<String>,
    badges: String,
    photograph: Option<String>,
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

fn optional_str(params: &JsonValue, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_badges(v: Option<&JsonValue>) -> Result<Vec<String>, &'static str> {
    match v {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(v) => {
            let arr = v.as_array().ok_or("must be array of strings")?;
            let mut out = Vec::with_capacity(arr.len());
            for item in arr {
                let s = item
                    .as_str()
                    .ok_or("must be array of strings")?
                    .trim()
                    .to_string();
                if !s.is_empty() {
                    out.push(s);
                }
            }
            Ok(out)
        }
    }
}

fn badges_json(badges: &[String]) -> String {
    serde_json::to_string(badges).unwrap_or_else(|_| "[]".to_string())
}

fn student_exists(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<bool, serde_json::Value> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = optional_str(&req.params, "classId");

    let select = "SELECT id, classroom_id, name, date_of_birth, address,
                         father_name, father_contact, mother_name, mother_contact,
                         observation, badges, photograph
                  FROM students";
    let (sql, args) = match &classroom_id {
        Some(cid) => (
            format!("{} WHERE classroom_id = ? ORDER BY rowid", select),
            vec![Value::Text(cid.clone())],
        ),
        None => (format!("{} ORDER BY rowid", select), Vec::new()),
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            Ok(StudentRow {
                id: row.get(0)?,
                classroom_id: row.get(1)?,
                name: row.get(2)?,
                date_of_birth: row.get(3)?,
                address: row.get(4)?,
                father_name: row.get(5)?,
                father_contact: row.get(6)?,
                mother_name: row.get(7)?,
                mother_contact: row.get(8)?,
                observation: row.get(9)?,
                badges: row.get(10)?,
                photograph: row.get(11)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Attendance rides along so the roster view never needs a second call.
    let mut entries: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    let (att_sql, att_args) = match &classroom_id {
        Some(cid) => (
            "SELECT a.student_id, a.date, a.status
             FROM attendance_entries a
             JOIN students s ON s.id = a.student_id
             WHERE s.classroom_id = ?
             ORDER BY a.rowid"
                .to_string(),
            vec![Value::Text(cid.clone())],
        ),
        None => (
            "SELECT student_id, date, status FROM attendance_entries ORDER BY rowid".to_string(),
            Vec::new(),
        ),
    };
    let mut att_stmt = match conn.prepare(&att_sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let att_rows = att_stmt
        .query_map(params_from_iter(att_args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match att_rows {
        Ok(list) => {
            for (student_id, date, status) in list {
                entries
                    .entry(student_id)
                    .or_default()
                    .push(json!({ "date": date, "status": status }));
            }
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let students_json: Vec<serde_json::Value> = students
        .into_iter()
        .map(|s| {
            let badges: Vec<String> = serde_json::from_str(&s.badges).unwrap_or_default();
            let attendance = entries.remove(&s.id).unwrap_or_default();
            json!({
                "id": s.id,
                "classroomId": s.classroom_id,
                "name": s.name,
                "dateOfBirth": s.date_of_birth,
                "address": s.address,
                "fatherName": s.father_name,
                "fatherContact": s.father_contact,
                "motherName": s.mother_name,
                "motherContact": s.mother_contact,
                "observation": s.observation,
                "badges": badges,
                "photograph": s.photograph,
                "attendance": attendance
            })
        })
        .collect();

    ok(&req.id, json!({ "students": students_json }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let badges = match parse_badges(req.params.get("badges")) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", format!("badges {}", m), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(
           id, classroom_id, name, date_of_birth, address,
           father_name, father_contact, mother_name, mother_contact,
           observation, badges, photograph, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &student_id,
            &classroom_id,
            &name,
            optional_str(&req.params, "dateOfBirth"),
            optional_str(&req.params, "address"),
            optional_str(&req.params, "fatherName"),
            optional_str(&req.params, "fatherContact"),
            optional_str(&req.params, "motherName"),
            optional_str(&req.params, "motherContact"),
            optional_str(&req.params, "observation"),
            badges_json(&badges),
            optional_str(&req.params, "photograph"),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch", None);
    };

    match student_exists(conn, req, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e,
    }

    let mut fields: Vec<String> = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (k, v) in patch {
        match k.as_str() {
            "name" => {
                let Some(s) = v.as_str() else {
                    return err(&req.id, "bad_params", "patch.name must be string", None);
                };
                let s = s.trim();
                if s.is_empty() {
                    return err(&req.id, "bad_params", "patch.name must not be empty", None);
                }
                fields.push("name = ?".to_string());
                values.push(Value::Text(s.to_string()));
            }
            "dateOfBirth" | "address" | "fatherName" | "fatherContact" | "motherName"
            | "motherContact" | "observation" | "photograph" => {
                let column = match k.as_str() {
                    "dateOfBirth" => "date_of_birth",
                    "address" => "address",
                    "fatherName" => "father_name",
                    "fatherContact" => "father_contact",
                    "motherName" => "mother_name",
                    "motherContact" => "mother_contact",
                    "observation" => "observation",
                    _ => "photograph",
                };
                fields.push(format!("{} = ?", column));
                if v.is_null() {
                    values.push(Value::Null);
                } else if let Some(s) = v.as_str() {
                    values.push(Value::Text(s.trim().to_string()));
                } else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("patch.{} must be string or null", k),
                        None,
                    );
                }
            }
            "badges" => {
                let badges = match parse_badges(Some(v)) {
                    Ok(list) => list,
                    Err(m) => {
                        return err(&req.id, "bad_params", format!("patch.badges {}", m), None)
                    }
                };
                fields.push("badges = ?".to_string());
                values.push(Value::Text(badges_json(&badges)));
            }
            _ => return err(&req.id, "bad_params", format!("unknown patch field: {}", k), None),
        }
    }
    if fields.is_empty() {
        return ok(&req.id, json!({ "ok": true }));
    }
    values.push(Value::Text(student_id));
    let sql = format!("UPDATE students SET {} WHERE id = ?", fields.join(", "));
    if let Err(e) = conn.execute(&sql, params_from_iter(values)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match student_exists(conn, req, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e,
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM attendance_entries WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "attendance_entries" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM marks WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "marks" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
