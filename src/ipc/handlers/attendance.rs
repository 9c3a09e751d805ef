use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

// Entries are keyed by calendar day. Full timestamps collapse onto their
// UTC day so a morning and an afternoon submission hit the same row.
fn normalize_day(raw: &str) -> Option<String> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(d.format("%Y-%m-%d").to_string());
    }
    DateTime::parse_from_rfc3339(t).ok().map(|dt| {
        dt.with_timezone(&Utc)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    })
}

fn valid_status(status: &str) -> bool {
    matches!(status, "Present" | "Absent" | "Late")
}

fn attendance_save_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(records) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing records".to_string(),
            details: None,
        });
    };

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;

    let mut saved: u64 = 0;
    let mut skipped: u64 = 0;
    for record in records {
        let student_id = record.get("studentId").and_then(|v| v.as_str());
        let date_raw = record.get("date").and_then(|v| v.as_str());
        let status = record.get("status").and_then(|v| v.as_str());
        let (Some(student_id), Some(date_raw), Some(status)) = (student_id, date_raw, status)
        else {
            skipped += 1;
            continue;
        };
        if !valid_status(status) {
            skipped += 1;
            continue;
        }
        let Some(day) = normalize_day(date_raw) else {
            skipped += 1;
            continue;
        };

        let exists = tx
            .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
                r.get::<_, i64>(0)
            })
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?
            .is_some();
        if !exists {
            skipped += 1;
            continue;
        }

        tx.execute(
            "INSERT INTO attendance_entries(student_id, date, status)
             VALUES(?, ?, ?)
             ON CONFLICT(student_id, date) DO UPDATE SET
               status = excluded.status",
            (student_id, &day, status),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_entries" })),
        })?;
        saved += 1;
    }

    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "saved": saved, "skipped": skipped }))
}

fn handle_attendance_save_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_save_batch(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.saveBatch" => Some(handle_attendance_save_batch(state, req)),
        _ => None,
    }
}
