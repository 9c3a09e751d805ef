use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, NaiveDate};
use rusqlite::{params_from_iter, types::Value, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn valid_date(raw: &str) -> bool {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(raw).is_ok()
}

fn handle_activities_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let classroom_id = req
        .params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let select = "SELECT id, classroom_id, title, description, date, image_url FROM activities";
    let (sql, args) = match &classroom_id {
        Some(cid) => (
            format!(
                "{} WHERE classroom_id = ? ORDER BY date DESC, rowid DESC",
                select
            ),
            vec![Value::Text(cid.clone())],
        ),
        None => (
            format!("{} ORDER BY date DESC, rowid DESC", select),
            Vec::new(),
        ),
    };

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            let id: String = row.get(0)?;
            let classroom_id: String = row.get(1)?;
            let title: String = row.get(2)?;
            let description: Option<String> = row.get(3)?;
            let date: String = row.get(4)?;
            let image_url: String = row.get(5)?;
            Ok(json!({
                "id": id,
                "classroomId": classroom_id,
                "title": title,
                "description": description,
                "date": date,
                "imageUrl": image_url
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(activities) => ok(&req.id, json!({ "activities": activities })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_activities_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let classroom_id = match req.params.get("classId").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing classId", None),
    };
    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let date = match req.params.get("date").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing date", None),
    };
    if !valid_date(&date) {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD or RFC 3339", None);
    }
    let image_url = match req.params.get("imageUrl").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing imageUrl", None),
    };
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

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

    let activity_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO activities(id, classroom_id, title, description, date, image_url, created_at)
         VALUES(?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &activity_id,
            &classroom_id,
            &title,
            &description,
            &date,
            &image_url,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "activities" })),
        );
    }

    ok(&req.id, json!({ "activityId": activity_id }))
}

fn handle_activities_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let activity_id = match req.params.get("activityId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing activityId", None),
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM activities WHERE id = ?",
            [&activity_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "activity not found", None);
    }

    if let Err(e) = conn.execute("DELETE FROM activities WHERE id = ?", [&activity_id]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "activities" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activities.list" => Some(handle_activities_list(state, req)),
        "activities.create" => Some(handle_activities_create(state, req)),
        "activities.delete" => Some(handle_activities_delete(state, req)),
        _ => None,
    }
}
