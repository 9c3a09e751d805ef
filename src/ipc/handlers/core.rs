use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

// Selecting a workspace is the only configuration this daemon takes.
fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(raw) = req.params.get("path").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };
    let path = PathBuf::from(raw);

    match db::open_db(&path) {
        Ok(conn) => {
            let shown = path.to_string_lossy().to_string();
            state.workspace = Some(path);
            state.db = Some(conn);
            ok(&req.id, json!({ "workspacePath": shown }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
