use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, AsOf, StatsContext};
use chrono::DateTime;

fn handle_dashboard_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let raw_params = if req.params.is_null() {
        None
    } else {
        Some(&req.params)
    };
    let scope = match stats::parse_dashboard_scope(raw_params) {
        Ok(s) => s,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    // asOf pins the clock for reproducible runs; live calls omit it.
    let as_of = match req.params.get("asOf") {
        None => AsOf::current(),
        Some(v) if v.is_null() => AsOf::current(),
        Some(v) => {
            let parsed = v
                .as_str()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok());
            match parsed {
                Some(instant) => AsOf::at(instant),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "asOf must be an RFC 3339 timestamp",
                        None,
                    )
                }
            }
        }
    };

    let ctx = StatsContext { conn };
    let computation = match stats::compute_dashboard_stats(&ctx, &scope, &as_of) {
        Ok(c) => c,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    if computation.skipped.total() > 0 {
        let detail = serde_json::to_string(&computation.skipped).unwrap_or_default();
        eprintln!(
            "dashboard.stats: skipped {} malformed record(s) {}",
            computation.skipped.total(),
            detail
        );
    }

    match serde_json::to_value(&computation.stats) {
        Ok(result) => ok(&req.id, result),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(handle_dashboard_stats(state, req)),
        _ => None,
    }
}
