use crate::academics;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::auth;

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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_required_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn student_exists(conn: &Connection, roll: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE roll = ?", [roll], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn attendance_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let roll = get_required_str(params, "roll")?.trim().to_ascii_uppercase();
    let total_days = get_required_i64(params, "totalDays")?;
    let days_present = get_required_i64(params, "daysPresent")?;

    academics::validate_attendance(total_days, days_present).map_err(|e| HandlerErr {
        code: e.code,
        message: e.message,
        details: e.details,
    })?;
    if !student_exists(conn, &roll)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    conn.execute(
        "INSERT INTO attendance(student_roll, total_days, days_present, updated_at)
         VALUES(?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(student_roll) DO UPDATE SET
           total_days = excluded.total_days,
           days_present = excluded.days_present,
           updated_at = excluded.updated_at",
        (&roll, total_days, days_present),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;

    Ok(json!({
        "roll": roll,
        "totalDays": total_days,
        "daysPresent": days_present,
        "percent": academics::round2(academics::attendance_percent(total_days, days_present))
    }))
}

fn handle_attendance_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match attendance_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.update" => Some(handle_attendance_update(state, req)),
        _ => None,
    }
}
