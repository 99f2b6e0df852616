use crate::academics;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
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

fn from_rule(e: academics::RuleError) -> HandlerErr {
    HandlerErr {
        code: e.code,
        message: e.message,
        details: e.details,
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

fn marks_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let roll = get_required_str(params, "roll")?.trim().to_ascii_uppercase();
    let semester = get_required_str(params, "semester")?;
    academics::validate_semester_key(&semester).map_err(from_rule)?;

    let Some(marks_value) = params.get("marks") else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing marks".to_string(),
            details: None,
        });
    };
    let marks: academics::SemesterMarks =
        serde_json::from_value(marks_value.clone()).map_err(|e| HandlerErr {
            code: "bad_params",
            message: format!("invalid marks object: {}", e),
            details: None,
        })?;
    academics::validate_marks(&marks).map_err(from_rule)?;

    // Seeded at student creation; zero affected rows means the student
    // (or a legacy-imported row) is missing.
    let affected = conn
        .execute(
            "UPDATE marks
             SET int1 = ?, int2 = ?, model = ?, sem_final = ?,
                 assignment = ?, mini_project = ?, rmk_next_gen = ?,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE student_roll = ? AND semester = ?",
            (
                marks.int1,
                marks.int2,
                marks.model,
                marks.sem_final,
                marks.assignment,
                marks.mini_project,
                marks.rmk_next_gen,
                &roll,
                &semester,
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "marks" })),
        })?;
    if affected == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "no marks row for that student and semester".to_string(),
            details: Some(json!({ "roll": roll, "semester": semester })),
        });
    }

    let score = academics::total_score(&marks).map(academics::round2);
    Ok(json!({
        "roll": roll,
        "semester": semester,
        "score": score,
        "passed": score.map(|s| s >= academics::PASS_MARK)
    }))
}

fn handle_marks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match marks_update(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.update" => Some(handle_marks_update(state, req)),
        _ => None,
    }
}
