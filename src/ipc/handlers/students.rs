use crate::academics;
use crate::credentials;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

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

fn normalize_roll(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone)]
struct StudentRow {
    roll: String,
    name: String,
    dob: Option<String>,
    gender: Option<String>,
    dept_code: String,
    dept_name: String,
    year: String,
    current_semester: i64,
    reset_state: String,
}

fn student_json(s: &StudentRow) -> serde_json::Value {
    json!({
        "roll": s.roll,
        "name": s.name,
        "dob": s.dob,
        "gender": s.gender,
        "deptCode": s.dept_code,
        "deptName": s.dept_name,
        "year": s.year,
        "currentSemester": s.current_semester,
        "resetState": s.reset_state
    })
}

fn marks_json(m: &academics::SemesterMarks) -> serde_json::Value {
    json!({
        "int1": m.int1,
        "int2": m.int2,
        "model": m.model,
        "semFinal": m.sem_final,
        "assignment": m.assignment,
        "miniProject": m.mini_project,
        "rmkNextGen": m.rmk_next_gen
    })
}

fn fetch_student(conn: &Connection, roll: &str) -> Result<Option<StudentRow>, HandlerErr> {
    conn.query_row(
        "SELECT roll, name, dob, gender, dept_code, dept_name, year, current_semester, reset_state
         FROM students
         WHERE roll = ?",
        [roll],
        |r| {
            Ok(StudentRow {
                roll: r.get(0)?,
                name: r.get(1)?,
                dob: r.get(2)?,
                gender: r.get(3)?,
                dept_code: r.get(4)?,
                dept_name: r.get(5)?,
                year: r.get(6)?,
                current_semester: r.get(7)?,
                reset_state: r.get(8)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn fetch_attendance(conn: &Connection, roll: &str) -> Result<(i64, i64), HandlerErr> {
    conn.query_row(
        "SELECT total_days, days_present FROM attendance WHERE student_roll = ?",
        [roll],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    )
    .optional()
    .map(|v| v.unwrap_or((0, 0)))
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn attendance_json(total_days: i64, days_present: i64) -> serde_json::Value {
    json!({
        "totalDays": total_days,
        "daysPresent": days_present,
        "percent": academics::round2(academics::attendance_percent(total_days, days_present))
    })
}

fn validate_dob(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    NaiveDate::parse_from_str(t, "%Y-%m-%d").map_err(|_| HandlerErr {
        code: "validation_failed",
        message: "dob must be a YYYY-MM-DD date".to_string(),
        details: Some(json!({ "dob": t })),
    })?;
    Ok(t.to_string())
}

fn list_departments() -> serde_json::Value {
    let departments: Vec<serde_json::Value> = academics::DEPARTMENTS
        .iter()
        .map(|d| {
            json!({
                "code": d.code,
                "name": d.name,
                "shortName": d.short_name,
                "label": academics::department_label(d)
            })
        })
        .collect();
    json!({ "departments": departments })
}

fn list_students(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.roll, s.name, s.dob, s.gender, s.dept_code, s.dept_name, s.year,
                    s.current_semester, s.reset_state,
                    COALESCE(a.total_days, 0), COALESCE(a.days_present, 0)
             FROM students s
             LEFT JOIN attendance a ON a.student_roll = s.roll
             ORDER BY s.roll",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([], |r| {
            let row = StudentRow {
                roll: r.get(0)?,
                name: r.get(1)?,
                dob: r.get(2)?,
                gender: r.get(3)?,
                dept_code: r.get(4)?,
                dept_name: r.get(5)?,
                year: r.get(6)?,
                current_semester: r.get(7)?,
                reset_state: r.get(8)?,
            };
            Ok((row, r.get::<_, i64>(9)?, r.get::<_, i64>(10)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(row, total_days, days_present)| {
            let mut v = student_json(&row);
            v["attendance"] = attendance_json(total_days, days_present);
            v
        })
        .collect();
    Ok(json!({ "students": students }))
}

fn get_student(conn: &Connection, roll: &str) -> Result<serde_json::Value, HandlerErr> {
    let Some(student) = fetch_student(conn, roll)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    let (total_days, days_present) = fetch_attendance(conn, roll)?;

    let mut stmt = conn
        .prepare(
            "SELECT semester, int1, int2, model, sem_final, assignment, mini_project, rmk_next_gen
             FROM marks
             WHERE student_roll = ?",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([roll], |r| {
            Ok((
                r.get::<_, String>(0)?,
                academics::SemesterMarks {
                    int1: r.get(1)?,
                    int2: r.get(2)?,
                    model: r.get(3)?,
                    sem_final: r.get(4)?,
                    assignment: r.get(5)?,
                    mini_project: r.get(6)?,
                    rmk_next_gen: r.get(7)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let mut by_sem: HashMap<String, academics::SemesterMarks> = rows.into_iter().collect();
    let mut marks = serde_json::Map::new();
    for sem in academics::SEMESTERS {
        let row = by_sem.remove(sem).unwrap_or_default();
        marks.insert(sem.to_string(), marks_json(&row));
    }

    Ok(json!({
        "student": student_json(&student),
        "attendance": attendance_json(total_days, days_present),
        "marks": marks
    }))
}

fn create_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let roll = normalize_roll(&get_required_str(params, "roll")?);
    let name_raw = get_required_str(params, "name")?;
    let dept_code = get_required_str(params, "deptCode")?;
    let year = get_required_str(params, "year")?;

    let dept = academics::department_by_code(&dept_code).ok_or_else(|| HandlerErr {
        code: "validation_failed",
        message: format!("unknown department code: {}", dept_code),
        details: Some(json!({ "deptCode": dept_code })),
    })?;
    academics::validate_roll(&roll, dept.code).map_err(from_rule)?;
    let name = academics::normalize_name(&name_raw).map_err(from_rule)?;
    let today = Local::now().date_naive();
    academics::validate_academic_year(&roll, &year, today).map_err(from_rule)?;
    let dob = match params.get("dob").and_then(|v| v.as_str()) {
        Some(raw) => Some(validate_dob(raw)?),
        None => None,
    };
    let gender = params
        .get("gender")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let exists = conn
        .query_row("SELECT 1 FROM students WHERE roll = ?", [&roll], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?
        .is_some();
    if exists {
        return Err(HandlerErr {
            code: "conflict",
            message: "a student with this roll already exists".to_string(),
            details: Some(json!({ "roll": roll })),
        });
    }

    let current_semester = academics::current_semester(&roll, &year, today);
    let default_password = credentials::default_student_password(&roll);
    let stored_password = credentials::hash_password(&default_password);
    let parent_username = credentials::default_parent_username(&roll);
    let dept_name = academics::department_label(dept);

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute(
        "INSERT INTO students(roll, name, dob, gender, dept_code, dept_name, year,
                              current_semester, password, reset_state, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'none',
                strftime('%Y-%m-%dT%H:%M:%SZ','now'), strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (
            &roll,
            &name,
            &dob,
            &gender,
            dept.code,
            &dept_name,
            &year,
            current_semester,
            &stored_password,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;
    tx.execute(
        "INSERT INTO attendance(student_roll, total_days, days_present, updated_at)
         VALUES(?, 0, 0, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        [&roll],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance" })),
    })?;
    for sem in academics::SEMESTERS {
        tx.execute(
            "INSERT INTO marks(id, student_roll, semester) VALUES(?, ?, ?)",
            (Uuid::new_v4().to_string(), &roll, sem),
        )
        .map_err(|e| HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "marks" })),
        })?;
    }
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({
        "roll": roll,
        "currentSemester": current_semester,
        "defaultPassword": default_password,
        "parentUsername": parent_username
    }))
}

const PATCH_KEYS: [&str; 5] = ["name", "dob", "gender", "deptCode", "year"];

fn update_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let roll = normalize_roll(&get_required_str(params, "roll")?);
    let Some(existing) = fetch_student(conn, &roll)? else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing patch".to_string(),
            details: None,
        });
    };
    for key in patch.keys() {
        if !PATCH_KEYS.contains(&key.as_str()) {
            return Err(HandlerErr {
                code: "bad_params",
                message: format!("unknown patch field: {}", key),
                details: None,
            });
        }
    }

    let name = match patch.get("name").and_then(|v| v.as_str()) {
        Some(raw) => academics::normalize_name(raw).map_err(from_rule)?,
        None => existing.name.clone(),
    };
    let dept_code = patch
        .get("deptCode")
        .and_then(|v| v.as_str())
        .unwrap_or(&existing.dept_code)
        .to_string();
    let dept = academics::department_by_code(&dept_code).ok_or_else(|| HandlerErr {
        code: "validation_failed",
        message: format!("unknown department code: {}", dept_code),
        details: Some(json!({ "deptCode": dept_code })),
    })?;
    // The roll is immutable, so a department change must still agree
    // with the code embedded in it.
    academics::validate_roll(&roll, dept.code).map_err(from_rule)?;
    let year = patch
        .get("year")
        .and_then(|v| v.as_str())
        .unwrap_or(&existing.year)
        .to_string();
    let today = Local::now().date_naive();
    academics::validate_academic_year(&roll, &year, today).map_err(from_rule)?;
    let dob = match patch.get("dob") {
        None => existing.dob.clone(),
        Some(v) if v.is_null() => None,
        Some(v) => {
            let raw = v.as_str().ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: "dob must be a string or null".to_string(),
                details: None,
            })?;
            Some(validate_dob(raw)?)
        }
    };
    let gender = match patch.get("gender") {
        None => existing.gender.clone(),
        Some(v) if v.is_null() => None,
        Some(v) => v
            .as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    };
    let current_semester = academics::current_semester(&roll, &year, today);
    let dept_name = academics::department_label(dept);

    conn.execute(
        "UPDATE students
         SET name = ?, dob = ?, gender = ?, dept_code = ?, dept_name = ?, year = ?,
             current_semester = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE roll = ?",
        (
            &name,
            &dob,
            &gender,
            dept.code,
            &dept_name,
            &year,
            current_semester,
            &roll,
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "roll": roll, "currentSemester": current_semester }))
}

fn delete_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let roll = normalize_roll(&get_required_str(params, "roll")?);
    if fetch_student(conn, &roll)?.is_none() {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn.unchecked_transaction().map_err(|e| HandlerErr {
        code: "db_tx_failed",
        message: e.to_string(),
        details: None,
    })?;
    tx.execute("DELETE FROM marks WHERE student_roll = ?", [&roll])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "marks" })),
        })?;
    tx.execute("DELETE FROM attendance WHERE student_roll = ?", [&roll])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance" })),
        })?;
    tx.execute("DELETE FROM students WHERE roll = ?", [&roll])
        .map_err(|e| HandlerErr {
            code: "db_delete_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        })?;
    tx.commit().map_err(|e| HandlerErr {
        code: "db_commit_failed",
        message: e.to_string(),
        details: None,
    })?;

    Ok(json!({ "ok": true, "roll": roll }))
}

fn handle_departments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_token(conn, req) {
        return resp;
    }
    ok(&req.id, list_departments())
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match list_students(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let roll = match get_required_str(&req.params, "roll") {
        Ok(raw) => normalize_roll(&raw),
        Err(error) => return error.response(&req.id),
    };
    if let Err(resp) = auth::require_staff_or_self(conn, req, &roll) {
        return resp;
    }
    match get_student(conn, &roll) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match create_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match update_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match delete_student(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(handle_departments_list(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
