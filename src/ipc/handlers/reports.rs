use crate::academics;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

use super::auth;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_err(req: &Request, e: impl std::fmt::Display) -> serde_json::Value {
    err(&req.id, "db_query_failed", e.to_string(), None)
}

struct SemesterLine {
    semester: &'static str,
    internal_average: Option<f64>,
    activity_total: Option<i64>,
    sem_final: Option<i64>,
    score: Option<f64>,
    passed: Option<bool>,
}

fn semester_line(semester: &'static str, m: &academics::SemesterMarks) -> SemesterLine {
    let internal_average = if m.int1.is_none() && m.int2.is_none() && m.model.is_none() {
        None
    } else {
        Some(academics::round2(
            (m.int1.unwrap_or(0) + m.int2.unwrap_or(0) + m.model.unwrap_or(0)) as f64 / 3.0,
        ))
    };
    let activity_total = if m.assignment.is_none() && m.mini_project.is_none() && m.rmk_next_gen.is_none()
    {
        None
    } else {
        Some(m.assignment.unwrap_or(0) + m.mini_project.unwrap_or(0) + m.rmk_next_gen.unwrap_or(0))
    };
    let score = academics::total_score(m).map(academics::round2);
    SemesterLine {
        semester,
        internal_average,
        activity_total,
        sem_final: m.sem_final,
        score,
        passed: score.map(|s| s >= academics::PASS_MARK),
    }
}

fn student_report(
    req: &Request,
    conn: &Connection,
    roll: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let student = conn
        .query_row(
            "SELECT roll, name, dob, gender, dept_code, dept_name, year, current_semester
             FROM students
             WHERE roll = ?",
            [roll],
            |r| {
                Ok(json!({
                    "roll": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "dob": r.get::<_, Option<String>>(2)?,
                    "gender": r.get::<_, Option<String>>(3)?,
                    "deptCode": r.get::<_, String>(4)?,
                    "deptName": r.get::<_, String>(5)?,
                    "year": r.get::<_, String>(6)?,
                    "currentSemester": r.get::<_, i64>(7)?
                }))
            },
        )
        .optional()
        .map_err(|e| db_err(req, e))?
        .ok_or_else(|| err(&req.id, "not_found", "student not found", None))?;

    let (total_days, days_present): (i64, i64) = conn
        .query_row(
            "SELECT total_days, days_present FROM attendance WHERE student_roll = ?",
            [roll],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| db_err(req, e))?
        .unwrap_or((0, 0));

    let mut stmt = conn
        .prepare(
            "SELECT semester, int1, int2, model, sem_final, assignment, mini_project, rmk_next_gen
             FROM marks
             WHERE student_roll = ?",
        )
        .map_err(|e| db_err(req, e))?;
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
        .map_err(|e| db_err(req, e))?;
    let mut by_sem: HashMap<String, academics::SemesterMarks> = rows.into_iter().collect();

    let lines: Vec<SemesterLine> = academics::SEMESTERS
        .iter()
        .map(|sem| semester_line(sem, &by_sem.remove(*sem).unwrap_or_default()))
        .collect();

    // Most recent semester with a final-exam mark drives the summary
    // badge; a record with no finals falls back to the first semester.
    let latest = lines
        .iter()
        .rev()
        .find(|l| l.sem_final.is_some())
        .or_else(|| lines.first())
        .map(|l| {
            json!({
                "semester": l.semester,
                "score": l.score,
                "passed": l.passed
            })
        });

    let semesters: Vec<serde_json::Value> = lines
        .iter()
        .map(|l| {
            json!({
                "semester": l.semester,
                "internalAverage": l.internal_average,
                "activityTotal": l.activity_total,
                "semFinal": l.sem_final,
                "score": l.score,
                "passed": l.passed
            })
        })
        .collect();

    Ok(json!({
        "student": student,
        "attendance": {
            "totalDays": total_days,
            "daysPresent": days_present,
            "percent": academics::round2(academics::attendance_percent(total_days, days_present))
        },
        "semesters": semesters,
        "latest": latest,
        "generatedAt": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }))
}

fn handle_student_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let roll = match required_str(req, "roll") {
        Ok(raw) => raw.trim().to_ascii_uppercase(),
        Err(resp) => return resp,
    };
    if let Err(resp) = auth::require_staff_or_self(conn, req, &roll) {
        return resp;
    }
    match student_report(req, conn, &roll) {
        Ok(result) => ok(&req.id, result),
        Err(resp) => resp,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentReport" => Some(handle_student_report(state, req)),
        _ => None,
    }
}
