use crate::academics;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::auth;

const ALLOWED_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "pdf", "docx"];
const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

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

fn io_failed(e: std::io::Error) -> HandlerErr {
    HandlerErr {
        code: "io_failed",
        message: e.to_string(),
        details: None,
    }
}

/// Existence, extension allowlist, size cap. Returns the lower-cased
/// extension for the destination name.
fn check_attachment(src: &Path) -> Result<String, HandlerErr> {
    if !src.is_file() {
        return Err(HandlerErr {
            code: "not_found",
            message: "source file not found".to_string(),
            details: Some(json!({ "path": src.to_string_lossy() })),
        });
    }
    let ext = src
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "file type must be one of: jpg, jpeg, png, pdf, docx".to_string(),
            details: Some(json!({ "extension": ext })),
        });
    }
    let meta = std::fs::metadata(src).map_err(io_failed)?;
    if meta.len() > MAX_ATTACHMENT_BYTES {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "file exceeds the 10 MiB limit".to_string(),
            details: Some(json!({ "sizeBytes": meta.len() })),
        });
    }
    Ok(ext)
}

fn copy_into_uploads(
    workspace: &Path,
    subdir: &str,
    src: &Path,
    ext: &str,
) -> Result<String, HandlerErr> {
    let rel = format!("uploads/{}/{}.{}", subdir, Uuid::new_v4(), ext);
    let dest = workspace.join(&rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(io_failed)?;
    }
    std::fs::copy(src, &dest).map_err(io_failed)?;
    Ok(rel)
}

fn timetable_upload(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let semester = get_required_str(params, "semester")?;
    academics::validate_semester_key(&semester).map_err(from_rule)?;
    let source_path = PathBuf::from(get_required_str(params, "sourcePath")?);
    let ext = check_attachment(&source_path)?;

    let previous: Option<String> = conn
        .query_row(
            "SELECT file_path FROM timetables WHERE semester = ?",
            [&semester],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let rel = copy_into_uploads(workspace, "timetables", &source_path, &ext)?;
    conn.execute(
        "INSERT INTO timetables(semester, file_path, uploaded_at)
         VALUES(?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))
         ON CONFLICT(semester) DO UPDATE SET
           file_path = excluded.file_path,
           uploaded_at = excluded.uploaded_at",
        (&semester, &rel),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "timetables" })),
    })?;

    // Replaced files have no remaining reference; removal is best-effort.
    if let Some(prev) = previous {
        if prev != rel {
            let _ = std::fs::remove_file(workspace.join(prev));
        }
    }

    Ok(json!({ "semester": semester, "filePath": rel }))
}

fn timetable_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let semester = get_required_str(params, "semester")?;
    academics::validate_semester_key(&semester).map_err(from_rule)?;

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT file_path, uploaded_at FROM timetables WHERE semester = ?",
            [&semester],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let timetable = row.map(|(file_path, uploaded_at)| {
        json!({
            "semester": semester,
            "filePath": file_path,
            "uploadedAt": uploaded_at
        })
    });
    Ok(json!({ "timetable": timetable }))
}

fn content_add(
    conn: &Connection,
    workspace: &Path,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let semester = get_required_str(params, "semester")?;
    academics::validate_semester_key(&semester).map_err(from_rule)?;
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "title must not be empty".to_string(),
            details: None,
        });
    }

    let source_path = params
        .get("sourcePath")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let url = params
        .get("url")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if source_path.is_none() && url.is_none() {
        return Err(HandlerErr {
            code: "validation_failed",
            message: "provide a file or a url".to_string(),
            details: None,
        });
    }

    let file_path = match source_path {
        Some(raw) => {
            let src = PathBuf::from(raw);
            let ext = check_attachment(&src)?;
            Some(copy_into_uploads(workspace, "content", &src, &ext)?)
        }
        None => None,
    };

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO digital_content(id, semester, title, file_path, url, uploaded_at)
         VALUES(?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, &semester, &title, &file_path, &url),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "digital_content" })),
    })?;

    Ok(json!({
        "id": id,
        "semester": semester,
        "title": title,
        "filePath": file_path,
        "url": url
    }))
}

fn content_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let semester = get_required_str(params, "semester")?;
    academics::validate_semester_key(&semester).map_err(from_rule)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, semester, title, file_path, url, uploaded_at
             FROM digital_content
             WHERE semester = ?
             ORDER BY uploaded_at DESC, rowid DESC",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let items = stmt
        .query_map([&semester], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "semester": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "filePath": r.get::<_, Option<String>>(3)?,
                "url": r.get::<_, Option<String>>(4)?,
                "uploadedAt": r.get::<_, Option<String>>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "items": items }))
}

fn handle_timetable_upload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match timetable_upload(conn, &workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_timetable_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_token(conn, req) {
        return resp;
    }
    match timetable_get(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_content_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_staff(conn, req) {
        return resp;
    }
    match content_add(conn, &workspace, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_content_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = auth::require_token(conn, req) {
        return resp;
    }
    match content_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.upload" => Some(handle_timetable_upload(state, req)),
        "timetable.get" => Some(handle_timetable_get(state, req)),
        "content.add" => Some(handle_content_add(state, req)),
        "content.list" => Some(handle_content_list(state, req)),
        _ => None,
    }
}
