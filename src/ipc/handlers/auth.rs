use crate::auth::{self, Principal};
use crate::db;
use crate::directory::{Directory, SqliteDirectory};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::token;
use chrono::Utc;
use rusqlite::Connection;
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

fn from_auth(e: auth::AuthError) -> HandlerErr {
    HandlerErr {
        code: e.code,
        message: e.message,
        details: None,
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

fn parse_user_type(raw: &str) -> Result<auth::UserType, HandlerErr> {
    auth::UserType::parse(raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "userType must be one of: staff, student, parent".to_string(),
        details: Some(json!({ "userType": raw })),
    })
}

fn signing_secret(conn: &Connection) -> Result<String, HandlerErr> {
    db::token_secret(conn).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

/// Token gate shared by the record handlers. Failures come back as full
/// response values already keyed to the request id.
pub(super) fn require_token(
    conn: &Connection,
    req: &Request,
) -> Result<Principal, serde_json::Value> {
    let Some(raw) = req.params.get("token").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "auth_required", "missing token", None));
    };
    let secret = db::token_secret(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let claims = token::verify(&secret, raw, Utc::now().timestamp()).map_err(|e| match e {
        token::VerifyError::Expired => {
            err(&req.id, "token_expired", "token expired; log in again", None)
        }
        _ => err(&req.id, "token_invalid", "token rejected", None),
    })?;
    Ok(Principal {
        subject: claims.sub,
        role: claims.role,
    })
}

pub(super) fn require_staff(
    conn: &Connection,
    req: &Request,
) -> Result<Principal, serde_json::Value> {
    let principal = require_token(conn, req)?;
    if principal.role != "staff" {
        return Err(err(&req.id, "forbidden", "staff access required", None));
    }
    Ok(principal)
}

/// Staff may touch any roll; students and parents only their own.
pub(super) fn require_staff_or_self(
    conn: &Connection,
    req: &Request,
    roll: &str,
) -> Result<Principal, serde_json::Value> {
    let principal = require_token(conn, req)?;
    if principal.role == "staff" || principal.subject == roll {
        return Ok(principal);
    }
    Err(err(&req.id, "forbidden", "own records only", None))
}

fn login(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_type_raw = get_required_str(params, "userType")?;
    let username = get_required_str(params, "username")?;
    let password = get_required_str(params, "password")?;
    let user_type = parse_user_type(&user_type_raw)?;

    let mut dir = SqliteDirectory::new(conn);
    let outcome = auth::login(&mut dir, user_type, &username, &password).map_err(from_auth)?;

    let secret = signing_secret(conn)?;
    let token = token::mint(
        &secret,
        &outcome.subject,
        &outcome.display_name,
        outcome.role,
        Utc::now().timestamp(),
    );
    Ok(json!({
        "token": token,
        "user": {
            "id": outcome.subject,
            "name": outcome.display_name,
            "role": outcome.role
        }
    }))
}

fn forgot_password(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let user_type_raw = get_required_str(params, "userType")?;
    let username = get_required_str(params, "username")?;
    let user_type = parse_user_type(&user_type_raw)?;

    let mut dir = SqliteDirectory::new(conn);
    let roll = auth::request_reset(&mut dir, user_type, &username).map_err(from_auth)?;
    Ok(json!({ "roll": roll, "resetState": "requested" }))
}

fn change_password(
    conn: &Connection,
    principal: &Principal,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let new_password = get_required_str(params, "newPassword")?;
    let confirm_password = get_required_str(params, "confirmPassword")?;

    let mut dir = SqliteDirectory::new(conn);
    auth::change_password(&mut dir, principal, &new_password, &confirm_password)
        .map_err(from_auth)?;
    Ok(json!({ "ok": true }))
}

fn approve_reset(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let roll = get_required_str(params, "roll")?.trim().to_ascii_uppercase();
    let mut dir = SqliteDirectory::new(conn);
    let default_password = auth::approve_reset(&mut dir, &roll).map_err(from_auth)?;
    Ok(json!({
        "roll": roll,
        "resetState": "approved",
        "defaultPassword": default_password
    }))
}

fn reset_requests(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let dir = SqliteDirectory::new(conn);
    let rows = dir.students_with_reset_requested().map_err(|e| HandlerErr {
        code: e.code,
        message: e.message,
        details: None,
    })?;
    let requests: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(roll, name)| json!({ "roll": roll, "name": name }))
        .collect();
    Ok(json!({ "requests": requests }))
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match login(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_forgot_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match forgot_password(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let principal = match require_token(conn, req) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    match change_password(conn, &principal, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_approve_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = require_staff(conn, req) {
        return resp;
    }
    match approve_reset(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_reset_requests(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(resp) = require_staff(conn, req) {
        return resp;
    }
    match reset_requests(conn) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.forgotPassword" => Some(handle_forgot_password(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        "auth.approveReset" => Some(handle_approve_reset(state, req)),
        "auth.resetRequests" => Some(handle_reset_requests(state, req)),
        _ => None,
    }
}
