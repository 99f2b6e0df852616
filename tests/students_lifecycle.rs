use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_srmsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn srmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn assert_ok(resp: &serde_json::Value) {
    assert_eq!(
        resp.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response, got {}",
        resp
    );
}

fn staff_token(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let resp = request(
        stdin,
        reader,
        "staff-login",
        "auth.login",
        json!({
            "userType": "staff",
            "username": "ADMIN",
            "password": "ADMIN@1234"
        }),
    );
    resp.get("result")
        .and_then(|v| v.get("token"))
        .and_then(|v| v.as_str())
        .expect("staff token")
        .to_string()
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, path: &PathBuf) {
    let resp = request(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": path.to_string_lossy() }),
    );
    assert_ok(&resp);
}

/// Roll whose enrollment digits put the student in `declared_year` today.
fn roll_for_year(declared_year: i64, dept_code: &str, serial: &str) -> String {
    let yy: i64 = chrono::Local::now()
        .format("%y")
        .to_string()
        .parse()
        .expect("two-digit year");
    let enroll = (yy - declared_year + 1).rem_euclid(100);
    format!("{:02}0823{}{}", enroll, dept_code, serial)
}

/// Semester the daemon should derive for an active student in `declared_year`.
fn expected_semester(declared_year: i64) -> i64 {
    use chrono::Datelike;
    if chrono::Local::now().month() >= 9 {
        declared_year * 2 - 1
    } else {
        declared_year * 2
    }
}

#[test]
fn create_returns_derived_defaults_and_get_shows_full_record() {
    let workspace = temp_dir("srms-students-create");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);

    let roll = roll_for_year(2, "104", "041");
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "rahul sharma",
            "deptCode": "104",
            "year": "2",
            "dob": "2005-11-30",
            "gender": "Male"
        }),
    );
    assert_ok(&resp);
    let result = resp.get("result").expect("result");
    assert_eq!(
        result.get("roll").and_then(|v| v.as_str()),
        Some(roll.as_str())
    );
    assert_eq!(
        result.get("currentSemester").and_then(|v| v.as_i64()),
        Some(expected_semester(2))
    );
    assert_eq!(
        result.get("defaultPassword").and_then(|v| v.as_str()),
        Some("104@1234")
    );
    assert_eq!(
        result.get("parentUsername").and_then(|v| v.as_str()),
        Some("parent@041")
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.get",
        json!({ "token": token, "roll": roll }),
    );
    assert_ok(&resp);
    let student = resp
        .get("result")
        .and_then(|v| v.get("student"))
        .expect("student object");
    assert_eq!(
        student.get("name").and_then(|v| v.as_str()),
        Some("RAHUL SHARMA")
    );
    assert_eq!(student.get("deptCode").and_then(|v| v.as_str()), Some("104"));
    assert_eq!(
        student.get("deptName").and_then(|v| v.as_str()),
        Some("Electronics & Comm. (ECE)")
    );
    assert_eq!(student.get("year").and_then(|v| v.as_str()), Some("2"));
    assert_eq!(
        student.get("dob").and_then(|v| v.as_str()),
        Some("2005-11-30")
    );
    assert_eq!(student.get("gender").and_then(|v| v.as_str()), Some("Male"));
    assert_eq!(
        student.get("resetState").and_then(|v| v.as_str()),
        Some("none")
    );

    let attendance = resp
        .get("result")
        .and_then(|v| v.get("attendance"))
        .expect("attendance object");
    assert_eq!(
        attendance.get("totalDays").and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(
        attendance.get("daysPresent").and_then(|v| v.as_i64()),
        Some(0)
    );
    assert_eq!(attendance.get("percent").and_then(|v| v.as_f64()), Some(0.0));

    // Eight seeded semester slots, every component still unset.
    let marks = resp
        .get("result")
        .and_then(|v| v.get("marks"))
        .and_then(|v| v.as_object())
        .expect("marks object");
    assert_eq!(marks.len(), 8);
    for sem in ["sem1", "sem2", "sem3", "sem4", "sem5", "sem6", "sem7", "sem8"] {
        let slot = marks.get(sem).expect("semester slot");
        assert!(slot.get("int1").map(|v| v.is_null()).unwrap_or(false));
        assert!(slot.get("semFinal").map(|v| v.is_null()).unwrap_or(false));
    }

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.list",
        json!({ "token": token }),
    );
    assert_ok(&resp);
    let students = resp
        .get("result")
        .and_then(|v| v.get("students"))
        .and_then(|v| v.as_array())
        .expect("students array");
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("roll").and_then(|v| v.as_str()),
        Some(roll.as_str())
    );
    assert!(students[0].get("attendance").is_some());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn create_rejects_bad_rolls_names_years_and_duplicates() {
    let workspace = temp_dir("srms-students-validate");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);

    let roll = roll_for_year(1, "101", "042");
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "First Entry",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_ok(&resp);

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "Second Entry",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "conflict");

    // Roll digits 7-9 carry the department; the dropdown must agree.
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({
            "token": token,
            "roll": roll_for_year(1, "104", "043"),
            "name": "Wrong Dept",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "token": token,
            "roll": "25082310104",
            "name": "Short Roll",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "token": token,
            "roll": "25O823101044",
            "name": "Letter Roll",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "token": token,
            "roll": roll_for_year(1, "101", "045"),
            "name": "X",
            "deptCode": "101",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    // Fresh enrollment cannot already sit in fourth year.
    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({
            "token": token,
            "roll": roll_for_year(1, "101", "046"),
            "name": "Too Senior",
            "deptCode": "101",
            "year": "4"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "token": token,
            "roll": roll_for_year(1, "101", "047"),
            "name": "Bad Year",
            "deptCode": "101",
            "year": "7"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({
            "token": token,
            "roll": "250823999048",
            "name": "No Such Dept",
            "deptCode": "999",
            "year": "1"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "students.create",
        json!({
            "token": token,
            "roll": roll_for_year(1, "101", "049"),
            "name": "Bad Birthday",
            "deptCode": "101",
            "year": "1",
            "dob": "30-11-2005"
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn passed_out_students_sit_at_semester_eight() {
    let workspace = temp_dir("srms-students-passedout");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);

    let roll = roll_for_year(6, "100", "051");
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "Alumni Record",
            "deptCode": "100",
            "year": "Passed Out"
        }),
    );
    assert_ok(&resp);
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("currentSemester"))
            .and_then(|v| v.as_i64()),
        Some(8)
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.get",
        json!({ "token": token, "roll": roll }),
    );
    let student = resp
        .get("result")
        .and_then(|v| v.get("student"))
        .expect("student object");
    assert_eq!(
        student.get("year").and_then(|v| v.as_str()),
        Some("Passed Out")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn update_patches_revalidate_and_recompute_semester() {
    let workspace = temp_dir("srms-students-update");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);

    let roll = roll_for_year(3, "103", "061");
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "Original Name",
            "deptCode": "103",
            "year": "3",
            "gender": "Female"
        }),
    );
    assert_ok(&resp);

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "name": "renamed person" } }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "students.get",
        json!({ "token": token, "roll": roll }),
    );
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("student"))
            .and_then(|v| v.get("name"))
            .and_then(|v| v.as_str()),
        Some("RENAMED PERSON")
    );

    // Moving down a year is allowed and re-derives the semester.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "year": "2" } }),
    );
    assert_ok(&resp);
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("currentSemester"))
            .and_then(|v| v.as_i64()),
        Some(expected_semester(2))
    );

    // Claiming a year beyond what the enrollment digits allow is not.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "year": "4" } }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "year": "Passed Out" } }),
    );
    assert_ok(&resp);
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("currentSemester"))
            .and_then(|v| v.as_i64()),
        Some(8)
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "gender": null } }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.get",
        json!({ "token": token, "roll": roll }),
    );
    assert!(resp
        .get("result")
        .and_then(|v| v.get("student"))
        .and_then(|v| v.get("gender"))
        .map(|v| v.is_null())
        .unwrap_or(false));

    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "dob": "2004-02-29" } }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "dob": "2005-02-29" } }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "11",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "deptCode": "101" } }),
    );
    assert_eq!(error_code(&resp), "validation_failed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "12",
        "students.update",
        json!({ "token": token, "roll": roll, "patch": { "rollNo": "nope" } }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "13",
        "students.update",
        json!({ "token": token, "roll": roll }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "14",
        "students.update",
        json!({ "token": token, "roll": "990823103999", "patch": { "name": "Ghost" } }),
    );
    assert_eq!(error_code(&resp), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn delete_removes_student_and_dependent_rows() {
    let workspace = temp_dir("srms-students-delete");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);

    let roll = roll_for_year(2, "102", "071");
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "To Be Removed",
            "deptCode": "102",
            "year": "2"
        }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.update",
        json!({ "token": token, "roll": roll, "totalDays": 10, "daysPresent": 8 }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "marks.update",
        json!({
            "token": token,
            "roll": roll,
            "semester": "sem3",
            "marks": { "int1": 55, "semFinal": 60 }
        }),
    );
    assert_ok(&resp);

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.delete",
        json!({ "token": token, "roll": roll }),
    );
    assert_ok(&resp);
    assert_eq!(
        resp.get("result")
            .and_then(|v| v.get("roll"))
            .and_then(|v| v.as_str()),
        Some(roll.as_str())
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.get",
        json!({ "token": token, "roll": roll }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "token": token, "roll": roll }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "token": token }),
    );
    let students = resp
        .get("result")
        .and_then(|v| v.get("students"))
        .and_then(|v| v.as_array())
        .expect("students array");
    assert!(students.is_empty());

    // Dependent rows really went away, so the roll can be reused.
    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": "Fresh Start",
            "deptCode": "102",
            "year": "2"
        }),
    );
    assert_ok(&resp);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
