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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    roll: &str,
    name: &str,
) {
    let resp = request(
        stdin,
        reader,
        "create",
        "students.create",
        json!({
            "token": token,
            "roll": roll,
            "name": name,
            "deptCode": "100",
            "year": "2"
        }),
    );
    assert_ok(&resp);
}

fn set_marks(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    roll: &str,
    semester: &str,
    marks: serde_json::Value,
) {
    let resp = request(
        stdin,
        reader,
        "marks",
        "marks.update",
        json!({ "token": token, "roll": roll, "semester": semester, "marks": marks }),
    );
    assert_ok(&resp);
}

#[test]
fn report_lines_and_latest_summary() {
    let workspace = temp_dir("srms-report-lines");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);
    let roll = roll_for_year(2, "100", "095");
    create_student(&mut stdin, &mut reader, &token, &roll, "Report Subject");

    set_marks(
        &mut stdin,
        &mut reader,
        &token,
        &roll,
        "sem1",
        json!({
            "int1": 90,
            "int2": 80,
            "model": 70,
            "semFinal": 80,
            "assignment": 8,
            "miniProject": 4,
            "rmkNextGen": 9
        }),
    );
    set_marks(
        &mut stdin,
        &mut reader,
        &token,
        &roll,
        "sem2",
        json!({ "int1": 40, "int2": 50, "model": 60, "semFinal": 30, "assignment": 2 }),
    );
    // Internals only: the composite stays open until finals land.
    set_marks(
        &mut stdin,
        &mut reader,
        &token,
        &roll,
        "sem3",
        json!({ "int2": 70 }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "a1",
        "attendance.update",
        json!({ "token": token, "roll": roll, "totalDays": 120, "daysPresent": 100 }),
    );
    assert_ok(&resp);

    let resp = request(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.studentReport",
        json!({ "token": token, "roll": roll }),
    );
    assert_ok(&resp);
    let result = resp.get("result").expect("result");

    assert_eq!(
        result
            .get("student")
            .and_then(|v| v.get("roll"))
            .and_then(|v| v.as_str()),
        Some(roll.as_str())
    );

    let attendance = result.get("attendance").expect("attendance object");
    assert_eq!(
        attendance.get("totalDays").and_then(|v| v.as_i64()),
        Some(120)
    );
    assert_eq!(
        attendance.get("daysPresent").and_then(|v| v.as_i64()),
        Some(100)
    );
    assert_eq!(
        attendance.get("percent").and_then(|v| v.as_f64()),
        Some(83.33)
    );

    let semesters = result
        .get("semesters")
        .and_then(|v| v.as_array())
        .expect("semesters array");
    assert_eq!(semesters.len(), 8);
    assert_eq!(
        semesters[0].get("semester").and_then(|v| v.as_str()),
        Some("sem1")
    );
    assert_eq!(
        semesters[7].get("semester").and_then(|v| v.as_str()),
        Some("sem8")
    );

    let sem1 = &semesters[0];
    assert_eq!(
        sem1.get("internalAverage").and_then(|v| v.as_f64()),
        Some(80.0)
    );
    assert_eq!(sem1.get("activityTotal").and_then(|v| v.as_i64()), Some(21));
    assert_eq!(sem1.get("semFinal").and_then(|v| v.as_i64()), Some(80));
    assert_eq!(sem1.get("score").and_then(|v| v.as_f64()), Some(81.0));
    assert_eq!(sem1.get("passed").and_then(|v| v.as_bool()), Some(true));

    let sem2 = &semesters[1];
    assert_eq!(sem2.get("score").and_then(|v| v.as_f64()), Some(29.5));
    assert_eq!(sem2.get("passed").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(sem2.get("activityTotal").and_then(|v| v.as_i64()), Some(2));

    let sem3 = &semesters[2];
    assert_eq!(
        sem3.get("internalAverage").and_then(|v| v.as_f64()),
        Some(23.33)
    );
    assert!(sem3.get("activityTotal").map(|v| v.is_null()).unwrap_or(false));
    assert!(sem3.get("semFinal").map(|v| v.is_null()).unwrap_or(false));
    assert!(sem3.get("score").map(|v| v.is_null()).unwrap_or(false));
    assert!(sem3.get("passed").map(|v| v.is_null()).unwrap_or(false));

    let sem4 = &semesters[3];
    assert!(sem4
        .get("internalAverage")
        .map(|v| v.is_null())
        .unwrap_or(false));

    // sem3 has marks but no final, so sem2 carries the badge.
    let latest = result.get("latest").expect("latest summary");
    assert_eq!(
        latest.get("semester").and_then(|v| v.as_str()),
        Some("sem2")
    );
    assert_eq!(latest.get("score").and_then(|v| v.as_f64()), Some(29.5));
    assert_eq!(latest.get("passed").and_then(|v| v.as_bool()), Some(false));

    assert!(result
        .get("generatedAt")
        .and_then(|v| v.as_str())
        .map(|s| s.ends_with('Z'))
        .unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn fresh_student_report_falls_back_to_first_semester() {
    let workspace = temp_dir("srms-report-fresh");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let token = staff_token(&mut stdin, &mut reader);
    let roll = roll_for_year(2, "100", "096");
    create_student(&mut stdin, &mut reader, &token, &roll, "Blank Slate");

    let resp = request(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.studentReport",
        json!({ "token": token, "roll": roll }),
    );
    assert_ok(&resp);
    let result = resp.get("result").expect("result");
    let latest = result.get("latest").expect("latest summary");
    assert_eq!(
        latest.get("semester").and_then(|v| v.as_str()),
        Some("sem1")
    );
    assert!(latest.get("score").map(|v| v.is_null()).unwrap_or(false));
    assert!(latest.get("passed").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        result
            .get("attendance")
            .and_then(|v| v.get("percent"))
            .and_then(|v| v.as_f64()),
        Some(0.0)
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "r2",
        "reports.studentReport",
        json!({ "token": token, "roll": "990823100999" }),
    );
    assert_eq!(error_code(&resp), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn report_access_is_scoped_to_the_caller() {
    let workspace = temp_dir("srms-report-scope");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let staff = staff_token(&mut stdin, &mut reader);

    let own = roll_for_year(2, "100", "097");
    let other = roll_for_year(2, "100", "098");
    create_student(&mut stdin, &mut reader, &staff, &own, "Own Record");
    create_student(&mut stdin, &mut reader, &staff, &other, "Other Record");

    let resp = request(
        &mut stdin,
        &mut reader,
        "s1",
        "reports.studentReport",
        json!({ "token": staff, "roll": own }),
    );
    assert_ok(&resp);

    let resp = request(
        &mut stdin,
        &mut reader,
        "l1",
        "auth.login",
        json!({ "userType": "student", "username": own, "password": "100@1234" }),
    );
    let student = resp
        .get("result")
        .and_then(|v| v.get("token"))
        .and_then(|v| v.as_str())
        .expect("student token")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "s2",
        "reports.studentReport",
        json!({ "token": student, "roll": own }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "s3",
        "reports.studentReport",
        json!({ "token": student, "roll": other }),
    );
    assert_eq!(error_code(&resp), "forbidden");

    let resp = request(
        &mut stdin,
        &mut reader,
        "l2",
        "auth.login",
        json!({ "userType": "parent", "username": "parent@097", "password": "parent@0971234" }),
    );
    let parent = resp
        .get("result")
        .and_then(|v| v.get("token"))
        .and_then(|v| v.as_str())
        .expect("parent token")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "s4",
        "reports.studentReport",
        json!({ "token": parent, "roll": own }),
    );
    assert_ok(&resp);
    let resp = request(
        &mut stdin,
        &mut reader,
        "s5",
        "reports.studentReport",
        json!({ "token": parent, "roll": other }),
    );
    assert_eq!(error_code(&resp), "forbidden");

    let resp = request(
        &mut stdin,
        &mut reader,
        "s6",
        "reports.studentReport",
        json!({ "roll": own }),
    );
    assert_eq!(error_code(&resp), "auth_required");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
