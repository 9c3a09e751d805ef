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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_classhubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classhubd");
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .expect("error code")
}

#[test]
fn router_covers_the_full_method_surface() {
    let workspace = temp_dir("classhub-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
    assert!(health
        .get("workspacePath")
        .map(|v| v.is_null())
        .unwrap_or(false));

    // Listing classrooms is usable before a workspace exists; everything
    // else wants one.
    let empty = request_ok(&mut stdin, &mut reader, "2", "classrooms.list", json!({}));
    assert_eq!(
        empty
            .get("classrooms")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    let denied = request(&mut stdin, &mut reader, "3", "students.list", json!({}));
    assert_eq!(error_code(&denied), "no_workspace");
    let denied = request(&mut stdin, &mut reader, "4", "dashboard.stats", json!({}));
    assert_eq!(error_code(&denied), "no_workspace");

    let unknown = request(&mut stdin, &mut reader, "5", "planets.list", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected.get("workspacePath").and_then(|v| v.as_str()),
        Some(workspace.to_string_lossy().as_ref())
    );

    let bad = request(&mut stdin, &mut reader, "7", "classrooms.create", json!({}));
    assert_eq!(error_code(&bad), "bad_params");
    let bad = request(
        &mut stdin,
        &mut reader,
        "8",
        "classrooms.create",
        json!({ "name": "   " }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classrooms.create",
        json!({ "name": "Grade 5" }),
    );
    let classroom_id = created
        .get("classroomId")
        .and_then(|v| v.as_str())
        .expect("classroomId")
        .to_string();

    // Classroom names are unique.
    let dup = request(
        &mut stdin,
        &mut reader,
        "10",
        "classrooms.create",
        json!({ "name": "Grade 5" }),
    );
    assert_eq!(error_code(&dup), "db_insert_failed");

    let listed = request_ok(&mut stdin, &mut reader, "11", "classrooms.list", json!({}));
    let rooms = listed
        .get("classrooms")
        .and_then(|v| v.as_array())
        .expect("classrooms array");
    assert_eq!(rooms.len(), 1);
    assert_eq!(
        rooms[0].get("id").and_then(|v| v.as_str()),
        Some(classroom_id.as_str())
    );
    assert_eq!(rooms[0].get("name").and_then(|v| v.as_str()), Some("Grade 5"));
    assert_eq!(
        rooms[0].get("studentCount").and_then(|v| v.as_i64()),
        Some(0)
    );

    let missing = request(
        &mut stdin,
        &mut reader,
        "12",
        "classrooms.delete",
        json!({ "classroomId": "not-a-real-id" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "classrooms.delete",
        json!({ "classroomId": classroom_id }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "14", "classrooms.list", json!({}));
    assert_eq!(
        listed
            .get("classrooms")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_request_line_reports_bad_json_and_keeps_serving() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "this is not json").expect("write garbage line");
    stdin.flush().expect("flush garbage line");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("bad_json")
    );
    assert!(value.get("id").is_none());

    // The daemon stays up after a broken line.
    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health.get("version").and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );

    let _ = child.kill();
}

#[test]
fn classroom_delete_cascades_to_dependents() {
    let workspace = temp_dir("classhub-cascade");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let classroom_id = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classrooms.create",
        json!({ "name": "Grade 7" }),
    )
    .get("classroomId")
    .and_then(|v| v.as_str())
    .expect("classroomId")
    .to_string();

    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": classroom_id, "name": "Maya Ibekwe" }),
    )
    .get("studentId")
    .and_then(|v| v.as_str())
    .expect("studentId")
    .to_string();

    let assignment_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({
            "classId": classroom_id,
            "name": "Fractions Quiz",
            "subject": "Math",
            "maxScore": 20
        }),
    )
    .get("assignmentId")
    .and_then(|v| v.as_str())
    .expect("assignmentId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.setMarks",
        json!({
            "assignmentId": assignment_id,
            "marks": [{ "studentId": student_id, "studentName": "Maya Ibekwe", "score": 17 }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.saveBatch",
        json!({
            "records": [{ "studentId": student_id, "date": "2025-03-10", "status": "Present" }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "activities.create",
        json!({
            "classId": classroom_id,
            "title": "Science Fair",
            "date": "2025-03-08",
            "imageUrl": "https://example.com/fair.jpg"
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "classrooms.delete",
        json!({ "classroomId": classroom_id }),
    );

    let students = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));
    assert_eq!(
        students
            .get("students")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    let assignments = request_ok(&mut stdin, &mut reader, "10", "assignments.list", json!({}));
    assert_eq!(
        assignments
            .get("assignments")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    let activities = request_ok(&mut stdin, &mut reader, "11", "activities.list", json!({}));
    assert_eq!(
        activities
            .get("activities")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
