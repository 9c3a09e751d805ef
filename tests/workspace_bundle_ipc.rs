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

#[test]
fn exported_workspace_can_be_imported_elsewhere() {
    let workspace = temp_dir("classhub-bundle-ipc-src");
    let workspace2 = temp_dir("classhub-bundle-ipc-dst");
    let out_dir = temp_dir("classhub-bundle-ipc-out");
    let bundle_path = out_dir.join("grade8.chbackup.zip");

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
        json!({ "name": "Grade 8" }),
    )
    .get("classroomId")
    .and_then(|v| v.as_str())
    .expect("classroomId")
    .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": classroom_id, "name": "Tunde Alade" }),
    );

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_path.to_string_lossy() }),
    );
    assert_eq!(
        export.get("bundleFormat").and_then(|v| v.as_str()),
        Some("classhub-workspace-v1")
    );
    assert!(export
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .map(|s| s.len() == 64)
        .unwrap_or(false));

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace2.to_string_lossy(),
            "inPath": out_dir.join("nope.zip").to_string_lossy()
        }),
    );
    assert_eq!(missing.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        missing
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("not_found")
    );

    let import = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace2.to_string_lossy(),
            "inPath": bundle_path.to_string_lossy()
        }),
    );
    assert_eq!(
        import.get("workspacePath").and_then(|v| v.as_str()),
        Some(workspace2.to_string_lossy().as_ref())
    );
    assert_eq!(
        import.get("checksumVerified").and_then(|v| v.as_bool()),
        Some(true)
    );

    // The sidecar now serves the imported copy.
    let listed = request_ok(&mut stdin, &mut reader, "7", "classrooms.list", json!({}));
    let rooms = listed
        .get("classrooms")
        .and_then(|v| v.as_array())
        .expect("classrooms array");
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].get("name").and_then(|v| v.as_str()), Some("Grade 8"));
    assert_eq!(
        rooms[0].get("studentCount").and_then(|v| v.as_i64()),
        Some(1)
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(workspace2);
    let _ = std::fs::remove_dir_all(out_dir);
}
