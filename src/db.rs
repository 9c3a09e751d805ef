use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("classhub.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            date_of_birth TEXT,
            address TEXT,
            father_name TEXT,
            father_contact TEXT,
            mother_name TEXT,
            mother_contact TEXT,
            observation TEXT,
            badges TEXT NOT NULL DEFAULT '[]',
            photograph TEXT,
            created_at TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_classroom ON students(classroom_id)",
        [],
    )?;

    // Early workspaces predate the observation column. Add it if needed.
    ensure_students_observation(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            student_id TEXT NOT NULL,
            date TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(student_id, date),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_date ON attendance_entries(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            name TEXT NOT NULL,
            subject TEXT NOT NULL,
            max_score REAL NOT NULL,
            due_date TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    ensure_assignments_due_date(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_classroom ON assignments(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_classroom_created ON assignments(classroom_id, created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            student_name TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(assignment_id, student_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_assignment ON marks(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS activities(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            date TEXT NOT NULL,
            image_url TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_classroom ON activities(classroom_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_activities_classroom_date ON activities(classroom_id, date)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_observation(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "observation")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN observation TEXT", [])?;
    Ok(())
}

fn ensure_assignments_due_date(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assignments", "due_date")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assignments ADD COLUMN due_date TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
