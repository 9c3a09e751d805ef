use chrono::{DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveTime, Utc};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Half-up rounding to a whole percent.
fn round_percent(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Half-up rounding to one decimal: `floor(10x + 0.5) / 10`.
fn round_score_1dp(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StatsError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DashboardScope {
    pub class_id: Option<String>,
    pub subject: Option<String>,
}

pub fn parse_dashboard_scope(
    raw: Option<&serde_json::Value>,
) -> Result<DashboardScope, StatsError> {
    let Some(raw) = raw else {
        return Ok(DashboardScope::default());
    };
    let Some(obj) = raw.as_object() else {
        return Err(StatsError::new("bad_params", "params must be an object"));
    };

    let class_id = match obj.get("classId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(StatsError::new(
                    "bad_params",
                    "classId must be string or null",
                ));
            };
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
    };

    let subject = match obj.get("subject") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(StatsError::new(
                    "bad_params",
                    "subject must be string or null",
                ));
            };
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
    };

    Ok(DashboardScope { class_id, subject })
}

/// Reference clock for one aggregation run. Deadline windows anchor on the
/// UTC calendar day of `now_utc`; birthday windows and the today-tally anchor
/// on `today_local`.
#[derive(Debug, Clone, Copy)]
pub struct AsOf {
    pub now_utc: DateTime<Utc>,
    pub today_local: NaiveDate,
}

impl AsOf {
    pub fn current() -> Self {
        Self {
            now_utc: Utc::now(),
            today_local: Local::now().date_naive(),
        }
    }

    /// Pins the clock to a caller-supplied instant. The instant's own UTC
    /// offset decides which calendar day counts as "today".
    pub fn at(instant: DateTime<FixedOffset>) -> Self {
        Self {
            now_utc: instant.with_timezone(&Utc),
            today_local: instant.date_naive(),
        }
    }
}

/// Per-record anomalies dropped from individual metrics during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRecords {
    pub bad_attendance_dates: u64,
    pub duplicate_today_entries: u64,
    pub unknown_statuses: u64,
    pub invalid_scores: u64,
    pub nonpositive_max_scores: u64,
    pub marks_without_student: u64,
    pub bad_due_dates: u64,
    pub bad_birth_dates: u64,
    pub bad_created_timestamps: u64,
}

impl SkippedRecords {
    pub fn total(&self) -> u64 {
        self.bad_attendance_dates
            + self.duplicate_today_entries
            + self.unknown_statuses
            + self.invalid_scores
            + self.nonpositive_max_scores
            + self.marks_without_student
            + self.bad_due_dates
            + self.bad_birth_dates
            + self.bad_created_timestamps
    }
}

#[derive(Debug, Clone)]
pub struct StatsContext<'a> {
    pub conn: &'a Connection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodaysAttendance {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceFlag {
    pub name: String,
    pub photograph: Option<String>,
    pub percentage: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBadge {
    pub name: String,
    pub photograph: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BirthdayEntry {
    pub name: String,
    pub photograph: Option<String>,
    pub date_of_birth: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: String,
    pub average: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub label: String,
    pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRecord {
    pub student_id: String,
    pub student_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRecord {
    pub id: String,
    pub classroom_id: String,
    pub name: String,
    pub subject: String,
    pub max_score: f64,
    pub due_date: Option<String>,
    pub created_at: String,
    pub marks: Vec<MarkRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub classroom_id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: String,
    pub image_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_classrooms: i64,
    pub total_students: i64,
    pub average_attendance: i64,
    pub low_attendance_students: Vec<AttendanceFlag>,
    pub low_performance_students: Vec<StudentBadge>,
    pub high_performers_list: Vec<StudentBadge>,
    pub recent_activities: Vec<ActivityRecord>,
    pub todays_attendance: TodaysAttendance,
    pub upcoming_birthdays: Vec<BirthdayEntry>,
    pub upcoming_deadlines: Vec<AssignmentRecord>,
    pub subject_averages: Vec<SubjectAverage>,
    pub performance_trend: Vec<TrendPoint>,
}

#[derive(Debug, Clone)]
pub struct DashboardComputation {
    pub stats: DashboardStats,
    pub skipped: SkippedRecords,
}

#[derive(Debug, Clone, PartialEq)]
struct AttendanceEntry {
    date: String,
    status: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ScopeStudent {
    id: String,
    name: String,
    date_of_birth: Option<String>,
    photograph: Option<String>,
    attendance: Vec<AttendanceEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct ScopeAssignment {
    id: String,
    classroom_id: String,
    name: String,
    subject: String,
    max_score: f64,
    due_date: Option<String>,
    created_at: String,
    marks: Vec<MarkRecord>,
}

#[derive(Debug, Clone)]
struct AttendanceSummary {
    average: i64,
    low: Vec<AttendanceFlag>,
}

#[derive(Debug, Clone)]
struct PerformanceLists {
    high: Vec<StudentBadge>,
    low: Vec<StudentBadge>,
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Bare dates are read as UTC midnight.
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN).and_utc());
    }
    None
}

fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    parse_instant(raw).map(|dt| dt.date_naive())
}

/// Maps a birth date onto a given year. Feb 29 lands on Mar 1 in years
/// without one.
fn birthday_in_year(birth: NaiveDate, year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, birth.month(), birth.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
}

fn mark_percentage(score: f64, max_score: f64) -> Option<f64> {
    if max_score <= 0.0 {
        return None;
    }
    if !score.is_finite() || score < 0.0 {
        return None;
    }
    Some(score / max_score * 100.0)
}

fn count_mark_anomalies(assignments: &[ScopeAssignment], skipped: &mut SkippedRecords) {
    for a in assignments {
        if a.max_score <= 0.0 {
            skipped.nonpositive_max_scores += 1;
            continue;
        }
        for m in &a.marks {
            if !m.score.is_finite() || m.score < 0.0 {
                skipped.invalid_scores += 1;
            }
        }
    }
}

fn attendance_summary(students: &[ScopeStudent]) -> AttendanceSummary {
    let mut percent_sum = 0.0_f64;
    let mut counted = 0_usize;
    let mut low: Vec<AttendanceFlag> = Vec::new();

    for s in students {
        if s.attendance.is_empty() {
            continue;
        }
        let present = s
            .attendance
            .iter()
            .filter(|e| e.status == "Present" || e.status == "Late")
            .count();
        let percentage = present as f64 / s.attendance.len() as f64 * 100.0;
        percent_sum += percentage;
        counted += 1;
        // The band check and the running average use the unrounded ratio;
        // entries carry the rounded figure.
        if percentage < 80.0 {
            low.push(AttendanceFlag {
                name: s.name.clone(),
                photograph: s.photograph.clone(),
                percentage: round_percent(percentage),
            });
        }
    }

    let average = if counted > 0 {
        round_percent(percent_sum / counted as f64)
    } else {
        0
    };
    low.truncate(5);
    AttendanceSummary { average, low }
}

fn todays_tally(
    students: &[ScopeStudent],
    today: NaiveDate,
    skipped: &mut SkippedRecords,
) -> TodaysAttendance {
    let mut tally = TodaysAttendance {
        present: 0,
        absent: 0,
        late: 0,
    };

    for s in students {
        let mut first_today: Option<&str> = None;
        for e in &s.attendance {
            let Some(day) = parse_calendar_date(&e.date) else {
                skipped.bad_attendance_dates += 1;
                continue;
            };
            if day != today {
                continue;
            }
            // First entry for the day wins; later same-day entries are
            // counted as duplicates.
            if first_today.is_some() {
                skipped.duplicate_today_entries += 1;
                continue;
            }
            first_today = Some(e.status.as_str());
        }
        match first_today {
            Some("Present") => tally.present += 1,
            Some("Absent") => tally.absent += 1,
            Some("Late") => tally.late += 1,
            Some(_) => skipped.unknown_statuses += 1,
            None => {}
        }
    }

    tally
}

fn performance_lists(
    students: &[ScopeStudent],
    assignments: &[ScopeAssignment],
    skipped: &mut SkippedRecords,
) -> PerformanceLists {
    let in_scope: HashSet<&str> = students.iter().map(|s| s.id.as_str()).collect();
    let mut bands: HashMap<&str, (u32, u32)> = HashMap::new();

    for a in assignments {
        for m in &a.marks {
            let Some(percentage) = mark_percentage(m.score, a.max_score) else {
                continue;
            };
            if !in_scope.contains(m.student_id.as_str()) {
                skipped.marks_without_student += 1;
                continue;
            }
            let entry = bands.entry(m.student_id.as_str()).or_insert((0, 0));
            if percentage > 80.0 {
                entry.0 += 1;
            } else if percentage < 35.0 {
                entry.1 += 1;
            }
        }
    }

    let mut high: Vec<StudentBadge> = Vec::new();
    let mut low: Vec<StudentBadge> = Vec::new();
    for s in students {
        let Some(&(high_scores, low_scores)) = bands.get(s.id.as_str()) else {
            continue;
        };
        if high_scores >= 3 {
            high.push(StudentBadge {
                name: s.name.clone(),
                photograph: s.photograph.clone(),
            });
        }
        if low_scores >= 2 {
            low.push(StudentBadge {
                name: s.name.clone(),
                photograph: s.photograph.clone(),
            });
        }
    }
    high.truncate(5);
    low.truncate(5);
    PerformanceLists { high, low }
}

fn subject_averages(assignments: &[ScopeAssignment]) -> Vec<SubjectAverage> {
    // Buckets keep first-appearance order; each assignment with marks
    // contributes its own mean as one data point.
    let mut buckets: Vec<(String, f64, u32)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for a in assignments {
        let subject = if a.subject.is_empty() {
            "General".to_string()
        } else {
            a.subject.clone()
        };
        let slot = match index.get(&subject) {
            Some(&i) => i,
            None => {
                buckets.push((subject.clone(), 0.0, 0));
                index.insert(subject, buckets.len() - 1);
                buckets.len() - 1
            }
        };

        let mut sum = 0.0_f64;
        let mut n = 0_u32;
        for m in &a.marks {
            if let Some(percentage) = mark_percentage(m.score, a.max_score) {
                sum += percentage;
                n += 1;
            }
        }
        if n > 0 {
            buckets[slot].1 += sum / n as f64;
            buckets[slot].2 += 1;
        }
    }

    buckets
        .into_iter()
        .map(|(subject, total, count)| SubjectAverage {
            subject,
            average: if count > 0 {
                round_percent(total / count as f64)
            } else {
                0
            },
        })
        .collect()
}

fn upcoming_deadlines(
    assignments: &[ScopeAssignment],
    now_utc: DateTime<Utc>,
    skipped: &mut SkippedRecords,
) -> Vec<AssignmentRecord> {
    let window_start = now_utc.date_naive().and_time(NaiveTime::MIN).and_utc();
    let window_end = window_start + Duration::days(7);

    let mut hits: Vec<(DateTime<Utc>, &ScopeAssignment)> = Vec::new();
    for a in assignments {
        let Some(raw) = a.due_date.as_deref() else {
            continue;
        };
        let Some(due) = parse_instant(raw) else {
            skipped.bad_due_dates += 1;
            continue;
        };
        if due >= window_start && due < window_end {
            hits.push((due, a));
        }
    }
    hits.sort_by(|a, b| a.0.cmp(&b.0));
    hits.truncate(3);
    hits.into_iter().map(|(_, a)| assignment_record(a)).collect()
}

fn upcoming_birthdays(
    students: &[ScopeStudent],
    today: NaiveDate,
    skipped: &mut SkippedRecords,
) -> Vec<BirthdayEntry> {
    let window_end = today + Duration::days(7);

    let mut hits: Vec<(NaiveDate, &ScopeStudent)> = Vec::new();
    for s in students {
        let Some(raw) = s.date_of_birth.as_deref() else {
            continue;
        };
        let Some(birth) = parse_calendar_date(raw) else {
            skipped.bad_birth_dates += 1;
            continue;
        };
        let Some(this_year) = birthday_in_year(birth, today.year()) else {
            continue;
        };
        if this_year >= today && this_year < window_end {
            hits.push((this_year, s));
        }
    }
    hits.sort_by(|a, b| a.0.cmp(&b.0));
    hits.truncate(5);
    hits.into_iter()
        .map(|(_, s)| BirthdayEntry {
            name: s.name.clone(),
            photograph: s.photograph.clone(),
            date_of_birth: s.date_of_birth.clone().unwrap_or_default(),
        })
        .collect()
}

fn performance_trend(
    assignments: &[ScopeAssignment],
    skipped: &mut SkippedRecords,
) -> Vec<TrendPoint> {
    // Every mark is one data point, bucketed by the ISO week of its
    // assignment's creation instant.
    let mut buckets: HashMap<(i32, u32), (f64, u32)> = HashMap::new();

    for a in assignments {
        if a.marks.is_empty() {
            continue;
        }
        let Some(created) = parse_instant(&a.created_at) else {
            skipped.bad_created_timestamps += 1;
            continue;
        };
        let week = created.date_naive().iso_week();
        let key = (week.year(), week.week());
        for m in &a.marks {
            let Some(percentage) = mark_percentage(m.score, a.max_score) else {
                continue;
            };
            let entry = buckets.entry(key).or_insert((0.0, 0));
            entry.0 += percentage;
            entry.1 += 1;
        }
    }

    let mut points: Vec<((i32, u32), (f64, u32))> = buckets.into_iter().collect();
    points.sort_by(|a, b| a.0.cmp(&b.0));
    points
        .into_iter()
        .map(|((_, week), (total, count))| TrendPoint {
            label: format!("Week {}", week),
            average_score: round_score_1dp(total / count as f64),
        })
        .collect()
}

fn assignment_record(a: &ScopeAssignment) -> AssignmentRecord {
    AssignmentRecord {
        id: a.id.clone(),
        classroom_id: a.classroom_id.clone(),
        name: a.name.clone(),
        subject: a.subject.clone(),
        max_score: a.max_score,
        due_date: a.due_date.clone(),
        created_at: a.created_at.clone(),
        marks: a.marks.clone(),
    }
}

fn load_students(
    conn: &Connection,
    scope: &DashboardScope,
) -> Result<Vec<ScopeStudent>, StatsError> {
    let mut sql =
        String::from("SELECT id, name, date_of_birth, photograph FROM students");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = &scope.class_id {
        sql.push_str(" WHERE classroom_id = ?");
        binds.push(Value::Text(cid.clone()));
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let mut students: Vec<ScopeStudent> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ScopeStudent {
                id: r.get(0)?,
                name: r.get(1)?,
                date_of_birth: r.get(2)?,
                photograph: r.get(3)?,
                attendance: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    if students.is_empty() {
        return Ok(students);
    }

    let index: HashMap<String, usize> = students
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    let mut sql = String::from(
        "SELECT a.student_id, a.date, a.status
         FROM attendance_entries a",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = &scope.class_id {
        sql.push_str(
            " JOIN students s ON s.id = a.student_id
              WHERE s.classroom_id = ?",
        );
        binds.push(Value::Text(cid.clone()));
    }
    sql.push_str(" ORDER BY a.rowid");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let student_id: String = r.get(0)?;
            Ok((
                student_id,
                AttendanceEntry {
                    date: r.get(1)?,
                    status: r.get(2)?,
                },
            ))
        })
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    for row in rows {
        let (student_id, entry) =
            row.map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
        if let Some(&i) = index.get(&student_id) {
            students[i].attendance.push(entry);
        }
    }

    Ok(students)
}

fn load_assignments(
    conn: &Connection,
    scope: &DashboardScope,
) -> Result<Vec<ScopeAssignment>, StatsError> {
    let mut sql = String::from(
        "SELECT id, classroom_id, name, subject, max_score, due_date, created_at
         FROM assignments",
    );
    let mut conds: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = &scope.class_id {
        conds.push("classroom_id = ?");
        binds.push(Value::Text(cid.clone()));
    }
    if let Some(subject) = &scope.subject {
        conds.push("subject = ?");
        binds.push(Value::Text(subject.clone()));
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let mut assignments: Vec<ScopeAssignment> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ScopeAssignment {
                id: r.get(0)?,
                classroom_id: r.get(1)?,
                name: r.get(2)?,
                subject: r.get(3)?,
                max_score: r.get(4)?,
                due_date: r.get(5)?,
                created_at: r.get(6)?,
                marks: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    if assignments.is_empty() {
        return Ok(assignments);
    }

    let index: HashMap<String, usize> = assignments
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.clone(), i))
        .collect();

    let placeholders = std::iter::repeat("?")
        .take(assignments.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT assignment_id, student_id, student_name, score
         FROM marks
         WHERE assignment_id IN ({})
         ORDER BY rowid",
        placeholders
    );
    let binds: Vec<Value> = assignments
        .iter()
        .map(|a| Value::Text(a.id.clone()))
        .collect();

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            let assignment_id: String = r.get(0)?;
            Ok((
                assignment_id,
                MarkRecord {
                    student_id: r.get(1)?,
                    student_name: r.get(2)?,
                    score: r.get(3)?,
                },
            ))
        })
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    for row in rows {
        let (assignment_id, mark) =
            row.map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
        if let Some(&i) = index.get(&assignment_id) {
            assignments[i].marks.push(mark);
        }
    }

    Ok(assignments)
}

fn load_recent_activities(
    conn: &Connection,
    scope: &DashboardScope,
) -> Result<Vec<ActivityRecord>, StatsError> {
    let mut sql = String::from(
        "SELECT id, classroom_id, title, description, date, image_url FROM activities",
    );
    let mut binds: Vec<Value> = Vec::new();
    if let Some(cid) = &scope.class_id {
        sql.push_str(" WHERE classroom_id = ?");
        binds.push(Value::Text(cid.clone()));
    }
    sql.push_str(" ORDER BY date DESC, rowid DESC LIMIT 5");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;
    stmt.query_map(params_from_iter(binds), |r| {
        Ok(ActivityRecord {
            id: r.get(0)?,
            classroom_id: r.get(1)?,
            title: r.get(2)?,
            description: r.get(3)?,
            date: r.get(4)?,
            image_url: r.get(5)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| StatsError::new("db_query_failed", e.to_string()))
}

pub fn compute_dashboard_stats(
    ctx: &StatsContext<'_>,
    scope: &DashboardScope,
    as_of: &AsOf,
) -> Result<DashboardComputation, StatsError> {
    let conn = ctx.conn;
    let mut skipped = SkippedRecords::default();

    // The classroom count stays global even when a class filter is set.
    let total_classrooms: i64 = conn
        .query_row("SELECT COUNT(*) FROM classrooms", [], |r| r.get(0))
        .map_err(|e| StatsError::new("db_query_failed", e.to_string()))?;

    let mut students = load_students(conn, scope)?;
    let assignments = load_assignments(conn, scope)?;

    // A subject filter narrows assignments first; the student set then keeps
    // only students holding a mark in one of the filtered assignments.
    if scope.subject.is_some() {
        let with_marks: HashSet<String> = assignments
            .iter()
            .flat_map(|a| a.marks.iter().map(|m| m.student_id.clone()))
            .collect();
        students.retain(|s| with_marks.contains(&s.id));
    }

    count_mark_anomalies(&assignments, &mut skipped);

    let summary = attendance_summary(&students);
    let today = todays_tally(&students, as_of.today_local, &mut skipped);
    let performance = performance_lists(&students, &assignments, &mut skipped);
    let subjects = subject_averages(&assignments);
    let deadlines = upcoming_deadlines(&assignments, as_of.now_utc, &mut skipped);
    let birthdays = upcoming_birthdays(&students, as_of.today_local, &mut skipped);
    let trend = performance_trend(&assignments, &mut skipped);
    let activities = load_recent_activities(conn, scope)?;

    Ok(DashboardComputation {
        stats: DashboardStats {
            total_classrooms,
            total_students: students.len() as i64,
            average_attendance: summary.average,
            low_attendance_students: summary.low,
            low_performance_students: performance.low,
            high_performers_list: performance.high,
            recent_activities: activities,
            todays_attendance: today,
            upcoming_birthdays: birthdays,
            upcoming_deadlines: deadlines,
            subject_averages: subjects,
            performance_trend: trend,
        },
        skipped,
    })
}
