use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Announcement, AnnouncementInput, Appeal, AppealDecision, AppealStatus, CalendarEvent,
    CalendarEventInput, NewAppeal, NewStudent, NewViolation, Notification, NotificationKind, Role,
    Rule, RuleInput, Student, StudentFilter, StudentUpdate, UserAccount, Violation,
};
use crate::status::{status_for, StudentStatus, Thresholds};

const THRESHOLDS_KEY: &str = "thresholds";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_col<T>(row: &PgRow, column: &str) -> AppResult<T>
where
    T: FromStr<Err = String>,
{
    row.get::<String, _>(column)
        .parse()
        .map_err(AppError::Internal)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn conflict_or(err: sqlx::Error, message: &str) -> AppError {
    if is_unique_violation(&err) {
        AppError::Conflict(message.to_string())
    } else {
        AppError::Database(err)
    }
}

// ---------------------------------------------------------------- seed

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let rules = vec![
        ("R-01", "Terlambat masuk kelas", "ringan", 5),
        ("R-02", "Tidak memakai seragam lengkap", "ringan", 5),
        ("R-03", "Merokok di area kampus", "sedang", 15),
        ("R-04", "Tidak hadir tanpa keterangan", "sedang", 10),
        ("R-05", "Merusak fasilitas kampus", "berat", 40),
        ("R-06", "Berkelahi di lingkungan kampus", "berat", 50),
    ];

    for (code, name, category, points) in rules {
        sqlx::query(
            r#"
            INSERT INTO discipline.rules (id, code, name, category, points)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code) DO UPDATE
            SET name = EXCLUDED.name, category = EXCLUDED.category, points = EXCLUDED.points
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(name)
        .bind(category)
        .bind(points)
        .execute(pool)
        .await?;
    }

    let students = vec![
        ("2301010001", "Dimas Pratama", "dimas.pratama@polgan.ac.id", "Manajemen Informatika"),
        ("2301020002", "Siti Rahmawati", "siti.rahmawati@polgan.ac.id", "Akuntansi"),
        ("2301030003", "Yohanes Sitorus", "yohanes.sitorus@polgan.ac.id", "Teknik Komputer"),
    ];

    for (nim, name, email, program) in students {
        sqlx::query(
            r#"
            INSERT INTO discipline.students (id, nim, full_name, email, program)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (nim) DO UPDATE
            SET full_name = EXCLUDED.full_name, program = EXCLUDED.program
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(nim)
        .bind(name)
        .bind(email)
        .bind(program)
        .execute(pool)
        .await?;
    }

    let events = vec![
        ("Ujian Tengah Semester", (2026, 10, 26), (2026, 11, 6), "ujian"),
        ("Libur Natal dan Tahun Baru", (2026, 12, 24), (2027, 1, 2), "libur"),
    ];

    for (title, start, end, category) in events {
        let starts_on = NaiveDate::from_ymd_opt(start.0, start.1, start.2)
            .ok_or_else(|| anyhow::anyhow!("invalid date"))?;
        let ends_on = NaiveDate::from_ymd_opt(end.0, end.1, end.2)
            .ok_or_else(|| anyhow::anyhow!("invalid date"))?;
        sqlx::query(
            r#"
            INSERT INTO discipline.calendar_events (id, title, starts_on, ends_on, location, category)
            SELECT $1, $2, $3, $4, 'Kampus Politeknik Ganesha Medan', $5
            WHERE NOT EXISTS (
                SELECT 1 FROM discipline.calendar_events WHERE title = $2 AND starts_on = $3
            )
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(title)
        .bind(starts_on)
        .bind(ends_on)
        .bind(category)
        .execute(pool)
        .await?;
    }

    Ok(())
}

// ---------------------------------------------------------------- users

fn user_from_row(row: &PgRow) -> AppResult<UserAccount> {
    Ok(UserAccount {
        uid: row.get("uid"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: parse_col(row, "role")?,
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    })
}

pub async fn create_user(
    pool: &PgPool,
    email: &str,
    password_hash: &str,
    role: Role,
    display_name: &str,
) -> AppResult<UserAccount> {
    let row = sqlx::query(
        r#"
        INSERT INTO discipline.users (uid, email, password_hash, role, display_name)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING uid, email, password_hash, role, display_name, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email.trim().to_lowercase())
    .bind(password_hash)
    .bind(role.as_str())
    .bind(display_name)
    .fetch_one(pool)
    .await
    .map_err(|e| conflict_or(e, "email already registered"))?;

    user_from_row(&row)
}

pub async fn find_user_by_email(pool: &PgPool, email: &str) -> AppResult<Option<UserAccount>> {
    let row = sqlx::query(
        "SELECT uid, email, password_hash, role, display_name, created_at \
         FROM discipline.users WHERE email = $1",
    )
    .bind(email.trim().to_lowercase())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(user_from_row).transpose()
}

pub async fn find_user(pool: &PgPool, uid: Uuid) -> AppResult<Option<UserAccount>> {
    let row = sqlx::query(
        "SELECT uid, email, password_hash, role, display_name, created_at \
         FROM discipline.users WHERE uid = $1",
    )
    .bind(uid)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(user_from_row).transpose()
}

pub async fn user_role(pool: &PgPool, uid: Uuid) -> AppResult<Option<Role>> {
    let row = sqlx::query("SELECT role FROM discipline.users WHERE uid = $1")
        .bind(uid)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(|r| parse_col(r, "role")).transpose()
}

/// Returns whether a row was removed; a missing user is not an error.
pub async fn delete_user(pool: &PgPool, uid: Uuid) -> AppResult<bool> {
    let result = sqlx::query("DELETE FROM discipline.users WHERE uid = $1")
        .bind(uid)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn user_ids_by_role(pool: &PgPool, role: Role) -> AppResult<Vec<Uuid>> {
    let rows = sqlx::query("SELECT uid FROM discipline.users WHERE role = $1")
        .bind(role.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("uid")).collect())
}

pub async fn count_users_by_role(pool: &PgPool, role: Role) -> AppResult<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM discipline.users WHERE role = $1")
        .bind(role.as_str())
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

// ---------------------------------------------------------------- students

const STUDENT_COLUMNS: &str =
    "id, uid, nim, full_name, email, program, points, status, photo_url";

fn student_from_row(row: &PgRow) -> AppResult<Student> {
    Ok(Student {
        id: row.get("id"),
        uid: row.get("uid"),
        nim: row.get("nim"),
        name: row.get("full_name"),
        email: row.get("email"),
        program: row.get("program"),
        points: row.get("points"),
        status: parse_col(row, "status")?,
        photo_url: row.get("photo_url"),
    })
}

pub async fn list_students(pool: &PgPool, filter: &StudentFilter) -> AppResult<Vec<Student>> {
    let search = filter
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", q.to_lowercase()));

    let rows = sqlx::query(&format!(
        "SELECT {STUDENT_COLUMNS} FROM discipline.students \
         WHERE ($1::text IS NULL OR program = $1) \
         AND ($2::text IS NULL OR status = $2) \
         AND ($3::text IS NULL OR lower(full_name) LIKE $3 OR nim LIKE $3 OR lower(email) LIKE $3) \
         ORDER BY points DESC, full_name"
    ))
    .bind(filter.program.as_deref())
    .bind(filter.status.map(StudentStatus::as_key))
    .bind(search)
    .fetch_all(pool)
    .await?;

    rows.iter().map(student_from_row).collect()
}

pub async fn get_student(pool: &PgPool, id: Uuid) -> AppResult<Student> {
    let row = sqlx::query(&format!(
        "SELECT {STUDENT_COLUMNS} FROM discipline.students WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Student"))?;

    student_from_row(&row)
}

pub async fn student_by_uid(pool: &PgPool, uid: Uuid) -> AppResult<Option<Student>> {
    let row = sqlx::query(&format!(
        "SELECT {STUDENT_COLUMNS} FROM discipline.students WHERE uid = $1"
    ))
    .bind(uid)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(student_from_row).transpose()
}

pub async fn student_email_exists(pool: &PgPool, email: &str) -> AppResult<bool> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM discipline.students WHERE email = $1) AS taken")
        .bind(email.trim().to_lowercase())
        .fetch_one(pool)
        .await?;
    Ok(row.get("taken"))
}

pub async fn create_student(pool: &PgPool, uid: Option<Uuid>, student: &NewStudent) -> AppResult<Student> {
    let row = sqlx::query(&format!(
        "INSERT INTO discipline.students (id, uid, nim, full_name, email, program, status, photo_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {STUDENT_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(uid)
    .bind(student.nim.trim())
    .bind(student.name.trim())
    .bind(student.email.trim().to_lowercase())
    .bind(student.program.trim())
    .bind(StudentStatus::Normal.as_key())
    .bind(student.photo_url.as_deref())
    .fetch_one(pool)
    .await
    .map_err(|e| conflict_or(e, "nim or email already registered"))?;

    student_from_row(&row)
}

pub async fn update_student(pool: &PgPool, id: Uuid, update: &StudentUpdate) -> AppResult<Student> {
    let row = sqlx::query(&format!(
        "UPDATE discipline.students SET \
         full_name = COALESCE($2, full_name), \
         program = COALESCE($3, program), \
         photo_url = COALESCE($4, photo_url) \
         WHERE id = $1 RETURNING {STUDENT_COLUMNS}"
    ))
    .bind(id)
    .bind(update.name.as_deref())
    .bind(update.program.as_deref())
    .bind(update.photo_url.as_deref())
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Student"))?;

    student_from_row(&row)
}

/// Removes the student and, when linked, their login in one transaction.
pub async fn delete_student(pool: &PgPool, id: Uuid) -> AppResult<Student> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        "DELETE FROM discipline.students WHERE id = $1 RETURNING {STUDENT_COLUMNS}"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(AppError::NotFound("Student"))?;
    let student = student_from_row(&row)?;

    if let Some(uid) = student.uid {
        sqlx::query("DELETE FROM discipline.users WHERE uid = $1")
            .bind(uid)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(student)
}

/// Row lock that serializes every writer of a student's cached total.
async fn lock_student(conn: &mut PgConnection, student_id: Uuid) -> AppResult<()> {
    sqlx::query("SELECT id FROM discipline.students WHERE id = $1 FOR UPDATE")
        .bind(student_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(AppError::NotFound("Student"))?;
    Ok(())
}

/// Recomputes the cached point total and status from the violation rows.
/// Runs on the caller's connection so it can share a transaction with the
/// write that changed the violations; the caller holds the row lock from
/// `lock_student`.
pub async fn recompute_student(
    conn: &mut PgConnection,
    student_id: Uuid,
    thresholds: &Thresholds,
) -> AppResult<(i32, StudentStatus)> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(points), 0)::INT4 AS total \
         FROM discipline.violations WHERE student_id = $1 AND NOT voided",
    )
    .bind(student_id)
    .fetch_one(&mut *conn)
    .await?;
    let total: i32 = row.get("total");
    let status = status_for(total, thresholds);

    sqlx::query("UPDATE discipline.students SET points = $2, status = $3 WHERE id = $1")
        .bind(student_id)
        .bind(total)
        .bind(status.as_key())
        .execute(&mut *conn)
        .await?;

    Ok((total, status))
}

pub async fn recompute_all(pool: &PgPool) -> AppResult<usize> {
    let mut tx = pool.begin().await?;
    let count = recompute_locked(&mut tx).await?;
    tx.commit().await?;
    Ok(count)
}

async fn recompute_locked(conn: &mut PgConnection) -> AppResult<usize> {
    let ids: Vec<Uuid> = sqlx::query("SELECT id FROM discipline.students ORDER BY id FOR UPDATE")
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|r| r.get("id"))
        .collect();
    let thresholds = load_thresholds(&mut *conn).await?;

    for id in &ids {
        recompute_student(conn, *id, &thresholds).await?;
    }

    info!(students = ids.len(), "recomputed student status");
    Ok(ids.len())
}

// ---------------------------------------------------------------- rules

fn rule_from_row(row: &PgRow) -> AppResult<Rule> {
    Ok(Rule {
        id: row.get("id"),
        code: row.get("code"),
        name: row.get("name"),
        category: parse_col(row, "category")?,
        points: row.get("points"),
    })
}

pub async fn list_rules(pool: &PgPool) -> AppResult<Vec<Rule>> {
    let rows = sqlx::query("SELECT id, code, name, category, points FROM discipline.rules ORDER BY code")
        .fetch_all(pool)
        .await?;
    rows.iter().map(rule_from_row).collect()
}

pub async fn create_rule(pool: &PgPool, input: &RuleInput) -> AppResult<Rule> {
    let row = sqlx::query(
        r#"
        INSERT INTO discipline.rules (id, code, name, category, points)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, code, name, category, points
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(input.code.trim())
    .bind(input.name.trim())
    .bind(input.category.as_str())
    .bind(input.points)
    .fetch_one(pool)
    .await
    .map_err(|e| conflict_or(e, "rule code already exists"))?;

    rule_from_row(&row)
}

pub async fn update_rule(pool: &PgPool, id: Uuid, input: &RuleInput) -> AppResult<Rule> {
    let row = sqlx::query(
        r#"
        UPDATE discipline.rules SET code = $2, name = $3, category = $4, points = $5
        WHERE id = $1
        RETURNING id, code, name, category, points
        "#,
    )
    .bind(id)
    .bind(input.code.trim())
    .bind(input.name.trim())
    .bind(input.category.as_str())
    .bind(input.points)
    .fetch_optional(pool)
    .await
    .map_err(|e| conflict_or(e, "rule code already exists"))?
    .ok_or(AppError::NotFound("Rule"))?;

    rule_from_row(&row)
}

pub async fn delete_rule(pool: &PgPool, id: Uuid) -> AppResult<()> {
    let in_use: bool =
        sqlx::query("SELECT EXISTS (SELECT 1 FROM discipline.violations WHERE rule_id = $1) AS used")
            .bind(id)
            .fetch_one(pool)
            .await?
            .get("used");
    if in_use {
        return Err(AppError::Conflict(
            "rule is referenced by recorded violations".to_string(),
        ));
    }

    let result = sqlx::query("DELETE FROM discipline.rules WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Rule"));
    }
    Ok(())
}

// ---------------------------------------------------------------- violations

const VIOLATION_SELECT: &str = "SELECT v.id, v.student_id, s.full_name AS student_name, v.rule_id, \
     r.name AS rule_name, v.occurred_on, v.points, v.evidence_urls, v.note, v.reported_by, \
     v.voided, v.created_at \
     FROM discipline.violations v \
     JOIN discipline.students s ON s.id = v.student_id \
     JOIN discipline.rules r ON r.id = v.rule_id";

fn violation_from_row(row: &PgRow) -> Violation {
    Violation {
        id: row.get("id"),
        student_id: row.get("student_id"),
        student_name: row.get("student_name"),
        rule_id: row.get("rule_id"),
        rule_name: row.get("rule_name"),
        occurred_on: row.get("occurred_on"),
        points: row.get("points"),
        evidence_urls: row.get("evidence_urls"),
        note: row.get("note"),
        reported_by: row.get("reported_by"),
        voided: row.get("voided"),
        created_at: row.get("created_at"),
    }
}

pub async fn list_violations(pool: &PgPool, student_id: Option<Uuid>) -> AppResult<Vec<Violation>> {
    let rows = sqlx::query(&format!(
        "{VIOLATION_SELECT} WHERE ($1::uuid IS NULL OR v.student_id = $1) \
         ORDER BY v.occurred_on DESC, v.created_at DESC"
    ))
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(violation_from_row).collect())
}

pub async fn recent_violations(pool: &PgPool, since: NaiveDate, limit: i64) -> AppResult<Vec<Violation>> {
    let rows = sqlx::query(&format!(
        "{VIOLATION_SELECT} WHERE v.occurred_on >= $1 \
         ORDER BY v.occurred_on DESC, v.created_at DESC LIMIT $2"
    ))
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(violation_from_row).collect())
}

pub async fn get_violation(pool: &PgPool, id: Uuid) -> AppResult<Violation> {
    let row = sqlx::query(&format!("{VIOLATION_SELECT} WHERE v.id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound("Violation"))?;

    Ok(violation_from_row(&row))
}

/// Records a violation and refreshes the student's total in one
/// transaction. Returns the violation and the refreshed student.
pub async fn create_violation(
    pool: &PgPool,
    input: &NewViolation,
    reported_by: Option<Uuid>,
) -> AppResult<(Violation, Student)> {
    let mut tx = pool.begin().await?;

    let rule_points: i32 = sqlx::query("SELECT points FROM discipline.rules WHERE id = $1")
        .bind(input.rule_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Rule"))?
        .get("points");

    lock_student(&mut tx, input.student_id).await?;
    let thresholds = load_thresholds(&mut *tx).await?;

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO discipline.violations
        (id, student_id, rule_id, occurred_on, points, evidence_urls, note, reported_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(id)
    .bind(input.student_id)
    .bind(input.rule_id)
    .bind(input.occurred_on)
    .bind(rule_points)
    .bind(&input.evidence_urls)
    .bind(input.note.trim())
    .bind(reported_by)
    .execute(&mut *tx)
    .await?;

    recompute_student(&mut tx, input.student_id, &thresholds).await?;
    tx.commit().await?;

    let violation = get_violation(pool, id).await?;
    let student = get_student(pool, input.student_id).await?;
    Ok((violation, student))
}

pub async fn delete_violation(pool: &PgPool, id: Uuid) -> AppResult<Student> {
    let mut tx = pool.begin().await?;

    let student_id: Uuid = sqlx::query("SELECT student_id FROM discipline.violations WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Violation"))?
        .get("student_id");

    lock_student(&mut tx, student_id).await?;
    let thresholds = load_thresholds(&mut *tx).await?;

    let deleted = sqlx::query("DELETE FROM discipline.violations WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(AppError::NotFound("Violation"));
    }

    recompute_student(&mut tx, student_id, &thresholds).await?;
    tx.commit().await?;

    get_student(pool, student_id).await
}

// ---------------------------------------------------------------- appeals

const APPEAL_COLUMNS: &str =
    "id, violation_id, student_id, reason, status, response, reviewed_by, created_at, decided_at";

fn appeal_from_row(row: &PgRow) -> AppResult<Appeal> {
    Ok(Appeal {
        id: row.get("id"),
        violation_id: row.get("violation_id"),
        student_id: row.get("student_id"),
        reason: row.get("reason"),
        status: parse_col(row, "status")?,
        response: row.get("response"),
        reviewed_by: row.get("reviewed_by"),
        created_at: row.get("created_at"),
        decided_at: row.get("decided_at"),
    })
}

pub async fn create_appeal(pool: &PgPool, student_id: Uuid, input: &NewAppeal) -> AppResult<Appeal> {
    let reason = input.reason.trim();
    if reason.is_empty() {
        return Err(AppError::BadRequest("appeal reason is required".to_string()));
    }

    let violation = get_violation(pool, input.violation_id).await?;
    if violation.student_id != student_id {
        return Err(AppError::NotFound("Violation"));
    }
    if violation.voided {
        return Err(AppError::Conflict("violation has already been voided".to_string()));
    }

    let row = sqlx::query(&format!(
        "INSERT INTO discipline.appeals (id, violation_id, student_id, reason) \
         VALUES ($1, $2, $3, $4) RETURNING {APPEAL_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(input.violation_id)
    .bind(student_id)
    .bind(reason)
    .fetch_one(pool)
    .await
    .map_err(|e| conflict_or(e, "an appeal for this violation is already pending"))?;

    appeal_from_row(&row)
}

pub async fn list_appeals(
    pool: &PgPool,
    student_id: Option<Uuid>,
    status: Option<AppealStatus>,
) -> AppResult<Vec<Appeal>> {
    let rows = sqlx::query(&format!(
        "SELECT {APPEAL_COLUMNS} FROM discipline.appeals \
         WHERE ($1::uuid IS NULL OR student_id = $1) \
         AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at DESC"
    ))
    .bind(student_id)
    .bind(status.map(AppealStatus::as_str))
    .fetch_all(pool)
    .await?;

    rows.iter().map(appeal_from_row).collect()
}

/// Accepting an appeal voids the violation and recomputes the student in
/// the same transaction as the decision.
pub async fn decide_appeal(
    pool: &PgPool,
    id: Uuid,
    reviewer: Uuid,
    decision: &AppealDecision,
) -> AppResult<Appeal> {
    let mut tx = pool.begin().await?;

    let student_id: Uuid = sqlx::query("SELECT student_id FROM discipline.appeals WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::NotFound("Appeal"))?
        .get("student_id");

    lock_student(&mut tx, student_id).await?;
    let thresholds = load_thresholds(&mut *tx).await?;

    let status = if decision.accept {
        AppealStatus::Accepted
    } else {
        AppealStatus::Rejected
    };

    let row = sqlx::query(&format!(
        "UPDATE discipline.appeals \
         SET status = $2, response = $3, reviewed_by = $4, decided_at = now() \
         WHERE id = $1 AND status = 'pending' RETURNING {APPEAL_COLUMNS}"
    ))
    .bind(id)
    .bind(status.as_str())
    .bind(decision.response.as_deref())
    .bind(reviewer)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        return Err(AppError::Conflict("appeal has already been decided".to_string()));
    };
    let appeal = appeal_from_row(&row)?;

    if decision.accept {
        sqlx::query("UPDATE discipline.violations SET voided = TRUE WHERE id = $1")
            .bind(appeal.violation_id)
            .execute(&mut *tx)
            .await?;
        recompute_student(&mut tx, appeal.student_id, &thresholds).await?;
    }

    tx.commit().await?;
    Ok(appeal)
}

// ---------------------------------------------------------------- announcements

const ANNOUNCEMENT_COLUMNS: &str = "id, title, body, published_on, image_url, author_uid";

fn announcement_from_row(row: &PgRow) -> Announcement {
    Announcement {
        id: row.get("id"),
        title: row.get("title"),
        body: row.get("body"),
        published_on: row.get("published_on"),
        image_url: row.get("image_url"),
        author_uid: row.get("author_uid"),
    }
}

fn validate_announcement(input: &AnnouncementInput) -> AppResult<()> {
    if input.title.trim().is_empty() || input.body.trim().is_empty() {
        return Err(AppError::BadRequest("title and body are required".to_string()));
    }
    Ok(())
}

pub async fn list_announcements(pool: &PgPool, limit: i64) -> AppResult<Vec<Announcement>> {
    let rows = sqlx::query(&format!(
        "SELECT {ANNOUNCEMENT_COLUMNS} FROM discipline.announcements \
         ORDER BY published_on DESC, created_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(announcement_from_row).collect())
}

pub async fn create_announcement(
    pool: &PgPool,
    input: &AnnouncementInput,
    author: Uuid,
) -> AppResult<Announcement> {
    validate_announcement(input)?;
    let published_on = input.published_on.unwrap_or_else(|| Utc::now().date_naive());

    let row = sqlx::query(&format!(
        "INSERT INTO discipline.announcements (id, title, body, published_on, image_url, author_uid) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {ANNOUNCEMENT_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(input.title.trim())
    .bind(input.body.trim())
    .bind(published_on)
    .bind(input.image_url.as_deref())
    .bind(author)
    .fetch_one(pool)
    .await?;

    Ok(announcement_from_row(&row))
}

pub async fn update_announcement(
    pool: &PgPool,
    id: Uuid,
    input: &AnnouncementInput,
) -> AppResult<Announcement> {
    validate_announcement(input)?;

    let row = sqlx::query(&format!(
        "UPDATE discipline.announcements SET title = $2, body = $3, \
         published_on = COALESCE($4, published_on), image_url = $5 \
         WHERE id = $1 RETURNING {ANNOUNCEMENT_COLUMNS}"
    ))
    .bind(id)
    .bind(input.title.trim())
    .bind(input.body.trim())
    .bind(input.published_on)
    .bind(input.image_url.as_deref())
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Announcement"))?;

    Ok(announcement_from_row(&row))
}

pub async fn delete_announcement(pool: &PgPool, id: Uuid) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM discipline.announcements WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Announcement"));
    }
    Ok(())
}

// ---------------------------------------------------------------- notifications

fn notification_from_row(row: &PgRow) -> AppResult<Notification> {
    Ok(Notification {
        id: row.get("id"),
        recipient_uid: row.get("recipient_uid"),
        title: row.get("title"),
        message: row.get("message"),
        kind: parse_col::<NotificationKind>(row, "kind")?,
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
    })
}

pub async fn insert_notifications(
    pool: &PgPool,
    recipients: &[Uuid],
    title: &str,
    message: &str,
    kind: NotificationKind,
) -> AppResult<usize> {
    let ids: Vec<Uuid> = recipients.iter().map(|_| Uuid::new_v4()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO discipline.notifications (id, recipient_uid, title, message, kind)
        SELECT id, recipient, $3, $4, $5
        FROM UNNEST($1::uuid[], $2::uuid[]) AS t (id, recipient)
        "#,
    )
    .bind(&ids)
    .bind(recipients)
    .bind(title)
    .bind(message)
    .bind(kind.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() as usize)
}

pub async fn list_notifications(
    pool: &PgPool,
    uid: Uuid,
    since: Option<DateTime<Utc>>,
    limit: i64,
) -> AppResult<Vec<Notification>> {
    let rows = sqlx::query(
        "SELECT id, recipient_uid, title, message, kind, is_read, created_at \
         FROM discipline.notifications \
         WHERE recipient_uid = $1 AND ($2::timestamptz IS NULL OR created_at > $2) \
         ORDER BY created_at DESC LIMIT $3",
    )
    .bind(uid)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(notification_from_row).collect()
}

pub async fn unread_count(pool: &PgPool, uid: Uuid) -> AppResult<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM discipline.notifications WHERE recipient_uid = $1 AND NOT is_read",
    )
    .bind(uid)
    .fetch_one(pool)
    .await?;
    Ok(row.get("n"))
}

pub async fn mark_notification_read(pool: &PgPool, uid: Uuid, id: Uuid) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE discipline.notifications SET is_read = TRUE WHERE id = $1 AND recipient_uid = $2",
    )
    .bind(id)
    .bind(uid)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Notification"));
    }
    Ok(())
}

pub async fn mark_all_read(pool: &PgPool, uid: Uuid) -> AppResult<u64> {
    let result = sqlx::query(
        "UPDATE discipline.notifications SET is_read = TRUE WHERE recipient_uid = $1 AND NOT is_read",
    )
    .bind(uid)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

// ---------------------------------------------------------------- push tokens

pub async fn register_push_token(pool: &PgPool, uid: Uuid, token: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO discipline.push_tokens (token, uid) VALUES ($1, $2)
        ON CONFLICT (token) DO UPDATE SET uid = EXCLUDED.uid, updated_at = now()
        "#,
    )
    .bind(token)
    .bind(uid)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn push_tokens_for(pool: &PgPool, recipients: &[Uuid]) -> AppResult<Vec<String>> {
    let rows = sqlx::query("SELECT token FROM discipline.push_tokens WHERE uid = ANY($1)")
        .bind(recipients)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("token")).collect())
}

pub async fn delete_push_token(pool: &PgPool, token: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM discipline.push_tokens WHERE token = $1")
        .bind(token)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------- calendar

fn event_from_row(row: &PgRow) -> AppResult<CalendarEvent> {
    Ok(CalendarEvent {
        id: row.get("id"),
        title: row.get("title"),
        starts_on: row.get("starts_on"),
        ends_on: row.get("ends_on"),
        location: row.get("location"),
        category: parse_col(row, "category")?,
    })
}

fn validate_event(input: &CalendarEventInput) -> AppResult<()> {
    if input.title.trim().is_empty() {
        return Err(AppError::BadRequest("event title is required".to_string()));
    }
    if input.ends_on < input.starts_on {
        return Err(AppError::BadRequest("event cannot end before it starts".to_string()));
    }
    Ok(())
}

/// Events overlapping `[from, to]`; either bound may be open.
pub async fn list_events(
    pool: &PgPool,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> AppResult<Vec<CalendarEvent>> {
    let rows = sqlx::query(
        "SELECT id, title, starts_on, ends_on, location, category FROM discipline.calendar_events \
         WHERE ($1::date IS NULL OR ends_on >= $1) AND ($2::date IS NULL OR starts_on <= $2) \
         ORDER BY starts_on, title",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    rows.iter().map(event_from_row).collect()
}

pub async fn create_event(pool: &PgPool, input: &CalendarEventInput) -> AppResult<CalendarEvent> {
    validate_event(input)?;
    let row = sqlx::query(
        "INSERT INTO discipline.calendar_events (id, title, starts_on, ends_on, location, category) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING id, title, starts_on, ends_on, location, category",
    )
    .bind(Uuid::new_v4())
    .bind(input.title.trim())
    .bind(input.starts_on)
    .bind(input.ends_on)
    .bind(input.location.as_deref())
    .bind(input.category.as_str())
    .fetch_one(pool)
    .await?;

    event_from_row(&row)
}

pub async fn update_event(pool: &PgPool, id: Uuid, input: &CalendarEventInput) -> AppResult<CalendarEvent> {
    validate_event(input)?;
    let row = sqlx::query(
        "UPDATE discipline.calendar_events \
         SET title = $2, starts_on = $3, ends_on = $4, location = $5, category = $6 \
         WHERE id = $1 RETURNING id, title, starts_on, ends_on, location, category",
    )
    .bind(id)
    .bind(input.title.trim())
    .bind(input.starts_on)
    .bind(input.ends_on)
    .bind(input.location.as_deref())
    .bind(input.category.as_str())
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound("Calendar event"))?;

    event_from_row(&row)
}

pub async fn delete_event(pool: &PgPool, id: Uuid) -> AppResult<()> {
    let result = sqlx::query("DELETE FROM discipline.calendar_events WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Calendar event"));
    }
    Ok(())
}

// ---------------------------------------------------------------- settings

pub async fn load_thresholds<'e, E: PgExecutor<'e>>(executor: E) -> AppResult<Thresholds> {
    let row = sqlx::query("SELECT value FROM discipline.settings WHERE key = $1")
        .bind(THRESHOLDS_KEY)
        .fetch_optional(executor)
        .await?;

    Ok(row
        .map(|r| r.get::<Json<Thresholds>, _>("value").0)
        .unwrap_or_default())
}

/// Stores new thresholds and re-derives every student's status from them.
/// A failed recompute rolls the setting back.
pub async fn store_thresholds(pool: &PgPool, thresholds: &Thresholds) -> AppResult<usize> {
    thresholds.validate().map_err(AppError::BadRequest)?;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO discipline.settings (key, value) VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
        "#,
    )
    .bind(THRESHOLDS_KEY)
    .bind(Json(thresholds))
    .execute(&mut *tx)
    .await?;

    let count = recompute_locked(&mut tx).await?;
    tx.commit().await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{lecturer, rule, student_with_login, test_pool, violation_for};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_violation_waits_for_concurrent_recording() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let student = student_with_login(&pool).await;
        let rule = rule(&pool, 30).await;
        let (first, _) = create_violation(&pool, &violation_for(&student, &rule), None)
            .await
            .unwrap();

        // Another writer records a violation under the student lock.
        let mut other = pool.begin().await.unwrap();
        lock_student(&mut other, student.id).await.unwrap();
        sqlx::query(
            "INSERT INTO discipline.violations (id, student_id, rule_id, occurred_on, points) \
             VALUES ($1, $2, $3, CURRENT_DATE, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(student.id)
        .bind(rule.id)
        .bind(rule.points)
        .execute(&mut *other)
        .await
        .unwrap();
        recompute_student(&mut other, student.id, &Thresholds::default())
            .await
            .unwrap();

        let deleting = tokio::spawn({
            let pool = pool.clone();
            async move { delete_violation(&pool, first.id).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        other.commit().await.unwrap();

        let refreshed = deleting.await.unwrap().unwrap();
        assert_eq!(refreshed.points, 30);
        assert_eq!(get_student(&pool, student.id).await.unwrap().points, 30);
    }

    #[tokio::test]
    async fn accepted_appeal_drops_voided_points() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let student = student_with_login(&pool).await;
        let rule = rule(&pool, 30).await;
        let (first, _) = create_violation(&pool, &violation_for(&student, &rule), None)
            .await
            .unwrap();
        let (_, after_two) = create_violation(&pool, &violation_for(&student, &rule), None)
            .await
            .unwrap();
        assert_eq!(after_two.points, 60);
        assert_eq!(after_two.status, StudentStatus::Pembinaan);

        let appeal = create_appeal(
            &pool,
            student.id,
            &NewAppeal {
                violation_id: first.id,
                reason: "Sedang sakit, ada surat dokter".to_string(),
            },
        )
        .await
        .unwrap();
        let decision = AppealDecision {
            accept: true,
            response: Some("Diterima".to_string()),
        };
        let lecturer = lecturer(&pool).await;
        let decided = decide_appeal(&pool, appeal.id, lecturer, &decision).await.unwrap();
        assert_eq!(decided.status, AppealStatus::Accepted);

        let student = get_student(&pool, student.id).await.unwrap();
        assert_eq!(student.points, 30);
        assert_eq!(student.status, StudentStatus::Normal);
        assert!(get_violation(&pool, first.id).await.unwrap().voided);

        let again = decide_appeal(&pool, appeal.id, lecturer, &decision).await;
        assert!(matches!(again, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn deleting_missing_user_succeeds() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let missing = Uuid::new_v4();
        assert!(!delete_user(&pool, missing).await.unwrap());
        assert!(!delete_user(&pool, missing).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_student_removes_login() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let student = student_with_login(&pool).await;
        let uid = student.uid.unwrap();

        let deleted = delete_student(&pool, student.id).await.unwrap();
        assert_eq!(deleted.id, student.id);
        assert!(find_user(&pool, uid).await.unwrap().is_none());
        assert!(matches!(
            delete_student(&pool, student.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn storing_thresholds_recomputes_in_the_same_transaction() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let student = student_with_login(&pool).await;
        let rule = rule(&pool, 55).await;
        create_violation(&pool, &violation_for(&student, &rule), None)
            .await
            .unwrap();

        let recomputed = store_thresholds(&pool, &Thresholds::default()).await.unwrap();
        assert!(recomputed >= 1);
        assert_eq!(load_thresholds(&pool).await.unwrap(), Thresholds::default());
        let student = get_student(&pool, student.id).await.unwrap();
        assert_eq!(student.status, StudentStatus::Pembinaan);

        let invalid = Thresholds {
            pembinaan: 100,
            terancam_do: 50,
        };
        assert!(matches!(
            store_thresholds(&pool, &invalid).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
