use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::validate_email;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::guard::Session;
use crate::models::{
    Announcement, AnnouncementInput, Appeal, AppealDecision, AppealStatus, CalendarEvent,
    CalendarEventInput, NewAppeal, NewStudent, NewViolation, Notification, NotificationKind, Role,
    Rule, RuleInput, Student, StudentFilter, StudentUpdate, Violation,
};
use crate::push::dispatch;
use crate::state::AppState;
use crate::status::{points_to_next_tier, Thresholds};

const STAFF: &[Role] = &[Role::Admin, Role::Dosen];
const ADMIN: &[Role] = &[Role::Admin];

/// Best-effort notification after a committed write; failures are logged.
async fn notify(state: &AppState, recipients: &[Uuid], title: &str, message: &str, kind: NotificationKind) {
    if let Err(e) = dispatch(
        &state.pool,
        state.push.as_deref(),
        recipients,
        title,
        message,
        kind,
    )
    .await
    {
        warn!("notification fan-out failed: {e}");
    }
}

async fn own_student(state: &AppState, session: &Session) -> AppResult<Student> {
    session.require_role(&[Role::Mahasiswa])?;
    db::student_by_uid(&state.pool, session.uid)
        .await?
        .ok_or(AppError::NotFound("Student"))
}

// ---------------------------------------------------------------- students

pub async fn list_students(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(filter): Query<StudentFilter>,
) -> AppResult<Json<Vec<Student>>> {
    session.require_role(STAFF)?;
    Ok(Json(db::list_students(&state.pool, &filter).await?))
}

pub async fn get_student(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Student>> {
    let student = db::get_student(&state.pool, id).await?;
    if session.role == Role::Mahasiswa && student.uid != Some(session.uid) {
        return Err(AppError::Forbidden(session.role.to_string()));
    }
    Ok(Json(student))
}

fn validate_new_student(student: &NewStudent) -> AppResult<()> {
    if student.nim.trim().is_empty() || student.name.trim().is_empty() || student.program.trim().is_empty() {
        return Err(AppError::BadRequest("nim, name and program are required".into()));
    }
    validate_email(student.email.trim()).map_err(AppError::BadRequest)?;
    Ok(())
}

pub async fn create_student(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<NewStudent>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    validate_new_student(&payload)?;
    let student = db::create_student(&state.pool, None, &payload).await?;
    info!(student = %student.id, nim = %student.nim, "student created");
    Ok((StatusCode::CREATED, Json(student)))
}

pub async fn update_student(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(payload): Json<StudentUpdate>,
) -> AppResult<Json<Student>> {
    session.require_role(ADMIN)?;
    Ok(Json(db::update_student(&state.pool, id, &payload).await?))
}

/// Removes the student and, when linked, their login.
pub async fn delete_student(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    let student = db::delete_student(&state.pool, id).await?;
    if let Some(uid) = student.uid {
        state.roles.invalidate(&uid);
    }
    info!(student = %id, "student deleted");
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------- rules

fn validate_rule(input: &RuleInput) -> AppResult<()> {
    if input.code.trim().is_empty() || input.name.trim().is_empty() {
        return Err(AppError::BadRequest("rule code and name are required".into()));
    }
    if input.points <= 0 {
        return Err(AppError::BadRequest("rule points must be positive".into()));
    }
    Ok(())
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    _session: Session,
) -> AppResult<Json<Vec<Rule>>> {
    Ok(Json(db::list_rules(&state.pool).await?))
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<RuleInput>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    validate_rule(&payload)?;
    Ok((StatusCode::CREATED, Json(db::create_rule(&state.pool, &payload).await?)))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(payload): Json<RuleInput>,
) -> AppResult<Json<Rule>> {
    session.require_role(ADMIN)?;
    validate_rule(&payload)?;
    Ok(Json(db::update_rule(&state.pool, id, &payload).await?))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    db::delete_rule(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------- violations

#[derive(Deserialize)]
pub struct ViolationQuery {
    student_id: Option<Uuid>,
}

pub async fn list_violations(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(query): Query<ViolationQuery>,
) -> AppResult<Json<Vec<Violation>>> {
    session.require_role(STAFF)?;
    Ok(Json(db::list_violations(&state.pool, query.student_id).await?))
}

pub async fn get_violation(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Violation>> {
    let violation = db::get_violation(&state.pool, id).await?;
    if session.role == Role::Mahasiswa {
        let student = own_student(&state, &session).await?;
        if student.id != violation.student_id {
            return Err(AppError::NotFound("Violation"));
        }
    }
    Ok(Json(violation))
}

#[derive(Serialize)]
pub struct RecordedViolation {
    violation: Violation,
    student: Student,
}

pub async fn create_violation(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<NewViolation>,
) -> AppResult<impl IntoResponse> {
    session.require_role(STAFF)?;
    if payload.occurred_on > Utc::now().date_naive() {
        return Err(AppError::BadRequest("violation date cannot be in the future".into()));
    }

    let (violation, student) = db::create_violation(&state.pool, &payload, Some(session.uid)).await?;
    info!(
        violation = %violation.id,
        student = %student.id,
        points = student.points,
        status = %student.status,
        "violation recorded"
    );

    if let Some(uid) = student.uid {
        let message = format!(
            "{} ({} poin). Total poin Anda: {}, status: {}.",
            violation.rule_name, violation.points, student.points, student.status
        );
        notify(&state, &[uid], "Pelanggaran baru tercatat", &message, NotificationKind::Violation).await;
    }

    Ok((StatusCode::CREATED, Json(RecordedViolation { violation, student })))
}

pub async fn delete_violation(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Student>> {
    session.require_role(ADMIN)?;
    Ok(Json(db::delete_violation(&state.pool, id).await?))
}

#[derive(Serialize)]
pub struct MyViolations {
    student: Student,
    thresholds: Thresholds,
    points_to_next_tier: Option<i32>,
    violations: Vec<Violation>,
}

pub async fn my_violations(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<MyViolations>> {
    let student = own_student(&state, &session).await?;
    let thresholds = db::load_thresholds(&state.pool).await?;
    let violations = db::list_violations(&state.pool, Some(student.id)).await?;

    Ok(Json(MyViolations {
        points_to_next_tier: points_to_next_tier(student.points, &thresholds),
        student,
        thresholds,
        violations,
    }))
}

// ---------------------------------------------------------------- appeals

#[derive(Deserialize)]
pub struct AppealQuery {
    status: Option<AppealStatus>,
}

pub async fn list_appeals(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(query): Query<AppealQuery>,
) -> AppResult<Json<Vec<Appeal>>> {
    let student_id = match session.role {
        Role::Mahasiswa => Some(own_student(&state, &session).await?.id),
        Role::Admin | Role::Dosen => None,
    };
    Ok(Json(db::list_appeals(&state.pool, student_id, query.status).await?))
}

pub async fn create_appeal(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<NewAppeal>,
) -> AppResult<impl IntoResponse> {
    let student = own_student(&state, &session).await?;
    let appeal = db::create_appeal(&state.pool, student.id, &payload).await?;
    info!(appeal = %appeal.id, student = %student.id, "appeal filed");
    Ok((StatusCode::CREATED, Json(appeal)))
}

pub async fn decide_appeal(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(payload): Json<AppealDecision>,
) -> AppResult<Json<Appeal>> {
    session.require_role(STAFF)?;
    let appeal = db::decide_appeal(&state.pool, id, session.uid, &payload).await?;
    info!(appeal = %appeal.id, status = appeal.status.as_str(), "appeal decided");

    let student = db::get_student(&state.pool, appeal.student_id).await?;
    if let Some(uid) = student.uid {
        let verdict = if payload.accept { "diterima" } else { "ditolak" };
        let message = match appeal.response.as_deref() {
            Some(response) if !response.trim().is_empty() => {
                format!("Banding Anda {verdict}: {response}")
            }
            _ => format!("Banding Anda {verdict}."),
        };
        notify(&state, &[uid], "Keputusan banding", &message, NotificationKind::Appeal).await;
    }

    Ok(Json(appeal))
}

// ---------------------------------------------------------------- announcements

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<i64>,
}

pub async fn list_announcements(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<Announcement>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(db::list_announcements(&state.pool, limit).await?))
}

pub async fn create_announcement(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<AnnouncementInput>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    let announcement = db::create_announcement(&state.pool, &payload, session.uid).await?;
    info!(announcement = %announcement.id, "announcement published");

    let students = db::user_ids_by_role(&state.pool, Role::Mahasiswa).await?;
    notify(
        &state,
        &students,
        "Pengumuman baru",
        &announcement.title,
        NotificationKind::Announcement,
    )
    .await;

    Ok((StatusCode::CREATED, Json(announcement)))
}

pub async fn update_announcement(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(payload): Json<AnnouncementInput>,
) -> AppResult<Json<Announcement>> {
    session.require_role(ADMIN)?;
    Ok(Json(db::update_announcement(&state.pool, id, &payload).await?))
}

pub async fn delete_announcement(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    db::delete_announcement(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------- calendar

#[derive(Deserialize)]
pub struct RangeQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

pub async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> AppResult<Json<Vec<CalendarEvent>>> {
    Ok(Json(db::list_events(&state.pool, range.from, range.to).await?))
}

pub async fn create_event(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<CalendarEventInput>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    Ok((StatusCode::CREATED, Json(db::create_event(&state.pool, &payload).await?)))
}

pub async fn update_event(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(payload): Json<CalendarEventInput>,
) -> AppResult<Json<CalendarEvent>> {
    session.require_role(ADMIN)?;
    Ok(Json(db::update_event(&state.pool, id, &payload).await?))
}

pub async fn delete_event(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    session.require_role(ADMIN)?;
    db::delete_event(&state.pool, id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------- notifications

#[derive(Deserialize)]
pub struct NotificationQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

/// Clients poll with `since` set to the newest timestamp they hold.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    session: Session,
    Query(query): Query<NotificationQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(
        db::list_notifications(&state.pool, session.uid, query.since, limit).await?,
    ))
}

pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let unread = db::unread_count(&state.pool, session.uid).await?;
    Ok(Json(json!({ "unread": unread })))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    db::mark_notification_read(&state.pool, session.uid, id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn mark_all_read(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let updated = db::mark_all_read(&state.pool, session.uid).await?;
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Deserialize)]
pub struct PushTokenRequest {
    token: String,
}

pub async fn register_push_token(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<PushTokenRequest>,
) -> AppResult<impl IntoResponse> {
    let token = payload.token.trim();
    if token.is_empty() || token.len() > 4096 {
        return Err(AppError::BadRequest("invalid push token".into()));
    }
    db::register_push_token(&state.pool, session.uid, token).await?;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleCategory;

    fn rule(code: &str, points: i32) -> RuleInput {
        RuleInput {
            code: code.to_string(),
            name: "Terlambat masuk kelas".to_string(),
            category: RuleCategory::Ringan,
            points,
        }
    }

    #[test]
    fn rules_need_code_and_positive_points() {
        assert!(validate_rule(&rule("R-01", 5)).is_ok());
        assert!(validate_rule(&rule(" ", 5)).is_err());
        assert!(validate_rule(&rule("R-01", 0)).is_err());
    }

    #[test]
    fn new_students_need_identity_fields() {
        let mut student = NewStudent {
            nim: "2301010001".to_string(),
            name: "Dimas Pratama".to_string(),
            email: "dimas@polgan.ac.id".to_string(),
            program: "Manajemen Informatika".to_string(),
            photo_url: None,
        };
        assert!(validate_new_student(&student).is_ok());
        student.email = "dimas".to_string();
        assert!(validate_new_student(&student).is_err());
        student.email = "dimas@polgan".to_string();
        assert!(validate_new_student(&student).is_err());
        student.email = "dimas@polgan.ac.id".to_string();
        student.program = String::new();
        assert!(validate_new_student(&student).is_err());
    }
}
