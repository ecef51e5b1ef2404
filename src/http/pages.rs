//! Role dashboards. The guard middleware has already checked the path
//! prefix against the session's role before any of these run.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::{Duration, Utc};
use serde_json::{json, Value};

use crate::db;
use crate::error::{AppError, AppResult};
use crate::guard::Session;
use crate::models::{AppealStatus, Role, StudentFilter};
use crate::state::AppState;
use crate::status::{points_to_next_tier, summarize_by_program, StudentStatus};

const RECENT_DAYS: i64 = 30;

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn login_page() -> Json<Value> {
    Json(json!({
        "page": "login",
        "action": "/api/auth/login",
        "fields": ["email", "password"],
    }))
}

pub async fn admin_dashboard(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<Value>> {
    session.require_role(&[Role::Admin])?;

    let students = db::list_students(&state.pool, &StudentFilter::default()).await?;
    let thresholds = db::load_thresholds(&state.pool).await?;
    let since = Utc::now().date_naive() - Duration::days(RECENT_DAYS);
    let recent = db::recent_violations(&state.pool, since, 10).await?;
    let pending = db::list_appeals(&state.pool, None, Some(AppealStatus::Pending)).await?;
    let lecturers = db::count_users_by_role(&state.pool, Role::Dosen).await?;

    let count = |status: StudentStatus| students.iter().filter(|s| s.status == status).count();

    Ok(Json(json!({
        "role": Role::Admin,
        "thresholds": thresholds,
        "totals": {
            "students": students.len(),
            "lecturers": lecturers,
            "normal": count(StudentStatus::Normal),
            "pembinaan": count(StudentStatus::Pembinaan),
            "terancam_do": count(StudentStatus::TerancamDo),
            "pending_appeals": pending.len(),
        },
        "programs": summarize_by_program(&students),
        "recent_violations": recent,
    })))
}

pub async fn dosen_dashboard(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<Value>> {
    session.require_role(&[Role::Dosen])?;

    let students = db::list_students(&state.pool, &StudentFilter::default()).await?;
    let at_risk: Vec<_> = students
        .into_iter()
        .filter(|s| s.status != StudentStatus::Normal)
        .take(20)
        .collect();
    let since = Utc::now().date_naive() - Duration::days(RECENT_DAYS);
    let recent = db::recent_violations(&state.pool, since, 10).await?;
    let pending = db::list_appeals(&state.pool, None, Some(AppealStatus::Pending)).await?;
    let unread = db::unread_count(&state.pool, session.uid).await?;

    Ok(Json(json!({
        "role": Role::Dosen,
        "students_at_risk": at_risk,
        "recent_violations": recent,
        "pending_appeals": pending,
        "unread_notifications": unread,
    })))
}

pub async fn mahasiswa_dashboard(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<Value>> {
    session.require_role(&[Role::Mahasiswa])?;

    let student = db::student_by_uid(&state.pool, session.uid)
        .await?
        .ok_or(AppError::NotFound("Student"))?;
    let thresholds = db::load_thresholds(&state.pool).await?;
    let violations = db::list_violations(&state.pool, Some(student.id)).await?;
    let announcements = db::list_announcements(&state.pool, 5).await?;
    let today = Utc::now().date_naive();
    let events = db::list_events(&state.pool, Some(today), Some(today + Duration::days(60))).await?;
    let unread = db::unread_count(&state.pool, session.uid).await?;

    Ok(Json(json!({
        "role": Role::Mahasiswa,
        "points_to_next_tier": points_to_next_tier(student.points, &thresholds),
        "student": student,
        "thresholds": thresholds,
        "violations": violations,
        "announcements": announcements,
        "upcoming_events": events,
        "unread_notifications": unread,
    })))
}
