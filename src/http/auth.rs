use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{
    clear_session_cookie, encode_session, hash_password, session_cookie, validate_email,
    validate_password, verify_password, SessionClaims,
};
use crate::db;
use crate::error::{AppError, AppResult};
use crate::guard::Session;
use crate::models::{NewStudent, Role};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    uid: Uuid,
    role: Role,
    redirect: &'static str,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(AppError::BadRequest("email and password are required".into()));
    }

    let Some(account) = db::find_user_by_email(&state.pool, &payload.email).await? else {
        warn!("login attempt for unknown email");
        return Err(AppError::InvalidCredentials);
    };
    if !verify_password(&payload.password, &account.password_hash) {
        warn!(uid = %account.uid, "login attempt with wrong password");
        return Err(AppError::InvalidCredentials);
    }

    let claims = SessionClaims::new(account.uid, account.role, state.config.session_ttl);
    let token = encode_session(&claims, &state.config.session_secret);
    let cookie = session_cookie(&token, state.config.session_ttl, state.config.cookie_secure);
    state.roles.insert(account.uid, account.role);

    info!(uid = %account.uid, role = %account.role, "user logged in");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(SessionResponse {
            uid: account.uid,
            role: account.role,
            redirect: account.role.dashboard(),
        }),
    ))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    email: String,
    password: String,
    name: String,
    role: Role,
    #[serde(default)]
    nim: Option<String>,
    #[serde(default)]
    program: Option<String>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    uid: Uuid,
    role: Role,
    student_id: Option<Uuid>,
}

/// Admin-only account creation. Student accounts also get their student
/// record; if that write fails the account is removed again.
pub async fn register(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin])?;

    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    validate_email(payload.email.trim()).map_err(AppError::BadRequest)?;
    validate_password(&payload.password).map_err(AppError::BadRequest)?;

    let student = match payload.role {
        Role::Mahasiswa => {
            let nim = payload.nim.as_deref().map(str::trim).unwrap_or_default();
            let program = payload.program.as_deref().map(str::trim).unwrap_or_default();
            if nim.is_empty() || program.is_empty() {
                return Err(AppError::BadRequest(
                    "nim and program are required for student accounts".into(),
                ));
            }
            Some(NewStudent {
                nim: nim.to_string(),
                name: payload.name.trim().to_string(),
                email: payload.email.trim().to_lowercase(),
                program: program.to_string(),
                photo_url: None,
            })
        }
        Role::Admin | Role::Dosen => None,
    };

    if student.is_some() && db::student_email_exists(&state.pool, &payload.email).await? {
        return Err(AppError::Conflict("email already registered".into()));
    }

    let hash = hash_password(&payload.password)?;
    let account = db::create_user(
        &state.pool,
        &payload.email,
        &hash,
        payload.role,
        payload.name.trim(),
    )
    .await?;

    let student_id = match student {
        Some(student) => match db::create_student(&state.pool, Some(account.uid), &student).await {
            Ok(created) => Some(created.id),
            Err(e) => {
                if let Err(cleanup) = db::delete_user(&state.pool, account.uid).await {
                    error!(uid = %account.uid, "compensating account delete failed: {cleanup}");
                }
                return Err(e);
            }
        },
        None => None,
    };

    info!(uid = %account.uid, role = %account.role, "account registered");
    Ok((
        axum::http::StatusCode::CREATED,
        Json(RegisterResponse {
            uid: account.uid,
            role: account.role,
            student_id,
        }),
    ))
}

#[derive(Serialize)]
pub struct VerifyResponse {
    uid: Uuid,
    role: Role,
    name: String,
    email: String,
}

pub async fn verify(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<VerifyResponse>> {
    let account = db::find_user(&state.pool, session.uid)
        .await?
        .ok_or(AppError::Unauthorized)?;

    Ok(Json(VerifyResponse {
        uid: account.uid,
        role: session.role,
        name: account.display_name,
        email: account.email,
    }))
}

pub async fn logout(State(state): State<Arc<AppState>>, session: Option<Session>) -> impl IntoResponse {
    if let Some(session) = session {
        state.roles.invalidate(&session.uid);
        info!(uid = %session.uid, "user logged out");
    }
    (
        [(header::SET_COOKIE, clear_session_cookie(state.config.cookie_secure))],
        Json(serde_json::json!({ "ok": true })),
    )
}
