use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::error::{AppError, AppResult};
use crate::guard::Session;
use crate::import::{run_import, ImportRecord, ImportReport, PgDirectory};
use crate::models::{NotificationKind, Role};
use crate::push::{dispatch, DispatchReport};
use crate::state::AppState;
use crate::status::Thresholds;
use crate::uploads::{sanitize_folder, validate_image, UploadedImage};

const MAX_IMPORT_RECORDS: usize = 2_000;

/// Accepts either a JSON array or a CSV document with a header row.
pub fn parse_import_body(content_type: Option<&str>, body: &[u8]) -> AppResult<Vec<ImportRecord>> {
    let is_csv = content_type.is_some_and(|ct| ct.starts_with("text/csv"));

    let records = if is_csv {
        let mut reader = csv::Reader::from_reader(body);
        reader
            .deserialize::<ImportRecord>()
            .enumerate()
            .map(|(i, row)| {
                row.map_err(|e| AppError::BadRequest(format!("csv row {}: {e}", i + 1)))
            })
            .collect::<AppResult<Vec<_>>>()?
    } else {
        serde_json::from_slice::<Vec<ImportRecord>>(body)
            .map_err(|e| AppError::BadRequest(format!("invalid import payload: {e}")))?
    };

    if records.is_empty() {
        return Err(AppError::BadRequest("no students to import".into()));
    }
    if records.len() > MAX_IMPORT_RECORDS {
        return Err(AppError::BadRequest(format!(
            "at most {MAX_IMPORT_RECORDS} students per import"
        )));
    }
    Ok(records)
}

pub async fn import_students(
    State(state): State<Arc<AppState>>,
    session: Session,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ImportReport>> {
    session.require_role(&[Role::Admin])?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let records = parse_import_body(content_type, &body)?;

    let directory = PgDirectory::new(&state.pool);
    let report = run_import(&directory, &records).await;
    Ok(Json(report))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    session: Session,
    Path(uid): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin])?;
    if uid == session.uid {
        return Err(AppError::BadRequest("you cannot delete your own account".into()));
    }

    let deleted = db::delete_user(&state.pool, uid).await?;
    state.roles.invalidate(&uid);
    if deleted {
        info!(%uid, "user deleted");
    } else {
        info!(%uid, "user already absent, nothing to delete");
    }

    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<Json<Thresholds>> {
    session.require_role(&[Role::Admin, Role::Dosen])?;
    Ok(Json(db::load_thresholds(&state.pool).await?))
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(thresholds): Json<Thresholds>,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin])?;
    let recomputed = db::store_thresholds(&state.pool, &thresholds).await?;
    info!(
        pembinaan = thresholds.pembinaan,
        terancam_do = thresholds.terancam_do,
        "thresholds updated"
    );
    Ok(Json(json!({ "thresholds": thresholds, "recomputed": recomputed })))
}

pub async fn recompute(
    State(state): State<Arc<AppState>>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin])?;
    let recomputed = db::recompute_all(&state.pool).await?;
    Ok(Json(json!({ "recomputed": recomputed })))
}

pub async fn upload_image(
    State(state): State<Arc<AppState>>,
    session: Session,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin, Role::Dosen])?;
    let host = state.images.clone().ok_or(AppError::Unavailable("Image upload"))?;

    let mut file: Option<(String, Vec<u8>)> = None;
    let mut folder: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                validate_image(content_type.as_deref(), bytes.len())?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("folder") => {
                folder = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::BadRequest(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| AppError::BadRequest("file field is required".into()))?;
    let folder = sanitize_folder(folder.as_deref());
    let uploaded: UploadedImage = host.upload(bytes, &filename, &folder).await?;

    Ok((StatusCode::CREATED, Json(uploaded)))
}

#[derive(Deserialize)]
pub struct DeleteImageRequest {
    public_id: String,
}

pub async fn delete_image(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<DeleteImageRequest>,
) -> AppResult<impl IntoResponse> {
    session.require_role(&[Role::Admin, Role::Dosen])?;
    let host = state.images.clone().ok_or(AppError::Unavailable("Image upload"))?;

    if payload.public_id.trim().is_empty() {
        return Err(AppError::BadRequest("public_id is required".into()));
    }
    host.delete(payload.public_id.trim()).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct SendNotificationRequest {
    title: String,
    message: String,
    #[serde(default)]
    recipients: Vec<Uuid>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    kind: Option<NotificationKind>,
}

#[derive(Serialize)]
pub struct SendNotificationResponse {
    recipients: usize,
    #[serde(flatten)]
    report: DispatchReport,
}

pub async fn send_notification(
    State(state): State<Arc<AppState>>,
    session: Session,
    Json(payload): Json<SendNotificationRequest>,
) -> AppResult<Json<SendNotificationResponse>> {
    session.require_role(&[Role::Admin, Role::Dosen])?;

    if payload.title.trim().is_empty() || payload.message.trim().is_empty() {
        return Err(AppError::BadRequest("title and message are required".into()));
    }

    let mut recipients = payload.recipients;
    if let Some(role) = payload.role {
        recipients.extend(db::user_ids_by_role(&state.pool, role).await?);
    }
    recipients.sort();
    recipients.dedup();
    if recipients.is_empty() {
        return Err(AppError::BadRequest("no recipients given".into()));
    }

    let report = dispatch(
        &state.pool,
        state.push.as_deref(),
        &recipients,
        payload.title.trim(),
        payload.message.trim(),
        payload.kind.unwrap_or(NotificationKind::General),
    )
    .await?;

    Ok(Json(SendNotificationResponse {
        recipients: recipients.len(),
        report,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_json_array() {
        let body = br#"[{"nim":"2301010001","name":"Dimas","email":"d@polgan.ac.id","program":"MI"}]"#;
        let records = parse_import_body(Some("application/json"), body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].nim, "2301010001");
        assert_eq!(records[0].password, None);
    }

    #[test]
    fn parses_csv_with_header() {
        let body = b"nim,name,email,program,password\n2301010001,Dimas,d@polgan.ac.id,MI,\n2301010002,Siti,s@polgan.ac.id,AK,rahasia99\n";
        let records = parse_import_body(Some("text/csv; charset=utf-8"), body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].password.as_deref(), Some("rahasia99"));
    }

    #[test]
    fn rejects_empty_and_malformed_payloads() {
        assert!(matches!(
            parse_import_body(None, b"[]"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse_import_body(None, b"{\"nim\":1}"),
            Err(AppError::BadRequest(_))
        ));
    }
}
