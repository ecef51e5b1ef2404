//! Evidence and announcement images live on Cloudinary; this module only
//! forwards bytes and returns the hosted URL.

use std::fmt::Write;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::CloudinaryConfig;
use crate::error::{AppError, AppResult};

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_FOLDER: &str = "pelanggaran";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedImage {
    pub url: String,
    pub public_id: String,
}

#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, folder: &str) -> AppResult<UploadedImage>;

    /// Removing an image the host no longer has is not an error.
    async fn delete(&self, public_id: &str) -> AppResult<()>;
}

pub fn validate_image(content_type: Option<&str>, len: usize) -> AppResult<()> {
    match content_type {
        Some(ct) if ct.starts_with("image/") => {}
        _ => return Err(AppError::BadRequest("only image files can be uploaded".into())),
    }
    if len == 0 {
        return Err(AppError::BadRequest("image is empty".into()));
    }
    if len > MAX_IMAGE_BYTES {
        return Err(AppError::BadRequest("image exceeds 5 MiB".into()));
    }
    Ok(())
}

/// Folder names end up in CDN paths; keep them to a safe alphabet.
pub fn sanitize_folder(folder: Option<&str>) -> String {
    let cleaned: String = folder
        .unwrap_or(DEFAULT_FOLDER)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
        .collect();
    let trimmed = cleaned.trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_FOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Cloudinary request signature: parameters sorted by key, joined as
/// `k=v&k=v`, suffixed with the API secret, hashed with SHA-256.
pub fn sign_params(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let digest = Sha256::digest(format!("{joined}{api_secret}").as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

pub struct CloudinaryHost {
    http: reqwest::Client,
    config: CloudinaryConfig,
}

#[derive(Deserialize)]
struct UploadResponse {
    secure_url: String,
    public_id: String,
}

#[derive(Deserialize)]
struct DestroyResponse {
    result: String,
}

impl CloudinaryHost {
    pub fn new(http: reqwest::Client, config: CloudinaryConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, action: &str) -> String {
        format!(
            "https://api.cloudinary.com/v1_1/{}/image/{action}",
            self.config.cloud_name
        )
    }
}

#[async_trait]
impl ImageHost for CloudinaryHost {
    async fn upload(&self, bytes: Vec<u8>, filename: &str, folder: &str) -> AppResult<UploadedImage> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("folder", folder), ("timestamp", &timestamp)],
            &self.config.api_secret,
        );

        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(filename.to_string()))
            .text("api_key", self.config.api_key.clone())
            .text("folder", folder.to_string())
            .text("timestamp", timestamp)
            .text("signature", signature);

        let response = self
            .http
            .post(self.endpoint("upload"))
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "cloudinary upload rejected: {body}");
            return Err(AppError::Upstream(format!("image upload failed with {status}")));
        }

        let uploaded: UploadResponse = response.json().await?;
        info!(public_id = %uploaded.public_id, "image uploaded");
        Ok(UploadedImage {
            url: uploaded.secure_url,
            public_id: uploaded.public_id,
        })
    }

    async fn delete(&self, public_id: &str) -> AppResult<()> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_params(
            &[("public_id", public_id), ("timestamp", &timestamp)],
            &self.config.api_secret,
        );

        let response = self
            .http
            .post(self.endpoint("destroy"))
            .form(&[
                ("public_id", public_id),
                ("timestamp", timestamp.as_str()),
                ("api_key", self.config.api_key.as_str()),
                ("signature", signature.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::Upstream(format!("image delete failed with {status}")));
        }

        let outcome: DestroyResponse = response.json().await?;
        match outcome.result.as_str() {
            "ok" | "not found" => Ok(()),
            other => Err(AppError::Upstream(format!("image delete returned '{other}'"))),
        }
    }
}
