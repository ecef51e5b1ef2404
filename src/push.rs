use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FcmConfig;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::NotificationKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The device token is no longer valid and should be forgotten.
    Unregistered,
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, title: &str, body: &str) -> AppResult<PushOutcome>;
}

pub struct FcmSender {
    http: reqwest::Client,
    config: FcmConfig,
}

impl FcmSender {
    pub fn new(http: reqwest::Client, config: FcmConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl PushSender for FcmSender {
    async fn send(&self, token: &str, title: &str, body: &str) -> AppResult<PushOutcome> {
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.config.project_id
        );
        let payload = json!({
            "message": {
                "token": token,
                "notification": { "title": title, "body": body },
                "webpush": { "fcm_options": { "link": "/" } }
            }
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(PushOutcome::Delivered);
        }

        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || text.contains("UNREGISTERED") {
            return Ok(PushOutcome::Unregistered);
        }
        Err(AppError::Upstream(format!("push rejected with {status}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub stored: usize,
    pub pushed: usize,
    pub pruned: usize,
}

/// Sends one message to every token; returns delivered count and tokens to
/// drop. Individual failures are logged and skipped.
pub async fn push_to_tokens(
    sender: &dyn PushSender,
    tokens: &[String],
    title: &str,
    body: &str,
) -> (usize, Vec<String>) {
    let mut delivered = 0;
    let mut stale = Vec::new();

    for token in tokens {
        match sender.send(token, title, body).await {
            Ok(PushOutcome::Delivered) => delivered += 1,
            Ok(PushOutcome::Unregistered) => stale.push(token.clone()),
            Err(e) => warn!("push delivery failed: {e}"),
        }
    }

    (delivered, stale)
}

/// Fan-out: one notification row per recipient, then a best-effort push to
/// their registered devices. Push problems never fail the dispatch.
pub async fn dispatch(
    pool: &PgPool,
    sender: Option<&dyn PushSender>,
    recipients: &[Uuid],
    title: &str,
    message: &str,
    kind: NotificationKind,
) -> AppResult<DispatchReport> {
    if recipients.is_empty() {
        return Ok(DispatchReport::default());
    }

    let stored = db::insert_notifications(pool, recipients, title, message, kind).await?;
    let mut report = DispatchReport {
        stored,
        ..DispatchReport::default()
    };

    let Some(sender) = sender else {
        debug!("push disabled, stored {stored} notifications only");
        return Ok(report);
    };

    let tokens = db::push_tokens_for(pool, recipients).await?;
    let (pushed, stale) = push_to_tokens(sender, &tokens, title, message).await;
    report.pushed = pushed;

    for token in &stale {
        if let Err(e) = db::delete_push_token(pool, token).await {
            warn!("failed to prune push token: {e}");
        } else {
            report.pruned += 1;
        }
    }

    info!(
        stored = report.stored,
        pushed = report.pushed,
        pruned = report.pruned,
        kind = kind.as_str(),
        "notification dispatched"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSender {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PushSender for FakeSender {
        async fn send(&self, token: &str, _title: &str, _body: &str) -> AppResult<PushOutcome> {
            self.sent.lock().unwrap().push(token.to_string());
            match token {
                t if t.starts_with("stale") => Ok(PushOutcome::Unregistered),
                t if t.starts_with("broken") => Err(AppError::Upstream("boom".into())),
                _ => Ok(PushOutcome::Delivered),
            }
        }
    }

    #[tokio::test]
    async fn failures_do_not_stop_fan_out() {
        let sender = FakeSender {
            sent: Mutex::new(Vec::new()),
        };
        let tokens = vec![
            "device-a".to_string(),
            "broken-b".to_string(),
            "stale-c".to_string(),
            "device-d".to_string(),
        ];

        let (delivered, stale) = push_to_tokens(&sender, &tokens, "Pelanggaran baru", "10 poin").await;

        assert_eq!(delivered, 2);
        assert_eq!(stale, vec!["stale-c".to_string()]);
        assert_eq!(sender.sent.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn no_tokens_means_nothing_sent() {
        let sender = FakeSender {
            sent: Mutex::new(Vec::new()),
        };
        let (delivered, stale) = push_to_tokens(&sender, &[], "t", "b").await;
        assert_eq!(delivered, 0);
        assert!(stale.is_empty());
    }
}
