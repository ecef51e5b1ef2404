use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{bail, Context};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct FcmConfig {
    pub project_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub session_secret: Vec<u8>,
    pub session_ttl: Duration,
    pub role_cache_ttl: Duration,
    pub cookie_secure: bool,
    pub cloudinary: Option<CloudinaryConfig>,
    pub fcm: Option<FcmConfig>,
}

fn session_ttl_from_hours(hours: u64) -> anyhow::Result<Duration> {
    let secs = hours
        .checked_mul(60 * 60)
        .with_context(|| format!("SESSION_TTL_HOURS={hours} is too large"))?;
    Ok(Duration::from_secs(secs))
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            info!("Loaded environment from {}", path.display());
        }

        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let session_secret = env::var("SESSION_SECRET").context("SESSION_SECRET must be set")?;
        if session_secret.len() < 32 {
            bail!("SESSION_SECRET must be at least 32 bytes");
        }

        let session_ttl_hours: u64 = try_load("SESSION_TTL_HOURS", "24")?;
        let role_cache_ttl_secs: u64 = try_load("ROLE_CACHE_TTL_SECS", "300")?;

        Ok(Self {
            database_url,
            port: try_load("PORT", "8080")?,
            session_secret: session_secret.into_bytes(),
            session_ttl: session_ttl_from_hours(session_ttl_hours)?,
            role_cache_ttl: Duration::from_secs(role_cache_ttl_secs),
            cookie_secure: try_load("COOKIE_SECURE", "false")?,
            cloudinary: load_cloudinary(),
            fcm: load_fcm(),
        })
    }

    /// Only what the maintenance commands need.
    pub fn database_url() -> anyhow::Result<String> {
        let _ = dotenvy::dotenv();
        env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse().map_err(|e| {
        warn!("Invalid {key} value: {e}");
        anyhow::anyhow!("invalid value for {key}: {e}")
    })
}

fn load_cloudinary() -> Option<CloudinaryConfig> {
    match (
        optional("CLOUDINARY_CLOUD_NAME"),
        optional("CLOUDINARY_API_KEY"),
        optional("CLOUDINARY_API_SECRET"),
    ) {
        (Some(cloud_name), Some(api_key), Some(api_secret)) => Some(CloudinaryConfig {
            cloud_name,
            api_key,
            api_secret,
        }),
        _ => {
            warn!("Cloudinary credentials incomplete, image uploads disabled");
            None
        }
    }
}

fn load_fcm() -> Option<FcmConfig> {
    match (optional("FCM_PROJECT_ID"), optional("FCM_ACCESS_TOKEN")) {
        (Some(project_id), Some(access_token)) => Some(FcmConfig {
            project_id,
            access_token,
        }),
        _ => {
            warn!("FCM credentials missing, push delivery disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn session_ttl_converts_hours() {
        assert_eq!(
            session_ttl_from_hours(24).unwrap(),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn oversized_session_ttl_is_an_error() {
        let err = session_ttl_from_hours(u64::MAX).unwrap_err();
        assert!(err.to_string().contains("SESSION_TTL_HOURS"));
    }
}
