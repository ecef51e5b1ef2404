use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::{cookie_value, decode_session, SESSION_COOKIE};
use crate::db;
use crate::error::AppError;
use crate::models::Role;
use crate::state::AppState;

pub const LOGIN_PATH: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub uid: Uuid,
    pub role: Role,
}

impl Session {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), AppError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::Forbidden(self.role.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Allow,
    Redirect(String),
}

fn under_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Which role, if any, owns this page path.
pub fn protected_role(path: &str) -> Option<Role> {
    Role::ALL
        .into_iter()
        .find(|role| under_prefix(path, role.prefix()))
}

pub fn route_decision(path: &str, role: Option<Role>) -> RouteDecision {
    if path == LOGIN_PATH {
        return match role {
            Some(role) => RouteDecision::Redirect(role.dashboard().to_string()),
            None => RouteDecision::Allow,
        };
    }

    let Some(owner) = protected_role(path) else {
        return RouteDecision::Allow;
    };

    match role {
        None => RouteDecision::Redirect(format!(
            "{LOGIN_PATH}?next={}",
            urlencoding::encode(path)
        )),
        Some(role) if role == owner => RouteDecision::Allow,
        Some(role) => RouteDecision::Redirect(role.dashboard().to_string()),
    }
}

/// Decodes the session cookie and resolves the account's current role,
/// preferring the role cache over the database.
pub async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let token = cookie_value(headers, SESSION_COOKIE)?;
    let claims = match decode_session(token, &state.config.session_secret) {
        Ok(claims) => claims,
        Err(e) => {
            debug!("ignoring session cookie: {e}");
            return None;
        }
    };

    if let Some(role) = state.roles.get(&claims.uid) {
        return Some(Session {
            uid: claims.uid,
            role,
        });
    }

    match db::user_role(&state.pool, claims.uid).await {
        Ok(Some(role)) => {
            if role != claims.role {
                debug!(uid = %claims.uid, "session role differs from stored role");
            }
            state.roles.insert(claims.uid, role);
            Some(Session {
                uid: claims.uid,
                role,
            })
        }
        Ok(None) => None,
        Err(e) => {
            warn!("role lookup failed: {e}");
            None
        }
    }
}

pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let session = resolve_session(&state, request.headers()).await;
    let path = request.uri().path().to_string();

    match route_decision(&path, session.map(|s| s.role)) {
        RouteDecision::Allow => {
            if let Some(session) = session {
                request.extensions_mut().insert(session);
            }
            next.run(request).await
        }
        RouteDecision::Redirect(to) => {
            debug!(%path, %to, "redirecting");
            Redirect::to(&to).into_response()
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Session {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<Session>() {
            return Ok(*session);
        }
        resolve_session(state, &parts.headers)
            .await
            .ok_or(AppError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn anonymous_visitor_is_sent_to_login() {
        assert_eq!(
            route_decision("/admin/students", None),
            RouteDecision::Redirect("/login?next=%2Fadmin%2Fstudents".to_string())
        );
    }

    #[test]
    fn next_parameter_survives_reserved_characters() {
        assert_eq!(
            route_decision("/admin/a&b#c", None),
            RouteDecision::Redirect("/login?next=%2Fadmin%2Fa%26b%23c".to_string())
        );
    }

    #[test]
    fn matching_role_is_allowed() {
        assert_eq!(
            route_decision("/dosen/dashboard", Some(Role::Dosen)),
            RouteDecision::Allow
        );
        assert_eq!(route_decision("/mahasiswa", Some(Role::Mahasiswa)), RouteDecision::Allow);
    }

    #[test]
    fn cross_role_access_redirects_to_own_dashboard() {
        for role in Role::ALL {
            for owner in Role::ALL {
                let path = format!("{}/dashboard", owner.prefix());
                let decision = route_decision(&path, Some(role));
                if role == owner {
                    assert_eq!(decision, RouteDecision::Allow);
                } else {
                    assert_eq!(decision, RouteDecision::Redirect(role.dashboard().to_string()));
                }
            }
        }
    }

    #[test]
    fn prefix_match_respects_segment_boundary() {
        assert_eq!(protected_role("/administrasi"), None);
        assert_eq!(protected_role("/admin/users"), Some(Role::Admin));
        assert_eq!(route_decision("/dosenku", None), RouteDecision::Allow);
    }

    #[test]
    fn logged_in_user_skips_login_page() {
        assert_eq!(
            route_decision("/login", Some(Role::Admin)),
            RouteDecision::Redirect("/admin/dashboard".to_string())
        );
        assert_eq!(route_decision("/login", None), RouteDecision::Allow);
    }

    #[test]
    fn public_and_api_paths_pass_through() {
        assert_eq!(route_decision("/", None), RouteDecision::Allow);
        assert_eq!(route_decision("/api/rules", None), RouteDecision::Allow);
    }

    #[test]
    fn require_role_rejects_other_roles() {
        let session = Session {
            uid: Uuid::new_v4(),
            role: Role::Mahasiswa,
        };
        assert!(session.require_role(&[Role::Mahasiswa]).is_ok());
        assert!(matches!(
            session.require_role(&[Role::Admin, Role::Dosen]),
            Err(AppError::Forbidden(_))
        ));
    }
}
