use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header::CONTENT_TYPE, Method},
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::guard::guard_middleware;
use crate::state::AppState;
use crate::uploads::MAX_IMAGE_BYTES;

mod admin;
mod auth;
mod pages;
mod resources;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/healthz", get(pages::healthz))
        .route("/login", get(pages::login_page))
        .route("/admin/dashboard", get(pages::admin_dashboard))
        .route("/dosen/dashboard", get(pages::dosen_dashboard))
        .route("/mahasiswa/dashboard", get(pages::mahasiswa_dashboard))
        // auth namespace
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/verify", get(auth::verify))
        .route("/api/auth/logout", post(auth::logout))
        // admin namespace
        .route("/api/admin/students/import", post(admin::import_students))
        .route("/api/admin/users/:uid", delete(admin::delete_user))
        .route("/api/admin/settings", get(admin::get_settings).put(admin::put_settings))
        .route("/api/admin/recompute", post(admin::recompute))
        .route("/api/upload-image", post(admin::upload_image).delete(admin::delete_image))
        .route("/api/notifications/send", post(admin::send_notification))
        // resources
        .route("/api/students", get(resources::list_students).post(resources::create_student))
        .route(
            "/api/students/:id",
            get(resources::get_student)
                .put(resources::update_student)
                .delete(resources::delete_student),
        )
        .route("/api/rules", get(resources::list_rules).post(resources::create_rule))
        .route("/api/rules/:id", put(resources::update_rule).delete(resources::delete_rule))
        .route(
            "/api/violations",
            get(resources::list_violations).post(resources::create_violation),
        )
        .route(
            "/api/violations/:id",
            get(resources::get_violation).delete(resources::delete_violation),
        )
        .route("/api/me/violations", get(resources::my_violations))
        .route("/api/appeals", get(resources::list_appeals).post(resources::create_appeal))
        .route("/api/appeals/:id/decision", post(resources::decide_appeal))
        .route(
            "/api/announcements",
            get(resources::list_announcements).post(resources::create_announcement),
        )
        .route(
            "/api/announcements/:id",
            put(resources::update_announcement).delete(resources::delete_announcement),
        )
        .route("/api/calendar", get(resources::list_events).post(resources::create_event))
        .route(
            "/api/calendar/:id",
            put(resources::update_event).delete(resources::delete_event),
        )
        .route("/api/notifications", get(resources::list_notifications))
        .route("/api/notifications/unread-count", get(resources::unread_count))
        .route("/api/notifications/read-all", post(resources::mark_all_read))
        .route("/api/notifications/:id/read", post(resources::mark_read))
        .route("/api/push-tokens", post(resources::register_push_token))
        .layer(from_fn_with_state(state.clone(), guard_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + 64 * 1024))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let app = router(state);
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
