//! HTTP control surface: router assembly, shared state, response
//! envelopes, bearer-token middleware, and embedded static assets.

pub mod assets;
pub mod envelope;
mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::apn::ApnManager;
use crate::auth::Auth;
use crate::data_bearer::DataBearer;
use crate::ipv6fwd::Ipv6Fwd;
use crate::modem::Modem;
use crate::rathole::RatholeController;
use crate::sms::SmsEngine;
use crate::usb_mode::UsbMode;

/// Everything a handler needs: every component, shared behind an `Arc`.
pub struct AppState {
    /// `auth`.
    pub auth: Arc<Auth>,
    /// `modem`.
    pub modem: Arc<Modem>,
    /// `data_bearer`.
    pub data_bearer: Arc<DataBearer>,
    /// `sms`.
    pub sms: Arc<SmsEngine>,
    /// `apn`.
    pub apn: Arc<ApnManager>,
    /// `ipv6fwd`.
    pub ipv6fwd: Arc<Ipv6Fwd>,
    /// `rathole`.
    pub rathole: Arc<RatholeController>,
    /// `usb_mode`.
    pub usb_mode: Arc<UsbMode>,
}

/// Build the full router: CORS, bearer-token auth, static assets, and
/// every `/api/*` endpoint.
#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/info", get(handlers::info::info))
        .route("/api/at", post(handlers::info::execute_at))
        .route("/api/set_network", post(handlers::network::set_network))
        .route("/api/switch", post(handlers::network::switch))
        .route("/api/airplane_mode", post(handlers::network::airplane_mode))
        .route(
            "/api/data",
            get(handlers::network::get_data).post(handlers::network::set_data),
        )
        .route(
            "/api/roaming",
            get(handlers::network::get_roaming).post(handlers::network::set_roaming),
        )
        .route("/api/current_band", get(handlers::network::current_band))
        .route("/api/sms", get(handlers::sms::list).post(handlers::sms::send))
        .route("/api/sms/{id}", axum::routing::delete(handlers::sms::delete))
        .route(
            "/api/sms/webhook",
            get(handlers::sms::webhook_config).post(handlers::sms::save_webhook_config),
        )
        .route("/api/sms/webhook/test", post(handlers::sms::test_webhook))
        .route(
            "/api/sms/config",
            get(handlers::sms::get_config).post(handlers::sms::save_config),
        )
        .route("/api/sms/fix", post(handlers::sms::set_fix))
        .route(
            "/api/apn/templates",
            get(handlers::apn::list_templates).post(handlers::apn::add_template),
        )
        .route(
            "/api/apn/templates/{id}",
            axum::routing::put(handlers::apn::update_template)
                .delete(handlers::apn::delete_template),
        )
        .route(
            "/api/apn/config",
            get(handlers::apn::get_config).post(handlers::apn::save_config),
        )
        .route("/api/apn/apply", post(handlers::apn::apply))
        .route("/api/apn/clear", post(handlers::apn::clear))
        .route(
            "/api/rathole/config",
            get(handlers::rathole::get_config).post(handlers::rathole::save_config),
        )
        .route(
            "/api/rathole/services",
            get(handlers::rathole::list_services).post(handlers::rathole::add_service),
        )
        .route(
            "/api/rathole/services/{id}",
            axum::routing::put(handlers::rathole::update_service)
                .delete(handlers::rathole::delete_service),
        )
        .route("/api/rathole/start", post(handlers::rathole::start))
        .route("/api/rathole/stop", post(handlers::rathole::stop))
        .route("/api/rathole/restart", post(handlers::rathole::restart))
        .route("/api/rathole/status", get(handlers::rathole::status))
        .route("/api/rathole/logs", get(handlers::rathole::logs))
        .route(
            "/api/rathole/server-config",
            get(handlers::rathole::server_config),
        )
        .route(
            "/api/ipv6-proxy/config",
            get(handlers::ipv6::get_config).post(handlers::ipv6::save_config),
        )
        .route(
            "/api/ipv6-proxy/rules",
            get(handlers::ipv6::list_rules).post(handlers::ipv6::add_rule),
        )
        .route(
            "/api/ipv6-proxy/rules/{id}",
            axum::routing::put(handlers::ipv6::set_enabled).delete(handlers::ipv6::delete_rule),
        )
        .route("/api/ipv6-proxy/start", post(handlers::ipv6::start))
        .route("/api/ipv6-proxy/stop", post(handlers::ipv6::stop))
        .route("/api/ipv6-proxy/restart", post(handlers::ipv6::restart))
        .route("/api/ipv6-proxy/send", post(handlers::ipv6::send))
        .route("/api/ipv6-proxy/test", post(handlers::ipv6::test))
        .route("/api/ipv6-proxy/status", get(handlers::ipv6::status))
        .route("/api/ipv6-proxy/send-logs", get(handlers::ipv6::send_logs))
        .route(
            "/api/usb/mode",
            get(handlers::usb::get_mode).post(handlers::usb::set_mode),
        )
        .route("/api/usb-advance", post(handlers::usb::advance))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/status", get(handlers::auth::status))
        .route("/api/auth/password", post(handlers::auth::change_password))
        .route(
            "/api/auth/security-questions",
            post(handlers::auth::setup_security_questions),
        )
        .route("/api/auth/password-recovery", post(handlers::auth::reset_password))
        .route("/api/auth/factory-reset", post(handlers::auth::factory_reset))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::require_auth,
        ));

    Router::new()
        .merge(api)
        .fallback(get(static_asset))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn static_asset(uri: axum::http::Uri) -> Response {
    match assets::resolve(uri.path()) {
        Some((content_type, bytes)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
            Body::from(bytes),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

