//! HTTP routing

pub mod billing;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::require_auth;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state);

    let authed = Router::new()
        .route("/api/billing/checkout", post(billing::create_onboarding_checkout))
        .route(
            "/api/billing/orgs/{slug}/checkout",
            post(billing::create_checkout_session),
        )
        .route(
            "/api/billing/orgs/{slug}/plan",
            post(billing::change_subscription_plan),
        )
        .route(
            "/api/billing/orgs/{slug}/resync",
            post(billing::resync_billing),
        )
        .route("/api/billing/orgs/{slug}", get(billing::get_billing_state))
        .route(
            "/api/billing/orgs/{slug}/history",
            get(billing::plan_change_history),
        )
        .route(
            "/api/billing/orgs/{slug}/invoices",
            get(billing::list_invoices),
        )
        .route(
            "/api/billing/orgs/{slug}/payment-methods",
            get(billing::list_payment_methods),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/billing/webhook", post(billing::stripe_webhook))
        .merge(authed)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        tracing::warn!("CORS_ALLOWED_ORIGINS not set, allowing any origin");
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
