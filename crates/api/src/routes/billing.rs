//! Billing endpoints
//!
//! Thin handlers over the billing crate's orchestrators. Every response is
//! a structured success/error body; billing errors are mapped by
//! [`crate::error::ApiError`] and never escape as panics.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use serde::Deserialize;

use costscope_billing::BillingError;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct OnboardingCheckoutRequest {
    pub price_id: String,
    /// Billing email collected during signup
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PriceRequest {
    pub price_id: String,
}

/// POST /api/billing/checkout
///
/// Onboarding checkout: no organization exists yet.
pub async fn create_onboarding_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<OnboardingCheckoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .billing
        .checkout
        .create_onboarding_session(user.user_id, &body.email, &body.price_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "session_id": session.session_id,
        "url": session.url,
    })))
}

/// POST /api/billing/orgs/{slug}/checkout
///
/// Upgrade-to-paid checkout for an existing organization.
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PriceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .billing
        .checkout
        .create_org_session(user.user_id, &slug, &body.price_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "session_id": session.session_id,
        "url": session.url,
    })))
}

/// POST /api/billing/orgs/{slug}/plan
pub async fn change_subscription_plan(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<PriceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .billing
        .subscriptions
        .change_plan(&slug, &body.price_id, user.user_id)
        .await?;

    Ok(Json(serde_json::to_value(&outcome).map_err(|e| {
        ApiError::from(BillingError::Database(e.to_string()))
    })?))
}

/// POST /api/billing/orgs/{slug}/resync
pub async fn resync_billing(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .billing
        .resync
        .resync(&slug, user.user_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": outcome.success,
        "message": outcome.message,
    })))
}

/// GET /api/billing/orgs/{slug}
///
/// Current mirrored billing state, as read by the UI.
pub async fn get_billing_state(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    costscope_shared::validate_org_slug(&slug)
        .map_err(|e| ApiError::bad_request(&e.to_string()))?;

    let org = costscope_billing::orgs::fetch_org_by_slug(&state.pool, &slug).await?;
    costscope_billing::orgs::require_sole_owner(&state.pool, org.id, user.user_id).await?;

    let organization = sqlx::query_as::<_, costscope_shared::Organization>(
        "SELECT * FROM organizations WHERE id = $1",
    )
    .bind(org.id)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| ApiError::from(BillingError::Database(e.to_string())))?;

    Ok(Json(serde_json::json!({
        "success": true,
        "organization": organization,
    })))
}

/// GET /api/billing/orgs/{slug}/history
pub async fn plan_change_history(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    costscope_shared::validate_org_slug(&slug)
        .map_err(|e| ApiError::bad_request(&e.to_string()))?;

    let org = costscope_billing::orgs::fetch_org_by_slug(&state.pool, &slug).await?;
    costscope_billing::orgs::require_sole_owner(&state.pool, org.id, user.user_id).await?;

    let records = state.billing.subscriptions.audit().history(org.id).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "records": records,
    })))
}

/// GET /api/billing/orgs/{slug}/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let invoices = state
        .billing
        .history
        .list_invoices(&slug, user.user_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "invoices": invoices,
    })))
}

/// GET /api/billing/orgs/{slug}/payment-methods
pub async fn list_payment_methods(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let methods = state
        .billing
        .history
        .list_payment_methods(&slug, user.user_id)
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "payment_methods": methods,
    })))
}

/// POST /api/billing/webhook
///
/// Signature-verified Stripe event intake. Processing failures that Stripe
/// should retry (datastore or processor outages) return 5xx; everything
/// else is acknowledged.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing Stripe-Signature header"))?;

    let event = state.billing.webhooks.verify(&body, signature)?;
    let event_type = format!("{:?}", event.type_);

    if let Err(e) = state.billing.webhooks.handle_event(event).await {
        match &e {
            BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::StripeTimeout => {
                tracing::error!(event_type = %event_type, error = %e, "Webhook processing failed, Stripe will retry");
                return Err(ApiError::from(e));
            }
            other => {
                // Acknowledge: retrying cannot fix a non-transient failure
                tracing::warn!(event_type = %event_type, error = %other, "Webhook event not applied");
            }
        }
    }

    Ok(Json(serde_json::json!({ "received": true })))
}
