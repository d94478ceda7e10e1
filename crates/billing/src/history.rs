//! Billing history reads
//!
//! Invoice and payment-method listings for the billing settings UI, read
//! straight from Stripe by stored customer reference. Nothing here
//! mutates; empty lists are returned for organizations without a billing
//! relationship.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{CustomerId, Invoice, ListInvoices, ListPaymentMethods, PaymentMethod};
use uuid::Uuid;

use costscope_shared::validate_org_slug;

use crate::client::{stripe_call, StripeClient, STRIPE_READ_TIMEOUT};
use crate::error::{BillingError, BillingResult};
use crate::orgs;

/// One invoice, as shown in the billing history list
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceSummary {
    pub id: String,
    pub number: Option<String>,
    pub status: Option<String>,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: Option<String>,
    /// Unix seconds
    pub created: Option<i64>,
    pub hosted_invoice_url: Option<String>,
}

/// A stored card, as shown in the payment methods list
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodSummary {
    pub id: String,
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}

/// Read-only billing history service
pub struct BillingHistoryService {
    stripe: StripeClient,
    pool: PgPool,
}

impl BillingHistoryService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Recent invoices for the organization's customer, newest first.
    pub async fn list_invoices(
        &self,
        org_slug: &str,
        acting_user_id: Uuid,
    ) -> BillingResult<Vec<InvoiceSummary>> {
        let Some(customer_id) = self.customer_for_owner(org_slug, acting_user_id).await? else {
            return Ok(vec![]);
        };

        let mut params = ListInvoices::new();
        params.customer = Some(customer_id);
        params.limit = Some(24);

        let invoices = stripe_call(
            STRIPE_READ_TIMEOUT,
            Invoice::list(self.stripe.inner(), &params),
        )
        .await?;

        Ok(invoices
            .data
            .into_iter()
            .map(|invoice| InvoiceSummary {
                id: invoice.id.to_string(),
                number: invoice.number.clone(),
                status: invoice.status.map(|s| s.to_string()),
                amount_due_cents: invoice.amount_due.unwrap_or(0),
                amount_paid_cents: invoice.amount_paid.unwrap_or(0),
                currency: invoice.currency.map(|c| c.to_string()),
                created: invoice.created,
                hosted_invoice_url: invoice.hosted_invoice_url.clone(),
            })
            .collect())
    }

    /// Cards on file for the organization's customer.
    pub async fn list_payment_methods(
        &self,
        org_slug: &str,
        acting_user_id: Uuid,
    ) -> BillingResult<Vec<PaymentMethodSummary>> {
        let Some(customer_id) = self.customer_for_owner(org_slug, acting_user_id).await? else {
            return Ok(vec![]);
        };

        let mut params = ListPaymentMethods::new();
        params.customer = Some(customer_id);
        params.type_ = Some(stripe::PaymentMethodTypeFilter::Card);

        let methods = stripe_call(
            STRIPE_READ_TIMEOUT,
            PaymentMethod::list(self.stripe.inner(), &params),
        )
        .await?;

        Ok(methods
            .data
            .into_iter()
            .filter_map(|method| {
                let card = method.card?;
                Some(PaymentMethodSummary {
                    id: method.id.to_string(),
                    brand: card.brand,
                    last4: card.last4,
                    exp_month: card.exp_month,
                    exp_year: card.exp_year,
                })
            })
            .collect())
    }

    /// Owner-gated lookup of the stored customer reference.
    async fn customer_for_owner(
        &self,
        org_slug: &str,
        acting_user_id: Uuid,
    ) -> BillingResult<Option<CustomerId>> {
        validate_org_slug(org_slug)?;
        let org = orgs::fetch_org_by_slug(&self.pool, org_slug).await?;
        orgs::require_sole_owner(&self.pool, org.id, acting_user_id).await?;

        match org.stripe_customer_id.as_deref() {
            None => Ok(None),
            Some(raw) => {
                let id = raw.parse::<CustomerId>().map_err(|e| {
                    BillingError::StripeApi(format!("Invalid stored customer id: {}", e))
                })?;
                Ok(Some(id))
            }
        }
    }
}
