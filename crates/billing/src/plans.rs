//! Plan descriptors derived from Stripe product/price metadata
//!
//! A plan is not persisted as its own entity: its identifier, display name,
//! unit price, interval, and usage limits are all sourced from the price and
//! its product's metadata. A descriptor with a missing required limit or an
//! out-of-bounds value is rejected, not silently clamped — that indicates a
//! product-catalog defect.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use costscope_shared::UsageLimits;
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

pub const SEAT_LIMIT_BOUNDS: RangeInclusive<i32> = 1..=1000;
pub const PROVIDER_LIMIT_BOUNDS: RangeInclusive<i32> = 1..=100;
pub const DAILY_PIPELINE_BOUNDS: RangeInclusive<i32> = 1..=10000;
pub const CONCURRENT_PIPELINE_BOUNDS: RangeInclusive<i32> = 1..=50;

/// A plan as derived from Stripe price/product metadata
#[derive(Debug, Clone, Serialize)]
pub struct PlanDescriptor {
    /// Stripe price id, used as the plan identifier
    pub price_id: String,
    /// Display name (product name, else price nickname)
    pub name: String,
    /// Unit price in cents
    pub unit_amount_cents: i64,
    /// Billing interval (month/year)
    pub interval: String,
    pub limits: UsageLimits,
}

impl PlanDescriptor {
    /// Derive a descriptor from a price retrieved with `expand[]=product`.
    pub fn from_price(price: &stripe::Price) -> BillingResult<Self> {
        let product = match price.product.as_ref() {
            Some(stripe::Expandable::Object(product)) => Some(product.as_ref()),
            _ => None,
        };

        // Limits live on the product; price metadata is the fallback so
        // per-price overrides (e.g. annual variants) remain possible.
        let mut metadata: HashMap<String, String> = product
            .and_then(|p| p.metadata.clone())
            .unwrap_or_default();
        if let Some(price_meta) = price.metadata.as_ref() {
            for (k, v) in price_meta {
                metadata.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        let limits = limits_from_metadata(&metadata)?;

        let name = product
            .and_then(|p| p.name.clone())
            .or_else(|| price.nickname.clone())
            .ok_or_else(|| {
                BillingError::PlanConfig(format!("price {} has no product name", price.id))
            })?;

        let interval = price
            .recurring
            .as_ref()
            .map(|r| r.interval.as_str().to_string())
            .ok_or_else(|| {
                BillingError::PlanConfig(format!("price {} is not recurring", price.id))
            })?;

        Ok(Self {
            price_id: price.id.to_string(),
            name,
            unit_amount_cents: price.unit_amount.unwrap_or(0),
            interval,
            limits,
        })
    }
}

/// Parse and bounds-check usage limits from a metadata map.
///
/// Required keys: `seat_limit`, `provider_limit`, `pipeline_runs_per_day`,
/// `concurrent_pipelines`. Weekly/monthly run limits default to day*7 and
/// day*30 when absent.
pub fn limits_from_metadata(metadata: &HashMap<String, String>) -> BillingResult<UsageLimits> {
    let seat_limit = required_limit(metadata, "seat_limit", SEAT_LIMIT_BOUNDS)?;
    let provider_limit = required_limit(metadata, "provider_limit", PROVIDER_LIMIT_BOUNDS)?;
    let per_day = required_limit(metadata, "pipeline_runs_per_day", DAILY_PIPELINE_BOUNDS)?;
    let concurrent = required_limit(metadata, "concurrent_pipelines", CONCURRENT_PIPELINE_BOUNDS)?;

    let per_week = optional_limit(metadata, "pipeline_runs_per_week")?
        .unwrap_or_else(|| per_day.saturating_mul(7));
    let per_month = optional_limit(metadata, "pipeline_runs_per_month")?
        .unwrap_or_else(|| per_day.saturating_mul(30));

    Ok(UsageLimits {
        seat_limit,
        provider_limit,
        pipeline_runs_per_day: per_day,
        pipeline_runs_per_week: per_week,
        pipeline_runs_per_month: per_month,
        concurrent_pipelines: concurrent,
    })
}

fn required_limit(
    metadata: &HashMap<String, String>,
    key: &str,
    bounds: RangeInclusive<i32>,
) -> BillingResult<i32> {
    let raw = metadata
        .get(key)
        .ok_or_else(|| BillingError::PlanConfig(format!("missing metadata field '{}'", key)))?;

    let value: i32 = raw.trim().parse().map_err(|_| {
        BillingError::PlanConfig(format!("metadata field '{}' is not a number: '{}'", key, raw))
    })?;

    if !bounds.contains(&value) {
        return Err(BillingError::PlanConfig(format!(
            "metadata field '{}' = {} is outside the allowed range {}..={}",
            key,
            value,
            bounds.start(),
            bounds.end()
        )));
    }

    Ok(value)
}

fn optional_limit(metadata: &HashMap<String, String>, key: &str) -> BillingResult<Option<i32>> {
    match metadata.get(key) {
        None => Ok(None),
        Some(raw) => {
            let value: i32 = raw.trim().parse().map_err(|_| {
                BillingError::PlanConfig(format!(
                    "metadata field '{}' is not a number: '{}'",
                    key, raw
                ))
            })?;
            if value < 1 {
                return Err(BillingError::PlanConfig(format!(
                    "metadata field '{}' must be positive, got {}",
                    key, value
                )));
            }
            Ok(Some(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_metadata() -> HashMap<String, String> {
        metadata(&[
            ("seat_limit", "25"),
            ("provider_limit", "10"),
            ("pipeline_runs_per_day", "500"),
            ("concurrent_pipelines", "5"),
        ])
    }

    #[test]
    fn test_parses_valid_limits() {
        let limits = limits_from_metadata(&full_metadata()).unwrap();
        assert_eq!(limits.seat_limit, 25);
        assert_eq!(limits.provider_limit, 10);
        assert_eq!(limits.pipeline_runs_per_day, 500);
        assert_eq!(limits.concurrent_pipelines, 5);
    }

    #[test]
    fn test_weekly_monthly_derived_when_absent() {
        let limits = limits_from_metadata(&full_metadata()).unwrap();
        assert_eq!(limits.pipeline_runs_per_week, 3500);
        assert_eq!(limits.pipeline_runs_per_month, 15000);
    }

    #[test]
    fn test_weekly_monthly_from_metadata_when_present() {
        let mut meta = full_metadata();
        meta.insert("pipeline_runs_per_week".to_string(), "2000".to_string());
        meta.insert("pipeline_runs_per_month".to_string(), "6000".to_string());
        let limits = limits_from_metadata(&meta).unwrap();
        assert_eq!(limits.pipeline_runs_per_week, 2000);
        assert_eq!(limits.pipeline_runs_per_month, 6000);
    }

    #[test]
    fn test_seat_limit_out_of_bounds_rejected() {
        let mut meta = full_metadata();
        meta.insert("seat_limit".to_string(), "2000".to_string());
        let err = limits_from_metadata(&meta).unwrap_err();
        assert!(
            matches!(err, BillingError::PlanConfig(_)),
            "out-of-bounds must be a config error, got {:?}",
            err
        );
    }

    #[test]
    fn test_zero_and_negative_rejected() {
        for bad in ["0", "-1"] {
            let mut meta = full_metadata();
            meta.insert("concurrent_pipelines".to_string(), bad.to_string());
            assert!(limits_from_metadata(&meta).is_err(), "value {} accepted", bad);
        }
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let mut meta = full_metadata();
        meta.remove("provider_limit");
        let err = limits_from_metadata(&meta).unwrap_err();
        assert!(err.to_string().contains("provider_limit"));
    }

    #[test]
    fn test_non_numeric_rejected() {
        let mut meta = full_metadata();
        meta.insert("pipeline_runs_per_day".to_string(), "lots".to_string());
        assert!(limits_from_metadata(&meta).is_err());
    }

    #[test]
    fn test_boundary_values_accepted() {
        let meta = metadata(&[
            ("seat_limit", "1000"),
            ("provider_limit", "1"),
            ("pipeline_runs_per_day", "10000"),
            ("concurrent_pipelines", "50"),
        ]);
        assert!(limits_from_metadata(&meta).is_ok());
    }
}
