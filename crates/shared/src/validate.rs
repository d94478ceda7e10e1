//! Input validation for caller-supplied identifiers
//!
//! Slugs and price ids are validated before any external call is made.

use thiserror::Error;

/// Validation failure for a caller-supplied identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid organization slug: {0}")]
    InvalidSlug(String),
    #[error("invalid price id: {0}")]
    InvalidPriceId(String),
}

const SLUG_MIN_LEN: usize = 3;
const SLUG_MAX_LEN: usize = 63;

/// Validate an organization slug.
///
/// Slugs are immutable tenant identifiers: 3-63 chars, lowercase
/// alphanumeric plus `_` and `-`, must start with a letter.
pub fn validate_org_slug(slug: &str) -> Result<(), ValidationError> {
    if slug.len() < SLUG_MIN_LEN || slug.len() > SLUG_MAX_LEN {
        return Err(ValidationError::InvalidSlug(format!(
            "must be {}-{} characters",
            SLUG_MIN_LEN, SLUG_MAX_LEN
        )));
    }
    let mut chars = slug.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => {
            return Err(ValidationError::InvalidSlug(
                "must start with a lowercase letter".to_string(),
            ))
        }
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidSlug(
            "only lowercase letters, digits, '_' and '-' are allowed".to_string(),
        ));
    }
    Ok(())
}

/// Validate a payment-processor price id (`price_` + alphanumeric).
pub fn validate_price_id(price_id: &str) -> Result<(), ValidationError> {
    let Some(rest) = price_id.strip_prefix("price_") else {
        return Err(ValidationError::InvalidPriceId(
            "must start with 'price_'".to_string(),
        ));
    };
    if rest.is_empty() || rest.len() > 250 {
        return Err(ValidationError::InvalidPriceId(
            "identifier part has invalid length".to_string(),
        ));
    }
    if !rest.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidPriceId(
            "identifier part must be alphanumeric".to_string(),
        ));
    }
    Ok(())
}
