//! Input checks shared by the issuance engine and configuration loading.

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::FiscalSettings;

/// Longest fiscal store id the revenue agency registers.
pub const MAX_FISCAL_STORE_ID_LEN: usize = 32;

/// Longest upstream order id accepted.
pub const MAX_ORDER_ID_LEN: usize = 128;

pub fn validate_order_id(order_id: &str) -> Result<(), ValidationError> {
    if order_id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "order_id".to_string(),
        });
    }
    if order_id.len() > MAX_ORDER_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "order_id".to_string(),
            max: MAX_ORDER_ID_LEN,
        });
    }
    Ok(())
}

/// Checks settings before any receipt is issued with them.
///
/// A missing store id is not an error here: it only makes orders ineligible.
pub fn validate_fiscal_settings(settings: &FiscalSettings) -> Result<(), ValidationError> {
    if let Some(raw) = &settings.fiscal_store_id {
        let store_id = raw.trim();
        if store_id.len() > MAX_FISCAL_STORE_ID_LEN {
            return Err(ValidationError::TooLong {
                field: "fiscal_store_id".to_string(),
                max: MAX_FISCAL_STORE_ID_LEN,
            });
        }
        if store_id.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidFormat {
                field: "fiscal_store_id".to_string(),
                reason: "must not contain whitespace".to_string(),
            });
        }
    }
    Ok(())
}

/// Resolves the amount a refund receipt accounts for.
///
/// `requested = None` refunds everything still refundable. Returns the
/// effective amount in cents.
pub fn validate_refund_amount(
    order_id: &str,
    requested: Option<i64>,
    sale_amount_cents: i64,
    already_refunded_cents: i64,
) -> CoreResult<i64> {
    let remaining = (sale_amount_cents - already_refunded_cents).max(0);

    let Some(amount) = requested else {
        if remaining == 0 {
            return Err(CoreError::RefundExceedsRemaining {
                order_id: order_id.to_string(),
                requested: sale_amount_cents,
                remaining,
            });
        }
        return Ok(remaining);
    };

    if amount <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "refund_amount".to_string(),
        }
        .into());
    }
    if amount > remaining {
        return Err(CoreError::RefundExceedsRemaining {
            order_id: order_id.to_string(),
            requested: amount,
            remaining,
        });
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_amounts() {
        assert_eq!(validate_refund_amount("o1", None, 10000, 0).unwrap(), 10000);
        assert_eq!(validate_refund_amount("o1", None, 10000, 2500).unwrap(), 7500);
        assert_eq!(validate_refund_amount("o1", Some(2500), 10000, 0).unwrap(), 2500);

        assert!(matches!(
            validate_refund_amount("o1", Some(15000), 10000, 0),
            Err(CoreError::RefundExceedsRemaining { remaining: 10000, .. })
        ));
        assert!(matches!(
            validate_refund_amount("o1", None, 10000, 10000),
            Err(CoreError::RefundExceedsRemaining { remaining: 0, .. })
        ));
        assert!(matches!(
            validate_refund_amount("o1", Some(0), 10000, 0),
            Err(CoreError::Validation(ValidationError::MustBePositive { .. }))
        ));
    }

    #[test]
    fn test_fiscal_settings() {
        let ok = FiscalSettings {
            fiscal_store_id: Some(" RF0001 ".to_string()),
            ..Default::default()
        };
        assert!(validate_fiscal_settings(&ok).is_ok());
        assert!(validate_fiscal_settings(&FiscalSettings::default()).is_ok());

        let spaced = FiscalSettings {
            fiscal_store_id: Some("RF 0001".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate_fiscal_settings(&spaced),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_order_id() {
        assert!(validate_order_id("o1").is_ok());
        assert!(validate_order_id("  ").is_err());
        assert!(validate_order_id(&"x".repeat(200)).is_err());
    }
}
