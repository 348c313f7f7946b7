// =============================================================================
// Order Validator — request rules, amount bounds, advisory warnings
// =============================================================================
//
// Validation collects every violation rather than stopping at the first, so
// the caller sees the full list. Warnings are advisory and never block.
// =============================================================================

use serde::{Deserialize, Serialize};

use super::manager::NewOrderRequest;
use super::{Order, OrderType};

/// Amount and value bounds applied to every order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderLimits {
    pub min_order_amount: f64,
    pub max_order_amount: f64,
    /// Maximum decimal places on the amount.
    pub amount_precision: u32,
    pub min_order_value: f64,
    pub max_order_value: f64,
}

impl Default for OrderLimits {
    fn default() -> Self {
        Self {
            min_order_amount: 1e-6,
            max_order_amount: 1e6,
            amount_precision: 8,
            min_order_value: 1.0,
            max_order_value: 1e7,
        }
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct OrderValidator {
    limits: OrderLimits,
}

impl OrderValidator {
    pub fn new(limits: OrderLimits) -> Self {
        Self { limits }
    }

    /// Validate a creation request.
    pub fn validate(&self, req: &NewOrderRequest) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let limits = &self.limits;

        if req.user_id.trim().is_empty() {
            errors.push("userId is required".to_string());
        }
        if req.exchange.trim().is_empty() {
            errors.push("exchange is required".to_string());
        }

        if !pair_form_ok(&req.pair) {
            errors.push(format!(
                "pair '{}' must match BASE/QUOTE or BASE-QUOTE with 2-10 uppercase letters each",
                req.pair
            ));
        }

        // Amount bounds and precision.
        if !req.amount.is_finite() || req.amount <= 0.0 {
            errors.push("amount must be a positive number".to_string());
        } else {
            if req.amount < limits.min_order_amount {
                errors.push(format!(
                    "amount {} below minimum {}",
                    req.amount, limits.min_order_amount
                ));
            }
            if req.amount > limits.max_order_amount {
                errors.push(format!(
                    "amount {} above maximum {}",
                    req.amount, limits.max_order_amount
                ));
            }
            if !precision_ok(req.amount, limits.amount_precision) {
                errors.push(format!(
                    "amount {} exceeds {} decimal places",
                    req.amount, limits.amount_precision
                ));
            }
        }

        // Price requirements by order type.
        if req.order_type.requires_price() {
            match req.price {
                Some(p) if p > 0.0 && p.is_finite() => {}
                _ => errors.push(format!("{} orders require a positive price", req.order_type)),
            }
        }
        if req.order_type.requires_stop_price() {
            match req.stop_price {
                Some(p) if p > 0.0 && p.is_finite() => {}
                _ => errors.push(format!(
                    "{} orders require a positive stopPrice",
                    req.order_type
                )),
            }
        }

        // Stop-limit ordering: buy stops sit above the limit, sell stops below.
        if req.order_type == OrderType::StopLimit {
            if let (Some(stop), Some(price)) = (req.stop_price, req.price) {
                match req.side {
                    crate::types::Side::Buy if stop < price => errors.push(format!(
                        "buy stop_limit requires stopPrice {stop} >= price {price}"
                    )),
                    crate::types::Side::Sell if stop > price => errors.push(format!(
                        "sell stop_limit requires stopPrice {stop} <= price {price}"
                    )),
                    _ => {}
                }
            }
        }

        // Order value bounds, when a price is known.
        if let Some(price) = req.price.filter(|p| *p > 0.0) {
            let value = req.amount * price;
            if value < limits.min_order_value {
                errors.push(format!(
                    "order value {value:.2} below minimum {:.2}",
                    limits.min_order_value
                ));
            }
            if value > limits.max_order_value {
                errors.push(format!(
                    "order value {value:.2} above maximum {:.2}",
                    limits.max_order_value
                ));
            }
            if value > limits.max_order_value * 0.5 {
                warnings.push(format!(
                    "large order: value {value:.2} is over half the allowed maximum"
                ));
            }
        }

        if req.order_type == OrderType::Market {
            warnings.push("market orders may execute with slippage".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validate an amount update against an existing order: updates may only
    /// decrease the amount, never below what is already filled, and never on
    /// a terminal order.
    pub fn validate_update(&self, order: &Order, new_amount: f64) -> ValidationReport {
        let mut errors = Vec::new();

        if order.status.is_terminal() {
            errors.push(format!(
                "order {} is {} and cannot be updated",
                order.id, order.status
            ));
        }
        if !new_amount.is_finite() || new_amount <= 0.0 {
            errors.push("new amount must be a positive number".to_string());
        } else {
            if new_amount > order.amount {
                errors.push(format!(
                    "updates may only decrease amount ({} -> {new_amount})",
                    order.amount
                ));
            }
            if new_amount < order.filled_amount {
                errors.push(format!(
                    "new amount {new_amount} below already-filled {}",
                    order.filled_amount
                ));
            }
            if !precision_ok(new_amount, self.limits.amount_precision) {
                errors.push(format!(
                    "amount {new_amount} exceeds {} decimal places",
                    self.limits.amount_precision
                ));
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings: Vec::new(),
        }
    }
}

impl Default for OrderValidator {
    fn default() -> Self {
        Self::new(OrderLimits::default())
    }
}

/// `^[A-Z]{2,10}[/-][A-Z]{2,10}$` without pulling in a regex engine.
fn pair_form_ok(s: &str) -> bool {
    let Some(sep) = s.find(['/', '-']) else {
        return false;
    };
    let (base, quote) = s.split_at(sep);
    let quote = &quote[1..];
    let part_ok =
        |part: &str| (2..=10).contains(&part.len()) && part.chars().all(|c| c.is_ascii_uppercase());
    part_ok(base) && part_ok(quote)
}

/// True when `amount` has at most `precision` decimal places.
fn precision_ok(amount: f64, precision: u32) -> bool {
    let scaled = amount * 10f64.powi(precision as i32);
    (scaled - scaled.round()).abs() < 1e-6
}
