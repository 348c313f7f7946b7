// =============================================================================
// Orders — model, lifecycle state machine, fill accounting
// =============================================================================
//
// Lifecycle: pending -> open -> {partial -> filled | filled | cancelled |
// rejected | expired}. Transitions are monotonic and terminal states are
// frozen; every mutation goes through `transition` or `apply_fill` so the
// machine cannot be bypassed.
// =============================================================================

pub mod manager;
pub mod validator;

pub use manager::{NewOrderRequest, OrderFilters, OrderManager, OrderStats};
pub use validator::{OrderValidator, ValidationReport};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Pair, Side};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    Oco,
}

impl OrderType {
    pub fn requires_price(&self) -> bool {
        matches!(self, Self::Limit | Self::StopLimit | Self::Oco)
    }

    pub fn requires_stop_price(&self) -> bool {
        matches!(self, Self::Stop | Self::StopLimit | Self::Oco)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "market",
            Self::Limit => "limit",
            Self::Stop => "stop",
            Self::StopLimit => "stop_limit",
            Self::Oco => "oco",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "FOK")]
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Monotonic lifecycle transitions.
    pub fn can_transition(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Pending, Open)
                | (Pending, Cancelled)
                | (Pending, Rejected)
                | (Open, Partial)
                | (Open, Filled)
                | (Open, Cancelled)
                | (Open, Rejected)
                | (Open, Expired)
                | (Partial, Filled)
                | (Partial, Cancelled)
                | (Partial, Expired)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Partial => "partial",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// One fill appended to an order (append-only).
#[derive(Debug, Clone, Serialize)]
pub struct OrderTrade {
    pub trade_id: String,
    pub price: f64,
    pub amount: f64,
    pub fee: f64,
    pub side: Side,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub exchange: String,
    pub pair: Pair,
    pub order_type: OrderType,
    pub side: Side,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    pub tif: TimeInForce,
    pub status: OrderStatus,
    pub filled_amount: f64,
    pub remaining_amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_price: Option<f64>,
    pub fee: f64,
    pub fee_currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    pub trades: Vec<OrderTrade>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        exchange: &str,
        pair: Pair,
        order_type: OrderType,
        side: Side,
        amount: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        tif: TimeInForce,
        strategy_id: Option<String>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        let fee_currency = pair.quote.clone();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            exchange: exchange.to_string(),
            pair,
            order_type,
            side,
            amount,
            price,
            stop_price,
            tif,
            status: OrderStatus::Pending,
            filled_amount: 0.0,
            remaining_amount: amount,
            average_price: None,
            fee: 0.0,
            fee_currency,
            strategy_id,
            trades: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
            filled_at: None,
            cancelled_at: None,
            external_id: None,
        }
    }

    /// An order can be cancelled until it reaches a terminal state.
    pub fn can_cancel(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::Partial
        )
    }

    /// Move the lifecycle forward, enforcing the machine.
    pub fn transition(&mut self, to: OrderStatus) -> CoreResult<()> {
        if !self.status.can_transition(to) {
            return Err(CoreError::conflict(format!(
                "order {}: illegal transition {} -> {to}",
                self.id, self.status
            )));
        }
        self.status = to;
        let now = Utc::now().to_rfc3339();
        match to {
            OrderStatus::Filled => self.filled_at = Some(now.clone()),
            OrderStatus::Cancelled => self.cancelled_at = Some(now.clone()),
            _ => {}
        }
        self.updated_at = now;
        Ok(())
    }

    /// Append a fill and recompute the derived fields. Transitions to
    /// `Partial` or `Filled` as the remaining amount allows.
    pub fn apply_fill(&mut self, trade: OrderTrade) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::conflict(format!(
                "order {}: fill on terminal status {}",
                self.id, self.status
            )));
        }
        if trade.amount <= 0.0 || trade.price <= 0.0 {
            return Err(CoreError::validation("fill must have positive price/amount"));
        }
        if trade.amount > self.remaining_amount + 1e-12 {
            return Err(CoreError::conflict(format!(
                "order {}: fill {} exceeds remaining {}",
                self.id, trade.amount, self.remaining_amount
            )));
        }

        self.trades.push(trade);

        // Derived fields are always recomputed from the trade list.
        self.filled_amount = self.trades.iter().map(|t| t.amount).sum();
        self.remaining_amount = (self.amount - self.filled_amount).max(0.0);
        self.fee = self.trades.iter().map(|t| t.fee).sum();
        let notional: f64 = self.trades.iter().map(|t| t.price * t.amount).sum();
        self.average_price = (self.filled_amount > 0.0).then(|| notional / self.filled_amount);

        if self.remaining_amount <= 1e-12 {
            self.remaining_amount = 0.0;
            self.transition(OrderStatus::Filled)?;
        } else if self.status == OrderStatus::Open {
            self.transition(OrderStatus::Partial)?;
        } else {
            self.updated_at = Utc::now().to_rfc3339();
        }
        Ok(())
    }

    /// Quote value filled so far.
    pub fn filled_value(&self) -> f64 {
        self.average_price.unwrap_or(0.0) * self.filled_amount
    }
}
