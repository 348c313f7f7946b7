// =============================================================================
// Position Manager — per-user/asset holdings with weighted-average P&L
// =============================================================================
//
// Positions are keyed `user:exchange:asset`. Buys fold the fee into cost and
// re-derive the weighted average entry; sells realize
// `proceeds - fee - amount * avgEntry` and release cost basis. Each position
// record is mutated under its own lock, so fills for different keys never
// contend.
//
// Invariants: `available + locked = total >= 0`; `total_cost >= 0`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::types::Side;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One fill applied to a position.
#[derive(Debug, Clone, Serialize)]
pub struct PositionTrade {
    pub trade_id: String,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    /// P&L realized by this trade (zero for buys).
    pub realized_pnl: f64,
    pub ts: i64,
}

/// A user's holding of one asset on one exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub user_id: String,
    pub exchange: String,
    pub asset: String,
    pub total_amount: f64,
    pub available_amount: f64,
    pub locked_amount: f64,
    pub average_entry_price: f64,
    pub total_cost: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fees: f64,
    pub trades: Vec<PositionTrade>,
    pub created_at: String,
    pub updated_at: String,
}

impl Position {
    fn new(user_id: &str, exchange: &str, asset: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            user_id: user_id.to_string(),
            exchange: exchange.to_string(),
            asset: asset.to_string(),
            total_amount: 0.0,
            available_amount: 0.0,
            locked_amount: 0.0,
            average_entry_price: 0.0,
            total_cost: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_fees: 0.0,
            trades: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Input fill.
#[derive(Debug, Clone)]
pub struct Fill {
    pub trade_id: String,
    pub asset: String,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    pub ts: i64,
}

/// Reporting window for P&L queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PnlPeriod {
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    All,
}

impl PnlPeriod {
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "24h" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(CoreError::validation(format!("unknown period: {other}"))),
        }
    }

    fn cutoff_ms(&self, now: i64) -> i64 {
        match self {
            Self::Day => now - 24 * 3_600_000,
            Self::Week => now - 7 * 86_400_000,
            Self::Month => now - 30 * 86_400_000,
            Self::All => i64::MIN,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PnlReport {
    pub realized_pnl: f64,
    pub fees: f64,
    pub trade_count: usize,
    pub buys: usize,
    pub sells: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub total_value: f64,
    pub total_cost: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_fees: f64,
    pub position_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationSlice {
    pub asset: String,
    pub value: f64,
    /// Share of total portfolio value in [0, 1].
    pub share: f64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct PositionManager {
    positions: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
}

fn position_key(user_id: &str, exchange: &str, asset: &str) -> String {
    format!("{user_id}:{exchange}:{asset}")
}

impl PositionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            positions: RwLock::new(HashMap::new()),
        })
    }

    fn entry(&self, user_id: &str, exchange: &str, asset: &str) -> Arc<Mutex<Position>> {
        let key = position_key(user_id, exchange, asset);
        {
            let positions = self.positions.read();
            if let Some(p) = positions.get(&key) {
                return p.clone();
            }
        }
        let mut positions = self.positions.write();
        positions
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Position::new(user_id, exchange, asset))))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Fills
    // -------------------------------------------------------------------------

    /// Apply a fill. Returns the P&L realized by this trade (zero for buys).
    pub fn update_from_trade(
        &self,
        user_id: &str,
        exchange: &str,
        fill: &Fill,
    ) -> CoreResult<f64> {
        if fill.amount <= 0.0 || fill.price <= 0.0 || fill.fee < 0.0 {
            return Err(CoreError::validation(
                "fill requires positive amount/price and non-negative fee",
            ));
        }

        let entry = self.entry(user_id, exchange, &fill.asset);
        let mut pos = entry.lock();

        let realized = match fill.side {
            Side::Buy => {
                let cost = fill.amount * fill.price + fill.fee;
                let new_total = pos.total_amount + fill.amount;
                pos.average_entry_price = (pos.total_cost + cost) / new_total;
                pos.total_amount = new_total;
                pos.available_amount += fill.amount;
                pos.total_cost += cost;
                pos.total_fees += fill.fee;
                0.0
            }
            Side::Sell => {
                if fill.amount > pos.available_amount + 1e-12 {
                    return Err(CoreError::conflict(format!(
                        "cannot sell {} {}: only {} available",
                        fill.amount, fill.asset, pos.available_amount
                    )));
                }
                let cost_basis = fill.amount * pos.average_entry_price;
                let realized = fill.amount * fill.price - fill.fee - cost_basis;
                pos.total_amount -= fill.amount;
                pos.available_amount -= fill.amount;
                pos.total_cost = (pos.total_cost - cost_basis).max(0.0);
                pos.realized_pnl += realized;
                pos.total_fees += fill.fee;
                realized
            }
        };

        pos.trades.push(PositionTrade {
            trade_id: fill.trade_id.clone(),
            side: fill.side,
            amount: fill.amount,
            price: fill.price,
            fee: fill.fee,
            realized_pnl: realized,
            ts: fill.ts,
        });
        pos.updated_at = Utc::now().to_rfc3339();

        debug!(
            user_id,
            exchange,
            asset = %fill.asset,
            side = %fill.side,
            amount = fill.amount,
            price = fill.price,
            realized,
            total = pos.total_amount,
            avg_entry = pos.average_entry_price,
            "position updated from trade"
        );
        Ok(realized)
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    /// Reserve `amount` of an asset (e.g. backing an open sell order).
    pub fn lock_amount(
        &self,
        user_id: &str,
        exchange: &str,
        asset: &str,
        amount: f64,
    ) -> CoreResult<()> {
        let entry = self.entry(user_id, exchange, asset);
        let mut pos = entry.lock();
        if amount <= 0.0 {
            return Err(CoreError::validation("lock amount must be positive"));
        }
        if amount > pos.available_amount + 1e-12 {
            return Err(CoreError::conflict(format!(
                "cannot lock {amount} {asset}: only {} available",
                pos.available_amount
            )));
        }
        pos.available_amount -= amount;
        pos.locked_amount += amount;
        pos.updated_at = Utc::now().to_rfc3339();
        Ok(())
    }

    /// Release a previous lock.
    pub fn unlock_amount(
        &self,
        user_id: &str,
        exchange: &str,
        asset: &str,
        amount: f64,
    ) -> CoreResult<()> {
        let entry = self.entry(user_id, exchange, asset);
        let mut pos = entry.lock();
        if amount <= 0.0 {
            return Err(CoreError::validation("unlock amount must be positive"));
        }
        if amount > pos.locked_amount + 1e-12 {
            return Err(CoreError::conflict(format!(
                "cannot unlock {amount} {asset}: only {} locked",
                pos.locked_amount
            )));
        }
        pos.locked_amount -= amount;
        pos.available_amount += amount;
        pos.updated_at = Utc::now().to_rfc3339();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Marks & queries
    // -------------------------------------------------------------------------

    /// Re-mark unrealized P&L at `current_price`.
    pub fn update_unrealized(&self, user_id: &str, exchange: &str, asset: &str, price: f64) {
        let entry = self.entry(user_id, exchange, asset);
        let mut pos = entry.lock();
        pos.unrealized_pnl = if pos.total_amount > 0.0 {
            pos.total_amount * price - pos.total_cost
        } else {
            0.0
        };
        pos.updated_at = Utc::now().to_rfc3339();
    }

    pub fn get_position(
        &self,
        user_id: &str,
        exchange: &str,
        asset: &str,
    ) -> Option<Position> {
        let key = position_key(user_id, exchange, asset);
        let positions = self.positions.read();
        positions.get(&key).map(|p| p.lock().clone())
    }

    pub fn user_positions(&self, user_id: &str) -> Vec<Position> {
        let prefix = format!("{user_id}:");
        let positions = self.positions.read();
        let mut out: Vec<Position> = positions
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, p)| p.lock().clone())
            .collect();
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    /// Destroy every position owned by `user_id` (user deletion).
    pub fn remove_user(&self, user_id: &str) -> usize {
        let prefix = format!("{user_id}:");
        let mut positions = self.positions.write();
        let before = positions.len();
        positions.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - positions.len();
        if removed > 0 {
            info!(user_id, removed, "user positions destroyed");
        }
        removed
    }

    /// Portfolio totals, valuing holdings at `prices` (by asset).
    pub fn portfolio_summary(
        &self,
        user_id: &str,
        prices: &HashMap<String, f64>,
    ) -> PortfolioSummary {
        let positions = self.user_positions(user_id);
        let mut summary = PortfolioSummary {
            total_value: 0.0,
            total_cost: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            total_fees: 0.0,
            position_count: 0,
        };
        for pos in &positions {
            if pos.total_amount <= 0.0 && pos.trades.is_empty() {
                continue;
            }
            let price = prices.get(&pos.asset).copied().unwrap_or(0.0);
            let value = pos.total_amount * price;
            summary.total_value += value;
            summary.total_cost += pos.total_cost;
            summary.realized_pnl += pos.realized_pnl;
            summary.unrealized_pnl += if pos.total_amount > 0.0 {
                value - pos.total_cost
            } else {
                0.0
            };
            summary.total_fees += pos.total_fees;
            summary.position_count += 1;
        }
        summary
    }

    /// Value share per asset.
    pub fn allocation(
        &self,
        user_id: &str,
        prices: &HashMap<String, f64>,
    ) -> Vec<AllocationSlice> {
        let positions = self.user_positions(user_id);
        let values: Vec<(String, f64)> = positions
            .iter()
            .filter(|p| p.total_amount > 0.0)
            .map(|p| {
                let price = prices.get(&p.asset).copied().unwrap_or(0.0);
                (p.asset.clone(), p.total_amount * price)
            })
            .collect();
        let total: f64 = values.iter().map(|(_, v)| v).sum();

        values
            .into_iter()
            .map(|(asset, value)| AllocationSlice {
                asset,
                value,
                share: if total > 0.0 { value / total } else { 0.0 },
            })
            .collect()
    }

    /// Realized P&L and fees over a trailing window.
    pub fn pnl_report(&self, user_id: &str, period: PnlPeriod) -> PnlReport {
        let cutoff = period.cutoff_ms(Utc::now().timestamp_millis());
        let positions = self.user_positions(user_id);

        let mut report = PnlReport {
            realized_pnl: 0.0,
            fees: 0.0,
            trade_count: 0,
            buys: 0,
            sells: 0,
        };
        for pos in &positions {
            for trade in pos.trades.iter().filter(|t| t.ts >= cutoff) {
                report.realized_pnl += trade.realized_pnl;
                report.fees += trade.fee;
                report.trade_count += 1;
                match trade.side {
                    Side::Buy => report.buys += 1,
                    Side::Sell => report.sells += 1,
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("positions", &self.positions.read().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill(side: Side, amount: f64, price: f64, fee: f64, ts: i64) -> Fill {
        Fill {
            trade_id: format!("t-{ts}"),
            asset: "BTC".into(),
            side,
            amount,
            price,
            fee,
            ts,
        }
    }

    #[test]
    fn weighted_average_entry_and_realized_pnl() {
        let pm = PositionManager::new();

        // buy 1 @ 50000 fee 10, buy 1 @ 60000 fee 12, sell 1 @ 70000 fee 15.
        pm.update_from_trade("alice", "binance", &fill(Side::Buy, 1.0, 50_000.0, 10.0, 1))
            .unwrap();
        pm.update_from_trade("alice", "binance", &fill(Side::Buy, 1.0, 60_000.0, 12.0, 2))
            .unwrap();
        let realized = pm
            .update_from_trade("alice", "binance", &fill(Side::Sell, 1.0, 70_000.0, 15.0, 3))
            .unwrap();

        let pos = pm.get_position("alice", "binance", "BTC").unwrap();
        assert!((pos.average_entry_price - 55_011.0).abs() < 1e-9);
        assert!((pos.total_amount - 1.0).abs() < 1e-9);
        assert!((realized - 14_974.0).abs() < 1e-9);
        assert!((pos.realized_pnl - 14_974.0).abs() < 1e-9);
        assert!((pos.total_fees - 37.0).abs() < 1e-9);
        assert!((pos.total_cost - 55_011.0).abs() < 1e-9);
    }

    #[test]
    fn selling_more_than_available_is_rejected() {
        let pm = PositionManager::new();
        pm.update_from_trade("alice", "binance", &fill(Side::Buy, 1.0, 100.0, 0.0, 1))
            .unwrap();

        let err = pm
            .update_from_trade("alice", "binance", &fill(Side::Sell, 2.0, 110.0, 0.0, 2))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn lock_and_unlock_move_between_buckets() {
        let pm = PositionManager::new();
        pm.update_from_trade("alice", "binance", &fill(Side::Buy, 5.0, 100.0, 0.0, 1))
            .unwrap();

        pm.lock_amount("alice", "binance", "BTC", 2.0).unwrap();
        let pos = pm.get_position("alice", "binance", "BTC").unwrap();
        assert!((pos.available_amount - 3.0).abs() < 1e-9);
        assert!((pos.locked_amount - 2.0).abs() < 1e-9);
        assert!((pos.total_amount - 5.0).abs() < 1e-9);

        // Locked funds cannot be sold.
        let err = pm
            .update_from_trade("alice", "binance", &fill(Side::Sell, 4.0, 100.0, 0.0, 2))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        // Over-lock and over-unlock both fail.
        assert!(pm.lock_amount("alice", "binance", "BTC", 10.0).is_err());
        assert!(pm.unlock_amount("alice", "binance", "BTC", 3.0).is_err());

        pm.unlock_amount("alice", "binance", "BTC", 2.0).unwrap();
        let pos = pm.get_position("alice", "binance", "BTC").unwrap();
        assert!((pos.available_amount - 5.0).abs() < 1e-9);
        assert!((pos.locked_amount - 0.0).abs() < 1e-9);
    }

    #[test]
    fn unrealized_pnl_marks_to_price() {
        let pm = PositionManager::new();
        pm.update_from_trade("alice", "binance", &fill(Side::Buy, 2.0, 100.0, 0.0, 1))
            .unwrap();

        pm.update_unrealized("alice", "binance", "BTC", 110.0);
        let pos = pm.get_position("alice", "binance", "BTC").unwrap();
        // 2 * 110 - 200 = 20.
        assert!((pos.unrealized_pnl - 20.0).abs() < 1e-9);

        // Flat position marks to zero.
        pm.update_from_trade("alice", "binance", &fill(Side::Sell, 2.0, 110.0, 0.0, 2))
            .unwrap();
        pm.update_unrealized("alice", "binance", "BTC", 120.0);
        let pos = pm.get_position("alice", "binance", "BTC").unwrap();
        assert_eq!(pos.unrealized_pnl, 0.0);
    }

    #[test]
    fn invariants_hold_over_a_pseudo_random_fill_sequence() {
        let pm = PositionManager::new();
        // Deterministic LCG so the sequence is reproducible.
        let mut seed: u64 = 0x2545F491;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as f64 / (u32::MAX as f64 / 2.0)
        };

        let mut expected_realized = 0.0;
        for i in 0..200 {
            let price = 100.0 + next() * 50.0;
            let amount = 0.1 + next();
            let fee = next() * 0.5;
            let pos = pm.get_position("bob", "kraken", "BTC");
            let available = pos.as_ref().map(|p| p.available_amount).unwrap_or(0.0);
            let avg = pos.as_ref().map(|p| p.average_entry_price).unwrap_or(0.0);

            let sell = next() > 1.0 && available > amount;
            let side = if sell { Side::Sell } else { Side::Buy };
            if sell {
                expected_realized += amount * price - fee - amount * avg;
            }
            pm.update_from_trade("bob", "kraken", &fill(side, amount, price, fee, i))
                .unwrap();

            let pos = pm.get_position("bob", "kraken", "BTC").unwrap();
            assert!(
                (pos.available_amount + pos.locked_amount - pos.total_amount).abs() < 1e-9,
                "available + locked != total at step {i}"
            );
            assert!(pos.total_amount >= 0.0);
            assert!(pos.total_cost >= -1e-9);
        }

        let pos = pm.get_position("bob", "kraken", "BTC").unwrap();
        assert!((pos.realized_pnl - expected_realized).abs() < 1e-6);
    }

    #[test]
    fn full_liquidation_zeroes_the_position() {
        let pm = PositionManager::new();
        pm.update_from_trade("carol", "binance", &fill(Side::Buy, 3.0, 100.0, 3.0, 1))
            .unwrap();
        pm.update_from_trade("carol", "binance", &fill(Side::Sell, 3.0, 120.0, 3.6, 2))
            .unwrap();

        let pos = pm.get_position("carol", "binance", "BTC").unwrap();
        assert!(pos.total_amount.abs() < 1e-9);
        assert!(pos.total_cost.abs() < 1e-9);
        // 3*120 - 3.6 - 3*101 = 360 - 3.6 - 303 = 53.4.
        assert!((pos.realized_pnl - 53.4).abs() < 1e-9);
    }

    #[test]
    fn portfolio_summary_and_allocation() {
        let pm = PositionManager::new();
        pm.update_from_trade("dave", "binance", &fill(Side::Buy, 1.0, 100.0, 0.0, 1))
            .unwrap();
        let mut eth = fill(Side::Buy, 10.0, 20.0, 0.0, 2);
        eth.asset = "ETH".into();
        pm.update_from_trade("dave", "binance", &eth).unwrap();

        let prices = HashMap::from([("BTC".to_string(), 150.0), ("ETH".to_string(), 30.0)]);
        let summary = pm.portfolio_summary("dave", &prices);
        // 1*150 + 10*30 = 450.
        assert!((summary.total_value - 450.0).abs() < 1e-9);
        assert!((summary.total_cost - 300.0).abs() < 1e-9);
        assert!((summary.unrealized_pnl - 150.0).abs() < 1e-9);
        assert_eq!(summary.position_count, 2);

        let allocation = pm.allocation("dave", &prices);
        let btc = allocation.iter().find(|a| a.asset == "BTC").unwrap();
        assert!((btc.share - 150.0 / 450.0).abs() < 1e-9);
        let total_share: f64 = allocation.iter().map(|a| a.share).sum();
        assert!((total_share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pnl_report_filters_by_window() {
        let pm = PositionManager::new();
        let now = Utc::now().timestamp_millis();
        let old = now - 10 * 86_400_000;

        pm.update_from_trade("erin", "binance", &fill(Side::Buy, 2.0, 100.0, 1.0, old))
            .unwrap();
        pm.update_from_trade("erin", "binance", &fill(Side::Sell, 1.0, 120.0, 1.0, now))
            .unwrap();

        let day = pm.pnl_report("erin", PnlPeriod::Day);
        assert_eq!(day.trade_count, 1);
        assert_eq!(day.sells, 1);

        let all = pm.pnl_report("erin", PnlPeriod::All);
        assert_eq!(all.trade_count, 2);
        assert!((all.fees - 2.0).abs() < 1e-9);
    }

    #[test]
    fn remove_user_destroys_only_their_positions() {
        let pm = PositionManager::new();
        pm.update_from_trade("frank", "binance", &fill(Side::Buy, 1.0, 100.0, 0.0, 1))
            .unwrap();
        pm.update_from_trade("grace", "binance", &fill(Side::Buy, 1.0, 100.0, 0.0, 1))
            .unwrap();

        assert_eq!(pm.remove_user("frank"), 1);
        assert!(pm.get_position("frank", "binance", "BTC").is_none());
        assert!(pm.get_position("grace", "binance", "BTC").is_some());
    }
}
