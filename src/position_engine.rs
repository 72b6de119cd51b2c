// =============================================================================
// Position Engine — per-(user, scheme) FIFO lot accounting
// =============================================================================
//
// The heart of the system. Every mutation here is expected to run already
// under the caller's per-portfolio serialization lock (see `coordination`);
// this module itself only guarantees that the maps it owns are internally
// consistent, not that two concurrent callers for the same portfolio will
// not race — that is the coordination layer's job.
//
// Position is a cached aggregate over the Transaction log. Each SELL deducts
// the exact FIFO lot cost of the consumed units from `investedValue` and
// recomputes `avgNav` from the remainder — it is never preserved verbatim
// across a SELL (see DESIGN.md, Open Question 1).
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::errors::AppError;
use crate::transaction_log::{PortfolioId, Transaction, TransactionLog, TxId};
use crate::types::{SchemeCode, TransactionType, UserId};

/// Tolerance on the last unit digit absorbing rounding across long chains.
pub const EPSILON: Decimal = dec!(0.000001);

#[derive(Debug, Clone, Serialize)]
pub struct Portfolio {
    pub portfolio_id: PortfolioId,
    pub user_id: UserId,
    pub scheme_code: SchemeCode,
    pub opened_at: DateTime<Utc>,
    pub opening_nav: Decimal,
}

/// Cached aggregate `(totalUnits, investedValue, avgNav)` for a portfolio.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub portfolio_id: PortfolioId,
    pub scheme_code: SchemeCode,
    pub total_units: Decimal,
    pub invested_value: Decimal,
    pub avg_nav: Decimal,
}

/// Result of a successful SELL.
#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub realized_pl: Decimal,
    pub remaining_position: Option<Position>,
}

struct Lot {
    remaining: Decimal,
    nav: Decimal,
}

/// The transactional portfolio engine.
pub struct PositionEngine {
    portfolios: RwLock<BTreeMap<PortfolioId, Portfolio>>,
    index: RwLock<HashMap<(UserId, SchemeCode), PortfolioId>>,
    positions: RwLock<HashMap<PortfolioId, Position>>,
    next_portfolio_id: AtomicU64,
    log: std::sync::Arc<TransactionLog>,
}

impl PositionEngine {
    pub fn new(log: std::sync::Arc<TransactionLog>) -> Self {
        Self {
            portfolios: RwLock::new(BTreeMap::new()),
            index: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            next_portfolio_id: AtomicU64::new(1),
            log,
        }
    }

    // -------------------------------------------------------------------------
    // Portfolio resolution
    // -------------------------------------------------------------------------

    pub fn find_portfolio_id(&self, user_id: &str, scheme_code: SchemeCode) -> Option<PortfolioId> {
        self.index.read().get(&(user_id.to_string(), scheme_code)).copied()
    }

    pub fn get_portfolio(&self, portfolio_id: PortfolioId) -> Option<Portfolio> {
        self.portfolios.read().get(&portfolio_id).cloned()
    }

    pub fn get_position(&self, portfolio_id: PortfolioId) -> Option<Position> {
        self.positions.read().get(&portfolio_id).cloned()
    }

    /// Resolve the portfolio for `(userId, schemeCode)`, creating it on
    /// first BUY. The write lock on `index` is the uniqueness guard: two
    /// concurrent creations race for the same `entry()` critical section,
    /// so the loser observes the winner's row rather than creating a
    /// duplicate.
    fn resolve_or_create_portfolio(
        &self,
        user_id: &str,
        scheme_code: SchemeCode,
        nav: Decimal,
        time: DateTime<Utc>,
    ) -> PortfolioId {
        let key = (user_id.to_string(), scheme_code);
        let mut index = self.index.write();
        if let Some(&id) = index.get(&key) {
            return id;
        }

        let id = self.next_portfolio_id.fetch_add(1, Ordering::SeqCst);
        self.portfolios.write().insert(
            id,
            Portfolio {
                portfolio_id: id,
                user_id: user_id.to_string(),
                scheme_code,
                opened_at: time,
                opening_nav: nav,
            },
        );
        index.insert(key, id);
        id
    }

    // -------------------------------------------------------------------------
    // BUY
    // -------------------------------------------------------------------------

    pub fn buy(
        &self,
        user_id: &str,
        scheme_code: SchemeCode,
        units: Decimal,
        nav: Decimal,
        time: DateTime<Utc>,
    ) -> Result<Position, AppError> {
        if units <= Decimal::ZERO {
            return Err(AppError::Validation("units must be > 0".into()));
        }
        if nav <= Decimal::ZERO {
            return Err(AppError::Validation("nav must be > 0".into()));
        }

        let portfolio_id = self.resolve_or_create_portfolio(user_id, scheme_code, nav, time);
        let amount = units * nav;

        self.log.append(Transaction {
            tx_id: self.log.next_tx_id(),
            portfolio_id,
            tx_type: TransactionType::Buy,
            units,
            nav,
            amount,
            time,
            realized_pl: None,
        });

        let mut positions = self.positions.write();
        let updated = match positions.get(&portfolio_id) {
            None => Position {
                portfolio_id,
                scheme_code,
                total_units: units,
                invested_value: amount,
                avg_nav: nav,
            },
            Some(existing) => {
                let total_units = existing.total_units + units;
                let invested_value = existing.invested_value + amount;
                let avg_nav = invested_value / total_units;
                Position {
                    portfolio_id,
                    scheme_code,
                    total_units,
                    invested_value,
                    avg_nav,
                }
            }
        };
        positions.insert(portfolio_id, updated.clone());
        Ok(updated)
    }

    // -------------------------------------------------------------------------
    // SELL
    // -------------------------------------------------------------------------

    pub fn sell(
        &self,
        user_id: &str,
        scheme_code: SchemeCode,
        units_to_sell: Decimal,
        current_nav: Decimal,
        time: DateTime<Utc>,
    ) -> Result<SellOutcome, AppError> {
        if units_to_sell <= Decimal::ZERO {
            return Err(AppError::Validation("units must be > 0".into()));
        }

        let portfolio_id = self
            .find_portfolio_id(user_id, scheme_code)
            .ok_or(AppError::NoPosition)?;

        let current_position = self.get_position(portfolio_id).ok_or(AppError::NoPosition)?;
        if current_position.total_units + EPSILON < units_to_sell {
            return Err(AppError::InsufficientUnits {
                requested: units_to_sell,
                available: current_position.total_units,
            });
        }

        let prior_txs = self.log.for_portfolio(portfolio_id);
        let (realized_pl, cost_removed) = compute_fifo_consumption(&prior_txs, units_to_sell, current_nav);

        let amount = units_to_sell * current_nav;
        self.log.append(Transaction {
            tx_id: self.log.next_tx_id(),
            portfolio_id,
            tx_type: TransactionType::Sell,
            units: units_to_sell,
            nav: current_nav,
            amount,
            time,
            realized_pl: Some(realized_pl),
        });

        let mut positions = self.positions.write();
        let remaining_units = current_position.total_units - units_to_sell;

        let remaining_position = if remaining_units <= EPSILON {
            positions.remove(&portfolio_id);
            None
        } else {
            let invested_value = current_position.invested_value - cost_removed;
            let updated = Position {
                portfolio_id,
                scheme_code,
                total_units: remaining_units,
                invested_value,
                avg_nav: invested_value / remaining_units,
            };
            positions.insert(portfolio_id, updated.clone());
            Some(updated)
        };

        Ok(SellOutcome {
            realized_pl,
            remaining_position,
        })
    }

    // -------------------------------------------------------------------------
    // REMOVE
    // -------------------------------------------------------------------------

    pub fn remove(&self, user_id: &str, scheme_code: SchemeCode) -> Result<(), AppError> {
        let portfolio_id = self
            .find_portfolio_id(user_id, scheme_code)
            .ok_or(AppError::NoPosition)?;

        if !self.log.is_empty(portfolio_id) {
            return Err(AppError::HasTransactions);
        }

        self.positions.write().remove(&portfolio_id);
        self.portfolios.write().remove(&portfolio_id);
        self.index.write().remove(&(user_id.to_string(), scheme_code));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reconciliation (§7)
    // -------------------------------------------------------------------------

    /// Rebuild the Position from the Transaction log and return it. If the
    /// cached aggregate disagrees with the replay beyond `EPSILON`, the
    /// cache is overwritten with the replayed value.
    pub fn reconcile(&self, portfolio_id: PortfolioId) -> Option<Position> {
        let scheme_code = self.portfolios.read().get(&portfolio_id)?.scheme_code;
        let txs = self.log.for_portfolio(portfolio_id);
        let replayed = replay_position(portfolio_id, scheme_code, &txs);

        let mut positions = self.positions.write();
        match (&replayed, positions.get(&portfolio_id)) {
            (Some(r), Some(cached)) => {
                let diverged = (r.total_units - cached.total_units).abs() > EPSILON
                    || (r.invested_value - cached.invested_value).abs() > EPSILON;
                if diverged {
                    tracing::warn!(portfolio_id, "position cache diverged from replay — rebuilt");
                    positions.insert(portfolio_id, r.clone());
                }
            }
            (Some(r), None) => {
                positions.insert(portfolio_id, r.clone());
            }
            (None, Some(_)) => {
                positions.remove(&portfolio_id);
            }
            (None, None) => {}
        }
        replayed
    }

    /// All distinct scheme codes referenced by any non-empty Position —
    /// the NAV refresh engine's workload discovery.
    pub fn active_schemes(&self) -> Vec<SchemeCode> {
        let positions = self.positions.read();
        let mut schemes: Vec<SchemeCode> = positions.values().map(|p| p.scheme_code).collect();
        schemes.sort_unstable();
        schemes.dedup();
        schemes
    }

    pub fn portfolios_for_user(&self, user_id: &str) -> Vec<Portfolio> {
        self.portfolios
            .read()
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// `(totalUnits, investedValue)` as of the close of `date`, replaying
    /// only the transactions recorded on or before it — used by
    /// `ValuationService::portfolio_history` (§4.5) to price a date with the
    /// units actually held that day rather than the live cache.
    pub fn position_as_of(&self, portfolio_id: PortfolioId, date: NaiveDate) -> Option<(Decimal, Decimal)> {
        let txs: Vec<Transaction> = self
            .log
            .for_portfolio(portfolio_id)
            .into_iter()
            .filter(|tx| tx.time.date_naive() <= date)
            .collect();
        replay_totals(&txs)
    }
}

/// Replay the full Transaction log for a portfolio from scratch, applying
/// the same BUY/SELL math as live mutations (avgNav preserved across
/// SELLs). Returns `None` once units fall to (or start at) zero.
fn replay_position(portfolio_id: PortfolioId, scheme_code: SchemeCode, txs: &[Transaction]) -> Option<Position> {
    let (total_units, invested_value) = replay_totals(txs)?;
    Some(Position {
        portfolio_id,
        scheme_code,
        total_units,
        invested_value,
        avg_nav: invested_value / total_units,
    })
}

/// Walk a transaction slice through the same FIFO lot queue `sell()` uses
/// and return `(totalUnits, investedValue)` as of the last transaction in
/// the slice, or `None` once units fall to (or start at) zero. Shared by
/// `replay_position` (full-log reconcile) and `position_as_of` (date-bounded
/// replay for historical valuation).
fn replay_totals(txs: &[Transaction]) -> Option<(Decimal, Decimal)> {
    let mut ordered: Vec<&Transaction> = txs.iter().collect();
    ordered.sort_by_key(|t| (t.time, t.tx_id));

    let mut lots: VecDeque<Lot> = VecDeque::new();
    for tx in ordered {
        match tx.tx_type {
            TransactionType::Buy => lots.push_back(Lot {
                remaining: tx.units,
                nav: tx.nav,
            }),
            TransactionType::Sell => {
                let mut to_consume = tx.units;
                while to_consume > Decimal::ZERO {
                    let Some(lot) = lots.front_mut() else { break };
                    let consumed = to_consume.min(lot.remaining);
                    lot.remaining -= consumed;
                    to_consume -= consumed;
                    if lot.remaining <= EPSILON {
                        lots.pop_front();
                    }
                }
            }
        }
    }

    let total_units: Decimal = lots.iter().map(|l| l.remaining).sum();
    if total_units <= EPSILON {
        None
    } else {
        let invested_value: Decimal = lots.iter().map(|l| l.remaining * l.nav).sum();
        Some((total_units, invested_value))
    }
}

/// Deterministic FIFO consumption for a SELL of `units_to_sell` at
/// `current_nav`, given the portfolio's transactions prior to this SELL.
/// Returns `(realizedPL, costRemoved)` where `costRemoved` is the exact
/// FIFO cost basis of the consumed slices (`Σ nav_i × consumed_i` at each
/// lot's own BUY nav) — used by the caller to deduct the sold lots' exact
/// cost from `investedValue` rather than deriving it from `avgNav` (see
/// DESIGN.md, Open Question 1: the worked example in the specification's
/// Scenario B only reconciles under exact-lot-cost deduction).
fn compute_fifo_consumption(
    prior_txs: &[Transaction],
    units_to_sell: Decimal,
    current_nav: Decimal,
) -> (Decimal, Decimal) {
    let mut lots = open_lot_queue(prior_txs);

    let mut remaining_to_sell = units_to_sell;
    let mut realized_pl = Decimal::ZERO;
    let mut cost_removed = Decimal::ZERO;

    while remaining_to_sell > Decimal::ZERO {
        let Some(lot) = lots.front_mut() else { break };
        let consumed = remaining_to_sell.min(lot.remaining);
        realized_pl += (current_nav - lot.nav) * consumed;
        cost_removed += lot.nav * consumed;
        lot.remaining -= consumed;
        remaining_to_sell -= consumed;
        if lot.remaining <= EPSILON {
            lots.pop_front();
        }
    }

    (realized_pl, cost_removed)
}

/// Build the open lot queue (FIFO, ascending `(time, txId)`) by replaying
/// prior BUY/SELL transactions: walk BUY lots consuming the units already
/// sold by prior SELLs from the head.
fn open_lot_queue(txs: &[Transaction]) -> VecDeque<Lot> {
    let mut buys: Vec<&Transaction> = txs.iter().filter(|t| t.tx_type == TransactionType::Buy).collect();
    buys.sort_by_key(|t| (t.time, t.tx_id));

    let sells: Vec<&Transaction> = txs.iter().filter(|t| t.tx_type == TransactionType::Sell).collect();
    let sold_from_head: Decimal = sells.iter().map(|t| t.units).sum();

    let mut lots: VecDeque<Lot> = buys
        .into_iter()
        .map(|t| Lot {
            remaining: t.units,
            nav: t.nav,
        })
        .collect();

    let mut to_consume = sold_from_head;
    while to_consume > Decimal::ZERO {
        let Some(lot) = lots.front_mut() else { break };
        let consumed = to_consume.min(lot.remaining);
        lot.remaining -= consumed;
        to_consume -= consumed;
        if lot.remaining <= EPSILON {
            lots.pop_front();
        }
    }

    lots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn engine() -> PositionEngine {
        PositionEngine::new(Arc::new(TransactionLog::new()))
    }

    fn t(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(offset_secs)
    }

    /// Scenario A — single BUY/SELL.
    #[test]
    fn scenario_a_single_buy_sell() {
        let e = engine();
        let pos = e.buy("U1", 152075, dec!(100), dec!(10.00), t(0)).unwrap();
        assert_eq!(pos.total_units, dec!(100));
        assert_eq!(pos.invested_value, dec!(1000));
        assert_eq!(pos.avg_nav, dec!(10.00));

        let outcome = e.sell("U1", 152075, dec!(40), dec!(12.50), t(3600)).unwrap();
        assert_eq!(outcome.realized_pl, dec!(100.00));
        let remaining = outcome.remaining_position.unwrap();
        assert_eq!(remaining.total_units, dec!(60));
        assert_eq!(remaining.invested_value, dec!(600.00));
        assert_eq!(remaining.avg_nav, dec!(10.00));
    }

    /// Scenario B — FIFO across multiple lots.
    #[test]
    fn scenario_b_fifo_multiple_lots() {
        let e = engine();
        e.buy("U1", 152075, dec!(50), dec!(10), t(0)).unwrap();
        e.buy("U1", 152075, dec!(50), dec!(14), t(1)).unwrap();

        let outcome = e.sell("U1", 152075, dec!(70), dec!(15), t(2)).unwrap();
        assert_eq!(outcome.realized_pl, dec!(270));

        let remaining = outcome.remaining_position.unwrap();
        assert_eq!(remaining.total_units, dec!(30));
        assert_eq!(remaining.invested_value, dec!(420.00));
        assert_eq!(remaining.avg_nav, dec!(14.00));
    }

    /// Scenario C — oversell rejected.
    #[test]
    fn scenario_c_oversell_rejected() {
        let e = engine();
        e.buy("U1", 152075, dec!(30), dec!(10), t(0)).unwrap();

        let err = e.sell("U1", 152075, dec!(31), dec!(11), t(1)).unwrap_err();
        assert!(matches!(err, AppError::InsufficientUnits { .. }));

        // Position unchanged; no transaction appended for the failed sell.
        let pos = e.get_position(e.find_portfolio_id("U1", 152075).unwrap()).unwrap();
        assert_eq!(pos.total_units, dec!(30));
    }

    /// Scenario F — concurrent BUYs converge to a deterministic total
    /// regardless of arrival order (single-threaded simulation of both
    /// orderings).
    #[test]
    fn scenario_f_concurrent_buys_any_order_same_result() {
        for swapped in [false, true] {
            let e = engine();
            if !swapped {
                e.buy("U1", 152075, dec!(10), dec!(20), t(0)).unwrap();
                e.buy("U1", 152075, dec!(5), dec!(22), t(1)).unwrap();
            } else {
                e.buy("U1", 152075, dec!(5), dec!(22), t(0)).unwrap();
                e.buy("U1", 152075, dec!(10), dec!(20), t(1)).unwrap();
            }
            let pos = e.get_position(e.find_portfolio_id("U1", 152075).unwrap()).unwrap();
            assert_eq!(pos.total_units, dec!(15));
            assert_eq!(pos.invested_value, dec!(310));
        }
    }

    #[test]
    fn buy_then_sell_same_units_and_nav_yields_zero_pl_and_no_position() {
        let e = engine();
        e.buy("U1", 152075, dec!(100), dec!(10), t(0)).unwrap();
        let outcome = e.sell("U1", 152075, dec!(100), dec!(10), t(1)).unwrap();
        assert_eq!(outcome.realized_pl, dec!(0));
        assert!(outcome.remaining_position.is_none());
    }

    #[test]
    fn remove_fails_when_transactions_exist() {
        let e = engine();
        e.buy("U1", 152075, dec!(10), dec!(10), t(0)).unwrap();
        e.sell("U1", 152075, dec!(10), dec!(12), t(1)).unwrap();

        let err = e.remove("U1", 152075).unwrap_err();
        assert!(matches!(err, AppError::HasTransactions));
    }

    #[test]
    fn remove_fails_on_nonexistent_portfolio() {
        let e = engine();
        assert!(matches!(e.remove("U1", 999999).unwrap_err(), AppError::NoPosition));
    }

    #[test]
    fn reconcile_matches_replay_after_normal_operation() {
        let e = engine();
        e.buy("U1", 152075, dec!(50), dec!(10), t(0)).unwrap();
        e.buy("U1", 152075, dec!(50), dec!(14), t(1)).unwrap();
        e.sell("U1", 152075, dec!(70), dec!(15), t(2)).unwrap();

        let portfolio_id = e.find_portfolio_id("U1", 152075).unwrap();
        let cached = e.get_position(portfolio_id).unwrap();
        let replayed = e.reconcile(portfolio_id).unwrap();

        assert_eq!(cached.total_units, replayed.total_units);
        assert_eq!(cached.invested_value, replayed.invested_value);
        assert_eq!(cached.avg_nav, replayed.avg_nav);
    }

    #[test]
    fn active_schemes_only_lists_nonempty_positions() {
        let e = engine();
        e.buy("U1", 152075, dec!(10), dec!(10), t(0)).unwrap();
        e.buy("U1", 152076, dec!(10), dec!(10), t(0)).unwrap();
        e.sell("U1", 152076, dec!(10), dec!(10), t(1)).unwrap();

        assert_eq!(e.active_schemes(), vec![152075]);
    }
}
