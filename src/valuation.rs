// =============================================================================
// Valuation Service — current and historical portfolio value
// =============================================================================
//
// Reads only; never mutates Position, NavStore, or the Transaction log.
// Degrades gracefully when a scheme's NAV is unavailable: the affected
// holding is flagged `navMissing` rather than failing the whole response.
// =============================================================================

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::nav_store::NavStore;
use crate::position_engine::{Portfolio, PositionEngine};

pub const DEFAULT_HISTORY_DAYS: i64 = 30;
pub const MAX_HISTORY_DAYS: i64 = 365;

/// Per-holding valuation line, joined against the live/cached NAV.
#[derive(Debug, Clone, Serialize)]
pub struct HoldingValue {
    pub portfolio_id: u64,
    pub scheme_code: i64,
    pub units: Decimal,
    pub invested_value: Decimal,
    pub current_nav: Option<Decimal>,
    pub current_value: Option<Decimal>,
    pub unrealized_pl: Option<Decimal>,
    pub nav_missing: bool,
}

/// Aggregate valuation across every holding a user owns.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioValue {
    pub holdings: Vec<HoldingValue>,
    pub total_invested_value: Decimal,
    pub total_current_value: Decimal,
    pub total_unrealized_pl: Decimal,
    pub nav_missing: bool,
}

/// One point in a portfolio's historical value series.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub value: Decimal,
    pub unrealized_pl: Decimal,
    pub nav_missing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioHistory {
    pub points: Vec<HistoryPoint>,
}

pub struct ValuationService {
    positions: Arc<PositionEngine>,
    nav_store: Arc<NavStore>,
}

impl ValuationService {
    pub fn new(positions: Arc<PositionEngine>, nav_store: Arc<NavStore>) -> Self {
        Self { positions, nav_store }
    }

    /// `PortfolioValue(userId)`: join every non-empty Position the user
    /// owns against the latest cached NAV. A cache miss for a scheme sets
    /// `navMissing` on that holding and on the aggregate, but does not
    /// fail the whole response.
    pub async fn portfolio_value(&self, user_id: &str) -> PortfolioValue {
        let portfolios: Vec<Portfolio> = self.positions.portfolios_for_user(user_id);

        let mut holdings = Vec::new();
        let mut total_invested_value = Decimal::ZERO;
        let mut total_current_value = Decimal::ZERO;
        let mut total_unrealized_pl = Decimal::ZERO;
        let mut any_missing = false;

        for portfolio in portfolios {
            let Some(position) = self.positions.get_position(portfolio.portfolio_id) else {
                continue;
            };

            let latest = self.nav_store.get_latest_cached(portfolio.scheme_code);
            total_invested_value += position.invested_value;

            match latest {
                Some(nav_row) => {
                    let current_value = position.total_units * nav_row.nav;
                    let unrealized_pl = current_value - position.invested_value;
                    total_current_value += current_value;
                    total_unrealized_pl += unrealized_pl;

                    holdings.push(HoldingValue {
                        portfolio_id: portfolio.portfolio_id,
                        scheme_code: portfolio.scheme_code,
                        units: position.total_units,
                        invested_value: position.invested_value,
                        current_nav: Some(nav_row.nav),
                        current_value: Some(current_value),
                        unrealized_pl: Some(unrealized_pl),
                        nav_missing: false,
                    });
                }
                None => {
                    any_missing = true;
                    total_current_value += position.invested_value;
                    holdings.push(HoldingValue {
                        portfolio_id: portfolio.portfolio_id,
                        scheme_code: portfolio.scheme_code,
                        units: position.total_units,
                        invested_value: position.invested_value,
                        current_nav: None,
                        current_value: None,
                        unrealized_pl: None,
                        nav_missing: true,
                    });
                }
            }
        }

        PortfolioValue {
            holdings,
            total_invested_value,
            total_current_value,
            total_unrealized_pl,
            nav_missing: any_missing,
        }
    }

    /// `PortfolioHistory(userId, days)`: default 30-day window, 365-day max.
    /// Each day prices only the positions actually held at that date's
    /// close — `openedAt <= date` and a FIFO replay of the transaction log
    /// up to `date` yields `units_date > 0` (§4.5) — using the NAV
    /// on-or-before that date, falling back to the replayed `avgNav` when no
    /// NAV history reaches that far back.
    pub fn portfolio_history(&self, user_id: &str, days: Option<i64>) -> PortfolioHistory {
        let requested = days.unwrap_or(DEFAULT_HISTORY_DAYS).clamp(1, MAX_HISTORY_DAYS);
        let portfolios = self.positions.portfolios_for_user(user_id);
        let today = Utc::now().date_naive();

        let mut points = Vec::with_capacity(requested as usize);
        for offset in (0..requested).rev() {
            let date = today - ChronoDuration::days(offset);
            let mut value = Decimal::ZERO;
            let mut invested = Decimal::ZERO;
            let mut missing = false;

            for portfolio in &portfolios {
                if portfolio.opened_at.date_naive() > date {
                    continue;
                }
                let Some((units_date, invested_date)) = self.positions.position_as_of(portfolio.portfolio_id, date)
                else {
                    continue;
                };

                invested += invested_date;
                match self.nav_store.history_on_or_before(portfolio.scheme_code, date) {
                    Some(entry) => value += units_date * entry.nav,
                    None => {
                        missing = true;
                        value += invested_date;
                    }
                }
            }

            points.push(HistoryPoint {
                date,
                value,
                unrealized_pl: value - invested,
                nav_missing: missing,
            });
        }

        PortfolioHistory { points }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote_client::QuoteClient;
    use crate::transaction_log::TransactionLog;
    use chrono::Utc as ChronoUtc;
    use rust_decimal_macros::dec;

    fn service() -> (ValuationService, Arc<PositionEngine>, Arc<NavStore>) {
        let log = Arc::new(TransactionLog::new());
        let positions = Arc::new(PositionEngine::new(log));
        let quote_client = Arc::new(QuoteClient::new("http://localhost", 1000, 0));
        let nav_store = Arc::new(NavStore::new(quote_client, 30));
        (ValuationService::new(positions.clone(), nav_store.clone()), positions, nav_store)
    }

    #[tokio::test]
    async fn portfolio_value_flags_nav_missing_for_uncached_scheme() {
        let (service, positions, _nav_store) = service();
        positions.buy("U1", 152075, dec!(10), dec!(10), ChronoUtc::now()).unwrap();

        let value = service.portfolio_value("U1").await;
        assert!(value.nav_missing);
        assert_eq!(value.holdings.len(), 1);
        assert!(value.holdings[0].nav_missing);
        assert_eq!(value.total_invested_value, dec!(100));
    }

    #[tokio::test]
    async fn portfolio_value_computes_unrealized_pl_when_nav_cached() {
        let (service, positions, nav_store) = service();
        positions.buy("U1", 152075, dec!(10), dec!(10), ChronoUtc::now()).unwrap();
        nav_store.upsert_latest(152075, dec!(12), ChronoUtc::now().date_naive());

        let value = service.portfolio_value("U1").await;
        assert!(!value.nav_missing);
        assert_eq!(value.total_current_value, dec!(120));
        assert_eq!(value.total_unrealized_pl, dec!(20));
    }

    #[test]
    fn portfolio_history_defaults_to_thirty_days() {
        let (_service, positions, nav_store) = service();
        positions.buy("U1", 152075, dec!(10), dec!(10), ChronoUtc::now()).unwrap();
        nav_store.upsert_history(152075, ChronoUtc::now().date_naive(), dec!(10));

        let service = ValuationService::new(positions, nav_store);
        let history = service.portfolio_history("U1", None);
        assert_eq!(history.points.len(), 30);
    }

    #[test]
    fn portfolio_history_clamps_to_max_range() {
        let (_service, positions, nav_store) = service();
        let service = ValuationService::new(positions, nav_store);
        let history = service.portfolio_history("U1", Some(10_000));
        assert_eq!(history.points.len(), MAX_HISTORY_DAYS as usize);
    }
}
