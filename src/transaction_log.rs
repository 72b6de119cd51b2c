// =============================================================================
// Transaction Log — append-only record of BUY/SELL entries per portfolio
// =============================================================================
//
// Source of truth for reconstruction. Entries are never mutated or deleted.
// Ordered monotonically by `time` per portfolio; ties are broken by
// insertion order (`txId`), which is exactly the order a `Vec` preserves
// since all appends for a given portfolio happen under that portfolio's
// serialization lock (see `coordination`).
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::types::TransactionType;

pub type PortfolioId = u64;
pub type TxId = u64;

/// An append-only ledger entry. `realizedPL` is only populated for SELLs.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub tx_id: TxId,
    pub portfolio_id: PortfolioId,
    pub tx_type: TransactionType,
    pub units: Decimal,
    pub nav: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
    pub realized_pl: Option<Decimal>,
}

/// Append-only, per-portfolio ordered transaction log.
pub struct TransactionLog {
    entries: RwLock<BTreeMap<PortfolioId, Vec<Transaction>>>,
    next_tx_id: AtomicU64,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_tx_id: AtomicU64::new(1),
        }
    }

    pub fn next_tx_id(&self) -> TxId {
        self.next_tx_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a transaction. Callers are responsible for holding the
    /// relevant portfolio's serialization lock — this log does not
    /// serialize writers itself, to keep the hot append path lock-free
    /// beyond the caller's own critical section.
    pub fn append(&self, tx: Transaction) {
        self.entries.write().entry(tx.portfolio_id).or_default().push(tx);
    }

    /// All transactions for a portfolio, in append (i.e. `(time, txId)`)
    /// order.
    pub fn for_portfolio(&self, portfolio_id: PortfolioId) -> Vec<Transaction> {
        self.entries
            .read()
            .get(&portfolio_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Paginated, optionally type-filtered view over a portfolio's log,
    /// newest-first.
    pub fn page(
        &self,
        portfolio_id: PortfolioId,
        tx_type: Option<TransactionType>,
        page: usize,
        limit: usize,
    ) -> (Vec<Transaction>, usize) {
        let all = self.for_portfolio(portfolio_id);
        let mut filtered: Vec<Transaction> = match tx_type {
            Some(t) => all.into_iter().filter(|tx| matches_type(tx.tx_type, t)).collect(),
            None => all,
        };
        filtered.reverse();
        let total = filtered.len();

        let start = page.saturating_mul(limit);
        let page_items = filtered.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    /// Same as `page`, but merges several portfolios' logs into one
    /// newest-first view before paginating — used when a caller requests
    /// transactions without pinning a single `schemeCode` (§6).
    pub fn page_across(
        &self,
        portfolio_ids: &[PortfolioId],
        tx_type: Option<TransactionType>,
        page: usize,
        limit: usize,
    ) -> (Vec<Transaction>, usize) {
        let mut merged: Vec<Transaction> = portfolio_ids
            .iter()
            .flat_map(|id| self.for_portfolio(*id))
            .filter(|tx| tx_type.map(|t| matches_type(tx.tx_type, t)).unwrap_or(true))
            .collect();
        merged.sort_by_key(|tx| (tx.time, tx.tx_id));
        merged.reverse();

        let total = merged.len();
        let start = page.saturating_mul(limit);
        let page_items = merged.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    pub fn is_empty(&self, portfolio_id: PortfolioId) -> bool {
        self.entries
            .read()
            .get(&portfolio_id)
            .map(|v| v.is_empty())
            .unwrap_or(true)
    }
}

fn matches_type(a: TransactionType, b: TransactionType) -> bool {
    matches!(
        (a, b),
        (TransactionType::Buy, TransactionType::Buy) | (TransactionType::Sell, TransactionType::Sell)
    )
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(portfolio_id: PortfolioId, tx_id: TxId, t: TransactionType, time_offset_secs: i64) -> Transaction {
        Transaction {
            tx_id,
            portfolio_id,
            tx_type: t,
            units: dec!(10),
            nav: dec!(10),
            amount: dec!(100),
            time: Utc::now() + chrono::Duration::seconds(time_offset_secs),
            realized_pl: None,
        }
    }

    #[test]
    fn append_preserves_order() {
        let log = TransactionLog::new();
        log.append(tx(1, 1, TransactionType::Buy, 0));
        log.append(tx(1, 2, TransactionType::Buy, 1));
        log.append(tx(1, 3, TransactionType::Sell, 2));

        let all = log.for_portfolio(1);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].tx_id, 1);
        assert_eq!(all[2].tx_id, 3);
    }

    #[test]
    fn empty_log_reports_empty() {
        let log = TransactionLog::new();
        assert!(log.is_empty(42));
        log.append(tx(42, 1, TransactionType::Buy, 0));
        assert!(!log.is_empty(42));
    }

    #[test]
    fn page_filters_by_type_and_is_newest_first() {
        let log = TransactionLog::new();
        log.append(tx(1, 1, TransactionType::Buy, 0));
        log.append(tx(1, 2, TransactionType::Sell, 1));
        log.append(tx(1, 3, TransactionType::Buy, 2));

        let (items, total) = log.page(1, Some(TransactionType::Buy), 0, 10);
        assert_eq!(total, 2);
        assert_eq!(items[0].tx_id, 3);
        assert_eq!(items[1].tx_id, 1);
    }
}
