// =============================================================================
// NAV Store — LatestNav + bounded NavHistory, keyed by schemeCode
// =============================================================================
//
// Single-writer semantics per scheme: only the refresh engine and
// read-through misses write here. Readers are lock-free apart from the
// `parking_lot::RwLock` critical sections, which never cross an `.await`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::errors::AppError;
use crate::quote_client::QuoteClient;
use crate::types::SchemeCode;

/// Most recently observed authoritative NAV for a scheme.
#[derive(Debug, Clone, Serialize)]
pub struct LatestNav {
    pub scheme_code: SchemeCode,
    pub nav: Decimal,
    pub as_of_date: NaiveDate,
    pub updated_at: chrono::DateTime<Utc>,
}

/// One entry in a scheme's bounded NAV history, newest-first.
#[derive(Debug, Clone, Serialize)]
pub struct NavHistoryEntry {
    pub date: NaiveDate,
    pub nav: Decimal,
}

struct SchemeNav {
    latest: Option<LatestNav>,
    /// Newest-first, deduplicated by date, length <= history_cap.
    history: Vec<NavHistoryEntry>,
}

/// Two-tier NAV cache: `LatestNav[scheme]` and bounded `NavHistory[scheme]`.
pub struct NavStore {
    schemes: RwLock<HashMap<SchemeCode, SchemeNav>>,
    history_cap: usize,
    quote_client: Arc<QuoteClient>,
}

impl NavStore {
    pub fn new(quote_client: Arc<QuoteClient>, history_cap: usize) -> Self {
        Self {
            schemes: RwLock::new(HashMap::new()),
            history_cap,
            quote_client,
        }
    }

    /// Upsert `LatestNav`. A write with an older `asOfDate` than the stored
    /// row must not regress the stored value; ties are resolved by the
    /// latest `updatedAt`.
    pub fn upsert_latest(&self, scheme_code: SchemeCode, nav: Decimal, as_of_date: NaiveDate) {
        let mut schemes = self.schemes.write();
        let entry = schemes.entry(scheme_code).or_insert_with(|| SchemeNav {
            latest: None,
            history: Vec::new(),
        });

        let now = Utc::now();
        let should_write = match &entry.latest {
            None => true,
            Some(current) => as_of_date >= current.as_of_date,
        };

        if should_write {
            entry.latest = Some(LatestNav {
                scheme_code,
                nav,
                as_of_date,
                updated_at: now,
            });
        }
    }

    /// Insert or replace a `(date, nav)` pair in the bounded history. If an
    /// entry for that date exists, update it in place; otherwise insert and,
    /// if the series now exceeds `history_cap`, evict the oldest entry.
    pub fn upsert_history(&self, scheme_code: SchemeCode, date: NaiveDate, nav: Decimal) {
        let mut schemes = self.schemes.write();
        let entry = schemes.entry(scheme_code).or_insert_with(|| SchemeNav {
            latest: None,
            history: Vec::new(),
        });

        if let Some(existing) = entry.history.iter_mut().find(|e| e.date == date) {
            existing.nav = nav;
            return;
        }

        entry.history.push(NavHistoryEntry { date, nav });
        entry.history.sort_by(|a, b| b.date.cmp(&a.date));
        if entry.history.len() > self.history_cap {
            entry.history.pop();
        }
    }

    pub fn get_latest_cached(&self, scheme_code: SchemeCode) -> Option<LatestNav> {
        self.schemes.read().get(&scheme_code).and_then(|s| s.latest.clone())
    }

    /// Last `n` history entries, newest-first.
    pub fn get_history(&self, scheme_code: SchemeCode, n: usize) -> Vec<NavHistoryEntry> {
        self.schemes
            .read()
            .get(&scheme_code)
            .map(|s| s.history.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// The latest history entry with `entry.date <= date`, used by the
    /// valuation service's historical time series.
    pub fn history_on_or_before(&self, scheme_code: SchemeCode, date: NaiveDate) -> Option<NavHistoryEntry> {
        self.schemes.read().get(&scheme_code).and_then(|s| {
            s.history.iter().find(|e| e.date <= date).cloned()
        })
    }

    /// `GetLatest(schemeCode)`: return the stored row if present; else call
    /// the quote client; on success, upsert both stores and return; on
    /// failure, return a typed error. Never panics on a cache miss — a miss
    /// is not an error, only an exhausted provider retry is.
    pub async fn get_latest(&self, scheme_code: SchemeCode) -> Result<LatestNav, AppError> {
        if let Some(cached) = self.get_latest_cached(scheme_code) {
            return Ok(cached);
        }

        let quote = self
            .quote_client
            .fetch_latest(scheme_code)
            .await
            .map_err(|_| AppError::NavUnavailable(scheme_code))?;
        self.upsert_latest(scheme_code, quote.nav, quote.date);
        self.upsert_history(scheme_code, quote.date, quote.nav);
        Ok(self
            .get_latest_cached(scheme_code)
            .expect("just upserted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn store() -> NavStore {
        let client = Arc::new(QuoteClient::new("http://localhost", 1000, 0));
        NavStore::new(client, 3)
    }

    #[test]
    fn upsert_latest_does_not_regress_by_date() {
        let store = store();
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();

        store.upsert_latest(100001, dec!(10.0), d1);
        store.upsert_latest(100001, dec!(9.0), d2);

        let latest = store.get_latest_cached(100001).unwrap();
        assert_eq!(latest.as_of_date, d1);
        assert_eq!(latest.nav, dec!(10.0));
    }

    #[test]
    fn upsert_latest_advances_on_newer_date() {
        let store = store();
        let d1 = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();

        store.upsert_latest(100001, dec!(10.0), d1);
        store.upsert_latest(100001, dec!(11.0), d2);

        let latest = store.get_latest_cached(100001).unwrap();
        assert_eq!(latest.as_of_date, d2);
        assert_eq!(latest.nav, dec!(11.0));
    }

    #[test]
    fn history_is_bounded_and_deduplicated() {
        let store = store();
        for day in 1..=5u32 {
            let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            store.upsert_history(100001, date, Decimal::from(day));
        }
        let hist = store.get_history(100001, 10);
        assert_eq!(hist.len(), 3);
        // newest-first
        assert_eq!(hist[0].date, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        // updating an existing date does not grow the series
        store.upsert_history(100001, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), dec!(99));
        let hist = store.get_history(100001, 10);
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].nav, dec!(99));
    }

    #[test]
    fn history_on_or_before_falls_back_to_latest_prior_entry() {
        let store = store();
        store.upsert_history(100001, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), dec!(10));
        store.upsert_history(100001, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap(), dec!(12));

        let q = NaiveDate::from_ymd_opt(2024, 1, 9).unwrap();
        let found = store.history_on_or_before(100001, q).unwrap();
        assert_eq!(found.date, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap());
    }
}
