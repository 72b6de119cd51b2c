// =============================================================================
// Central Application State — Navfolio
// =============================================================================
//
// The single source of truth tying every subsystem together: the quote
// client, NAV store, position engine, scheme catalog, transaction log,
// per-portfolio coordination locks, and the NAV refresh engine's running
// sentinel. Constructed once in `main` and shared across every async task
// via `Arc<AppState>`.
//
// Thread safety:
//   - `parking_lot::RwLock` for collections whose critical sections never
//     cross an `.await` (the portfolio lock map, the config).
//   - `tokio::sync::Mutex` for the per-portfolio locks themselves, since
//     holding one spans awaited I/O (NAV lookups, provider calls).
//   - `AtomicBool` for the refresh-running sentinel (§4.6): lock-free,
//     single bit of state, checked on every admin trigger.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::config::AppConfig;
use crate::nav_store::NavStore;
use crate::position_engine::PositionEngine;
use crate::quote_client::QuoteClient;
use crate::scheme_catalog::SchemeCatalog;
use crate::transaction_log::{PortfolioId, TransactionLog};

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: RwLock<AppConfig>,

    pub quote_client: Arc<QuoteClient>,
    pub nav_store: Arc<NavStore>,
    pub positions: Arc<PositionEngine>,
    pub catalog: Arc<SchemeCatalog>,
    pub log: Arc<TransactionLog>,

    /// Per-portfolio serialization locks (§4.6), created lazily on first use.
    portfolio_locks: RwLock<HashMap<PortfolioId, Arc<AsyncMutex<()>>>>,

    /// Set for the duration of a NAV refresh run; an admin trigger while a
    /// run is already in flight is rejected rather than queued.
    refresh_running: AtomicBool,

    /// Signalled once on graceful shutdown so the refresh scheduler and any
    /// in-flight refresh run can cancel cooperatively.
    pub shutdown: Notify,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let quote_client = Arc::new(QuoteClient::new(
            config.provider.base_url.clone(),
            config.provider.timeout_ms,
            config.nav.retry_max,
        ));
        let nav_store = Arc::new(NavStore::new(quote_client.clone(), config.nav.history_cap));
        let log = Arc::new(TransactionLog::new());

        Self {
            config: RwLock::new(config),
            quote_client,
            nav_store,
            positions: Arc::new(PositionEngine::new(log.clone())),
            catalog: Arc::new(SchemeCatalog::new()),
            log,
            portfolio_locks: RwLock::new(HashMap::new()),
            refresh_running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// The serialization lock for a portfolio. Two concurrent BUY/SELL
    /// requests for the same portfolio must acquire this before mutating
    /// the position engine; requests for different portfolios never
    /// contend with one another.
    pub fn portfolio_lock(&self, portfolio_id: PortfolioId) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.portfolio_locks.read().get(&portfolio_id) {
            return lock.clone();
        }
        self.portfolio_locks
            .write()
            .entry(portfolio_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Attempt to enter a NAV refresh run. Returns `false` if one is
    /// already in progress.
    pub fn try_start_refresh(&self) -> bool {
        self.refresh_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn finish_refresh(&self) {
        self.refresh_running.store(false, Ordering::SeqCst);
    }

    pub fn is_refresh_running(&self) -> bool {
        self.refresh_running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portfolio_lock_is_stable_across_calls() {
        let state = AppState::new(AppConfig::default());
        let a = state.portfolio_lock(1);
        let b = state.portfolio_lock(1);
        assert!(Arc::ptr_eq(&a, &b));

        let c = state.portfolio_lock(2);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn refresh_sentinel_rejects_concurrent_entry() {
        let state = AppState::new(AppConfig::default());
        assert!(state.try_start_refresh());
        assert!(!state.try_start_refresh());
        state.finish_refresh();
        assert!(state.try_start_refresh());
    }
}
