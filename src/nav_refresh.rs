// =============================================================================
// NAV Refresh Engine — scheduled and admin-triggerable bulk NAV update
// =============================================================================
//
// Discovers its own workload (every scheme referenced by a non-empty
// Position), then walks it in fixed-size batches with bounded in-batch
// concurrency and an inter-batch delay, so the provider never sees more
// than `concurrency` requests in flight at once. A scheme's fetch failure
// is recorded and the run continues; it never aborts the whole batch.
//
// SAFETY POLICY: this engine only ever writes to the NAV store. It never
// touches Position, the Transaction log, or a Portfolio.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::str::FromStr;
use tracing::{info, instrument, warn};

use crate::app_state::AppState;
use crate::types::SchemeCode;

/// Outcome of refreshing a single scheme: `error` is `None` on success, or
/// the stringified `AppError` the quote client returned after exhausting
/// its retries.
#[derive(Debug, Clone)]
struct SchemeOutcome {
    scheme_code: SchemeCode,
    error: Option<String>,
}

/// A single scheme's failure within a run, per §4.4's `RunSummary` shape.
#[derive(Debug, Clone, Serialize)]
pub struct SchemeFailure {
    pub scheme_code: SchemeCode,
    pub error: String,
}

/// Summary of one NAV refresh run — `RunSummary { total, successes[],
/// failures[{ schemeCode, error }], durationMs, startedAt }` per §4.4.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
    pub total: usize,
    pub successes: Vec<SchemeCode>,
    pub failures: Vec<SchemeFailure>,
    pub duration_ms: i64,
    pub cancelled: bool,
}

/// Run one NAV refresh pass over every scheme currently held by a user.
/// Returns `None` if a run is already in progress (§4.6 single-run
/// sentinel) rather than queuing behind it.
#[instrument(skip(state), name = "nav_refresh::run_once")]
pub async fn run_once(state: &Arc<AppState>) -> Option<RunSummary> {
    if !state.try_start_refresh() {
        warn!("NAV refresh already running — ignoring trigger");
        return None;
    }

    let started_at = Utc::now();
    let run_started = std::time::Instant::now();
    let schemes = state.positions.active_schemes();
    let (batch_size, concurrency, req_delay_ms, batch_delay_ms) = {
        let cfg = state.config.read();
        (
            cfg.nav.batch_size,
            cfg.nav.concurrency,
            cfg.nav.req_delay_ms,
            cfg.nav.batch_delay_ms,
        )
    };

    info!(scheme_count = schemes.len(), batch_size, "NAV refresh run started");

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    let mut cancelled = false;

    'batches: for batch in schemes.chunks(batch_size.max(1)) {
        let shutdown = state.shutdown.notified();
        tokio::pin!(shutdown);

        let outcomes = tokio::select! {
            outcomes = refresh_batch(state, batch, concurrency, req_delay_ms) => outcomes,
            _ = &mut shutdown => {
                info!("NAV refresh run cancelled by shutdown signal");
                cancelled = true;
                break 'batches;
            }
        };

        for outcome in outcomes {
            match outcome.error {
                None => successes.push(outcome.scheme_code),
                Some(error) => failures.push(SchemeFailure {
                    scheme_code: outcome.scheme_code,
                    error,
                }),
            }
        }

        if !cancelled {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(batch_delay_ms)) => {}
                _ = state.shutdown.notified() => {
                    cancelled = true;
                    break 'batches;
                }
            }
        }
    }

    let summary = RunSummary {
        started_at,
        finished_at: Utc::now(),
        total: schemes.len(),
        successes,
        failures,
        duration_ms: run_started.elapsed().as_millis() as i64,
        cancelled,
    };

    info!(
        succeeded = summary.successes.len(),
        failed = summary.failures.len(),
        cancelled = summary.cancelled,
        duration_ms = summary.duration_ms,
        "NAV refresh run completed"
    );

    state.finish_refresh();
    Some(summary)
}

async fn refresh_batch(
    state: &Arc<AppState>,
    batch: &[SchemeCode],
    concurrency: usize,
    req_delay_ms: u64,
) -> Vec<SchemeOutcome> {
    stream::iter(batch.iter().copied())
        .map(|scheme_code| {
            let state = state.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(req_delay_ms)).await;
                match state.quote_client.fetch_latest(scheme_code).await {
                    Ok(quote) => {
                        state.nav_store.upsert_latest(scheme_code, quote.nav, quote.date);
                        state.nav_store.upsert_history(scheme_code, quote.date, quote.nav);
                        state.catalog.observe(scheme_code, &quote.meta);
                        SchemeOutcome { scheme_code, error: None }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        warn!(scheme_code, error = %message, "NAV refresh failed for scheme");
                        SchemeOutcome {
                            scheme_code,
                            error: Some(message),
                        }
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await
}

/// Background loop: sleeps until the next cron-scheduled firing, then runs
/// a refresh pass, forever, until the shutdown notification fires.
pub async fn scheduler_loop(state: Arc<AppState>) {
    loop {
        let (schedule_expr, tz_name) = {
            let cfg = state.config.read();
            (cfg.cron_schedule.clone(), cfg.cron_timezone.clone())
        };

        let schedule = match Schedule::from_str(&schedule_expr) {
            Ok(s) => s,
            Err(err) => {
                warn!(schedule = %schedule_expr, error = %err, "invalid cron schedule — falling back to hourly");
                Schedule::from_str("0 0 * * * *").expect("fallback schedule is valid")
            }
        };

        let tz: Tz = tz_name.parse().unwrap_or_else(|_| {
            warn!(tz = %tz_name, "unrecognised cron timezone — falling back to UTC");
            chrono_tz::UTC
        });

        let Some(next) = schedule.upcoming(tz).next() else {
            warn!("cron schedule produced no upcoming firing — sleeping 1h");
            tokio::time::sleep(Duration::from_secs(3600)).await;
            continue;
        };

        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(0));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                run_once(&state).await;
            }
            _ = state.shutdown.notified() => {
                info!("NAV refresh scheduler shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn run_once_reports_zero_schemes_when_no_positions_open() {
        let state = Arc::new(AppState::new(AppConfig::default()));
        let summary = run_once(&state).await.unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.successes.is_empty());
        assert!(summary.failures.is_empty());
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected_while_a_run_is_in_flight() {
        let state = Arc::new(AppState::new(AppConfig::default()));
        assert!(state.try_start_refresh());
        assert!(run_once(&state).await.is_none());
        state.finish_refresh();
    }

    #[tokio::test]
    async fn run_once_skips_schemes_with_no_open_position() {
        let state = Arc::new(AppState::new(AppConfig::default()));
        state
            .positions
            .buy("U1", 152075, dec!(10), dec!(10), Utc::now())
            .unwrap();
        state
            .positions
            .sell("U1", 152075, dec!(10), dec!(11), Utc::now())
            .unwrap();

        let summary = run_once(&state).await.unwrap();
        assert_eq!(summary.total, 0);
    }
}
