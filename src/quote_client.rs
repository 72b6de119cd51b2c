// =============================================================================
// Quote Client — typed calls against the external NAV provider
// =============================================================================
//
// The provider returns `DD-MM-YYYY` dates and NAV figures as strings; this
// client normalises both at the boundary so nothing downstream ever touches
// a free-form string. Every call retries up to `retry_max` times on
// transport failure or a malformed payload, with exponential backoff
// (1s, 2s, 4s). It never writes to the NAV store — it only returns values.
// =============================================================================

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::errors::AppError;
use crate::types::SchemeCode;

/// A single NAV observation for a scheme.
#[derive(Debug, Clone)]
pub struct NavPoint {
    pub date: NaiveDate,
    pub nav: Decimal,
}

/// Result of a latest-NAV lookup, plus the scheme metadata the provider
/// bundles with every history/latest response.
#[derive(Debug, Clone)]
pub struct LatestQuote {
    pub nav: Decimal,
    pub date: NaiveDate,
    pub meta: SchemeMeta,
}

/// Scheme metadata as published by the provider.
#[derive(Debug, Clone)]
pub struct SchemeMeta {
    pub scheme_name: String,
    pub fund_house: String,
    pub scheme_category: String,
    pub scheme_type: String,
}

/// A single row of `ListFunds`.
#[derive(Debug, Clone, Deserialize)]
pub struct FundListing {
    #[serde(rename = "schemeCode")]
    pub scheme_code: SchemeCode,
    #[serde(rename = "schemeName")]
    pub scheme_name: String,
}

// ── Wire shapes ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawMeta {
    fund_house: String,
    scheme_type: String,
    scheme_category: String,
    scheme_name: String,
}

#[derive(Debug, Deserialize)]
struct RawNavEntry {
    date: String,
    nav: String,
}

#[derive(Debug, Deserialize)]
struct RawQuoteResponse {
    meta: RawMeta,
    data: Vec<RawNavEntry>,
}

/// Typed client for the external NAV provider. Carries a single shared
/// `reqwest::Client` (connection pool reused across calls) and a configured
/// request timeout.
#[derive(Clone)]
pub struct QuoteClient {
    base_url: String,
    client: reqwest::Client,
    retry_max: u32,
}

impl QuoteClient {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64, retry_max: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            retry_max,
        }
    }

    /// `FetchLatest(schemeCode) -> { nav, date, meta }`.
    #[instrument(skip(self), name = "quote_client::fetch_latest")]
    pub async fn fetch_latest(&self, scheme_code: SchemeCode) -> Result<LatestQuote, AppError> {
        let url = format!("{}/mf/{}", self.base_url, scheme_code);
        let resp = self.get_with_retry(&url).await?;
        let newest = resp
            .data
            .first()
            .ok_or_else(|| AppError::Parse("provider returned no NAV entries".into()))?;

        let date = parse_provider_date(&newest.date)?;
        let nav = parse_provider_decimal(&newest.nav)?;

        Ok(LatestQuote {
            nav,
            date,
            meta: SchemeMeta {
                scheme_name: resp.meta.scheme_name,
                fund_house: resp.meta.fund_house,
                scheme_category: resp.meta.scheme_category,
                scheme_type: resp.meta.scheme_type,
            },
        })
    }

    /// `FetchHistory(schemeCode) -> [{ date, nav }]`, newest-first.
    #[instrument(skip(self), name = "quote_client::fetch_history")]
    pub async fn fetch_history(&self, scheme_code: SchemeCode) -> Result<Vec<NavPoint>, AppError> {
        let url = format!("{}/mf/{}", self.base_url, scheme_code);
        let resp = self.get_with_retry(&url).await?;

        let mut points = Vec::with_capacity(resp.data.len());
        for entry in &resp.data {
            points.push(NavPoint {
                date: parse_provider_date(&entry.date)?,
                nav: parse_provider_decimal(&entry.nav)?,
            });
        }
        Ok(points)
    }

    /// `ListFunds() -> [{ schemeCode, schemeName, … }]`.
    #[instrument(skip(self), name = "quote_client::list_funds")]
    pub async fn list_funds(&self) -> Result<Vec<FundListing>, AppError> {
        let url = format!("{}/mf", self.base_url);
        self.get_json_with_retry(&url).await
    }

    // -------------------------------------------------------------------------
    // Retry / transport plumbing
    // -------------------------------------------------------------------------

    async fn get_with_retry(&self, url: &str) -> Result<RawQuoteResponse, AppError> {
        self.get_json_with_retry(url).await
    }

    async fn get_json_with_retry<T>(&self, url: &str) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_get_json::<T>(url).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt > self.retry_max => {
                    warn!(url, attempt, error = %err, "provider request exhausted retries");
                    return Err(err);
                }
                Err(err) => {
                    let backoff = Duration::from_secs(1u64 << (attempt - 1));
                    debug!(url, attempt, backoff_secs = backoff.as_secs(), error = %err, "retrying provider request");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn try_get_json<T>(&self, url: &str) -> Result<T, AppError>
    where
        T: serde::de::DeserializeOwned,
    {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NoScheme);
        }
        if !status.is_success() {
            return Err(AppError::Transport(format!("provider returned {status}")));
        }

        resp.json::<T>()
            .await
            .map_err(|e| AppError::Parse(e.to_string()))
    }
}

/// Normalise a `DD-MM-YYYY` provider date to an absolute instant at day
/// granularity.
fn parse_provider_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw, "%d-%m-%Y")
        .map_err(|_| AppError::Parse(format!("invalid provider date: '{raw}'")))
}

/// Parse a NAV string to the decimal type used throughout the accounting
/// path.
fn parse_provider_decimal(raw: &str) -> Result<Decimal, AppError> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|_| AppError::Parse(format!("invalid NAV value: '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_date() {
        let d = parse_provider_date("05-01-2024").unwrap();
        assert_eq!(d, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
    }

    #[test]
    fn rejects_malformed_date() {
        assert!(parse_provider_date("2024-01-05").is_err());
    }

    #[test]
    fn parses_provider_decimal() {
        let d = parse_provider_decimal("152.3412").unwrap();
        assert_eq!(d, "152.3412".parse::<Decimal>().unwrap());
    }

    #[test]
    fn rejects_malformed_decimal() {
        assert!(parse_provider_decimal("not-a-number").is_err());
    }
}
