use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Months, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{Error, MacroFeed, Result};

/// First month requested from the CPI endpoint.
const HISTORY_START: &str = "2000-01-01";
const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Reports the same inflation rate at every instant.
#[derive(Debug, Clone, Copy)]
pub struct StaticInflation(pub f64);

#[async_trait]
impl MacroFeed for StaticInflation {
    async fn inflation_rate(&self, _at: DateTime<Utc>) -> Result<Option<f64>> {
        Ok(Some(self.0))
    }
}

#[derive(Debug, Deserialize)]
struct CpiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<CpiRow>,
}

#[derive(Debug, Deserialize)]
struct CpiRow {
    date: NaiveDate,
    value: f64,
}

/// Year-over-year inflation derived from a monthly CPI index served over HTTP
/// as `GET {base}/cpi/{country}?start_date=..&end_date=..` with a bearer key.
///
/// The whole series is fetched once and cached for a day, so per-bar lookups
/// during a historical replay cost one request.
pub struct HttpInflationFeed {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    country: String,
    cache: RwLock<Option<(Instant, Vec<CpiRow>)>>,
}

impl HttpInflationFeed {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, country: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .map_err(|e| Error::Http(e.to_string()))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            country: country.into(),
            cache: RwLock::new(None),
        })
    }

    async fn fetch(&self) -> Result<Vec<CpiRow>> {
        let url = format!("{}/cpi/{}", self.base_url, self.country);
        let end = Utc::now().date_naive().to_string();
        let mut request = self
            .http
            .get(&url)
            .query(&[("start_date", HISTORY_START), ("end_date", end.as_str())]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| Error::DataUnavailable(format!("CPI request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::DataUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::DataUnavailable(format!("CPI endpoint HTTP {status}: {body}")));
        }
        let rows = parse_cpi(&body)?;
        info!(country = %self.country, months = rows.len(), "CPI series loaded");
        Ok(rows)
    }

    async fn with_series<T>(&self, f: impl FnOnce(&[CpiRow]) -> T) -> Result<T> {
        {
            let cache = self.cache.read().await;
            if let Some((loaded, rows)) = cache.as_ref() {
                if loaded.elapsed() < CACHE_TTL {
                    return Ok(f(rows));
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another caller may have refreshed while we waited for the lock
        if let Some((loaded, rows)) = cache.as_ref() {
            if loaded.elapsed() < CACHE_TTL {
                return Ok(f(rows));
            }
        }
        let rows = self.fetch().await?;
        let out = f(&rows);
        *cache = Some((Instant::now(), rows));
        Ok(out)
    }
}

#[async_trait]
impl MacroFeed for HttpInflationFeed {
    async fn inflation_rate(&self, at: DateTime<Utc>) -> Result<Option<f64>> {
        let rate = self.with_series(|rows| year_over_year(rows, at.date_naive())).await?;
        debug!(%at, ?rate, "Inflation lookup");
        Ok(rate)
    }
}

fn parse_cpi(body: &str) -> Result<Vec<CpiRow>> {
    let resp: CpiResponse =
        serde_json::from_str(body).map_err(|e| Error::DataUnavailable(format!("malformed CPI response: {e}")))?;
    if resp.status != "success" {
        return Err(Error::DataUnavailable(
            resp.message.unwrap_or_else(|| format!("CPI endpoint returned status '{}'", resp.status)),
        ));
    }
    let mut rows = resp.data;
    rows.sort_by_key(|r| r.date);
    Ok(rows)
}

/// Latest CPI print on or before `on`, divided by the print a year before it.
fn year_over_year(rows: &[CpiRow], on: NaiveDate) -> Option<f64> {
    let latest = latest_on_or_before(rows, on)?;
    let year_ago = latest.date.checked_sub_months(Months::new(12))?;
    let base = latest_on_or_before(rows, year_ago)?;
    (base.value > 0.0).then(|| latest.value / base.value - 1.0)
}

fn latest_on_or_before(rows: &[CpiRow], on: NaiveDate) -> Option<&CpiRow> {
    let idx = rows.partition_point(|r| r.date <= on);
    idx.checked_sub(1).map(|i| &rows[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BODY: &str = r#"{
        "status": "success",
        "data": [
            {"date": "2023-02-01", "value": 104.0},
            {"date": "2022-01-01", "value": 100.0},
            {"date": "2022-02-01", "value": 100.0},
            {"date": "2023-01-01", "value": 109.0}
        ]
    }"#;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn yoy_uses_latest_print_and_the_one_a_year_before() {
        let rows = parse_cpi(BODY).unwrap();
        let jan = year_over_year(&rows, day(2023, 1, 20)).unwrap();
        assert!((jan - 0.09).abs() < 1e-9);
        let feb = year_over_year(&rows, day(2023, 6, 1)).unwrap();
        assert!((feb - 0.04).abs() < 1e-9);
        // No print a year earlier
        assert_eq!(year_over_year(&rows, day(2022, 3, 1)), None);
        assert_eq!(year_over_year(&rows, day(2021, 12, 1)), None);
    }

    #[test]
    fn error_status_is_unavailable() {
        let err = parse_cpi(r#"{"status": "error", "message": "quota exceeded"}"#).unwrap_err();
        assert!(matches!(err, Error::DataUnavailable(ref m) if m.contains("quota")));
        assert!(matches!(parse_cpi("<html>"), Err(Error::DataUnavailable(_))));
    }

    #[tokio::test]
    async fn static_feed_reports_fixed_rate() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(StaticInflation(0.07).inflation_rate(at).await.unwrap(), Some(0.07));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let feed = HttpInflationFeed::new("http://127.0.0.1:9", None, "US").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(feed.inflation_rate(at).await, Err(Error::DataUnavailable(_))));
    }
}
