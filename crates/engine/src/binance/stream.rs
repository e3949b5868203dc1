use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use common::{Bar, Error, MarketEvent, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Binance kline WebSocket stream for a single symbol.
///
/// Only closed candles are published: an open candle is still changing and
/// strategies never see it. Reconnects with exponential backoff.
pub struct BinanceStream {
    symbol: String,
    interval: String,
    market_tx: broadcast::Sender<MarketEvent>,
}

impl BinanceStream {
    pub fn new(symbol: impl Into<String>, market_tx: broadcast::Sender<MarketEvent>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: "1m".to_string(),
            market_tx,
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    /// Run the stream loop forever. Call this inside a `tokio::spawn`.
    pub async fn run(self) {
        let mut backoff = Duration::from_secs(1);

        loop {
            info!(symbol = %self.symbol, interval = %self.interval, "Connecting to Binance kline stream");
            match self.connect_once().await {
                Ok(()) => {
                    // Binance closes sessions after 24h
                    info!(symbol = %self.symbol, "Kline stream closed, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, backoff = ?backoff, "Kline stream error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let url = Url::parse(&format!(
            "wss://stream.binance.com:9443/ws/{}@kline_{}",
            self.symbol.to_lowercase(),
            self.interval
        ))
        .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
            let Message::Text(text) = msg else {
                continue;
            };
            match parse_kline_event(&self.symbol, &text) {
                Ok(Some(event)) => {
                    debug!(symbol = %event.symbol, close = event.bar.close, "Closed candle");
                    // No receivers is fine
                    let _ = self.market_tx.send(event);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to parse kline event"),
            }
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct KlineWrapper {
    k: KlineData,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
    #[serde(rename = "T")]
    close_time_ms: i64,
}

/// `Ok(None)` for non-kline messages and candles that are still open.
fn parse_kline_event(symbol: &str, text: &str) -> Result<Option<MarketEvent>> {
    let wrapper: serde_json::Value = serde_json::from_str(text)?;
    if wrapper.get("e").and_then(|v| v.as_str()) != Some("kline") {
        return Ok(None);
    }

    let k = serde_json::from_value::<KlineWrapper>(wrapper)?.k;
    if !k.is_closed {
        return Ok(None);
    }

    let timestamp = Utc
        .timestamp_millis_opt(k.close_time_ms)
        .single()
        .ok_or_else(|| Error::WebSocket(format!("bad close time {}", k.close_time_ms)))?;
    let num = |field: &str, raw: &str| -> Result<f64> {
        raw.parse()
            .map_err(|_| Error::WebSocket(format!("malformed kline {field}: '{raw}'")))
    };

    Ok(Some(MarketEvent {
        symbol: symbol.to_string(),
        bar: Bar {
            timestamp,
            open: num("open", &k.open)?,
            high: num("high", &k.high)?,
            low: num("low", &k.low)?,
            close: num("close", &k.close)?,
            volume: num("volume", &k.volume)?,
        },
    }))
}
