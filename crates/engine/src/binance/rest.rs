use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use common::{
    Bar, DataFeed, Error, ExecutionBackend, OrderHandle, OrderIntent, OrderStatus, Position,
    PositionSnapshot, Result,
};

const BASE_URL: &str = "https://api.binance.com";
/// Binance caps one klines request at 1000 rows.
const KLINE_PAGE: usize = 1000;

/// REST API client for Binance: order placement, account queries and
/// historical klines.
pub struct BinanceClient {
    credentials: Option<(String, String)>,
    http: Client,
    base_url: String,
    /// Kline interval served through `DataFeed` (e.g. "1d").
    interval: String,
}

impl BinanceClient {
    /// Client able to trade. Both credentials are required.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        let mut client = Self::public()?;
        client.credentials = Some((api_key.into(), secret.into()));
        Ok(client)
    }

    /// Market-data-only client; signed endpoints fail with `Error::Config`.
    pub fn public() -> Result<Self> {
        Ok(Self {
            credentials: None,
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .map_err(|e| Error::Http(e.to_string()))?,
            base_url: BASE_URL.to_string(),
            interval: "1d".to_string(),
        })
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    pub fn interval(&self) -> &str {
        &self.interval
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(k, s)| (k.as_str(), s.as_str()))
            .ok_or_else(|| Error::Config("Binance credentials are not configured".into()))
    }

    async fn signed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        let (api_key, secret) = self.credentials()?;
        let ts = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = sign(secret, &query)?;
        let signed_query = format!("{query}&signature={signature}");
        let url = format!("{}{path}", self.base_url);

        let request = if method == Method::POST {
            self.http
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(signed_query)
        } else {
            self.http.request(method, format!("{url}?{signed_query}"))
        };

        let resp = request
            .header("X-MBX-APIKEY", api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn klines(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={symbol}&interval={}&limit={limit}",
            self.base_url, self.interval
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = end_ms {
            url.push_str(&format!("&endTime={end}"));
        }

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::DataUnavailable(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::DataUnavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::DataUnavailable(format!("HTTP {status}: {body}")));
        }
        parse_klines(&body)
    }
}

fn sign(secret: &str, query: &str) -> Result<String> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Exchange(e.to_string()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Parse a klines array. Only bars whose close time has passed are kept.
fn parse_klines(body: &str) -> Result<Vec<Bar>> {
    let rows: Vec<Vec<serde_json::Value>> =
        serde_json::from_str(body).map_err(|e| Error::DataUnavailable(e.to_string()))?;
    let now = Utc::now();

    let num = |v: &serde_json::Value| -> Result<f64> {
        v.as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| v.as_f64())
            .ok_or_else(|| Error::DataUnavailable(format!("malformed kline field {v}")))
    };

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 7 {
            return Err(Error::DataUnavailable("kline row too short".into()));
        }
        let close_ms = row[6]
            .as_i64()
            .ok_or_else(|| Error::DataUnavailable("kline close time missing".into()))?;
        let Some(timestamp) = Utc.timestamp_millis_opt(close_ms).single() else {
            continue;
        };
        if timestamp > now {
            continue;
        }
        bars.push(Bar {
            timestamp,
            open: num(&row[1])?,
            high: num(&row[2])?,
            low: num(&row[3])?,
            close: num(&row[4])?,
            volume: num(&row[5])?,
        });
    }
    Ok(bars)
}

fn order_handle(intent: &OrderIntent, resp: OrderResponse) -> OrderHandle {
    let status = match resp.status.as_str() {
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "NEW" | "PENDING_NEW" => OrderStatus::Working,
        _ => OrderStatus::Cancelled,
    };

    let (notional, qty) = resp.fills.iter().fold((0.0, 0.0), |(n, q), f| {
        let price: f64 = f.price.parse().unwrap_or(0.0);
        let fill_qty: f64 = f.qty.parse().unwrap_or(0.0);
        (n + price * fill_qty, q + fill_qty)
    });
    let filled_quantity = resp.executed_qty.parse().unwrap_or(qty);

    OrderHandle {
        order_id: resp.client_order_id,
        intent_id: intent.id,
        symbol: intent.symbol.clone(),
        side: intent.side,
        status,
        filled_quantity,
        average_price: (qty > 0.0).then(|| notional / qty),
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl ExecutionBackend for BinanceClient {
    async fn submit(&self, intent: &OrderIntent) -> Result<OrderHandle> {
        let order_type = if intent.limit_price.is_some() {
            "LIMIT"
        } else {
            "MARKET"
        };

        // The intent id doubles as the client order id so the exchange can
        // reject accidental resubmission too.
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}&newOrderRespType=FULL",
            intent.symbol, intent.side, order_type, intent.quantity, intent.id
        );
        if let Some(price) = intent.limit_price {
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        debug!(symbol = %intent.symbol, side = %intent.side, "Submitting order to Binance");
        let body = self.signed(Method::POST, "/api/v3/order", &params).await?;
        let resp: OrderResponse =
            serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))?;
        Ok(order_handle(intent, resp))
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<()> {
        let params = format!(
            "symbol={}&origClientOrderId={}",
            handle.symbol, handle.order_id
        );
        match self.signed(Method::DELETE, "/api/v3/order", &params).await {
            Ok(_) => Ok(()),
            // -2011: unknown order, i.e. already filled or cancelled
            Err(Error::Exchange(msg)) if msg.contains("-2011") => {
                warn!(order = %handle.order_id, "Cancel for an order that is no longer open");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn positions(&self) -> Result<PositionSnapshot> {
        // Spot balances stand in for positions; entry price is unknown
        // without trade history.
        let body = self.signed(Method::GET, "/api/v3/account", "").await?;
        let account: AccountResponse =
            serde_json::from_str(&body).map_err(|e| Error::Exchange(e.to_string()))?;

        let positions = account
            .balances
            .into_iter()
            .filter(|b| b.asset != "USDT" && b.asset != "BNB")
            .filter_map(|b| {
                let qty = b.free.parse::<f64>().unwrap_or(0.0) + b.locked.parse::<f64>().unwrap_or(0.0);
                (qty > 0.0).then(|| Position {
                    symbol: format!("{}USDT", b.asset),
                    quantity: qty,
                    average_price: 0.0,
                })
            })
            .collect();

        Ok(PositionSnapshot {
            positions,
            taken_at: Some(Utc::now()),
        })
    }
}

#[async_trait]
impl DataFeed for BinanceClient {
    async fn fetch_series(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let end_ms = end.timestamp_millis();
        let mut cursor = start.timestamp_millis();
        let mut bars: Vec<Bar> = Vec::new();

        loop {
            let page = self
                .klines(symbol, Some(cursor), Some(end_ms), KLINE_PAGE)
                .await?;
            let full = page.len() == KLINE_PAGE;
            let Some(last) = page.last().map(|b| b.timestamp.timestamp_millis()) else {
                break;
            };
            bars.extend(page);
            if !full || last >= end_ms {
                break;
            }
            cursor = last + 1;
        }

        debug!(symbol, bars = bars.len(), %start, %end, "Fetched historical klines");
        Ok(bars)
    }

    async fn fetch_latest(&self, symbol: &str, window: usize) -> Result<Vec<Bar>> {
        // One extra row: the newest kline is usually still open.
        let limit = (window + 1).min(KLINE_PAGE);
        let mut bars = self.klines(symbol, None, None, limit).await?;
        if bars.len() > window {
            bars.drain(..bars.len() - window);
        }
        Ok(bars)
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    client_order_id: String,
    status: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    fills: Vec<FillDetail>,
}

#[derive(Deserialize)]
struct FillDetail {
    price: String,
    qty: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Deserialize)]
struct Balance {
    asset: String,
    free: String,
    locked: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderSide;

    #[test]
    fn signature_matches_binance_reference() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn klines_skip_the_open_candle() {
        let future = Utc::now().timestamp_millis() + 3_600_000;
        let body = format!(
            r#"[
                [1704067200000, "100.0", "110.0", "95.0", "105.0", "12.5", 1704153599999, "0", 10, "0", "0", "0"],
                [1704153600000, "105.0", "108.0", "101.0", "107.0", "8.0", {future}, "0", 10, "0", "0", "0"]
            ]"#
        );
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 105.0);
        assert_eq!(bars[0].volume, 12.5);
        assert_eq!(bars[0].timestamp.timestamp_millis(), 1704153599999);
    }

    #[test]
    fn malformed_klines_are_data_unavailable() {
        assert!(matches!(parse_klines("{}"), Err(Error::DataUnavailable(_))));
        assert!(matches!(
            parse_klines(r#"[[1, "x", "1", "1", "1", "1", 2]]"#),
            Err(Error::DataUnavailable(_))
        ));
    }

    #[test]
    fn order_response_maps_to_handle() {
        let intent = OrderIntent::market("s", "BTCUSDT", OrderSide::Buy, 0.3);
        let resp: OrderResponse = serde_json::from_str(
            r#"{
                "clientOrderId": "abc",
                "status": "PARTIALLY_FILLED",
                "executedQty": "0.2",
                "fills": [
                    {"price": "100.0", "qty": "0.1"},
                    {"price": "110.0", "qty": "0.1"}
                ]
            }"#,
        )
        .unwrap();
        let handle = order_handle(&intent, resp);
        assert_eq!(handle.status, OrderStatus::PartiallyFilled);
        assert_eq!(handle.filled_quantity, 0.2);
        assert!((handle.average_price.unwrap() - 105.0).abs() < 1e-9);
        assert_eq!(handle.intent_id, intent.id);
    }

    #[tokio::test]
    async fn public_client_cannot_trade() {
        let client = BinanceClient::public().unwrap();
        let intent = OrderIntent::market("s", "BTCUSDT", OrderSide::Buy, 1.0);
        assert!(matches!(client.submit(&intent).await, Err(Error::Config(_))));
    }
}
