// =============================================================================
// Kite broker backend — token-authenticated REST plus the binary tick channel
// =============================================================================
//
// REST conventions: every request carries `X-Kite-Version: 3` and
// `Authorization: token api_key:access_token`; responses wrap payloads in
// `{"status": "...", "data": ...}`. Order-path methods translate failures
// into `OrderResult` codes; query paths return `anyhow::Result` and let the
// reconcilers retry.
//
// Historical candles: the broker serves 1-minute and daily series natively.
// The 25- and 125-minute frames are aggregated here from the 5-minute base
// using the same reduction as the live aggregator, discarding a trailing
// partial bucket.
// =============================================================================

pub mod instruments;
pub mod ticker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use self::instruments::{parse_instruments_csv, InstrumentMap};
use self::ticker::{KiteTicker, WsState};
use crate::broker::{
    BrokerAdapter, BrokerCredentials, BrokerFunds, BrokerHolding, BrokerOrderStatus,
    BrokerPosition, BrokerRegistry, BrokerRole, ConnectionResult, Instrument, OrderModify,
    OrderRequest, OrderResult, ERR_AUTH_FAILED, ERR_BROKER_REJECTED, ERR_NOT_CONNECTED,
    ERR_READ_ONLY, ERR_TRANSIENT,
};
use crate::session;
use crate::types::{Candle, Tick, Timeframe};

const DEFAULT_BASE_URL: &str = "https://api.kite.trade";
const DEFAULT_WS_URL: &str = "wss://ws.kite.trade";
const KITE_VERSION: &str = "3";
/// Exchange segment this engine trades.
const EXCHANGE: &str = "NSE";

pub struct KiteBroker {
    name: String,
    role: BrokerRole,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: RwLock<String>,
    connected: AtomicBool,
    instruments: Arc<RwLock<InstrumentMap>>,
    ticker: Arc<KiteTicker>,
}

impl KiteBroker {
    pub fn new(
        api_key: impl Into<String>,
        access_token: impl Into<String>,
        role: BrokerRole,
        tick_tx: mpsc::UnboundedSender<Tick>,
        base_url: Option<String>,
        ws_url: Option<String>,
        stale_after: Duration,
    ) -> Self {
        let api_key = api_key.into();
        let access_token = access_token.into();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let instruments = Arc::new(RwLock::new(InstrumentMap::default()));
        let ticker = Arc::new(KiteTicker::new(
            ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            api_key.clone(),
            access_token.clone(),
            instruments.clone(),
            tick_tx,
            stale_after,
        ));

        Self {
            name: "kite".into(),
            role,
            http,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            access_token: RwLock::new(access_token),
            connected: AtomicBool::new(false),
            instruments,
            ticker,
        }
    }

    /// Spawn the tick-channel run loop. Call once after construction.
    pub fn start_ticker(&self) {
        tokio::spawn(self.ticker.clone().run());
    }

    /// Exchange a login `request_token` for an access token. The checksum is
    /// SHA-256 over api_key + request_token + api_secret, hex-encoded.
    pub async fn exchange_request_token(
        &self,
        request_token: &str,
        api_secret: &str,
    ) -> Result<String> {
        let checksum = session_checksum(&self.api_key, request_token, api_secret);
        let url = format!("{}/session/token", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .form(&[
                ("api_key", self.api_key.as_str()),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await
            .context("POST /session/token request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse session token response")?;

        if !status.is_success() {
            bail!("session token exchange returned {}: {}", status, body);
        }

        let token = body["data"]["access_token"]
            .as_str()
            .context("session response missing access_token")?
            .to_string();

        *self.access_token.write() = token.clone();
        info!("session access token exchanged");
        Ok(token)
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token.read())
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse GET {path} response"))?;

        if !status.is_success() {
            bail!("GET {path} returned {}: {}", status, body);
        }
        Ok(body)
    }

    /// Shared failure mapping for the order path.
    fn order_failure(status: reqwest::StatusCode, body: &serde_json::Value) -> OrderResult {
        let message = body["message"]
            .as_str()
            .unwrap_or("broker returned an error")
            .to_string();
        let code = match status.as_u16() {
            401 | 403 => ERR_AUTH_FAILED,
            429 | 500..=599 => ERR_TRANSIENT,
            _ => ERR_BROKER_REJECTED,
        };
        OrderResult::failed(code, message)
    }
}

#[async_trait]
impl BrokerAdapter for KiteBroker {
    fn broker_name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> BrokerRole {
        self.role
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> ConnectionResult {
        *self.access_token.write() = credentials.access_token.clone();

        // Token validation against the profile endpoint.
        let url = format!("{}/user/profile", self.base_url);
        let resp = match self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return ConnectionResult::failed(ERR_TRANSIENT, format!("profile check failed: {e}"))
            }
        };

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return ConnectionResult::failed(ERR_AUTH_FAILED, "access token rejected by broker");
        }
        if !status.is_success() {
            return ConnectionResult::failed(
                ERR_TRANSIENT,
                format!("profile endpoint returned {status}"),
            );
        }

        // The tick channel needs the token mapping before it can subscribe.
        match self.get_instruments().await {
            Ok(list) => {
                let count = list.len();
                *self.instruments.write() = InstrumentMap::from_instruments(list);
                info!(instruments = count, "instrument master loaded");
            }
            Err(e) => {
                warn!(error = %e, "instrument master load failed — tick subscriptions unavailable");
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(broker = %self.name, "broker connected");
        ConnectionResult::ok(self.access_token.read().clone())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.ticker.disconnect().await;
        info!(broker = %self.name, "broker disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.ticker.is_stale()
    }

    fn can_place_orders(&self) -> bool {
        self.is_connected() && self.ticker.state() == WsState::Connected
    }

    async fn place_order(&self, req: &OrderRequest) -> OrderResult {
        if !self.connected.load(Ordering::SeqCst) {
            return OrderResult::failed(ERR_NOT_CONNECTED, "broker is not connected");
        }
        if !self.can_place_orders() {
            return OrderResult::failed(ERR_READ_ONLY, "feed is stale — order placement refused");
        }

        let mut form: Vec<(&str, String)> = vec![
            ("exchange", EXCHANGE.to_string()),
            ("tradingsymbol", req.symbol.clone()),
            ("transaction_type", req.direction.as_str().to_string()),
            ("order_type", req.order_type.as_str().to_string()),
            ("quantity", req.quantity.to_string()),
            ("product", req.product_type.as_str().to_string()),
            ("validity", "DAY".to_string()),
        ];
        if let Some(price) = req.price {
            form.push(("price", format!("{price:.2}")));
        }
        if let Some(trigger) = req.trigger_price {
            form.push(("trigger_price", format!("{trigger:.2}")));
        }
        if let Some(tag) = &req.client_tag {
            form.push(("tag", tag.clone()));
        }

        let url = format!("{}/orders/regular", self.base_url);
        let resp = match self
            .http
            .post(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .form(&form)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => return OrderResult::failed(ERR_TRANSIENT, format!("order request failed: {e}")),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(body) => body,
            Err(e) => {
                return OrderResult::failed(ERR_TRANSIENT, format!("unparseable order response: {e}"))
            }
        };

        if !status.is_success() {
            return Self::order_failure(status, &body);
        }

        match body["data"]["order_id"].as_str() {
            Some(order_id) => {
                debug!(symbol = %req.symbol, order_id, "order placed");
                OrderResult::ok(order_id)
            }
            None => OrderResult::failed(ERR_BROKER_REJECTED, "order response missing order_id"),
        }
    }

    async fn modify_order(&self, order_id: &str, changes: &OrderModify) -> OrderResult {
        if !self.connected.load(Ordering::SeqCst) {
            return OrderResult::failed(ERR_NOT_CONNECTED, "broker is not connected");
        }

        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(qty) = changes.quantity {
            form.push(("quantity", qty.to_string()));
        }
        if let Some(price) = changes.price {
            form.push(("price", format!("{price:.2}")));
        }
        if let Some(trigger) = changes.trigger_price {
            form.push(("trigger_price", format!("{trigger:.2}")));
        }
        if let Some(order_type) = changes.order_type {
            form.push(("order_type", order_type.as_str().to_string()));
        }

        let url = format!("{}/orders/regular/{order_id}", self.base_url);
        let resp = match self
            .http
            .put(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .form(&form)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return OrderResult::failed(ERR_TRANSIENT, format!("modify request failed: {e}"))
            }
        };

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            return Self::order_failure(status, &body);
        }
        OrderResult::ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> OrderResult {
        let url = format!("{}/orders/regular/{order_id}", self.base_url);
        let resp = match self
            .http
            .delete(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                return OrderResult::failed(ERR_TRANSIENT, format!("cancel request failed: {e}"))
            }
        };

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            return Self::order_failure(status, &body);
        }
        OrderResult::ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<BrokerOrderStatus> {
        let body = self.get_json(&format!("/orders/{order_id}")).await?;
        let history = body["data"]
            .as_array()
            .context("order history is not an array")?;
        let last = history
            .last()
            .with_context(|| format!("order {order_id} has no history"))?;
        parse_order_json(last)
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrderStatus>> {
        let body = self.get_json("/orders").await?;
        let orders = body["data"].as_array().context("orders is not an array")?;
        let mut out = Vec::with_capacity(orders.len());
        for o in orders {
            out.push(parse_order_json(o)?);
        }
        Ok(out)
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let body = self.get_json("/portfolio/positions").await?;
        let net = body["data"]["net"]
            .as_array()
            .context("positions.net is not an array")?;
        Ok(net
            .iter()
            .map(|p| BrokerPosition {
                symbol: p["tradingsymbol"].as_str().unwrap_or_default().to_string(),
                quantity: p["quantity"].as_i64().unwrap_or(0),
                average_price: p["average_price"].as_f64().unwrap_or(0.0),
                pnl: p["pnl"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>> {
        let body = self.get_json("/portfolio/holdings").await?;
        let holdings = body["data"].as_array().context("holdings is not an array")?;
        Ok(holdings
            .iter()
            .map(|h| BrokerHolding {
                symbol: h["tradingsymbol"].as_str().unwrap_or_default().to_string(),
                quantity: h["quantity"].as_u64().unwrap_or(0) as u32,
                average_price: h["average_price"].as_f64().unwrap_or(0.0),
                last_price: h["last_price"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    async fn get_funds(&self) -> Result<BrokerFunds> {
        let body = self.get_json("/user/margins").await?;
        let equity = &body["data"]["equity"];
        Ok(BrokerFunds {
            available_cash: equity["available"]["cash"].as_f64().unwrap_or(0.0),
            used_margin: equity["utilised"]["debits"].as_f64().unwrap_or(0.0),
        })
    }

    async fn get_ltp(&self, symbol: &str) -> Result<f64> {
        let key = format!("{EXCHANGE}:{symbol}");
        let body = self.get_json(&format!("/quote/ltp?i={key}")).await?;
        body["data"][&key]["last_price"]
            .as_f64()
            .with_context(|| format!("no LTP for {key}"))
    }

    async fn get_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let token = self
            .instruments
            .read()
            .token_for(symbol)
            .with_context(|| format!("no instrument token for {symbol}"))?;

        let (interval, base_tf) = native_interval(timeframe);
        let offset = session::exchange_offset();
        let path = format!(
            "/instruments/historical/{token}/{interval}?from={}&to={}",
            from.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S"),
            to.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S"),
        );

        let body = self.get_json(&path).await?;
        let rows = body["data"]["candles"]
            .as_array()
            .context("historical response missing candles")?;

        let base = parse_historical_rows(symbol, base_tf, rows)?;
        if base_tf == timeframe {
            return Ok(base);
        }
        Ok(aggregate_session_buckets(&base, timeframe))
    }

    async fn subscribe_ticks(&self, symbols: &[String]) -> Result<()> {
        let tokens = self.tokens_for(symbols);
        if tokens.is_empty() {
            bail!("none of {symbols:?} resolve to instrument tokens");
        }
        self.ticker.subscribe(&tokens).await;
        Ok(())
    }

    async fn unsubscribe_ticks(&self, symbols: &[String]) -> Result<()> {
        let tokens = self.tokens_for(symbols);
        self.ticker.unsubscribe(&tokens).await;
        Ok(())
    }

    async fn get_instruments(&self) -> Result<Vec<Instrument>> {
        let url = format!("{}/instruments", self.base_url);
        let resp = self
            .http
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .context("GET /instruments request failed")?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .context("failed to read instrument dump")?;
        if !status.is_success() {
            bail!("GET /instruments returned {status}");
        }
        parse_instruments_csv(&text)
    }

    async fn reload_token(&self, new_token: &str, session_id: &str) -> Result<()> {
        info!(session_id, "broker token reload requested");
        *self.access_token.write() = new_token.to_string();
        self.ticker.reload_token(new_token).await;
        Ok(())
    }
}

impl KiteBroker {
    fn tokens_for(&self, symbols: &[String]) -> Vec<u32> {
        let instruments = self.instruments.read();
        symbols
            .iter()
            .filter_map(|s| {
                let token = instruments.token_for(s);
                if token.is_none() {
                    warn!(symbol = %s, "symbol missing from instrument master");
                }
                token
            })
            .collect()
    }
}

impl std::fmt::Debug for KiteBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteBroker")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// Register a Kite adapter as both an EXEC backend and, in DIRECT feed mode,
/// the DATA broker.
pub fn register_direct(
    registry: &BrokerRegistry,
    user_broker_id: &str,
    broker: Arc<KiteBroker>,
) {
    registry.register(user_broker_id, broker.clone());
    registry.set_data_broker(broker);
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Checksum for the session-token exchange.
pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// The broker-native interval for a timeframe, plus the timeframe the rows
/// come back in. ITF/HTF are not native and aggregate from the 5-minute base.
fn native_interval(timeframe: Timeframe) -> (&'static str, Timeframe) {
    match timeframe {
        Timeframe::Ltf => ("minute", Timeframe::Ltf),
        Timeframe::Daily => ("day", Timeframe::Daily),
        Timeframe::Itf | Timeframe::Htf => ("5minute", Timeframe::Ltf),
    }
}

fn parse_order_json(o: &serde_json::Value) -> Result<BrokerOrderStatus> {
    Ok(BrokerOrderStatus {
        order_id: o["order_id"]
            .as_str()
            .context("order missing order_id")?
            .to_string(),
        status: o["status"].as_str().context("order missing status")?.to_string(),
        average_price: o["average_price"].as_f64().unwrap_or(0.0),
        filled_quantity: o["filled_quantity"].as_u64().unwrap_or(0) as u32,
        status_message: o["status_message"].as_str().map(str::to_string),
        exchange_order_id: o["exchange_order_id"].as_str().map(str::to_string),
    })
}

/// Parse the `[[ts, open, high, low, close, volume], ...]` rows of the
/// historical endpoint. Timestamps arrive as RFC-3339-with-offset strings.
fn parse_historical_rows(
    symbol: &str,
    timeframe: Timeframe,
    rows: &[serde_json::Value],
) -> Result<Vec<Candle>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row.as_array().context("candle row is not an array")?;
        if arr.len() < 6 {
            warn!(len = arr.len(), "skipping short historical candle row");
            continue;
        }

        let ts_str = arr[0].as_str().context("candle row missing timestamp")?;
        let ts = DateTime::parse_from_str(ts_str, "%Y-%m-%dT%H:%M:%S%z")
            .with_context(|| format!("unparseable candle timestamp '{ts_str}'"))?
            .timestamp_millis();

        out.push(Candle {
            symbol: symbol.to_string(),
            timeframe,
            ts,
            open: arr[1].as_f64().context("bad open")?,
            high: arr[2].as_f64().context("bad high")?,
            low: arr[3].as_f64().context("bad low")?,
            close: arr[4].as_f64().context("bad close")?,
            volume: arr[5].as_u64().unwrap_or(0),
        });
    }
    Ok(out)
}

/// Aggregate base candles onto the session-aligned grid of `target`. A
/// trailing bucket with fewer base rows than a full bucket holds is
/// discarded rather than published as a ragged candle.
fn aggregate_session_buckets(base: &[Candle], target: Timeframe) -> Vec<Candle> {
    if base.is_empty() {
        return Vec::new();
    }

    let base_minutes = infer_base_minutes(base);
    let per_bucket = (target.minutes() / base_minutes).max(1) as usize;

    let mut buckets: HashMap<i64, Vec<&Candle>> = HashMap::new();
    for c in base {
        buckets
            .entry(session::bucket_start_ms(c.ts, target.minutes()))
            .or_default()
            .push(c);
    }

    let mut starts: Vec<i64> = buckets.keys().copied().collect();
    starts.sort_unstable();

    let mut out = Vec::with_capacity(starts.len());
    let last_start = *starts.last().expect("non-empty buckets");

    for start in starts {
        let mut members = buckets.remove(&start).expect("bucket exists");
        members.sort_by_key(|c| c.ts);

        if start == last_start && members.len() < per_bucket {
            debug!(
                bucket = start,
                members = members.len(),
                per_bucket,
                "discarding trailing partial bucket"
            );
            continue;
        }

        let first = members.first().expect("non-empty bucket");
        let last = members.last().expect("non-empty bucket");
        out.push(Candle {
            symbol: first.symbol.clone(),
            timeframe: target,
            ts: start,
            open: first.open,
            high: members.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: members.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            close: last.close,
            volume: members.iter().map(|c| c.volume).sum(),
        });
    }

    out
}

/// The base series' bucket width, inferred from the smallest gap between
/// consecutive rows (the series may span session boundaries).
fn infer_base_minutes(base: &[Candle]) -> i64 {
    base.windows(2)
        .map(|w| (w[1].ts - w[0].ts) / 60_000)
        .filter(|&m| m > 0)
        .min()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use serde_json::json;

    #[test]
    fn checksum_is_hex_sha256() {
        let sum = session_checksum("key", "req", "secret");
        assert_eq!(sum.len(), 64);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic for fixed inputs.
        assert_eq!(sum, session_checksum("key", "req", "secret"));
        assert_ne!(sum, session_checksum("key", "other", "secret"));
    }

    #[test]
    fn order_json_parses_contract_fields() {
        let o = json!({
            "order_id": "250305000123456",
            "status": "COMPLETE",
            "average_price": 100.2,
            "filled_quantity": 10,
            "status_message": null,
            "exchange_order_id": "1100000000234"
        });
        let status = parse_order_json(&o).unwrap();
        assert_eq!(status.order_id, "250305000123456");
        assert_eq!(status.status, "COMPLETE");
        assert!((status.average_price - 100.2).abs() < f64::EPSILON);
        assert_eq!(status.filled_quantity, 10);
        assert_eq!(status.exchange_order_id.as_deref(), Some("1100000000234"));
    }

    #[test]
    fn historical_rows_parse_offset_timestamps() {
        let rows = vec![json!([
            "2024-03-05T10:05:00+0530",
            100.0,
            101.5,
            99.5,
            101.0,
            1200
        ])];
        let candles = parse_historical_rows("ACME", Timeframe::Ltf, &rows).unwrap();
        assert_eq!(candles.len(), 1);

        let expected = FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, 10, 5, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        assert_eq!(candles[0].ts, expected);
        assert_eq!(candles[0].volume, 1200);
    }

    fn ist_ms(h: u32, m: u32) -> i64 {
        FixedOffset::east_opt(5 * 3600 + 1800)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, h, m, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    fn base_candle(ts: i64, open: f64, close: f64, volume: u64) -> Candle {
        Candle {
            symbol: "ACME".into(),
            timeframe: Timeframe::Ltf,
            ts,
            open,
            high: open.max(close) + 1.0,
            low: open.min(close) - 1.0,
            close,
            volume,
        }
    }

    #[test]
    fn aggregation_discards_trailing_partial_bucket() {
        // 5-minute base rows: a full 09:15 ITF bucket (5 rows) and a
        // trailing 09:40 bucket with only 2 rows.
        let mut base = Vec::new();
        for i in 0..5 {
            base.push(base_candle(ist_ms(9, 15 + i * 5), 100.0 + i as f64, 101.0 + i as f64, 10));
        }
        base.push(base_candle(ist_ms(9, 40), 110.0, 111.0, 10));
        base.push(base_candle(ist_ms(9, 45), 111.0, 112.0, 10));

        let out = aggregate_session_buckets(&base, Timeframe::Itf);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ts, ist_ms(9, 15));
        assert_eq!(out[0].timeframe, Timeframe::Itf);
        assert!((out[0].open - 100.0).abs() < f64::EPSILON);
        assert!((out[0].close - 105.0).abs() < f64::EPSILON);
        assert_eq!(out[0].volume, 50);
    }

    #[test]
    fn aggregation_keeps_full_trailing_bucket() {
        let mut base = Vec::new();
        for bucket in 0..2 {
            for i in 0..5 {
                base.push(base_candle(
                    ist_ms(9, 15 + bucket * 25 + i * 5),
                    100.0,
                    101.0,
                    10,
                ));
            }
        }
        let out = aggregate_session_buckets(&base, Timeframe::Itf);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].ts, ist_ms(9, 40));
    }

    #[test]
    fn native_interval_mapping() {
        assert_eq!(native_interval(Timeframe::Ltf), ("minute", Timeframe::Ltf));
        assert_eq!(native_interval(Timeframe::Daily), ("day", Timeframe::Daily));
        assert_eq!(native_interval(Timeframe::Itf), ("5minute", Timeframe::Ltf));
        assert_eq!(native_interval(Timeframe::Htf), ("5minute", Timeframe::Ltf));
    }
}
