// =============================================================================
// Relay broker backend — read-only JSON tick relay
// =============================================================================
//
// In RELAY feed mode the engine consumes ticks re-broadcast by another
// process instead of holding its own broker feed. The relay carries no
// order entry whatsoever: every order-path operation refuses with
// READ_ONLY, and `can_place_orders` is constantly false.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerAdapter, BrokerCredentials, BrokerFunds, BrokerHolding, BrokerOrderStatus,
    BrokerPosition, BrokerRole, ConnectionResult, Instrument, OrderModify, OrderRequest,
    OrderResult, ERR_READ_ONLY,
};
use crate::types::{Candle, Tick, Timeframe};

/// Pause between reconnect attempts to the relay.
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

pub struct RelayBroker {
    name: String,
    url: String,
    connected: AtomicBool,
    running: AtomicBool,
    subscribed: RwLock<HashSet<String>>,
    last_tick_at: RwLock<Option<Instant>>,
    stale_after: Duration,
    tick_tx: mpsc::UnboundedSender<Tick>,
}

impl RelayBroker {
    pub fn new(url: impl Into<String>, tick_tx: mpsc::UnboundedSender<Tick>, stale_after: Duration) -> Self {
        Self {
            name: "relay".into(),
            url: url.into(),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(true),
            subscribed: RwLock::new(HashSet::new()),
            last_tick_at: RwLock::new(None),
            stale_after,
            tick_tx,
        }
    }

    /// Spawn the relay reader. Reconnects forever with a flat pause; the
    /// relay is a local service, not a rate-limited broker endpoint.
    pub fn start(self: &Arc<Self>) {
        let relay = self.clone();
        tokio::spawn(async move {
            loop {
                if !relay.running.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = relay.run_once().await {
                    error!(error = %e, "relay stream error — reconnecting in 5s");
                }
                relay.connected.store(false, Ordering::SeqCst);
                tokio::time::sleep(RECONNECT_PAUSE).await;
            }
        });
    }

    async fn run_once(&self) -> Result<()> {
        info!(url = %self.url, "connecting to relay WebSocket");
        let (ws_stream, _response) = connect_async(&self.url).await?;
        info!("relay WebSocket connected");
        self.connected.store(true, Ordering::SeqCst);
        *self.last_tick_at.write() = Some(Instant::now());

        let (mut write, mut read) = ws_stream.split();

        // Replay the symbol set so the relay resumes our feed.
        let symbols: Vec<String> = self.subscribed.read().iter().cloned().collect();
        if !symbols.is_empty() {
            let msg = json!({ "action": "subscribe", "symbols": symbols }).to_string();
            write.send(Message::Text(msg)).await?;
        }

        while let Some(msg) = read.next().await {
            match msg? {
                Message::Text(text) => match parse_relay_tick(&text) {
                    Some(tick) => {
                        *self.last_tick_at.write() = Some(Instant::now());
                        if self.tick_tx.send(tick).is_err() {
                            warn!("tick consumer dropped — stopping relay reader");
                            return Ok(());
                        }
                    }
                    None => debug!("non-tick relay message ignored"),
                },
                Message::Close(frame) => {
                    warn!(?frame, "relay WebSocket closed by peer");
                    return Ok(());
                }
                _ => {}
            }
        }

        warn!("relay WebSocket stream ended");
        Ok(())
    }

    fn read_only(&self, op: &str) -> OrderResult {
        warn!(op, "order operation refused — relay broker is read-only");
        OrderResult::failed(ERR_READ_ONLY, "relay broker is read-only")
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        *self.last_tick_at.write() = connected.then(Instant::now);
    }
}

#[async_trait]
impl BrokerAdapter for RelayBroker {
    fn broker_name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> BrokerRole {
        BrokerRole::Data
    }

    async fn connect(&self, _credentials: &BrokerCredentials) -> ConnectionResult {
        // The relay needs no auth; the reader task owns the socket.
        self.running.store(true, Ordering::SeqCst);
        ConnectionResult::ok("relay")
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.subscribed.write().clear();
    }

    fn is_connected(&self) -> bool {
        let fresh = match *self.last_tick_at.read() {
            Some(at) => at.elapsed() <= self.stale_after,
            None => false,
        };
        self.connected.load(Ordering::SeqCst) && fresh
    }

    /// A relay can never place orders, stale or not.
    fn can_place_orders(&self) -> bool {
        false
    }

    async fn place_order(&self, _req: &OrderRequest) -> OrderResult {
        self.read_only("place_order")
    }

    async fn modify_order(&self, _order_id: &str, _changes: &OrderModify) -> OrderResult {
        self.read_only("modify_order")
    }

    async fn cancel_order(&self, _order_id: &str) -> OrderResult {
        self.read_only("cancel_order")
    }

    async fn get_order_status(&self, _order_id: &str) -> Result<BrokerOrderStatus> {
        bail!("relay broker has no order lifecycle")
    }

    async fn get_open_orders(&self) -> Result<Vec<BrokerOrderStatus>> {
        bail!("relay broker has no order lifecycle")
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        bail!("relay broker has no account access")
    }

    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>> {
        bail!("relay broker has no account access")
    }

    async fn get_funds(&self) -> Result<BrokerFunds> {
        bail!("relay broker has no account access")
    }

    async fn get_ltp(&self, _symbol: &str) -> Result<f64> {
        bail!("relay broker has no quote API")
    }

    async fn get_historical_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        bail!("relay broker has no historical API")
    }

    async fn subscribe_ticks(&self, symbols: &[String]) -> Result<()> {
        self.subscribed.write().extend(symbols.iter().cloned());
        // The live socket (if any) picks the change up on next reconnect;
        // an immediate re-send happens in run_once.
        Ok(())
    }

    async fn unsubscribe_ticks(&self, symbols: &[String]) -> Result<()> {
        let mut subscribed = self.subscribed.write();
        for s in symbols {
            subscribed.remove(s);
        }
        Ok(())
    }

    async fn get_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(Vec::new())
    }

    async fn reload_token(&self, _new_token: &str, _session_id: &str) -> Result<()> {
        debug!("relay broker has no token to reload");
        Ok(())
    }
}

impl std::fmt::Debug for RelayBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBroker")
            .field("url", &self.url)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("subscribed", &self.subscribed.read().len())
            .finish()
    }
}

/// Relay tick frames are flat JSON:
/// `{"symbol": "ACME", "lastPrice": 100.5, "volume": 3, "exchangeTimestamp": 1709610930}`
fn parse_relay_tick(text: &str) -> Option<Tick> {
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    let symbol = v["symbol"].as_str()?.to_string();
    let last_price = v["lastPrice"].as_f64().or_else(|| v["last_price"].as_f64())?;
    let volume = v["volume"].as_u64().unwrap_or(0);
    let exchange_ts = v["exchangeTimestamp"]
        .as_i64()
        .or_else(|| v["exchange_ts"].as_i64())
        .unwrap_or(0);

    Some(Tick {
        symbol,
        instrument_token: v["instrumentToken"].as_u64().unwrap_or(0) as u32,
        last_price,
        volume,
        exchange_ts,
        received_at: Utc::now().timestamp_millis(),
    })
}
