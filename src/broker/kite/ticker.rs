// =============================================================================
// Kite tick channel — authenticated WebSocket with reconnect state machine
// =============================================================================
//
// State machine: DISCONNECTED → CONNECTING → CONNECTED → RECONNECT_REQUIRED
// → CONNECTING → …, with DISCONNECTED reachable from anywhere via
// disconnect() or a non-retryable handshake failure (401/403/404, which
// waits for a token reload instead of hammering the broker).
//
// Reconnect policy: delay = min(2^min(failures, 6) · 1 s, 60 s) plus up to
// 500 ms of uniform jitter; ten consecutive failures trip a 5-minute
// circuit breaker.
//
// The write half lives behind an async mutex as an Option: a send with no
// socket logs and returns, a send that errors flips the state to
// RECONNECT_REQUIRED and wakes the run loop. The feed is considered stale
// once no tick has been observed for the configured window, which flips
// `is_stale` and with it the adapter's order-placement gate.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::instruments::InstrumentMap;
use crate::types::Tick;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Consecutive failures that trip the circuit breaker.
const CIRCUIT_BREAK_FAILURES: u32 = 10;
/// Circuit-breaker pause.
const CIRCUIT_BREAK_PAUSE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectRequired,
}

impl std::fmt::Display for WsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::ReconnectRequired => write!(f, "RECONNECT_REQUIRED"),
        }
    }
}

pub struct KiteTicker {
    ws_url: String,
    api_key: String,
    access_token: RwLock<String>,
    state: RwLock<WsState>,
    registered: RwLock<HashSet<u32>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    consecutive_failures: AtomicU32,
    last_tick_at: RwLock<Option<Instant>>,
    stale_after: Duration,
    ticks_received: AtomicU64,
    tick_tx: mpsc::UnboundedSender<Tick>,
    instruments: Arc<RwLock<InstrumentMap>>,
    /// Kicks the run loop out of whatever it is waiting on.
    wake: Notify,
    running: AtomicBool,
}

impl KiteTicker {
    pub fn new(
        ws_url: String,
        api_key: String,
        access_token: String,
        instruments: Arc<RwLock<InstrumentMap>>,
        tick_tx: mpsc::UnboundedSender<Tick>,
        stale_after: Duration,
    ) -> Self {
        Self {
            ws_url,
            api_key,
            access_token: RwLock::new(access_token),
            state: RwLock::new(WsState::Disconnected),
            registered: RwLock::new(HashSet::new()),
            sink: tokio::sync::Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            last_tick_at: RwLock::new(None),
            stale_after,
            ticks_received: AtomicU64::new(0),
            tick_tx,
            instruments,
            wake: Notify::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn state(&self) -> WsState {
        *self.state.read()
    }

    /// No tick observed within the stale window. A ticker that never
    /// connected reports stale.
    pub fn is_stale(&self) -> bool {
        match *self.last_tick_at.read() {
            Some(at) => at.elapsed() > self.stale_after,
            None => true,
        }
    }

    pub fn ticks_received(&self) -> u64 {
        self.ticks_received.load(Ordering::Relaxed)
    }

    /// Register tokens and subscribe on the live socket. The first
    /// subscription also wakes a DISCONNECTED run loop into CONNECTING.
    pub async fn subscribe(&self, tokens: &[u32]) {
        if tokens.is_empty() {
            return;
        }
        self.registered.write().extend(tokens.iter().copied());

        if self.state() == WsState::Connected {
            self.send_subscription(tokens).await;
        }
        self.wake.notify_waiters();
    }

    pub async fn unsubscribe(&self, tokens: &[u32]) {
        {
            let mut registered = self.registered.write();
            for t in tokens {
                registered.remove(t);
            }
        }
        if self.state() == WsState::Connected {
            let msg = json!({ "a": "unsubscribe", "v": tokens }).to_string();
            self.safe_send(Message::Text(msg)).await;
        }
    }

    /// Idempotent teardown: normal-close the socket, drop subscriptions,
    /// stop reconnecting.
    pub async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.registered.write().clear();

        let close = Message::Close(Some(CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Normal,
            reason: "client disconnect".into(),
        }));
        self.safe_send(close).await;
        *self.sink.lock().await = None;

        self.set_state(WsState::Disconnected);
        self.wake.notify_waiters();
    }

    /// Swap the access token, reset the failure counters and reconnect
    /// immediately with all registered tokens re-subscribed.
    pub async fn reload_token(&self, new_token: &str) {
        info!("ticker access token reloaded — forcing reconnect");
        *self.access_token.write() = new_token.to_string();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        // Drop the current socket; the run loop reconnects with the new token.
        *self.sink.lock().await = None;
        if self.state() == WsState::Connected {
            self.set_state(WsState::ReconnectRequired);
        }
        self.wake.notify_waiters();
    }

    /// The connection owner. Spawn exactly once.
    pub async fn run(self: Arc<Self>) {
        info!(url = %self.ws_url, "ticker run loop started");
        loop {
            if !self.running.load(Ordering::SeqCst) || self.registered.read().is_empty() {
                self.wake.notified().await;
                continue;
            }

            self.set_state(WsState::Connecting);
            let url = {
                let token = self.access_token.read();
                format!(
                    "{}?api_key={}&access_token={}",
                    self.ws_url, self.api_key, token
                )
            };

            match connect_async(&url).await {
                Ok((stream, _response)) => {
                    info!("tick WebSocket connected");
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.set_state(WsState::Connected);
                    // The open handshake counts as a feed observation until
                    // the first real tick lands.
                    *self.last_tick_at.write() = Some(Instant::now());

                    let (sink, mut read) = stream.split();
                    *self.sink.lock().await = Some(sink);

                    let registered: Vec<u32> = self.registered.read().iter().copied().collect();
                    self.send_subscription(&registered).await;

                    loop {
                        tokio::select! {
                            msg = read.next() => match msg {
                                Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                                Some(Ok(Message::Close(frame))) => {
                                    warn!(?frame, "tick WebSocket closed by peer");
                                    break;
                                }
                                // Ping/pong are answered by tungstenite.
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "tick WebSocket read error");
                                    break;
                                }
                                None => {
                                    warn!("tick WebSocket stream ended");
                                    break;
                                }
                            },
                            _ = self.wake.notified() => break,
                        }
                    }

                    *self.sink.lock().await = None;
                    if !self.running.load(Ordering::SeqCst) {
                        self.set_state(WsState::Disconnected);
                        continue;
                    }
                    self.set_state(WsState::ReconnectRequired);
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) if is_auth_handshake_error(&e) => {
                    error!(error = %e, "non-retryable handshake failure — waiting for token reload");
                    self.set_state(WsState::Disconnected);
                    self.wake.notified().await;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "tick WebSocket connect failed");
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                }
            }

            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            let delay = if failures >= CIRCUIT_BREAK_FAILURES {
                warn!(failures, "reconnect circuit breaker tripped — pausing");
                CIRCUIT_BREAK_PAUSE
            } else {
                backoff_delay(failures)
            };

            debug!(failures, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn send_subscription(&self, tokens: &[u32]) {
        if tokens.is_empty() {
            return;
        }
        let subscribe = json!({ "a": "subscribe", "v": tokens }).to_string();
        let mode = json!({ "a": "mode", "v": ["full", tokens] }).to_string();
        if self.safe_send(Message::Text(subscribe)).await {
            self.safe_send(Message::Text(mode)).await;
            debug!(count = tokens.len(), "tick subscriptions sent");
        }
    }

    /// Send through the shared sink. No socket → log and report false; a
    /// failed send flips to RECONNECT_REQUIRED and wakes the run loop.
    async fn safe_send(&self, msg: Message) -> bool {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            None => {
                debug!("no live socket — dropping outbound frame");
                false
            }
            Some(sink) => match sink.send(msg).await {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "WebSocket send failed — scheduling reconnect");
                    *guard = None;
                    self.set_state(WsState::ReconnectRequired);
                    self.wake.notify_waiters();
                    false
                }
            },
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        // Single-byte frames are the broker's heartbeat.
        if data.len() < 2 {
            return;
        }
        let received_at = Utc::now().timestamp_millis();
        let instruments = self.instruments.read();
        let ticks = parse_tick_frame(data, &instruments, received_at);
        drop(instruments);

        if ticks.is_empty() {
            return;
        }
        *self.last_tick_at.write() = Some(Instant::now());
        self.ticks_received
            .fetch_add(ticks.len() as u64, Ordering::Relaxed);
        for tick in ticks {
            if self.tick_tx.send(tick).is_err() {
                warn!("tick consumer dropped — discarding feed");
                return;
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) if v["type"] == "error" => {
                warn!(message = %v["data"], "tick channel error message");
            }
            Ok(_) => debug!("tick channel text message ignored"),
            Err(_) => warn!("unparseable text frame on tick channel"),
        }
    }

    fn set_state(&self, next: WsState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(from = %*state, to = %next, "ticker state transition");
            *state = next;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_last_tick(&self, at: Option<Instant>) {
        *self.last_tick_at.write() = at;
    }

    #[cfg(test)]
    pub(crate) fn registered_tokens(&self) -> Vec<u32> {
        self.registered.read().iter().copied().collect()
    }
}

impl std::fmt::Debug for KiteTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KiteTicker")
            .field("state", &self.state())
            .field("registered", &self.registered.read().len())
            .field("failures", &self.consecutive_failures.load(Ordering::SeqCst))
            .field("ticks_received", &self.ticks_received())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Policy helpers
// ---------------------------------------------------------------------------

/// min(2^min(failures, 6) seconds, 60 s) + uniform[0, 500 ms) jitter.
fn backoff_delay(failures: u32) -> Duration {
    let base = Duration::from_secs((1u64 << failures.min(6)).min(60));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    base + jitter
}

/// Handshake rejections that a retry cannot fix: bad or expired token
/// (401/403) and a wrong endpoint (404). Everything else — 429, 5xx,
/// timeouts, plain socket errors — stays retryable.
fn is_auth_handshake_error(e: &tungstenite::Error) -> bool {
    match e {
        tungstenite::Error::Http(response) => matches!(
            response.status().as_u16(),
            401 | 403 | 404
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Binary frame parsing
// ---------------------------------------------------------------------------
//
// Frame layout: [i16 packet count][i16 length, packet]×count. Packet bytes
// (big-endian): 0..4 instrument token, 4..8 last price in paise. Quote mode
// (44 bytes) adds 8..12 last traded quantity and 16..20 day volume; full
// mode (184 bytes) adds the exchange timestamp at 60..64 (epoch seconds).

/// Parse one binary frame into normalised ticks. Unknown tokens and short
/// packets are skipped.
pub(crate) fn parse_tick_frame(
    data: &[u8],
    instruments: &InstrumentMap,
    received_at: i64,
) -> Vec<Tick> {
    let Some(count) = read_u16(data, 0) else {
        return Vec::new();
    };

    let mut ticks = Vec::with_capacity(count as usize);
    let mut offset = 2usize;

    for _ in 0..count {
        let Some(len) = read_u16(data, offset) else {
            break;
        };
        let start = offset + 2;
        let end = start + len as usize;
        if end > data.len() {
            warn!(len, "truncated tick packet — dropping rest of frame");
            break;
        }
        let packet = &data[start..end];
        offset = end;

        if let Some(tick) = parse_tick_packet(packet, instruments, received_at) {
            ticks.push(tick);
        }
    }

    ticks
}

fn parse_tick_packet(packet: &[u8], instruments: &InstrumentMap, received_at: i64) -> Option<Tick> {
    if packet.len() < 8 {
        return None;
    }
    let token = read_u32(packet, 0)?;
    let Some(symbol) = instruments.symbol_for(token) else {
        debug!(token, "tick for unmapped instrument token");
        return None;
    };

    let last_price = read_i32(packet, 4)? as f64 / 100.0;

    // LTP-mode packets stop here.
    let volume = if packet.len() >= 44 {
        read_u32(packet, 8)? as u64
    } else {
        0
    };

    let exchange_ts = if packet.len() >= 64 {
        read_u32(packet, 60)? as i64
    } else {
        0
    };

    Some(Tick {
        symbol: symbol.to_string(),
        instrument_token: token,
        last_price,
        volume,
        exchange_ts,
        received_at,
    })
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    data.get(offset..offset + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Instrument;

    fn instrument_map() -> InstrumentMap {
        InstrumentMap::from_instruments(vec![Instrument {
            instrument_token: 738561,
            tradingsymbol: "RELIANCE".into(),
            exchange: "NSE".into(),
            instrument_type: "EQ".into(),
            tick_size: 0.05,
            lot_size: 1,
        }])
    }

    fn ltp_packet(token: u32, price_paise: i32) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&token.to_be_bytes());
        p.extend_from_slice(&price_paise.to_be_bytes());
        p
    }

    fn full_packet(token: u32, price_paise: i32, last_qty: u32, exchange_ts: u32) -> Vec<u8> {
        let mut p = vec![0u8; 184];
        p[0..4].copy_from_slice(&token.to_be_bytes());
        p[4..8].copy_from_slice(&price_paise.to_be_bytes());
        p[8..12].copy_from_slice(&last_qty.to_be_bytes());
        p[60..64].copy_from_slice(&exchange_ts.to_be_bytes());
        p
    }

    fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&(packets.len() as u16).to_be_bytes());
        for p in packets {
            f.extend_from_slice(&(p.len() as u16).to_be_bytes());
            f.extend_from_slice(p);
        }
        f
    }

    fn ticker() -> Arc<KiteTicker> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(KiteTicker::new(
            "wss://ws.example.test".into(),
            "key".into(),
            "token".into(),
            Arc::new(RwLock::new(instrument_map())),
            tx,
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn ltp_packet_parses_price_only() {
        let data = frame(&[ltp_packet(738561, 10_050)]);
        let ticks = parse_tick_frame(&data, &instrument_map(), 1_700_000_000_000);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "RELIANCE");
        assert!((ticks[0].last_price - 100.50).abs() < f64::EPSILON);
        assert_eq!(ticks[0].volume, 0);
        assert_eq!(ticks[0].exchange_ts, 0);
    }

    #[test]
    fn full_packet_carries_quantity_and_exchange_ts() {
        let data = frame(&[full_packet(738561, 25_025, 7, 1_709_610_930)]);
        let ticks = parse_tick_frame(&data, &instrument_map(), 1_700_000_000_000);
        assert_eq!(ticks.len(), 1);
        assert!((ticks[0].last_price - 250.25).abs() < f64::EPSILON);
        assert_eq!(ticks[0].volume, 7);
        assert_eq!(ticks[0].exchange_ts, 1_709_610_930);
    }

    #[test]
    fn unknown_tokens_are_skipped_others_survive() {
        let data = frame(&[ltp_packet(999, 100), ltp_packet(738561, 200)]);
        let ticks = parse_tick_frame(&data, &instrument_map(), 0);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument_token, 738561);
    }

    #[test]
    fn truncated_frame_does_not_panic() {
        let mut data = frame(&[full_packet(738561, 100, 1, 1)]);
        data.truncate(20);
        let ticks = parse_tick_frame(&data, &instrument_map(), 0);
        assert!(ticks.is_empty());
    }

    #[test]
    fn backoff_grows_then_caps() {
        for (failures, base_secs) in [(0u32, 1u64), (1, 2), (3, 8), (6, 60), (9, 60)] {
            let d = backoff_delay(failures);
            let base = Duration::from_secs(base_secs.min(60));
            assert!(d >= base, "failures={failures}: {d:?} < {base:?}");
            assert!(d < base + Duration::from_millis(500));
        }
    }

    #[test]
    fn auth_handshake_errors_are_non_retryable() {
        for status in [401u16, 403, 404] {
            let resp = tungstenite::http::Response::builder()
                .status(status)
                .body(None)
                .unwrap();
            assert!(is_auth_handshake_error(&tungstenite::Error::Http(resp)));
        }
        let retryable = tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        assert!(!is_auth_handshake_error(&tungstenite::Error::Http(retryable)));
        assert!(!is_auth_handshake_error(&tungstenite::Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn stale_clock_flips_after_window() {
        let ticker = ticker();
        assert!(ticker.is_stale());

        ticker.force_last_tick(Some(Instant::now()));
        assert!(!ticker.is_stale());

        ticker.force_last_tick(Some(Instant::now() - Duration::from_secs(301)));
        assert!(ticker.is_stale());
    }

    #[tokio::test]
    async fn subscribe_registers_tokens_while_disconnected() {
        let ticker = ticker();
        assert_eq!(ticker.state(), WsState::Disconnected);

        ticker.subscribe(&[738561]).await;
        assert_eq!(ticker.registered_tokens(), vec![738561]);
        // No socket: the send path must be a quiet no-op.
        ticker.unsubscribe(&[738561]).await;
        assert!(ticker.registered_tokens().is_empty());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let ticker = ticker();
        ticker.subscribe(&[738561]).await;
        ticker.disconnect().await;
        ticker.disconnect().await;
        assert_eq!(ticker.state(), WsState::Disconnected);
        assert!(ticker.registered_tokens().is_empty());
    }
}
