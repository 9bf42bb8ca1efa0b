// =============================================================================
// Intent Intake — local ingress for approved trade intents
// =============================================================================
//
// The strategy layer runs out of process and hands approved intents to the
// core over a local TCP socket, one JSON envelope per line:
//
//   {"intent": { ... TradeIntent ... }, "signal": { ... Signal ... }}
//
// Each line is answered with one JSON response line carrying the placement
// outcome. A malformed line is answered and the connection stays up; the
// policy gates (TRADING_ENABLED, READ-ONLY, validation) are enforced
// downstream in EntryOrderExecution, never here.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::broker::OrderResult;
use crate::trade::entry::EntryOrderExecution;
use crate::trade::{Signal, TradeIntent};

/// One intake request: the approved intent plus the signal it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentEnvelope {
    pub intent: TradeIntent,
    pub signal: Signal,
}

/// One intake response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
}

impl IntakeResponse {
    fn from_result(intent_id: String, result: OrderResult) -> Self {
        Self {
            intent_id: Some(intent_id),
            accepted: result.success,
            order_id: result.order_id,
            error_code: result.error_code,
            message: result.message,
        }
    }

    fn rejected(intent_id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            intent_id,
            accepted: false,
            order_id: None,
            error_code: Some(code.to_string()),
            message: message.into(),
        }
    }
}

pub struct IntentIntake {
    exec: Arc<EntryOrderExecution>,
    bind_addr: String,
}

impl IntentIntake {
    pub fn new(exec: Arc<EntryOrderExecution>, bind_addr: String) -> Self {
        Self { exec, bind_addr }
    }

    /// Bind and serve forever. Spawn once at startup.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("failed to bind intent intake on {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "intent intake listening");
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "intent intake connection");
                    let intake = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = intake.serve_connection(stream).await {
                            warn!(%peer, error = %e, "intake connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "intent intake accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            let mut out = serde_json::to_string(&response).context("response encode failed")?;
            out.push('\n');
            write_half.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> IntakeResponse {
        let envelope: IntentEnvelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "unparseable intent envelope");
                return IntakeResponse::rejected(None, "MALFORMED_INTENT", e.to_string());
            }
        };

        let intent_id = envelope.intent.intent_id.clone();
        info!(
            intent_id = %intent_id,
            symbol = %envelope.intent.symbol,
            "intent received on intake"
        );

        match self.exec.submit(envelope.intent, envelope.signal).await {
            Ok(result) => IntakeResponse::from_result(intent_id, result),
            Err(_) => IntakeResponse::rejected(
                Some(intent_id),
                "DROPPED",
                "placement job dropped before completion",
            ),
        }
    }
}

impl std::fmt::Debug for IntentIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentIntake")
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}
