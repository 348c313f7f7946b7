// =============================================================================
// Venue WebSocket Client — reconnect, resubscribe, heartbeat watchdog
// =============================================================================
//
// One client per configured venue. The client remembers every subscription so
// it can re-issue them after a reconnect, backs off exponentially
// (`reconnect_delay * 2^(attempts-1)`) up to `max_reconnect_attempts`, and
// force-terminates a connection that has been silent for two heartbeat
// intervals.
//
// All outbound events flow through one mpsc channel into the aggregator.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::parsers::{parser_for, WireParser};
use super::MarketEvent;
use crate::config::VenueConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::Pair;

/// Public data channels a venue exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ticker,
    Orderbook,
    Trades,
}

/// Connection state of one venue client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VenueStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by a venue client.
#[derive(Debug, Clone)]
pub enum VenueEvent {
    Connected {
        exchange: String,
    },
    Disconnected {
        exchange: String,
        code: Option<u16>,
        reason: String,
    },
    Error {
        exchange: String,
        message: String,
        terminal: bool,
    },
    Data(MarketEvent),
}

pub struct VenueClient {
    exchange: String,
    config: VenueConfig,
    parser: Arc<dyn WireParser>,
    subscriptions: Mutex<HashSet<(Channel, Pair)>>,
    status: RwLock<VenueStatus>,
    events_tx: mpsc::UnboundedSender<VenueEvent>,
    /// Live frame channel into the current connection, when connected.
    frames_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: AtomicBool,
}

impl VenueClient {
    pub fn new(
        exchange: &str,
        config: VenueConfig,
        events_tx: mpsc::UnboundedSender<VenueEvent>,
    ) -> CoreResult<Arc<Self>> {
        let parser = parser_for(exchange).ok_or_else(|| {
            CoreError::validation(format!("no wire parser for venue: {exchange}"))
        })?;
        Ok(Arc::new(Self {
            exchange: exchange.to_lowercase(),
            config,
            parser,
            subscriptions: Mutex::new(HashSet::new()),
            status: RwLock::new(VenueStatus::Disconnected),
            events_tx,
            frames_tx: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn status(&self) -> VenueStatus {
        *self.status.read()
    }

    /// Remember a subscription and, when connected, send it immediately.
    pub fn subscribe(&self, channel: Channel, pair: &Pair) {
        let fresh = self
            .subscriptions
            .lock()
            .insert((channel, pair.clone()));
        if fresh {
            debug!(exchange = %self.exchange, ?channel, pair = %pair, "subscription added");
            self.send_frame(self.parser.subscribe_frame(channel, pair));
        }
    }

    /// Forget a subscription and, when connected, send the unsubscribe frame.
    pub fn unsubscribe(&self, channel: Channel, pair: &Pair) {
        let removed = self
            .subscriptions
            .lock()
            .remove(&(channel, pair.clone()));
        if removed {
            self.send_frame(self.parser.unsubscribe_frame(channel, pair));
        }
    }

    /// Stop the run loop at the next opportunity.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn send_frame(&self, frame: String) {
        if let Some(tx) = self.frames_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn emit(&self, event: VenueEvent) {
        let _ = self.events_tx.send(event);
    }

    // -------------------------------------------------------------------------
    // Connection loop
    // -------------------------------------------------------------------------

    /// Run until `disconnect` is called or reconnect attempts are exhausted.
    pub async fn run(self: Arc<Self>) {
        let mut attempts: u32 = 0;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            *self.status.write() = VenueStatus::Connecting;
            let url = self.parser.ws_url();
            info!(exchange = %self.exchange, url = %url, attempts, "connecting venue WebSocket");

            match connect_async(&url).await {
                Ok((ws, _response)) => {
                    attempts = 0;
                    *self.status.write() = VenueStatus::Connected;
                    self.emit(VenueEvent::Connected {
                        exchange: self.exchange.clone(),
                    });

                    let reason = self.drive_connection(ws).await;

                    *self.status.write() = VenueStatus::Disconnected;
                    *self.frames_tx.lock() = None;
                    self.emit(VenueEvent::Disconnected {
                        exchange: self.exchange.clone(),
                        code: None,
                        reason,
                    });
                }
                Err(e) => {
                    warn!(exchange = %self.exchange, error = %e, "venue connect failed");
                    self.emit(VenueEvent::Error {
                        exchange: self.exchange.clone(),
                        message: e.to_string(),
                        terminal: false,
                    });
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                error!(
                    exchange = %self.exchange,
                    attempts,
                    "reconnect attempts exhausted — giving up"
                );
                self.emit(VenueEvent::Error {
                    exchange: self.exchange.clone(),
                    message: "reconnect attempts exhausted".to_string(),
                    terminal: true,
                });
                break;
            }

            let delay = backoff_delay(attempts, self.config.reconnect_delay_ms);
            info!(exchange = %self.exchange, attempts, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }

        *self.status.write() = VenueStatus::Disconnected;
        info!(exchange = %self.exchange, "venue client stopped");
    }

    /// Drive one live connection until it drops. Returns the drop reason.
    async fn drive_connection(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> String {
        let (mut write, mut read) = ws.split();

        // Re-issue every remembered subscription.
        let frames: Vec<String> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .map(|(channel, pair)| self.parser.subscribe_frame(*channel, pair))
                .collect()
        };
        for frame in frames {
            if let Err(e) = write.send(Message::Text(frame)).await {
                return format!("resubscribe failed: {e}");
            }
        }

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
        *self.frames_tx.lock() = Some(frames_tx);

        // Silent for two heartbeat intervals => assume a dead peer.
        let watchdog = Duration::from_millis(self.config.heartbeat_ms * 2);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                let _ = write.send(Message::Close(None)).await;
                return "shutdown".to_string();
            }

            tokio::select! {
                frame = frames_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                return format!("frame send failed: {e}");
                            }
                        }
                        None => return "frame channel closed".to_string(),
                    }
                }
                msg = tokio::time::timeout(watchdog, read.next()) => {
                    match msg {
                        Err(_) => {
                            warn!(exchange = %self.exchange, "heartbeat watchdog fired — terminating socket");
                            return "heartbeat timeout".to_string();
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            for event in self.parser.parse(&text) {
                                self.emit(VenueEvent::Data(event));
                            }
                        }
                        // tungstenite answers pings automatically; other
                        // control frames carry no data for us.
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "server close".to_string());
                            return reason;
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return format!("read error: {e}");
                        }
                        Ok(None) => {
                            return "stream ended".to_string();
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for VenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueClient")
            .field("exchange", &self.exchange)
            .field("status", &self.status())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

/// Exponential backoff: `base * 2^(attempts-1)`.
fn backoff_delay(attempts: u32, base_ms: u64) -> Duration {
    let factor = 1u64 << attempts.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1, 1000), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, 1000), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, 1000), Duration::from_millis(4000));
        assert_eq!(backoff_delay(5, 1000), Duration::from_millis(16000));
    }

    #[test]
    fn backoff_is_capped_against_overflow() {
        // Absurd attempt counts must not overflow the shift.
        let d = backoff_delay(200, 1000);
        assert_eq!(d, Duration::from_millis(1000 * (1 << 16)));
    }

    #[test]
    fn subscriptions_are_remembered_for_resubscribe() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = VenueClient::new("binance", VenueConfig::default(), tx).unwrap();

        let pair = Pair::new("BTC", "USDT");
        client.subscribe(Channel::Ticker, &pair);
        client.subscribe(Channel::Trades, &pair);
        // Duplicate subscribes collapse.
        client.subscribe(Channel::Ticker, &pair);
        assert_eq!(client.subscriptions.lock().len(), 2);

        client.unsubscribe(Channel::Trades, &pair);
        assert_eq!(client.subscriptions.lock().len(), 1);
    }

    #[test]
    fn unknown_venue_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = VenueClient::new("mt-gox", VenueConfig::default(), tx).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn client_starts_disconnected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = VenueClient::new("kraken", VenueConfig::default(), tx).unwrap();
        assert_eq!(client.status(), VenueStatus::Disconnected);
    }
}
