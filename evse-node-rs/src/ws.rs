//! OCPP-J WebSocket link
//!
//! The charge point core is synchronous and lives on the main task. This
//! module runs the socket on a separate tokio task and bridges it through a
//! pair of bounded channels. [`ChannelTransport`] is the core-facing end.
//!
//! - WebSocket connection with the `ocpp1.6` subprotocol
//! - Automatic reconnection with exponential backoff and jitter
//! - CALLs with unknown actions answered with NotImplemented on the socket

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use evse_core::ocpp::OcppMessage;
use evse_core::Transport;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

/// OCPP 1.6 JSON WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Frames buffered in each direction
const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Invalid central system URL {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Charge point dropped its transport")]
    Shutdown,
}

/// Connection settings for the link task
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Central system WebSocket URL, without the station identity
    pub csms_url: String,
    /// Charge point identity (appended to the URL path)
    pub station_id: String,
    /// Reconnect delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8180/steve/websocket/CentralSystemService".to_string(),
            station_id: "EK3-001".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

/// Core-facing end of the link
pub struct ChannelTransport {
    outgoing: mpsc::Sender<OcppMessage>,
    incoming: mpsc::Receiver<OcppMessage>,
    connected: Arc<AtomicBool>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, msg: &OcppMessage) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return false;
        }
        match self.outgoing.try_send(msg.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!("Link: Outgoing queue refused {}: {}", msg.message_id(), e);
                false
            }
        }
    }

    fn poll_incoming(&mut self) -> Option<OcppMessage> {
        self.incoming.try_recv().ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Socket-facing end of the link, owned by the link task
struct Link {
    config: LinkConfig,
    outgoing: mpsc::Receiver<OcppMessage>,
    incoming: mpsc::Sender<OcppMessage>,
    connected: Arc<AtomicBool>,
}

/// Start the link task and return the transport for the charge point
pub fn spawn(config: LinkConfig) -> ChannelTransport {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_DEPTH);
    let connected = Arc::new(AtomicBool::new(false));

    let link = Link {
        config,
        outgoing: outgoing_rx,
        incoming: incoming_tx,
        connected: connected.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = link.run().await {
            info!("Link: Stopped: {}", e);
        }
    });

    ChannelTransport {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
        connected,
    }
}

impl Link {
    /// Connect, serve until the socket drops, back off and repeat
    async fn run(mut self) -> Result<(), LinkError> {
        let url = build_ocpp_url(&self.config.csms_url, &self.config.station_id);
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Link: Connecting to {}", url);

            match self.connect_and_run(&url).await {
                Ok(()) => {
                    info!("Link: Connection closed");
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(LinkError::Shutdown) => return Err(LinkError::Shutdown),
                Err(e) => error!("Link: Connection error: {}", e),
            }
            self.connected.store(false, Ordering::Release);

            let delay = with_jitter(reconnect_delay);
            info!("Link: Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    async fn connect_and_run(&mut self, url: &str) -> Result<(), LinkError> {
        let mut request = url
            .into_client_request()
            .map_err(|_| LinkError::InvalidUrl(url.to_string()))?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false).await?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "Link: Central system did not accept {}, got {:?}",
                OCPP_SUBPROTOCOL, accepted_protocol
            );
        }

        // Frames queued for the previous connection are re-sent by the engine
        let mut stale = 0;
        while self.outgoing.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Link: Dropped {} stale frames", stale);
        }

        info!("Link: Connected to {}", url);
        self.connected.store(true, Ordering::Release);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Link: Received {}", text);
                        match OcppMessage::parse(text.as_bytes()) {
                            Ok(msg) => {
                                if self.incoming.send(msg).await.is_err() {
                                    return Err(LinkError::Shutdown);
                                }
                            }
                            Err(e) => match e.error_reply() {
                                Some(reply) => {
                                    warn!("Link: {}", e);
                                    let frame = OcppMessage::CallError(reply).to_bytes();
                                    if let Ok(bytes) = frame {
                                        let text = String::from_utf8_lossy(&bytes).into_owned();
                                        ws_tx.send(Message::Text(text.into())).await?;
                                    }
                                }
                                None => warn!("Link: Dropping malformed frame: {}", e),
                            },
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Link: Closed by central system");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },

                frame = self.outgoing.recv() => {
                    let Some(msg) = frame else {
                        let _ = ws_tx.close().await;
                        return Err(LinkError::Shutdown);
                    };
                    let bytes = match msg.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            error!("Link: Failed to serialize {}: {}", msg.message_id(), e);
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    debug!("Link: Sending {}", text);
                    ws_tx.send(Message::Text(text.into())).await?;
                }
            }
        }
    }
}

/// Spread reconnects of a fleet over up to a quarter of the delay
fn with_jitter(delay: Duration) -> Duration {
    let max_ms = (delay.as_millis() / 4) as u64;
    if max_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evse_core::ocpp::{Action, Call};

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", "EK3-001");
        assert_eq!(url, "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001");

        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", "EK3-001");
        assert_eq!(url, "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001");
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(8);
        for _ in 0..50 {
            let delay = with_jitter(base);
            assert!(delay >= base && delay <= Duration::from_secs(10));
        }
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_channel_transport_refuses_while_down() {
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(1);
        let (_incoming_tx, incoming_rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));
        let mut transport = ChannelTransport {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            connected: connected.clone(),
        };

        let msg = OcppMessage::Call(Call::new(Action::Heartbeat, serde_json::json!({})).unwrap());
        assert!(!transport.send(&msg));

        connected.store(true, Ordering::Release);
        assert!(transport.send(&msg));
        // Queue depth 1
        assert!(!transport.send(&msg));
        assert!(outgoing_rx.try_recv().is_ok());
        assert!(transport.poll_incoming().is_none());
    }
}
