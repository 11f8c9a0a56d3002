//! WebSocket signaling channel
//!
//! A supervisor task owns the socket. It connects, forwards outbound frames,
//! fans decoded inbound messages out to subscribers in arrival order, and on
//! unexpected closure reconnects after a fixed delay until [`close`] is
//! called.
//!
//! [`close`]: SignalingChannel::close

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::SignalingMessage;
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound side of signaling as seen by the session controller
pub trait SignalingSink: Send + Sync {
    /// Queue a message; returns `false` if it was dropped
    fn send(&self, message: SignalingMessage) -> bool;
}

struct Shared {
    url: String,
    events: Arc<EventBus>,
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SignalingMessage>>>,
    throttler: LogThrottler,
}

impl Shared {
    fn dispatch(&self, message: SignalingMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        if subscribers.is_empty() {
            debug!("No signaling subscriber for {}", message.type_name());
        }
    }
}

/// Persistent connection to the signaling server
pub struct SignalingChannel {
    shared: Arc<Shared>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Start connecting to `url`; returns immediately
    pub fn connect(url: impl Into<String>, events: Arc<EventBus>, reconnect_delay: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            url: url.into(),
            events,
            open: AtomicBool::new(false),
            outbound: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            throttler: LogThrottler::with_secs(30),
        });
        let token = CancellationToken::new();

        let task = tokio::spawn(supervise(shared.clone(), token.clone(), reconnect_delay));

        Arc::new(Self {
            shared,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    /// Receive every decoded inbound message, in arrival order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SignalingMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Close the socket and stop reconnecting
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        info!("Closing signaling channel to {}", self.shared.url);
        self.token.cancel();
        self.shared.open.store(false, Ordering::SeqCst);
        self.shared.outbound.lock().take();
    }

    /// Close and wait for the supervisor task to finish
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl SignalingSink for SignalingChannel {
    fn send(&self, message: SignalingMessage) -> bool {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.type_name(), e);
                return false;
            }
        };

        let delivered = self
            .shared
            .outbound
            .lock()
            .as_ref()
            .map(|tx| tx.send(text).is_ok())
            .unwrap_or(false);

        if !delivered {
            warn!(
                "Signaling channel not open, dropping {} message",
                message.type_name()
            );
            self.shared.events.emit(SessionEvent::SignalingError {
                message: format!("channel not open, dropped {}", message.type_name()),
            });
        }
        delivered
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn supervise(shared: Arc<Shared>, token: CancellationToken, reconnect_delay: Duration) {
    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => break,
            result = connect_async(shared.url.as_str()) => result,
        };

        match connected {
            Ok((ws, _response)) => {
                shared.throttler.clear("connect");
                let reason = run_connection(&shared, &token, ws).await;
                shared.open.store(false, Ordering::SeqCst);
                shared.outbound.lock().take();

                info!(
                    "Signaling disconnected from {}: {}",
                    shared.url,
                    reason.as_deref().unwrap_or("closed")
                );
                shared.events.emit(SessionEvent::SignalingDisconnected {
                    url: shared.url.clone(),
                    reason,
                });
            }
            Err(e) => {
                warn_throttled!(
                    shared.throttler,
                    "connect",
                    "Signaling connect to {} failed: {}",
                    shared.url,
                    e
                );
                shared.events.emit(SessionEvent::SignalingError {
                    message: format!("connect failed: {}", e),
                });
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {
                debug!("Reconnecting signaling to {}", shared.url);
            }
        }
    }
    debug!("Signaling supervisor for {} stopped", shared.url);
}

/// Pump one socket until it closes; returns the close reason
async fn run_connection(shared: &Shared, token: &CancellationToken, ws: WsStream) -> Option<String> {
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    *shared.outbound.lock() = Some(out_tx);
    shared.open.store(true, Ordering::SeqCst);

    info!("Signaling connected to {}", shared.url);
    shared.events.emit(SessionEvent::SignalingConnected {
        url: shared.url.clone(),
    });

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return None;
            }
            Some(text) = out_rx.recv() => {
                trace!("Signaling out: {}", text);
                if let Err(e) = write.send(Message::Text(text)).await {
                    return Some(format!("write failed: {}", e));
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                    Ok(message) => {
                        trace!("Signaling in: {}", message.type_name());
                        shared.dispatch(message);
                    }
                    Err(e) => {
                        warn!("Undecodable signaling frame: {}", e);
                        shared.events.emit(SessionEvent::SignalingError {
                            message: format!("undecodable frame: {}", e),
                        });
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    return Some(
                        frame
                            .map(|f| format!("closed by server ({}): {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by server".to_string()),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("connection lost".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn wait_for(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>, kind: EventKind) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if event.kind() == kind {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_inbound_frames_dispatched_in_order() {
        let (listener, url) = listen().await;
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"type":"stream-started","stream_id":"a"}"#.into())).await.unwrap();
            ws.send(Message::Text("garbage".into())).await.unwrap();
            ws.send(Message::Text(r#"{"type":"stream-ended","stream_id":"a"}"#.into())).await.unwrap();
            // Echo one client frame back for the outbound check
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    return text;
                }
            }
            String::new()
        });

        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let channel = SignalingChannel::connect(url, events.clone(), Duration::from_millis(50));
        let mut rx = channel.subscribe();

        wait_for(&mut event_rx, EventKind::SignalingConnected).await;
        assert!(channel.is_open());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.type_name(), "stream-started");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.type_name(), "stream-ended");
        // The bad frame was reported, not fatal
        wait_for(&mut event_rx, EventKind::SignalingError).await;
        assert!(channel.is_open());

        assert!(channel.send(SignalingMessage::StopStreaming {
            stream_id: "a".to_string()
        }));
        let echoed = server.await.unwrap();
        assert!(echoed.contains("\"stop-streaming\""));

        channel.shutdown().await;
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_send_while_closed_is_dropped() {
        let (listener, url) = listen().await;
        drop(listener);

        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let channel = SignalingChannel::connect(url, events, Duration::from_secs(60));

        let sent = channel.send(SignalingMessage::StreamStarted {
            stream_id: "a".to_string(),
        });
        assert!(!sent);
        match wait_for(&mut event_rx, EventKind::SignalingError).await {
            SessionEvent::SignalingError { message } => assert!(!message.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
        channel.close();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let (listener, url) = listen().await;
        tokio::spawn(async move {
            for _ in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                ws.close(None).await.ok();
                while ws.next().await.is_some() {}
            }
        });

        let events = Arc::new(EventBus::new());
        let mut event_rx = events.subscribe();
        let channel = SignalingChannel::connect(url, events, Duration::from_millis(20));

        wait_for(&mut event_rx, EventKind::SignalingConnected).await;
        wait_for(&mut event_rx, EventKind::SignalingDisconnected).await;
        wait_for(&mut event_rx, EventKind::SignalingConnected).await;

        channel.shutdown().await;
    }
}
