//! Realtime Channel Manager - low-latency server channel with reconnect
//!
//! Connection lifecycle:
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^             | closed / error
//!                    |             v
//!                    +------ Reconnecting (after backoff)
//!
//! attempts >= max_attempts  =>  Failed (until reset)
//! ```
//!
//! On every successful connect a full-state `sync` is sent and the
//! heartbeat starts. Incoming `sync` and `update` messages are applied to
//! the store with the same last-writer-wins rule as the inter-context
//! transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use concord_core::{
    now_millis, ChangeSource, ConcordError, ConcordResult, ConnectionState, RealtimeMessage,
    SectionKey, SectionState, StateEvent,
};
use concord_state::{Commit, StateStore, SubscriberRegistry, SubscriptionToken};
use concord_wire::{
    decode_message, encode_message, heartbeat_message, parse_sync_data, parse_update_data,
    sync_message, update_message, MSG_SYNC, MSG_UPDATE,
};

use crate::RealtimeConfig;

/// Reconnect delay before attempt `attempt` (1-based): `base * 2^(attempt-1)`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor)
}

// ----------------------------------------------------------------------------
// State machine
// ----------------------------------------------------------------------------

/// Pure connection state machine (no I/O, no timers)
#[derive(Clone, Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ConnectionMachine {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        ConnectionMachine {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connect
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Begin a connect attempt; refused once failed
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Failed => false,
            _ => {
                self.state = ConnectionState::Connecting;
                true
            }
        }
    }

    pub fn connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// Connect failed or the link closed.
    ///
    /// Returns the delay before the next attempt, or `None` when the cap is
    /// reached and the machine is now failed.
    pub fn connection_lost(&mut self) -> Option<Duration> {
        if self.state == ConnectionState::Failed {
            return None;
        }
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            self.state = ConnectionState::Failed;
            None
        } else {
            self.state = ConnectionState::Reconnecting;
            Some(backoff_delay(self.base_delay, self.attempts))
        }
    }

    /// Leave the failed state; returns whether it was failed
    pub fn reset(&mut self) -> bool {
        let was_failed = self.state == ConnectionState::Failed;
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        was_failed
    }

    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// An open realtime link
///
/// Dropping `outgoing` closes the link. `incoming` yielding `None` or an
/// error means the link is gone.
pub struct RealtimeLink {
    pub outgoing: mpsc::Sender<RealtimeMessage>,
    pub incoming: mpsc::Receiver<ConcordResult<RealtimeMessage>>,
}

/// Far end of an in-memory link
pub struct LinkPeer {
    /// Messages to deliver to the channel
    pub to_channel: mpsc::Sender<ConcordResult<RealtimeMessage>>,
    /// Messages the channel sent
    pub from_channel: mpsc::Receiver<RealtimeMessage>,
}

impl RealtimeLink {
    /// In-memory link and its far end
    pub fn pair(buffer: usize) -> (RealtimeLink, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            RealtimeLink {
                outgoing: out_tx,
                incoming: in_rx,
            },
            LinkPeer {
                to_channel: in_tx,
                from_channel: out_rx,
            },
        )
    }
}

/// Opens realtime links
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> ConcordResult<RealtimeLink>;
}

/// WebSocket connector (JSON text frames)
pub struct WsConnector {
    url: String,
    buffer: usize,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, buffer: usize) -> Self {
        WsConnector {
            url: url.into(),
            buffer,
        }
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self) -> ConcordResult<RealtimeLink> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConcordError::Connection(format!("{}: {}", self.url, e)))?;
        let (mut sink, mut stream) = ws.split();
        let (link, peer) = RealtimeLink::pair(self.buffer);
        let LinkPeer {
            to_channel,
            mut from_channel,
        } = peer;

        tokio::spawn(async move {
            while let Some(message) = from_channel.recv().await {
                let frame = match encode_message(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unencodable realtime message");
                        continue;
                    }
                };
                if sink.send(Message::text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let item = match frame {
                    Ok(Message::Text(text)) => match decode_message(text.as_str()) {
                        Ok(message) => Ok(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed realtime frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => Err(ConcordError::Connection(e.to_string())),
                };
                let fatal = item.is_err();
                if to_channel.send(item).await.is_err() || fatal {
                    break;
                }
            }
        });

        Ok(link)
    }
}

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

enum LinkExit {
    Cancelled,
    Lost(ConcordError),
}

/// Realtime channel driver and message fan-out
pub struct RealtimeChannel {
    config: RealtimeConfig,
    store: Arc<StateStore>,
    connector: Arc<dyn RealtimeConnector>,
    machine: Mutex<ConnectionMachine>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: RwLock<HashMap<String, Arc<SubscriberRegistry<RealtimeMessage>>>>,
    outbound_tx: mpsc::Sender<RealtimeMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<RealtimeMessage>>>,
    reset_signal: Notify,
    cancel: CancellationToken,
}

impl RealtimeChannel {
    pub fn new(
        config: RealtimeConfig,
        store: Arc<StateStore>,
        connector: Arc<dyn RealtimeConnector>,
        cancel: CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        RealtimeChannel {
            machine: Mutex::new(ConnectionMachine::new(config.base_delay, config.max_attempts)),
            config,
            store,
            connector,
            state_tx,
            listeners: RwLock::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            reset_signal: Notify::new(),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Listen for one message type
    pub fn on<F>(&self, kind: impl Into<String>, listener: F) -> SubscriptionToken
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        let registry = Arc::clone(self.listeners.write().entry(kind.into()).or_default());
        registry.subscribe(listener)
    }

    pub fn off(&self, kind: &str, token: SubscriptionToken) -> bool {
        let registry = self.listeners.read().get(kind).cloned();
        registry.is_some_and(|r| r.unsubscribe(token))
    }

    /// Queue a message; only allowed while connected
    pub fn send(&self, kind: impl Into<String>, data: Value) -> ConcordResult<()> {
        if !self.state().is_connected() {
            return Err(ConcordError::Connection("realtime channel not connected".into()));
        }
        let message = RealtimeMessage::new(kind, data, now_millis())
            .with_origin(self.store.context().as_str());
        self.outbound_tx
            .try_send(message)
            .map_err(|e| ConcordError::Connection(format!("outbound queue: {}", e)))
    }

    /// Forward a local commit as an `update` when connected
    ///
    /// While disconnected the commit is skipped; the full sync sent on the
    /// next connect carries it.
    pub fn publish_commit(&self, commit: &Commit) {
        if !self.state().is_connected() {
            return;
        }
        let message = update_message(commit.section, &commit.state(), now_millis())
            .with_origin(self.store.context().as_str());
        if let Err(e) = self.outbound_tx.try_send(message) {
            tracing::debug!(section = %commit.section, error = %e, "realtime update not queued");
        }
    }

    /// Leave the failed state and start connecting again
    pub fn reset(&self) -> bool {
        let was_failed = self.machine.lock().reset();
        if was_failed {
            self.set_state(ConnectionState::Disconnected);
            self.reset_signal.notify_one();
        }
        was_failed
    }

    /// Stop the driver; pending backoff timers and connects are abandoned
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Spawn the connection driver; `None` if it was already started
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let outbound = self.outbound_rx.lock().take()?;
        let channel = Arc::clone(self);
        Some(tokio::spawn(async move { channel.drive(outbound).await }))
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "realtime state changed");
            self.store
                .subscribers()
                .notify(&StateEvent::ConnectionChanged(state));
        }
    }

    async fn drive(&self, mut outbound: mpsc::Receiver<RealtimeMessage>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let may_connect = self.machine.lock().begin_connect();
            if !may_connect {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.reset_signal.notified() => continue,
                }
            }
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let lost = match connected {
                Ok(link) => {
                    self.machine.lock().connected();
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("realtime channel connected");
                    match self.run_link(link, &mut outbound).await {
                        LinkExit::Cancelled => break,
                        LinkExit::Lost(e) => e,
                    }
                }
                Err(e) => e,
            };

            let next = self.machine.lock().connection_lost();
            match next {
                Some(delay) => {
                    let attempt = self.machine.lock().attempts();
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %lost,
                        "realtime connection lost; reconnecting"
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let failed = ConcordError::ChannelFailed {
                        attempts: self.config.max_attempts,
                    };
                    tracing::warn!(
                        error = %failed,
                        last_error = %lost,
                        "realtime channel failed; waiting for reset"
                    );
                    self.set_state(ConnectionState::Failed);
                }
            }
        }

        self.machine.lock().disconnect();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_link(
        &self,
        mut link: RealtimeLink,
        outbound: &mut mpsc::Receiver<RealtimeMessage>,
    ) -> LinkExit {
        let origin = self.store.context().as_str().to_string();
        let full_sync = sync_message(&self.store.snapshot(), now_millis()).with_origin(&origin);
        if link.outgoing.send(full_sync).await.is_err() {
            return LinkExit::Lost(ConcordError::ChannelClosed);
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkExit::Cancelled,
                _ = heartbeat.tick() => {
                    let beat = heartbeat_message(now_millis()).with_origin(&origin);
                    if link.outgoing.send(beat).await.is_err() {
                        return LinkExit::Lost(ConcordError::ChannelClosed);
                    }
                }
                Some(message) = outbound.recv() => {
                    if link.outgoing.send(message).await.is_err() {
                        return LinkExit::Lost(ConcordError::ChannelClosed);
                    }
                }
                incoming = link.incoming.recv() => match incoming {
                    Some(Ok(message)) => self.dispatch(message),
                    Some(Err(e)) => return LinkExit::Lost(e),
                    None => return LinkExit::Lost(ConcordError::ChannelClosed),
                },
            }
        }
    }

    /// Apply and fan out one inbound message
    fn dispatch(&self, message: RealtimeMessage) {
        let echo = message.origin_id.as_deref() == Some(self.store.context().as_str());
        if !echo {
            match message.kind.as_str() {
                MSG_SYNC => match parse_sync_data(&message.data) {
                    Ok(sections) => {
                        for (section, state) in sections {
                            self.apply(section, state);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed realtime sync"),
                },
                MSG_UPDATE => match parse_update_data(&message.data) {
                    Ok((section, state)) => self.apply(section, state),
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed realtime update"),
                },
                _ => {}
            }
        }

        let registry = self.listeners.read().get(&message.kind).cloned();
        if let Some(registry) = registry {
            registry.notify(&message);
        }
        self.store
            .subscribers()
            .notify(&StateEvent::Realtime(message));
    }

    fn apply(&self, section: SectionKey, state: SectionState) {
        if let Err(e) = self.store.apply_remote(section, state, ChangeSource::Realtime) {
            tracing::warn!(section = %section, error = %e, "realtime section rejected");
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
