//! The single upstream hub connection.
//!
//! [`UpstreamEventSource`] owns one long-lived task that connects to the
//! hub, authenticates, subscribes and then reads events until the
//! connection fails. Failures are classified by [`UpstreamError`]: transient
//! ones go through [`Backoff`] and the `Reconnecting` state, fatal ones (or
//! an exhausted backoff) end in `Failed`. Every transition is published on a
//! [`watch`] channel so the owner learns about `Failed` without polling.
//!
//! Events only reach the handler while `Subscribed`: events the hub sends
//! before acknowledging the subscription are held and handed over right
//! after the transition. A zero heartbeat interval disables pings and the
//! silence check.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use super::backoff::Backoff;
use super::protocol::{Inbound, MessageIds, Outbound};
use super::{UpstreamConnectionState, UpstreamStatus};
use crate::config::UpstreamConfig;
use crate::domain::Event;

/// Upstream connection failures.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// WebSocket transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// A connect or handshake step did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The hub closed the connection.
    #[error("connection closed by hub")]
    Closed,

    /// No frame arrived within two heartbeat intervals.
    #[error("no frame from hub for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The hub sent a frame that is invalid at this stage.
    #[error("unexpected {got} frame while waiting for {expected}")]
    Protocol {
        /// Frame type the handshake expected.
        expected: &'static str,
        /// Frame type received.
        got: &'static str,
    },

    /// Outbound frame could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The hub rejected the access token.
    #[error("hub rejected access token: {0}")]
    AuthRejected(String),

    /// The hub rejected an event subscription.
    #[error("hub rejected subscription {id}: {message}")]
    SubscribeRejected {
        /// Subscription correlation id.
        id: u64,
        /// Hub error message.
        message: String,
    },
}

impl UpstreamError {
    /// Returns `true` for failures that retrying cannot fix.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthRejected(_) | Self::SubscribeRejected { .. }
        )
    }
}

/// Single consumer of normalized upstream events.
///
/// Called inline from the read loop, so implementations must not block.
pub trait EventHandler: Send + Sync {
    /// Handles one event. Called exactly once per event, in arrival order.
    fn handle(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync,
{
    fn handle(&self, event: Event) {
        self(event);
    }
}

struct Shared {
    config: UpstreamConfig,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    status: watch::Sender<UpstreamStatus>,
}

impl Shared {
    fn transition(&self, state: UpstreamConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
            if state != UpstreamConnectionState::Subscribed {
                status.subscribed_since = None;
            }
        });
    }

    fn subscribed(&self) {
        self.status.send_modify(|status| {
            status.state = UpstreamConnectionState::Subscribed;
            status.subscribed_since = Some(Utc::now());
            status.reconnect_attempt = 0;
            status.last_error = None;
        });
    }

    fn record_failure(&self, state: UpstreamConnectionState, attempt: u32, err: &UpstreamError) {
        let message = err.to_string();
        self.status.send_modify(|status| {
            status.state = state;
            status.subscribed_since = None;
            status.reconnect_attempt = attempt;
            status.last_error = Some(message);
        });
    }

    fn deliver(&self, event: Event) {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Arc::clone);
        match handler {
            Some(handler) => handler.handle(event),
            None => tracing::trace!(event_type = event.event_type(), "no event handler registered"),
        }
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owner of the upstream hub connection.
pub struct UpstreamEventSource {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for UpstreamEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamEventSource")
            .field("config", &self.shared.config)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl UpstreamEventSource {
    /// Creates a stopped source.
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        let (status, _) = watch::channel(UpstreamStatus::default());
        Self {
            shared: Arc::new(Shared {
                config,
                handler: RwLock::new(None),
                status,
            }),
            running: Mutex::new(None),
        }
    }

    /// Registers the event consumer, replacing any previous one.
    pub fn on_event(&self, handler: Arc<dyn EventHandler>) {
        let previous = self
            .shared
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handler);
        if previous.is_some() {
            tracing::warn!("upstream event handler replaced");
        }
    }

    /// Spawns the connection task. No-op while a task is already running;
    /// restarts a source that ended in `Failed` or `Disconnected`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            tracing::debug!("upstream source already running");
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        self.shared.status.send_modify(|status| {
            *status = UpstreamStatus::default();
        });
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), stop_rx));
        *running = Some(Running { stop, handle });
        tracing::info!(url = %self.shared.config.url, "upstream source started");
    }

    /// Cancels the read loop and suppresses further reconnects. Returns
    /// once the connection task has ended.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };
        let _ = running.stop.send(true);
        if let Err(err) = running.handle.await {
            tracing::warn!(error = %err, "upstream task ended abnormally");
        }
        self.shared.transition(UpstreamConnectionState::Disconnected);
        tracing::info!("upstream source stopped");
    }

    /// Current connection state.
    #[must_use]
    pub fn current_state(&self) -> UpstreamConnectionState {
        self.shared.status.borrow().state
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status_snapshot(&self) -> UpstreamStatus {
        self.shared.status.borrow().clone()
    }

    /// Subscribes to status transitions.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<UpstreamStatus> {
        self.shared.status.subscribe()
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Runs the connection task; publishes `Failed` if it panics.
async fn supervise(shared: Arc<Shared>, stop: watch::Receiver<bool>) {
    let outcome = tokio::spawn(run(Arc::clone(&shared), stop)).await;
    if let Err(err) = outcome {
        tracing::error!(error = %err, "upstream task aborted");
        let message = format!("upstream task aborted: {err}");
        shared.status.send_modify(|status| {
            status.state = UpstreamConnectionState::Failed;
            status.subscribed_since = None;
            status.last_error = Some(message);
        });
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(shared.config.reconnect.clone());
    loop {
        let err = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            err = session(&shared, &mut backoff) => err,
        };

        if err.is_fatal() {
            tracing::error!(error = %err, "upstream connection failed permanently");
            shared.record_failure(UpstreamConnectionState::Failed, backoff.attempt(), &err);
            return;
        }
        if !backoff.policy().enabled {
            tracing::warn!(error = %err, "upstream connection lost; reconnect disabled");
            shared.record_failure(UpstreamConnectionState::Disconnected, 0, &err);
            return;
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!(
                error = %err,
                attempts = backoff.attempt(),
                "upstream reconnect attempts exhausted"
            );
            shared.record_failure(UpstreamConnectionState::Failed, backoff.attempt(), &err);
            return;
        };
        tracing::warn!(
            error = %err,
            attempt = backoff.attempt(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "upstream connection lost; reconnecting"
        );
        shared.record_failure(UpstreamConnectionState::Reconnecting, backoff.attempt(), &err);

        tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    shared.transition(UpstreamConnectionState::Disconnected);
}

/// Runs one connection until it fails. Never returns on success.
async fn session(shared: &Shared, backoff: &mut Backoff) -> UpstreamError {
    let config = &shared.config;
    shared.transition(UpstreamConnectionState::Connecting);
    let connect = tokio_tungstenite::connect_async(config.url.as_str());
    let (socket, _) = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return err.into(),
        Err(_) => return UpstreamError::Timeout("connect"),
    };
    let (mut tx, mut rx) = socket.split();

    // The hub requires strictly increasing ids for the whole connection.
    let mut ids = MessageIds::default();
    shared.transition(UpstreamConnectionState::Authenticating);
    let early = match handshake(shared, &mut ids, &mut tx, &mut rx).await {
        Ok(early) => early,
        Err(err) => return err,
    };
    shared.subscribed();
    backoff.reset();
    tracing::info!(url = %config.url, early = early.len(), "upstream subscribed");
    for event in early {
        shared.deliver(event);
    }

    match read_loop(shared, &mut ids, &mut tx, &mut rx).await {
        Ok(never) => match never {},
        Err(err) => err,
    }
}

async fn handshake<W, R>(
    shared: &Shared,
    ids: &mut MessageIds,
    tx: &mut W,
    rx: &mut R,
) -> Result<Vec<Event>, UpstreamError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let config = &shared.config;
    let step = config.connect_timeout;

    match next_frame(rx, step, "auth_required").await? {
        Inbound::AuthRequired { .. } => {}
        other => return Err(unexpected("auth_required", &other)),
    }
    send(tx, &Outbound::Auth {
        access_token: &config.access_token,
    })
    .await?;
    match next_frame(rx, step, "auth_ok").await? {
        Inbound::AuthOk { ha_version } => {
            tracing::debug!(hub_version = ?ha_version, "upstream authenticated");
        }
        Inbound::AuthInvalid { message } => {
            return Err(UpstreamError::AuthRejected(
                message.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        other => return Err(unexpected("auth_ok", &other)),
    }

    let mut pending = Vec::new();
    let mut early = Vec::new();
    let types: Vec<Option<&str>> = if config.event_types.is_empty() {
        vec![None]
    } else {
        config.event_types.iter().map(|t| Some(t.as_str())).collect()
    };
    for event_type in types {
        let id = ids.next_id();
        send(tx, &Outbound::SubscribeEvents { id, event_type }).await?;
        pending.push(id);
    }
    while !pending.is_empty() {
        match next_frame(rx, step, "result").await? {
            Inbound::Result { id, success, error } => {
                if !success {
                    return Err(UpstreamError::SubscribeRejected {
                        id,
                        message: error.map(|e| e.message).unwrap_or_default(),
                    });
                }
                pending.retain(|p| *p != id);
            }
            Inbound::Event { event, .. } => early.push(event.into_event()),
            other => tracing::trace!(kind = other.kind(), "ignored frame during subscribe"),
        }
    }
    Ok(early)
}

async fn read_loop<W, R>(
    shared: &Shared,
    ids: &mut MessageIds,
    tx: &mut W,
    rx: &mut R,
) -> Result<std::convert::Infallible, UpstreamError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let period = shared.config.heartbeat_interval;
    let mut last_seen = Instant::now();
    let mut heartbeat = (!period.is_zero()).then(|| {
        let mut heartbeat = tokio::time::interval_at(last_seen + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat
    });

    loop {
        tokio::select! {
            frame = rx.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(UpstreamError::Closed),
                };
                last_seen = Instant::now();
                match message {
                    Message::Text(text) => handle_text(shared, text.as_str()),
                    Message::Close(frame) => {
                        tracing::debug!(?frame, "hub sent close frame");
                        return Err(UpstreamError::Closed);
                    }
                    _ => {}
                }
            }
            tick = next_tick(&mut heartbeat) => {
                let silent = tick.saturating_duration_since(last_seen);
                if silent >= period.saturating_mul(2) {
                    return Err(UpstreamError::HeartbeatTimeout(silent));
                }
                send(tx, &Outbound::Ping { id: ids.next_id() }).await?;
            }
        }
    }
}

/// Next heartbeat tick; pending forever when the heartbeat is disabled.
async fn next_tick(heartbeat: &mut Option<Interval>) -> Instant {
    match heartbeat {
        Some(heartbeat) => heartbeat.tick().await,
        None => std::future::pending().await,
    }
}

fn handle_text(shared: &Shared, text: &str) {
    match Inbound::parse(text) {
        Ok(Inbound::Event { event, .. }) => shared.deliver(event.into_event()),
        Ok(Inbound::Result {
            id,
            success: false,
            error,
        }) => {
            tracing::warn!(id, error = ?error, "hub reported command failure");
        }
        Ok(other) => tracing::trace!(kind = other.kind(), "hub frame"),
        Err(err) => {
            tracing::warn!(error = %err, len = text.len(), "dropping malformed hub message");
        }
    }
}

async fn next_frame<R>(
    rx: &mut R,
    step: Duration,
    expected: &'static str,
) -> Result<Inbound, UpstreamError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let deadline = Instant::now() + step;
    loop {
        let frame = tokio::time::timeout_at(deadline, rx.next())
            .await
            .map_err(|_| UpstreamError::Timeout(expected))?;
        match frame {
            Some(Ok(Message::Text(text))) => match Inbound::parse(text.as_str()) {
                Ok(inbound) => return Ok(inbound),
                Err(err) => {
                    tracing::warn!(error = %err, expected, "dropping malformed hub message");
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(UpstreamError::Closed),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

async fn send<W>(tx: &mut W, frame: &Outbound<'_>) -> Result<(), UpstreamError>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    tx.send(Message::text(frame.to_json()?)).await?;
    Ok(())
}

fn unexpected(expected: &'static str, got: &Inbound) -> UpstreamError {
    UpstreamError::Protocol {
        expected,
        got: got.kind(),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::upstream::ReconnectPolicy;

    type HubSocket = WebSocketStream<TcpStream>;

    fn config(url: String, reconnect: ReconnectPolicy) -> UpstreamConfig {
        UpstreamConfig {
            url,
            access_token: "hub-token".to_string(),
            event_types: Vec::new(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            reconnect,
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts,
        }
    }

    async fn listener() -> (TcpListener, String) {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        (listener, format!("ws://{addr}"))
    }

    async fn accept(listener: &TcpListener) -> HubSocket {
        let Ok((stream, _)) = listener.accept().await else {
            panic!("accept failed");
        };
        let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
            panic!("ws handshake failed");
        };
        socket
    }

    async fn send_text(socket: &mut HubSocket, text: &str) {
        if socket.send(Message::text(text.to_string())).await.is_err() {
            panic!("hub send failed");
        }
    }

    async fn recv_json(socket: &mut HubSocket) -> serde_json::Value {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str(text.as_str()) else {
                        panic!("client sent invalid JSON");
                    };
                    return value;
                }
                Some(Ok(_)) => {}
                _ => panic!("client disconnected"),
            }
        }
    }

    /// Plays the hub side of auth + a single subscribe.
    async fn hub_handshake(socket: &mut HubSocket) {
        send_text(socket, r#"{"type":"auth_required","ha_version":"2024.5.0"}"#).await;
        let auth = recv_json(socket).await;
        assert_eq!(auth.get("type").and_then(|v| v.as_str()), Some("auth"));
        assert_eq!(
            auth.get("access_token").and_then(|v| v.as_str()),
            Some("hub-token")
        );
        send_text(socket, r#"{"type":"auth_ok"}"#).await;
        let sub = recv_json(socket).await;
        assert_eq!(
            sub.get("type").and_then(|v| v.as_str()),
            Some("subscribe_events")
        );
        let id = sub.get("id").and_then(serde_json::Value::as_u64).unwrap_or(0);
        send_text(
            socket,
            &format!(r#"{{"id":{id},"type":"result","success":true,"result":null}}"#),
        )
        .await;
    }

    fn state_changed(entity_id: &str) -> String {
        format!(
            r#"{{"id":1,"type":"event","event":{{"event_type":"state_changed","data":{{"entity_id":"{entity_id}"}},"time_fired":"2024-05-01T10:00:00+00:00"}}}}"#
        )
    }

    async fn wait_for_state(
        status: &mut watch::Receiver<UpstreamStatus>,
        state: UpstreamConnectionState,
    ) -> UpstreamStatus {
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.state == state),
        )
        .await;
        let Ok(Ok(status)) = waited else {
            panic!("never reached {state}");
        };
        status.clone()
    }

    fn collecting_handler() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |event: Event| {
            let _ = tx.send(event);
        };
        (Arc::new(handler), rx)
    }

    #[tokio::test]
    async fn delivers_events_in_order_and_skips_malformed() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            hub_handshake(&mut socket).await;
            send_text(&mut socket, "{not json").await;
            send_text(&mut socket, &state_changed("light.kitchen")).await;
            send_text(&mut socket, r#"{"type":"event","id":1,"event":{}}"#).await;
            send_text(&mut socket, &state_changed("switch.fan")).await;
            // Keep the connection open until the test ends.
            let _ = socket.next().await;
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(3)));
        let (handler, mut events) = collecting_handler();
        source.on_event(handler);
        let mut status = source.status();
        source.start();
        let _ = wait_for_state(&mut status, UpstreamConnectionState::Subscribed).await;

        let first = events.recv().await;
        let second = events.recv().await;
        assert_eq!(first.as_ref().and_then(Event::entity_id), Some("light.kitchen"));
        assert_eq!(second.as_ref().and_then(Event::domain), Some("switch"));
        assert_eq!(source.current_state(), UpstreamConnectionState::Subscribed);
        assert!(source.status_snapshot().uptime().is_some());

        source.stop().await;
        assert_eq!(source.current_state(), UpstreamConnectionState::Disconnected);
        hub.abort();
    }

    #[tokio::test]
    async fn unreachable_hub_exhausts_backoff_and_fails() {
        let (listener, url) = listener().await;
        drop(listener);

        let source = UpstreamEventSource::new(config(url, fast_policy(3)));
        let mut status = source.status();
        source.start();
        let failed = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;
        assert_eq!(failed.reconnect_attempt, 3);
        assert!(failed.last_error.is_some());
    }

    #[tokio::test]
    async fn rejected_token_fails_without_retry() {
        let (listener, url) = listener().await;
        let accepted = Arc::new(StdMutex::new(0_u32));
        let counter = Arc::clone(&accepted);
        let hub = tokio::spawn(async move {
            loop {
                let mut socket = accept(&listener).await;
                *counter.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                send_text(&mut socket, r#"{"type":"auth_required"}"#).await;
                let _ = recv_json(&mut socket).await;
                send_text(&mut socket, r#"{"type":"auth_invalid","message":"bad token"}"#)
                    .await;
            }
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(5)));
        let mut status = source.status();
        source.start();
        let failed = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;
        assert!(
            failed
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("bad token"))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*accepted.lock().unwrap_or_else(PoisonError::into_inner), 1);
        hub.abort();
    }

    #[tokio::test]
    async fn reconnects_after_hub_drop_and_resets_attempts() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut first = accept(&listener).await;
            hub_handshake(&mut first).await;
            drop(first);

            let mut second = accept(&listener).await;
            hub_handshake(&mut second).await;
            send_text(&mut second, &state_changed("climate.hall")).await;
            let _ = second.next().await;
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(3)));
        let (handler, mut events) = collecting_handler();
        source.on_event(handler);
        let mut status = source.status();
        source.start();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        let Ok(Some(event)) = event else {
            panic!("no event after reconnect");
        };
        assert_eq!(event.domain(), Some("climate"));
        let current = source.status_snapshot();
        assert_eq!(current.state, UpstreamConnectionState::Subscribed);
        assert_eq!(current.reconnect_attempt, 0);

        source.stop().await;
        hub.abort();
    }

    #[tokio::test]
    async fn failed_source_can_be_restarted() {
        let (listener, url) = listener().await;
        drop(listener);
        let source = UpstreamEventSource::new(config(url, fast_policy(1)));
        let mut status = source.status();
        source.start();
        let _ = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;

        source.start();
        assert_ne!(source.current_state(), UpstreamConnectionState::Failed);
        let _ = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;
        source.stop().await;
    }

    #[tokio::test]
    async fn zero_heartbeat_disables_pings_and_still_sees_hub_drop() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            hub_handshake(&mut socket).await;
            let _ = socket.close(None).await;
        });

        let mut cfg = config(
            url,
            ReconnectPolicy {
                enabled: false,
                ..fast_policy(1)
            },
        );
        cfg.heartbeat_interval = Duration::ZERO;
        let source = UpstreamEventSource::new(cfg);
        let mut status = source.status();
        source.start();

        let ended = wait_for_state(&mut status, UpstreamConnectionState::Disconnected).await;
        assert_eq!(ended.last_error.as_deref(), Some("connection closed by hub"));
        hub.abort();
    }

    #[tokio::test]
    async fn silent_hub_trips_heartbeat_and_reconnects() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            hub_handshake(&mut socket).await;
            // Stay connected but never answer.
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let mut cfg = config(
            url,
            ReconnectPolicy {
                enabled: true,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                max_attempts: 3,
            },
        );
        cfg.heartbeat_interval = Duration::from_millis(50);
        let source = UpstreamEventSource::new(cfg);
        let mut status = source.status();
        source.start();

        let lost = wait_for_state(&mut status, UpstreamConnectionState::Reconnecting).await;
        assert_eq!(lost.reconnect_attempt, 1);
        assert!(
            lost.last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("no frame from hub"))
        );

        source.stop().await;
        assert_eq!(source.current_state(), UpstreamConnectionState::Disconnected);
        hub.abort();
    }

    #[tokio::test]
    async fn rejected_subscription_is_fatal() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            send_text(&mut socket, r#"{"type":"auth_required"}"#).await;
            let _ = recv_json(&mut socket).await;
            send_text(&mut socket, r#"{"type":"auth_ok"}"#).await;
            let sub = recv_json(&mut socket).await;
            let id = sub.get("id").and_then(serde_json::Value::as_u64).unwrap_or(0);
            send_text(
                &mut socket,
                &format!(
                    r#"{{"id":{id},"type":"result","success":false,"error":{{"code":"invalid_format","message":"unknown event type"}}}}"#
                ),
            )
            .await;
            let _ = socket.next().await;
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(5)));
        let mut status = source.status();
        source.start();
        let failed = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;
        assert_eq!(failed.reconnect_attempt, 0);
        assert!(
            failed
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("unknown event type"))
        );
        hub.abort();
    }

    #[tokio::test]
    async fn events_before_subscribe_result_are_held_until_subscribed() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            send_text(&mut socket, r#"{"type":"auth_required"}"#).await;
            let _ = recv_json(&mut socket).await;
            send_text(&mut socket, r#"{"type":"auth_ok"}"#).await;
            let sub = recv_json(&mut socket).await;
            let id = sub.get("id").and_then(serde_json::Value::as_u64).unwrap_or(0);
            send_text(&mut socket, &state_changed("light.early")).await;
            send_text(
                &mut socket,
                &format!(r#"{{"id":{id},"type":"result","success":true}}"#),
            )
            .await;
            let _ = socket.next().await;
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(3)));
        let observed = source.status();
        let (tx, mut seen) = mpsc::unbounded_channel();
        source.on_event(Arc::new(move |event: Event| {
            let _ = tx.send((event, observed.borrow().state));
        }));
        source.start();

        let received = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await;
        let Ok(Some((event, state))) = received else {
            panic!("early event never delivered");
        };
        assert_eq!(event.entity_id(), Some("light.early"));
        assert_eq!(state, UpstreamConnectionState::Subscribed);

        source.stop().await;
        hub.abort();
    }

    #[tokio::test]
    async fn panicking_handler_marks_source_failed() {
        let (listener, url) = listener().await;
        let hub = tokio::spawn(async move {
            let mut socket = accept(&listener).await;
            hub_handshake(&mut socket).await;
            send_text(&mut socket, &state_changed("light.kitchen")).await;
            let _ = socket.next().await;
        });

        let source = UpstreamEventSource::new(config(url, fast_policy(3)));
        source.on_event(Arc::new(|event: Event| {
            if event.entity_id().is_some() {
                panic!("handler failure");
            }
        }));
        let mut status = source.status();
        source.start();

        let failed = wait_for_state(&mut status, UpstreamConnectionState::Failed).await;
        assert!(
            failed
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with("upstream task aborted"))
        );
        hub.abort();
    }
}
