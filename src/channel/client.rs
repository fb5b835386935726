//! Realtime channel websocket client.
//!
//! The client owns the websocket through a background worker task,
//! multiplexes joined topics over it, correlates request/reply pairs by
//! ref, and schedules bounded-backoff reconnects after unplanned closes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::backoff::{with_timeout, ReconnectPolicy};
use crate::channel::proto::{InboundFrame, OutboundFrame, ReplyPayload, EVENT_REPLY};
use crate::channel::registry::{CallbackRegistry, ClientEvent, EventCallback, EventKey};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default tuning for [`RealtimeChannelClient`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    /// Interval between keepalive frames on the reserved topic.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    /// Reply deadline for channel join requests.
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
    /// Reply deadline for channel pushes.
    pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Tuning knobs for the channel client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
    pub push_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: ClientDefaults::HEARTBEAT_INTERVAL,
            join_timeout: ClientDefaults::JOIN_TIMEOUT,
            push_timeout: ClientDefaults::PUSH_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors produced by channel requests.
///
/// These are local to the call that triggered them; they never affect
/// other pending requests or the connection itself.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation attempted while the transport is not connected.
    #[error("not connected")]
    NotConnected,

    /// Push attempted on a topic not joined on the current connection.
    #[error("channel {0} not joined")]
    ChannelNotJoined(String),

    /// No correlated reply arrived within the operation deadline.
    #[error("no reply within {0:?}")]
    RequestTimeout(Duration),

    /// Server replied with a non-ok status.
    #[error("server replied with status {:?}", .0.status)]
    ReplyError(ReplyPayload),
}

#[derive(Default)]
struct ClientState {
    server_url: Option<String>,
    connected: bool,
    reconnect_attempts: u32,
    user_requested_disconnect: bool,
    /// Connection generation; bumped per transport so a superseded
    /// worker's open/close callbacks become no-ops.
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    reconnect_timer: Option<JoinHandle<()>>,
    pending: HashMap<String, oneshot::Sender<ReplyPayload>>,
    joined: HashSet<String>,
    ref_counter: u64,
}

impl ClientState {
    fn next_ref(&mut self) -> String {
        self.ref_counter += 1;
        self.ref_counter.to_string()
    }
}

struct ClientInner {
    options: ClientOptions,
    state: Mutex<ClientState>,
    registry: CallbackRegistry,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_pending(
        &self,
        state: &mut ClientState,
        reference: String,
    ) -> oneshot::Receiver<ReplyPayload> {
        let (tx, rx) = oneshot::channel();
        state.pending.insert(reference, tx);
        rx
    }

    fn send_frame(
        &self,
        state: &mut ClientState,
        reference: &str,
        frame: OutboundFrame,
    ) -> Result<(), ClientError> {
        let delivered = state
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(frame).is_ok());
        if !delivered {
            state.pending.remove(reference);
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }
}

/// Realtime channel client.
///
/// Cheap to clone; all clones share one connection. Construct a single
/// instance at the application's composition root and hand out clones.
#[derive(Clone)]
pub struct RealtimeChannelClient {
    inner: Arc<ClientInner>,
}

impl RealtimeChannelClient {
    /// Creates a client with default tuning.
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    /// Creates a client with explicit tuning.
    pub fn with_options(options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                options,
                state: Mutex::new(ClientState::default()),
                registry: CallbackRegistry::new(),
            }),
        }
    }

    /// Opens the transport to `server_url`.
    ///
    /// A no-op while a live transport exists. Clears the user-disconnect
    /// flag, cancels any reconnect already scheduled, and retains the URL
    /// for later reconnects. The connection is established in the
    /// background; listen on [`EventKey::Connect`] to observe the open.
    /// Must be called within a Tokio runtime.
    pub fn connect(&self, server_url: impl Into<String>) {
        let mut state = self.inner.state();
        if state.outbound.is_some() {
            return;
        }
        state.user_requested_disconnect = false;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        state.server_url = Some(server_url.into());
        start_transport(&self.inner, &mut state);
    }

    /// Closes the transport and suppresses reconnection until the next
    /// explicit [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let mut state = self.inner.state();
        state.user_requested_disconnect = true;
        state.connected = false;
        state.reconnect_attempts = 0;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        // Dropping the sender tells the worker to close the socket.
        state.outbound.take();
    }

    /// Returns whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    /// Registers `callback` under `key`. Registrations accumulate and
    /// survive reconnects.
    pub fn add_callbacks(&self, key: EventKey, callback: EventCallback) {
        self.inner.registry.add(key, callback);
    }

    /// Removes listeners under `key`: a specific one when `callback` is
    /// given (matched by `Arc` identity), all of them otherwise.
    pub fn remove_callbacks(&self, key: &EventKey, callback: Option<&EventCallback>) {
        self.inner.registry.remove(key, callback);
    }

    /// Joins a channel and waits for the server's reply.
    ///
    /// On an ok reply the topic becomes sendable via
    /// [`send_to_channel`](Self::send_to_channel). Membership does not
    /// survive a close; callers rejoin after every reconnect.
    pub async fn join_channel(&self, topic: &str) -> Result<ReplyPayload, ClientError> {
        let deadline = self.inner.options.join_timeout;
        let (reference, epoch, rx) = {
            let mut state = self.inner.state();
            if !state.connected {
                return Err(ClientError::NotConnected);
            }
            let reference = state.next_ref();
            let frame = OutboundFrame::join(topic, reference.clone());
            let rx = self.inner.track_pending(&mut state, reference.clone());
            self.inner.send_frame(&mut state, &reference, frame)?;
            (reference, state.epoch, rx)
        };

        match with_timeout(deadline, rx).await {
            Ok(Ok(reply)) if reply.is_ok() => {
                let mut state = self.inner.state();
                if state.epoch == epoch {
                    state.joined.insert(topic.to_string());
                }
                Ok(reply)
            }
            Ok(Ok(reply)) => Err(ClientError::ReplyError(reply)),
            Ok(Err(_)) | Err(_) => {
                self.inner.state().pending.remove(&reference);
                Err(ClientError::RequestTimeout(deadline))
            }
        }
    }

    /// Pushes an event on a joined channel and waits for the server's
    /// reply.
    pub async fn send_to_channel(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<ReplyPayload, ClientError> {
        let deadline = self.inner.options.push_timeout;
        let (reference, rx) = {
            let mut state = self.inner.state();
            if !state.connected {
                return Err(ClientError::NotConnected);
            }
            if !state.joined.contains(topic) {
                return Err(ClientError::ChannelNotJoined(topic.to_string()));
            }
            let reference = state.next_ref();
            let frame = OutboundFrame::push(topic, event, payload, reference.clone());
            let rx = self.inner.track_pending(&mut state, reference.clone());
            self.inner.send_frame(&mut state, &reference, frame)?;
            (reference, rx)
        };

        match with_timeout(deadline, rx).await {
            Ok(Ok(reply)) if reply.is_ok() => Ok(reply),
            Ok(Ok(reply)) => Err(ClientError::ReplyError(reply)),
            Ok(Err(_)) | Err(_) => {
                self.inner.state().pending.remove(&reference);
                Err(ClientError::RequestTimeout(deadline))
            }
        }
    }
}

impl Default for RealtimeChannelClient {
    fn default() -> Self {
        Self::new()
    }
}

fn start_transport(inner: &Arc<ClientInner>, state: &mut ClientState) {
    let Some(url) = state.server_url.clone() else {
        return;
    };
    state.epoch += 1;
    let epoch = state.epoch;
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    state.outbound = Some(outbound_tx);

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        run_transport(task_inner, url, epoch, outbound_rx).await;
    });
}

async fn run_transport(
    inner: Arc<ClientInner>,
    url: String,
    epoch: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    match connect_async(url.as_str()).await {
        Ok((mut socket, _response)) => {
            if mark_open(&inner, epoch) {
                debug!(event = "transport_open", url = %url);
                inner
                    .registry
                    .dispatch(&EventKey::Connect, &ClientEvent::Connected);
                match run_session(&inner, socket, &mut outbound_rx).await {
                    SessionEnd::Closed => {}
                    SessionEnd::Lost(Some(err)) => {
                        inner.registry.dispatch(
                            &EventKey::Error,
                            &ClientEvent::TransportError {
                                message: err.to_string(),
                            },
                        );
                    }
                    SessionEnd::Lost(None) => {}
                }
            } else {
                // Superseded while the handshake was in flight.
                let _ = socket.close(None).await;
            }
        }
        Err(err) => {
            debug!(event = "transport_open_failed", url = %url, error = %err);
            inner.registry.dispatch(
                &EventKey::Error,
                &ClientEvent::TransportError {
                    message: err.to_string(),
                },
            );
        }
    }
    handle_close(&inner, epoch);
}

fn mark_open(inner: &Arc<ClientInner>, epoch: u64) -> bool {
    let mut state = inner.state();
    if state.epoch != epoch || state.user_requested_disconnect {
        return false;
    }
    state.connected = true;
    state.reconnect_attempts = 0;
    true
}

enum SessionEnd {
    /// The outbound sender was dropped by `disconnect`; the socket was
    /// closed gracefully.
    Closed,
    /// The remote closed, or the transport failed.
    Lost(Option<WsError>),
}

async fn run_session(
    inner: &Arc<ClientInner>,
    mut socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
) -> SessionEnd {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.options.heartbeat_interval,
        inner.options.heartbeat_interval,
    );

    loop {
        tokio::select! {
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if let Err(err) = send_outbound(&mut socket, &frame).await {
                            return SessionEnd::Lost(Some(err));
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Closed;
                    }
                }
            }
            maybe_message = socket.next() => {
                match maybe_message {
                    Some(Ok(Message::Text(text))) => route_inbound(inner, text.as_str()),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return SessionEnd::Lost(Some(err));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost(None),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Lost(Some(err)),
                }
            }
            _ = heartbeat.tick() => {
                let reference = inner.state().next_ref();
                let frame = OutboundFrame::heartbeat(reference);
                if let Err(err) = send_outbound(&mut socket, &frame).await {
                    return SessionEnd::Lost(Some(err));
                }
            }
        }
    }
}

async fn send_outbound(socket: &mut Socket, frame: &OutboundFrame) -> Result<(), WsError> {
    match frame.to_text() {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(err) => {
            warn!(event = "frame_encode_failed", error = %err);
            Ok(())
        }
    }
}

fn route_inbound(inner: &Arc<ClientInner>, text: &str) {
    let frame = match InboundFrame::from_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(event = "malformed_frame", error = %err, "dropping inbound frame");
            return;
        }
    };

    if frame.event.as_deref() == Some(EVENT_REPLY) {
        resolve_reply(inner, frame);
        return;
    }

    let Some(event) = frame.event.clone() else {
        debug!(event = "unroutable_frame", "inbound frame without event");
        return;
    };
    let topic = frame.topic.clone();
    let push = ClientEvent::Push { frame };
    if let Some(topic) = topic {
        inner.registry.dispatch(
            &EventKey::ChannelEvent {
                topic,
                event: event.clone(),
            },
            &push,
        );
    }
    inner.registry.dispatch(&EventKey::Event(event), &push);
}

fn resolve_reply(inner: &Arc<ClientInner>, frame: InboundFrame) {
    let Some(reference) = frame.reference else {
        debug!(event = "reply_without_ref");
        return;
    };
    let pending = inner.state().pending.remove(&reference);
    match pending {
        Some(tx) => {
            let _ = tx.send(ReplyPayload::from_value(frame.payload));
        }
        None => {
            // Heartbeat acks and post-timeout stragglers land here.
            debug!(event = "uncorrelated_reply", reference = %reference);
        }
    }
}

fn handle_close(inner: &Arc<ClientInner>, epoch: u64) {
    let mut state = inner.state();
    if state.epoch != epoch {
        return;
    }
    state.connected = false;
    state.outbound = None;
    state.joined.clear();

    if state.user_requested_disconnect {
        state.reconnect_attempts = 0;
        debug!(event = "transport_closed", reconnect = false);
        return;
    }
    if inner
        .options
        .reconnect
        .attempts_exhausted(state.reconnect_attempts)
    {
        debug!(event = "reconnect_exhausted", attempts = state.reconnect_attempts);
        state.reconnect_attempts = 0;
        return;
    }

    let attempt = state.reconnect_attempts;
    let delay = inner.options.reconnect.delay_for_attempt(attempt);
    debug!(
        event = "reconnect_scheduled",
        attempt,
        delay_ms = delay.as_millis() as u64
    );
    let timer_inner = Arc::clone(inner);
    state.reconnect_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = timer_inner.state();
        state.reconnect_timer = None;
        if state.user_requested_disconnect || state.outbound.is_some() {
            return;
        }
        state.reconnect_attempts += 1;
        start_transport(&timer_inner, &mut state);
    }));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::{ClientError, ClientOptions, ClientState, RealtimeChannelClient};

    #[test]
    fn join_requires_connection() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let client = RealtimeChannelClient::new();
            let result = client.join_channel("prayer:stream").await;
            assert!(matches!(result, Err(ClientError::NotConnected)));
        });
    }

    #[test]
    fn send_checks_connection_before_membership() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let client = RealtimeChannelClient::new();
            let result = client
                .send_to_channel("prayer:stream", "audio:transcribe", json!({}))
                .await;
            assert!(matches!(result, Err(ClientError::NotConnected)));
        });
    }

    #[test]
    fn refs_are_unique_and_monotonic() {
        let mut state = ClientState::default();
        assert_eq!(state.next_ref(), "1");
        assert_eq!(state.next_ref(), "2");
        assert_eq!(state.next_ref(), "3");
    }

    #[test]
    fn default_options_match_protocol_constants() {
        let options = ClientOptions::default();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(options.join_timeout, Duration::from_secs(5));
        assert_eq!(options.push_timeout, Duration::from_secs(10));
        assert_eq!(options.reconnect.max_attempts, 5);
        assert_eq!(options.reconnect.initial_backoff, Duration::from_secs(1));
        assert_eq!(options.reconnect.max_backoff, Duration::from_secs(10));
    }
}
