//! Manages the realtime connection lifecycle for an active session.
//!
//! A connection runs two tasks that share the session store: a broadcaster
//! that sends the local user's activity on a fixed cadence, and a receiver
//! that forwards peers' activity to their characters. Both observe a single
//! `ConnectionState` published on a watch channel; once it reads `Closed` the
//! broadcaster sends a Close frame and stops. Nothing reconnects automatically.

use super::protocol::{self, InboundFrame};
use crate::client::RequestOutcome;
use crate::gateway::CharacterGateway;
use crate::store::SharedStore;
use crate::transport::ServiceEndpoint;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(50);

/// How long a closing connection waits for the broadcaster to flush its
/// Close frame before the task is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    KeepAlive,
    /// Handed to the participant's character.
    Forwarded,
    /// Unknown participant, or one without a character yet.
    Ignored,
    /// Not UTF-8 or not an activity event; discarded.
    Malformed,
}

struct Connection {
    state: Arc<watch::Sender<ConnectionState>>,
    broadcaster: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl Connection {
    /// Marks the connection closed, waits for the broadcaster to send the
    /// Close frame, then stops the receiver.
    async fn close(self) {
        self.state.send_replace(ConnectionState::Closed);
        if let Some(mut broadcaster) = self.broadcaster {
            let stopped = tokio::time::timeout(CLOSE_GRACE, &mut broadcaster).await;
            if stopped.is_err() {
                warn!("Broadcaster did not stop in time; aborting");
                broadcaster.abort();
            }
        }
        if let Some(receiver) = self.receiver {
            receiver.abort();
        }
    }
}

pub struct RealtimeEngine {
    store: SharedStore,
    gateway: Arc<dyn CharacterGateway>,
    endpoint: ServiceEndpoint,
    broadcast_interval: Duration,
    connection: Mutex<Option<Connection>>,
}

impl RealtimeEngine {
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn CharacterGateway>,
        endpoint: ServiceEndpoint,
    ) -> Self {
        Self {
            store,
            gateway,
            endpoint,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            connection: Mutex::new(None),
        }
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }

    /// Opens the duplex connection for the current session and starts the
    /// broadcaster and receiver tasks.
    ///
    /// The participant ids in the connection target are a snapshot taken
    /// now; participants added later need a new `connect`. An existing
    /// connection is closed first.
    pub async fn connect(&self) -> RequestOutcome {
        let url = {
            let store = self.store.lock().await;
            let Some(session_id) = store.session_id() else {
                debug!("No session; websocket connect skipped");
                return RequestOutcome::Skipped;
            };
            self.endpoint.ws_url(&protocol::connection_path(
                session_id,
                &store.participant_user_ids(),
            ))
        };

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);
        {
            let mut connection = self.connection.lock().await;
            if let Some(previous) = connection.take() {
                info!("Closing previous websocket before reconnecting");
                previous.close().await;
            }
            *connection = Some(Connection {
                state: state.clone(),
                broadcaster: None,
                receiver: None,
            });
        }

        info!(%url, "Initializing websocket");
        let mut ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                error!(%url, error = %e, "Websocket connection failed");
                state.send_replace(ConnectionState::Closed);
                return RequestOutcome::Failed;
            }
        };
        info!("Websocket opened");

        let mut connection = self.connection.lock().await;
        let Some(current) = connection
            .as_mut()
            .filter(|c| Arc::ptr_eq(&c.state, &state))
        else {
            // Superseded by another connect or disconnect while handshaking.
            warn!("Websocket opened after being replaced; dropping it");
            state.send_replace(ConnectionState::Closed);
            if let Err(e) = ws_stream.close(None).await {
                debug!(error = %e, "Replaced websocket did not close cleanly");
            }
            return RequestOutcome::Skipped;
        };

        state.send_replace(ConnectionState::Open);
        let (sink, source) = ws_stream.split();

        let receiver = tokio::spawn(
            run_receiver(
                source,
                self.store.clone(),
                self.gateway.clone(),
                state.clone(),
            )
            .instrument(info_span!("ws_receiver")),
        );

        let interval = self.broadcast_interval;
        let store = self.store.clone();
        let broadcast_state = state.clone();
        let broadcaster = tokio::spawn(
            async move {
                let sent = run_broadcaster(sink, store, broadcast_state, interval).await;
                info!(sent, "Activity broadcast stopped");
            }
            .instrument(info_span!("ws_broadcaster")),
        );

        current.receiver = Some(receiver);
        current.broadcaster = Some(broadcaster);
        RequestOutcome::Completed
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| *c.state.borrow())
            .unwrap_or(ConnectionState::Closed)
    }

    /// Resolves once the current connection, if any, is closed.
    pub async fn closed(&self) {
        let mut state = match self.connection.lock().await.as_ref() {
            Some(connection) => connection.state.subscribe(),
            None => return,
        };
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Closes the current connection. Session state is left untouched.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await;
            info!("Websocket closed by client");
        }
    }
}

/// Sends the local user's activity every `period` while the connection is
/// open. Returns the number of frames sent once the state reads `Closed`.
///
/// A state change wakes the loop without waiting for the next tick. On the
/// way out the sink is closed, which for a websocket sends the Close frame.
/// A failed send is logged and closes the connection.
pub async fn run_broadcaster<S>(
    mut sink: S,
    store: SharedStore,
    state: Arc<watch::Sender<ConnectionState>>,
    period: Duration,
) -> usize
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut changes = state.subscribe();
    let mut sent = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = changes.changed() => {}
        }
        let current = *state.borrow();
        match current {
            ConnectionState::Closed => break,
            ConnectionState::Connecting => continue,
            ConnectionState::Open => {}
        }

        let event = store.lock().await.self_activity().clone();
        let frame = match protocol::encode_outbound(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode activity");
                continue;
            }
        };

        trace!(voice_activity = event.voice_activity, action = %event.action, "Sending activity");
        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
            error!(error = %e, "Failed to send activity; closing websocket");
            state.send_replace(ConnectionState::Closed);
            break;
        }
        sent += 1;
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "Websocket sink was already closed");
    }
    sent
}

/// Dispatches inbound frames until the stream ends, errors or is closed by
/// the server, then marks the connection closed.
pub async fn run_receiver<St, E>(
    mut source: St,
    store: SharedStore,
    gateway: Arc<dyn CharacterGateway>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                dispatch_frame(&store, gateway.as_ref(), text.as_bytes()).await;
            }
            Ok(WsMessage::Binary(data)) => {
                dispatch_frame(&store, gateway.as_ref(), &data).await;
            }
            Ok(WsMessage::Close(frame)) => {
                info!(?frame, "Websocket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Websocket error");
                break;
            }
        }
    }
    state.send_replace(ConnectionState::Closed);
}

/// Decodes one inbound frame and forwards it to the sender's character if
/// that participant is known and already provisioned.
pub async fn dispatch_frame(
    store: &SharedStore,
    gateway: &dyn CharacterGateway,
    payload: &[u8],
) -> Dispatch {
    let event = match protocol::decode_inbound(payload) {
        Ok(InboundFrame::KeepAlive) => return Dispatch::KeepAlive,
        Ok(InboundFrame::Activity(event)) => event,
        Err(e) => {
            warn!(error = %e, "Discarding malformed websocket frame");
            return Dispatch::Malformed;
        }
    };
    debug!(user_id = %event.user_id, "Received websocket activity");

    let handle = store
        .lock()
        .await
        .find_by_user(&event.user_id)
        .and_then(|p| p.character);

    match handle {
        Some(handle) => {
            gateway.apply_activity(handle, &event);
            Dispatch::Forwarded
        }
        None => Dispatch::Ignored,
    }
}
