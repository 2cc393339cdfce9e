use crate::api::websocket_url;
use crate::auth::CredentialManager;
use crate::config::EngineConfig;
use crate::error::{HarviaError, Result};
use crate::protocol::{ClientMessage, ServerMessage, SubscribePayload};
use crate::reconciler::Reconciler;
use crate::types::UpdateSource;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

/// Connection state of the push channel, observable via
/// [`PushChannel::state_watch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Session renewal failed; reconnects are paused until a fresh
    /// authentication is observed
    Reauthenticating,
}

/// Why a websocket session ended
enum SessionEnd {
    /// Server closed or the socket errored
    Closed,
    /// No keepalive within the heartbeat window
    HeartbeatLost,
    /// Planned rotation of a healthy connection
    Rotate,
    /// Stop was requested
    Shutdown,
}

/// Persistent push connection to the cloud with automatic reconnection
///
/// Runs as a background task: `Disconnected -> Connecting -> Connected`,
/// falling back to `Disconnected` with exponential backoff on failure and
/// to `Reauthenticating` when the session dies. Incoming deltas feed the
/// reconciler directly.
pub struct PushChannel {
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: broadcast::Sender<()>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PushChannel {
    /// Spawn the connection loop
    pub fn start(
        config: EngineConfig,
        credentials: Arc<CredentialManager>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, _) = broadcast::channel(1);

        let stop_tx_task = stop_tx.clone();
        let handle = tokio::spawn(async move {
            run_channel(config, credentials, reconciler, state_tx, stop_tx_task).await;
        });

        Self {
            state_rx,
            stop_tx,
            task_handle: Some(handle),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Stop the channel terminally, cancelling any pending reconnect timer
    pub async fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.task_handle.take() {
            // Give it a moment to close the socket gracefully
            let _ = timeout(Duration::from_millis(500), handle).await;
        }
    }
}

/// Double the reconnect delay up to the cap; a zero delay starts at base
fn next_backoff(current: Duration, base: Duration, cap: Duration) -> Duration {
    if current.is_zero() {
        base
    } else {
        (current * 2).min(cap)
    }
}

/// Pick the delay before the next reconnect after a session ended
///
/// A sustained connected period earns a fresh backoff so a transient blip
/// does not inherit an old long delay.
fn backoff_after_session(
    current: Duration,
    connected_for: Duration,
    base: Duration,
    cap: Duration,
    reset_after: Duration,
) -> Duration {
    if connected_for >= reset_after {
        base
    } else {
        next_backoff(current, base, cap)
    }
}

/// Uniform 0-1s jitter so a fleet of clients does not reconnect in step
fn reconnect_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=1000))
}

async fn run_channel(
    config: EngineConfig,
    credentials: Arc<CredentialManager>,
    reconciler: Arc<Reconciler>,
    state_tx: watch::Sender<ConnectionState>,
    stop_tx: broadcast::Sender<()>,
) {
    let mut stop_rx = stop_tx.subscribe();
    let mut backoff = Duration::ZERO;
    // Subscribed before any session can fail: an authentication that lands
    // between a failure and the reauth wait below must still wake the wait
    let mut session_rx = credentials.session_watch();

    'outer: loop {
        if !backoff.is_zero() {
            let delay = backoff + reconnect_jitter();
            tracing::info!("reconnecting push channel in {:?}", delay);
            tokio::select! {
                _ = stop_rx.recv() => break 'outer,
                _ = sleep(delay) => {}
            }
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        let connected_at = Instant::now();

        let mut session_stop_rx = stop_tx.subscribe();
        let end = tokio::select! {
            _ = stop_rx.recv() => break 'outer,
            end = run_session(&config, &credentials, &reconciler, &state_tx, &mut session_stop_rx) => end,
        };

        match end {
            Ok(SessionEnd::Shutdown) => break 'outer,
            Ok(SessionEnd::Rotate) => {
                tracing::info!("rotating push connection");
                backoff = Duration::ZERO;
            }
            Ok(SessionEnd::Closed) | Ok(SessionEnd::HeartbeatLost) => {
                backoff = backoff_after_session(
                    backoff,
                    connected_at.elapsed(),
                    config.reconnect_base,
                    config.reconnect_cap,
                    config.backoff_reset_after,
                );
            }
            Err(HarviaError::ReauthRequired) => {
                tracing::warn!("push channel suspended, re-authentication required");
                let _ = state_tx.send(ConnectionState::Reauthenticating);

                tokio::select! {
                    _ = stop_rx.recv() => break 'outer,
                    changed = session_rx.changed() => {
                        if changed.is_err() {
                            break 'outer;
                        }
                    }
                }
                backoff = Duration::ZERO;
            }
            Err(err) => {
                tracing::error!("push channel error: {}", err);
                backoff = next_backoff(backoff, config.reconnect_base, config.reconnect_cap);
            }
        }
        let _ = state_tx.send(ConnectionState::Disconnected);
    }

    let _ = state_tx.send(ConnectionState::Disconnected);
    tracing::info!("push channel stopped");
}

/// One websocket session: connect, handshake, subscribe, pump messages
async fn run_session(
    config: &EngineConfig,
    credentials: &CredentialManager,
    reconciler: &Reconciler,
    state_tx: &watch::Sender<ConnectionState>,
    stop_rx: &mut broadcast::Receiver<()>,
) -> Result<SessionEnd> {
    let token = credentials.valid_token().await?;
    let account_id = credentials.account_id().await?;

    let url = websocket_url(&config.base_url, &token);
    tracing::debug!("connecting push channel");
    let (ws_stream, _) = connect_async(&url).await?;
    let (mut write, mut read) = ws_stream.split();

    write
        .send(Message::Text(ClientMessage::ConnectionInit.encode()?))
        .await?;

    let subscription_id = Uuid::new_v4();
    let mut heartbeat_window = config.heartbeat_timeout;
    let session_started = Instant::now();

    loop {
        // Planned rotation keeps the server-side subscription lease fresh
        if session_started.elapsed() >= config.rotate_connection_after {
            let _ = write
                .send(Message::Text(
                    ClientMessage::Stop {
                        id: subscription_id,
                    }
                    .encode()?,
                ))
                .await;
            let _ = write.close().await;
            return Ok(SessionEnd::Rotate);
        }

        let msg_result = tokio::select! {
            _ = stop_rx.recv() => {
                let _ = write
                    .send(Message::Text(ClientMessage::Stop { id: subscription_id }.encode()?))
                    .await;
                let _ = write.close().await;
                return Ok(SessionEnd::Shutdown);
            }
            read_result = timeout(heartbeat_window, read.next()) => match read_result {
                Ok(msg) => msg,
                Err(_) => {
                    tracing::warn!(
                        "no keepalive in {:?}, dropping push connection",
                        heartbeat_window
                    );
                    let _ = write.close().await;
                    return Ok(SessionEnd::HeartbeatLost);
                }
            },
        };

        let Some(msg_result) = msg_result else {
            tracing::debug!("push connection stream ended");
            return Ok(SessionEnd::Closed);
        };

        match msg_result {
            Ok(Message::Text(text)) => {
                let message = match ServerMessage::parse(&text) {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!("unparseable push message: {}", err);
                        continue;
                    }
                };
                match message {
                    ServerMessage::ConnectionAck { payload } => {
                        if let Some(ms) =
                            payload.and_then(|p| p.connection_timeout_ms)
                        {
                            heartbeat_window = Duration::from_millis(ms);
                        }
                        write
                            .send(Message::Text(
                                ClientMessage::Start {
                                    id: subscription_id,
                                    payload: SubscribePayload {
                                        receiver: account_id.clone(),
                                        authorization: token.clone(),
                                    },
                                }
                                .encode()?,
                            ))
                            .await?;
                        let _ = state_tx.send(ConnectionState::Connected);
                        tracing::info!(account = %account_id, "push subscription active");
                    }
                    ServerMessage::Ka => {}
                    ServerMessage::Data { payload, .. } => {
                        reconciler.apply_delta(
                            &payload.device_id,
                            &payload.attributes,
                            payload.timestamp,
                            UpdateSource::Push,
                        );
                    }
                    ServerMessage::Error { payload } => {
                        tracing::warn!("push subscription error: {:?}", payload);
                    }
                    ServerMessage::Complete { .. } => {}
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("push connection closed by server");
                return Ok(SessionEnd::Closed);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!("push connection error: {}", err);
                return Ok(SessionEnd::Closed);
            }
        }
    }
}
