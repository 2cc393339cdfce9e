use crate::api::DeviceGateway;
use crate::auth::CredentialManager;
use crate::error::{HarviaError, Result};
use crate::poll::PollCore;
use crate::reconciler::{Reconciler, StateEvent};
use crate::types::{
    writable_descriptor, AttributeKind, AttributeRecord, AttributeValue, DeviceId, UpdateSource,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::sleep;
use uuid::Uuid;

/// Identifier of a submitted command
pub type CommandId = Uuid;

/// Bookkeeping for one in-flight command
///
/// At most one per (device, attribute) pair; a newer submit for the same
/// pair supersedes it, which drops `confirm_tx` and thereby cancels its
/// watcher without a revert.
struct PendingCommand {
    command_id: CommandId,
    requested: AttributeValue,
    /// Record the optimistic update replaced, restored on timeout
    previous: Option<AttributeRecord>,
    confirm_tx: oneshot::Sender<()>,
}

type PendingMap = Arc<Mutex<HashMap<(DeviceId, String), PendingCommand>>>;

/// Translates subscriber intents into outbound writes with optimistic
/// local updates
///
/// The write path is request/response (the cloud has no push command
/// channel): the optimistic value stands until a push delta or poll
/// snapshot echoes it back, or the confirmation timeout forces a refresh
/// and reverts to whatever the cloud reports.
pub struct CommandDispatcher {
    gateway: Arc<dyn DeviceGateway>,
    credentials: Arc<CredentialManager>,
    reconciler: Arc<Reconciler>,
    poll: Arc<PollCore>,
    pending: PendingMap,
    command_timeout: Duration,
    stop_tx: broadcast::Sender<()>,
    resolver_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CommandDispatcher {
    /// Create the dispatcher and spawn its confirmation resolver
    pub fn start(
        gateway: Arc<dyn DeviceGateway>,
        credentials: Arc<CredentialManager>,
        reconciler: Arc<Reconciler>,
        poll: Arc<PollCore>,
        command_timeout: Duration,
    ) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, mut stop_rx) = broadcast::channel(1);

        // Watch reconciler acceptances: an authoritative update carrying a
        // pending command's requested value is that command's echo
        let resolver_pending = pending.clone();
        let resolver_reconciler = reconciler.clone();
        let mut events = reconciler.subscribe_events();
        let resolver_handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop_rx.recv() => break,
                    event = events.recv() => event,
                };
                let changed = match event {
                    Ok(StateEvent::Changed {
                        device_id,
                        attributes,
                        source,
                    }) if source != UpdateSource::Optimistic => (device_id, attributes),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let (device_id, attributes) = changed;
                for attribute in attributes {
                    let confirmed = {
                        let mut map = resolver_pending.lock().unwrap();
                        let key = (device_id.clone(), attribute.clone());
                        match map.get(&key) {
                            Some(entry) => {
                                let echoed = resolver_reconciler
                                    .current_state(&device_id)
                                    .and_then(|s| s.value(&attribute).cloned())
                                    .is_some_and(|v| values_match(&v, &entry.requested));
                                if echoed {
                                    map.remove(&key)
                                } else {
                                    None
                                }
                            }
                            None => None,
                        }
                    };
                    if let Some(entry) = confirmed {
                        tracing::debug!(
                            device = %device_id,
                            attribute = %attribute,
                            command = %entry.command_id,
                            "command confirmed by echo"
                        );
                        let _ = entry.confirm_tx.send(());
                    }
                }
            }
        });

        Self {
            gateway,
            credentials,
            reconciler,
            poll,
            pending,
            command_timeout,
            stop_tx,
            resolver_handle: Some(resolver_handle),
        }
    }

    /// Submit a state change for one attribute of one device
    ///
    /// Validates locally, applies the optimistic update so subscribers see
    /// immediate feedback, then sends the write. Returns once the cloud
    /// acknowledges receipt; confirmation continues in the background.
    pub async fn submit(
        &self,
        device_id: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<CommandId> {
        self.validate(device_id, attribute, &value)?;
        let token = self.credentials.valid_token().await?;

        let command_id = Uuid::new_v4();

        // Supersede any outstanding command for this pair: its watcher is
        // cancelled and the original pre-command record carries over
        let superseded = self
            .pending
            .lock()
            .unwrap()
            .remove(&(device_id.to_string(), attribute.to_string()));
        if let Some(ref old) = superseded {
            tracing::debug!(
                device = device_id,
                attribute,
                superseded = %old.command_id,
                "command superseded"
            );
        }

        let replaced = self
            .reconciler
            .apply_optimistic(device_id, attribute, value.clone());
        let previous = match superseded {
            Some(old) => old.previous,
            None => replaced,
        };

        let mut attributes = serde_json::Map::new();
        attributes.insert(attribute.to_string(), value.to_wire());
        if let Err(err) = self.gateway.send_command(&token, device_id, attributes).await {
            // Transmission failed: nothing pending, undo the optimism
            self.reconciler
                .revert_optimistic(device_id, attribute, previous);
            return Err(err);
        }

        let (confirm_tx, confirm_rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            (device_id.to_string(), attribute.to_string()),
            PendingCommand {
                command_id,
                requested: value,
                previous: previous.clone(),
                confirm_tx,
            },
        );

        self.spawn_watcher(
            command_id,
            device_id.to_string(),
            attribute.to_string(),
            previous,
            confirm_rx,
        );

        tracing::info!(device = device_id, attribute, command = %command_id, "command submitted");
        Ok(command_id)
    }

    /// Reject writes that cannot succeed before touching the network
    fn validate(&self, device_id: &str, attribute: &str, value: &AttributeValue) -> Result<()> {
        let Some(state) = self.reconciler.current_state(device_id) else {
            return Err(HarviaError::DeviceUnavailable {
                device_id: device_id.to_string(),
                reason: "unknown device".to_string(),
            });
        };

        let Some(descriptor) = writable_descriptor(attribute) else {
            return Err(HarviaError::DeviceUnavailable {
                device_id: device_id.to_string(),
                reason: format!("attribute {} is not writable", attribute),
            });
        };

        // Partial device support: a device that never reported the
        // attribute does not accept writes to it
        if state.record(attribute).is_none() {
            return Err(HarviaError::DeviceUnavailable {
                device_id: device_id.to_string(),
                reason: format!("attribute {} not supported by this device", attribute),
            });
        }

        match descriptor.kind {
            AttributeKind::Toggle => {
                if value.as_bool().is_none() {
                    return Err(HarviaError::Validation {
                        attribute: attribute.to_string(),
                        reason: "expected an on/off value".to_string(),
                    });
                }
            }
            AttributeKind::Range { min, max } => match value.as_i64() {
                Some(v) if (min..=max).contains(&v) => {}
                Some(v) => {
                    return Err(HarviaError::Validation {
                        attribute: attribute.to_string(),
                        reason: format!("{} outside {}..={}", v, min, max),
                    })
                }
                None => {
                    return Err(HarviaError::Validation {
                        attribute: attribute.to_string(),
                        reason: "expected an integer".to_string(),
                    })
                }
            },
        }
        Ok(())
    }

    /// Per-command watcher: confirmation wins, timeout reverts
    fn spawn_watcher(
        &self,
        command_id: CommandId,
        device_id: String,
        attribute: String,
        previous: Option<AttributeRecord>,
        confirm_rx: oneshot::Receiver<()>,
    ) {
        let pending = self.pending.clone();
        let reconciler = self.reconciler.clone();
        let poll = self.poll.clone();
        let command_timeout = self.command_timeout;

        tokio::spawn(async move {
            tokio::select! {
                result = confirm_rx => {
                    // Ok: echoed. Err: superseded or dispatcher dropped;
                    // either way this watcher owns nothing anymore.
                    if result.is_err() {
                        tracing::debug!(command = %command_id, "command watcher cancelled");
                    }
                }
                _ = sleep(command_timeout) => {
                    let still_ours = {
                        let mut map = pending.lock().unwrap();
                        let key = (device_id.clone(), attribute.clone());
                        match map.get(&key) {
                            Some(entry) if entry.command_id == command_id => {
                                map.remove(&key);
                                true
                            }
                            _ => false,
                        }
                    };
                    if !still_ours {
                        return;
                    }

                    tracing::warn!(
                        device = %device_id,
                        attribute = %attribute,
                        command = %command_id,
                        "no confirmation within {:?}, reverting",
                        command_timeout
                    );
                    // Restore the pre-command record first so the forced
                    // snapshot is free to land, then let it decide whether
                    // the write actually took
                    reconciler.revert_optimistic(&device_id, &attribute, previous);
                    if let Err(err) = poll.refresh_device(&device_id).await {
                        tracing::warn!(device = %device_id, "forced refresh failed: {}", err);
                    }
                }
            }
        });
    }

    /// Number of commands awaiting confirmation
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Cancel the resolver and all outstanding watchers
    pub fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.resolver_handle.take() {
            handle.abort();
        }
        // Dropping the confirm senders cancels every watcher
        self.pending.lock().unwrap().clear();
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Loose equality for echo detection: the cloud echoes toggles as 0/1
/// integers and may widen integers to floats
fn values_match(current: &AttributeValue, requested: &AttributeValue) -> bool {
    if current == requested {
        return true;
    }
    match (current.as_f64(), requested.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (current.as_bool(), requested.as_bool()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}
