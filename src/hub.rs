use crate::error::{HarviaError, Result};
use crate::reconciler::{Reconciler, StateEvent};
use crate::types::{DeviceId, DeviceState, UpdateSource};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Change notification delivered to a subscriber
///
/// Carries the changed attribute names only; read the canonical state via
/// [`SubscriptionHub::current_state`] for values.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub device_id: DeviceId,
    pub attributes: Vec<String>,
    pub source: UpdateSource,
}

/// Fan-out point between the reconciler and consumers
///
/// Notifications are delivered through a broadcast channel, so a slow
/// subscriber lags (and is told so) instead of blocking state updates for
/// other subscribers or the push channel's read loop.
pub struct SubscriptionHub {
    reconciler: Arc<Reconciler>,
}

impl SubscriptionHub {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Subscribe to changes of one device's state
    pub fn subscribe(&self, device_id: impl Into<DeviceId>) -> StateReceiver {
        StateReceiver {
            rx: self.reconciler.subscribe_events(),
            device_id: Some(device_id.into()),
        }
    }

    /// Subscribe to changes of all devices, including discoveries
    pub fn subscribe_all(&self) -> StateReceiver {
        StateReceiver {
            rx: self.reconciler.subscribe_events(),
            device_id: None,
        }
    }

    /// Snapshot of one device's canonical state
    pub fn current_state(&self, device_id: &str) -> Option<DeviceState> {
        self.reconciler.current_state(device_id)
    }

    /// All known device ids
    pub fn devices(&self) -> Vec<DeviceId> {
        self.reconciler.device_ids()
    }
}

/// Receiver for state change notifications
///
/// Delivery order matches the order changes were accepted by the
/// reconciler.
pub struct StateReceiver {
    rx: broadcast::Receiver<StateEvent>,
    /// When set, events for other devices are skipped
    device_id: Option<DeviceId>,
}

impl StateReceiver {
    /// Receive the next change notification
    pub async fn recv(&mut self) -> Result<StateChange> {
        loop {
            let event = self.rx.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => HarviaError::ConnectionClosed,
                broadcast::error::RecvError::Lagged(n) => {
                    HarviaError::ChannelError(format!("Lagged by {} messages", n))
                }
            })?;

            match event {
                StateEvent::Changed {
                    device_id,
                    attributes,
                    source,
                } => {
                    if self
                        .device_id
                        .as_ref()
                        .is_none_or(|wanted| *wanted == device_id)
                    {
                        return Ok(StateChange {
                            device_id,
                            attributes,
                            source,
                        });
                    }
                }
                // Discoveries show up as an empty change on the unfiltered
                // stream so new-device watchers have a hook
                StateEvent::DeviceDiscovered { device_id } => {
                    if self.device_id.is_none() {
                        return Ok(StateChange {
                            device_id,
                            attributes: Vec::new(),
                            source: UpdateSource::Poll,
                        });
                    }
                }
            }
        }
    }

    /// Try to receive a change without blocking
    pub fn try_recv(&mut self) -> Result<Option<StateChange>> {
        loop {
            match self.rx.try_recv() {
                Ok(StateEvent::Changed {
                    device_id,
                    attributes,
                    source,
                }) => {
                    if self
                        .device_id
                        .as_ref()
                        .is_none_or(|wanted| *wanted == device_id)
                    {
                        return Ok(Some(StateChange {
                            device_id,
                            attributes,
                            source,
                        }));
                    }
                }
                Ok(StateEvent::DeviceDiscovered { device_id }) => {
                    if self.device_id.is_none() {
                        return Ok(Some(StateChange {
                            device_id,
                            attributes: Vec::new(),
                            source: UpdateSource::Poll,
                        }));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(HarviaError::ConnectionClosed)
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Err(HarviaError::ChannelError(format!(
                        "Lagged by {} messages",
                        n
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::attr;
    use chrono::Utc;
    use std::time::Duration;

    fn setup() -> (Arc<Reconciler>, SubscriptionHub) {
        let reconciler = Arc::new(Reconciler::new(Duration::from_secs(360), 10_800));
        let hub = SubscriptionHub::new(reconciler.clone());
        (reconciler, hub)
    }

    fn delta(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn subscriber_sees_only_its_device() {
        let (reconciler, hub) = setup();
        let mut rx = hub.subscribe("sauna-1");

        let ts = Utc::now();
        reconciler.apply_delta(
            "sauna-2",
            &delta(&[(attr::LIGHT, serde_json::json!(1))]),
            ts,
            UpdateSource::Push,
        );
        reconciler.apply_delta(
            "sauna-1",
            &delta(&[(attr::TEMPERATURE, serde_json::json!(62))]),
            ts,
            UpdateSource::Push,
        );

        let change = rx.recv().await.unwrap();
        assert_eq!(change.device_id, "sauna-1");
        assert_eq!(change.attributes, vec![attr::TEMPERATURE.to_string()]);
    }

    #[tokio::test]
    async fn changes_arrive_in_acceptance_order() {
        let (reconciler, hub) = setup();
        let mut rx = hub.subscribe("sauna-1");

        let base = Utc::now();
        for (i, value) in [60, 61, 62].iter().enumerate() {
            reconciler.apply_delta(
                "sauna-1",
                &delta(&[(attr::TEMPERATURE, serde_json::json!(value))]),
                base + chrono::Duration::seconds(i as i64 + 1),
                UpdateSource::Push,
            );
        }

        for _ in 0..3 {
            let change = rx.recv().await.unwrap();
            assert_eq!(change.attributes, vec![attr::TEMPERATURE.to_string()]);
        }
        // And the canonical state holds the final value
        let state = hub.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::TEMPERATURE).unwrap().as_i64(), Some(62));
    }

    #[tokio::test]
    async fn unfiltered_stream_reports_discoveries() {
        let (reconciler, hub) = setup();
        let mut rx = hub.subscribe_all();

        reconciler.register_device("sauna-3", "Cabin Sauna");
        let change = rx.recv().await.unwrap();
        assert_eq!(change.device_id, "sauna-3");
        assert!(change.attributes.is_empty());
        assert_eq!(hub.devices(), vec!["sauna-3".to_string()]);
    }
}
