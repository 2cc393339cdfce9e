use crate::types::{
    attr, AttributeRecord, AttributeValue, DeviceId, DeviceState, UpdateSource,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Notification fanned out to the subscription hub after a mutation
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A device not seen before appeared in a delta or snapshot
    DeviceDiscovered { device_id: DeviceId },

    /// One or more attributes of a device changed
    ///
    /// Carries the changed attribute names, not values; subscribers read
    /// the canonical state for current values.
    Changed {
        device_id: DeviceId,
        attributes: Vec<String>,
        source: UpdateSource,
    },
}

struct Inner {
    devices: BTreeMap<DeviceId, DeviceState>,
    /// Timestamp since which each device's heater relay has been on,
    /// for the cumulative energy counter
    heat_on_since: BTreeMap<DeviceId, DateTime<Utc>>,
    energy_kwh: BTreeMap<DeviceId, f64>,
}

/// Merges push deltas and poll snapshots into canonical per-device state
///
/// All mutations go through the single internal lock, one at a time;
/// readers get cloned snapshots. Freshness rules: an update is accepted
/// only if strictly newer than the attribute's current timestamp, with
/// push beating poll on exact ties, and snapshots allowed to re-seed
/// attributes that are unknown or already stale.
pub struct Reconciler {
    inner: Mutex<Inner>,
    events_tx: broadcast::Sender<StateEvent>,
    staleness_window: Duration,
    heater_power_watts: u32,
}

impl Reconciler {
    pub fn new(staleness_window: Duration, heater_power_watts: u32) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner {
                devices: BTreeMap::new(),
                heat_on_since: BTreeMap::new(),
                energy_kwh: BTreeMap::new(),
            }),
            events_tx,
            staleness_window,
            heater_power_watts,
        }
    }

    /// Subscribe to state events (used by the hub and the dispatcher)
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.events_tx.subscribe()
    }

    /// Snapshot of one device's canonical state
    pub fn current_state(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.lock().unwrap().devices.get(device_id).cloned()
    }

    /// All known device ids
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.lock().unwrap().devices.keys().cloned().collect()
    }

    /// Register a device from the device tree before any state arrives
    pub fn register_device(&self, device_id: &str, display_name: &str) {
        let mut discovered = false;
        let mut renamed = false;
        {
            let mut inner = self.inner.lock().unwrap();
            let state = inner
                .devices
                .entry(device_id.to_string())
                .or_insert_with(|| {
                    discovered = true;
                    DeviceState::new(device_id.to_string(), Utc::now())
                });
            if state.display_name != display_name {
                state.display_name = display_name.to_string();
                renamed = !discovered;
            }
        }
        if discovered {
            self.notify(StateEvent::DeviceDiscovered {
                device_id: device_id.to_string(),
            });
        } else if renamed {
            self.notify(StateEvent::Changed {
                device_id: device_id.to_string(),
                attributes: vec![attr::DISPLAY_NAME.to_string()],
                source: UpdateSource::Poll,
            });
        }
    }

    /// Apply a partial update from the push channel or poll client
    ///
    /// Returns the attribute names that were accepted; stale or duplicate
    /// values are dropped silently (logged at debug only).
    pub fn apply_delta(
        &self,
        device_id: &str,
        attributes: &serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
        source: UpdateSource,
    ) -> Vec<String> {
        self.apply(device_id, None, attributes, timestamp, source, false)
    }

    /// Apply a full-state document from the poll client
    ///
    /// Unlike a delta, a snapshot may re-seed an attribute whose current
    /// value is already stale even when the snapshot is not strictly newer.
    pub fn apply_snapshot(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        attributes: &serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) -> Vec<String> {
        self.apply(
            device_id,
            display_name,
            attributes,
            timestamp,
            UpdateSource::Poll,
            true,
        )
    }

    /// Overwrite an attribute with a locally requested value
    ///
    /// Optimistic writes bypass freshness arbitration (they are local
    /// intent, not wire data); returns the record they replaced so the
    /// dispatcher can roll back on timeout.
    pub fn apply_optimistic(
        &self,
        device_id: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Option<AttributeRecord> {
        let previous = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.devices.get_mut(device_id)?;
            state.attributes.insert(
                attribute.to_string(),
                AttributeRecord {
                    value,
                    updated_at: Utc::now(),
                    source: UpdateSource::Optimistic,
                },
            )
        };
        self.notify(StateEvent::Changed {
            device_id: device_id.to_string(),
            attributes: vec![attribute.to_string()],
            source: UpdateSource::Optimistic,
        });
        previous
    }

    /// Restore the pre-command record for an attribute that is still
    /// optimistic (the command it belonged to timed out unconfirmed)
    ///
    /// A no-op if an authoritative update already replaced the optimistic
    /// value.
    pub fn revert_optimistic(
        &self,
        device_id: &str,
        attribute: &str,
        previous: Option<AttributeRecord>,
    ) {
        let reverted = {
            let mut inner = self.inner.lock().unwrap();
            let Some(state) = inner.devices.get_mut(device_id) else {
                return;
            };
            match state.attributes.get(attribute) {
                Some(record) if record.source == UpdateSource::Optimistic => {
                    match previous {
                        Some(prev) => {
                            state.attributes.insert(attribute.to_string(), prev);
                        }
                        None => {
                            state.attributes.remove(attribute);
                        }
                    }
                    true
                }
                _ => false,
            }
        };
        if reverted {
            tracing::debug!(
                device = device_id,
                attribute,
                "reverted unconfirmed optimistic value"
            );
            self.notify(StateEvent::Changed {
                device_id: device_id.to_string(),
                attributes: vec![attribute.to_string()],
                source: UpdateSource::Poll,
            });
        }
    }

    fn apply(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        attributes: &serde_json::Map<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
        source: UpdateSource,
        is_snapshot: bool,
    ) -> Vec<String> {
        let now = Utc::now();
        let mut discovered = false;
        let mut changed = Vec::new();

        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.devices.contains_key(device_id) {
                inner
                    .devices
                    .insert(device_id.to_string(), DeviceState::new(device_id.to_string(), now));
                discovered = true;
            }

            for (name, raw) in attributes {
                let Some(value) = AttributeValue::from_json(raw) else {
                    continue;
                };
                if self.accept_into(&mut inner, device_id, name, value, timestamp, source, is_snapshot, now)
                {
                    changed.push(name.clone());
                }
            }

            if let Some(name) = display_name {
                if let Some(state) = inner.devices.get_mut(device_id) {
                    if state.display_name != name {
                        state.display_name = name.to_string();
                        changed.push(attr::DISPLAY_NAME.to_string());
                    }
                }
            }
        }

        if discovered {
            tracing::info!(device = device_id, "device discovered");
            self.notify(StateEvent::DeviceDiscovered {
                device_id: device_id.to_string(),
            });
        }
        if !changed.is_empty() {
            self.notify(StateEvent::Changed {
                device_id: device_id.to_string(),
                attributes: changed.clone(),
                source,
            });
        }
        changed
    }

    /// Apply one attribute if the freshness rules allow it
    #[allow(clippy::too_many_arguments)]
    fn accept_into(
        &self,
        inner: &mut Inner,
        device_id: &str,
        name: &str,
        value: AttributeValue,
        timestamp: DateTime<Utc>,
        source: UpdateSource,
        is_snapshot: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(state) = inner.devices.get_mut(device_id) else {
            return false;
        };

        let accepted = match state.attributes.get(name) {
            None => true,
            Some(current) => {
                if timestamp > current.updated_at {
                    true
                } else if timestamp == current.updated_at && source.outranks(current.source) {
                    true
                } else if is_snapshot
                    && !state.attribute_available(name, self.staleness_window, now)
                    && (timestamp != current.updated_at || value != current.value)
                {
                    // Stale attribute: a snapshot may re-seed it, unless it
                    // repeats the exact record already held (a silent device
                    // polls back the same stale document every tick)
                    true
                } else {
                    tracing::debug!(
                        device = device_id,
                        attribute = name,
                        ?source,
                        "stale update ignored"
                    );
                    false
                }
            }
        };
        if !accepted {
            return false;
        }

        if name == attr::HEAT_ON {
            self.track_energy(inner, device_id, &value, timestamp, source);
        }
        if name == attr::STATUS_CODES {
            Self::derive_door_state(inner, device_id, &value, timestamp, source);
        }

        let Some(state) = inner.devices.get_mut(device_id) else {
            return false;
        };
        state.attributes.insert(
            name.to_string(),
            AttributeRecord {
                value,
                updated_at: timestamp,
                source,
            },
        );
        true
    }

    /// Accumulate kWh across heater relay on/off transitions
    fn track_energy(
        &self,
        inner: &mut Inner,
        device_id: &str,
        value: &AttributeValue,
        timestamp: DateTime<Utc>,
        source: UpdateSource,
    ) {
        let Some(heat_on) = value.as_bool() else {
            return;
        };

        if let Some(since) = inner.heat_on_since.get(device_id).copied() {
            let elapsed = timestamp.signed_duration_since(since);
            if elapsed > chrono::Duration::zero() {
                let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
                let kwh = (self.heater_power_watts as f64 / 1000.0) * hours;
                *inner.energy_kwh.entry(device_id.to_string()).or_insert(0.0) += kwh;
            }
        }

        if heat_on {
            inner.heat_on_since.insert(device_id.to_string(), timestamp);
        } else {
            inner.heat_on_since.remove(device_id);
        }

        let total = inner.energy_kwh.get(device_id).copied().unwrap_or(0.0);
        let Some(state) = inner.devices.get_mut(device_id) else {
            return;
        };
        state.attributes.insert(
            attr::ENERGY_KWH.to_string(),
            AttributeRecord {
                value: AttributeValue::Float(total),
                updated_at: timestamp,
                source,
            },
        );
    }

    /// The heater reports the door contact in the second digit of its
    /// status code string: 9 means open
    fn derive_door_state(
        inner: &mut Inner,
        device_id: &str,
        value: &AttributeValue,
        timestamp: DateTime<Utc>,
        source: UpdateSource,
    ) {
        let codes = match value {
            AttributeValue::Text(s) => s.clone(),
            AttributeValue::Int(i) => i.to_string(),
            _ => return,
        };
        let Some(door_open) = codes.chars().nth(1).map(|c| c == '9') else {
            return;
        };

        let Some(state) = inner.devices.get_mut(device_id) else {
            return;
        };
        state.attributes.insert(
            attr::DOOR_OPEN.to_string(),
            AttributeRecord {
                value: AttributeValue::Bool(door_open),
                updated_at: timestamp,
                source,
            },
        );
    }

    fn notify(&self, event: StateEvent) {
        // No receivers is fine (nobody subscribed yet)
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconciler() -> Reconciler {
        Reconciler::new(Duration::from_secs(360), 10_800)
    }

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn temp(state: &DeviceState) -> f64 {
        state.value(attr::TEMPERATURE).unwrap().as_f64().unwrap()
    }

    #[test]
    fn increasing_deltas_end_at_last_value() {
        let r = reconciler();
        let base = Utc::now();
        for (i, t) in [(1, 58.0), (2, 60.0), (3, 62.0)] {
            r.apply_delta(
                "sauna-1",
                &attrs(&[(attr::TEMPERATURE, serde_json::json!(t))]),
                base + chrono::Duration::seconds(i),
                UpdateSource::Push,
            );
        }
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 62.0);
    }

    #[test]
    fn out_of_order_delta_is_rejected_then_newer_poll_wins() {
        let r = reconciler();
        let base = Utc::now();

        // Push delta {temperature: 62.0, ts=100}
        let accepted = r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(62.0))]),
            base + chrono::Duration::seconds(100),
            UpdateSource::Push,
        );
        assert_eq!(accepted, vec![attr::TEMPERATURE.to_string()]);

        // Out-of-order push delta {temperature: 58.0, ts=90}: unchanged
        let accepted = r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(58.0))]),
            base + chrono::Duration::seconds(90),
            UpdateSource::Push,
        );
        assert!(accepted.is_empty());
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 62.0);

        // Poll snapshot {temperature: 65.0, ts=110}: newer timestamp wins
        r.apply_snapshot(
            "sauna-1",
            None,
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(65.0))]),
            base + chrono::Duration::seconds(110),
        );
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 65.0);
    }

    #[test]
    fn duplicate_delta_is_idempotent() {
        let r = reconciler();
        let ts = Utc::now();
        let delta = attrs(&[(attr::TEMPERATURE, serde_json::json!(62.0))]);
        assert!(!r.apply_delta("sauna-1", &delta, ts, UpdateSource::Push).is_empty());
        assert!(r.apply_delta("sauna-1", &delta, ts, UpdateSource::Push).is_empty());
    }

    #[test]
    fn push_beats_poll_on_equal_timestamp() {
        let r = reconciler();
        let ts = Utc::now();

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(60.0))]),
            ts,
            UpdateSource::Poll,
        );
        let accepted = r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(61.0))]),
            ts,
            UpdateSource::Push,
        );
        assert!(!accepted.is_empty());
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 61.0);

        // And the reverse tie loses
        let accepted = r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(59.0))]),
            ts,
            UpdateSource::Poll,
        );
        assert!(accepted.is_empty());
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 61.0);
    }

    #[test]
    fn snapshot_reseeds_stale_attribute() {
        let r = reconciler();
        let long_ago = Utc::now() - chrono::Duration::hours(2);

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(80.0))]),
            long_ago,
            UpdateSource::Push,
        );

        // Snapshot with an even older timestamp still lands because the
        // current value is past the staleness window
        let accepted = r.apply_snapshot(
            "sauna-1",
            None,
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(21.0))]),
            long_ago - chrono::Duration::minutes(1),
        );
        assert!(!accepted.is_empty());
        assert_eq!(temp(&r.current_state("sauna-1").unwrap()), 21.0);
    }

    #[test]
    fn identical_stale_snapshot_is_not_reaccepted() {
        let r = reconciler();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let doc = attrs(&[(attr::TEMPERATURE, serde_json::json!(80.0))]);

        assert!(!r.apply_snapshot("sauna-1", None, &doc, long_ago).is_empty());

        // A silent device polls back the same stale document every tick;
        // repeating it must not churn out change notifications
        assert!(r.apply_snapshot("sauna-1", None, &doc, long_ago).is_empty());
        assert!(r.apply_snapshot("sauna-1", None, &doc, long_ago).is_empty());

        // A stale snapshot with a different value still re-seeds
        let newer_doc = attrs(&[(attr::TEMPERATURE, serde_json::json!(21.0))]);
        assert!(!r.apply_snapshot("sauna-1", None, &newer_doc, long_ago).is_empty());
    }

    #[tokio::test]
    async fn snapshot_rename_notifies_subscribers() {
        let r = reconciler();
        let base = Utc::now();
        r.apply_snapshot(
            "sauna-1",
            Some("Home Sauna"),
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(62.0))]),
            base,
        );
        let mut events = r.subscribe_events();

        let changed = r.apply_snapshot(
            "sauna-1",
            Some("Cabin Sauna"),
            &attrs(&[]),
            base + chrono::Duration::seconds(1),
        );
        assert_eq!(changed, vec![attr::DISPLAY_NAME.to_string()]);
        match events.recv().await.unwrap() {
            StateEvent::Changed { attributes, .. } => {
                assert_eq!(attributes, vec![attr::DISPLAY_NAME.to_string()]);
            }
            other => panic!("expected change, got {:?}", other),
        }
        assert_eq!(
            r.current_state("sauna-1").unwrap().display_name,
            "Cabin Sauna"
        );

        // Same name again is quiet
        let changed = r.apply_snapshot(
            "sauna-1",
            Some("Cabin Sauna"),
            &attrs(&[]),
            base + chrono::Duration::seconds(2),
        );
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn reregistration_rename_notifies_subscribers() {
        let r = reconciler();
        r.register_device("sauna-1", "Home Sauna");
        let mut events = r.subscribe_events();

        r.register_device("sauna-1", "Garden Sauna");
        match events.recv().await.unwrap() {
            StateEvent::Changed { attributes, .. } => {
                assert_eq!(attributes, vec![attr::DISPLAY_NAME.to_string()]);
            }
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[test]
    fn stale_delta_never_reseeds() {
        let r = reconciler();
        let long_ago = Utc::now() - chrono::Duration::hours(2);

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(80.0))]),
            long_ago,
            UpdateSource::Push,
        );
        let accepted = r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TEMPERATURE, serde_json::json!(21.0))]),
            long_ago - chrono::Duration::minutes(1),
            UpdateSource::Push,
        );
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn unknown_device_triggers_discovery_event() {
        let r = reconciler();
        let mut events = r.subscribe_events();

        r.apply_delta(
            "sauna-9",
            &attrs(&[(attr::LIGHT, serde_json::json!(1))]),
            Utc::now(),
            UpdateSource::Push,
        );

        match events.recv().await.unwrap() {
            StateEvent::DeviceDiscovered { device_id } => assert_eq!(device_id, "sauna-9"),
            other => panic!("expected discovery, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            StateEvent::Changed { attributes, source, .. } => {
                assert_eq!(attributes, vec![attr::LIGHT.to_string()]);
                assert_eq!(source, UpdateSource::Push);
            }
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[test]
    fn door_state_derived_from_status_codes() {
        let r = reconciler();
        let ts = Utc::now();

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::STATUS_CODES, serde_json::json!("19000"))]),
            ts,
            UpdateSource::Push,
        );
        let state = r.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::DOOR_OPEN).unwrap().as_bool(), Some(true));

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::STATUS_CODES, serde_json::json!("10000"))]),
            ts + chrono::Duration::seconds(1),
            UpdateSource::Push,
        );
        let state = r.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::DOOR_OPEN).unwrap().as_bool(), Some(false));
    }

    #[test]
    fn energy_accumulates_over_heating_interval() {
        let r = reconciler();
        let base = Utc::now();

        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::HEAT_ON, serde_json::json!(1))]),
            base,
            UpdateSource::Push,
        );
        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::HEAT_ON, serde_json::json!(0))]),
            base + chrono::Duration::hours(1),
            UpdateSource::Push,
        );

        let state = r.current_state("sauna-1").unwrap();
        let kwh = state.value(attr::ENERGY_KWH).unwrap().as_f64().unwrap();
        assert!((kwh - 10.8).abs() < 1e-6, "got {kwh}");
    }

    #[test]
    fn optimistic_apply_and_revert() {
        let r = reconciler();
        let ts = Utc::now();
        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TARGET_TEMP, serde_json::json!(65))]),
            ts,
            UpdateSource::Poll,
        );

        let previous = r.apply_optimistic("sauna-1", attr::TARGET_TEMP, AttributeValue::Int(70));
        let state = r.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::TARGET_TEMP).unwrap().as_i64(), Some(70));
        assert_eq!(
            state.record(attr::TARGET_TEMP).unwrap().source,
            UpdateSource::Optimistic
        );

        r.revert_optimistic("sauna-1", attr::TARGET_TEMP, previous);
        let state = r.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::TARGET_TEMP).unwrap().as_i64(), Some(65));
        assert_eq!(
            state.record(attr::TARGET_TEMP).unwrap().source,
            UpdateSource::Poll
        );
    }

    #[test]
    fn revert_is_noop_after_authoritative_update() {
        let r = reconciler();
        let ts = Utc::now();
        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TARGET_TEMP, serde_json::json!(65))]),
            ts,
            UpdateSource::Poll,
        );
        let previous = r.apply_optimistic("sauna-1", attr::TARGET_TEMP, AttributeValue::Int(70));

        // Push echo confirms the new value before any revert happens
        r.apply_delta(
            "sauna-1",
            &attrs(&[(attr::TARGET_TEMP, serde_json::json!(70))]),
            Utc::now() + chrono::Duration::seconds(5),
            UpdateSource::Push,
        );
        r.revert_optimistic("sauna-1", attr::TARGET_TEMP, previous);

        let state = r.current_state("sauna-1").unwrap();
        assert_eq!(state.value(attr::TARGET_TEMP).unwrap().as_i64(), Some(70));
        assert_eq!(
            state.record(attr::TARGET_TEMP).unwrap().source,
            UpdateSource::Push
        );
    }
}
