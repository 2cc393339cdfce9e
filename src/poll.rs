use crate::api::DeviceGateway;
use crate::auth::CredentialManager;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::reconciler::Reconciler;
use crate::types::DeviceInfo;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

/// Shared fetch logic used by the scheduled loop and ad hoc refreshes
pub(crate) struct PollCore {
    gateway: Arc<dyn DeviceGateway>,
    credentials: Arc<CredentialManager>,
    reconciler: Arc<Reconciler>,
}

impl PollCore {
    pub(crate) fn new(
        gateway: Arc<dyn DeviceGateway>,
        credentials: Arc<CredentialManager>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            gateway,
            credentials,
            reconciler,
        }
    }

    /// Fetch one device's snapshot and feed both of its documents to the
    /// reconciler, each under its own timestamp
    pub(crate) async fn refresh_device(&self, device_id: &str) -> Result<()> {
        let token = self.credentials.valid_token().await?;
        let snapshot = self.gateway.fetch_state(&token, device_id).await?;

        self.reconciler.apply_snapshot(
            device_id,
            snapshot.display_name.as_deref(),
            &snapshot.reported,
            snapshot.reported_at,
        );
        self.reconciler
            .apply_snapshot(device_id, None, &snapshot.telemetry, snapshot.telemetry_at);
        Ok(())
    }

    /// Discover the account's devices and seed one snapshot per device
    ///
    /// Called once at startup, before the push channel settles. A failed
    /// snapshot leaves the device registered but empty; the next poll
    /// tick retries it.
    pub(crate) async fn seed(&self) -> Result<Vec<DeviceInfo>> {
        let token = self.credentials.valid_token().await?;
        let devices = self.gateway.list_devices(&token).await?;
        tracing::info!("discovered {} device(s)", devices.len());

        for device in &devices {
            self.reconciler
                .register_device(&device.device_id, &device.display_name);
            if let Err(err) = self.refresh_device(&device.device_id).await {
                tracing::warn!(device = %device.device_id, "initial snapshot failed: {}", err);
            }
        }
        Ok(devices)
    }
}

/// Periodic full-state fetches per known device
///
/// Runs on a fixed interval regardless of push channel health, bounding
/// staleness even under silent push failure. Fetch failures are logged
/// and retried on the next tick, never in a tight loop.
pub struct PollClient {
    core: Arc<PollCore>,
    stop_tx: broadcast::Sender<()>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PollClient {
    /// Spawn the polling loop; the first tick fires one full interval
    /// after start (startup seeding has just run)
    pub fn start(
        config: &EngineConfig,
        gateway: Arc<dyn DeviceGateway>,
        credentials: Arc<CredentialManager>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        let core = Arc::new(PollCore::new(gateway, credentials, reconciler.clone()));
        let (stop_tx, mut stop_rx) = broadcast::channel(1);

        let loop_core = core.clone();
        let period = config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        for device_id in reconciler.device_ids() {
                            if let Err(err) = loop_core.refresh_device(&device_id).await {
                                tracing::warn!(device = %device_id, "poll fetch failed: {}", err);
                            }
                        }
                    }
                }
            }
            tracing::debug!("poll loop stopped");
        });

        Self {
            core,
            stop_tx,
            task_handle: Some(handle),
        }
    }

    /// Seed device list and initial snapshots (run before `start`'s first
    /// tick matters)
    pub(crate) fn core(&self) -> Arc<PollCore> {
        self.core.clone()
    }

    /// Fetch one device immediately, outside the schedule
    ///
    /// Used by the command dispatcher after a confirmation timeout.
    pub async fn force_refresh(&self, device_id: &str) -> Result<()> {
        self.core.refresh_device(device_id).await
    }

    /// Stop the scheduled ticks
    pub async fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.task_handle.take() {
            let _ = timeout(Duration::from_millis(500), handle).await;
        }
    }
}
