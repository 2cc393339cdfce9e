use crate::api::{CloudApiClient, DeviceGateway};
use crate::auth::{CredentialManager, Session, TokenEndpoint};
use crate::command::{CommandDispatcher, CommandId};
use crate::config::EngineConfig;
use crate::error::{HarviaError, Result};
use crate::hub::{StateReceiver, SubscriptionHub};
use crate::poll::PollClient;
use crate::push::{ConnectionState, PushChannel};
use crate::reconciler::Reconciler;
use crate::types::{AttributeValue, DeviceId, DeviceState};
use std::sync::Arc;
use tokio::sync::watch;

/// Top-level handle over the whole synchronization stack
///
/// Owns the credential manager, the push channel, the polling loop, the
/// reconciler and the command dispatcher; consumers only ever talk to this
/// type. Dropping the engine (or calling [`shutdown`](Self::shutdown))
/// stops all background tasks.
pub struct SaunaEngine {
    credentials: Arc<CredentialManager>,
    reconciler: Arc<Reconciler>,
    hub: SubscriptionHub,
    push: PushChannel,
    poll: PollClient,
    dispatcher: CommandDispatcher,
    shut_down: bool,
}

impl SaunaEngine {
    /// Authenticate against the cloud, discover devices and start the
    /// background machinery
    ///
    /// Returns once the device list is seeded; the push channel keeps
    /// connecting in the background and its progress is observable via
    /// [`connection_watch`](Self::connection_watch).
    pub async fn connect(config: EngineConfig, email: &str, password: &str) -> Result<Self> {
        let api = Arc::new(CloudApiClient::new(config.base_url.clone()));
        let endpoint: Arc<dyn TokenEndpoint> = api.clone();
        let gateway: Arc<dyn DeviceGateway> = api;
        Self::assemble(config, endpoint, gateway, email, password).await
    }

    /// Wire the components together; split out so tests can inject fakes
    pub(crate) async fn assemble(
        config: EngineConfig,
        endpoint: Arc<dyn TokenEndpoint>,
        gateway: Arc<dyn DeviceGateway>,
        email: &str,
        password: &str,
    ) -> Result<Self> {
        let credentials = Arc::new(CredentialManager::new(
            endpoint,
            config.token_refresh_margin,
        ));
        credentials.authenticate(email, password).await?;

        let reconciler = Arc::new(Reconciler::new(
            config.staleness_window,
            config.heater_power_watts,
        ));
        let hub = SubscriptionHub::new(reconciler.clone());

        // Seed synchronously so the caller starts with a populated device
        // list, then let push and poll keep it current
        let poll = PollClient::start(
            &config,
            gateway.clone(),
            credentials.clone(),
            reconciler.clone(),
        );
        poll.core().seed().await?;

        let push = PushChannel::start(config.clone(), credentials.clone(), reconciler.clone());

        let dispatcher = CommandDispatcher::start(
            gateway,
            credentials.clone(),
            reconciler.clone(),
            poll.core(),
            config.command_timeout,
        );

        Ok(Self {
            credentials,
            reconciler,
            hub,
            push,
            poll,
            dispatcher,
            shut_down: false,
        })
    }

    /// Subscribe to state changes of one device
    pub fn subscribe(&self, device_id: impl Into<DeviceId>) -> StateReceiver {
        self.hub.subscribe(device_id)
    }

    /// Subscribe to state changes of every device, including discoveries
    pub fn subscribe_all(&self) -> StateReceiver {
        self.hub.subscribe_all()
    }

    /// Snapshot of one device's canonical state
    pub fn current_state(&self, device_id: &str) -> Option<DeviceState> {
        self.reconciler.current_state(device_id)
    }

    /// Ids of all devices discovered on the account
    pub fn devices(&self) -> Vec<DeviceId> {
        self.reconciler.device_ids()
    }

    /// Submit a state change for one attribute of one device
    ///
    /// The change is visible locally right away and confirmed (or rolled
    /// back) in the background once the cloud echoes it.
    pub async fn submit(
        &self,
        device_id: &str,
        attribute: &str,
        value: AttributeValue,
    ) -> Result<CommandId> {
        if self.shut_down {
            return Err(HarviaError::Shutdown);
        }
        self.dispatcher.submit(device_id, attribute, value).await
    }

    /// Fetch one device's full state immediately, outside the poll schedule
    pub async fn refresh(&self, device_id: &str) -> Result<()> {
        if self.shut_down {
            return Err(HarviaError::Shutdown);
        }
        self.poll.force_refresh(device_id).await
    }

    /// Current push channel state
    pub fn connection_state(&self) -> ConnectionState {
        self.push.state()
    }

    /// Watch push channel state transitions
    ///
    /// `Reauthenticating` means the stored session died and operations will
    /// fail with [`crate::HarviaError::ReauthRequired`] until
    /// [`reauthenticate`](Self::reauthenticate) succeeds.
    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.push.state_watch()
    }

    /// Establish a fresh session after a `ReauthRequired` failure
    ///
    /// On success the push channel leaves `Reauthenticating` and reconnects
    /// on its own.
    pub async fn reauthenticate(&self, email: &str, password: &str) -> Result<Session> {
        self.credentials.authenticate(email, password).await
    }

    /// Stop every background task; safe to call more than once
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.dispatcher.shutdown();
        self.push.shutdown().await;
        self.poll.shutdown().await;
        self.credentials.invalidate().await;
        tracing::info!("engine stopped");
    }

    #[cfg(test)]
    pub(crate) fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler.clone()
    }
}
