use crate::error::{HarviaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Authenticated session with the MyHarvia cloud
///
/// Owned exclusively by [`CredentialManager`]; mutated only by renewal.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    /// Account identifier the device subscription is scoped to
    pub account_id: String,
}

/// Cloud authentication boundary: issues and renews sessions
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange email/password for a fresh session
    async fn login(&self, email: &str, password: &str) -> Result<Session>;

    /// Exchange a refresh token for a renewed session
    ///
    /// An expired or revoked refresh token fails with
    /// [`HarviaError::ReauthRequired`].
    async fn renew(&self, refresh_token: &str) -> Result<Session>;
}

/// Owns the session and keeps its access token valid
///
/// Renewal is serialized: the session lock is held across the renewal
/// call, so concurrent callers during an in-flight renewal await its
/// single result instead of issuing duplicate requests.
pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    refresh_margin: Duration,
    session: Mutex<Option<Session>>,
    /// Bumped on every successful authentication; the push channel waits
    /// on this while re-authentication is pending
    generation_tx: watch::Sender<u64>,
}

impl CredentialManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, refresh_margin: Duration) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            endpoint,
            refresh_margin,
            session: Mutex::new(None),
            generation_tx,
        }
    }

    /// Authenticate with email and password, replacing any prior session
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.endpoint.login(email, password).await?;
        tracing::info!(account = %session.account_id, "authenticated with cloud");

        *self.session.lock().await = Some(session.clone());
        self.generation_tx.send_modify(|g| *g += 1);
        Ok(session)
    }

    /// Get a valid access token, transparently renewing when the cached
    /// token's expiry is within the safety margin
    pub async fn valid_token(&self) -> Result<String> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(HarviaError::ReauthRequired)?;

        let remaining = session
            .expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if remaining > self.refresh_margin {
            return Ok(session.access_token.clone());
        }

        tracing::debug!(account = %session.account_id, "access token near expiry, renewing");
        match self.endpoint.renew(&session.refresh_token).await {
            Ok(renewed) => {
                let token = renewed.access_token.clone();
                *session = renewed;
                Ok(token)
            }
            Err(HarviaError::ReauthRequired) | Err(HarviaError::InvalidCredentials) => {
                tracing::warn!("refresh token rejected, re-authentication required");
                *guard = None;
                Err(HarviaError::ReauthRequired)
            }
            // Transient failure: keep the session so the next caller retries
            Err(err) => Err(err),
        }
    }

    /// Account identifier of the current session
    pub async fn account_id(&self) -> Result<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.account_id.clone())
            .ok_or(HarviaError::ReauthRequired)
    }

    /// Drop the session; subsequent token requests fail with
    /// [`HarviaError::ReauthRequired`] until `authenticate` succeeds again
    pub async fn invalidate(&self) {
        *self.session.lock().await = None;
    }

    /// Watch for successful authentications (value bumps per session)
    pub fn session_watch(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEndpoint {
        login_calls: AtomicUsize,
        renew_calls: AtomicUsize,
        refresh_valid: bool,
    }

    impl FakeEndpoint {
        fn new(refresh_valid: bool) -> Arc<Self> {
            Arc::new(Self {
                login_calls: AtomicUsize::new(0),
                renew_calls: AtomicUsize::new(0),
                refresh_valid,
            })
        }

        fn session(token: &str, expires_in: chrono::Duration) -> Session {
            Session {
                access_token: token.to_string(),
                refresh_token: "refresh-1".to_string(),
                expires_at: Utc::now() + expires_in,
                account_id: "org-1".to_string(),
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn login(&self, _email: &str, password: &str) -> Result<Session> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            if password == "wrong" {
                return Err(HarviaError::InvalidCredentials);
            }
            Ok(Self::session("access-1", chrono::Duration::seconds(30)))
        }

        async fn renew(&self, _refresh_token: &str) -> Result<Session> {
            self.renew_calls.fetch_add(1, Ordering::SeqCst);
            if !self.refresh_valid {
                return Err(HarviaError::ReauthRequired);
            }
            // Hold the renewal in flight long enough for a second caller
            // to pile up behind the session lock
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok(Self::session("access-2", chrono::Duration::hours(1)))
        }
    }

    fn manager(endpoint: Arc<FakeEndpoint>) -> CredentialManager {
        CredentialManager::new(endpoint, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn token_before_authentication_requires_reauth() {
        let mgr = manager(FakeEndpoint::new(true));
        assert!(matches!(
            mgr.valid_token().await,
            Err(HarviaError::ReauthRequired)
        ));
    }

    #[tokio::test]
    async fn bad_password_surfaces_invalid_credentials() {
        let mgr = manager(FakeEndpoint::new(true));
        assert!(matches!(
            mgr.authenticate("a@b.c", "wrong").await,
            Err(HarviaError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_renewal() {
        let endpoint = FakeEndpoint::new(true);
        let mgr = manager(endpoint.clone());
        // Cached token expires in 30s, below the 60s margin
        mgr.authenticate("a@b.c", "pw").await.unwrap();

        let (a, b) = tokio::join!(mgr.valid_token(), mgr.valid_token());
        assert_eq!(a.unwrap(), "access-2");
        assert_eq!(b.unwrap(), "access-2");
        assert_eq!(endpoint.renew_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_refresh_token_clears_session() {
        let endpoint = FakeEndpoint::new(false);
        let mgr = manager(endpoint.clone());
        mgr.authenticate("a@b.c", "pw").await.unwrap();

        assert!(matches!(
            mgr.valid_token().await,
            Err(HarviaError::ReauthRequired)
        ));
        // Session is gone, not retried against the endpoint again
        assert!(matches!(
            mgr.valid_token().await,
            Err(HarviaError::ReauthRequired)
        ));
        assert_eq!(endpoint.renew_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_reauth() {
        let mgr = manager(FakeEndpoint::new(true));
        mgr.authenticate("a@b.c", "pw").await.unwrap();
        mgr.invalidate().await;
        assert!(matches!(
            mgr.valid_token().await,
            Err(HarviaError::ReauthRequired)
        ));
    }

    #[tokio::test]
    async fn session_watch_bumps_on_authenticate() {
        let mgr = manager(FakeEndpoint::new(true));
        let rx = mgr.session_watch();
        assert_eq!(*rx.borrow(), 0);
        mgr.authenticate("a@b.c", "pw").await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
