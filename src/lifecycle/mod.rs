//! Credential lifecycle: load, serve, refresh, persist.
//!
//! [`LifecycleManager`] is the only piece the rest of the process talks to,
//! usually through the [`TokenSource`] trait.
//!
//! Refreshes are coalesced: the first caller that finds the token inside the
//! refresh window spawns one refresh task and parks a shared handle to it in
//! `in_flight`. Everyone else awaits that same handle. The task runs to
//! completion even if every caller goes away, and each issuer call inside it
//! is bounded by `refresh_timeout`.

mod error;
mod state;


pub use error::LifecycleError;
pub use state::{LifecycleState, StateTransition};

use crate::config::LifecycleConfig;
use crate::credential::{Credential, TokenGrant};
use crate::issuer::{IssuerError, TokenIssuer};
use crate::store::CredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use state::backoff_delay;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pending transitions kept for slow subscribers
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<Credential>, LifecycleError>>>;

/// What the rest of the process needs from the credential subsystem.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid access token, refreshing first if needed.
    async fn bearer_token(&self) -> Result<String, LifecycleError>;

    fn is_authenticated(&self) -> bool;
}

#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CredentialStore>,
    issuer: Arc<dyn TokenIssuer>,
    config: LifecycleConfig,
    state: RwLock<LifecycleState>,
    credential: RwLock<Option<Arc<Credential>>>,
    in_flight: Mutex<Option<SharedRefresh>>,
    transitions: broadcast::Sender<StateTransition>,
    /// Last refresh produced a credential the store could not write
    persist_pending: AtomicBool,
    /// No refresh attempt before this instant after a failed cycle
    cooldown_until: Mutex<Option<Instant>>,
}

enum Cached {
    Usable(String),
    NeedsRefresh,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<CredentialStore>,
        issuer: Arc<dyn TokenIssuer>,
        config: LifecycleConfig,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                store,
                issuer,
                config,
                state: RwLock::new(LifecycleState::Unauthenticated),
                credential: RwLock::new(None),
                in_flight: Mutex::new(None),
                transitions,
                persist_pending: AtomicBool::new(false),
                cooldown_until: Mutex::new(None),
            }),
        }
    }

    /// Loads stored credentials.
    ///
    /// An absent file leaves the manager `Unauthenticated`. A legacy file or
    /// one that fails to decrypt is returned as an error; the process must
    /// not start serving on top of it.
    pub fn initialize(&self) -> Result<LifecycleState, LifecycleError> {
        match self.inner.store.load() {
            Ok(Some(credential)) => {
                debug!(expires_at = %credential.expires_at, "Loaded stored credential");
                self.inner.set_credential(credential);
                self.inner.transition(LifecycleState::Authenticated, "stored credential loaded");
            }
            Ok(None) => {
                info!(path = %self.inner.store.path().display(), "No stored credentials; authorization required");
            }
            Err(e) => {
                error!(error = %e, "Failed to load stored credentials");
                return Err(e.into());
            }
        }
        Ok(self.state())
    }

    /// Runs the issuer's interactive flow and stores the result. Works from
    /// any state, including `TokensRevoked`.
    ///
    /// Refuses to run when the existing file cannot be read back: a legacy
    /// file must go through `migrate_legacy`, and an undecryptable one must
    /// be moved aside by the operator. Neither is overwritten here.
    pub async fn authorize(&self) -> Result<(), LifecycleError> {
        if let Err(e) = self.inner.store.load() {
            error!(error = %e, "Existing credential file is unreadable; refusing to overwrite it");
            return Err(e.into());
        }

        let grant = self
            .inner
            .issuer
            .initial_authorize()
            .await
            .map_err(|e| LifecycleError::Authorization(e.to_string()))?;
        let credential = Credential::from_initial_grant(&grant)
            .map_err(|e| LifecycleError::Authorization(e.to_string()))?;

        self.inner.store.save(&credential)?;

        self.inner.set_credential(credential);
        self.inner.persist_pending.store(false, Ordering::SeqCst);
        *lock(&self.inner.cooldown_until) = None;
        self.inner.transition(LifecycleState::Authenticated, "authorized");
        Ok(())
    }

    /// Returns a valid access token.
    ///
    /// Outside the refresh window this is a read of the cached credential.
    /// Inside it, the caller joins the single in-flight refresh.
    pub async fn get_valid_token(&self) -> Result<String, LifecycleError> {
        self.inner.retry_pending_save();

        let refresh = match self.check_cached()? {
            Cached::Usable(token) => return Ok(token),
            Cached::NeedsRefresh => self.join_refresh(),
        };

        match refresh.await {
            Ok(credential) => Ok(credential.access_token.clone()),
            Err(e) => self.fall_back(e),
        }
    }

    /// Pure state read.
    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn state(&self) -> LifecycleState {
        *read(&self.inner.state)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        read(&self.inner.credential).as_ref().map(|c| c.expires_at)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    /// True when the credential is inside the refresh window and the state
    /// allows a refresh attempt.
    pub fn needs_refresh(&self) -> bool {
        if !matches!(
            self.state(),
            LifecycleState::Authenticated | LifecycleState::RefreshFailed | LifecycleState::TokenExpired
        ) {
            return false;
        }
        self.inner
            .current()
            .map(|c| c.expires_within(self.inner.config.refresh_window(), Utc::now()))
            .unwrap_or(false)
    }

    /// Background task that refreshes ahead of expiry.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.config.check_interval();

        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Starting credential refresh loop");
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                if !manager.needs_refresh() {
                    continue;
                }

                match manager.get_valid_token().await {
                    Ok(_) => debug!(state = %manager.state(), "Background refresh check complete"),
                    Err(e) => warn!(error = %e, state = %manager.state(), "Background refresh failed"),
                }
            }
        })
    }

    fn check_cached(&self) -> Result<Cached, LifecycleError> {
        let state = self.state();
        match state {
            LifecycleState::TokensRevoked => return Err(LifecycleError::ReauthorizationRequired),
            LifecycleState::Unauthenticated => return Err(LifecycleError::NotAuthenticated),
            _ => {}
        }

        let credential = self.inner.current().ok_or(LifecycleError::NotAuthenticated)?;
        let now = Utc::now();

        if !credential.expires_within(self.inner.config.refresh_window(), now) {
            return Ok(Cached::Usable(credential.access_token.clone()));
        }

        let failed = matches!(state, LifecycleState::RefreshFailed | LifecycleState::TokenExpired);
        if failed && self.inner.in_cooldown() {
            if credential.is_expired_at(now) {
                self.inner
                    .transition(LifecycleState::TokenExpired, "access token expired during refresh cooldown");
                return Err(LifecycleError::TokenExpired);
            }
            return Ok(Cached::Usable(credential.access_token.clone()));
        }

        Ok(Cached::NeedsRefresh)
    }

    /// Joins the in-flight refresh, or starts one.
    fn join_refresh(&self) -> SharedRefresh {
        let mut slot = lock(&self.inner.in_flight);

        if let Some(existing) = slot.as_ref() {
            debug!("Joining in-flight token refresh");
            return existing.clone();
        }

        // A refresh may have finished between the cached check and taking the
        // lock.
        if let Some(credential) = self.inner.current() {
            if !credential.expires_within(self.inner.config.refresh_window(), Utc::now()) {
                return futures::future::ready(Ok(credential)).boxed().shared();
            }
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run_refresh().await });
        let inner = Arc::clone(&self.inner);
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(inner.fail_task(&e.to_string())),
            }
        }
        .boxed()
        .shared();

        *slot = Some(shared.clone());
        shared
    }

    /// After a failed refresh, a still-valid old token is better than an
    /// error.
    fn fall_back(&self, error: LifecycleError) -> Result<String, LifecycleError> {
        if self.state() == LifecycleState::RefreshFailed {
            if let Some(credential) = self.inner.current() {
                if !credential.is_expired_at(Utc::now()) {
                    warn!(error = %error, "Refresh failed; serving the still-valid access token");
                    return Ok(credential.access_token.clone());
                }
            }
        }
        Err(error)
    }
}

impl Inner {
    async fn run_refresh(self: Arc<Self>) -> Result<Arc<Credential>, LifecycleError> {
        let _slot = InFlightSlot(Arc::clone(&self));

        let current = self.current().ok_or(LifecycleError::NotAuthenticated)?;
        let timeout = self.config.refresh_timeout();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(attempt, "Refreshing access token");

            let result = match tokio::time::timeout(timeout, self.issuer.refresh(&current.refresh_token)).await {
                Ok(result) => result,
                Err(_) => Err(IssuerError::Transient(format!(
                    "refresh timed out after {}s",
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(grant) => return Ok(self.complete_refresh(&current, &grant)),
                Err(IssuerError::InvalidGrant(detail)) => {
                    error!(reason = %detail, "Refresh token rejected by issuer; re-authorization required");
                    self.transition(
                        LifecycleState::TokensRevoked,
                        format!("refresh token rejected: {detail}"),
                    );
                    return Err(LifecycleError::RefreshTerminal(detail));
                }
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    let max_delay = self.config.max_delay();
                    if let Some(hint) = e.retry_after().filter(|hint| *hint > max_delay) {
                        warn!(
                            retry_after_secs = hint.as_secs(),
                            max_delay_secs = max_delay.as_secs(),
                            "Issuer asked to wait longer than the retry limit; giving up this cycle"
                        );
                        return Err(self.fail_refresh(&current, e));
                    }

                    let delay = backoff_delay(
                        attempt,
                        self.config.base_delay(),
                        max_delay,
                        e.retry_after(),
                    );
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Token refresh failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(self.fail_refresh(&current, e)),
            }
        }
    }

    fn complete_refresh(&self, current: &Credential, grant: &TokenGrant) -> Arc<Credential> {
        let updated = Arc::new(current.merge_grant(grant));
        *write(&self.credential) = Some(Arc::clone(&updated));
        *lock(&self.cooldown_until) = None;

        match self.store.save(&updated) {
            Ok(()) => self.persist_pending.store(false, Ordering::SeqCst),
            Err(e) => {
                self.persist_pending.store(true, Ordering::SeqCst);
                error!(error = %e, "Refreshed credential could not be persisted; will retry on next use");
            }
        }

        info!(expires_at = %updated.expires_at, "OAuth token refreshed successfully");
        self.transition(LifecycleState::Authenticated, "token refreshed");
        updated
    }

    fn fail_refresh(&self, current: &Credential, error: IssuerError) -> LifecycleError {
        // An issuer hint longer than the configured cooldown wins
        let cooldown = match error.retry_after() {
            Some(hint) => self.config.failure_cooldown().max(hint),
            None => self.config.failure_cooldown(),
        };
        *lock(&self.cooldown_until) = Some(Instant::now() + cooldown);

        if current.is_expired_at(Utc::now()) {
            self.transition(LifecycleState::TokenExpired, format!("refresh failed after expiry: {error}"));
        } else {
            self.transition(LifecycleState::RefreshFailed, format!("refresh failed: {error}"));
        }

        if error.is_retryable() {
            LifecycleError::RefreshRetryable(error.to_string())
        } else {
            LifecycleError::RefreshTerminal(error.to_string())
        }
    }

    /// The refresh task died without reporting (a panic). Treated like a
    /// failed cycle so the cooldown applies.
    fn fail_task(&self, detail: &str) -> LifecycleError {
        error!(error = %detail, "Refresh task failed");
        match self.current() {
            Some(current) => {
                self.fail_refresh(&current, IssuerError::Transient(format!("refresh task failed: {detail}")))
            }
            None => LifecycleError::Internal(format!("refresh task failed: {detail}")),
        }
    }

    fn retry_pending_save(&self) {
        if !self.persist_pending.load(Ordering::SeqCst) {
            return;
        }
        let Some(credential) = self.current() else {
            return;
        };

        match self.store.save(&credential) {
            Ok(()) => {
                self.persist_pending.store(false, Ordering::SeqCst);
                info!("Pending credential write completed");
            }
            Err(e) => warn!(error = %e, "Credential write still failing"),
        }
    }

    fn in_cooldown(&self) -> bool {
        lock(&self.cooldown_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn current(&self) -> Option<Arc<Credential>> {
        read(&self.credential).clone()
    }

    fn set_credential(&self, credential: Credential) {
        *write(&self.credential) = Some(Arc::new(credential));
    }

    fn transition(&self, to: LifecycleState, reason: impl Into<String>) {
        let from = std::mem::replace(&mut *write(&self.state), to);
        if from == to {
            return;
        }

        let reason = reason.into();
        info!(from = %from, to = %to, reason = %reason, "Credential state changed");
        // No subscribers is fine
        let _ = self.transitions.send(StateTransition {
            from,
            to,
            reason,
            at: Utc::now(),
        });
    }
}

/// Empties `in_flight` when the refresh task ends, panics included.
struct InFlightSlot(Arc<Inner>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        *lock(&self.0.in_flight) = None;
    }
}

#[async_trait]
impl TokenSource for LifecycleManager {
    async fn bearer_token(&self) -> Result<String, LifecycleError> {
        self.get_valid_token().await
    }

    fn is_authenticated(&self) -> bool {
        LifecycleManager::is_authenticated(self)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("expires_at", &self.expires_at())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
