//! Single-flight access token refresh.
//!
//! When several in-flight requests are rejected with 401 at the same time,
//! only the first one refreshes. The others attach to its in-flight handle
//! and retry with whatever it produced. A request whose 401 arrives after a
//! refresh already replaced its token skips refreshing and retries with the
//! current token.
//!
//! The refresh itself runs on its own task. Cancelling the caller that
//! started it does not cancel it.

use crate::session::store::SessionStore;
use crate::TollgateError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Where the client session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// An access token is available.
    Authenticated,
    /// A refresh is in flight; 401-rejected callers wait for it.
    Refreshing,
    /// No access token; the user must sign in.
    Unauthenticated,
}

/// Result of one refresh attempt, shared with every waiter.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New access token, already written to the session store.
    Refreshed(String),
    /// Server refused the refresh token; the session has been cleared.
    Rejected(String),
    /// Refresh endpoint unreachable; the session is untouched.
    Unreachable(String),
}

impl RefreshOutcome {
    fn into_result(self) -> Result<String, TollgateError> {
        match self {
            RefreshOutcome::Refreshed(token) => Ok(token),
            RefreshOutcome::Rejected(reason) => Err(TollgateError::Authentication(reason)),
            RefreshOutcome::Unreachable(reason) => Err(TollgateError::Network(reason)),
        }
    }
}

type OutcomeSlot = Option<RefreshOutcome>;

enum RefreshState {
    Idle,
    InFlight(watch::Receiver<OutcomeSlot>),
}

enum Role {
    Leader(watch::Sender<OutcomeSlot>),
    Follower(watch::Receiver<OutcomeSlot>),
    AlreadyRefreshed(String),
}

/// Owns the shared in-flight refresh handle.
pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
    refreshes: AtomicU64,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    /// Coordinator with no refresh in flight.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::Idle)),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock(), RefreshState::InFlight(_))
    }

    /// Session phase derived from the store and the in-flight state.
    pub fn phase(&self, session: &SessionStore) -> SessionPhase {
        if self.is_refreshing() {
            SessionPhase::Refreshing
        } else if session.is_authenticated() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        }
    }

    /// Number of refreshes actually started.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Obtain a usable access token after a request carrying `stale` got a 401.
    ///
    /// `perform` runs only if no refresh is in flight and the session still
    /// holds `stale`. Its future runs on a spawned task and must update the
    /// session store before resolving, so the refresh completes even when
    /// every caller waiting on it is dropped.
    pub async fn refresh_after<F, Fut>(
        &self,
        session: &SessionStore,
        stale: Option<&str>,
        perform: F,
    ) -> Result<String, TollgateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let role = {
            let mut state = self.lock();
            let in_flight = match &*state {
                RefreshState::InFlight(rx) => Some(rx.clone()),
                RefreshState::Idle => None,
            };
            match in_flight {
                Some(rx) => Role::Follower(rx),
                None => match session.access_credential() {
                    Some(current) if stale != Some(current.as_str()) => {
                        Role::AlreadyRefreshed(current)
                    }
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        *state = RefreshState::InFlight(rx);
                        Role::Leader(tx)
                    }
                },
            }
        };

        match role {
            Role::AlreadyRefreshed(token) => Ok(token),
            Role::Follower(rx) => {
                tracing::debug!("attaching to in-flight token refresh");
                wait_for_outcome(rx).await
            }
            Role::Leader(tx) => {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                let rx = tx.subscribe();
                let flight = Flight {
                    state: Arc::clone(&self.state),
                    tx: Some(tx),
                };
                let refresh = perform();
                tokio::spawn(async move {
                    let outcome = refresh.await;
                    flight.finish(outcome);
                });
                wait_for_outcome(rx).await
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        lock_state(&self.state)
    }
}

fn lock_state(state: &Mutex<RefreshState>) -> std::sync::MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

async fn wait_for_outcome(mut rx: watch::Receiver<OutcomeSlot>) -> Result<String, TollgateError> {
    let outcome = {
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TollgateError::Network("token refresh was abandoned".to_string()))?;
        slot.clone()
    };
    match outcome {
        Some(outcome) => outcome.into_result(),
        None => Err(TollgateError::Network("token refresh was abandoned".to_string())),
    }
}

/// The refresh task's hold on the in-flight state. Finishing returns the
/// coordinator to idle before publishing the outcome. Dropping it unfinished
/// (the task panicked or the runtime shut down) also returns to idle, and
/// waiters then observe a closed channel.
struct Flight {
    state: Arc<Mutex<RefreshState>>,
    tx: Option<watch::Sender<OutcomeSlot>>,
}

impl Flight {
    fn finish(mut self, outcome: RefreshOutcome) {
        if let Some(tx) = self.tx.take() {
            *lock_state(&self.state) = RefreshState::Idle;
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            *lock_state(&self.state) = RefreshState::Idle;
            drop(tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn authenticated_store(access: &str) -> Arc<SessionStore> {
        let store = Arc::new(SessionStore::in_memory());
        store
            .set_credentials(access, Some("refresh-1".to_string()))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn single_caller_refreshes_once() {
        let store = authenticated_store("stale");
        let coordinator = RefreshCoordinator::new();

        let refresh_store = store.clone();
        let token = coordinator
            .refresh_after(&store, Some("stale"), move || async move {
                refresh_store.set_credentials("fresh", None).unwrap();
                RefreshOutcome::Refreshed("fresh".to_string())
            })
            .await
            .unwrap();

        assert_eq!(token, "fresh");
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let store = authenticated_store("stale");
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                let refresh_store = store.clone();
                coordinator
                    .refresh_after(&store, Some("stale"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        refresh_store.set_credentials("fresh", None).unwrap();
                        RefreshOutcome::Refreshed("fresh".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "fresh");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.refresh_count(), 1);
    }

    #[tokio::test]
    async fn late_caller_reuses_already_refreshed_token() {
        let store = authenticated_store("fresh");
        let coordinator = RefreshCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let token = coordinator
            .refresh_after(&store, Some("stale"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                RefreshOutcome::Refreshed("newer".to_string())
            })
            .await
            .unwrap();

        assert_eq!(token, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.refresh_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rejection_is_shared_by_waiters() {
        let store = authenticated_store("stale");
        let coordinator = Arc::new(RefreshCoordinator::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                let refresh_store = store.clone();
                coordinator
                    .refresh_after(&store, Some("stale"), move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        refresh_store.clear().unwrap();
                        RefreshOutcome::Rejected("refresh token revoked".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(TollgateError::Authentication(_))
            ));
        }
        assert_eq!(coordinator.phase(&store), SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn unreachable_refresh_is_network_error() {
        let store = authenticated_store("stale");
        let coordinator = RefreshCoordinator::new();

        let result = coordinator
            .refresh_after(&store, Some("stale"), || async {
                RefreshOutcome::Unreachable("connection refused".to_string())
            })
            .await;

        assert!(matches!(result, Err(TollgateError::Network(_))));
        assert_eq!(store.access_credential().as_deref(), Some("stale"));
        assert_eq!(coordinator.phase(&store), SessionPhase::Authenticated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_leader_does_not_abandon_refresh() {
        let store = authenticated_store("stale");
        let coordinator = Arc::new(RefreshCoordinator::new());

        let leader = {
            let store = store.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let refresh_store = store.clone();
                coordinator
                    .refresh_after(&store, Some("stale"), move || async move {
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        refresh_store.set_credentials("fresh", None).unwrap();
                        RefreshOutcome::Refreshed("fresh".to_string())
                    })
                    .await
            })
        };

        while !coordinator.is_refreshing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let follower = {
            let store = store.clone();
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .refresh_after(&store, Some("stale"), || async {
                        RefreshOutcome::Refreshed("unused".to_string())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        let result = follower.await.unwrap();
        assert_eq!(result.unwrap(), "fresh");
        assert_eq!(store.access_credential().as_deref(), Some("fresh"));
        assert_eq!(coordinator.refresh_count(), 1);
        assert!(!coordinator.is_refreshing());
    }

    async fn dying_refresh() -> RefreshOutcome {
        panic!("refresh task died")
    }

    #[tokio::test]
    async fn dropped_refresh_task_releases_waiters() {
        let store = authenticated_store("stale");
        let coordinator = RefreshCoordinator::new();

        let result = coordinator
            .refresh_after(&store, Some("stale"), dying_refresh)
            .await;

        assert!(matches!(result, Err(TollgateError::Network(_))));
        assert!(!coordinator.is_refreshing());
        assert_eq!(store.access_credential().as_deref(), Some("stale"));
    }
}
