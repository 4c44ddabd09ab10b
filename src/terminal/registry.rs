//! Process-wide table of live terminal sessions on this node.
//!
//! Entries are `Arc<SessionHandle>` in a `DashMap` keyed by session id. The
//! bridge task owning a session is the only one that releases it; everyone
//! else (admin API, shutdown) can only ask it to stop through the handle's
//! cancellation token.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{SessionInfo, SessionState, SshTarget, TermSize};
use crate::error::ClusterError;

fn pack(size: TermSize) -> u32 {
    ((size.rows as u32) << 16) | size.cols as u32
}

fn unpack(packed: u32) -> TermSize {
    TermSize {
        rows: (packed >> 16) as u16,
        cols: (packed & 0xffff) as u16,
    }
}

/// Shared state of one session.
pub struct SessionHandle {
    pub session_id: String,
    pub node_id: String,
    pub target: SshTarget,
    pub created_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds after `started` of the last byte or resize
    last_activity_ms: AtomicU64,
    size: AtomicU32,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionHandle {
    fn new(node_id: &str, target: SshTarget, size: TermSize) -> Self {
        let (state, _) = watch::channel(SessionState::Opening);
        Self {
            session_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            target,
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            size: AtomicU32::new(pack(size)),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Record activity in either direction.
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.started);
        self.last_activity_ms
            .fetch_max(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.started + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }

    pub fn size(&self) -> TermSize {
        unpack(self.size.load(Ordering::Relaxed))
    }

    pub fn set_size(&self, size: TermSize) {
        self.size.store(pack(size), Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session {} {} -> {}", self.session_id, previous, state);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            node_id: self.node_id.clone(),
            target: self.target.clone(),
            state: self.state(),
            size: self.size(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}

pub struct SessionRegistry {
    node_id: String,
    sessions: DashMap<String, Arc<SessionHandle>>,
    released: AtomicU64,
}

impl SessionRegistry {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            sessions: DashMap::new(),
            released: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register a new session in the `Opening` state.
    pub fn create(&self, target: SshTarget, size: TermSize) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(&self.node_id, target, size));
        self.sessions
            .insert(handle.session_id.clone(), Arc::clone(&handle));
        info!(
            "Session {} created for {} ({} active)",
            handle.session_id,
            handle.target,
            self.sessions.len()
        );
        handle
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Snapshots of all sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.iter().map(|e| e.snapshot()).collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        sessions
    }

    /// Ask a session to close. Its bridge task performs the release.
    pub fn terminate(&self, session_id: &str) -> Result<(), ClusterError> {
        let handle = self
            .get(session_id)
            .ok_or_else(|| ClusterError::SessionNotFound(session_id.to_string()))?;
        info!("Terminating session {} ({})", session_id, handle.target);
        handle.cancel.cancel();
        Ok(())
    }

    pub fn terminate_all(&self) -> usize {
        let mut count = 0;
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
            count += 1;
        }
        count
    }

    /// Remove the entry. Returns `true` only for the call that actually removed it.
    pub fn release(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, handle)) => {
                handle.set_state(SessionState::Closed);
                self.released.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Session {} released ({} active)",
                    session_id,
                    self.sessions.len()
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total sessions released since startup.
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 22,
            user: "alice".to_string(),
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_create_get_list() {
            let registry = SessionRegistry::new("s1");
            let a = registry.create(target(), TermSize::default());
            let b = registry.create(target(), TermSize::new(40, 120));

            assert_ne!(a.session_id, b.session_id);
            assert_eq!(Uuid::parse_str(&a.session_id).unwrap().get_version_num(), 4);
            assert_eq!(registry.len(), 2);
            assert_eq!(a.state(), SessionState::Opening);
            assert_eq!(registry.get(&b.session_id).unwrap().size(), TermSize::new(40, 120));

            let listed = registry.list();
            assert_eq!(listed.len(), 2);
            assert!(listed.iter().all(|s| s.node_id == "s1"));
        }

        #[tokio::test]
        async fn test_release_exactly_once() {
            let registry = SessionRegistry::new("s1");
            let handle = registry.create(target(), TermSize::default());
            let mut state = handle.subscribe();

            assert!(registry.release(&handle.session_id));
            assert!(!registry.release(&handle.session_id));
            assert_eq!(registry.released_count(), 1);
            assert!(registry.is_empty());
            assert!(registry.get(&handle.session_id).is_none());

            assert_eq!(*state.borrow_and_update(), SessionState::Closed);
        }

        #[tokio::test]
        async fn test_concurrent_release_counts_once() {
            let registry = Arc::new(SessionRegistry::new("s1"));
            let handle = registry.create(target(), TermSize::default());

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let registry = registry.clone();
                    let id = handle.session_id.clone();
                    tokio::spawn(async move { registry.release(&id) })
                })
                .collect();

            let mut wins = 0;
            for task in tasks {
                if task.await.unwrap() {
                    wins += 1;
                }
            }
            assert_eq!(wins, 1);
            assert_eq!(registry.released_count(), 1);
        }
    }

    mod termination {
        use super::*;

        #[tokio::test]
        async fn test_terminate_cancels_token() {
            let registry = SessionRegistry::new("s1");
            let handle = registry.create(target(), TermSize::default());
            let token = handle.cancel_token();

            registry.terminate(&handle.session_id).unwrap();
            assert!(token.is_cancelled());
            assert!(handle.is_terminated());
            // Still listed until the owning bridge releases it.
            assert_eq!(registry.len(), 1);
        }

        #[tokio::test]
        async fn test_terminate_unknown() {
            let registry = SessionRegistry::new("s1");
            assert_eq!(
                registry.terminate("nope"),
                Err(ClusterError::SessionNotFound("nope".to_string()))
            );
        }

        #[tokio::test]
        async fn test_terminate_all() {
            let registry = SessionRegistry::new("s1");
            let a = registry.create(target(), TermSize::default());
            let b = registry.create(target(), TermSize::default());
            assert_eq!(registry.terminate_all(), 2);
            assert!(a.is_terminated() && b.is_terminated());
        }
    }

    mod activity {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_idle_tracks_last_touch() {
            let registry = SessionRegistry::new("s1");
            let handle = registry.create(target(), TermSize::default());

            tokio::time::advance(Duration::from_secs(10)).await;
            assert_eq!(handle.idle_for(), Duration::from_secs(10));

            handle.touch();
            assert_eq!(handle.idle_for(), Duration::ZERO);

            tokio::time::advance(Duration::from_secs(3)).await;
            assert_eq!(handle.snapshot().idle_secs, 3);
        }

        #[test]
        fn test_size_packing() {
            let size = TermSize::new(65535, 1);
            assert_eq!(unpack(pack(size)), size);
        }
    }
}
