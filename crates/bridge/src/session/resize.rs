//! Resize coalescing.
//!
//! Interactive window resizing produces a storm of resize commands. The
//! coalescer keeps a single pending size per session and applies it once the
//! window has elapsed without a newer request. Every request, including an
//! isolated one, is delayed by the window.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::SessionId;
use tokio::time::Instant;

use super::SessionError;

/// Target of coalesced resizes.
pub trait ResizeApplier: Send + Sync + 'static {
    /// Returns true if the session has a running terminal.
    fn is_live(&self, session_id: &SessionId) -> bool;

    /// Applies a terminal size.
    fn apply_resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct PendingResize {
    cols: u16,
    rows: u16,
    deadline: Instant,
}

/// Per-session debounce of resize requests.
pub struct ResizeCoalescer<A: ResizeApplier> {
    applier: Arc<A>,
    window: Duration,
    pending: Arc<DashMap<SessionId, PendingResize>>,
    applied: Arc<AtomicU64>,
}

impl<A: ResizeApplier> ResizeCoalescer<A> {
    /// Creates a coalescer applying sizes through `applier`.
    pub fn new(applier: Arc<A>, window: Duration) -> Self {
        Self {
            applier,
            window,
            pending: Arc::new(DashMap::new()),
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records a requested size, replacing any pending one.
    ///
    /// Fails with [`SessionError::NotFound`] if the session has no running
    /// terminal at request time.
    pub fn request(&self, session_id: &SessionId, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.applier.is_live(session_id) {
            return Err(SessionError::NotFound(session_id.clone()));
        }

        let deadline = Instant::now() + self.window;
        let arm = match self.pending.entry(session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = PendingResize {
                    cols,
                    rows,
                    deadline,
                };
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingResize {
                    cols,
                    rows,
                    deadline,
                });
                true
            }
        };

        if arm {
            tokio::spawn(run_timer(
                session_id.clone(),
                Arc::clone(&self.pending),
                Arc::clone(&self.applier),
                Arc::clone(&self.applied),
            ));
        }
        Ok(())
    }

    /// Drops any pending resize for the session.
    pub fn cancel(&self, session_id: &SessionId) {
        self.pending.remove(session_id);
    }

    /// Returns true if a resize is waiting for its window to elapse.
    pub fn is_pending(&self, session_id: &SessionId) -> bool {
        self.pending.contains_key(session_id)
    }

    /// Returns the number of resizes applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

async fn run_timer<A: ResizeApplier>(
    session_id: SessionId,
    pending: Arc<DashMap<SessionId, PendingResize>>,
    applier: Arc<A>,
    applied: Arc<AtomicU64>,
) {
    loop {
        let deadline = match pending.get(&session_id) {
            Some(entry) => entry.deadline,
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let ready = pending.remove_if(&session_id, |_, p| p.deadline <= Instant::now());
        if let Some((_, size)) = ready {
            applied.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = applier
                .apply_resize(&session_id, size.cols, size.rows)
                .await
            {
                tracing::debug!(session_id = %session_id, error = %e, "Dropped coalesced resize");
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApplier {
        live: Mutex<Vec<SessionId>>,
        applied: Mutex<Vec<(SessionId, u16, u16)>>,
    }

    impl RecordingApplier {
        fn with_live(ids: &[&str]) -> Arc<Self> {
            let applier = Self::default();
            *applier.live.lock().unwrap() = ids.iter().map(|id| SessionId::from(*id)).collect();
            Arc::new(applier)
        }

        fn applied(&self) -> Vec<(SessionId, u16, u16)> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl ResizeApplier for RecordingApplier {
        fn is_live(&self, session_id: &SessionId) -> bool {
            self.live.lock().unwrap().contains(session_id)
        }

        async fn apply_resize(
            &self,
            session_id: &SessionId,
            cols: u16,
            rows: u16,
        ) -> Result<(), SessionError> {
            self.applied
                .lock()
                .unwrap()
                .push((session_id.clone(), cols, rows));
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_millis(30);

    #[tokio::test(start_paused = true)]
    async fn test_burst_applies_last_size_once() {
        let applier = RecordingApplier::with_live(&["a"]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);
        let id = SessionId::from("a");

        for i in 0..10u16 {
            coalescer.request(&id, 80 + i, 24 + i).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(applier.applied().is_empty());

        tokio::time::sleep(WINDOW * 3).await;
        assert_eq!(applier.applied(), vec![(id.clone(), 89, 33)]);
        assert_eq!(coalescer.applied_count(), 1);
        assert!(!coalescer.is_pending(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_resize_is_delayed_by_window() {
        let applier = RecordingApplier::with_live(&["a"]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);
        let id = SessionId::from("a");

        coalescer.request(&id, 100, 40).unwrap();
        tokio::time::sleep(WINDOW / 2).await;
        assert!(applier.applied().is_empty());

        tokio::time::sleep(WINDOW).await;
        assert_eq!(applier.applied(), vec![(id, 100, 40)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restarts_on_each_request() {
        let applier = RecordingApplier::with_live(&["a"]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);
        let id = SessionId::from("a");

        coalescer.request(&id, 90, 30).unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        coalescer.request(&id, 91, 31).unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        // 50ms after the first request, 25ms after the last one.
        assert!(applier.applied().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(applier.applied(), vec![(id, 91, 31)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent() {
        let applier = RecordingApplier::with_live(&["a", "b"]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);

        coalescer.request(&SessionId::from("a"), 100, 30).unwrap();
        coalescer.request(&SessionId::from("b"), 120, 40).unwrap();
        tokio::time::sleep(WINDOW * 2).await;

        let mut applied = applier.applied();
        applied.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            applied,
            vec![
                (SessionId::from("a"), 100, 30),
                (SessionId::from("b"), 120, 40)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_session_not_found() {
        let applier = RecordingApplier::with_live(&[]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);

        let result = coalescer.request(&SessionId::from("ghost"), 80, 24);
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let applier = RecordingApplier::with_live(&["a"]);
        let coalescer = ResizeCoalescer::new(Arc::clone(&applier), WINDOW);
        let id = SessionId::from("a");

        coalescer.request(&id, 100, 40).unwrap();
        coalescer.cancel(&id);
        tokio::time::sleep(WINDOW * 2).await;

        assert!(applier.applied().is_empty());
        assert_eq!(coalescer.applied_count(), 0);
    }
}
