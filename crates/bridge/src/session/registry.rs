//! Session registry.
//!
//! The registry is the single owner of child-process handles. Each session
//! id maps to one terminal slot and one build slot; a slot is empty, reserved
//! while a process is being launched, or live. Every installed handle gets a
//! fresh [`Instance`] number so that output from a previous occupant of the
//! same slot can be told apart from the current one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use protocol::SessionId;
use tokio::sync::Notify;

use super::pty::PtySession;
use super::SessionError;
use crate::build::BuildSession;

/// Monotonic number identifying one installed process.
pub type Instance = u64;

/// The two kinds of process a session can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// Interactive shell on a pseudo-terminal.
    Terminal,
    /// Live documentation build server.
    Build,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Terminal => f.write_str("terminal"),
            ProcessKind::Build => f.write_str("build"),
        }
    }
}

/// A process handle whose termination can be confirmed.
pub trait Supervised: Send + Sync {
    /// Returns true once the owned process is known to be dead.
    fn is_terminated(&self) -> bool;
}

enum Slot<T> {
    Empty,
    Reserved(Instance),
    Live(Instance, Arc<T>),
}

impl<T: Supervised> Slot<T> {
    fn instance(&self) -> Option<Instance> {
        match self {
            Slot::Empty => None,
            Slot::Reserved(instance) | Slot::Live(instance, _) => Some(*instance),
        }
    }

    /// A reserved slot or a live, not yet terminated process.
    fn is_occupied(&self) -> bool {
        match self {
            Slot::Empty => false,
            Slot::Reserved(_) => true,
            Slot::Live(_, handle) => !handle.is_terminated(),
        }
    }

    fn handle(&self) -> Option<Arc<T>> {
        match self {
            Slot::Live(_, handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    fn install(&mut self, instance: Instance, handle: Arc<T>) -> bool {
        match self {
            Slot::Reserved(reserved) if *reserved == instance => {
                *self = Slot::Live(instance, handle);
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, instance: Instance) -> bool {
        match self {
            Slot::Reserved(reserved) if *reserved == instance => {
                *self = Slot::Empty;
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, instance: Instance) -> bool {
        match self {
            Slot::Live(live, handle) if *live == instance && handle.is_terminated() => {
                *self = Slot::Empty;
                true
            }
            _ => false,
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Empty
    }
}

#[derive(Default)]
struct Entry {
    terminal: Slot<PtySession>,
    build: Slot<BuildSession>,
}

impl Entry {
    fn occupied_kind(&self) -> Option<ProcessKind> {
        if self.terminal.is_occupied() {
            Some(ProcessKind::Terminal)
        } else if self.build.is_occupied() {
            Some(ProcessKind::Build)
        } else {
            None
        }
    }

    fn instance(&self, kind: ProcessKind) -> Option<Instance> {
        match kind {
            ProcessKind::Terminal => self.terminal.instance(),
            ProcessKind::Build => self.build.instance(),
        }
    }

    fn is_reserved(&self, kind: ProcessKind) -> bool {
        match kind {
            ProcessKind::Terminal => matches!(self.terminal, Slot::Reserved(_)),
            ProcessKind::Build => matches!(self.build, Slot::Reserved(_)),
        }
    }
}

/// Thread-safe mapping from session id to its owned processes.
///
/// Mutation is exclusive per session id and concurrent across ids. No
/// method holds a map guard beyond the lookup or update itself.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Entry>,
    next_instance: AtomicU64,
    /// Woken whenever a reservation is made or resolved.
    launches: Notify,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_instance: AtomicU64::new(1),
            launches: Notify::new(),
        }
    }

    /// Creates an empty slot pair for the session. Idempotent.
    ///
    /// Returns true if the id was not registered before.
    pub fn register(&self, session_id: &SessionId) -> bool {
        match self.sessions.entry(session_id.clone()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::default());
                tracing::debug!(session_id = %session_id, "Registered session");
                true
            }
        }
    }

    /// Forgets the session id once nothing it owns is still alive.
    ///
    /// Returns false if the id was not registered.
    pub fn unregister(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        if self
            .sessions
            .remove_if(session_id, |_, entry| entry.occupied_kind().is_none())
            .is_some()
        {
            tracing::debug!(session_id = %session_id, "Unregistered session");
            return Ok(true);
        }

        let busy = self
            .sessions
            .get(session_id)
            .and_then(|entry| entry.occupied_kind());
        match busy {
            Some(kind) => Err(SessionError::AlreadyRunning {
                id: session_id.clone(),
                kind,
            }),
            None => Ok(false),
        }
    }

    /// Returns true if the id is registered.
    pub fn is_registered(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Reserves the slot of the given kind, registering the id if needed.
    ///
    /// Fails if a launch is already in progress or a live process occupies
    /// the slot. A slot holding an already terminated process is reused.
    pub fn reserve(
        &self,
        session_id: &SessionId,
        kind: ProcessKind,
    ) -> Result<Instance, SessionError> {
        let mut entry = self.sessions.entry(session_id.clone()).or_default();
        let occupied = match kind {
            ProcessKind::Terminal => entry.terminal.is_occupied(),
            ProcessKind::Build => entry.build.is_occupied(),
        };
        if occupied {
            return Err(SessionError::AlreadyRunning {
                id: session_id.clone(),
                kind,
            });
        }

        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        match kind {
            ProcessKind::Terminal => entry.terminal = Slot::Reserved(instance),
            ProcessKind::Build => entry.build = Slot::Reserved(instance),
        }
        drop(entry);
        self.launches.notify_waiters();
        Ok(instance)
    }

    /// Drops a reservation after a failed launch.
    pub fn release(&self, session_id: &SessionId, kind: ProcessKind, instance: Instance) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            match kind {
                ProcessKind::Terminal => entry.terminal.release(instance),
                ProcessKind::Build => entry.build.release(instance),
            };
        }
        self.launches.notify_waiters();
    }

    /// Turns a terminal reservation into a live handle.
    pub fn install_terminal(
        &self,
        session_id: &SessionId,
        instance: Instance,
        session: Arc<PtySession>,
    ) -> bool {
        let installed = self
            .sessions
            .get_mut(session_id)
            .is_some_and(|mut entry| entry.terminal.install(instance, session));
        self.launches.notify_waiters();
        installed
    }

    /// Turns a build reservation into a live handle.
    pub fn install_build(
        &self,
        session_id: &SessionId,
        instance: Instance,
        session: Arc<BuildSession>,
    ) -> bool {
        let installed = self
            .sessions
            .get_mut(session_id)
            .is_some_and(|mut entry| entry.build.install(instance, session));
        self.launches.notify_waiters();
        installed
    }

    /// Returns the session's terminal handle.
    pub fn terminal(&self, session_id: &SessionId) -> Option<Arc<PtySession>> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.terminal.handle())
    }

    /// Returns the session's build handle.
    pub fn build(&self, session_id: &SessionId) -> Option<Arc<BuildSession>> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.build.handle())
    }

    /// Removes the terminal slot if it still holds `instance` and the shell
    /// is confirmed dead.
    pub fn remove_terminal(&self, session_id: &SessionId, instance: Instance) -> bool {
        self.sessions
            .get_mut(session_id)
            .is_some_and(|mut entry| entry.terminal.remove(instance))
    }

    /// Removes the build slot if it still holds `instance` and the build
    /// server is confirmed dead.
    pub fn remove_build(&self, session_id: &SessionId, instance: Instance) -> bool {
        self.sessions
            .get_mut(session_id)
            .is_some_and(|mut entry| entry.build.remove(instance))
    }

    /// Returns true if `instance` is the current occupant of the slot.
    pub fn is_current(&self, session_id: &SessionId, kind: ProcessKind, instance: Instance) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|entry| entry.instance(kind) == Some(instance))
    }

    /// Returns the instance number the next reservation will get.
    pub fn next_instance(&self) -> Instance {
        self.next_instance.load(Ordering::SeqCst)
    }

    /// Waits until no launch of `kind` is in progress for the session.
    ///
    /// Teardown calls this first so that a process whose launch has already
    /// started is installed, and thus reachable, before it is looked up.
    pub async fn settled(&self, session_id: &SessionId, kind: ProcessKind) {
        self.wait_until(|| {
            !self
                .sessions
                .get(session_id)
                .is_some_and(|entry| entry.is_reserved(kind))
        })
        .await;
    }

    /// Waits until the slot holds a reservation or process numbered at
    /// least `since`.
    pub async fn launched_since(&self, session_id: &SessionId, kind: ProcessKind, since: Instance) {
        self.wait_until(|| {
            self.sessions
                .get(session_id)
                .and_then(|entry| entry.instance(kind))
                .is_some_and(|instance| instance >= since)
        })
        .await;
    }

    async fn wait_until<F: Fn() -> bool>(&self, ready: F) {
        loop {
            let notified = self.launches.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready() {
                return;
            }
            notified.await;
        }
    }

    /// Returns every live terminal handle.
    pub fn terminals(&self) -> Vec<Arc<PtySession>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.terminal.handle())
            .collect()
    }

    /// Returns every live build handle.
    pub fn builds(&self) -> Vec<Arc<BuildSession>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.build.handle())
            .collect()
    }

    /// Returns the number of registered session ids.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session id is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
