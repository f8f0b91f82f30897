use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::AsyncWriteExt,
    process::ChildStdin,
    sync::{Mutex, oneshot},
};

use crate::engine::{
    config::ConflictPolicy,
    error::RunnerError,
    models::{SessionSummary, Stage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Killed,
    Superseded,
}

/// Write side of the active process's stdin.
///
/// Input that arrives before the run stage has a pipe is buffered and flushed on attach.
#[derive(Debug)]
pub enum StdinSlot {
    Pending { buffered: Vec<u8>, closed: bool },
    Open(ChildStdin),
    Closed,
}

impl StdinSlot {
    fn pending() -> Self {
        Self::Pending {
            buffered: Vec::new(),
            closed: false,
        }
    }

    pub async fn write(&mut self, bytes: &[u8], close: bool) -> Result<(), RunnerError> {
        match self {
            StdinSlot::Pending { buffered, closed } => {
                if *closed {
                    return Err(RunnerError::NotWritable);
                }
                buffered.extend_from_slice(bytes);
                *closed = close;
                Ok(())
            }
            StdinSlot::Open(stdin) => {
                let written = match stdin.write_all(bytes).await {
                    Ok(()) => stdin.flush().await,
                    Err(err) => Err(err),
                };
                if written.is_err() {
                    *self = StdinSlot::Closed;
                    return Err(RunnerError::NotWritable);
                }
                if close {
                    *self = StdinSlot::Closed;
                }
                Ok(())
            }
            StdinSlot::Closed => Err(RunnerError::NotWritable),
        }
    }

    async fn open(&mut self, mut stdin: ChildStdin) {
        let StdinSlot::Pending { buffered, closed } = std::mem::replace(self, StdinSlot::Closed)
        else {
            return;
        };
        if !buffered.is_empty()
            && (stdin.write_all(&buffered).await.is_err() || stdin.flush().await.is_err())
        {
            return;
        }
        if !closed {
            *self = StdinSlot::Open(stdin);
        }
    }
}

/// Registry entry for one client's live session.
#[derive(Debug)]
pub struct SessionHandle {
    pub generation: u64,
    pub language: String,
    pub workspace: PathBuf,
    pub stage: Stage,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    stdin: Arc<Mutex<StdinSlot>>,
    stop: Option<oneshot::Sender<StopReason>>,
}

impl SessionHandle {
    pub fn new(
        generation: u64,
        language: String,
        workspace: PathBuf,
        stop: oneshot::Sender<StopReason>,
    ) -> Self {
        Self {
            generation,
            language,
            workspace,
            stage: Stage::Provisioning,
            pid: None,
            started_at: Utc::now(),
            stdin: Arc::new(Mutex::new(StdinSlot::pending())),
            stop: Some(stop),
        }
    }

    /// Tells the owning session task why its entry disappeared.
    pub fn notify_stop(mut self, reason: StopReason) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(reason);
        }
    }

    fn summary(&self, client_id: &str) -> SessionSummary {
        SessionSummary {
            client_id: client_id.to_string(),
            language: self.language.clone(),
            stage: self.stage,
            pid: self.pid,
            started_at: self.started_at,
        }
    }
}

/// Process-wide table of client id → active session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Installs `handle` for `client_id`. Under [`ConflictPolicy::Supersede`] the replaced
    /// handle is returned so the caller can stop it.
    pub fn register(
        &self,
        client_id: &str,
        handle: SessionHandle,
        policy: ConflictPolicy,
    ) -> Result<Option<SessionHandle>, RunnerError> {
        match self.sessions.entry(client_id.to_string()) {
            Entry::Occupied(mut occupied) => match policy {
                ConflictPolicy::Reject => Err(RunnerError::SessionActive),
                ConflictPolicy::Supersede => Ok(Some(occupied.insert(handle))),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                Ok(None)
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<SessionSummary> {
        self.sessions
            .get(client_id)
            .map(|entry| entry.summary(client_id))
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn unregister(&self, client_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(client_id).map(|(_, handle)| handle)
    }

    /// Removes the entry only while it still belongs to `generation`.
    pub fn remove_if_current(&self, client_id: &str, generation: u64) -> Option<SessionHandle> {
        self.sessions
            .remove_if(client_id, |_, handle| handle.generation == generation)
            .map(|(_, handle)| handle)
    }

    /// Records the process now acting for the session. Returns false if the session was
    /// killed or superseded in the meantime.
    pub async fn attach(
        &self,
        client_id: &str,
        generation: u64,
        stage: Stage,
        pid: Option<u32>,
        stdin: Option<ChildStdin>,
    ) -> bool {
        let slot = {
            let Some(mut entry) = self.sessions.get_mut(client_id) else {
                return false;
            };
            if entry.generation != generation {
                return false;
            }
            entry.stage = stage;
            entry.pid = pid;
            entry.stdin.clone()
        };
        if let Some(stdin) = stdin {
            slot.lock().await.open(stdin).await;
        }
        true
    }

    pub fn stdin(&self, client_id: &str) -> Option<Arc<Mutex<StdinSlot>>> {
        self.sessions
            .get(client_id)
            .map(|entry| entry.stdin.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::oneshot;

    use super::{SessionHandle, SessionRegistry, StdinSlot, StopReason};
    use crate::engine::{config::ConflictPolicy, error::RunnerError, models::Stage};

    fn handle(registry: &SessionRegistry) -> (SessionHandle, oneshot::Receiver<StopReason>) {
        let (tx, rx) = oneshot::channel();
        let generation = registry.next_generation();
        (
            SessionHandle::new(generation, "python".to_string(), PathBuf::from("/tmp/x"), tx),
            rx,
        )
    }

    #[test]
    fn supersede_returns_previous_handle() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx) = handle(&registry);
        let first_generation = first.generation;
        assert!(
            registry
                .register("a", first, ConflictPolicy::Supersede)
                .unwrap()
                .is_none()
        );

        let (second, _second_rx) = handle(&registry);
        let previous = registry
            .register("a", second, ConflictPolicy::Supersede)
            .unwrap()
            .unwrap();
        assert_eq!(previous.generation, first_generation);
        previous.notify_stop(StopReason::Superseded);

        assert_eq!(first_rx.try_recv(), Ok(StopReason::Superseded));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reject_policy_keeps_existing_session() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = handle(&registry);
        let generation = first.generation;
        registry
            .register("a", first, ConflictPolicy::Reject)
            .unwrap();

        let (second, _rx2) = handle(&registry);
        let err = registry
            .register("a", second, ConflictPolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, RunnerError::SessionActive));
        assert!(registry.remove_if_current("a", generation).is_some());
    }

    #[test]
    fn stale_generation_cannot_remove_new_session() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = handle(&registry);
        let stale = first.generation;
        registry
            .register("a", first, ConflictPolicy::Supersede)
            .unwrap();
        let (second, _rx2) = handle(&registry);
        registry
            .register("a", second, ConflictPolicy::Supersede)
            .unwrap();

        assert!(registry.remove_if_current("a", stale).is_none());
        assert!(registry.contains("a"));
        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn attach_updates_stage_and_rejects_stale_generation() {
        let registry = SessionRegistry::new();
        let (entry, _rx) = handle(&registry);
        let generation = entry.generation;
        registry
            .register("a", entry, ConflictPolicy::Supersede)
            .unwrap();

        assert!(
            registry
                .attach("a", generation, Stage::Compiling, Some(42), None)
                .await
        );
        let summary = registry.get("a").unwrap();
        assert_eq!(summary.stage, Stage::Compiling);
        assert_eq!(summary.pid, Some(42));

        assert!(
            !registry
                .attach("a", generation + 100, Stage::Running, Some(7), None)
                .await
        );
        assert!(!registry.attach("b", generation, Stage::Running, None, None).await);
    }

    #[tokio::test]
    async fn pending_stdin_buffers_until_closed() {
        let mut slot = StdinSlot::pending();
        slot.write(b"1\n", false).await.unwrap();
        slot.write(b"2\n", true).await.unwrap();
        assert!(matches!(
            slot.write(b"3\n", false).await,
            Err(RunnerError::NotWritable)
        ));
        match slot {
            StdinSlot::Pending { buffered, closed } => {
                assert_eq!(buffered, b"1\n2\n");
                assert!(closed);
            }
            other => panic!("unexpected slot state: {other:?}"),
        }
    }
}
