//! Workers as tasks inside the current process.
//!
//! Each spawned worker is a [`WorkerRuntime`] wired to the master through
//! channels instead of pipes, with a synthetic pid. Useful for embedding and
//! for exercising the pool without real processes.

use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{
    mpsc::{self, UnboundedSender},
    oneshot,
};
use tracing::{debug, error};

use crate::{
    coordinator::{SpawnedWorker, WorkerEvent, WorkerSlot, WorkerSpawner},
    credentials::CredentialStore,
    error::SpawnError,
    logging::LogLevelSwitch,
    message::{CoordinationMessage, LogLevel},
    worker::WorkerRuntime,
};

const FIRST_PID: u32 = 10_000;

#[derive(Debug, Clone)]
struct LiveWorker {
    pid: u32,
    runtime: WorkerRuntime,
    kill: UnboundedSender<i32>,
    events: UnboundedSender<WorkerEvent>,
}

#[derive(Debug, Clone)]
pub struct InProcessSpawner {
    initial_level: LogLevel,
    next_pid: Arc<AtomicU32>,
    failures_left: Arc<AtomicUsize>,
    live: Arc<DashMap<WorkerSlot, LiveWorker>>,
}

impl Default for InProcessSpawner {
    fn default() -> Self {
        Self::new(LogLevel::default())
    }
}

impl InProcessSpawner {
    /// Workers start at `initial_level`, like a child launched with
    /// `--log-level`.
    pub fn new(initial_level: LogLevel) -> Self {
        Self {
            initial_level,
            next_pid: Arc::new(AtomicU32::new(FIRST_PID)),
            failures_left: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(DashMap::new()),
        }
    }

    /// The runtime currently occupying `slot`, if its worker is alive.
    pub fn runtime(&self, slot: WorkerSlot) -> Option<WorkerRuntime> {
        self.live.get(&slot).map(|w| w.runtime.clone())
    }

    pub fn pid(&self, slot: WorkerSlot) -> Option<u32> {
        self.live.get(&slot).map(|w| w.pid)
    }

    pub fn live_slots(&self) -> Vec<WorkerSlot> {
        let mut slots: Vec<_> = self.live.iter().map(|e| *e.key()).collect();
        slots.sort_unstable();
        slots
    }

    /// Terminate the worker in `slot` as if it crashed with `code`.
    pub fn crash(&self, slot: WorkerSlot, code: i32) -> bool {
        match self.live.get(&slot) {
            Some(w) => w.kill.send(code).is_ok(),
            None => false,
        }
    }

    /// Make the next `n` spawns fail.
    pub fn fail_next_spawns(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Feed one raw line to the master as if the worker in `slot` had written
    /// it to its coordination channel.
    pub fn write_line(&self, slot: WorkerSlot, line: &str) -> bool {
        let Some(w) = self.live.get(&slot) else {
            return false;
        };
        let event = match CoordinationMessage::from_line(line) {
            Ok(Some(msg)) => WorkerEvent::Message { slot, pid: w.pid, msg },
            Ok(None) => return true,
            Err(error) => WorkerEvent::ProtocolError { slot, pid: w.pid, error },
        };
        w.events.send(event).is_ok()
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(
        &self,
        slot: WorkerSlot,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<SpawnedWorker, SpawnError> {
        if self.take_failure() {
            return Err(SpawnError::Other {
                slot,
                reason: "injected spawn failure".into(),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (to_master, mut from_worker) = mpsc::unbounded_channel::<CoordinationMessage>();
        let (outbox, mut inbox) = mpsc::unbounded_channel::<CoordinationMessage>();
        let (kill, mut killed) = mpsc::unbounded_channel::<i32>();
        let (stop, mut stopped) = oneshot::channel::<()>();

        let runtime = WorkerRuntime::connected(
            CredentialStore::new(),
            LogLevelSwitch::detached(self.initial_level),
            to_master,
        );
        self.live.insert(
            slot,
            LiveWorker {
                pid,
                runtime: runtime.clone(),
                kill,
                events: events.clone(),
            },
        );

        let live = self.live.clone();
        tokio::spawn(async move {
            let code = loop {
                tokio::select! {
                    Some(msg) = inbox.recv() => {
                        if let Err(err) = runtime.apply(msg) {
                            error!(slot, pid, error = %err, "worker rejected message from master");
                            break Some(1);
                        }
                    }
                    Some(msg) = from_worker.recv() => {
                        if events.send(WorkerEvent::Message { slot, pid, msg }).is_err() {
                            break None;
                        }
                    }
                    Some(code) = killed.recv() => break Some(code),
                    _ = &mut stopped => break Some(0),
                }
            };
            live.remove_if(&slot, |_, w| w.pid == pid);
            debug!(slot, pid, ?code, "in-process worker exited");
            let _ = events.send(WorkerEvent::Exited { slot, pid, code });
        });

        Ok(SpawnedWorker { pid, outbox, stop })
    }
}
