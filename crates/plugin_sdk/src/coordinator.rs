//! Master side of the worker pool.
//!
//! The master never serves requests. It keeps `N` workers alive, respawning
//! any that die, and relays state between them: a worker reports a
//! credential or log-level change, the master applies it to its canonical
//! copy and re-broadcasts it to every running worker, the originator
//! included.
//!
//! Arrival order at the master is the only total order, so when two workers
//! report conflicting updates the one processed last wins.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialStore,
    error::{CoordinationError, SpawnError},
    logging::LogLevelSwitch,
    message::{CoordinationMessage, Credentials, LogLevel},
};

/// Stable position of a worker in the pool; survives respawns.
pub type WorkerSlot = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Dead,
}

/// What the pool tells the master.
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        slot: WorkerSlot,
        pid: u32,
        msg: CoordinationMessage,
    },
    ProtocolError {
        slot: WorkerSlot,
        pid: u32,
        error: CoordinationError,
    },
    Exited {
        slot: WorkerSlot,
        pid: u32,
        code: Option<i32>,
    },
}

/// A freshly started worker as handed back by a [`WorkerSpawner`].
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: u32,
    /// Master -> worker channel.
    pub outbox: UnboundedSender<CoordinationMessage>,
    /// Fired to stop the worker. The spawner must still report `Exited`.
    pub stop: oneshot::Sender<()>,
}

/// Starts one worker and wires its channel back to the master.
///
/// Implementations must emit exactly one [`WorkerEvent::Exited`] per spawned
/// worker, and forward every message the worker sends as
/// [`WorkerEvent::Message`] (or `ProtocolError` if it cannot be decoded).
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    async fn spawn(
        &self,
        slot: WorkerSlot,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<SpawnedWorker, SpawnError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub slot: WorkerSlot,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalState {
    pub credentials: Credentials,
    pub log_level: LogLevel,
}

#[derive(Debug)]
struct WorkerEntry {
    pid: Option<u32>,
    state: WorkerState,
    outbox: Option<UnboundedSender<CoordinationMessage>>,
    stop: Option<oneshot::Sender<()>>,
}

impl WorkerEntry {
    fn starting() -> Self {
        Self {
            pid: None,
            state: WorkerState::Starting,
            outbox: None,
            stop: None,
        }
    }
}

/// The master's reducer: canonical state plus per-slot bookkeeping.
///
/// Holds no tasks or I/O of its own; [`Supervisor`] drives it.
#[derive(Debug)]
pub struct Coordinator {
    credentials: CredentialStore,
    log_level: LogLevelSwitch,
    level_changed: bool,
    sync_on_spawn: bool,
    workers: BTreeMap<WorkerSlot, WorkerEntry>,
}

impl Coordinator {
    pub fn new(log_level: LogLevelSwitch, sync_on_spawn: bool) -> Self {
        Self {
            credentials: CredentialStore::new(),
            log_level,
            level_changed: false,
            sync_on_spawn,
            workers: BTreeMap::new(),
        }
    }

    pub fn canonical(&self) -> CanonicalState {
        CanonicalState {
            credentials: self.credentials.snapshot(),
            log_level: self.log_level.level(),
        }
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .map(|(slot, entry)| WorkerInfo {
                slot: *slot,
                pid: entry.pid,
                state: entry.state,
            })
            .collect()
    }

    pub fn state_of(&self, slot: WorkerSlot) -> Option<WorkerState> {
        self.workers.get(&slot).map(|e| e.state)
    }

    pub fn mark_starting(&mut self, slot: WorkerSlot) {
        self.workers.insert(slot, WorkerEntry::starting());
    }

    /// Record a spawned worker. With sync-on-spawn the current canonical
    /// state is pushed to it straight away.
    pub fn mark_running(&mut self, slot: WorkerSlot, spawned: SpawnedWorker) {
        let SpawnedWorker { pid, outbox, stop } = spawned;
        if self.sync_on_spawn {
            let creds = self.credentials.snapshot();
            if !creds.is_empty() {
                let _ = outbox.send(CoordinationMessage::CredentialUpdateFromMaster(creds));
            }
            if self.level_changed {
                let level = self.log_level.level();
                let _ = outbox.send(CoordinationMessage::LogLevelUpdateFromMaster(level));
            }
        }
        self.workers.insert(
            slot,
            WorkerEntry {
                pid: Some(pid),
                state: WorkerState::Running,
                outbox: Some(outbox),
                stop: Some(stop),
            },
        );
        info!(slot, pid, "worker running");
    }

    /// Record an exit. Returns `false` for a stale pid (an earlier
    /// incarnation of the slot), which callers should ignore.
    pub fn mark_dead(&mut self, slot: WorkerSlot, pid: u32) -> bool {
        match self.workers.get_mut(&slot) {
            Some(entry) if entry.pid == Some(pid) => {
                entry.state = WorkerState::Dead;
                entry.outbox = None;
                entry.stop = None;
                true
            }
            _ => false,
        }
    }

    /// Apply a worker's report and re-broadcast it. Returns how many
    /// workers the broadcast was handed to.
    pub fn handle_message(
        &mut self,
        slot: WorkerSlot,
        msg: CoordinationMessage,
    ) -> Result<usize, CoordinationError> {
        if msg.is_from_master() {
            warn!(slot, method = %msg.method(), "worker sent a master-only message");
            return Err(CoordinationError::WrongDirection(msg.method().to_string()));
        }
        match msg {
            CoordinationMessage::CredentialUpdateFromWorker(creds) => {
                info!(slot, worker_id = %creds.worker_id, "credential update from worker");
                self.credentials.replace(creds.clone());
                Ok(self.broadcast(CoordinationMessage::CredentialUpdateFromMaster(creds)))
            }
            CoordinationMessage::LogLevelUpdateFromWorker(level) => {
                info!(slot, %level, "log level update from worker");
                self.log_level.set(level);
                self.level_changed = true;
                Ok(self.broadcast(CoordinationMessage::LogLevelUpdateFromMaster(level)))
            }
            other => Err(CoordinationError::WrongDirection(other.method().to_string())),
        }
    }

    /// Send `msg` to every running worker. A worker that died in the
    /// meantime simply misses it.
    pub fn broadcast(&self, msg: CoordinationMessage) -> usize {
        let mut delivered = 0;
        for (slot, entry) in &self.workers {
            if entry.state != WorkerState::Running {
                continue;
            }
            let Some(outbox) = &entry.outbox else { continue };
            if outbox.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(slot, method = %msg.method(), "worker channel closed, message dropped");
            }
        }
        delivered
    }

    /// Ask every live worker to stop; returns how many were asked.
    pub fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for entry in self.workers.values_mut() {
            if let Some(stop) = entry.stop.take() {
                let _ = stop.send(());
                stopped += 1;
            }
        }
        stopped
    }

    fn all_dead(&self) -> bool {
        self.workers.values().all(|e| e.state == WorkerState::Dead)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: usize,
    /// Push canonical state to each newly running worker. When off, a
    /// respawned worker stays empty until the next change is broadcast.
    pub sync_on_spawn: bool,
    pub respawn_backoff: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            sync_on_spawn: true,
            respawn_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

enum Command {
    Workers(oneshot::Sender<Vec<WorkerInfo>>),
    Canonical(oneshot::Sender<CanonicalState>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running supervisor loop.
#[derive(Clone, Debug)]
pub struct Supervisor {
    commands: UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Command::Workers(_) => "Workers",
            Command::Canonical(_) => "Canonical",
            Command::Shutdown(_) => "Shutdown",
        })
    }
}

impl Supervisor {
    /// Spawn the initial pool and run the supervision loop.
    ///
    /// The returned task ends with `Ok` after [`Supervisor::shutdown`], or
    /// with the first coordination error; a malformed message is a bug on one
    /// side of the channel and takes the master down.
    pub async fn start<S: WorkerSpawner>(
        config: SupervisorConfig,
        spawner: S,
        log_level: LogLevelSwitch,
    ) -> (Self, JoinHandle<Result<(), CoordinationError>>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let mut pool = PoolLoop {
            coordinator: Coordinator::new(log_level, config.sync_on_spawn),
            spawner: Arc::new(spawner),
            config,
            events: event_tx,
            retry: retry_tx,
            shutting_down: None,
        };
        for slot in 0..pool.config.workers {
            pool.spawn_slot(slot).await;
        }

        let task = tokio::spawn(pool.run(event_rx, retry_rx, cmd_rx));
        (Self { commands: cmd_tx }, task)
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Workers(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn canonical(&self) -> Option<CanonicalState> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Canonical(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop respawning, stop every worker and wait for the loop to finish.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct PoolLoop<S: WorkerSpawner> {
    coordinator: Coordinator,
    spawner: Arc<S>,
    config: SupervisorConfig,
    events: UnboundedSender<WorkerEvent>,
    retry: UnboundedSender<WorkerSlot>,
    shutting_down: Option<(Instant, Vec<oneshot::Sender<()>>)>,
}

impl<S: WorkerSpawner> PoolLoop<S> {
    async fn spawn_slot(&mut self, slot: WorkerSlot) {
        self.coordinator.mark_starting(slot);
        match self.spawner.spawn(slot, self.events.clone()).await {
            Ok(spawned) => self.coordinator.mark_running(slot, spawned),
            Err(err) => {
                error!(slot, error = %err, "failed to spawn worker, retrying");
                let retry = self.retry.clone();
                let backoff = self.config.respawn_backoff;
                tokio::spawn(async move {
                    sleep(backoff).await;
                    let _ = retry.send(slot);
                });
            }
        }
    }

    async fn run(
        mut self,
        mut events: UnboundedReceiver<WorkerEvent>,
        mut retries: UnboundedReceiver<WorkerSlot>,
        mut commands: UnboundedReceiver<Command>,
    ) -> Result<(), CoordinationError> {
        let mut commands_open = true;
        loop {
            let deadline = self.shutting_down.as_ref().map(|(deadline, _)| *deadline);
            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(err) = self.on_event(event).await {
                        error!(error = %err, "coordination failure, stopping the pool");
                        self.coordinator.stop_all();
                        return Err(err);
                    }
                }
                Some(slot) = retries.recv() => {
                    if self.shutting_down.is_none()
                        && self.coordinator.state_of(slot) == Some(WorkerState::Starting)
                    {
                        self.spawn_slot(slot).await;
                    }
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => commands_open = false,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("workers did not exit before the shutdown timeout");
                    self.finish_shutdown();
                    return Ok(());
                }
            }

            if self.shutting_down.is_some() && self.coordinator.all_dead() {
                self.finish_shutdown();
                return Ok(());
            }
        }
    }

    async fn on_event(&mut self, event: WorkerEvent) -> Result<(), CoordinationError> {
        match event {
            WorkerEvent::Message { slot, pid, msg } => {
                debug!(slot, pid, method = %msg.method(), "coordination message");
                let delivered = self.coordinator.handle_message(slot, msg)?;
                debug!(slot, delivered, "broadcast handed to workers");
            }
            WorkerEvent::ProtocolError { slot, pid, error } => {
                error!(slot, pid, error = %error, "malformed coordination message from worker");
                return Err(error);
            }
            WorkerEvent::Exited { slot, pid, code } => {
                if !self.coordinator.mark_dead(slot, pid) {
                    debug!(slot, pid, "exit of a replaced worker ignored");
                    return Ok(());
                }
                if self.shutting_down.is_some() {
                    info!(slot, pid, ?code, "worker stopped");
                } else {
                    warn!(slot, pid, ?code, "worker died, respawning");
                    self.spawn_slot(slot).await;
                }
            }
        }
        Ok(())
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Workers(tx) => {
                let _ = tx.send(self.coordinator.workers());
            }
            Command::Canonical(tx) => {
                let _ = tx.send(self.coordinator.canonical());
            }
            Command::Shutdown(tx) => match &mut self.shutting_down {
                Some((_, waiters)) => waiters.push(tx),
                None => {
                    let asked = self.coordinator.stop_all();
                    info!(workers = asked, "shutting down worker pool");
                    for info in self.coordinator.workers() {
                        // never started; nothing will report its exit
                        if info.state == WorkerState::Starting {
                            self.coordinator.workers.entry(info.slot).and_modify(|e| {
                                e.state = WorkerState::Dead;
                            });
                        }
                    }
                    let deadline = Instant::now() + self.config.shutdown_timeout;
                    self.shutting_down = Some((deadline, vec![tx]));
                }
            },
        }
    }

    fn finish_shutdown(&mut self) {
        if let Some((_, waiters)) = self.shutting_down.take() {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawned(pid: u32) -> (SpawnedWorker, UnboundedReceiver<CoordinationMessage>, oneshot::Receiver<()>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel();
        (SpawnedWorker { pid, outbox, stop }, inbox, stopped)
    }

    fn coordinator_with(n: usize, sync: bool) -> (Coordinator, Vec<UnboundedReceiver<CoordinationMessage>>) {
        let mut c = Coordinator::new(LogLevelSwitch::default(), sync);
        let mut inboxes = Vec::new();
        for slot in 0..n {
            let (w, inbox, _stopped) = spawned(100 + slot as u32);
            c.mark_starting(slot);
            c.mark_running(slot, w);
            inboxes.push(inbox);
        }
        (c, inboxes)
    }

    #[test]
    fn credential_update_is_broadcast_to_every_running_worker() {
        let (mut c, mut inboxes) = coordinator_with(3, true);
        let creds = Credentials::new("t1", "w1");

        let delivered = c
            .handle_message(0, CoordinationMessage::CredentialUpdateFromWorker(creds.clone()))
            .unwrap();

        assert_eq!(delivered, 3);
        assert_eq!(c.canonical().credentials, creds);
        for inbox in &mut inboxes {
            assert_eq!(
                inbox.try_recv().unwrap(),
                CoordinationMessage::CredentialUpdateFromMaster(creds.clone())
            );
        }
    }

    #[test]
    fn log_level_update_changes_master_level_too() {
        let (mut c, mut inboxes) = coordinator_with(2, true);
        c.handle_message(1, CoordinationMessage::LogLevelUpdateFromWorker(LogLevel::Debug))
            .unwrap();
        assert_eq!(c.canonical().log_level, LogLevel::Debug);
        assert_eq!(
            inboxes[0].try_recv().unwrap(),
            CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Debug)
        );
    }

    #[test]
    fn last_applied_update_wins() {
        let (mut c, _inboxes) = coordinator_with(2, true);
        c.handle_message(0, CoordinationMessage::CredentialUpdateFromWorker(Credentials::new("a", "w")))
            .unwrap();
        c.handle_message(1, CoordinationMessage::CredentialUpdateFromWorker(Credentials::new("b", "w")))
            .unwrap();
        assert_eq!(c.canonical().credentials.auth_token, "b");
    }

    #[test]
    fn master_messages_from_a_worker_are_rejected() {
        let (mut c, _inboxes) = coordinator_with(1, true);
        let err = c
            .handle_message(0, CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Warn))
            .unwrap_err();
        assert!(matches!(err, CoordinationError::WrongDirection(_)));
    }

    #[test]
    fn dead_workers_miss_broadcasts() {
        let (mut c, mut inboxes) = coordinator_with(2, true);
        assert!(c.mark_dead(1, 101));
        let delivered = c.broadcast(CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Warn));
        assert_eq!(delivered, 1);
        assert!(inboxes[1].try_recv().is_err());
    }

    #[test]
    fn stale_exit_is_ignored() {
        let (mut c, _inboxes) = coordinator_with(1, true);
        assert!(!c.mark_dead(0, 999));
        assert_eq!(c.state_of(0), Some(WorkerState::Running));
    }

    #[test]
    fn sync_on_spawn_pushes_current_state() {
        let (mut c, _inboxes) = coordinator_with(1, true);
        c.handle_message(0, CoordinationMessage::CredentialUpdateFromWorker(Credentials::new("t", "w")))
            .unwrap();
        c.handle_message(0, CoordinationMessage::LogLevelUpdateFromWorker(LogLevel::Trace))
            .unwrap();

        let (w, mut inbox, _stopped) = spawned(200);
        c.mark_starting(1);
        c.mark_running(1, w);
        assert_eq!(
            inbox.try_recv().unwrap(),
            CoordinationMessage::CredentialUpdateFromMaster(Credentials::new("t", "w"))
        );
        assert_eq!(
            inbox.try_recv().unwrap(),
            CoordinationMessage::LogLevelUpdateFromMaster(LogLevel::Trace)
        );
    }

    #[test]
    fn without_sync_a_new_worker_starts_empty() {
        let (mut c, _inboxes) = coordinator_with(1, false);
        c.handle_message(0, CoordinationMessage::CredentialUpdateFromWorker(Credentials::new("t", "w")))
            .unwrap();

        let (w, mut inbox, _stopped) = spawned(200);
        c.mark_starting(1);
        c.mark_running(1, w);
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn fresh_master_pushes_nothing_on_spawn() {
        let (_c, mut inboxes) = coordinator_with(1, true);
        assert!(inboxes[0].try_recv().is_err());
    }

    #[test]
    fn stop_all_fires_every_stop_signal() {
        let mut c = Coordinator::new(LogLevelSwitch::default(), true);
        let (w, _inbox, mut stopped) = spawned(7);
        c.mark_starting(0);
        c.mark_running(0, w);
        assert_eq!(c.stop_all(), 1);
        assert!(stopped.try_recv().is_ok());
        assert_eq!(c.stop_all(), 0);
    }
}
