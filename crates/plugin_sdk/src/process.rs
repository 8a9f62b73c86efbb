//! Workers as child processes.
//!
//! Each worker is launched from the same program with `--slot <n>` appended.
//! The child's stdin carries master -> worker messages and its stdout
//! carries worker -> master messages, one JSON-RPC notification per line.
//! Stderr is inherited so worker logs land next to the master's.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{
        mpsc::{self, UnboundedSender},
        oneshot,
    },
};
use tracing::{debug, error, warn};

use crate::{
    coordinator::{SpawnedWorker, WorkerEvent, WorkerSlot, WorkerSpawner},
    error::{CoordinationError, SpawnError},
    message::CoordinationMessage,
};

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, slot: WorkerSlot) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--slot")
            .arg(slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

/// Spawns workers as OS processes from a [`ProcessSpec`].
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    spec: ProcessSpec,
}

impl ProcessSpawner {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        slot: WorkerSlot,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<SpawnedWorker, SpawnError> {
        let mut child = self
            .spec
            .command(slot)
            .spawn()
            .map_err(|source| SpawnError::Io { slot, source })?;

        let pid = child.id().ok_or(SpawnError::NoPid(slot))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingPipe { slot, pipe: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe { slot, pipe: "stdout" })?;

        // master -> worker
        let (outbox, mut inbox) = mpsc::unbounded_channel::<CoordinationMessage>();
        tokio::spawn(async move {
            while let Some(msg) = inbox.recv().await {
                if stdin.write_all(msg.to_line().as_bytes()).await.is_err() {
                    debug!(slot, pid, "worker stdin closed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // worker -> master
        let reader_events = events.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(slot, pid, error = %e, "could not read worker stdout");
                        let _ = reader_events.send(WorkerEvent::ProtocolError {
                            slot,
                            pid,
                            error: CoordinationError::ChannelClosed(e.to_string()),
                        });
                        break;
                    }
                }
                // invalid utf-8 is noise like any other non JSON-RPC line
                let line = String::from_utf8_lossy(&buf);
                let event = match CoordinationMessage::from_line(&line) {
                    Ok(Some(msg)) => WorkerEvent::Message { slot, pid, msg },
                    Ok(None) => continue,
                    Err(error) => WorkerEvent::ProtocolError { slot, pid, error },
                };
                if reader_events.send(event).is_err() {
                    break;
                }
            }
        });

        let (stop, stop_rx) = oneshot::channel();
        tokio::spawn(watch_child(child, slot, pid, stop_rx, events));

        Ok(SpawnedWorker { pid, outbox, stop })
    }
}

/// Wait for the child to exit (or kill it on request) and report the exit.
async fn watch_child(
    mut child: Child,
    slot: WorkerSlot,
    pid: u32,
    stop: oneshot::Receiver<()>,
    events: UnboundedSender<WorkerEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop => {
            if let Err(e) = child.start_kill() {
                warn!(slot, pid, error = %e, "could not kill worker");
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(slot, pid, error = %e, "could not read worker exit status");
            None
        }
    };
    let _ = events.send(WorkerEvent::Exited { slot, pid, code });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::message::{Credentials, LogLevel};

    #[tokio::test]
    async fn echo_worker_round_trip() {
        // `cat` echoes every master message back; the coordination channel
        // sees it as a message of the wrong direction, which is still a
        // well-formed coordination message.
        let spawner = ProcessSpawner::new(ProcessSpec::new("sh").args(["-c", "cat"]));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let worker = spawner.spawn(0, events_tx).await.unwrap();
        assert!(worker.pid > 0);

        let msg = CoordinationMessage::CredentialUpdateFromMaster(Credentials::new("t", "w"));
        worker.outbox.send(msg.clone()).unwrap();
        match events.recv().await.unwrap() {
            WorkerEvent::Message { slot, msg: echoed, .. } => {
                assert_eq!(slot, 0);
                assert_eq!(echoed, msg);
            }
            other => panic!("unexpected event {other:?}"),
        }

        worker.stop.send(()).unwrap();
        loop {
            if let WorkerEvent::Exited { slot, .. } = events.recv().await.unwrap() {
                assert_eq!(slot, 0);
                break;
            }
        }
    }

    #[tokio::test]
    async fn garbage_rpc_is_a_protocol_error() {
        let script = r#"echo '{"jsonrpc":"2.0","method":"logLevelUpdateFromWorker"}'; sleep 5"#;
        let spawner = ProcessSpawner::new(ProcessSpec::new("sh").args(["-c", script]));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let worker = spawner.spawn(3, events_tx).await.unwrap();

        match events.recv().await.unwrap() {
            WorkerEvent::ProtocolError { slot, error, .. } => {
                assert_eq!(slot, 3);
                assert!(error.to_string().contains("logLevelUpdateFromWorker"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let _ = worker.stop.send(());
    }

    #[tokio::test]
    async fn invalid_utf8_noise_does_not_cut_the_channel() {
        let script = concat!(
            r"printf '\377\376 stray\n'; ",
            r#"echo '{"jsonrpc":"2.0","method":"logLevelUpdateFromWorker","params":{"level":"debug"}}'; "#,
            "sleep 5",
        );
        let spawner = ProcessSpawner::new(ProcessSpec::new("sh").args(["-c", script]));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let worker = spawner.spawn(0, events_tx).await.unwrap();

        match events.recv().await.unwrap() {
            WorkerEvent::Message { slot, msg, .. } => {
                assert_eq!(slot, 0);
                assert_eq!(msg, CoordinationMessage::LogLevelUpdateFromWorker(LogLevel::Debug));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let _ = worker.stop.send(());
    }

    #[tokio::test]
    async fn exit_is_reported_with_code() {
        let spawner = ProcessSpawner::new(ProcessSpec::new("sh").args(["-c", "exit 3"]));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let _worker = spawner.spawn(1, events_tx).await.unwrap();
        loop {
            if let WorkerEvent::Exited { slot, code, .. } = events.recv().await.unwrap() {
                assert_eq!(slot, 1);
                assert_eq!(code, Some(3));
                break;
            }
        }
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spawner = ProcessSpawner::new(ProcessSpec::new("/definitely/not/here"));
        let (events_tx, _events) = mpsc::unbounded_channel();
        assert!(matches!(
            spawner.spawn(0, events_tx).await,
            Err(SpawnError::Io { slot: 0, .. })
        ));
    }
}
