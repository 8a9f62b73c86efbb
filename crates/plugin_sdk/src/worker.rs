//! Worker side of the coordination protocol.
//!
//! A worker owns exactly one `CredentialStore` and one `LogLevelSwitch`.
//! Local changes (an `init` call, a log-level request) are applied at once
//! and reported to the master; the master's broadcast comes back to every
//! worker, the originator included, and is applied as an unconditional
//! overwrite.

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    credentials::CredentialStore,
    error::CoordinationError,
    logging::LogLevelSwitch,
    message::{CoordinationMessage, Credentials, LogLevel},
};

#[derive(Clone, Debug)]
pub struct WorkerRuntime {
    credentials: CredentialStore,
    log_level: LogLevelSwitch,
    to_master: Option<UnboundedSender<CoordinationMessage>>,
}

impl WorkerRuntime {
    /// A worker with no master; reports stay local.
    pub fn standalone(credentials: CredentialStore, log_level: LogLevelSwitch) -> Self {
        Self {
            credentials,
            log_level,
            to_master: None,
        }
    }

    pub fn connected(
        credentials: CredentialStore,
        log_level: LogLevelSwitch,
        to_master: UnboundedSender<CoordinationMessage>,
    ) -> Self {
        Self {
            credentials,
            log_level,
            to_master: Some(to_master),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn log_level(&self) -> &LogLevelSwitch {
        &self.log_level
    }

    /// Ready once the store holds a token and a worker id.
    pub fn is_ready(&self) -> bool {
        self.credentials.is_ready()
    }

    /// The platform pushed new credentials to this worker.
    pub fn on_credentials_received(&self, creds: Credentials) -> Result<(), CoordinationError> {
        self.credentials.replace(creds.clone());
        info!(worker_id = %creds.worker_id, "credentials received");
        self.report_credential_update(creds)
    }

    /// The platform asked this worker to change verbosity.
    pub fn on_log_level_requested(&self, level: LogLevel) -> Result<(), CoordinationError> {
        self.log_level.set(level);
        info!(%level, "log level requested");
        self.report_log_level_update(level)
    }

    pub fn report_credential_update(&self, creds: Credentials) -> Result<(), CoordinationError> {
        self.send(CoordinationMessage::CredentialUpdateFromWorker(creds))
    }

    pub fn report_log_level_update(&self, level: LogLevel) -> Result<(), CoordinationError> {
        self.send(CoordinationMessage::LogLevelUpdateFromWorker(level))
    }

    fn send(&self, msg: CoordinationMessage) -> Result<(), CoordinationError> {
        match &self.to_master {
            Some(tx) => {
                let method = msg.method();
                tx.send(msg)
                    .map_err(|_| CoordinationError::ChannelClosed(method.to_string()))
            }
            None => {
                debug!(method = %msg.method(), "no master link, update stays local");
                Ok(())
            }
        }
    }

    /// Apply a message from the master. Returns whether local state changed.
    pub fn apply(&self, msg: CoordinationMessage) -> Result<bool, CoordinationError> {
        if !msg.is_from_master() {
            return Err(CoordinationError::WrongDirection(msg.method().to_string()));
        }
        match msg {
            CoordinationMessage::CredentialUpdateFromMaster(creds) => {
                let changed = self.credentials.replace(creds);
                debug!(changed, "credentials synced from master");
                Ok(changed)
            }
            CoordinationMessage::LogLevelUpdateFromMaster(level) => {
                let changed = self.log_level.set(level);
                debug!(changed, %level, "log level synced from master");
                Ok(changed)
            }
            other => Err(CoordinationError::WrongDirection(other.method().to_string())),
        }
    }

    /// Apply every message from `inbox` until the master side closes it.
    pub async fn serve(&self, mut inbox: UnboundedReceiver<CoordinationMessage>) -> Result<(), CoordinationError> {
        while let Some(msg) = inbox.recv().await {
            if let Err(err) = self.apply(msg) {
                error!(error = %err, "invalid message from master");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Wire a worker to a line-based channel: `reader` carries the master's
    /// messages, `writer` carries ours.
    ///
    /// The returned task finishes when the reader hits EOF, or fails on the
    /// first malformed coordination message.
    pub fn connect_io<R, W>(
        credentials: CredentialStore,
        log_level: LogLevelSwitch,
        reader: R,
        writer: W,
    ) -> (Self, JoinHandle<Result<(), CoordinationError>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<CoordinationMessage>();
        tokio::spawn(async move {
            let mut w = BufWriter::new(writer);
            while let Some(msg) = rx.recv().await {
                if let Err(e) = w.write_all(msg.to_line().as_bytes()).await {
                    warn!(error = %e, "coordination write failed, master gone?");
                    break;
                }
                if w.flush().await.is_err() {
                    break;
                }
            }
        });

        let runtime = Self::connected(credentials, log_level, tx);
        let reader_runtime = runtime.clone();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "coordination read failed");
                        return Err(CoordinationError::ChannelClosed(e.to_string()));
                    }
                }
                // invalid utf-8 is noise like any other non JSON-RPC line
                let line = String::from_utf8_lossy(&buf);
                let decoded = CoordinationMessage::from_line(&line).and_then(|msg| match msg {
                    Some(msg) => reader_runtime.apply(msg).map(|_| ()),
                    None => Ok(()),
                });
                if let Err(err) = decoded {
                    error!(error = %err, "invalid message from master");
                    return Err(err);
                }
            }
            debug!("master closed the coordination channel");
            Ok(())
        });
        (runtime, task)
    }

    /// `connect_io` over this process's stdin/stdout.
    pub fn run_stdio(
        credentials: CredentialStore,
        log_level: LogLevelSwitch,
    ) -> (Self, JoinHandle<Result<(), CoordinationError>>) {
        Self::connect_io(credentials, log_level, tokio::io::stdin(), tokio::io::stdout())
    }
}
