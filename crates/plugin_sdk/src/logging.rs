use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_appender::{non_blocking::WorkerGuard, rolling::daily};
use tracing_subscriber::{Registry, fmt, prelude::*, reload};

use crate::message::LogLevel;

pub type ReloadHandle = reload::Handle<LevelFilter, Registry>;

/// The process's current log verbosity.
///
/// When built by [`init_tracing`] a change is pushed straight into the
/// installed subscriber; a detached switch (tests, embedding hosts that own
/// their subscriber) only records the level.
#[derive(Clone)]
pub struct LogLevelSwitch {
    tx: Arc<watch::Sender<LogLevel>>,
    handle: Option<ReloadHandle>,
}

impl std::fmt::Debug for LogLevelSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelSwitch")
            .field("level", &self.level())
            .field("reloadable", &self.handle.is_some())
            .finish()
    }
}

impl Default for LogLevelSwitch {
    fn default() -> Self {
        Self::detached(LogLevel::default())
    }
}

impl LogLevelSwitch {
    pub fn detached(initial: LogLevel) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            handle: None,
        }
    }

    pub fn with_reload(initial: LogLevel, handle: ReloadHandle) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            handle: Some(handle),
        }
    }

    pub fn level(&self) -> LogLevel {
        *self.tx.borrow()
    }

    /// Apply `level`. Returns `true` if it differed from the current one.
    pub fn set(&self, level: LogLevel) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == level {
                false
            } else {
                *current = level;
                true
            }
        });
        if changed {
            if let Some(handle) = &self.handle {
                if let Err(err) = handle.modify(|filter| *filter = level.into()) {
                    // subscriber already gone (process shutting down)
                    eprintln!("could not reload log level: {err}");
                }
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<LogLevel> {
        self.tx.subscribe()
    }
}

/// Install the global subscriber: a reloadable level filter plus either a
/// daily rolling file under `log_dir` or stderr.
///
/// Stdout is never written to; in a worker it carries the coordination
/// channel to the master.
pub fn init_tracing(
    level: LogLevel,
    log_dir: Option<&Path>,
    file_prefix: &str,
) -> Result<(LogLevelSwitch, Option<WorkerGuard>)> {
    let (filter, handle) = reload::Layer::new(LevelFilter::from(level));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create log dir {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(daily(dir, file_prefix));
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let stderr_layer = log_dir
        .is_none()
        .then(|| fmt::layer().with_writer(std::io::stderr));

    Registry::default()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok((LogLevelSwitch::with_reload(level, handle), guard))
}
