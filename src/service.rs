//! Worker control surface.
//!
//! Line-delimited JSON-RPC 2.0 over TCP. Every worker of a pool binds the
//! same port with `SO_REUSEPORT` and the kernel spreads connections across
//! them, so any call may land on any worker.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use plugin_sdk::{
    CoordinationError, Credentials, EntityContextCache, WorkerRuntime,
    jsonrpc::{
        Id, INVALID_PARAMS, METHOD_NOT_FOUND, NOT_READY, PARSE_ERROR, Request, Response,
        SERVER_ERROR,
    },
    message::{ContextParams, HealthResult, InitResult, LogLevelParams},
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpSocket, TcpStream},
};
use tracing::{debug, info, warn};

use crate::builder::ContextBuilder;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("method `{0}` not found")]
    MethodNotFound(String),

    #[error("invalid params for `{method}`: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("not ready")]
    NotReady,

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("{0}")]
    Build(String),
}

impl ControlError {
    pub fn code(&self) -> i64 {
        match self {
            ControlError::MethodNotFound(_) => METHOD_NOT_FOUND,
            ControlError::InvalidParams { .. } => INVALID_PARAMS,
            ControlError::NotReady => NOT_READY,
            ControlError::Coordination(_) | ControlError::Build(_) => SERVER_ERROR,
        }
    }
}

/// One worker's request-side state: its runtime, its cache and the builder
/// that fills the cache.
pub struct WorkerService<B: ContextBuilder> {
    runtime: WorkerRuntime,
    cache: EntityContextCache<B::Context>,
    builder: Arc<B>,
    context_ttl: Duration,
}

impl<B: ContextBuilder> WorkerService<B> {
    pub fn new(runtime: WorkerRuntime, builder: B, context_ttl: Duration) -> Self {
        Self {
            runtime,
            cache: EntityContextCache::new(),
            builder: Arc::new(builder),
            context_ttl,
        }
    }

    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub fn cache(&self) -> &EntityContextCache<B::Context> {
        &self.cache
    }

    /// Handle one decoded call. Notifications get no response.
    pub async fn handle(&self, req: Request) -> Option<Response> {
        let notification = req.is_notification();
        let id = req.id.clone().unwrap_or(Id::Null);
        let result = self.dispatch(&req.method, req.params).await;
        if notification {
            if let Err(err) = result {
                debug!(method = %req.method, error = %err, "control notification failed");
            }
            return None;
        }
        Some(match result {
            Ok(value) => Response::success(id, value),
            Err(err) => {
                debug!(method = %req.method, error = %err, "control call failed");
                Response::fail(id, err.code(), err.to_string(), None)
            }
        })
    }

    /// Handle one raw line from a control connection.
    pub async fn handle_line(&self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Request>(line) {
            Ok(req) => self.handle(req).await,
            Err(err) => Some(Response::fail(Id::Null, PARSE_ERROR, err.to_string(), None)),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, ControlError> {
        match method {
            "init" => {
                let creds: Credentials = parse_params(method, params)?;
                self.runtime.on_credentials_received(creds)?;
                to_value(InitResult {
                    ready: self.runtime.is_ready(),
                })
            }
            "setLogLevel" => {
                let LogLevelParams { level } = parse_params(method, params)?;
                self.runtime.on_log_level_requested(level)?;
                Ok(json!({ "logLevel": level }))
            }
            "health" => to_value(HealthResult {
                ready: self.runtime.is_ready(),
                log_level: self.runtime.log_level().level(),
                pid: std::process::id(),
            }),
            "context" => {
                let ContextParams { entity_id, preview } = parse_params(method, params)?;
                let context = self.context(&entity_id, preview).await?;
                Ok(json!({ "entityId": entity_id, "context": to_value(context)? }))
            }
            other => Err(ControlError::MethodNotFound(other.to_string())),
        }
    }

    /// Look up or build the instance context for `entity_id`. `preview`
    /// traffic always rebuilds.
    pub async fn context(&self, entity_id: &str, preview: bool) -> Result<B::Context, ControlError> {
        if !self.runtime.is_ready() {
            return Err(ControlError::NotReady);
        }
        let credentials = self.runtime.credentials().snapshot();
        let builder = Arc::clone(&self.builder);
        let key = entity_id.to_string();
        let pending = self.cache.get_or_build(
            entity_id,
            move || async move { builder.build(&key, &credentials).await },
            self.context_ttl,
            preview,
        );
        pending.await.map_err(|err| ControlError::Build(format!("{:#}", err.cause())))
    }

    /// Accept control connections until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("control surface stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = service.serve_connection(stream).await {
                            debug!(%peer, error = %err, "control connection closed");
                        }
                    });
                }
            }
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(rsp) = self.handle_line(&line).await {
                write.write_all(rsp.to_line().as_bytes()).await?;
                write.flush().await?;
            }
        }
        Ok(())
    }
}

/// Bind `addr` so that every worker of the pool can share it.
pub fn bind_shared(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    #[cfg(not(unix))]
    warn!("SO_REUSEPORT unavailable, only one worker can bind {addr}");
    socket.bind(addr)?;
    socket.listen(1024)
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Option<Value>) -> Result<T, ControlError> {
    let params = params.unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| ControlError::InvalidParams {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, ControlError> {
    serde_json::to_value(value).map_err(|e| {
        warn!(error = %e, "could not encode control result");
        ControlError::Build(e.to_string())
    })
}
