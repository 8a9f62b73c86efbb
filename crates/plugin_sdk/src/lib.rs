pub mod cache;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod in_process;
pub mod jsonrpc;
pub mod logging;
pub mod message;
pub mod process;
pub mod worker;

pub use cache::{BuildError, CacheStats, ContextFuture, EntityContextCache};
pub use coordinator::{
    CanonicalState, Supervisor, SupervisorConfig, WorkerInfo, WorkerSlot, WorkerSpawner,
    WorkerState,
};
pub use credentials::CredentialStore;
pub use error::{CoordinationError, SpawnError};
pub use in_process::InProcessSpawner;
pub use logging::{LogLevelSwitch, init_tracing};
pub use message::{CoordinationMessage, Credentials, LogLevel};
pub use process::{ProcessSpawner, ProcessSpec};
pub use worker::WorkerRuntime;
