pub mod app;
pub mod builder;
pub mod config;
pub mod service;

pub use builder::{ContextBuilder, PlatformContextBuilder};
pub use config::HostConfig;
pub use service::{ControlError, WorkerService, bind_shared};
