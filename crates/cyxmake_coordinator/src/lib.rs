//! Coordinator for the distributed build plane.
//!
//! Owns the worker registry, the work scheduler, and the artifact cache;
//! accepts worker connections over the WebSocket transport and drives
//! builds from submission to completion.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod registry;
pub mod scheduler;

pub use auth::{AuthConfig, Authenticator};
pub use config::{CoordinatorConfig, ConfigError};
pub use coordinator::{BuildOptions, Coordinator};
pub use registry::{
    RegistryConfig, RegistryError, RegistryEvent, RemoteWorker, SelectionCriteria, WorkerRegistry,
};
pub use scheduler::{
    decompose_compile, suggest_strategy, BuildSession, ScheduledJob, SchedulerConfig,
    SchedulerError, SchedulerEvent, WorkScheduler,
};
