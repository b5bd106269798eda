//! Host-local update orchestration engine.
//!
//! This crate is the execution core of an update orchestrator: the
//! scheduler that turns plugin dependencies and shared-resource
//! declarations into a wave-based execution plan, the mutex and resource
//! controllers that bound concurrency, the plugin process supervisor and
//! its streaming event protocol, the download manager, and the
//! snapshot/rollback subsystem used to recover from a failed run.
//!
//! It deliberately does not include a CLI, a config-file parser, or a
//! terminal UI — those are external collaborators built against the types
//! in [`models`], [`events`], and [`orchestrator`].

pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod models;
pub mod mutex;
pub mod orchestrator;
pub mod phase_controller;
pub mod plugin;
pub mod resource;
pub mod rollback;
pub mod scheduler;

pub use error::{DownloadError, EngineError, RollbackError};
pub use events::{EventQueue, EventQueueHandle, OutputStream, StreamEvent, TimestampedEvent, ValidationIssue, ValidationSeverity, validate_event};
pub use models::{ExecutionResult, ExecutionSummary, Phase, PhaseCommands, PluginConfig, PluginDescriptor, PluginMetadata, PluginStatus};
pub use mutex::MutexManager;
pub use orchestrator::{Orchestrator, SequentialOrchestrator};
pub use phase_controller::{PhaseController, PhaseState};
pub use plugin::{InProcessPlugin, PluginKind, SubprocessPlugin};
pub use resource::{ResourceController, ResourceLimits};
pub use scheduler::ExecutionDag;
