//! juez - automated judge for single-function C exercises.
//!
//! A submission is compiled together with the exercise's reference harness,
//! run in an isolated process under time, memory and output limits, and
//! given exactly one verdict.

pub mod cancel;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod grader;
pub mod janitor;
pub mod metrics;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod text;
pub mod verdict;
pub mod workspace;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use compiler::{CompileError, CompiledArtifact, Compiler};
pub use config::{Config, ConfigError};
pub use executor::Executor;
pub use grader::{GradeReport, Grader};
pub use registry::{Registry, RegistryError};
pub use sandbox::SandboxPolicy;
