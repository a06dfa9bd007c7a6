//! crossbuild-lane: multi-architecture containerized builds
//!
//! Builds an application for a matrix of (platform, arch) pairs. For each
//! enabled entry it provisions foreign-architecture emulation once per run,
//! runs the build inside a build-environment container, collects the
//! declared outputs, and publishes them as a platform-qualified bundle.
//!
//! Container execution lives in the `crossbuild-runtime` crate; this crate
//! owns the matrix, the per-entry lifecycle, and the run report.

pub mod collect;
pub mod config;
pub mod emulation;
pub mod job;
pub mod matrix;
pub mod mock;
pub mod pipeline;
pub mod publish;
pub mod runner;
pub mod signal;
pub mod state;
pub mod summary;
pub mod timeout;
pub mod workspace;

pub use collect::{ArtifactBundle, ArtifactCollector, ArtifactRule, ArtifactSpec, CollectError};
pub use config::{ConfigError, EffectiveConfig, PipelineSettings};
pub use emulation::{EmulationBackend, EmulationPolicy, EmulationProvisioner, ProvisionError};
pub use matrix::{MatrixError, PlatformEntry, PlatformMatrix};
pub use pipeline::{PipelineOrchestrator, RunPlan};
pub use publish::{ArtifactPublisher, ArtifactSink, NamingRule, PublishError};
pub use runner::{BuildError, ContainerBuildRunner, ContainerRuntime};
pub use summary::{EntryOutcome, ExitCode, RunReport, Status};
