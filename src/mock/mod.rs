//! In-process test doubles
//!
//! Scriptable implementations of the three seams the pipeline talks
//! through:
//!
//! - [`MockRuntime`]: a [`ContainerRuntime`](crate::runner::ContainerRuntime)
//!   whose builds succeed, fail, hang, or drop files into the mounted
//!   workspace, per platform
//! - [`MockEmulation`]: an [`EmulationBackend`](crate::emulation::EmulationBackend)
//!   that counts registrations
//! - [`MockSink`]: an [`ArtifactSink`](crate::publish::ArtifactSink) that
//!   keeps published bundles in memory
//!
//! All three are cheap to clone; clones share state so a test can keep a
//! handle after giving one to the pipeline.

mod runtime;
mod sink;

pub use runtime::{MockBuild, MockRuntime};
pub use sink::{MockEmulation, MockSink, PublishedBundle};
