//! Shared fixtures for pipeline integration tests
//!
//! A [`Workbench`] is a temporary repo with a build script, plus the three
//! mock seams wired into a [`PipelineOrchestrator`].

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbuild_lane::collect::{ArtifactRule, ArtifactSpec};
use crossbuild_lane::mock::{MockBuild, MockEmulation, MockRuntime, MockSink};
use crossbuild_lane::publish::ArtifactSink;
use crossbuild_lane::signal::CancellationCoordinator;
use crossbuild_lane::{PipelineOrchestrator, PipelineSettings, PlatformEntry, PlatformMatrix, RunReport};
use tempfile::TempDir;

pub const HOST_ARCH: &str = "x86_64";

pub struct Workbench {
    pub dir: TempDir,
    pub runtime: MockRuntime,
    pub emulation: MockEmulation,
    pub sink: MockSink,
    pub cancel: CancellationCoordinator,
}

impl Workbench {
    pub fn new(runtime: MockRuntime) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join("ci")).unwrap();
        fs::write(repo.join("ci/build.sh"), "#!/bin/sh\nmake release\n").unwrap();
        fs::write(repo.join("Makefile"), "release:\n").unwrap();
        Self {
            dir,
            runtime,
            emulation: MockEmulation::new(),
            sink: MockSink::new(),
            cancel: CancellationCoordinator::default(),
        }
    }

    pub fn repo(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings::new("ghcr.io/example/app-build:1", "ci/build.sh").resolve_paths(&self.repo())
    }

    pub fn orchestrator(&self, settings: PipelineSettings) -> PipelineOrchestrator {
        self.orchestrator_with_sink(settings, Arc::new(self.sink.clone()))
    }

    pub fn orchestrator_with_sink(
        &self,
        settings: PipelineSettings,
        sink: Arc<dyn ArtifactSink>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            settings,
            Arc::new(self.runtime.clone()),
            Arc::new(self.emulation.clone()),
            sink,
            self.cancel.clone(),
        )
        .with_host_arch(HOST_ARCH)
    }

    /// Run `matrix` with `settings` through the mock sink
    pub fn run(&self, settings: PipelineSettings, matrix: &PlatformMatrix, spec: &ArtifactSpec) -> RunReport {
        let image = settings.image.clone();
        let entrypoint = settings.entrypoint.clone();
        self.orchestrator(settings).run_all(matrix, &image, &entrypoint, spec)
    }

    pub fn run_dir(&self, settings: &PipelineSettings, report: &RunReport) -> PathBuf {
        settings.work_root.join(&report.run_id)
    }
}

pub fn matrix(entries: Vec<PlatformEntry>) -> PlatformMatrix {
    PlatformMatrix::new(entries).unwrap()
}

pub fn binary_spec() -> ArtifactSpec {
    ArtifactSpec::new(vec![ArtifactRule::required("target/release/app")]).unwrap()
}

/// Binary, package, locale tree and resources, as a typical app build
/// declares them
pub fn app_spec() -> ArtifactSpec {
    ArtifactSpec::new(vec![
        ArtifactRule::required("target/release/app"),
        ArtifactRule::required("target/debian/*.deb").with_dest("packages"),
        ArtifactRule::required("target/locale"),
        ArtifactRule::optional("assets/*.png").with_dest("resources"),
    ])
    .unwrap()
}

/// A build that produces just the binary
pub fn binary_build(marker: &str) -> MockBuild {
    MockBuild::success().with_file("target/release/app", marker)
}

/// A build that produces every output of [`app_spec`]
pub fn app_build(arch: &str) -> MockBuild {
    MockBuild::success()
        .with_file("target/release/app", format!("app for {}", arch))
        .with_file(format!("target/debian/app_1.0_{}.deb", arch), "deb")
        .with_file("target/locale/de/LC_MESSAGES/app.mo", "de")
        .with_file("target/locale/fr/LC_MESSAGES/app.mo", "fr")
        .with_file("assets/icon.png", "png")
        .with_file("assets/notes.txt", "ignored")
}

/// Every file in `dir`, relative, sorted
pub fn list_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}
