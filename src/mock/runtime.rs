//! Scriptable container runtime

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbuild_runtime::{ContainerInvocation, ProcessOutcome, RuntimeError, StopReason};

use crate::runner::ContainerRuntime;
use crate::signal::CancellationCoordinator;

const POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32),
    LaunchError(String),
    Hang,
}

/// Scripted behavior of one build
#[derive(Debug, Clone)]
pub struct MockBuild {
    behavior: Behavior,
    files: Vec<(String, Vec<u8>)>,
    delay: Option<Duration>,
    cancels: Option<CancellationCoordinator>,
}

impl MockBuild {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            files: Vec::new(),
            delay: None,
            cancels: None,
        }
    }

    pub fn success() -> Self {
        Self::with_behavior(Behavior::Exit(0))
    }

    pub fn exit(code: i32) -> Self {
        Self::with_behavior(Behavior::Exit(code))
    }

    pub fn launch_error(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::LaunchError(message.into()))
    }

    /// Runs until stopped
    pub fn hang() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    /// Write `contents` at `path` under the first writable mount
    pub fn with_file(mut self, path: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        self.files.push((path.into(), contents.as_ref().to_vec()));
        self
    }

    /// Sleep (while still honoring stop requests) before exiting
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Request cancellation of the run as soon as this build starts
    pub fn cancelling(mut self, cancel: CancellationCoordinator) -> Self {
        self.cancels = Some(cancel);
        self
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    builds: HashMap<String, MockBuild>,
    invocations: Vec<ContainerInvocation>,
}

/// Container runtime that never launches a process
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<RuntimeState>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl MockRuntime {
    /// Every platform succeeds without output unless scripted otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build(self, platform: impl Into<String>, build: MockBuild) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.builds.insert(platform.into(), build);
        }
        self
    }

    /// Invocations received, in call order
    pub fn invocations(&self) -> Vec<ContainerInvocation> {
        self.state
            .lock()
            .map(|s| s.invocations.clone())
            .unwrap_or_default()
    }

    /// Platforms of received invocations, in call order
    pub fn platforms(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .filter_map(|inv| inv.platform)
            .collect()
    }

    /// Highest number of builds observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, invocation: &ContainerInvocation) -> MockBuild {
        let platform = invocation.platform.clone().unwrap_or_default();
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.invocations.push(invocation.clone());
        state
            .builds
            .get(&platform)
            .cloned()
            .unwrap_or_else(MockBuild::success)
    }

    fn wait(
        duration: Option<Duration>,
        should_stop: &mut dyn FnMut() -> Option<StopReason>,
    ) -> Option<StopReason> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(reason) = should_stop() {
                return Some(reason);
            }
            if duration.is_some_and(|d| waited >= d) {
                return None;
            }
            std::thread::sleep(POLL);
            waited += POLL;
        }
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn run(
        &self,
        invocation: &ContainerInvocation,
        log_path: &Path,
        should_stop: &mut dyn FnMut() -> Option<StopReason>,
    ) -> Result<ProcessOutcome, RuntimeError> {
        let build = self.script_for(invocation);
        if let Behavior::LaunchError(message) = &build.behavior {
            return Err(RuntimeError::Launch {
                program: "mock".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()),
            });
        }

        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let result = self.execute(&build, invocation, log_path, should_stop);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockRuntime {
    fn execute(
        &self,
        build: &MockBuild,
        invocation: &ContainerInvocation,
        log_path: &Path,
        should_stop: &mut dyn FnMut() -> Option<StopReason>,
    ) -> Result<ProcessOutcome, RuntimeError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut log = fs::File::create(log_path)?;
        writeln!(log, "mock build: {}", invocation)?;

        if let Some(root) = invocation.writable_mounts().next().map(|m| m.host.clone()) {
            for (path, contents) in &build.files {
                let target = root.join(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, contents)?;
            }
        }

        if let Some(cancel) = &build.cancels {
            cancel.cancel();
        }

        let limit = match build.behavior {
            Behavior::Hang => None,
            _ => Some(build.delay.unwrap_or(Duration::ZERO)),
        };
        if let Some(reason) = Self::wait(limit, should_stop) {
            writeln!(log, "stopped: {:?}", reason)?;
            return Ok(ProcessOutcome::Stopped(reason));
        }

        let code = match build.behavior {
            Behavior::Exit(code) => code,
            _ => 0,
        };
        writeln!(log, "exit: {}", code)?;
        Ok(ProcessOutcome::Exited { code, signal: None })
    }
}
