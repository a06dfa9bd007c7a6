//! Container invocation description
//!
//! A [`ContainerInvocation`] is the full, declarative input to one
//! `<runtime> run` call. Rendering it is pure so the exact argv can be
//! shown in dry-run output and asserted in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Access mode of a bind mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

impl MountMode {
    fn suffix(&self) -> &'static str {
        match self {
            MountMode::ReadWrite => "rw",
            MountMode::ReadOnly => "ro",
        }
    }
}

/// A host path bound into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Absolute path on the host
    pub host: PathBuf,
    /// Absolute path inside the container
    pub container: String,
    /// Access mode
    pub mode: MountMode,
}

impl Mount {
    /// Read-write bind mount
    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadWrite,
        }
    }

    /// Read-only bind mount
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            mode: MountMode::ReadOnly,
        }
    }

    /// Render as a `-v` value (`host:container:mode`)
    pub fn to_volume_arg(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            self.mode.suffix()
        )
    }
}

/// Everything needed to launch one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInvocation {
    /// Image reference (e.g. `ghcr.io/org/build-env:latest`)
    pub image: String,
    /// Container name, used to kill it on timeout or cancellation
    pub name: Option<String>,
    /// Platform constraint (`--platform`)
    pub platform: Option<String>,
    /// Bind mounts in declaration order
    pub mounts: Vec<Mount>,
    /// Working directory inside the container
    pub workdir: Option<String>,
    /// Environment variables (sorted for stable argv)
    pub env: BTreeMap<String, String>,
    /// Extra runtime flags inserted before the image
    pub extra_args: Vec<String>,
    /// Run with `--privileged`
    pub privileged: bool,
    /// Remove the container when it exits (`--rm`)
    pub remove: bool,
    /// Command and arguments after the image
    pub command: Vec<String>,
}

impl ContainerInvocation {
    /// Create an invocation for the given image with `--rm` set
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            platform: None,
            mounts: Vec::new(),
            workdir: None,
            env: BTreeMap::new(),
            extra_args: Vec::new(),
            privileged: false,
            remove: true,
            command: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = String>) -> Self {
        self.command = command.into_iter().collect();
        self
    }

    /// Arguments for `<runtime> ...`, starting with `run`
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];

        if self.remove {
            args.push("--rm".to_string());
        }
        if let Some(ref name) = self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        if let Some(ref platform) = self.platform {
            args.push("--platform".to_string());
            args.push(platform.clone());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.to_volume_arg());
        }
        if let Some(ref workdir) = self.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());

        args
    }

    /// Mounts that are writable from inside the container
    pub fn writable_mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts
            .iter()
            .filter(|m| m.mode == MountMode::ReadWrite)
    }
}

impl fmt::Display for ContainerInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.run_args().join(" "))
    }
}
