//! Typed pipeline settings

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::defaults::{DEFAULT_OUTPUT_DIR, DEFAULT_WORK_ROOT};
use super::ConfigError;
use crate::collect::{ArtifactRule, ArtifactSpec};
use crate::emulation::EmulationSettings;
use crate::matrix::{PlatformEntry, PlatformMatrix};
use crate::publish::BundleSettings;
use crate::runner::RuntimeSettings;
use crate::timeout::TimeoutConfig;
use crate::workspace::{ExcludeRules, WorkspaceSettings};

/// Everything a run needs, after layering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Build-environment image reference
    #[serde(default)]
    pub image: String,
    /// Build script, relative to `source_root` unless absolute
    #[serde(default)]
    pub entrypoint: PathBuf,
    #[serde(default = "default_source_root")]
    pub source_root: PathBuf,
    /// Per-run state, logs and workspace copies
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    /// Where sinks publish bundles
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub emulation: EmulationSettings,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub bundle: BundleSettings,
    #[serde(default)]
    pub matrix: Vec<PlatformEntry>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRule>,
}

fn default_source_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_work_root() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_ROOT)
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn default_parallel() -> usize {
    1
}

impl PipelineSettings {
    /// Settings with defaults for everything but the image and entrypoint
    pub fn new(image: impl Into<String>, entrypoint: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            entrypoint: entrypoint.into(),
            source_root: default_source_root(),
            work_root: default_work_root(),
            output_dir: default_output_dir(),
            parallel: default_parallel(),
            runtime: RuntimeSettings::default(),
            emulation: EmulationSettings::default(),
            timeout: TimeoutConfig::default(),
            workspace: WorkspaceSettings::default(),
            bundle: BundleSettings::default(),
            matrix: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Anchor relative `source_root`, `work_root` and `output_dir` at
    /// `base`, and `entrypoint` at the source root
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let anchor = |p: &Path, at: &Path| if p.is_absolute() { p.to_path_buf() } else { at.join(p) };
        self.source_root = anchor(&self.source_root, base);
        self.work_root = anchor(&self.work_root, base);
        self.output_dir = anchor(&self.output_dir, base);
        if !self.entrypoint.as_os_str().is_empty() {
            self.entrypoint = anchor(&self.entrypoint, &self.source_root);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::ValidationError("image is required".to_string()));
        }
        if self.entrypoint.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError("entrypoint is required".to_string()));
        }
        if self.parallel == 0 {
            return Err(ConfigError::ValidationError("parallel must be at least 1".to_string()));
        }
        if self.parallel > 1 && !self.workspace.isolate {
            return Err(ConfigError::ValidationError(
                "parallel > 1 requires workspace.isolate = true".to_string(),
            ));
        }
        self.timeout
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        self.bundle
            .naming_rule()
            .validate()
            .map_err(ConfigError::ValidationError)?;
        if self.runtime.program.trim().is_empty() {
            return Err(ConfigError::ValidationError("runtime.program must not be empty".to_string()));
        }
        ExcludeRules::new(&self.workspace.exclude)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        self.platform_matrix()?;
        self.artifact_spec()?;
        Ok(())
    }

    pub fn platform_matrix(&self) -> Result<PlatformMatrix, ConfigError> {
        Ok(PlatformMatrix::new(self.matrix.clone())?)
    }

    pub fn artifact_spec(&self) -> Result<ArtifactSpec, ConfigError> {
        Ok(ArtifactSpec::new(self.artifacts.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> PipelineSettings {
        let mut settings = PipelineSettings::new("build-env:1", "ci/build.sh");
        settings.matrix = vec![PlatformEntry::new("linux/amd64", "x86_64")];
        settings.artifacts = vec![ArtifactRule::required("target/release/app")];
        settings
    }

    #[test]
    fn test_valid_settings() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_image_and_entrypoint() {
        let mut s = valid();
        s.image = " ".to_string();
        assert!(s.validate().unwrap_err().to_string().contains("image"));

        let mut s = valid();
        s.entrypoint = PathBuf::new();
        assert!(s.validate().unwrap_err().to_string().contains("entrypoint"));
    }

    #[test]
    fn test_parallel_requires_isolation() {
        let mut s = valid();
        s.parallel = 0;
        assert!(s.validate().is_err());

        let mut s = valid();
        s.parallel = 4;
        s.workspace.isolate = false;
        assert!(s.validate().unwrap_err().to_string().contains("isolate"));

        s.workspace.isolate = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_timeout_bounds() {
        let mut s = valid();
        s.timeout = TimeoutConfig::default().with_overall_seconds(0);
        assert!(s.validate().unwrap_err().to_string().contains("overall_seconds"));
    }

    #[test]
    fn test_bad_prefix_and_matrix() {
        let mut s = valid();
        s.bundle.prefix = Some("a/b".to_string());
        assert!(s.validate().is_err());

        let mut s = valid();
        s.matrix.push(PlatformEntry::new("linux/amd64", "amd64"));
        assert!(matches!(s.validate(), Err(ConfigError::Matrix(_))));
    }

    #[test]
    fn test_resolve_paths() {
        let mut s = PipelineSettings::new("img", "ci/build.sh");
        s.source_root = PathBuf::from("app");
        let s = s.resolve_paths(Path::new("/repo"));
        assert_eq!(s.source_root, PathBuf::from("/repo/app"));
        assert_eq!(s.entrypoint, PathBuf::from("/repo/app/ci/build.sh"));
        assert_eq!(s.work_root, PathBuf::from("/repo/.crossbuild/work"));

        let s = PipelineSettings::new("img", "/opt/build.sh").resolve_paths(Path::new("/repo"));
        assert_eq!(s.entrypoint, PathBuf::from("/opt/build.sh"));
    }

    #[test]
    fn test_deserialize_from_toml_shape() {
        let value = serde_json::json!({
            "image": "build-env:1",
            "entrypoint": "ci/build.sh",
            "emulation": {"mode": "never"},
            "bundle": {"format": "tar", "prefix": "app"},
            "matrix": [
                {"platform": "linux/amd64", "arch": "x86_64"},
                {"platform": "linux/arm64", "arch": "aarch64", "enabled": false}
            ],
            "artifacts": [
                {"pattern": "target/debian/*.deb", "dest": "pkg"},
                {"pattern": "i18n/locale", "required": false}
            ]
        });
        let s: PipelineSettings = serde_json::from_value(value).unwrap();
        assert_eq!(s.parallel, 1);
        assert_eq!(s.bundle.format, crate::publish::BundleFormat::Tar);
        assert_eq!(s.emulation.mode, crate::emulation::EmulationPolicy::Never);
        assert!(!s.matrix[1].enabled);
        assert!(s.artifacts[0].required);
        assert!(!s.artifacts[1].required);
        assert_eq!(s.platform_matrix().unwrap().len(), 1);
    }
}
