//! Built-in defaults (layer 1)

use serde_json::{json, Value};

use crate::emulation::DEFAULT_BINFMT_IMAGE;
use crate::runner::{DEFAULT_ENTRYPOINT_MOUNT, DEFAULT_SOURCE_MOUNT};
use crate::timeout::DEFAULT_TERMINATION_GRACE_SECONDS;

pub const DEFAULT_WORK_ROOT: &str = ".crossbuild/work";
pub const DEFAULT_OUTPUT_DIR: &str = ".crossbuild/artifacts";

/// Built-in default configuration values
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    pub source_root: String,
    pub work_root: String,
    pub output_dir: String,
    pub parallel: usize,
    pub runtime_program: String,
    pub emulation_mode: String,
    pub emulation_image: String,
    pub termination_grace_seconds: u64,
    pub workspace_isolate: bool,
    pub workspace_keep: String,
    pub bundle_format: String,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            source_root: ".".to_string(),
            work_root: DEFAULT_WORK_ROOT.to_string(),
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            parallel: 1,
            runtime_program: "docker".to_string(),
            emulation_mode: "auto".to_string(),
            emulation_image: DEFAULT_BINFMT_IMAGE.to_string(),
            termination_grace_seconds: DEFAULT_TERMINATION_GRACE_SECONDS,
            workspace_isolate: true,
            workspace_keep: "failed".to_string(),
            bundle_format: "directory".to_string(),
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> Value {
        json!({
            "source_root": self.source_root,
            "work_root": self.work_root,
            "output_dir": self.output_dir,
            "parallel": self.parallel,
            "runtime": {
                "program": self.runtime_program,
                "source_mount": DEFAULT_SOURCE_MOUNT,
                "entrypoint_mount": DEFAULT_ENTRYPOINT_MOUNT,
                "env": {},
                "extra_args": []
            },
            "emulation": {
                "mode": self.emulation_mode,
                "image": self.emulation_image
            },
            "timeout": {
                "termination_grace_seconds": self.termination_grace_seconds
            },
            "workspace": {
                "isolate": self.workspace_isolate,
                "keep": self.workspace_keep,
                "exclude": [".git", ".git/**"]
            },
            "bundle": {
                "format": self.bundle_format,
                "content_digest": false
            },
            "matrix": [],
            "artifacts": []
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_table() {
        let value = BuiltinDefaults::default().to_value();
        for key in ["runtime", "emulation", "timeout", "workspace", "bundle"] {
            assert!(value[key].is_object(), "{key}");
        }
        assert_eq!(value["parallel"], 1);
        assert_eq!(value["workspace"]["keep"], "failed");
        assert!(value["timeout"].get("overall_seconds").is_none());
        assert!(value.get("image").is_none());
    }
}
