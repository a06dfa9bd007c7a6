//! Local filesystem sinks
//!
//! Both sinks write into a temporary sibling first and rename it into
//! place, so a reader sees either the previous bundle or the complete new
//! one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tar::{Builder, Header};
use tracing::debug;

use super::{ArtifactSink, BundleFile, SinkError};

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SinkError + '_ {
    move |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_sibling(output_dir: &Path, name: &str, suffix: &str) -> PathBuf {
    output_dir.join(format!(".{}.{}-{}", name, suffix, uuid::Uuid::new_v4().simple()))
}

/// Writes `<output_dir>/<bundle_name>/`
#[derive(Debug, Clone)]
pub struct DirectorySink {
    output_dir: PathBuf,
}

impl DirectorySink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write_all(&self, tmp: &Path, files: &[BundleFile]) -> Result<(), SinkError> {
        fs::create_dir_all(tmp).map_err(io_err(tmp))?;
        for file in files {
            let target = tmp.join(&file.relative_path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::copy(&file.source, &target).map_err(io_err(&file.source))?;
        }
        Ok(())
    }
}

impl ArtifactSink for DirectorySink {
    fn name(&self) -> &str {
        "directory"
    }

    fn publish(&self, bundle_name: &str, files: &[BundleFile]) -> Result<String, SinkError> {
        fs::create_dir_all(&self.output_dir).map_err(io_err(&self.output_dir))?;
        let target = self.output_dir.join(bundle_name);
        let tmp = temp_sibling(&self.output_dir, bundle_name, "tmp");

        if let Err(e) = self.write_all(&tmp, files) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        // Move a previous bundle aside so the final rename cannot fail on a
        // non-empty target
        let old = if target.exists() {
            let old = temp_sibling(&self.output_dir, bundle_name, "old");
            fs::rename(&target, &old).map_err(io_err(&target))?;
            Some(old)
        } else {
            None
        };

        if let Err(e) = fs::rename(&tmp, &target) {
            if let Some(old) = &old {
                let _ = fs::rename(old, &target);
            }
            let _ = fs::remove_dir_all(&tmp);
            return Err(io_err(&target)(e));
        }

        if let Some(old) = old {
            let _ = fs::remove_dir_all(old);
        }
        debug!(bundle = bundle_name, path = %target.display(), "directory bundle written");
        Ok(target.display().to_string())
    }
}

/// Writes a deterministic `<output_dir>/<bundle_name>.tar`
///
/// Entries are sorted by path with zero mtime, uid and gid. File modes are
/// normalized to 0644, or 0755 when the source is executable.
#[derive(Debug, Clone)]
pub struct TarSink {
    output_dir: PathBuf,
}

impl TarSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write_tar(&self, path: &Path, files: &[BundleFile]) -> io::Result<()> {
        // path -> file; None marks a directory
        let mut entries: BTreeMap<String, Option<&BundleFile>> = BTreeMap::new();
        for file in files {
            let mut dir = Path::new(&file.relative_path).parent();
            while let Some(d) = dir.filter(|d| !d.as_os_str().is_empty()) {
                entries.entry(d.to_string_lossy().into_owned()).or_insert(None);
                dir = d.parent();
            }
            entries.insert(file.relative_path.clone(), Some(file));
        }

        let out = BufWriter::new(File::create(path)?);
        let mut builder = Builder::new(out);

        for (rel_path, file) in &entries {
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            match file {
                Some(file) => {
                    let contents = fs::read(&file.source)?;
                    header.set_path(rel_path)?;
                    header.set_size(contents.len() as u64);
                    header.set_mode(if is_executable(&file.source) { 0o755 } else { 0o644 });
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_cksum();
                    builder.append(&header, contents.as_slice())?;
                }
                None => {
                    header.set_path(format!("{}/", rel_path))?;
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_cksum();
                    builder.append(&header, io::empty())?;
                }
            }
        }

        let mut out = builder.into_inner()?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }
}

impl ArtifactSink for TarSink {
    fn name(&self) -> &str {
        "tar"
    }

    fn publish(&self, bundle_name: &str, files: &[BundleFile]) -> Result<String, SinkError> {
        fs::create_dir_all(&self.output_dir).map_err(io_err(&self.output_dir))?;
        let target = self.output_dir.join(format!("{}.tar", bundle_name));
        let tmp = temp_sibling(&self.output_dir, bundle_name, "tar.tmp");

        if let Err(e) = self.write_tar(&tmp, files) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&tmp)(e));
        }
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&target)(e));
        }

        debug!(bundle = bundle_name, path = %target.display(), "tar bundle written");
        Ok(target.display().to_string())
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    false
}
