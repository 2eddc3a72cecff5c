//! On-disk layout of the tool's user directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

const TOOL_DIR: &str = ".mimic";

/// Locations under the user directory (`~/.mimic` unless overridden).
#[derive(Debug, Clone)]
pub struct ToolPaths {
    root: PathBuf,
}

impl ToolPaths {
    /// Use `root` when given, otherwise `~/.mimic`.
    pub fn resolve(root: Option<PathBuf>) -> Result<Self> {
        if let Some(root) = root {
            return Ok(Self { root });
        }
        let home = dirs::home_dir().ok_or_else(|| {
            EngineError::Config("unable to determine the user's home directory".into())
        })?;
        Ok(Self {
            root: home.join(TOOL_DIR),
        })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// JAR files, distributions and serverless packages, per version.
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Native binaries, one sub-directory per version.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Scratch space for bundles.
    pub fn bundles_dir(&self) -> PathBuf {
        self.root.join("bundles")
    }

    pub fn prefs_file(&self) -> PathBuf {
        self.root.join("prefs.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.yaml")
    }
}

/// Create `dir` (and parents) if absent, restricting it to the current user.
pub fn ensure_dir(dir: &Path) -> Result<PathBuf> {
    if !dir.exists() {
        create_private_dir(dir)?;
    }
    Ok(dir.to_path_buf())
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Apply the mode used for files the tool writes (0644 on Unix).
pub fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}
