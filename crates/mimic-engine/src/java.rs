//! Locating a Java runtime for the JVM engine kinds.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::{EngineError, Result};

#[cfg(windows)]
const JAVA_BINARY: &str = "java.exe";
#[cfg(not(windows))]
const JAVA_BINARY: &str = "java";

const MACOS_JAVA_HOME: &str = "/usr/libexec/java_home";

/// Find `java`: PATH first, then `JAVA_HOME`, then (macOS) `java_home`.
pub fn find_java() -> Result<PathBuf> {
    if let Ok(path) = which::which("java") {
        debug!(path = %path.display(), "Found java on PATH");
        return Ok(path);
    }

    if let Some(home) = env::var_os("JAVA_HOME").filter(|h| !h.is_empty()) {
        let candidate = java_in_home(Path::new(&home));
        debug!(path = %candidate.display(), "Using java from JAVA_HOME");
        return Ok(candidate);
    }

    if cfg!(target_os = "macos") {
        if let Some(home) = macos_java_home() {
            let candidate = java_in_home(&home);
            debug!(path = %candidate.display(), "Using java from java_home");
            return Ok(candidate);
        }
    }

    Err(EngineError::prerequisite(
        "unable to locate a Java runtime",
        "install Java and add it to PATH, or set JAVA_HOME",
    ))
}

/// `<home>/bin/java` (with `.exe` on Windows).
pub fn java_in_home(home: &Path) -> PathBuf {
    home.join("bin").join(JAVA_BINARY)
}

fn macos_java_home() -> Option<PathBuf> {
    let output = Command::new(MACOS_JAVA_HOME).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let home = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!home.is_empty()).then(|| PathBuf::from(home))
}
