//! Finding engines this tool manages on the host.
//!
//! Process kinds are discovered by scanning the OS process table for a
//! matching executable name and command line; container kinds query the
//! runtime by label (see `engine::container`). Both sit behind
//! [`PeerDiscovery`] so callers do not care which probing strategy applies.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::options::DEFAULT_PORT;

pub const DEFAULT_TLS_PORT: u16 = 8443;

/// One engine found running on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedEngine {
    pub name: String,
    pub id: String,
    pub port: u16,
}

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Every managed engine of this kind on the host.
    async fn list(&self) -> Result<Vec<ManagedEngine>>;

    /// Kill every managed engine of this kind; returns how many were stopped.
    async fn stop_all(&self) -> Result<usize>;
}

/// Derives an engine's listen port from its argv and environment.
pub type PortExtractor = fn(args: &[String], env: &[String]) -> u16;

/// Describes how to recognise one engine kind in the process table.
#[derive(Debug, Clone)]
pub struct ProcessMatcher {
    pub process_name: String,
    pub command_pattern: Regex,
    pub extract_port: PortExtractor,
}

impl ProcessMatcher {
    pub fn new(process_name: &str, command_pattern: &str, extract_port: PortExtractor) -> Result<Self> {
        let command_pattern = Regex::new(command_pattern).map_err(|e| {
            EngineError::Config(format!("invalid process pattern '{command_pattern}': {e}"))
        })?;
        Ok(Self {
            process_name: process_name.to_string(),
            command_pattern,
            extract_port,
        })
    }

    /// Exact name match (ignoring a Windows `.exe` suffix) and at least one
    /// argv element matching the pattern.
    pub fn matches(&self, name: &str, args: &[String]) -> bool {
        let name = name.strip_suffix(".exe").unwrap_or(name);
        name == self.process_name && args.iter().any(|arg| self.command_pattern.is_match(arg))
    }
}

/// Scans OS processes with a [`ProcessMatcher`].
#[derive(Debug, Clone)]
pub struct ProcessDiscovery {
    matcher: ProcessMatcher,
}

impl ProcessDiscovery {
    pub fn new(matcher: ProcessMatcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &ProcessMatcher {
        &self.matcher
    }

    /// Kill the managed engines listening on `port`; returns how many were
    /// stopped.
    pub async fn stop_port(&self, port: u16) -> Result<usize> {
        let matcher = self.matcher.clone();
        let stopped = tokio::task::spawn_blocking(move || scan_processes(&matcher, true, Some(port)))
            .await
            .map_err(|e| EngineError::Lifecycle(format!("process scan failed: {e}")))?;
        Ok(stopped.len())
    }
}

#[async_trait]
impl PeerDiscovery for ProcessDiscovery {
    async fn list(&self) -> Result<Vec<ManagedEngine>> {
        let matcher = self.matcher.clone();
        let found = tokio::task::spawn_blocking(move || scan_processes(&matcher, false, None))
            .await
            .map_err(|e| EngineError::Lifecycle(format!("process scan failed: {e}")))?;
        Ok(found)
    }

    async fn stop_all(&self) -> Result<usize> {
        let matcher = self.matcher.clone();
        let stopped = tokio::task::spawn_blocking(move || scan_processes(&matcher, true, None))
            .await
            .map_err(|e| EngineError::Lifecycle(format!("process scan failed: {e}")))?;
        Ok(stopped.len())
    }
}

/// Enumerate matching processes, optionally only those on `port`, killing
/// each one when `kill` is set. Only successfully killed processes are
/// returned in that case.
fn scan_processes(matcher: &ProcessMatcher, kill: bool, port: Option<u16>) -> Vec<ManagedEngine> {
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
    );
    let own_pid = std::process::id();

    let mut found = Vec::new();
    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        // argv is unreadable for processes owned by other users; skip them
        let args = process.cmd();
        if args.is_empty() || !matcher.matches(process.name(), args) {
            continue;
        }

        let engine = ManagedEngine {
            name: process.name().to_string(),
            id: pid.as_u32().to_string(),
            port: (matcher.extract_port)(args, process.environ()),
        };
        if port.is_some_and(|p| p != engine.port) {
            continue;
        }

        if kill {
            if process.kill() {
                debug!(pid = %engine.id, port = engine.port, "Killed engine process");
                found.push(engine);
            } else {
                warn!(pid = %engine.id, "Unable to kill engine process");
            }
        } else {
            found.push(engine);
        }
    }
    found.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.id.cmp(&b.id)));
    found
}

/// Value of `--long value`, `--long=value` or `-s value`.
pub fn flag_value(args: &[String], long: &str, short: Option<&str>) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg
            .strip_prefix(long)
            .and_then(|rest| rest.strip_prefix('='))
        {
            return Some(value.to_string());
        }
        if arg == long || short.is_some_and(|s| arg == s) {
            return iter.next().cloned();
        }
    }
    None
}

/// Whether `--flag` or `--flag=true` is present.
pub fn flag_enabled(args: &[String], long: &str) -> bool {
    args.iter().any(|arg| {
        arg == long
            || arg
                .strip_prefix(long)
                .and_then(|rest| rest.strip_prefix('='))
                .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    })
}

fn env_value(env: &[String], key: &str) -> Option<String> {
    env.iter().find_map(|entry| {
        entry
            .split_once('=')
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
    })
}

/// JVM kinds: `--listenPort`/`-l`, else 8443 when TLS is enabled, else 8080.
pub fn jvm_port(args: &[String], _env: &[String]) -> u16 {
    if let Some(port) = flag_value(args, "--listenPort", Some("-l")).and_then(|p| p.parse().ok()) {
        return port;
    }
    if flag_enabled(args, "--tlsEnabled") {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PORT
    }
}

/// Native kind: `--listenPort`/`-l`, else `MIMIC_LISTEN_PORT`, else 8080.
pub fn native_port(args: &[String], env: &[String]) -> u16 {
    flag_value(args, "--listenPort", Some("-l"))
        .or_else(|| env_value(env, "MIMIC_LISTEN_PORT"))
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_flag_value_forms() {
        assert_eq!(
            flag_value(&args(&["--listenPort=9000"]), "--listenPort", Some("-l")),
            Some("9000".to_string())
        );
        assert_eq!(
            flag_value(&args(&["--listenPort", "9001"]), "--listenPort", Some("-l")),
            Some("9001".to_string())
        );
        assert_eq!(
            flag_value(&args(&["-l", "9002"]), "--listenPort", Some("-l")),
            Some("9002".to_string())
        );
        assert_eq!(
            flag_value(&args(&["--listenPort"]), "--listenPort", Some("-l")),
            None
        );
    }

    #[test]
    fn test_flag_value_does_not_match_prefix_of_other_flag() {
        assert_eq!(
            flag_value(&args(&["--listenPortX=1"]), "--listenPort", None),
            None
        );
    }

    #[test]
    fn test_jvm_port_defaults() {
        assert_eq!(jvm_port(&args(&["java", "-jar", "engine.jar"]), &[]), 8080);
        assert_eq!(
            jvm_port(&args(&["java", "-jar", "engine.jar", "--tlsEnabled"]), &[]),
            8443
        );
        assert_eq!(
            jvm_port(
                &args(&["java", "-jar", "engine.jar", "--tlsEnabled=true", "-l", "7000"]),
                &[]
            ),
            7000
        );
        assert_eq!(
            jvm_port(&args(&["java", "--tlsEnabled=false"]), &[]),
            8080
        );
    }

    #[test]
    fn test_native_port_reads_environment() {
        let env = args(&["HOME=/root", "MIMIC_LISTEN_PORT=5050"]);
        assert_eq!(native_port(&args(&["mimic-engine"]), &env), 5050);
        assert_eq!(
            native_port(&args(&["mimic-engine", "--listenPort", "6060"]), &env),
            6060
        );
        assert_eq!(native_port(&args(&["mimic-engine"]), &[]), 8080);
    }

    #[test]
    fn test_matcher_requires_name_and_argument() {
        let matcher = ProcessMatcher::new("java", r"engine-[^/\\]+\.jar$", jvm_port).unwrap();
        assert!(matcher.matches(
            "java",
            &args(&["java", "-jar", "/home/u/.mimic/cache/engine-4.0.0.jar"])
        ));
        assert!(matcher.matches("java.exe", &args(&["java", "-jar", "engine-4.0.0.jar"])));
        assert!(!matcher.matches("javaw", &args(&["javaw", "-jar", "engine-4.0.0.jar"])));
        assert!(!matcher.matches("java", &args(&["java", "-jar", "other.jar"])));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = ProcessMatcher::new("java", "(", jvm_port).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn test_scan_finds_nothing_for_unknown_process() {
        let matcher = ProcessMatcher::new("no-such-engine-binary", ".*", native_port).unwrap();
        let discovery = ProcessDiscovery::new(matcher);
        assert!(discovery.list().await.unwrap().is_empty());
        assert_eq!(discovery.stop_all().await.unwrap(), 0);
    }
}
