use clap::{Args, Parser, Subcommand};
use mimic_engine::{DirectoryMount, EngineKind, LogLevel, PullPolicy, DEFAULT_PORT};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mimic", version, about = "Run, record and package mock HTTP engines")]
pub struct Cli {
    /// Log level: trace, debug, info, warn or error
    #[arg(long, global = true, env = "LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Tool directory holding caches, preferences and config.yaml [default: ~/.mimic]
    #[arg(long, global = true, env = "MIMIC_HOME")]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an engine serving the mocks in a directory; blocks until interrupted
    Up(UpArgs),
    /// Stop every engine this tool manages
    Down(KindFilter),
    /// List running engines this tool manages
    List(ListArgs),
    /// Record traffic to an upstream into mock configuration
    Proxy(ProxyArgs),
    /// Package a mock directory with the engine
    Bundle(BundleArgs),
    /// Manage cached engine artifacts
    Engine(EngineCommandArgs),
    /// Print the CLI and engine versions
    Version(EngineArgs),
    /// Check the host for every engine type's prerequisites
    Doctor,
}

/// Engine type and version selection shared by several commands.
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Engine type [default: container-core]
    #[arg(long = "engine-type", short = 't', env = "MIMIC_ENGINE_TYPE")]
    pub engine_type: Option<EngineKind>,

    /// Engine version, or `latest` [default: latest]
    #[arg(long = "engine-version", env = "MIMIC_ENGINE_VERSION")]
    pub engine_version: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Directory containing mock configuration files
    #[arg(long, short = 'c', default_value = ".")]
    pub config_dir: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Port the engine listens on
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// When to fetch the engine artifact: skip, if-absent or always
    #[arg(long, default_value_t = PullPolicy::IfAbsent)]
    pub pull_policy: PullPolicy,

    /// Extra directory to expose to the engine, HOST:GUEST (repeatable)
    #[arg(long = "mount", short = 'm')]
    pub mounts: Vec<DirectoryMount>,

    /// Environment variable for the engine, KEY=VALUE (repeatable)
    #[arg(long = "env", short = 'e')]
    pub env: Vec<String>,

    /// Replace an engine already serving the same directory and port
    #[arg(long = "replace")]
    pub replace_running: bool,
}

#[derive(Args, Debug, Default)]
pub struct KindFilter {
    /// Limit to one engine type [default: every type that can run locally]
    #[arg(long = "engine-type", short = 't')]
    pub engine_type: Option<EngineKind>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(flatten)]
    pub filter: KindFilter,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    /// Upstream base URL, e.g. https://api.example.com
    pub upstream: String,

    /// Port the proxy listens on
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Directory receiving the mock configuration and response files
    #[arg(long, short = 'o', default_value = ".")]
    pub output_dir: PathBuf,

    /// Match recorded requests on their body (textual bodies only)
    #[arg(long)]
    pub capture_request_body: bool,

    /// Match recorded requests on their headers
    #[arg(long)]
    pub capture_request_headers: bool,

    /// Record only the first exchange for a method and URL
    #[arg(long)]
    pub ignore_duplicate_requests: bool,

    /// Only record these response headers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub record_only_response_headers: Option<Vec<String>>,

    /// Write all response files into the output directory
    #[arg(long = "flat")]
    pub flat_response_file_structure: bool,

    /// Rewrite upstream URLs in textual responses to point at the proxy
    #[arg(long)]
    pub rewrite_urls: bool,
}

#[derive(Args, Debug)]
pub struct BundleArgs {
    /// Directory containing mock configuration files
    #[arg(long, short = 'c', default_value = ".")]
    pub config_dir: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Zip path, or image tag for container types
    #[arg(long, short = 'o')]
    pub output: Option<String>,
}

#[derive(Args, Debug)]
pub struct EngineCommandArgs {
    #[command(subcommand)]
    pub cmd: EngineCommands,
}

#[derive(Subcommand, Debug)]
pub enum EngineCommands {
    /// Fetch an engine artifact into the local cache
    Pull(PullArgs),
    /// List engine versions available locally
    List(KindFilter),
}

#[derive(Args, Debug)]
pub struct PullArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// When to fetch: if-absent or always
    #[arg(long, default_value_t = PullPolicy::Always)]
    pub pull_policy: PullPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_command_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    #[serial]
    fn test_up_flags() {
        let cli = Cli::try_parse_from([
            "mimic", "up", "-c", "mocks", "-t", "jvm-single-jar", "--engine-version", "4.0.0",
            "-p", "9000", "--mount", "/data:/opt/data", "-e", "A=1", "--replace",
            "--pull-policy", "always",
        ])
        .unwrap();
        let Commands::Up(up) = cli.cmd else {
            panic!("expected up");
        };
        assert_eq!(up.config_dir, PathBuf::from("mocks"));
        assert_eq!(up.engine.engine_type, Some(EngineKind::JvmSingleJar));
        assert_eq!(up.engine.engine_version.as_deref(), Some("4.0.0"));
        assert_eq!(up.port, 9000);
        assert_eq!(up.mounts[0].guest, "/opt/data");
        assert_eq!(up.env, vec!["A=1".to_string()]);
        assert!(up.replace_running);
        assert_eq!(up.pull_policy, PullPolicy::Always);
    }

    #[test]
    #[serial]
    fn test_engine_type_from_environment() {
        std::env::set_var("MIMIC_ENGINE_TYPE", "native-binary");
        let parsed = Cli::try_parse_from(["mimic", "version"]);
        std::env::remove_var("MIMIC_ENGINE_TYPE");

        let Commands::Version(args) = parsed.unwrap().cmd else {
            panic!("expected version");
        };
        assert_eq!(args.engine_type, Some(EngineKind::NativeBinary));
    }

    #[test]
    #[serial]
    fn test_rejects_unknown_engine_type() {
        assert!(Cli::try_parse_from(["mimic", "up", "-t", "vm"]).is_err());
    }

    #[test]
    #[serial]
    fn test_proxy_flags() {
        let cli = Cli::try_parse_from([
            "mimic", "proxy", "http://localhost:9000", "--flat",
            "--record-only-response-headers", "content-type,x-total",
        ])
        .unwrap();
        let Commands::Proxy(proxy) = cli.cmd else {
            panic!("expected proxy");
        };
        assert_eq!(proxy.upstream, "http://localhost:9000");
        assert_eq!(proxy.port, DEFAULT_PORT);
        assert!(proxy.flat_response_file_structure);
        assert_eq!(
            proxy.record_only_response_headers,
            Some(vec!["content-type".to_string(), "x-total".to_string()])
        );
    }
}
