use mimic_engine::LogLevel;
use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Log to stderr at `level`, keeping the HTTP and container client crates quiet
/// unless tracing is requested.
pub fn init(level: LogLevel) {
    let deps = match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "info",
        _ => "warn",
    };
    let filter = EnvFilter::new(format!(
        "{level},hyper={deps},hyper_util={deps},reqwest={deps},bollard={deps},rustls={deps}"
    ));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}
