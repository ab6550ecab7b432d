pub mod config;
pub mod ide_client;

pub use config::{load_config, ClientConfig};
pub use ide_client::{
    scan_descriptors, select_session, ChoicePrompt, ConnectionState, IdeClient, IdeError,
    OpenDiffRequest, OpenFileOptions, PeerNotification, SessionDescriptor, StdinPrompt,
};

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Install the global tracing subscriber, writing to stderr.
///
/// The filter comes from `RUST_LOG`, defaulting to `ide_bridge=info,warn`.
/// Stdout is left alone so interactive prompts stay readable. Fails if a
/// global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), IdeError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ide_bridge=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Pretty => builder.with_ansi(false).try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| IdeError::ConfigError {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "ide-bridge tracing initialized"
    );
    Ok(())
}
