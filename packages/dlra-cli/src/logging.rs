// Logging setup; stdout is reserved for the remote-helper protocol
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Filter directive for a git verbosity level (1 is git's default)
pub fn level_for_verbosity(verbosity: u32) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Adjusts the log filter after startup
pub struct LogHandle {
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    /// RUST_LOG was given and takes precedence
    pinned: bool,
}

impl LogHandle {
    /// Handle that changes nothing, for when no subscriber was installed
    pub fn disabled() -> Self {
        Self {
            reload: None,
            pinned: false,
        }
    }

    /// Re-level logging to match git's `verbosity` option
    pub fn set_verbosity(&self, verbosity: u32) {
        if self.pinned {
            tracing::debug!("RUST_LOG is set, ignoring verbosity {}", verbosity);
            return;
        }
        let Some(reload) = &self.reload else {
            return;
        };
        if let Err(e) = reload.reload(EnvFilter::new(level_for_verbosity(verbosity))) {
            tracing::warn!("Failed to change log level: {}", e);
        }
    }
}

/// Install the global subscriber, writing to stderr.
///
/// The filter comes from RUST_LOG if set, else `default_level`.
pub fn init(default_level: &str) -> LogHandle {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let filter = from_env.unwrap_or_else(|| EnvFilter::new(default_level));
    let (filter, reload) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();

    match installed {
        Ok(()) => LogHandle {
            reload: Some(reload),
            pinned,
        },
        Err(_) => LogHandle::disabled(),
    }
}
