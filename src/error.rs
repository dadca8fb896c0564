//! # Error types used by the supervisor runtime.
//!
//! Each concern gets its own enum:
//!
//! - [`ServerError`] lifecycle transitions (start, stop, restart).
//! - [`RconError`] remote console invocations.
//! - [`EventError`] event registry construction.
//! - [`StoreError`] game-state parsing failures.
//! - [`DbError`] tracking-database operations.
//! - [`ConfigError`] configuration load, save, and validation.
//!
//! The lifecycle and RCON enums provide `as_label()` for stable log labels.
//! [`StoreError::BadIndex`] is the one fatal kind: it is routed to the
//! top-level fatal channel and terminates the process, because a non-integer
//! faction index means the data upstream is corrupt.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by server lifecycle transitions.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ServerError {
    /// Another transition (start, stop, or restart) is already in flight.
    #[error("another lifecycle transition is already in progress")]
    Busy,

    /// Restart was requested too soon after a successful start.
    #[error("server was started less than {debounce:?} ago")]
    TooSoon {
        /// The restart debounce window.
        debounce: Duration,
    },

    /// The child never reported readiness and was killed.
    #[error("server took longer than {timeout:?} to become ready")]
    StartTimeout { timeout: Duration },

    /// The child did not exit within the stop deadline and was killed.
    #[error("server took longer than {timeout:?} to exit and was killed")]
    StopTimeout { timeout: Duration },

    /// The child reported a failed startup and exited.
    #[error("server initialization failed")]
    StartFailed,

    /// Start was called while the child process is still running.
    #[error("cannot start a server that is already running")]
    AlreadyRunning,

    /// The server binary could not be executed.
    #[error("failed to run server binary {path}: {source}")]
    Exec {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The galaxy directory could not be created.
    #[error("failed to create galaxy directory {path}: {source}")]
    GalaxyDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The mod configuration file could not be generated.
    #[error("failed to generate mod configuration: {0}")]
    ModConfig(#[source] std::io::Error),

    /// The tracking database could not be opened or read at startup.
    #[error("tracking database: {0}")]
    Tracking(#[from] DbError),

    /// A built-in event failed to register.
    #[error("event registration failed: {0}")]
    Events(#[from] EventError),
}

impl ServerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ServerError::Busy => "server_busy",
            ServerError::TooSoon { .. } => "server_too_soon",
            ServerError::StartTimeout { .. } => "server_start_timeout",
            ServerError::StopTimeout { .. } => "server_stop_timeout",
            ServerError::StartFailed => "server_start_failed",
            ServerError::AlreadyRunning => "server_already_running",
            ServerError::Exec { .. } => "server_exec_failed",
            ServerError::GalaxyDir { .. } => "server_galaxy_dir",
            ServerError::ModConfig(_) => "server_mod_config",
            ServerError::Tracking(_) => "server_tracking_db",
            ServerError::Events(_) => "server_events",
        }
    }
}

/// Errors raised by the RCON gateway.
///
/// The gateway never retries. `Timeout` escalates in the status supervisor,
/// which treats a failed liveness probe as a hang and kills the child.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RconError {
    /// The child process is not running.
    #[error("server is not online")]
    ServerDown,

    /// The external RCON client did not finish within the deadline.
    #[error("rcon command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The game rejected the command. The original output is preserved.
    #[error("invalid command provided: {output}")]
    InvalidCommand { output: String },

    /// The external RCON client failed to run or exited non-zero.
    #[error("failed to run rcon command ({cmd}): {reason}")]
    Failed { cmd: String, reason: String },
}

impl RconError {
    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            RconError::ServerDown => "rcon_server_down",
            RconError::Timeout { .. } => "rcon_timeout",
            RconError::InvalidCommand { .. } => "rcon_invalid_command",
            RconError::Failed { .. } => "rcon_failed",
        }
    }
}

/// Errors raised while building the event registry.
#[derive(Error, Debug)]
pub enum EventError {
    /// An event with this name is already registered.
    #[error("event '{name}' is already registered")]
    DuplicateName { name: String },

    /// The event pattern failed to compile.
    #[error("event '{name}' has an invalid pattern: {source}")]
    BadPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors raised while parsing game data into the state mirror.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A faction index that does not parse as an integer. Fatal: corruption
    /// upstream must not be silently absorbed.
    #[error("invalid faction index provided ({index})")]
    BadIndex { index: String },

    /// A data string that does not match any known shape. The line is skipped.
    #[error("failed to parse data string ({line})")]
    BadDataString { line: String },
}

/// Errors raised by the tracking database.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] tokio_rusqlite::rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
}

/// Errors raised by configuration handling.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write configuration file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
