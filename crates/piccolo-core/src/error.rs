//! Structured errors for the orchestration core.
//!
//! Components never let a [`CoreError`] cross the dispatcher boundary directly:
//! the dispatcher converts any `Err(CoreError)` into the `(nok, message)`
//! reply shape required by the command protocol. Everything below this line
//! is free to use `?` normally.

use thiserror::Error;

/// Errors produced by the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A client tried to mutate or delete a reserved spectrum metadata key.
    #[error("metadata key '{0}' is reserved and cannot be modified")]
    ProtectedKey(String),

    /// A requested component name isn't in the dispatcher's registry.
    #[error("unknown component '{0}'")]
    UnknownComponent(String),

    /// A requested command isn't supported by the addressed component.
    #[error("component '{component}' does not support command '{command}'")]
    UnknownCommand { component: String, command: String },

    /// A required keyword argument was missing or had the wrong shape.
    #[error("bad argument for '{command}': {message}")]
    BadArgument { command: String, message: String },

    /// A resource is already busy with another operation.
    #[error("already recording spectrum")]
    Busy,

    /// The shutter was asked to open/close while already in that state.
    #[error("shutter already {0}")]
    ShutterState(&'static str),

    /// Autointegration could not find a usable integration time.
    #[error("autointegration failed: {0}")]
    Autointegration(String),

    /// The data directory is missing, unwritable, or (if configured to be
    /// removable media) not mounted. This is the one fatal startup error.
    #[error("data directory error: {0}")]
    DataDir(String),

    /// A scheduler job specification was rejected (e.g. `at_time` in the past
    /// combined with an `end_time` before it). Logged as a warning, never
    /// raised to the caller, but the scheduler still needs a typed reason
    /// for the log line.
    #[error("invalid job specification: {0}")]
    InvalidJob(String),

    /// Wraps an I/O failure from the output writer or data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps a JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for conditions that don't fit the taxonomy above but still
    /// need to be reported as a client-visible `nok`.
    #[error("{0}")]
    Other(String),
}

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Render the error the way it is carried in a dispatcher `nok` reply.
    pub fn message(&self) -> String {
        self.to_string()
    }
}
