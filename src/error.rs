//! Error types for the acquisition engine.
//!
//! `AcqError` is the single error enum returned by the chain, the scheduler and
//! the scan driver. Driver and preset code report failures through
//! `anyhow::Result`; the engine wraps those with the name of the object and the
//! lifecycle phase that failed.
//!
//! ## Error Categories
//!
//! - **Configuration**: invalid tree edits (`Configuration`) and settings files
//!   that fail to load (`Settings`).
//! - **Protocol**: the trigger/reading protocol was violated at runtime
//!   (`TriggerOverrun`, `AbortedTrigger`, `NotReady`, `NotImplemented`).
//! - **Propagated**: failures coming out of driver or preset code (`Device`,
//!   `Preset`) and tasks that died (`TaskFailed`).
//! - **Data**: `ChannelValidation` when emitted data does not match the channel.
//!
//! Errors raised by the engine itself may travel through driver code (a master
//! driver calls `Slaves::trigger_slaves()?` inside its own `trigger`). When such
//! an error comes back as `anyhow::Error` it is downcast again, so callers can
//! always match on the original variant.

use thiserror::Error;

/// Lifecycle phase of an acquisition object, used in errors, logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prepare,
    Start,
    Trigger,
    Stop,
    Reading,
    WaitReady,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Prepare => "prepare",
            Phase::Start => "start",
            Phase::Trigger => "trigger",
            Phase::Stop => "stop",
            Phase::Reading => "reading",
            Phase::WaitReady => "wait_ready",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the engine error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Primary error type of the acquisition engine.
#[derive(Error, Debug)]
pub enum AcqError {
    /// Invalid edit of the acquisition tree.
    ///
    /// Raised by `Chain::add` when a slave already has another master, when two
    /// objects share a name, when a device is used as a master or when an edit
    /// would create a cycle.
    ///
    /// **Recovery Strategy**: fix the chain construction code; nothing ran yet.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A trigger task left over from the previous round was killed.
    ///
    /// This is the error injected into the stale task itself. The caller of
    /// `trigger_slaves()` receives `TriggerOverrun` instead.
    #[error("{master}: previous trigger of '{slave}' is not done, aborting")]
    AbortedTrigger { master: String, slave: String },

    /// A master was asked to trigger again while some slaves had not finished
    /// the previous round. `slaves` names exactly the offending slaves.
    #[error("{master}: aborted due to bad triggering on slaves: {}", slaves.join(", "))]
    TriggerOverrun { master: String, slaves: Vec<String> },

    /// `prepare` was called on a device whose reading task is still running.
    #[error("{0}: last reading task is not finished")]
    NotReady(String),

    /// A lifecycle method was left abstract by the concrete driver.
    #[error("{0}() is not implemented")]
    NotImplemented(&'static str),

    /// A preset hook failed. The user error is kept unchanged.
    #[error(transparent)]
    Preset(anyhow::Error),

    /// A driver method failed.
    #[error("{object}.{phase} failed: {source}")]
    Device {
        object: String,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    /// Data emitted into a channel does not match its declaration.
    #[error("Channel '{channel}': {reason}")]
    ChannelValidation { channel: String, reason: String },

    /// A spawned task panicked or was cancelled without an error of its own.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),
}

impl AcqError {
    /// Wraps a driver failure, keeping engine errors that travelled through
    /// driver code intact.
    pub fn from_driver(object: &str, phase: Phase, source: anyhow::Error) -> Self {
        match source.downcast::<AcqError>() {
            Ok(engine_error) => engine_error,
            Err(source) => AcqError::Device {
                object: object.to_string(),
                phase,
                source,
            },
        }
    }

    /// Wraps a preset failure. Engine errors are unwrapped, user errors are kept as is.
    pub fn from_preset(source: anyhow::Error) -> Self {
        match source.downcast::<AcqError>() {
            Ok(engine_error) => engine_error,
            Err(source) => AcqError::Preset(source),
        }
    }

    pub(crate) fn validation(channel: &str, reason: impl Into<String>) -> Self {
        AcqError::ChannelValidation {
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for AcqError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            AcqError::TaskFailed("task was cancelled".to_string())
        } else {
            AcqError::TaskFailed(format!("task panicked: {}", err))
        }
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Settings(Box::new(err))
    }
}
