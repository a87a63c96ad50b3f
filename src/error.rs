use thiserror::Error;

/// Failure modes of the sampling runtime's non-signal-handler code paths.
///
/// Signal-handler-reachable code (§4.A, §4.D, §4.E) cannot return `Result` at
/// all -- it has no stack to unwind into and must not allocate -- so those
/// paths thread failure through sentinel values and silent skips instead.
/// This enum only covers `monstartup`, the config loader, and the artifact
/// writers.
#[derive(Error, Debug)]
pub enum ProfError {
    #[error("failed to allocate profiling arenas ({requested} bytes)")]
    ArenaAllocation { requested: usize },

    #[error("config file not found at {0}")]
    ConfigMissing(std::path::PathBuf),

    #[error("config line {line} malformed: {text}")]
    ConfigMalformed { line: usize, text: String },

    #[error("program name mismatch: info.txt names {expected:?}, running as {actual:?}")]
    ProgramNameMismatch { expected: String, actual: String },

    #[error("variable arena exhausted (limit {limit})")]
    ArenaExhausted { limit: usize },

    #[error("failed to install signal handler")]
    SignalInstall(#[source] std::io::Error),

    #[error("failed to write artifact {path}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine text segment bounds")]
    NoTextBounds,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProfError>;
