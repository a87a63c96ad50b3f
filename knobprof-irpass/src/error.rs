use thiserror::Error;

/// Failure modes of the standalone analysis pass. Everything here is
/// surfaced to the user through the binary's `anyhow` boundary; the pass
/// itself is under no obligation to keep running after one of these.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("failed to parse IR module at {path}: {message}")]
    ModuleParse { path: std::path::PathBuf, message: String },

    #[error("taint seed file not found at {0}")]
    SeedsMissing(std::path::PathBuf),

    #[error("invalid taint glob {pattern:?}: {source}")]
    BadTaintGlob {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("could not create output directory {0}")]
    OutDir(std::path::PathBuf, #[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
