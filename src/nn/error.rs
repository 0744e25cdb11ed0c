use thiserror::Error;

/// weight file rejection reasons. all of these abort startup; a network
/// that half-loads must never play.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read weights: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported weights format version {0:?}")]
    Version(String),
    #[error("malformed weights at line {line}")]
    Parse { line: usize },
    #[error("{lines} weight lines do not form a residual tower")]
    Structure { lines: usize },
    #[error("{name} holds {found} values where {expected} were expected")]
    Shape {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("batch norm does not match the convolution in the {0} head")]
    Head(&'static str),
}

/// evaluation failures are unrecoverable: rather than play silently
/// wrong moves the search reports and stops.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("self-check found a reproducible mismatch: {0}")]
    Mismatch(String),
    #[error("self-check exhausted its tolerance for transient mismatches: {0}")]
    Unstable(String),
}
