//! Error taxonomy for the ordering-and-resolution core.
//!
//! Every component tags its failures with one of these kinds so that C7
//! (the pipeline driver) is the only place that decides whether to retry,
//! degrade, or shut down. Nothing below this boundary makes that call
//! itself — see `Classify`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Lock-map CAS failure, kernel map momentarily busy.
    #[error("transient contention: {0}")]
    Contention(String),

    /// Cache miss, kernel map `KeyNotFound`, or a truncated dentry chain.
    /// Not fatal: the caller decides whether to fall back or emit an
    /// abnormal-path event.
    #[error("resolution shortfall: {0}")]
    Shortfall(#[from] ResolutionShortfall),

    /// Bad payload, too few bytes, unparseable wire record.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Unknown event type, missing kernel map at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O failure that isn't the "pid vanished" case, which is swallowed
    /// by the caller instead of being wrapped here.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A kernel map that was present at startup disappeared mid-run.
    #[error("unrecoverable kernel state: {0}")]
    Unrecoverable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionShortfall {
    #[error("not found in cache")]
    NotFound,
    #[error("dentry path key not found")]
    KeyNotFound,
    #[error("dentry chain truncated")]
    TruncatedParents,
    #[error("invalid key")]
    InvalidKey,
}

/// What C7 should do in response to a `CoreError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry with the component's own bounded back-off.
    Retry,
    /// Not an error worth surfacing beyond a counter bump or an
    /// abnormal-path event; keep going.
    Degrade,
    /// Abort startup immediately.
    FailFast,
    /// Initiate graceful shutdown.
    Shutdown,
}

pub trait Classify {
    fn disposition(&self) -> Disposition;
}

impl Classify for CoreError {
    fn disposition(&self) -> Disposition {
        match self {
            CoreError::Contention(_) => Disposition::Retry,
            CoreError::Shortfall(_) => Disposition::Degrade,
            CoreError::Malformed(_) => Disposition::Degrade,
            CoreError::Configuration(_) => Disposition::FailFast,
            CoreError::Io(_) => Disposition::Degrade,
            CoreError::Unrecoverable(_) => Disposition::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_retries() {
        let err = CoreError::Contention("lock busy".into());
        assert_eq!(err.disposition(), Disposition::Retry);
    }

    #[test]
    fn shortfall_degrades() {
        let err: CoreError = ResolutionShortfall::TruncatedParents.into();
        assert_eq!(err.disposition(), Disposition::Degrade);
    }

    #[test]
    fn configuration_error_fails_fast() {
        let err = CoreError::Configuration("missing map pathnames".into());
        assert_eq!(err.disposition(), Disposition::FailFast);
    }

    #[test]
    fn unrecoverable_shuts_down() {
        let err = CoreError::Unrecoverable("pathnames map vanished".into());
        assert_eq!(err.disposition(), Disposition::Shutdown);
    }
}
