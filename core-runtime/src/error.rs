use thiserror::Error;

/// Failures of the ambient runtime (logging setup).
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid log directives `{directives}`: {reason}")]
    InvalidDirectives { directives: String, reason: String },

    /// A global subscriber is already installed in this process.
    #[error("logging already initialised: {0}")]
    AlreadyInitialized(String),
}

pub type Result<T> = std::result::Result<T, Error>;
