//! Error types for uqmc.

use thiserror::Error;

/// uqmc error type
#[derive(Error, Debug)]
pub enum Error {
    /// A variable with this name already exists in the model.
    #[error("duplicate variable name: '{0}'")]
    DuplicateVariable(String),

    /// A distribution references a variable that was not declared before it.
    #[error("variable '{name}' referenced by '{referenced_by}' is not declared in the model")]
    UndeclaredVariable { name: String, referenced_by: String },

    /// Lookup of a name that is not part of the model.
    #[error("unknown variable: '{0}'")]
    UnknownVariable(String),

    /// Vector length does not match the declared dimension.
    #[error("dimension mismatch for '{name}': expected {expected}, got {actual}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// The variable is bound to data and cannot be sampled.
    #[error("variable '{0}' is observed and cannot be a sampling target")]
    ObservedVariable(String),

    /// Every variable in the model is bound to data.
    #[error("model has no unobserved variables to sample")]
    NoUnknowns,

    /// No variable is bound to data, so there is no posterior.
    #[error("model has no observed variables; bind data before sampling")]
    NoObservations,

    /// No sampler in the crate handles this conditional.
    #[error("no sampler available for '{name}': {reason}")]
    UnsupportedCombination { name: String, reason: String },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// TOML configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
