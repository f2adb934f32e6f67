//! Error taxonomy of the engine
//!
//! Binding and configuration errors are scoped to one rule or rule instance,
//! evaluation errors to one parameter of one sample, and persistence errors
//! to one flush batch. None of them is fatal to the engine as a whole.

use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Failure to turn expression text into a bound evaluator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    #[error("Failed to parse expressions. {0}")]
    Parse(String),

    #[error("No twin matches found for [{0}]")]
    NoTwinMatch(String),

    #[error("Unknown variable {0}")]
    UnknownVariable(String),

    #[error("Unknown function {0}")]
    UnknownFunction(String),

    #[error("{function} expects {expected} arguments but got {actual}")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("Circular references are not allowed: {0}")]
    CircularReference(String),

    #[error("Macro {name} is invalid: {reason}")]
    InvalidMacro { name: String, reason: String },

    #[error("Depends on failed parameter {0}")]
    FailedDependency(String),

    #[error("{0}")]
    Invalid(String),
}

/// Runtime failure evaluating one parameter for one sample
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Missing value for {0}")]
    MissingValue(String),

    #[error("Insufficient Data for {0}")]
    InsufficientData(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Expression produced a non-finite value")]
    NonFinite,
}

/// Malformed rule definitions or engine settings
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("rule {rule_id}: {message}")]
    InvalidRule { rule_id: String, message: String },

    #[error("invalid engine configuration: {0}")]
    InvalidEngine(String),
}

/// Failure of a flush batch against the persistence collaborator
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("persistence write timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("engine has shut down")]
    Shutdown,
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Persistence(PersistenceError::Storage(err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
