//error.rs
//! Error types for the deltanet constraint-evaluation network

use thiserror::Error;

/// Result type alias for deltanet operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Main error type for deltanet operations.
///
/// Structural errors indicate session misuse or internal corruption and are
/// always fatal. `UserFunction` wraps a failure raised inside a user-supplied
/// closure together with the facts it was looking at.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("Fact with ID {0} already exists")]
    DuplicateFact(i64),

    #[error("Fact with ID {0} not found")]
    FactNotFound(i64),

    #[error("No source node registered for type {type_name}")]
    UnregisteredType { type_name: String },

    #[error("More than two source nodes declared for type {type_name}")]
    TooManySources { type_name: String },

    #[error("Resource limit exceeded: {limit_type} - {details}")]
    ResourceLimit { limit_type: String, details: String },

    #[error("Invalid tuple handle: {reason}")]
    InvalidHandle { reason: String },

    #[error("Arena error: {details}")]
    Arena { details: String },

    #[error("Network building error: {details}")]
    Build { details: String },

    #[error("Consistency check failed: {details}")]
    ConsistencyViolation { details: String },

    #[error("User function failed in {context}: {message}; facts: {facts}")]
    UserFunction {
        context: String,
        message: String,
        facts: String,
    },

    #[error("{0}")]
    Other(String),
}

impl NetError {
    pub fn duplicate_fact(id: i64) -> Self {
        Self::DuplicateFact(id)
    }

    pub fn fact_not_found(id: i64) -> Self {
        Self::FactNotFound(id)
    }

    pub fn unregistered_type(type_name: impl Into<String>) -> Self {
        Self::UnregisteredType {
            type_name: type_name.into(),
        }
    }

    pub fn too_many_sources(type_name: impl Into<String>) -> Self {
        Self::TooManySources {
            type_name: type_name.into(),
        }
    }

    pub fn resource_limit(limit_type: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ResourceLimit {
            limit_type: limit_type.into(),
            details: details.into(),
        }
    }

    pub fn invalid_handle(reason: impl Into<String>) -> Self {
        Self::InvalidHandle {
            reason: reason.into(),
        }
    }

    pub fn arena_error(details: impl Into<String>) -> Self {
        Self::Arena {
            details: details.into(),
        }
    }

    pub fn build_error(details: impl Into<String>) -> Self {
        Self::Build {
            details: details.into(),
        }
    }

    pub fn consistency_violation(details: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            details: details.into(),
        }
    }

    pub fn user_function(
        context: impl Into<String>,
        message: impl Into<String>,
        facts: impl Into<String>,
    ) -> Self {
        Self::UserFunction {
            context: context.into(),
            message: message.into(),
            facts: facts.into(),
        }
    }
}

impl From<String> for NetError {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<&str> for NetError {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}
