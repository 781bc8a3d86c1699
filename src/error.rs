#![forbid(unsafe_code)]
//! Crate-wide error taxonomy.
//!
//! Compilation failures never reach the execution coordinator. Everything the
//! coordinator surfaces carries the statement text and the complete parameter
//! map so graph-query output stays debuggable.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::query::errors::CompilationError;
use crate::value::Value;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Statement text plus parameters attached to every driver-derived error.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementContext {
    /// Compiled statement text, verbatim.
    pub text: String,
    /// Every bound parameter, untruncated.
    pub parameters: BTreeMap<String, Value>,
}

impl StatementContext {
    /// Builds a context from borrowed parts.
    pub fn new(text: impl Into<String>, parameters: BTreeMap<String, Value>) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }

    /// Context used for failures that are not tied to a statement (begin/commit).
    pub fn none() -> Self {
        Self {
            text: String::new(),
            parameters: BTreeMap::new(),
        }
    }
}

impl fmt::Display for StatementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.text.is_empty() {
            return write!(f, "<no statement>");
        }
        write!(f, "statement `{}` with parameters {{", self.text)?;
        for (idx, (name, value)) in self.parameters.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

/// Errors surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad operator, unknown relationship, malformed predicate. Raised before any network call.
    #[error("compilation error: {0}")]
    Compilation(#[from] CompilationError),
    /// Unique or key constraint breach.
    #[error("constraint violation: {message}; {context}")]
    ConstraintViolation {
        /// Driver message.
        message: String,
        /// Offending statement.
        context: StatementContext,
    },
    /// Deadlock, lock timeout or similar; surfaced only after retries ran out.
    #[error("transient driver error after {attempts} attempt(s): {message}; {context}")]
    TransientDriver {
        /// Driver message of the final failure.
        message: String,
        /// Statement that kept failing.
        context: StatementContext,
        /// Number of attempts made.
        attempts: u32,
    },
    /// Stale or broken connection; surfaced only after reconnect-and-retry ran out.
    #[error("connection error after {attempts} attempt(s): {message}; {context}")]
    Connection {
        /// Driver message of the final failure.
        message: String,
        /// Statement that was being sent.
        context: StatementContext,
        /// Number of attempts made.
        attempts: u32,
    },
    /// Credentials rejected. Never retried.
    #[error("authentication failed: {message}; {context}")]
    Authentication {
        /// Driver message.
        message: String,
        /// Statement that triggered the handshake.
        context: StatementContext,
    },
    /// Any other permanent driver failure (syntax error, unsupported procedure, ...).
    #[error("driver error: {message}; {context}")]
    Driver {
        /// Driver message.
        message: String,
        /// Offending statement.
        context: StatementContext,
    },
    /// Transaction boundary misuse or a rollback-only transaction reaching commit.
    #[error("transaction error: {0}")]
    Transaction(String),
    /// Execution skipped because the caller cancelled before the statement was sent.
    #[error("execution cancelled before send; {0}")]
    Cancelled(StatementContext),
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether the failure would have been eligible for an automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientDriver { .. } | Error::Connection { .. })
    }

    /// Statement context, when the error carries one.
    pub fn context(&self) -> Option<&StatementContext> {
        match self {
            Error::ConstraintViolation { context, .. }
            | Error::TransientDriver { context, .. }
            | Error::Connection { context, .. }
            | Error::Authentication { context, .. }
            | Error::Driver { context, .. }
            | Error::Cancelled(context) => Some(context),
            Error::Compilation(_) | Error::Transaction(_) | Error::Config(_) => None,
        }
    }

    /// Rewrites the attempt count of a retried failure, used when a whole
    /// transaction was retried around it.
    pub(crate) fn with_attempts(self, total: u32) -> Self {
        match self {
            Error::TransientDriver {
                message, context, ..
            } => Error::TransientDriver {
                message,
                context,
                attempts: total,
            },
            Error::Connection {
                message, context, ..
            } => Error::Connection {
                message,
                context,
                attempts: total,
            },
            other => other,
        }
    }

    /// Attempt count for retried failures.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::TransientDriver { attempts, .. } | Error::Connection { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_full_statement_and_parameters() {
        let mut params = BTreeMap::new();
        params.insert("p0".to_owned(), Value::Int(25));
        params.insert("p1".to_owned(), Value::from("x".repeat(300)));
        let err = Error::ConstraintViolation {
            message: "already exists".into(),
            context: StatementContext::new("CREATE (n:users) SET n.id = $p0", params),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("CREATE (n:users) SET n.id = $p0"));
        assert!(rendered.contains("p0: 25"));
        assert!(rendered.contains(&"x".repeat(300)));
    }

    #[test]
    fn attempts_only_for_retried_variants() {
        let err = Error::TransientDriver {
            message: "deadlock".into(),
            context: StatementContext::none(),
            attempts: 3,
        };
        assert_eq!(err.attempts(), Some(3));
        assert!(err.is_transient());
        assert_eq!(Error::Transaction("x".into()).attempts(), None);
    }
}
