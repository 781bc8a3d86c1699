#![forbid(unsafe_code)]

//! Maps driver failures onto [`ErrorClass`] and the crate error taxonomy.

use crate::error::{Error, StatementContext};
use crate::exec::driver::{DriverError, ErrorClass};

const TRANSIENT_CODES: &[&str] = &["Neo.TransientError.", "Neo.ClientError.Cluster.NotALeader"];
const CONNECTION_CODES: &[&str] = &["ServiceUnavailable", "SessionExpired", "Neo.TransientError.General.DatabaseUnavailable"];
const CONSTRAINT_CODES: &[&str] = &[
    "Neo.ClientError.Schema.ConstraintValidationFailed",
    "Neo.ClientError.Schema.ConstraintViolation",
    "Neo.ClientError.Statement.ConstraintVerificationFailed",
];
const AUTH_CODES: &[&str] = &["Neo.ClientError.Security."];

const TRANSIENT_WORDS: &[&str] = &[
    "deadlock",
    "lock timeout",
    "lock wait",
    "lock acquisition",
    "acquiring lock",
    "lock timed out",
    "locks could not be acquired",
    "temporarily unavailable",
    "leader switch",
];
const CONNECTION_WORDS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "defunct connection",
    "failed to read from",
    "timed out",
];
const CONSTRAINT_WORDS: &[&str] = &["already exists with label", "constraint violation", "violates constraint"];
const AUTH_WORDS: &[&str] = &["unauthorized", "authentication failure", "invalid credentials"];

/// Classifies a driver error, trusting a driver-supplied class first, then the
/// vendor code, then message keywords.
pub fn classify(error: &DriverError) -> ErrorClass {
    if let Some(class) = error.class {
        return class;
    }
    if let Some(code) = error.code.as_deref() {
        // Database-unavailable lives under the transient prefix; check it first.
        if CONNECTION_CODES.iter().any(|c| code.starts_with(c)) {
            return ErrorClass::Connection;
        }
        if AUTH_CODES.iter().any(|c| code.starts_with(c)) {
            return ErrorClass::Authentication;
        }
        if CONSTRAINT_CODES.iter().any(|c| code.starts_with(c)) {
            return ErrorClass::Constraint;
        }
        if TRANSIENT_CODES.iter().any(|c| code.starts_with(c)) {
            return ErrorClass::Transient;
        }
    }
    let message = error.message.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| message.contains(w));
    if has(AUTH_WORDS) {
        ErrorClass::Authentication
    } else if has(CONSTRAINT_WORDS) {
        ErrorClass::Constraint
    } else if has(TRANSIENT_WORDS) {
        ErrorClass::Transient
    } else if has(CONNECTION_WORDS) {
        ErrorClass::Connection
    } else {
        ErrorClass::Permanent
    }
}

/// Converts a final driver failure into the crate error carrying full context.
pub fn surface(error: DriverError, class: ErrorClass, context: StatementContext, attempts: u32) -> Error {
    let message = error.to_string();
    match class {
        ErrorClass::Transient => Error::TransientDriver {
            message,
            context,
            attempts,
        },
        ErrorClass::Connection => Error::Connection {
            message,
            context,
            attempts,
        },
        ErrorClass::Constraint => Error::ConstraintViolation { message, context },
        ErrorClass::Authentication => Error::Authentication { message, context },
        ErrorClass::Permanent => Error::Driver { message, context },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_codes_take_precedence_over_messages() {
        let deadlock = DriverError::with_code(
            "Neo.TransientError.Transaction.DeadlockDetected",
            "constraint violation in message text",
        );
        assert_eq!(classify(&deadlock), ErrorClass::Transient);
        let unavailable = DriverError::with_code("Neo.TransientError.General.DatabaseUnavailable", "x");
        assert_eq!(classify(&unavailable), ErrorClass::Connection);
        let unique = DriverError::with_code("Neo.ClientError.Schema.ConstraintValidationFailed", "x");
        assert_eq!(classify(&unique), ErrorClass::Constraint);
        let auth = DriverError::with_code("Neo.ClientError.Security.Unauthorized", "x");
        assert_eq!(classify(&auth), ErrorClass::Authentication);
        let syntax = DriverError::with_code("Neo.ClientError.Statement.SyntaxError", "bad input");
        assert_eq!(classify(&syntax), ErrorClass::Permanent);
    }

    #[test]
    fn message_keywords_classify_uncoded_errors() {
        assert_eq!(classify(&DriverError::message("Deadlock found")), ErrorClass::Transient);
        assert_eq!(classify(&DriverError::message("Broken pipe")), ErrorClass::Connection);
        assert_eq!(
            classify(&DriverError::message("Node(1) already exists with label `users`")),
            ErrorClass::Constraint
        );
        assert_eq!(classify(&DriverError::message("something odd")), ErrorClass::Permanent);
    }

    #[test]
    fn lock_timeouts_are_transient_not_connection_loss() {
        for message in [
            "Lock acquisition timed out after 30s",
            "Timed out while acquiring lock on Node(7)",
            "ForsetiClient: lock timed out",
        ] {
            assert_eq!(classify(&DriverError::message(message)), ErrorClass::Transient, "{message}");
        }
        assert_eq!(
            classify(&DriverError::message("read timed out on socket")),
            ErrorClass::Connection
        );
    }

    #[test]
    fn driver_supplied_class_wins() {
        let err = DriverError::classified(ErrorClass::Connection, "deadlock");
        assert_eq!(classify(&err), ErrorClass::Connection);
    }

    #[test]
    fn surfaced_errors_keep_attempts() {
        let err = surface(
            DriverError::message("deadlock"),
            ErrorClass::Transient,
            StatementContext::new("RETURN 1", Default::default()),
            4,
        );
        assert_eq!(err.attempts(), Some(4));
        assert!(err.to_string().contains("RETURN 1"));
    }
}
