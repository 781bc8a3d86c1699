#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::fmt;

use thiserror::Error;

/// Structured errors emitted while compiling builder state into statements.
///
/// These are permanent: they are raised before any network call and are never
/// retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompilationError {
    /// Operator string is not part of the supported vocabulary.
    #[error("unknown operator '{operator}'")]
    UnknownOperator { operator: String },
    /// Column is neither a plain identifier, a qualified column nor a JSON path.
    #[error("column '{column}' is not a property reference; mark it raw to pass it through")]
    InvalidColumn { column: String },
    /// Qualified column refers to a table that is neither the base entity nor a join.
    #[error("unknown qualifier '{qualifier}' in column '{column}'")]
    UnknownQualifier { qualifier: String, column: String },
    /// Null literal supplied for an operator that cannot compare against null.
    #[error("{operator} does not accept null literals")]
    NullNotAllowed { operator: &'static str },
    /// Operand shape does not match the operator.
    #[error("{operator} expects {expected}")]
    OperandShape {
        operator: &'static str,
        expected: &'static str,
    },
    /// Entity name is not registered.
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },
    /// Relationship name is not declared on the entity.
    #[error("unknown relationship '{relation}' on entity '{entity}'")]
    UnknownRelationship { entity: String, relation: String },
    /// Requested storage mode cannot express this relationship.
    #[error("relationship '{relation}' cannot use {mode} storage: {reason}")]
    UnsupportedStorageMode {
        relation: String,
        mode: &'static str,
        reason: &'static str,
    },
    /// Writes are not defined for this relationship kind.
    #[error("relationship '{relation}' is read-only")]
    ReadOnlyRelationship { relation: String },
    /// Operation needs the entity's primary key among the supplied attributes.
    #[error("entity '{entity}' requires primary key '{key}' for this operation")]
    MissingPrimaryKey { entity: String, key: String },
    /// Entity declares no labels.
    #[error("entity '{entity}' declares no labels")]
    EmptyLabels { entity: String },
    /// Update or insert without any property.
    #[error("{operation} requires at least one property")]
    EmptyWrite { operation: &'static str },
    /// Placeholder referenced by the text has no binding.
    #[error("placeholder ${name} has no binding")]
    UnboundPlaceholder { name: String },
    /// Binding present without a matching placeholder in the text.
    #[error("binding '{name}' is not referenced by the statement")]
    OrphanBinding { name: String },
    /// Raw binding name is not usable as a Cypher parameter name.
    #[error("raw binding name '{name}' must be an identifier")]
    InvalidBindingName { name: String },
    /// Aggregate descriptor is malformed.
    #[error("invalid aggregate: {reason}")]
    InvalidAggregate { reason: &'static str },
    /// Percentile outside `[0, 1]`.
    #[error("percentile must be within [0, 1] (got {value})")]
    PercentileOutOfRange { value: String },
    /// Pagination arguments out of range.
    #[error("invalid pagination: {reason}")]
    InvalidPagination { reason: &'static str },
    /// Pivot properties supplied for a relationship without a pivot.
    #[error("relationship '{relation}' carries no pivot properties")]
    PivotNotSupported { relation: String },
    /// Pivot property not declared on the relationship.
    #[error("pivot property '{property}' is not declared on relationship '{relation}'")]
    UnknownPivotProperty { relation: String, property: String },
    /// Operation is not defined for this relationship kind.
    #[error("relationship '{relation}' does not support {operation}")]
    UnsupportedOperation {
        relation: String,
        operation: &'static str,
    },
    /// Restore requested on an entity without soft deletes.
    #[error("entity '{entity}' does not use soft deletes")]
    SoftDeleteNotEnabled { entity: String },
}

impl CompilationError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            CompilationError::UnknownOperator { .. } => "UnknownOperator",
            CompilationError::InvalidColumn { .. } => "InvalidColumn",
            CompilationError::UnknownQualifier { .. } => "UnknownQualifier",
            CompilationError::NullNotAllowed { .. } => "NullNotAllowed",
            CompilationError::OperandShape { .. } => "OperandShape",
            CompilationError::UnknownEntity { .. } => "UnknownEntity",
            CompilationError::UnknownRelationship { .. } => "UnknownRelationship",
            CompilationError::UnsupportedStorageMode { .. } => "UnsupportedStorageMode",
            CompilationError::ReadOnlyRelationship { .. } => "ReadOnlyRelationship",
            CompilationError::MissingPrimaryKey { .. } => "MissingPrimaryKey",
            CompilationError::EmptyLabels { .. } => "EmptyLabels",
            CompilationError::EmptyWrite { .. } => "EmptyWrite",
            CompilationError::UnboundPlaceholder { .. } => "UnboundPlaceholder",
            CompilationError::OrphanBinding { .. } => "OrphanBinding",
            CompilationError::InvalidBindingName { .. } => "InvalidBindingName",
            CompilationError::InvalidAggregate { .. } => "InvalidAggregate",
            CompilationError::PercentileOutOfRange { .. } => "PercentileOutOfRange",
            CompilationError::InvalidPagination { .. } => "InvalidPagination",
            CompilationError::PivotNotSupported { .. } => "PivotNotSupported",
            CompilationError::UnknownPivotProperty { .. } => "UnknownPivotProperty",
            CompilationError::UnsupportedOperation { .. } => "UnsupportedOperation",
            CompilationError::SoftDeleteNotEnabled { .. } => "SoftDeleteNotEnabled",
        }
    }

    /// Builds an [`CompilationError::InvalidColumn`].
    pub fn invalid_column(column: impl Into<String>) -> Self {
        CompilationError::InvalidColumn {
            column: column.into(),
        }
    }
}

/// Convenience wrapper that formats compilation errors with their codes.
pub struct CompilationErrorWithCode<'a>(pub &'a CompilationError);

impl fmt::Display for CompilationErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
