#![forbid(unsafe_code)]

//! Query building and compilation.
//!
//! Builder state flows through the operator translator and parameter binder
//! into immutable [`CompiledStatement`]s.

/// Builder state: predicates, sort keys, aggregates and joins.
pub mod ast;

/// Placeholder allocation and value coercion.
pub mod binder;

/// Fluent, consuming query builder.
pub mod builder;

/// Read and related-load compilation.
pub mod compiler;

/// Structured compilation errors.
pub mod errors;

/// Operator vocabulary to Cypher predicate translation.
pub mod operator;

/// Immutable compiled statements.
pub mod statement;

/// Inserts, query-scoped updates and deletes, upserts.
pub mod writes;

pub use ast::{
    Aggregate, AggregateFunction, Column, Connector, Direction, JoinKind, Operator, QueryState,
    TrashedScope, WhereClause,
};
pub use binder::ParameterBinder;
pub use builder::{raw, QueryBuilder};
pub use compiler::{RelatedStatement, StatementCompiler};
pub use errors::CompilationError;
pub use statement::{CompiledStatement, Intent};
