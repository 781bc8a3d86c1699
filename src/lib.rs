//! Relational query-builder compiler and resilient executor for Cypher graph
//! databases.
//!
//! Builder calls accumulate a [`QueryState`]; the [`StatementCompiler`] turns
//! it into parameterized [`CompiledStatement`]s, resolving each relationship to
//! foreign-key properties, native edges or both. The
//! [`ExecutionCoordinator`] sends statements through a [`Driver`] with retry,
//! batching and transaction counting, and [`transform`] flattens the records
//! that come back.
//!
//! ```
//! use std::sync::Arc;
//! use relgraph::{EngineConfig, EntitySchema, GraphConnection, ScriptedDriver, SchemaRegistry};
//!
//! let mut registry = SchemaRegistry::new();
//! registry.register_entity(EntitySchema::new("User", "users"));
//! let driver = ScriptedDriver::new().shared();
//! let conn = GraphConnection::new(registry, EngineConfig::default(), driver.clone())?;
//! let rows = conn.get(conn.query("User")?.where_op("age", ">", 25))?;
//! assert!(rows.is_empty());
//! assert_eq!(
//!     driver.executed(),
//!     vec!["MATCH (n:users) WHERE n.age > $p0 RETURN n".to_owned()]
//! );
//! # Ok::<(), relgraph::Error>(())
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod exec;
pub mod naming;
pub mod query;
pub mod relation;
pub mod schema;
pub mod transform;
pub mod value;

pub use config::{ConfigError, EngineConfig};
pub use connection::{GraphConnection, RelationDescription, SyncChanges};
pub use error::{Error, Result, StatementContext};
pub use exec::{
    CancellationToken, Driver, DriverError, ErrorClass, ExecOptions, ExecutionCoordinator,
    RawRecord, RawResult, RawValue, RecordingSleeper, RetryPolicy, ScriptedDriver,
};
pub use query::{
    raw, AggregateFunction, CompilationError, CompiledStatement, Intent, QueryBuilder, QueryState,
    StatementCompiler,
};
pub use relation::{
    DetachFilter, PropertyType, RelationshipDescriptor, RelationshipKind, StorageMode,
    VirtualPivot,
};
pub use schema::{EntitySchema, SchemaRegistry};
pub use transform::{ResultShape, Row};
pub use value::{props, PropertyMap, Value};
