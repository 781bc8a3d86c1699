#![forbid(unsafe_code)]

//! High-level connection facade.
//!
//! [`GraphConnection`] owns the schema registry, the current configuration
//! and an [`ExecutionCoordinator`]. Each call compiles against an `Arc`
//! snapshot of the configuration taken when it starts; inside
//! [`GraphConnection::transaction`] the snapshot is pinned for the whole
//! transaction so a concurrent [`GraphConnection::reconfigure`] never changes
//! a storage mode half way through.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::exec::coordinator::{CancellationToken, ExecOptions, ExecutionCoordinator};
use crate::exec::driver::{Driver, RawRecord};
use crate::exec::retry::Sleeper;
use crate::query::ast::{QueryState, TrashedScope};
use crate::query::builder::QueryBuilder;
use crate::query::compiler::{StatementCompiler, PIVOT_COLUMN};
use crate::query::errors::CompilationError;
use crate::query::statement::CompiledStatement;
use crate::query::writes;
use crate::relation::{
    mutation, resolve, DetachFilter, ModeSource, RelationshipDescriptor, RelationshipKind,
    ResolutionContext, ResolvedRelationship, StorageMode, VirtualPivot,
};
use crate::schema::{EntitySchema, SchemaRegistry};
use crate::transform::{affected_count, aggregate_scalar, transform, ResultShape, Row};
use crate::value::{PropertyMap, Value};

/// Resolved storage of one relationship, for introspection display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationDescription {
    /// Declaring entity.
    pub entity: String,
    /// Relationship name.
    pub relation: String,
    /// Relationship kind.
    pub kind: RelationshipKind,
    /// Active storage mode.
    pub mode: StorageMode,
    /// Configuration level the mode came from.
    pub source: ModeSource,
    /// Edge type written in edge modes.
    pub edge_type: String,
    /// Pivot node label, for many-to-many relationships stored with keys.
    pub pivot_label: Option<String>,
    /// Declared pivot property names.
    pub pivot_properties: Vec<String>,
}

/// Counts reported by [`GraphConnection::sync`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncChanges {
    /// Associations removed because they were not listed.
    pub detached: u64,
    /// Associations written (created or refreshed).
    pub attached: u64,
}

/// Connection facade over a driver.
pub struct GraphConnection {
    registry: Arc<SchemaRegistry>,
    config: RwLock<Arc<EngineConfig>>,
    pinned: Mutex<Option<Arc<EngineConfig>>>,
    coordinator: ExecutionCoordinator,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for GraphConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphConnection")
            .field("config", &*self.config.read())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl GraphConnection {
    /// Validates `config` and connects the registry to `driver`.
    pub fn new(registry: SchemaRegistry, config: EngineConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;
        info!(
            entities = registry.entities().count(),
            default_storage_mode = config.default_storage_mode.name(),
            batch_size = config.batch_size,
            "connection.open"
        );
        Ok(Self {
            registry: Arc::new(registry),
            config: RwLock::new(Arc::new(config)),
            pinned: Mutex::new(None),
            coordinator: ExecutionCoordinator::new(driver),
            cancel: None,
        })
    }

    /// Routes reads outside transactions to `replica`.
    pub fn with_replica(mut self, replica: Arc<dyn Driver>) -> Self {
        self.coordinator = self.coordinator.with_replica(replica);
        self
    }

    /// Replaces the backoff sleeper.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.coordinator = self.coordinator.with_sleeper(sleeper);
        self
    }

    /// Makes retry jitter deterministic.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.coordinator = self.coordinator.with_jitter_seed(seed);
        self
    }

    /// Checks `token` before every send and backoff.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Registered entities and relationships.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Underlying execution coordinator.
    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Configuration snapshot for the next call.
    pub fn config(&self) -> Arc<EngineConfig> {
        if let Some(pinned) = self.pinned.lock().as_ref() {
            return Arc::clone(pinned);
        }
        Arc::clone(&self.config.read())
    }

    /// Swaps the configuration. Calls already running keep their snapshot.
    pub fn reconfigure(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        info!(
            default_storage_mode = config.default_storage_mode.name(),
            batch_size = config.batch_size,
            "connection.reconfigure"
        );
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Builder over a registered entity.
    pub fn query(&self, entity: &str) -> Result<QueryBuilder> {
        Ok(QueryBuilder::new(self.registry.entity(entity)?))
    }

    fn options(&self, config: &EngineConfig) -> ExecOptions {
        let opts = ExecOptions::from_config(config);
        match &self.cancel {
            Some(token) => opts.with_cancel(token.clone()),
            None => opts,
        }
    }

    fn compiler(config: &EngineConfig) -> StatementCompiler {
        StatementCompiler::new(config.default_storage_mode)
    }

    fn resolved(
        &self,
        config: &EngineConfig,
        entity: &str,
        relation: &str,
        query_override: Option<StorageMode>,
    ) -> Result<ResolvedRelationship> {
        let descriptor = self.registry.relation(entity, relation)?;
        let context = Self::compiler(config).context(query_override);
        Ok(resolve(&descriptor, &context)?)
    }

    /// Rows matched by `query`.
    pub fn get(&self, query: QueryBuilder) -> Result<Vec<Row>> {
        let state = query.build()?;
        self.fetch(&state)
    }

    fn fetch(&self, state: &QueryState) -> Result<Vec<Row>> {
        let config = self.config();
        let relations = self.registry.all_relations();
        let statement = Self::compiler(&config).compile_read(state, &relations)?;
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        let shape = ResultShape::entity(&state.entity).with_json(statement.json_encoded().iter().cloned());
        Ok(transform(result.records, &shape))
    }

    /// First row matched by `query`.
    pub fn first(&self, query: QueryBuilder) -> Result<Option<Row>> {
        Ok(self.get(query.limit(1))?.into_iter().next())
    }

    /// Number of entities matched by `query`.
    pub fn count(&self, query: QueryBuilder) -> Result<u64> {
        match self.aggregate(query.count())? {
            Value::Int(n) => Ok(u64::try_from(n).unwrap_or(0)),
            _ => Ok(0),
        }
    }

    /// Scalar result of an ungrouped aggregate query.
    pub fn aggregate(&self, query: QueryBuilder) -> Result<Value> {
        let state = query.build()?;
        let Some(aggregate) = state.aggregate.clone() else {
            return Err(CompilationError::InvalidAggregate {
                reason: "query has no aggregate projection",
            }
            .into());
        };
        if !state.groups.is_empty() {
            return Err(CompilationError::InvalidAggregate {
                reason: "grouped aggregates return rows; use get",
            }
            .into());
        }
        let config = self.config();
        let relations = self.registry.all_relations();
        let statement = Self::compiler(&config).compile_read(&state, &relations)?;
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        Ok(aggregate_scalar(result.records, aggregate.function))
    }

    /// Creates one entity per row in a single batch and returns them.
    pub fn insert(&self, entity: &str, rows: &[PropertyMap]) -> Result<Vec<Row>> {
        let schema = self.registry.entity(entity)?;
        let statements = writes::insert(&schema, rows)?;
        let config = self.config();
        let results = self.coordinator.run_batch(&statements, &self.options(&config))?;
        let shape = ResultShape::entity(&schema);
        Ok(results
            .into_iter()
            .flat_map(|result| transform(result.records, &shape))
            .collect())
    }

    /// Sets `values` on every entity matched by `query`.
    pub fn update(&self, query: QueryBuilder, values: &PropertyMap) -> Result<u64> {
        let state = query.build()?;
        self.write(&state, |state, relations, context| {
            writes::update(state, values, relations, context)
        })
    }

    /// Adds `by` to `column` on every matched entity.
    pub fn increment(&self, query: QueryBuilder, column: &str, by: impl Into<Value>) -> Result<u64> {
        let state = query.build()?;
        let by = by.into();
        self.write(&state, |state, relations, context| {
            writes::increment(state, column, by.clone(), relations, context)
        })
    }

    /// Deletes matched entities; soft-deleting entities get their marker set to now.
    pub fn delete(&self, query: QueryBuilder) -> Result<u64> {
        let state = query.build()?;
        let now = Value::from(OffsetDateTime::now_utc());
        self.write(&state, |state, relations, context| {
            writes::delete(state, now.clone(), relations, context)
        })
    }

    /// Detaches and deletes matched entities, soft-deleted ones included.
    pub fn force_delete(&self, query: QueryBuilder) -> Result<u64> {
        let state = query.build()?;
        self.write(&state, writes::force_delete)
    }

    /// Clears the soft-delete marker on matched, soft-deleted entities.
    pub fn restore(&self, query: QueryBuilder) -> Result<u64> {
        let mut state = query.build()?;
        state.trashed = TrashedScope::Only;
        self.write(&state, writes::restore)
    }

    fn write<F>(&self, state: &QueryState, compile: F) -> Result<u64>
    where
        F: FnOnce(
            &QueryState,
            &[Arc<RelationshipDescriptor>],
            ResolutionContext,
        ) -> std::result::Result<CompiledStatement, CompilationError>,
    {
        let config = self.config();
        let relations = self.registry.all_relations();
        let context = Self::compiler(&config).context(state.storage_override);
        let statement = compile(state, &relations, context)?;
        let result = self.coordinator.run(&statement, &self.options(&config))?;
        Ok(affected_count(&result.records))
    }

    /// Creates or updates the entity identified by `unique_by`.
    pub fn upsert(&self, entity: &str, unique_by: &[&str], values: &PropertyMap) -> Result<Option<Row>> {
        let schema = self.registry.entity(entity)?;
        let statement = writes::upsert(&schema, unique_by, values)?;
        let config = self.config();
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        Ok(transform(result.records, &ResultShape::entity(&schema)).into_iter().next())
    }

    /// Associates `related_key` with `parent_key` through `relation`.
    pub fn attach(
        &self,
        entity: &str,
        relation: &str,
        parent_key: impl Into<Value>,
        related_key: impl Into<Value>,
        pivot: &PropertyMap,
    ) -> Result<u64> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, None)?;
        let statement = mutation::attach(&rel, parent_key.into(), related_key.into(), pivot)?;
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        Ok(affected_count(&result.records))
    }

    /// Removes associations of `parent_key` selected by `filter`.
    pub fn detach(&self, entity: &str, relation: &str, parent_key: impl Into<Value>, filter: &DetachFilter) -> Result<u64> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, None)?;
        let statement = mutation::detach(&rel, parent_key.into(), filter)?;
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        Ok(affected_count(&result.records))
    }

    /// Makes `entries` the exact association set of `parent_key`, atomically.
    pub fn sync(
        &self,
        entity: &str,
        relation: &str,
        parent_key: impl Into<Value>,
        entries: Vec<(Value, PropertyMap)>,
    ) -> Result<SyncChanges> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, None)?;
        let statements = mutation::sync(&rel, parent_key.into(), entries)?;
        let results = self.coordinator.run_batch_managed(&statements, &self.options(&config))?;
        let mut counts = results.iter().map(|r| affected_count(&r.records));
        let detached = counts.next().unwrap_or(0);
        Ok(SyncChanges {
            detached,
            attached: counts.sum(),
        })
    }

    /// Updates pivot properties of one association and returns the fresh
    /// snapshot, or `None` when the association does not exist.
    pub fn update_edge(
        &self,
        entity: &str,
        relation: &str,
        parent_key: impl Into<Value>,
        related_key: impl Into<Value>,
        changes: &PropertyMap,
    ) -> Result<Option<VirtualPivot>> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, None)?;
        let statement = mutation::update_edge(&rel, parent_key.into(), related_key.into(), changes)?;
        let result = self.coordinator.run_managed(&statement, &self.options(&config))?;
        let shape = ResultShape::related(&rel).with_json(statement.json_encoded().iter().cloned());
        let pivot = result
            .records
            .into_iter()
            .find_map(|record| record.get("pivot").filter(|v| !v.is_null()).cloned())
            .and_then(|raw| {
                let mut row = transform(vec![RawRecord::new([(PIVOT_COLUMN, raw)])], &shape);
                row.pop().and_then(|row| row.pivot)
            });
        debug!(relation = %rel.name, found = pivot.is_some(), "connection.update_edge");
        Ok(pivot)
    }

    /// Loads related entities of `parent_keys`, optionally filtered and
    /// ordered by `constraint` (a builder over the related entity).
    pub fn related(
        &self,
        entity: &str,
        relation: &str,
        parent_keys: Vec<Value>,
        constraint: Option<QueryBuilder>,
    ) -> Result<Vec<Row>> {
        let descriptor = self.registry.relation(entity, relation)?;
        let constraint = constraint.map(QueryBuilder::build).transpose()?;
        let config = self.config();
        let relations = self.registry.all_relations();
        let related = Self::compiler(&config).compile_related(
            &descriptor,
            parent_keys,
            constraint.as_ref(),
            &relations,
        )?;
        let result = self
            .coordinator
            .run_managed(&related.statement, &self.options(&config))?;
        Ok(transform(result.records, &ResultShape::related(&related.relation)))
    }

    /// Creates a parent and its children through `relation` in one batch.
    pub fn create_with_related(
        &self,
        entity: &str,
        relation: &str,
        attributes: &PropertyMap,
        children: &[PropertyMap],
    ) -> Result<(Option<Row>, Vec<Row>)> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, None)?;
        let statements = writes::create_with_related(&rel, attributes, children)?;
        let mut results = self
            .coordinator
            .run_batch(&statements, &self.options(&config))?
            .into_iter();
        let parent = results
            .next()
            .and_then(|r| transform(r.records, &ResultShape::entity(&rel.parent)).into_iter().next());
        let shape = ResultShape::related(&rel);
        let created = results.flat_map(|r| transform(r.records, &shape)).collect();
        Ok((parent, created))
    }

    /// Runs `work` in a managed transaction with the configuration pinned.
    ///
    /// Transient failures roll back and rerun `work`, so it must be idempotent.
    pub fn transaction<T, F>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(&GraphConnection) -> Result<T>,
    {
        let outermost = {
            let mut pinned = self.pinned.lock();
            if pinned.is_none() {
                *pinned = Some(Arc::clone(&self.config.read()));
                true
            } else {
                false
            }
        };
        let config = self.config();
        let result = self
            .coordinator
            .managed_transaction(&self.options(&config), |_| work(self));
        if outermost {
            *self.pinned.lock() = None;
        }
        result
    }

    /// Resolved storage of `relation` under the current configuration.
    pub fn describe_relation(
        &self,
        entity: &str,
        relation: &str,
        query_override: Option<StorageMode>,
    ) -> Result<RelationDescription> {
        let config = self.config();
        let rel = self.resolved(&config, entity, relation, query_override)?;
        let pivot_label = (rel.kind.is_many_to_many() && rel.uses_foreign_key()).then(|| rel.pivot_label.clone());
        Ok(RelationDescription {
            entity: entity.to_owned(),
            relation: rel.name.clone(),
            kind: rel.kind,
            mode: rel.mode,
            source: rel.source,
            edge_type: rel.edge_type.clone(),
            pivot_label,
            pivot_properties: rel.pivot_properties.keys().cloned().collect(),
        })
    }

    /// Entity schema by name.
    pub fn entity(&self, name: &str) -> Result<Arc<EntitySchema>> {
        Ok(self.registry.entity(name)?)
    }

    /// Liveness probe.
    pub fn ping(&self) -> bool {
        self.coordinator.ping()
    }
}
