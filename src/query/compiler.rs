#![forbid(unsafe_code)]
//! Statement compiler for reads.
//!
//! Lowers a [`QueryState`] into a parameterized Cypher statement. The entity is
//! always bound to `n` and matched on its full label set; joins bind their
//! alias; `whereHas` subqueries bind `h0`, `h1`, ... Relationship storage is
//! resolved once per compilation through [`resolve`].

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::naming;
use crate::query::ast::{
    Aggregate, AggregateFunction, Column, JoinKind, Predicate, QueryState,
    TrashedScope, WhereClause,
};
use crate::query::binder::ParameterBinder;
use crate::query::errors::CompilationError;
use crate::query::operator::{
    resolve_column, translate_columns, translate_json, translate_predicate, translate_raw, Scope,
};
use crate::query::statement::{CompiledStatement, Intent};
use crate::relation::patterns::prop;
use crate::relation::{resolve, RelationshipDescriptor, ResolutionContext, ResolvedRelationship, StorageMode};
use crate::schema::EntitySchema;
use crate::value::Value;

/// Variable the queried entity is bound to.
pub const ENTITY_VAR: &str = "n";
/// Column carrying an aggregate result.
pub const AGGREGATE_COLUMN: &str = "aggregate";
/// Internal column counting matched rows for aggregate queries.
pub const MATCHED_COLUMN: &str = "__matched";
/// Internal column carrying the parent key on related loads.
pub const PARENT_COLUMN: &str = "__parent";
/// Internal column carrying pivot properties on related loads.
pub const PIVOT_COLUMN: &str = "__pivot";
/// Variable related entities are bound to on related loads.
pub const RELATED_VAR: &str = "r";

/// Statement loading related entities for a set of parents.
#[derive(Clone, Debug)]
pub struct RelatedStatement {
    /// Compiled statement.
    pub statement: CompiledStatement,
    /// Resolution used, for the transformer and introspection.
    pub relation: ResolvedRelationship,
}

/// Compiles builder state into statements.
#[derive(Clone, Copy, Debug)]
pub struct StatementCompiler {
    process_default: StorageMode,
}

impl StatementCompiler {
    /// Compiler resolving relationships against `process_default` as level 4.
    pub fn new(process_default: StorageMode) -> Self {
        Self { process_default }
    }

    /// Process default in effect.
    pub fn process_default(&self) -> StorageMode {
        self.process_default
    }

    /// Resolution context for a query carrying an optional override.
    pub fn context(&self, query_override: Option<StorageMode>) -> ResolutionContext {
        ResolutionContext::new(self.process_default).with_override(query_override)
    }

    /// Compiles a read query. Reads always produce exactly one statement.
    pub fn compile(
        &self,
        state: &QueryState,
        relations: &[Arc<RelationshipDescriptor>],
    ) -> Result<Vec<CompiledStatement>, CompilationError> {
        Ok(vec![self.compile_read(state, relations)?])
    }

    /// Compiles a read query into its single statement.
    pub fn compile_read(
        &self,
        state: &QueryState,
        relations: &[Arc<RelationshipDescriptor>],
    ) -> Result<CompiledStatement, CompilationError> {
        let mut pass = Pass::new(relations, self.context(state.storage_override));
        let text = pass.read(state)?;
        let statement = pass.finish(text, Intent::Read)?;
        debug!(
            entity = %state.entity.name,
            statement = %statement.text(),
            parameters = statement.parameters().len(),
            "compiled read"
        );
        Ok(statement)
    }

    /// Compiles an eager load of `descriptor` for `parent_keys`.
    ///
    /// `constraint` filters and orders the related entities; its limit and
    /// offset are not applied per parent.
    pub fn compile_related(
        &self,
        descriptor: &RelationshipDescriptor,
        parent_keys: Vec<Value>,
        constraint: Option<&QueryState>,
        relations: &[Arc<RelationshipDescriptor>],
    ) -> Result<RelatedStatement, CompilationError> {
        let context = self.context(constraint.and_then(|c| c.storage_override));
        let relation = resolve(descriptor, &context)?;
        let mut pass = Pass::new(relations, context);
        let parent = &relation.parent;
        let keys = pass
            .binder
            .bind_list(&parent.primary_key, crate::query::ast::Operator::In, parent_keys);
        let mut text = format!(
            "MATCH (p{}) WHERE {} IN {keys}",
            parent.label_pattern(),
            prop("p", &parent.primary_key)
        );

        let link = relation.match_pattern("p", RELATED_VAR, &mut pass.binder);
        let scope = Scope::new(RELATED_VAR, &relation.related);
        let mut conditions: Vec<String> = link.predicate.iter().cloned().collect();
        if let Some(state) = constraint {
            if let Some(filter) = pass.where_list(&scope, &state.wheres)? {
                conditions.push(format!("({filter})"));
            }
        }
        let trashed = constraint.map(|c| c.trashed).unwrap_or_default();
        conditions.extend(trashed_condition(&relation.related, RELATED_VAR, trashed));
        text.push_str(&format!(" MATCH {}", link.pattern));
        if !conditions.is_empty() {
            text.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
        }
        for optional in &link.optional {
            text.push(' ');
            text.push_str(optional);
        }
        text.push_str(&format!(
            " RETURN {} AS {PARENT_COLUMN}, {RELATED_VAR}",
            prop("p", &parent.primary_key)
        ));
        if let Some(pivot) = &link.pivot_expr {
            text.push_str(&format!(", {pivot} AS {PIVOT_COLUMN}"));
        }
        let mut order = vec![PARENT_COLUMN.to_owned()];
        if let Some(state) = constraint {
            for key in &state.orders {
                let column = resolve_column(&scope, &key.column)?;
                order.push(format!("{} {}", column.expr, key.direction.keyword()));
            }
        }
        order.push(format!("{} ASC", prop(RELATED_VAR, &relation.related.primary_key)));
        text.push_str(&format!(" ORDER BY {}", order.join(", ")));

        let statement = pass.finish(text, Intent::Read)?;
        debug!(
            relation = %relation.name,
            mode = relation.mode.name(),
            statement = %statement.text(),
            "compiled related load"
        );
        Ok(RelatedStatement { statement, relation })
    }
}

/// Soft-delete condition for `var` under the given visibility.
pub(crate) fn trashed_condition(entity: &EntitySchema, var: &str, scope: TrashedScope) -> Option<String> {
    let marker = entity.soft_delete.as_ref()?;
    match scope {
        TrashedScope::Exclude => Some(format!("{} IS NULL", prop(var, marker))),
        TrashedScope::Include => None,
        TrashedScope::Only => Some(format!("{} IS NOT NULL", prop(var, marker))),
    }
}

/// `MATCH ... WHERE ...` prefix of a query-scoped write, windowed by the
/// builder's order, offset and limit.
pub(crate) fn match_prefix(
    state: &QueryState,
    relations: &[Arc<RelationshipDescriptor>],
    context: ResolutionContext,
) -> Result<(String, ParameterBinder), CompilationError> {
    let mut pass = Pass::new(relations, context);
    let mut text = pass.matching(state)?;
    pass.write_window(state, &mut text)?;
    Ok((text, pass.binder))
}

struct Pass<'a> {
    relations: &'a [Arc<RelationshipDescriptor>],
    context: ResolutionContext,
    binder: ParameterBinder,
    next_var: usize,
}

impl<'a> Pass<'a> {
    fn new(relations: &'a [Arc<RelationshipDescriptor>], context: ResolutionContext) -> Self {
        Self {
            relations,
            context,
            binder: ParameterBinder::new(),
            next_var: 0,
        }
    }

    fn finish(self, text: String, intent: Intent) -> Result<CompiledStatement, CompilationError> {
        let (params, encoded) = self.binder.finish();
        Ok(CompiledStatement::new(text, params, intent, true)?.with_json_encoded(encoded))
    }

    fn scope<'s>(state: &'s QueryState) -> Scope<'s> {
        let mut scope = Scope::new(ENTITY_VAR, &state.entity);
        scope.aliases = state.joins.iter().map(|j| j.alias.clone()).collect();
        scope
    }

    /// `MATCH`, joins and filters.
    fn matching(&mut self, state: &QueryState) -> Result<String, CompilationError> {
        state.entity.ensure_labels()?;
        let scope = Self::scope(state);
        let mut patterns = vec![format!("({ENTITY_VAR}{})", state.entity.label_pattern())];
        let mut join_conditions = Vec::new();
        let mut optional = Vec::new();
        for join in &state.joins {
            if !naming::is_identifier(&join.alias) || join.alias == ENTITY_VAR {
                return Err(CompilationError::invalid_column(join.alias.clone()));
            }
            let node = format!("({}:{})", join.alias, naming::quote(&join.label));
            let conditions = join
                .conditions
                .iter()
                .map(|(first, op, second)| translate_columns(&scope, first, *op, second))
                .collect::<Result<Vec<_>, _>>()?;
            match join.kind {
                JoinKind::Inner => {
                    patterns.push(node);
                    join_conditions.extend(conditions);
                }
                JoinKind::Left => {
                    let mut clause = format!("OPTIONAL MATCH {node}");
                    if !conditions.is_empty() {
                        clause.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
                    }
                    optional.push(clause);
                }
            }
        }

        let filter = self.where_list(&scope, &state.wheres)?;
        let mut conditions = join_conditions;
        conditions.extend(trashed_condition(&state.entity, ENTITY_VAR, state.trashed));

        let mut text = format!("MATCH {}", patterns.join(", "));
        if optional.is_empty() {
            if let Some(filter) = filter {
                conditions.push(if conditions.is_empty() {
                    filter
                } else {
                    format!("({filter})")
                });
            }
            if !conditions.is_empty() {
                text.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
            }
        } else {
            if !conditions.is_empty() {
                text.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
            }
            for clause in optional {
                text.push(' ');
                text.push_str(&clause);
            }
            if let Some(filter) = filter {
                text.push_str(&format!(" WITH * WHERE {filter}"));
            }
        }
        Ok(text)
    }

    /// Restricts a query-scoped write to the ordered, paginated window of
    /// matches. Without a unique sort key the primary key breaks ties so the
    /// window is deterministic.
    fn write_window(&mut self, state: &QueryState, text: &mut String) -> Result<(), CompilationError> {
        if state.orders.is_empty() && state.limit.is_none() && state.offset.is_none() {
            return Ok(());
        }
        let scope = Self::scope(state);
        let mut keys = Vec::new();
        let mut unique = false;
        for key in &state.orders {
            let column = resolve_column(&scope, &key.column)?;
            if column.var == ENTITY_VAR && !column.has_path && state.entity.is_unique(&column.property) {
                unique = true;
            }
            keys.push(format!("{} {}", column.expr, key.direction.keyword()));
        }
        if !unique {
            keys.push(format!("{} ASC", prop(ENTITY_VAR, &state.entity.primary_key)));
        }
        text.push_str(&format!(" WITH * ORDER BY {}", keys.join(", ")));
        self.pagination(state, text)
    }

    fn read(&mut self, state: &QueryState) -> Result<String, CompilationError> {
        let mut text = self.matching(state)?;
        let scope = Self::scope(state);
        if !state.groups.is_empty() || (state.aggregate.is_some() && !state.havings.is_empty()) {
            self.grouped(state, &scope, &mut text)?;
        } else if let Some(aggregate) = &state.aggregate {
            let expr = self.aggregate_expr(&scope, aggregate)?;
            text.push_str(&format!(
                " RETURN {expr} AS {AGGREGATE_COLUMN}, count({ENTITY_VAR}) AS {MATCHED_COLUMN}"
            ));
        } else {
            self.plain_return(state, &scope, &mut text)?;
        }
        Ok(text)
    }

    fn plain_return(
        &mut self,
        state: &QueryState,
        scope: &Scope<'_>,
        text: &mut String,
    ) -> Result<(), CompilationError> {
        let distinct = if state.distinct { "DISTINCT " } else { "" };
        let mut aliases = Vec::new();
        if state.projections.is_empty() {
            text.push_str(&format!(" RETURN {distinct}{ENTITY_VAR}"));
        } else {
            let mut items = Vec::new();
            for projection in &state.projections {
                let column = resolve_column(scope, &projection.column)?;
                let alias = match &projection.alias {
                    Some(alias) => naming::quote(alias),
                    None => default_alias(&projection.column),
                };
                items.push(format!("{} AS {alias}", column.expr));
                aliases.push((column.expr, alias));
            }
            text.push_str(&format!(" RETURN {distinct}{}", items.join(", ")));
        }

        let paginated = state.limit.is_some() || state.offset.is_some();
        if !state.orders.is_empty() || paginated {
            let mut keys = Vec::new();
            let mut unique = false;
            let mut ordered = BTreeSet::new();
            for key in &state.orders {
                let column = resolve_column(scope, &key.column)?;
                if column.var == ENTITY_VAR && !column.has_path && state.entity.is_unique(&column.property) {
                    unique = true;
                }
                let expr = if state.distinct && !state.projections.is_empty() {
                    aliases
                        .iter()
                        .find(|(e, _)| *e == column.expr)
                        .map(|(_, a)| a.clone())
                        .ok_or_else(|| CompilationError::invalid_column(key.column.text()))?
                } else {
                    column.expr
                };
                ordered.insert(expr.clone());
                keys.push(format!("{expr} {}", key.direction.keyword()));
            }
            if !unique {
                if state.distinct && !state.projections.is_empty() {
                    // Distinct rows are unique over the projected tuple.
                    for (_, alias) in &aliases {
                        if ordered.insert(alias.clone()) {
                            keys.push(format!("{alias} ASC"));
                        }
                    }
                } else {
                    keys.push(format!(
                        "{} ASC",
                        prop(ENTITY_VAR, &state.entity.primary_key)
                    ));
                }
            }
            text.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        self.pagination(state, text)
    }

    fn grouped(
        &mut self,
        state: &QueryState,
        scope: &Scope<'_>,
        text: &mut String,
    ) -> Result<(), CompilationError> {
        let mut items = Vec::new();
        let mut aliases = Vec::new();
        for column in &state.groups {
            let resolved = resolve_column(scope, column)?;
            let alias = default_alias(column);
            items.push(format!("{} AS {alias}", resolved.expr));
            aliases.push(alias);
        }
        let mut visible: BTreeSet<String> = aliases.iter().cloned().collect();
        if let Some(aggregate) = &state.aggregate {
            let expr = self.aggregate_expr(scope, aggregate)?;
            items.push(format!("{expr} AS {AGGREGATE_COLUMN}"));
            visible.insert(AGGREGATE_COLUMN.to_owned());
            if state.groups.is_empty() {
                items.push(format!("count({ENTITY_VAR}) AS {MATCHED_COLUMN}"));
                visible.insert(MATCHED_COLUMN.to_owned());
            }
        }
        let distinct = if state.aggregate.is_none() { "DISTINCT " } else { "" };
        text.push_str(&format!(" WITH {distinct}{}", items.join(", ")));

        let mut having = String::new();
        for clause in &state.havings {
            let fragment = self.having_clause(scope, &visible, clause)?;
            if having.is_empty() {
                having = fragment;
            } else {
                having = format!("{having} {} {fragment}", clause.connector().keyword());
            }
        }
        if !having.is_empty() {
            text.push_str(&format!(" WHERE {having}"));
        }
        let returned: Vec<String> = visible_in_order(&aliases, state);
        text.push_str(&format!(" RETURN {}", returned.join(", ")));

        if !state.orders.is_empty() || state.limit.is_some() || state.offset.is_some() {
            let mut keys = Vec::new();
            let mut ordered = BTreeSet::new();
            for key in &state.orders {
                let name = key.column.text().trim();
                let alias = if visible.contains(name) {
                    name.to_owned()
                } else {
                    let as_group = default_alias(&key.column);
                    if !visible.contains(&as_group) {
                        return Err(CompilationError::invalid_column(name));
                    }
                    as_group
                };
                ordered.insert(alias.clone());
                keys.push(format!("{alias} {}", key.direction.keyword()));
            }
            for alias in &aliases {
                if ordered.insert(alias.clone()) {
                    keys.push(format!("{alias} ASC"));
                }
            }
            if !keys.is_empty() {
                text.push_str(&format!(" ORDER BY {}", keys.join(", ")));
            }
        }
        self.pagination(state, text)
    }

    fn having_clause(
        &mut self,
        scope: &Scope<'_>,
        visible: &BTreeSet<String>,
        clause: &WhereClause,
    ) -> Result<String, CompilationError> {
        match clause {
            WhereClause::Basic(predicate) => {
                let name = predicate.column.text().trim();
                if !visible.contains(name) {
                    return Err(CompilationError::invalid_column(name));
                }
                let on_alias = Predicate {
                    column: Column::Raw(name.to_owned()),
                    ..predicate.clone()
                };
                translate_predicate(scope, &on_alias, &mut self.binder)
            }
            WhereClause::Raw {
                fragment, bindings, ..
            } => translate_raw(fragment, bindings, &mut self.binder),
            WhereClause::Group {
                clauses, negated, ..
            } => {
                let mut out = String::new();
                for inner in clauses {
                    let fragment = self.having_clause(scope, visible, inner)?;
                    if out.is_empty() {
                        out = fragment;
                    } else {
                        out = format!("{out} {} {fragment}", inner.connector().keyword());
                    }
                }
                Ok(if *negated {
                    format!("NOT ({out})")
                } else {
                    format!("({out})")
                })
            }
            _ => Err(CompilationError::OperandShape {
                operator: "having",
                expected: "a comparison on a grouped column or the aggregate",
            }),
        }
    }

    fn pagination(&mut self, state: &QueryState, text: &mut String) -> Result<(), CompilationError> {
        if let Some(offset) = state.offset {
            let offset = i64::try_from(offset).map_err(|_| CompilationError::InvalidPagination {
                reason: "offset exceeds the signed 64-bit range",
            })?;
            let p = self.binder.bind_value(Value::Int(offset));
            text.push_str(&format!(" SKIP {p}"));
        }
        if let Some(limit) = state.limit {
            let limit = i64::try_from(limit).map_err(|_| CompilationError::InvalidPagination {
                reason: "limit exceeds the signed 64-bit range",
            })?;
            let p = self.binder.bind_value(Value::Int(limit));
            text.push_str(&format!(" LIMIT {p}"));
        }
        Ok(())
    }

    fn aggregate_expr(
        &mut self,
        scope: &Scope<'_>,
        aggregate: &Aggregate,
    ) -> Result<String, CompilationError> {
        if aggregate.columns.len() > 1 {
            return Err(CompilationError::InvalidAggregate {
                reason: "aggregates take a single target column",
            });
        }
        let target = match aggregate.columns.first() {
            Some(column) => resolve_column(scope, column)?.expr,
            None if aggregate.function == AggregateFunction::Count => ENTITY_VAR.to_owned(),
            None => {
                return Err(CompilationError::InvalidAggregate {
                    reason: "aggregate requires a target column",
                })
            }
        };
        let expr = match aggregate.function {
            AggregateFunction::Count => format!("count({target})"),
            AggregateFunction::CountDistinct => format!("count(DISTINCT {target})"),
            AggregateFunction::Sum => format!("sum({target})"),
            AggregateFunction::Avg => format!("avg({target})"),
            AggregateFunction::Min => format!("min({target})"),
            AggregateFunction::Max => format!("max({target})"),
            AggregateFunction::PercentileCont(p) | AggregateFunction::PercentileDisc(p) => {
                if !(0.0..=1.0).contains(&p) {
                    return Err(CompilationError::PercentileOutOfRange {
                        value: p.to_string(),
                    });
                }
                let name = if matches!(aggregate.function, AggregateFunction::PercentileCont(_)) {
                    "percentileCont"
                } else {
                    "percentileDisc"
                };
                let placeholder = self.binder.bind_value(Value::Float(p));
                format!("{name}({target}, {placeholder})")
            }
            AggregateFunction::StdDev => format!("stDev({target})"),
            AggregateFunction::StdDevP => format!("stDevP({target})"),
            AggregateFunction::Collect => format!("collect({target})"),
        };
        Ok(expr)
    }

    fn where_list(
        &mut self,
        scope: &Scope<'_>,
        clauses: &[WhereClause],
    ) -> Result<Option<String>, CompilationError> {
        let mut out = String::new();
        for clause in clauses {
            let fragment = self.where_clause(scope, clause)?;
            if out.is_empty() {
                out = fragment;
            } else {
                out = format!("{out} {} {fragment}", clause.connector().keyword());
            }
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn where_clause(&mut self, scope: &Scope<'_>, clause: &WhereClause) -> Result<String, CompilationError> {
        match clause {
            WhereClause::Basic(predicate) => translate_predicate(scope, predicate, &mut self.binder),
            WhereClause::Columns {
                first,
                operator,
                second,
                ..
            } => translate_columns(scope, first, *operator, second),
            WhereClause::Json {
                column,
                check,
                negated,
                ..
            } => translate_json(scope, column, check, *negated, &mut self.binder),
            WhereClause::Raw {
                fragment, bindings, ..
            } => translate_raw(fragment, bindings, &mut self.binder),
            WhereClause::Group {
                clauses, negated, ..
            } => {
                let inner = self.where_list(scope, clauses)?.unwrap_or_else(|| "true".to_owned());
                Ok(if *negated {
                    format!("NOT ({inner})")
                } else {
                    format!("({inner})")
                })
            }
            WhereClause::Has {
                relation,
                constraint,
                negated,
                ..
            } => {
                let descriptor = self
                    .relations
                    .iter()
                    .find(|d| d.parent.name == scope.entity.name && d.name == *relation)
                    .cloned()
                    .ok_or_else(|| CompilationError::UnknownRelationship {
                        entity: scope.entity.name.clone(),
                        relation: relation.clone(),
                    })?;
                let resolved = resolve(&descriptor, &self.context)?;
                let var = format!("h{}", self.next_var);
                self.next_var += 1;
                let link = resolved.match_pattern(scope.var, &var, &mut self.binder);
                let related_scope = Scope::new(&var, &resolved.related);
                let mut extra = Vec::new();
                let trashed = match constraint {
                    Some(state) => {
                        if let Some(filter) = self.where_list(&related_scope, &state.wheres)? {
                            extra.push(format!("({filter})"));
                        }
                        state.trashed
                    }
                    None => TrashedScope::Exclude,
                };
                extra.extend(trashed_condition(&resolved.related, &var, trashed));
                let extra = (!extra.is_empty()).then(|| extra.join(" AND "));
                let exists = link.exists(extra.as_deref());
                Ok(if *negated { format!("NOT {exists}") } else { exists })
            }
        }
    }
}

fn default_alias(column: &Column) -> String {
    match column {
        Column::Raw(text) => naming::quote(text.trim()),
        Column::Property(text) => {
            let last = text
                .rsplit("->")
                .next()
                .unwrap_or(text)
                .trim();
            let last = last.rsplit('.').next().unwrap_or(last);
            naming::quote(last)
        }
    }
}

fn visible_in_order(aliases: &[String], state: &QueryState) -> Vec<String> {
    let mut out = aliases.to_vec();
    if state.aggregate.is_some() {
        out.push(AGGREGATE_COLUMN.to_owned());
        if state.groups.is_empty() {
            out.push(MATCHED_COLUMN.to_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::QueryBuilder;
    use crate::relation::RelationshipDescriptor;

    fn users() -> Arc<EntitySchema> {
        Arc::new(EntitySchema::new("User", "users").soft_deletes("deleted_at"))
    }

    fn compile(builder: QueryBuilder) -> CompiledStatement {
        StatementCompiler::new(StorageMode::ForeignKey)
            .compile_read(&builder.build().unwrap(), &[])
            .unwrap()
    }

    #[test]
    fn soft_deleted_rows_are_hidden_by_default() {
        let stmt = compile(QueryBuilder::new(users()).where_eq("a", 1i64).or_where("b", "=", 2i64));
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) WHERE n.deleted_at IS NULL AND (n.a = $p0 OR n.b = $p1) RETURN n"
        );
        let stmt = compile(QueryBuilder::new(users()).only_trashed());
        assert_eq!(stmt.text(), "MATCH (n:users) WHERE n.deleted_at IS NOT NULL RETURN n");
        let stmt = compile(QueryBuilder::new(users()).with_trashed());
        assert_eq!(stmt.text(), "MATCH (n:users) RETURN n");
    }

    #[test]
    fn aggregates_carry_matched_counter() {
        let stmt = compile(QueryBuilder::new(users()).with_trashed().sum("age"));
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) RETURN sum(n.age) AS aggregate, count(n) AS __matched"
        );
        let stmt = compile(QueryBuilder::new(users()).with_trashed().percentile_disc("age", 0.5));
        assert!(stmt.text().contains("percentileDisc(n.age, $p0)"));
        assert_eq!(stmt.parameters()["p0"], Value::Float(0.5));
    }

    #[test]
    fn grouped_queries_filter_with_having() {
        let stmt = compile(
            QueryBuilder::new(users())
                .with_trashed()
                .group_by(["status"])
                .count()
                .having("aggregate", ">", 3i64),
        );
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) WITH n.status AS status, count(n) AS aggregate \
             WHERE aggregate > $p0 RETURN status, aggregate"
        );
    }

    #[test]
    fn pagination_is_bound_and_tie_broken() {
        let stmt = compile(QueryBuilder::new(users()).with_trashed().for_page(2, 10));
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) RETURN n ORDER BY n.id ASC SKIP $p0 LIMIT $p1"
        );
        assert_eq!(stmt.parameters()["p0"], Value::Int(10));
        let stmt = compile(QueryBuilder::new(users()).with_trashed().order_by_desc("id").limit(5));
        assert_eq!(stmt.text(), "MATCH (n:users) RETURN n ORDER BY n.id DESC LIMIT $p0");
    }

    #[test]
    fn joins_bind_their_alias() {
        let stmt = compile(
            QueryBuilder::new(users())
                .with_trashed()
                .join("posts", "p", "p.user_id", "=", "users.id")
                .where_eq("p.published", true)
                .select(["name", "p.title"]),
        );
        assert_eq!(
            stmt.text(),
            "MATCH (n:users), (p:posts) WHERE p.user_id = n.id AND (p.published = $p0) \
             RETURN n.name AS name, p.title AS title"
        );
    }

    #[test]
    fn left_joins_filter_after_optional_match() {
        let stmt = compile(
            QueryBuilder::new(users())
                .with_trashed()
                .left_join("posts", "p", "p.user_id", "=", "n.id")
                .where_null("p.id"),
        );
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) OPTIONAL MATCH (p:posts) WHERE p.user_id = n.id WITH * WHERE p.id IS NULL RETURN n"
        );
    }

    #[test]
    fn where_has_compiles_to_exists_subquery() {
        let users = Arc::new(EntitySchema::new("User", "users"));
        let posts = Arc::new(EntitySchema::new("Post", "posts"));
        let rel = Arc::new(RelationshipDescriptor::has_many("posts", &users, &posts));
        let state = QueryBuilder::new(users)
            .where_has("posts", |q| q.where_eq("published", true))
            .build()
            .unwrap();
        let stmt = StatementCompiler::new(StorageMode::NativeEdge)
            .compile_read(&state, &[rel])
            .unwrap();
        assert_eq!(
            stmt.text(),
            "MATCH (n:users) WHERE EXISTS { MATCH (n)-[h0_e:HAS_POSTS]->(h0:posts) WHERE (h0.published = $p0) } RETURN n"
        );
    }

    #[test]
    fn unknown_relationship_is_a_compile_error() {
        let state = QueryBuilder::new(users()).has_related("ghosts").build().unwrap();
        let err = StatementCompiler::new(StorageMode::ForeignKey)
            .compile_read(&state, &[])
            .unwrap_err();
        assert_eq!(err.code(), "UnknownRelationship");
    }

    #[test]
    fn related_load_returns_parent_key_and_pivot() {
        let users = Arc::new(EntitySchema::new("User", "users"));
        let roles = Arc::new(EntitySchema::new("Role", "roles"));
        let rel = RelationshipDescriptor::belongs_to_many("roles", &users, &roles);
        let related = StatementCompiler::new(StorageMode::NativeEdge)
            .compile_related(&rel, vec![Value::Int(1), Value::Int(2)], None, &[])
            .unwrap();
        assert_eq!(
            related.statement.text(),
            "MATCH (p:users) WHERE p.id IN $p0 MATCH (p)-[r_e:HAS_ROLES]->(r:roles) \
             RETURN p.id AS __parent, r, properties(r_e) AS __pivot ORDER BY __parent, r.id ASC"
        );
    }
}
