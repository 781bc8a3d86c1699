//! Fluent query builder.
//!
//! Every method consumes and returns the builder. The first invalid input is
//! latched and reported by [`QueryBuilder::build`]; later calls become no-ops.

use std::sync::Arc;

use crate::query::ast::{
    Aggregate, AggregateFunction, Column, Connector, Direction, Join, JoinKind, JsonCheck,
    Operand, Operator, Predicate, Projection, QueryState, SortKey, TrashedScope, WhereClause,
};
use crate::query::errors::CompilationError;
use crate::relation::StorageMode;
use crate::schema::EntitySchema;
use crate::value::Value;

/// Marks an expression as raw: it is passed through without prefixing.
pub fn raw(expr: impl Into<String>) -> Column {
    Column::Raw(expr.into())
}

/// Fluent builder producing a [`QueryState`].
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    state: QueryState,
    error: Option<CompilationError>,
}

impl QueryBuilder {
    /// Starts a query over `entity`.
    pub fn new(entity: Arc<EntitySchema>) -> Self {
        Self {
            state: QueryState::new(entity),
            error: None,
        }
    }

    /// Entity being queried.
    pub fn entity(&self) -> &Arc<EntitySchema> {
        &self.state.entity
    }

    fn record_error(&mut self, err: CompilationError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn push_where(mut self, clause: WhereClause) -> Self {
        if self.error.is_none() {
            self.state.wheres.push(clause);
        }
        self
    }

    fn push_predicate(
        self,
        column: Column,
        operator: Operator,
        operand: Operand,
        connector: Connector,
    ) -> Self {
        self.push_where(WhereClause::Basic(Predicate {
            column,
            operator,
            operand,
            connector,
        }))
    }

    fn parsed(&mut self, op: &str) -> Option<Operator> {
        match Operator::parse(op) {
            Ok(op) => Some(op),
            Err(err) => {
                self.record_error(err);
                None
            }
        }
    }

    fn op_where(
        mut self,
        column: Column,
        op: &str,
        value: Value,
        connector: Connector,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(operator) = self.parsed(op) else {
            return self;
        };
        let operand = operand_for(operator, value);
        self.push_predicate(column, operator, operand, connector)
    }

    /// `where(column, op, value)`.
    pub fn where_op(self, column: impl Into<Column>, op: &str, value: impl Into<Value>) -> Self {
        self.op_where(column.into(), op, value.into(), Connector::And)
    }

    /// `where(column, value)`: equality.
    pub fn where_eq(self, column: impl Into<Column>, value: impl Into<Value>) -> Self {
        self.push_predicate(
            column.into(),
            Operator::Eq,
            Operand::Value(value.into()),
            Connector::And,
        )
    }

    /// `orWhere(column, op, value)`.
    pub fn or_where(self, column: impl Into<Column>, op: &str, value: impl Into<Value>) -> Self {
        self.op_where(column.into(), op, value.into(), Connector::Or)
    }

    /// `whereIn`.
    pub fn where_in<I, V>(self, column: impl Into<Column>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push_predicate(column.into(), Operator::In, Operand::List(values), Connector::And)
    }

    /// `whereNotIn`.
    pub fn where_not_in<I, V>(self, column: impl Into<Column>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push_predicate(column.into(), Operator::NotIn, Operand::List(values), Connector::And)
    }

    /// `orWhereIn`.
    pub fn or_where_in<I, V>(self, column: impl Into<Column>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push_predicate(column.into(), Operator::In, Operand::List(values), Connector::Or)
    }

    /// `whereBetween`, inclusive on both ends.
    pub fn where_between(
        self,
        column: impl Into<Column>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.push_predicate(
            column.into(),
            Operator::Between,
            Operand::Range(low.into(), high.into()),
            Connector::And,
        )
    }

    /// `whereNotBetween`.
    pub fn where_not_between(
        self,
        column: impl Into<Column>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Self {
        self.push_predicate(
            column.into(),
            Operator::NotBetween,
            Operand::Range(low.into(), high.into()),
            Connector::And,
        )
    }

    /// `whereNull`.
    pub fn where_null(self, column: impl Into<Column>) -> Self {
        self.push_predicate(column.into(), Operator::Eq, Operand::Value(Value::Null), Connector::And)
    }

    /// `whereNotNull`.
    pub fn where_not_null(self, column: impl Into<Column>) -> Self {
        self.push_predicate(column.into(), Operator::Ne, Operand::Value(Value::Null), Connector::And)
    }

    /// `where(column, 'like', pattern)`.
    pub fn where_like(self, column: impl Into<Column>, pattern: impl Into<String>) -> Self {
        self.push_predicate(
            column.into(),
            Operator::Like,
            Operand::Value(Value::String(pattern.into())),
            Connector::And,
        )
    }

    /// `whereColumn(first, op, second)`.
    pub fn where_column(mut self, first: impl Into<Column>, op: &str, second: impl Into<Column>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(operator) = self.parsed(op) else {
            return self;
        };
        self.push_where(WhereClause::Columns {
            first: first.into(),
            operator,
            second: second.into(),
            connector: Connector::And,
        })
    }

    fn group<F>(mut self, build: F, negated: bool, connector: Connector) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        if self.error.is_some() {
            return self;
        }
        let nested = build(QueryBuilder::new(Arc::clone(&self.state.entity)));
        match nested.error {
            Some(err) => {
                self.record_error(err);
                self
            }
            None if nested.state.wheres.is_empty() => self,
            None => self.push_where(WhereClause::Group {
                clauses: nested.state.wheres,
                negated,
                connector,
            }),
        }
    }

    /// Parenthesised group of clauses, ANDed with the rest.
    pub fn where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.group(build, false, Connector::And)
    }

    /// Parenthesised group of clauses, ORed with the rest.
    pub fn or_where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.group(build, false, Connector::Or)
    }

    /// `whereNot`: negated group.
    pub fn where_not<F>(self, build: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.group(build, true, Connector::And)
    }

    /// Raw fragment with named bindings referenced as `$name`.
    pub fn where_raw<I, N, V>(self, fragment: impl Into<String>, bindings: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<Value>,
    {
        let bindings = bindings
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .collect();
        self.push_where(WhereClause::Raw {
            fragment: fragment.into(),
            bindings,
            connector: Connector::And,
        })
    }

    /// `whereJsonContains`.
    pub fn where_json_contains(self, column: impl Into<Column>, value: impl Into<Value>) -> Self {
        self.push_where(WhereClause::Json {
            column: column.into(),
            check: JsonCheck::Contains(value.into()),
            negated: false,
            connector: Connector::And,
        })
    }

    /// `whereJsonDoesntContain`.
    pub fn where_json_doesnt_contain(self, column: impl Into<Column>, value: impl Into<Value>) -> Self {
        self.push_where(WhereClause::Json {
            column: column.into(),
            check: JsonCheck::Contains(value.into()),
            negated: true,
            connector: Connector::And,
        })
    }

    /// `whereJsonLength(column, op, n)`.
    pub fn where_json_length(mut self, column: impl Into<Column>, op: &str, value: i64) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(operator) = self.parsed(op) else {
            return self;
        };
        self.push_where(WhereClause::Json {
            column: column.into(),
            check: JsonCheck::Length { operator, value },
            negated: false,
            connector: Connector::And,
        })
    }

    fn has<F>(mut self, relation: &str, constraint: Option<F>, negated: bool) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        if self.error.is_some() {
            return self;
        }
        let constraint = match constraint {
            Some(build) => {
                // Clauses are re-scoped to the related entity at compile time.
                let nested = build(QueryBuilder::new(Arc::clone(&self.state.entity)));
                match nested.build() {
                    Ok(state) => Some(Box::new(state)),
                    Err(err) => {
                        self.record_error(err);
                        return self;
                    }
                }
            }
            None => None,
        };
        self.push_where(WhereClause::Has {
            relation: relation.to_owned(),
            constraint,
            negated,
            connector: Connector::And,
        })
    }

    /// `has(relation)`: at least one related entity exists.
    pub fn has_related(self, relation: &str) -> Self {
        self.has::<fn(QueryBuilder) -> QueryBuilder>(relation, None, false)
    }

    /// `whereHas(relation, constraint)`.
    pub fn where_has<F>(self, relation: &str, constraint: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.has(relation, Some(constraint), false)
    }

    /// `doesntHave(relation)`.
    pub fn doesnt_have(self, relation: &str) -> Self {
        self.has::<fn(QueryBuilder) -> QueryBuilder>(relation, None, true)
    }

    /// `whereDoesntHave(relation, constraint)`.
    pub fn where_doesnt_have<F>(self, relation: &str, constraint: F) -> Self
    where
        F: FnOnce(QueryBuilder) -> QueryBuilder,
    {
        self.has(relation, Some(constraint), true)
    }

    fn add_join(
        mut self,
        kind: JoinKind,
        label: &str,
        alias: &str,
        first: Column,
        op: &str,
        second: Column,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(operator) = self.parsed(op) else {
            return self;
        };
        self.state.joins.push(Join {
            kind,
            label: label.to_owned(),
            alias: alias.to_owned(),
            conditions: vec![(first, operator, second)],
        });
        self
    }

    /// Inner join on `label` bound to `alias`.
    pub fn join(
        self,
        label: &str,
        alias: &str,
        first: impl Into<Column>,
        op: &str,
        second: impl Into<Column>,
    ) -> Self {
        self.add_join(JoinKind::Inner, label, alias, first.into(), op, second.into())
    }

    /// Left join on `label` bound to `alias`.
    pub fn left_join(
        self,
        label: &str,
        alias: &str,
        first: impl Into<Column>,
        op: &str,
        second: impl Into<Column>,
    ) -> Self {
        self.add_join(JoinKind::Left, label, alias, first.into(), op, second.into())
    }

    /// Projects the given columns.
    pub fn select<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        self.state.projections.extend(columns.into_iter().map(|c| Projection {
            column: c.into(),
            alias: None,
        }));
        self
    }

    /// Projects `column` under `alias`.
    pub fn select_as(mut self, column: impl Into<Column>, alias: impl Into<String>) -> Self {
        self.state.projections.push(Projection {
            column: column.into(),
            alias: Some(alias.into()),
        });
        self
    }

    /// `RETURN DISTINCT`.
    pub fn distinct(mut self) -> Self {
        self.state.distinct = true;
        self
    }

    /// Ascending sort key.
    pub fn order_by(mut self, column: impl Into<Column>) -> Self {
        self.state.orders.push(SortKey {
            column: column.into(),
            direction: Direction::Asc,
        });
        self
    }

    /// Descending sort key.
    pub fn order_by_desc(mut self, column: impl Into<Column>) -> Self {
        self.state.orders.push(SortKey {
            column: column.into(),
            direction: Direction::Desc,
        });
        self
    }

    /// Group-by columns.
    pub fn group_by<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        self.state.groups.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Post-grouping filter.
    pub fn having(mut self, column: impl Into<Column>, op: &str, value: impl Into<Value>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let Some(operator) = self.parsed(op) else {
            return self;
        };
        let operand = operand_for(operator, value.into());
        self.state.havings.push(WhereClause::Basic(Predicate {
            column: column.into(),
            operator,
            operand,
            connector: Connector::And,
        }));
        self
    }

    /// Maximum number of rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.state.limit = Some(limit);
        self
    }

    /// Rows to skip.
    pub fn offset(mut self, offset: u64) -> Self {
        self.state.offset = Some(offset);
        self
    }

    /// 1-based page of `per_page` rows.
    pub fn for_page(mut self, page: u64, per_page: u64) -> Self {
        if page == 0 || per_page == 0 {
            self.record_error(CompilationError::InvalidPagination {
                reason: "page and per_page start at 1",
            });
            return self;
        }
        self.state.offset = Some((page - 1).saturating_mul(per_page));
        self.state.limit = Some(per_page);
        self
    }

    /// Includes soft-deleted entities.
    pub fn with_trashed(mut self) -> Self {
        self.state.trashed = TrashedScope::Include;
        self
    }

    /// Only soft-deleted entities.
    pub fn only_trashed(mut self) -> Self {
        self.state.trashed = TrashedScope::Only;
        self
    }

    /// Overrides relationship storage for this query only.
    pub fn storage_override(mut self, mode: StorageMode) -> Self {
        self.state.storage_override = Some(mode);
        self
    }

    fn aggregate(mut self, function: AggregateFunction, columns: Vec<Column>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let AggregateFunction::PercentileCont(p) | AggregateFunction::PercentileDisc(p) = function {
            if !(0.0..=1.0).contains(&p) {
                self.record_error(CompilationError::PercentileOutOfRange {
                    value: p.to_string(),
                });
                return self;
            }
        }
        let needs_column = !matches!(function, AggregateFunction::Count);
        if needs_column && columns.is_empty() {
            self.record_error(CompilationError::InvalidAggregate {
                reason: "aggregate requires a target column",
            });
            return self;
        }
        self.state.aggregate = Some(Aggregate { function, columns });
        self
    }

    /// `count(*)`.
    pub fn count(self) -> Self {
        self.aggregate(AggregateFunction::Count, Vec::new())
    }

    /// `count(column)`: non-null values.
    pub fn count_column(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Count, vec![column.into()])
    }

    /// `count(DISTINCT column)`.
    pub fn count_distinct(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::CountDistinct, vec![column.into()])
    }

    /// `sum(column)`.
    pub fn sum(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Sum, vec![column.into()])
    }

    /// `avg(column)`.
    pub fn avg(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Avg, vec![column.into()])
    }

    /// `min(column)`.
    pub fn min(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Min, vec![column.into()])
    }

    /// `max(column)`.
    pub fn max(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Max, vec![column.into()])
    }

    /// Continuous percentile, `fraction` in `[0, 1]`.
    pub fn percentile_cont(self, column: impl Into<Column>, fraction: f64) -> Self {
        self.aggregate(AggregateFunction::PercentileCont(fraction), vec![column.into()])
    }

    /// Discrete percentile, `fraction` in `[0, 1]`.
    pub fn percentile_disc(self, column: impl Into<Column>, fraction: f64) -> Self {
        self.aggregate(AggregateFunction::PercentileDisc(fraction), vec![column.into()])
    }

    /// Sample standard deviation.
    pub fn std_dev(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::StdDev, vec![column.into()])
    }

    /// Population standard deviation.
    pub fn std_dev_p(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::StdDevP, vec![column.into()])
    }

    /// Collects values into a list.
    pub fn collect(self, column: impl Into<Column>) -> Self {
        self.aggregate(AggregateFunction::Collect, vec![column.into()])
    }

    /// Returns the accumulated state or the first latched error.
    pub fn build(self) -> Result<QueryState, CompilationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// Picks the operand shape an operator expects from a single value.
fn operand_for(operator: Operator, value: Value) -> Operand {
    match (operator, value) {
        (Operator::In | Operator::NotIn, Value::List(items)) => Operand::List(items),
        (Operator::Between | Operator::NotBetween, Value::List(mut items)) if items.len() == 2 => {
            let high = items.pop().unwrap_or(Value::Null);
            let low = items.pop().unwrap_or(Value::Null);
            Operand::Range(low, high)
        }
        (_, value) => Operand::Value(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Arc<EntitySchema> {
        Arc::new(EntitySchema::new("User", "users"))
    }

    #[test]
    fn first_error_is_latched() {
        let err = QueryBuilder::new(users())
            .where_op("age", "~~", 1i64)
            .where_op("age", "<=>", 1i64)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            CompilationError::UnknownOperator {
                operator: "~~".into()
            }
        );
    }

    #[test]
    fn list_operands_pick_operator_shape() {
        let state = QueryBuilder::new(users())
            .where_op("status", "in", Value::List(vec![Value::from("a")]))
            .where_op("age", "between", Value::List(vec![Value::Int(1), Value::Int(9)]))
            .build()
            .unwrap();
        let shapes: Vec<_> = state
            .wheres
            .iter()
            .map(|w| match w {
                WhereClause::Basic(p) => p.operand.clone(),
                other => panic!("unexpected clause {other:?}"),
            })
            .collect();
        assert_eq!(shapes[0], Operand::List(vec![Value::from("a")]));
        assert_eq!(shapes[1], Operand::Range(Value::Int(1), Value::Int(9)));
    }

    #[test]
    fn nested_groups_keep_connector_and_negation() {
        let state = QueryBuilder::new(users())
            .where_eq("active", true)
            .where_not(|q| q.where_eq("role", "guest").or_where("age", "<", 18i64))
            .build()
            .unwrap();
        match &state.wheres[1] {
            WhereClause::Group {
                clauses, negated, ..
            } => {
                assert!(*negated);
                assert_eq!(clauses.len(), 2);
                assert_eq!(clauses[1].connector(), Connector::Or);
            }
            other => panic!("unexpected clause {other:?}"),
        }
    }

    #[test]
    fn pagination_and_percentiles_are_validated() {
        let state = QueryBuilder::new(users()).for_page(3, 20).build().unwrap();
        assert_eq!((state.offset, state.limit), (Some(40), Some(20)));
        assert_eq!(
            QueryBuilder::new(users()).for_page(0, 20).build().unwrap_err().code(),
            "InvalidPagination"
        );
        assert_eq!(
            QueryBuilder::new(users())
                .percentile_cont("age", 1.5)
                .build()
                .unwrap_err()
                .code(),
            "PercentileOutOfRange"
        );
    }
}
