//! Builder state accumulated by [`QueryBuilder`](crate::query::QueryBuilder).
//!
//! The structures mirror the relational vocabulary callers use (where-clauses,
//! joins, ordering, aggregates). They are lowered into Cypher text by the
//! statement compiler; nothing here knows about the graph model yet.

use std::fmt;
use std::sync::Arc;

use crate::query::errors::CompilationError;
use crate::relation::StorageMode;
use crate::schema::EntitySchema;
use crate::value::Value;

/// Boolean connector joining a clause to the clauses before it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Connector {
    /// `AND`
    #[default]
    And,
    /// `OR`
    Or,
}

impl Connector {
    /// Cypher keyword.
    pub fn keyword(self) -> &'static str {
        match self {
            Connector::And => "AND",
            Connector::Or => "OR",
        }
    }
}

/// Relational comparison operators understood by the translator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=` / `<>`
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// SQL `LIKE`
    Like,
    /// SQL `NOT LIKE`
    NotLike,
    /// Case-insensitive `LIKE`
    ILike,
    /// Case-insensitive `NOT LIKE`
    NotILike,
    /// List membership
    In,
    /// Negated list membership
    NotIn,
    /// Inclusive range
    Between,
    /// Outside inclusive range
    NotBetween,
    /// Regular expression match (`=~`)
    Regex,
}

impl Operator {
    /// Parses the relational spelling of an operator.
    pub fn parse(text: &str) -> Result<Self, CompilationError> {
        let normalized = text.trim().to_ascii_lowercase();
        let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        let op = match normalized.as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            "<" => Operator::Lt,
            ">" => Operator::Gt,
            "<=" => Operator::Le,
            ">=" => Operator::Ge,
            "like" => Operator::Like,
            "not like" => Operator::NotLike,
            "ilike" => Operator::ILike,
            "not ilike" => Operator::NotILike,
            "in" => Operator::In,
            "not in" => Operator::NotIn,
            "between" => Operator::Between,
            "not between" => Operator::NotBetween,
            "regexp" | "=~" => Operator::Regex,
            _ => {
                return Err(CompilationError::UnknownOperator {
                    operator: text.to_owned(),
                })
            }
        };
        Ok(op)
    }

    /// Canonical relational spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Like => "like",
            Operator::NotLike => "not like",
            Operator::ILike => "ilike",
            Operator::NotILike => "not ilike",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Between => "between",
            Operator::NotBetween => "not between",
            Operator::Regex => "regexp",
        }
    }

    /// True for the plain comparison operators that map 1:1 onto Cypher.
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eq | Operator::Ne | Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column reference as written by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// `name`, `table.name` or `name->json->path`; validated at compile time.
    Property(String),
    /// Passed through unmodified. The caller owns its correctness.
    Raw(String),
}

impl Column {
    /// Caller-facing text of the column.
    pub fn text(&self) -> &str {
        match self {
            Column::Property(text) | Column::Raw(text) => text,
        }
    }
}

impl From<&str> for Column {
    fn from(value: &str) -> Self {
        Column::Property(value.to_owned())
    }
}

impl From<String> for Column {
    fn from(value: String) -> Self {
        Column::Property(value)
    }
}

/// Right-hand side of a predicate.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// Single value (possibly `Null`).
    Value(Value),
    /// Value list for `IN` / `NOT IN`.
    List(Vec<Value>),
    /// Inclusive bounds for `BETWEEN`.
    Range(Value, Value),
}

/// A single `column operator operand` comparison.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    /// Left-hand column.
    pub column: Column,
    /// Comparison operator.
    pub operator: Operator,
    /// Right-hand operand.
    pub operand: Operand,
    /// Connector to the previous clause.
    pub connector: Connector,
}

/// JSON-path checks.
#[derive(Clone, Debug, PartialEq)]
pub enum JsonCheck {
    /// Collection contains the value (or every element of a list value).
    Contains(Value),
    /// Collection length compared with a number.
    Length {
        /// Comparison operator; must be a plain comparison.
        operator: Operator,
        /// Right-hand number.
        value: i64,
    },
}

/// One entry of a where (or having) list.
#[derive(Clone, Debug, PartialEq)]
pub enum WhereClause {
    /// Column comparison.
    Basic(Predicate),
    /// Column against column (`whereColumn`).
    Columns {
        /// Left column.
        first: Column,
        /// Comparison operator.
        operator: Operator,
        /// Right column.
        second: Column,
        /// Connector to the previous clause.
        connector: Connector,
    },
    /// JSON containment / length predicate.
    Json {
        /// Target column, optionally with a `->` path.
        column: Column,
        /// Check to perform.
        check: JsonCheck,
        /// Wrap in `NOT`.
        negated: bool,
        /// Connector to the previous clause.
        connector: Connector,
    },
    /// Parenthesised nested group.
    Group {
        /// Nested clauses.
        clauses: Vec<WhereClause>,
        /// Wrap in `NOT`.
        negated: bool,
        /// Connector to the previous clause.
        connector: Connector,
    },
    /// Raw fragment with caller-named bindings.
    Raw {
        /// Fragment passed through unmodified.
        fragment: String,
        /// Named bindings referenced as `$name` inside the fragment.
        bindings: Vec<(String, Value)>,
        /// Connector to the previous clause.
        connector: Connector,
    },
    /// Relationship existence (`whereHas` / `whereDoesntHave`).
    Has {
        /// Relationship name on the queried entity.
        relation: String,
        /// Optional constraints on the related entity.
        constraint: Option<Box<QueryState>>,
        /// `whereDoesntHave` when true.
        negated: bool,
        /// Connector to the previous clause.
        connector: Connector,
    },
}

impl WhereClause {
    /// Connector of this clause.
    pub fn connector(&self) -> Connector {
        match self {
            WhereClause::Basic(p) => p.connector,
            WhereClause::Columns { connector, .. }
            | WhereClause::Json { connector, .. }
            | WhereClause::Group { connector, .. }
            | WhereClause::Raw { connector, .. }
            | WhereClause::Has { connector, .. } => *connector,
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

impl Direction {
    /// Cypher keyword.
    pub fn keyword(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// One `ORDER BY` key.
#[derive(Clone, Debug, PartialEq)]
pub struct SortKey {
    /// Column to sort on.
    pub column: Column,
    /// Direction.
    pub direction: Direction,
}

/// Aggregate functions available in projections.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AggregateFunction {
    /// Row or non-null value count.
    Count,
    /// Distinct value count.
    CountDistinct,
    /// Sum.
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Continuous percentile in `[0, 1]`.
    PercentileCont(f64),
    /// Discrete percentile in `[0, 1]`.
    PercentileDisc(f64),
    /// Sample standard deviation.
    StdDev,
    /// Population standard deviation.
    StdDevP,
    /// Collects values into a list.
    Collect,
}

impl AggregateFunction {
    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::CountDistinct => "count_distinct",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::PercentileCont(_) => "percentile_cont",
            AggregateFunction::PercentileDisc(_) => "percentile_disc",
            AggregateFunction::StdDev => "std_dev",
            AggregateFunction::StdDevP => "std_dev_p",
            AggregateFunction::Collect => "collect",
        }
    }

    /// Value reported when no row matched.
    pub fn empty_value(self) -> Value {
        match self {
            AggregateFunction::Count | AggregateFunction::CountDistinct => Value::Int(0),
            AggregateFunction::Collect => Value::List(Vec::new()),
            _ => Value::Null,
        }
    }
}

/// Aggregate projection descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    /// Function to apply.
    pub function: AggregateFunction,
    /// Target columns; empty means "rows" for counts.
    pub columns: Vec<Column>,
}

/// Selected output column.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// Column to project.
    pub column: Column,
    /// Output name; defaults to the property name.
    pub alias: Option<String>,
}

/// Relational join flavour.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinKind {
    /// `MATCH`
    Inner,
    /// `OPTIONAL MATCH`
    Left,
}

/// Join against another label set, expressed through property equality.
#[derive(Clone, Debug, PartialEq)]
pub struct Join {
    /// Join flavour.
    pub kind: JoinKind,
    /// Joined label (relational table name).
    pub label: String,
    /// Variable the joined node is bound to.
    pub alias: String,
    /// `ON` conditions, ANDed.
    pub conditions: Vec<(Column, Operator, Column)>,
}

/// Soft-delete visibility.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TrashedScope {
    /// Hide soft-deleted entities.
    #[default]
    Exclude,
    /// Include soft-deleted entities.
    Include,
    /// Only soft-deleted entities.
    Only,
}

/// Mutable builder accumulator owned by exactly one compilation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState {
    /// Queried entity.
    pub entity: Arc<EntitySchema>,
    /// Where-clauses in declaration order.
    pub wheres: Vec<WhereClause>,
    /// Sort keys in declaration order.
    pub orders: Vec<SortKey>,
    /// Group-by columns.
    pub groups: Vec<Column>,
    /// Having-clauses evaluated after grouping.
    pub havings: Vec<WhereClause>,
    /// Maximum rows.
    pub limit: Option<u64>,
    /// Rows to skip.
    pub offset: Option<u64>,
    /// Selected columns; empty selects the whole entity.
    pub projections: Vec<Projection>,
    /// `RETURN DISTINCT`.
    pub distinct: bool,
    /// Aggregate projection.
    pub aggregate: Option<Aggregate>,
    /// Relational joins.
    pub joins: Vec<Join>,
    /// Soft-delete visibility.
    pub trashed: TrashedScope,
    /// Per-query relationship storage override (highest precedence).
    pub storage_override: Option<StorageMode>,
}

impl QueryState {
    /// Empty state over `entity`.
    pub fn new(entity: Arc<EntitySchema>) -> Self {
        Self {
            entity,
            wheres: Vec::new(),
            orders: Vec::new(),
            groups: Vec::new(),
            havings: Vec::new(),
            limit: None,
            offset: None,
            projections: Vec::new(),
            distinct: false,
            aggregate: None,
            joins: Vec::new(),
            trashed: TrashedScope::default(),
            storage_override: None,
        }
    }
}
