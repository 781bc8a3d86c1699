#![forbid(unsafe_code)]
//! Operator and clause translation.
//!
//! Maps relational operators and clause shapes onto Cypher fragments. Every
//! column is prefixed with the variable its node is bound to; only columns
//! explicitly marked raw pass through unmodified.

use std::collections::BTreeMap;

use crate::naming;
use crate::query::ast::{Column, JsonCheck, Operand, Operator, Predicate};
use crate::query::binder::ParameterBinder;
use crate::query::errors::CompilationError;
use crate::schema::EntitySchema;
use crate::value::{StorageRepr, Value};

/// Variables visible while translating a clause.
#[derive(Clone, Debug)]
pub struct Scope<'a> {
    /// Variable bound to the queried entity.
    pub var: &'a str,
    /// Queried entity.
    pub entity: &'a EntitySchema,
    /// Join aliases visible as qualifiers (alias doubles as variable name).
    pub aliases: Vec<String>,
}

impl<'a> Scope<'a> {
    /// Scope over a single entity bound to `var`.
    pub fn new(var: &'a str, entity: &'a EntitySchema) -> Self {
        Self {
            var,
            entity,
            aliases: Vec::new(),
        }
    }

    fn qualifier_var(&self, qualifier: &str, column: &str) -> Result<String, CompilationError> {
        if qualifier == self.var
            || self.entity.labels.iter().any(|l| l == qualifier)
            || qualifier.eq_ignore_ascii_case(&self.entity.name)
        {
            return Ok(self.var.to_owned());
        }
        if self.aliases.iter().any(|a| a == qualifier) {
            return Ok(qualifier.to_owned());
        }
        Err(CompilationError::UnknownQualifier {
            qualifier: qualifier.to_owned(),
            column: column.to_owned(),
        })
    }
}

/// A column resolved against a scope.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedColumn {
    /// Cypher expression (`n.age`, `apoc.convert.fromJsonMap(n.options).lang`).
    pub expr: String,
    /// Variable the column belongs to (empty for raw columns).
    pub var: String,
    /// Property name without qualifier or path.
    pub property: String,
    /// True when a `->` path was present.
    pub has_path: bool,
    /// Expression of the bare property, before path navigation.
    pub base_expr: String,
}

/// Resolves a caller column into a prefixed Cypher expression.
pub fn resolve_column(scope: &Scope<'_>, column: &Column) -> Result<ResolvedColumn, CompilationError> {
    let text = match column {
        Column::Raw(raw) => {
            return Ok(ResolvedColumn {
                expr: raw.clone(),
                var: String::new(),
                property: raw.clone(),
                has_path: false,
                base_expr: raw.clone(),
            })
        }
        Column::Property(text) => text.trim(),
    };
    let mut segments = text.split("->").map(str::trim);
    let head = segments.next().unwrap_or_default();
    let path: Vec<&str> = segments.collect();

    let (var, property) = match head.split_once('.') {
        Some((qualifier, property)) => (scope.qualifier_var(qualifier, text)?, property),
        None => (scope.var.to_owned(), head),
    };
    if !naming::is_identifier(property) {
        return Err(CompilationError::invalid_column(text));
    }
    let base_expr = format!("{var}.{property}");
    let mut expr = if path.is_empty() {
        base_expr.clone()
    } else {
        format!("apoc.convert.fromJsonMap({base_expr})")
    };
    for segment in &path {
        if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
            expr.push_str(&format!("[{segment}]"));
        } else if naming::is_identifier(segment) {
            expr.push('.');
            expr.push_str(segment);
        } else {
            return Err(CompilationError::invalid_column(text));
        }
    }
    Ok(ResolvedColumn {
        expr,
        var,
        property: property.to_owned(),
        has_path: !path.is_empty(),
        base_expr,
    })
}

/// Translates a predicate in isolation: `(fragment, bindings)`.
pub fn translate(
    scope: &Scope<'_>,
    predicate: &Predicate,
) -> Result<(String, BTreeMap<String, Value>), CompilationError> {
    let mut binder = ParameterBinder::new();
    let fragment = translate_predicate(scope, predicate, &mut binder)?;
    Ok((fragment, binder.finish().0))
}

/// Translates a predicate, binding literals into `binder`.
pub fn translate_predicate(
    scope: &Scope<'_>,
    predicate: &Predicate,
    binder: &mut ParameterBinder,
) -> Result<String, CompilationError> {
    let column = resolve_column(scope, &predicate.column)?;
    let key = predicate.column.text();
    let op = predicate.operator;
    match op {
        Operator::Eq | Operator::Ne | Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge => {
            let value = single(op, &predicate.operand)?;
            if value.is_null() {
                return match op {
                    Operator::Eq => Ok(format!("{} IS NULL", column.expr)),
                    Operator::Ne => Ok(format!("{} IS NOT NULL", column.expr)),
                    _ => Err(CompilationError::NullNotAllowed {
                        operator: op.as_str(),
                    }),
                };
            }
            let placeholder = binder.bind_operand(key, op, 0, value.clone());
            Ok(format!("{} {} {placeholder}", column.expr, cypher_comparison(op)))
        }
        Operator::Like | Operator::NotLike | Operator::ILike | Operator::NotILike => {
            let value = single(op, &predicate.operand)?;
            let pattern = match value {
                Value::String(pattern) => pattern,
                Value::Null => {
                    return Err(CompilationError::NullNotAllowed {
                        operator: op.as_str(),
                    })
                }
                _ => {
                    return Err(CompilationError::OperandShape {
                        operator: op.as_str(),
                        expected: "a string pattern",
                    })
                }
            };
            let insensitive = matches!(op, Operator::ILike | Operator::NotILike);
            let fragment = like_fragment(&column.expr, pattern, insensitive, key, op, binder);
            if matches!(op, Operator::NotLike | Operator::NotILike) {
                Ok(format!("NOT ({fragment})"))
            } else {
                Ok(fragment)
            }
        }
        Operator::Regex => {
            let value = single(op, &predicate.operand)?;
            match value {
                Value::String(_) => {
                    let placeholder = binder.bind_operand(key, op, 0, value.clone());
                    Ok(format!("{} =~ {placeholder}", column.expr))
                }
                Value::Null => Err(CompilationError::NullNotAllowed {
                    operator: op.as_str(),
                }),
                _ => Err(CompilationError::OperandShape {
                    operator: op.as_str(),
                    expected: "a string pattern",
                }),
            }
        }
        Operator::In | Operator::NotIn => {
            let items: Vec<Value> = match &predicate.operand {
                Operand::List(items) => items.clone(),
                Operand::Value(Value::List(items)) => items.clone(),
                _ => {
                    return Err(CompilationError::OperandShape {
                        operator: op.as_str(),
                        expected: "a list of values",
                    })
                }
            };
            let items: Vec<Value> = items.into_iter().filter(|v| !v.is_null()).collect();
            if items.is_empty() {
                return Ok(if op == Operator::In { "false" } else { "true" }.to_owned());
            }
            let placeholder = binder.bind_list(key, op, items);
            if op == Operator::In {
                Ok(format!("{} IN {placeholder}", column.expr))
            } else {
                Ok(format!("NOT ({} IN {placeholder})", column.expr))
            }
        }
        Operator::Between | Operator::NotBetween => {
            let (low, high) = match &predicate.operand {
                Operand::Range(low, high) => (low.clone(), high.clone()),
                Operand::List(items) | Operand::Value(Value::List(items)) if items.len() == 2 => {
                    (items[0].clone(), items[1].clone())
                }
                _ => {
                    return Err(CompilationError::OperandShape {
                        operator: op.as_str(),
                        expected: "exactly two bounds",
                    })
                }
            };
            if low.is_null() || high.is_null() {
                return Err(CompilationError::NullNotAllowed {
                    operator: op.as_str(),
                });
            }
            let low = binder.bind_operand(key, op, 0, low);
            let high = binder.bind_operand(key, op, 1, high);
            if op == Operator::Between {
                Ok(format!("({e} >= {low} AND {e} <= {high})", e = column.expr))
            } else {
                Ok(format!("({e} < {low} OR {e} > {high})", e = column.expr))
            }
        }
    }
}

fn single(op: Operator, operand: &Operand) -> Result<&Value, CompilationError> {
    match operand {
        Operand::Value(value) => Ok(value),
        _ => Err(CompilationError::OperandShape {
            operator: op.as_str(),
            expected: "a single value",
        }),
    }
}

/// Cypher spelling of a plain comparison operator.
pub fn cypher_comparison(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Lt => "<",
        Operator::Gt => ">",
        Operator::Le => "<=",
        Operator::Ge => ">=",
        _ => "=",
    }
}

/// Shape of a LIKE pattern after wildcard analysis.
#[derive(Debug, PartialEq, Eq)]
enum LikeShape {
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Regex(String),
}

fn analyze_like(pattern: &str) -> LikeShape {
    // Tokenize into literal chars and wildcards, honouring `\` escapes.
    #[derive(PartialEq)]
    enum Tok {
        Lit(char),
        Any,
        One,
    }
    let mut toks = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    toks.push(Tok::Lit(next));
                } else {
                    toks.push(Tok::Lit('\\'));
                }
            }
            '%' => toks.push(Tok::Any),
            '_' => toks.push(Tok::One),
            other => toks.push(Tok::Lit(other)),
        }
    }
    let leading = toks.first() == Some(&Tok::Any);
    let trailing = toks.len() > 1 && toks.last() == Some(&Tok::Any);
    let start = usize::from(leading);
    let end = toks.len() - usize::from(trailing);
    let inner = &toks[start..end.max(start)];
    if inner.iter().all(|t| matches!(t, Tok::Lit(_))) {
        let literal: String = inner
            .iter()
            .filter_map(|t| match t {
                Tok::Lit(c) => Some(*c),
                _ => None,
            })
            .collect();
        return match (leading, trailing) {
            (false, false) => LikeShape::Exact(literal),
            (true, true) => LikeShape::Contains(literal),
            (false, true) => LikeShape::StartsWith(literal),
            (true, false) if toks.len() == 1 => LikeShape::Contains(literal),
            (true, false) => LikeShape::EndsWith(literal),
        };
    }
    let mut regex = String::from("(?s)");
    for tok in &toks {
        match tok {
            Tok::Any => regex.push_str(".*"),
            Tok::One => regex.push('.'),
            Tok::Lit(c) => {
                if "\\.+*?()|[]{}^$".contains(*c) {
                    regex.push('\\');
                }
                regex.push(*c);
            }
        }
    }
    LikeShape::Regex(regex)
}

fn like_fragment(
    expr: &str,
    pattern: &str,
    insensitive: bool,
    key: &str,
    op: Operator,
    binder: &mut ParameterBinder,
) -> String {
    let target = if insensitive {
        format!("toLower({expr})")
    } else {
        expr.to_owned()
    };
    let fold = |s: String| if insensitive { s.to_lowercase() } else { s };
    match analyze_like(pattern) {
        LikeShape::Exact(lit) => {
            let p = binder.bind_operand(key, op, 0, Value::String(fold(lit)));
            format!("{target} = {p}")
        }
        LikeShape::Contains(lit) => {
            let p = binder.bind_operand(key, op, 0, Value::String(fold(lit)));
            format!("{target} CONTAINS {p}")
        }
        LikeShape::StartsWith(lit) => {
            let p = binder.bind_operand(key, op, 0, Value::String(fold(lit)));
            format!("{target} STARTS WITH {p}")
        }
        LikeShape::EndsWith(lit) => {
            let p = binder.bind_operand(key, op, 0, Value::String(fold(lit)));
            format!("{target} ENDS WITH {p}")
        }
        LikeShape::Regex(regex) => {
            let regex = if insensitive {
                format!("(?i){regex}")
            } else {
                regex
            };
            let p = binder.bind_operand(key, op, 0, Value::String(regex));
            format!("{expr} =~ {p}")
        }
    }
}

/// Storage representation of the collection targeted by a JSON predicate.
///
/// A `->` path always navigates a JSON string. Without a path the entity's
/// JSON property declarations decide; undeclared collections are native lists.
pub fn json_target_repr(scope: &Scope<'_>, column: &ResolvedColumn) -> StorageRepr {
    if column.has_path {
        return StorageRepr::JsonString;
    }
    if column.var == scope.var && scope.entity.json_properties.contains(&column.property) {
        StorageRepr::JsonString
    } else {
        StorageRepr::NativeList
    }
}

/// Translates a JSON containment or length check.
pub fn translate_json(
    scope: &Scope<'_>,
    column: &Column,
    check: &JsonCheck,
    negated: bool,
    binder: &mut ParameterBinder,
) -> Result<String, CompilationError> {
    let resolved = resolve_column(scope, column)?;
    let collection = match (json_target_repr(scope, &resolved), resolved.has_path) {
        (StorageRepr::JsonString, false) => {
            format!("apoc.convert.fromJsonList({})", resolved.expr)
        }
        _ => resolved.expr.clone(),
    };
    let key = column.text();
    let fragment = match check {
        JsonCheck::Contains(value) => {
            if value.is_null() {
                return Err(CompilationError::NullNotAllowed {
                    operator: "json contains",
                });
            }
            match value {
                Value::List(items) if value.storage_repr() == StorageRepr::NativeList => {
                    let p = binder.bind_list(key, Operator::In, items.clone());
                    format!("all(item IN {p} WHERE item IN {collection})")
                }
                Value::Map(_) => {
                    let p = binder.bind_operand(key, Operator::In, 0, value.clone());
                    format!("apoc.convert.fromJsonMap({p}) IN {collection}")
                }
                Value::List(_) => {
                    let p = binder.bind_operand(key, Operator::In, 0, value.clone());
                    format!("all(item IN apoc.convert.fromJsonList({p}) WHERE item IN {collection})")
                }
                _ => {
                    let p = binder.bind_operand(key, Operator::In, 0, value.clone());
                    format!("{p} IN {collection}")
                }
            }
        }
        JsonCheck::Length { operator, value } => {
            if !operator.is_comparison() {
                return Err(CompilationError::OperandShape {
                    operator: "json length",
                    expected: "a comparison operator",
                });
            }
            let p = binder.bind_operand(key, *operator, 1, Value::Int(*value));
            format!("size({collection}) {} {p}", cypher_comparison(*operator))
        }
    };
    Ok(if negated {
        format!("NOT ({fragment})")
    } else {
        fragment
    })
}

/// Translates a column-to-column comparison.
pub fn translate_columns(
    scope: &Scope<'_>,
    first: &Column,
    operator: Operator,
    second: &Column,
) -> Result<String, CompilationError> {
    if !operator.is_comparison() {
        return Err(CompilationError::OperandShape {
            operator: operator.as_str(),
            expected: "a comparison between two columns",
        });
    }
    let left = resolve_column(scope, first)?;
    let right = resolve_column(scope, second)?;
    Ok(format!(
        "{} {} {}",
        left.expr,
        cypher_comparison(operator),
        right.expr
    ))
}

/// Translates a raw fragment, binding its caller-named values.
pub fn translate_raw(
    fragment: &str,
    bindings: &[(String, Value)],
    binder: &mut ParameterBinder,
) -> Result<String, CompilationError> {
    for (name, value) in bindings {
        binder.bind_named(name, value.clone())?;
    }
    Ok(format!("({fragment})"))
}
