//! Immutable compiled statements handed to the execution coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::StatementContext;
use crate::query::errors::CompilationError;
use crate::value::Value;

/// Whether a statement only reads or may write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Intent {
    /// Eligible for read replicas.
    Read,
    /// Always routed to the writer.
    Write,
}

/// Parameterized statement ready for execution.
///
/// Constructed only through [`CompiledStatement::new`], which rejects texts
/// referencing unbound placeholders and bindings nothing references. Once
/// built it is never mutated, so it can be re-issued verbatim on retry.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledStatement {
    text: String,
    parameters: BTreeMap<String, Value>,
    intent: Intent,
    returns_rows: bool,
    json_encoded: BTreeSet<String>,
}

impl CompiledStatement {
    /// Validates the placeholder/binding round-trip and freezes the statement.
    pub fn new(
        text: impl Into<String>,
        parameters: BTreeMap<String, Value>,
        intent: Intent,
        returns_rows: bool,
    ) -> Result<Self, CompilationError> {
        let text = text.into();
        let referenced = placeholders(&text);
        if let Some(missing) = referenced.iter().find(|name| !parameters.contains_key(*name)) {
            return Err(CompilationError::UnboundPlaceholder {
                name: missing.clone(),
            });
        }
        if let Some(orphan) = parameters.keys().find(|name| !referenced.contains(*name)) {
            return Err(CompilationError::OrphanBinding {
                name: orphan.clone(),
            });
        }
        Ok(Self {
            text,
            parameters,
            intent,
            returns_rows,
            json_encoded: BTreeSet::new(),
        })
    }

    /// Records properties whose values were serialized to JSON strings.
    pub(crate) fn with_json_encoded(mut self, props: BTreeSet<String>) -> Self {
        self.json_encoded = props;
        self
    }

    /// Statement text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bound parameters.
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    /// Read or write.
    pub fn intent(&self) -> Intent {
        self.intent
    }

    /// Whether the caller expects rows back.
    pub fn returns_rows(&self) -> bool {
        self.returns_rows
    }

    /// Properties written as JSON strings by this statement.
    pub fn json_encoded(&self) -> &BTreeSet<String> {
        &self.json_encoded
    }

    /// Diagnostic context attached to driver errors.
    pub fn context(&self) -> StatementContext {
        StatementContext::new(self.text.clone(), self.parameters.clone())
    }
}

impl fmt::Display for CompiledStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.context(), f)
    }
}

/// Extracts every `$name` placeholder referenced by `text`, ignoring quoted
/// string literals and backtick-quoted identifiers.
pub fn placeholders(text: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut chars = text.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((_, c)) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' && q != '`' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '$' => {
                let mut name = String::new();
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !name.is_empty() {
                    found.insert(name);
                }
            }
            _ => {}
        }
    }
    found
}
