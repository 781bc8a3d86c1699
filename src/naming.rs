//! Identifier helpers: case conversion, pluralization and Cypher quoting.

/// Converts `PascalCase`, `camelCase` or `kebab-case` to `snake_case`.
pub fn snake_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev_lower = false;
    for c in s.chars() {
        if c == '-' || c == ' ' || c == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() {
            if prev_lower && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

/// Converts to `UPPER_SNAKE_CASE`, the conventional edge type spelling.
pub fn upper_snake_case(s: &str) -> String {
    snake_case(s).to_uppercase()
}

/// Naive English pluralization of the last `_`-separated word.
pub fn pluralize(word: &str) -> String {
    let lower = word.to_lowercase();
    if lower.is_empty() {
        return String::new();
    }
    if lower.ends_with('s') && !lower.ends_with("ss") {
        return word.to_owned();
    }
    if lower.ends_with("ss")
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{word}es");
    }
    if let Some(stem) = word.strip_suffix('y') {
        let before = stem.chars().last().map(|c| c.to_ascii_lowercase());
        if !matches!(before, Some('a' | 'e' | 'i' | 'o' | 'u')) {
            return format!("{stem}ies");
        }
    }
    format!("{word}s")
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quotes a label, edge type or property name when it is not a plain identifier.
pub fn quote(name: &str) -> String {
    if is_identifier(name) {
        name.to_owned()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

/// Renders a label set as `:a:b`.
pub fn label_pattern<S: AsRef<str>>(labels: &[S]) -> String {
    labels
        .iter()
        .map(|l| format!(":{}", quote(l.as_ref())))
        .collect()
}
