//! ClickHouse literal and identifier syntax.
//!
//! Every value embedded into statement text goes through [`quote_literal`].
//! The `clickhouse` client scans statement text for `?` bind placeholders, so
//! question marks inside quoted text are written as the `\x3F` escape.

use serde_json::Value;

/// Render a JSON scalar as a ClickHouse literal.
///
/// Numbers stay unquoted, strings are quoted and escaped, `null` becomes `NULL`.
/// Arrays and objects have no scalar form and are stored as their JSON text.
pub fn quote_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(s),
        Value::Array(_) | Value::Object(_) => quote_string(&value.to_string()),
    }
}

/// Single-quoted string literal with backslash escapes.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    escape_into(&mut out, s, '\'');
    out.push('\'');
    out
}

/// Backquoted identifier.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    escape_into(&mut out, name, '`');
    out.push('`');
    out
}

/// Quote a possibly database-qualified table name, e.g. `dev.invoice`.
pub fn quote_table(name: &str) -> String {
    name.split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

fn escape_into(out: &mut String, s: &str, quote: char) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '?' => out.push_str("\\x3F"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}
