//! Checking model-proposed arguments against a tool's input schema
//!
//! Local models regularly send arguments as a JSON-encoded string, quote
//! numbers, or stop generating halfway through a SQL statement. The first two
//! are repaired here; anything that cannot be repaired is reported so the
//! model gets a precise error back instead of the server running half a query.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArgumentError {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("arguments are not valid JSON: {0}")]
    Malformed(String),

    #[error("missing required argument `{0}`")]
    MissingRequired(String),

    #[error("argument `{field}` should be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: &'static str,
    },

    #[error("argument `{field}` looks truncated ({reason})")]
    Truncated { field: String, reason: String },
}

/// Validate `args` against `schema`, returning the normalized arguments
///
/// Normalization: `null` becomes `{}`, a JSON-encoded string is decoded, and
/// string values for numeric or boolean properties are converted when they
/// parse cleanly.
pub fn validate_arguments(schema: &Value, args: Value) -> Result<Value, ArgumentError> {
    let mut obj = into_object(args)?;

    let properties = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            match obj.get(key) {
                None | Some(Value::Null) => {
                    return Err(ArgumentError::MissingRequired(key.to_string()))
                }
                Some(_) => {}
            }
        }
    }

    for (key, value) in obj.iter_mut() {
        let expected = properties
            .and_then(|props| props.get(key))
            .and_then(|prop| prop.get("type"))
            .and_then(|t| t.as_str());

        if let Some(expected) = expected {
            *value = coerce(key, expected, value.take())?;
        }

        if let Value::String(s) = value {
            if let Some(reason) = detect_truncation(s) {
                return Err(ArgumentError::Truncated {
                    field: key.clone(),
                    reason,
                });
            }
        }
    }

    Ok(Value::Object(obj))
}

fn into_object(args: Value) -> Result<Map<String, Value>, ArgumentError> {
    match args {
        Value::Object(obj) => Ok(obj),
        Value::Null => Ok(Map::new()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(Map::new());
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(obj)) => Ok(obj),
                Ok(other) => Err(ArgumentError::NotAnObject(json_type_name(&other))),
                Err(e) => match detect_truncation(trimmed) {
                    Some(reason) => Err(ArgumentError::Truncated {
                        field: "arguments".to_string(),
                        reason,
                    }),
                    None => Err(ArgumentError::Malformed(e.to_string())),
                },
            }
        }
        other => Err(ArgumentError::NotAnObject(json_type_name(&other))),
    }
}

fn coerce(field: &str, expected: &str, value: Value) -> Result<Value, ArgumentError> {
    let converted = match (expected, &value) {
        ("string", Value::String(_))
        | ("boolean", Value::Bool(_))
        | ("object", Value::Object(_))
        | ("array", Value::Array(_))
        | ("null", Value::Null) => return Ok(value),
        ("number", Value::Number(_)) => return Ok(value),
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => return Ok(value),
        ("integer", Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64)),
        ("string", Value::Number(n)) => Some(Value::String(n.to_string())),
        ("string", Value::Bool(b)) => Some(Value::String(b.to_string())),
        ("number", Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        ("integer", Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
        ("boolean", Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        // Unknown schema types are not ours to enforce
        (other, _)
            if !matches!(
                other,
                "string" | "number" | "integer" | "boolean" | "object" | "array" | "null"
            ) =>
        {
            return Ok(value)
        }
        _ => None,
    };

    converted.ok_or_else(|| ArgumentError::WrongType {
        field: field.to_string(),
        expected: expected.to_string(),
        found: json_type_name(&value),
    })
}

/// Report why `s` looks cut off, if it does
///
/// Flags an unterminated `'`, `"` or `` ` `` quote and unbalanced `()`, `[]`,
/// `{}` outside quotes. Outside a quoted span, a quote between two
/// alphanumerics is read as an apostrophe (`O'Brien`, `Momo's`) and ignored.
/// Inside one, the matching quote always closes it.
pub fn detect_truncation(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let mut stack: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' if !is_apostrophe(&chars, i) => quote = Some(c),
                '(' | '[' | '{' => stack.push(c),
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.last() {
                        Some(&top) if top == open => {
                            stack.pop();
                        }
                        Some(&top) => {
                            return Some(format!("`{}` closed by `{}`", top, c));
                        }
                        // A stray closer is odd but not a sign of truncation
                        None => {}
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    if let Some(q) = quote {
        return Some(format!("unterminated {} quote", q));
    }
    stack
        .last()
        .map(|open| format!("unclosed `{}`", open))
}

fn is_apostrophe(chars: &[char], i: usize) -> bool {
    if chars[i] != '\'' {
        return false;
    }
    let before = i.checked_sub(1).and_then(|j| chars.get(j));
    let after = chars.get(i + 1);
    matches!((before, after), (Some(b), Some(a)) if b.is_alphanumeric() && a.is_alphanumeric())
}

/// Returns a human-readable name for the JSON type of a value.
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
