//! Output formatting: JSON and plain.

use serde_json::Value;

use crate::cli::OutputFormat;

/// Render a JSON value in the chosen format.
///
/// `plain` prints strings bare, arrays one element per line and objects as
/// `key = value` lines.
pub fn render(format: OutputFormat, value: &Value) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).unwrap_or_default(),
        OutputFormat::JsonCompact => value.to_string(),
        OutputFormat::Plain => match value {
            Value::String(s) => s.clone(),
            Value::Array(items) => items.iter().map(plain_scalar).collect::<Vec<_>>().join("\n"),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| format!("{k} = {}", plain_scalar(v)))
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        },
    }
}

fn plain_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn print(format: OutputFormat, value: &Value) {
    println!("{}", render(format, value));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_output_is_line_oriented() {
        assert_eq!(render(OutputFormat::Plain, &json!(["a", 1])), "a\n1");
        assert_eq!(render(OutputFormat::Plain, &json!({"/a": "x"})), "/a = x");
        assert_eq!(render(OutputFormat::Plain, &json!("k")), "k");
        assert_eq!(render(OutputFormat::JsonCompact, &json!({"a": [1]})), r#"{"a":[1]}"#);
    }
}
