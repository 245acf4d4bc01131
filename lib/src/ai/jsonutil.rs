//! Recovery for malformed model-produced JSON.
//!
//! Models sometimes emit several concatenated JSON objects with no separator,
//! or a JSON string whose content is itself concatenated JSON text. The
//! recovery is a streaming parse that stops after the first complete
//! top-level value and discards trailing bytes.

use serde_json::Value;

/// Parse the first complete top-level JSON value in `text`, ignoring
/// anything after it.
pub fn json_first_value(text: &str) -> anyhow::Result<Value> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(anyhow::Error::from(e).context("malformed JSON payload")),
        None => anyhow::bail!("empty JSON payload"),
    }
}

/// `json_first_value`, additionally unwrapping the JSON-encoded-string case:
/// a string value whose content parses as a JSON object is replaced by that
/// object.
pub fn tolerant_value(text: &str) -> anyhow::Result<Value> {
    let value = json_first_value(text)?;
    if let Value::String(inner) = &value {
        if let Ok(unwrapped @ (Value::Object(_) | Value::Array(_))) = json_first_value(inner) {
            return Ok(unwrapped);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_of_concatenated_objects_wins() {
        let value = json_first_value(r#"{"a":1}{"b":2}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn quoted_concatenated_objects_recover() {
        let value = tolerant_value(r#""{\"a\":1}{\"b\":2}""#).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn well_formed_input_passes_through() {
        let value = tolerant_value(r#"{"path": "threads.all"}"#).unwrap();
        assert_eq!(value, json!({"path": "threads.all"}));
    }

    #[test]
    fn plain_string_stays_a_string() {
        let value = tolerant_value(r#""just text""#).unwrap();
        assert_eq!(value, json!("just text"));
    }

    #[test]
    fn leading_whitespace_is_tolerated() {
        let value = json_first_value("  \n {\"a\":1}junk").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(json_first_value("not json").is_err());
        assert!(json_first_value("").is_err());
    }
}
