//! Strict template rendering for block configuration
//!
//! Block config values may embed `{{ expression }}` substitutions evaluated
//! against the accumulated state at invocation time. Rendering is strict:
//! any reference to a missing variable fails with an error naming it.

use crate::error::{EngineError, EngineResult};
use crate::pipeline::StateMap;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use tera::{Context, Tera};

/// Serialize a value to JSON, Jinja-style `tojson`
fn tojson_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let rendered = serde_json::to_string(value)
        .map_err(|e| tera::Error::msg(format!("tojson failed: {e}")))?;
    Ok(Value::String(rendered))
}

/// Flatten a tera error chain into one message; the undefined-variable
/// cause lives in the source chain, not the top-level display.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn snippet(template: &str) -> String {
    if template.len() > 200 {
        format!("{}...", &template[..200])
    } else {
        template.to_string()
    }
}

/// Render a template string against the accumulated state.
/// Undefined variables and syntax errors both surface as
/// [`EngineError::Template`] carrying the snippet and the cause.
pub fn render_template(template: &str, state: &StateMap) -> EngineResult<String> {
    let context = Context::from_serialize(Value::Object(state.clone())).map_err(|e| {
        EngineError::Template {
            template: snippet(template),
            message: error_chain(&e),
        }
    })?;

    let mut tera = Tera::default();
    tera.register_filter("tojson", tojson_filter);
    tera.render_str(template, &context)
        .map_err(|e| EngineError::Template {
            template: snippet(template),
            message: error_chain(&e),
        })
}

/// Normalise a "JSON-or-template" config value into a stored template
/// string: lists and objects are JSON-serialised, strings pass through.
pub fn normalize_json_or_template(value: &Value) -> EngineResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Array(_) | Value::Object(_) => Ok(serde_json::to_string(value)?),
        Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// Render a stored template and parse the result as a JSON array,
/// asserting the declared shape
pub fn render_and_parse_array(
    template: &str,
    state: &StateMap,
    field_name: &str,
) -> EngineResult<Vec<Value>> {
    let rendered = render_template(template, state)?;
    let parsed: Value = serde_json::from_str(&rendered).map_err(|e| {
        EngineError::Block(format!("{field_name} must be valid JSON: {e} (rendered: {rendered})"))
    })?;
    match parsed {
        Value::Array(items) => Ok(items),
        _ => Err(EngineError::Block(format!(
            "{field_name} must be a JSON array (rendered: {rendered})"
        ))),
    }
}

/// Collect a rendered JSON array of strings, rejecting non-string items
pub fn render_string_list(
    template: &str,
    state: &StateMap,
    field_name: &str,
) -> EngineResult<Vec<String>> {
    let items = render_and_parse_array(template, state, field_name)?;
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(EngineError::Block(format!(
                "all items in {field_name} must be strings (found: {other})"
            ))),
        })
        .collect()
}
