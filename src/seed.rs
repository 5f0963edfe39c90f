//! Seed file parsing and validation
//!
//! Seed files are JSON (one object or a list of `{repetitions, metadata}`)
//! or Markdown, where the whole file becomes a single seed carrying the
//! text as `file_content`.

use crate::error::{EngineError, EngineResult};
use crate::pipeline::{SeedInput, StateMap};
use serde_json::Value;
use std::path::Path;

/// Outcome of validating a parsed seed list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SeedValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Convert a parsed JSON value into seed inputs. A single object counts
/// as one seed; non-integer `repetitions` coerce to 1.
pub fn seeds_from_value(value: Value) -> EngineResult<Vec<SeedInput>> {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut seeds = Vec::with_capacity(items.len());
    for item in items {
        let Value::Object(obj) = item else {
            return Err(EngineError::Validation(
                "each seed must be a JSON object".to_string(),
            ));
        };
        let repetitions = obj.get("repetitions").map_or(1, |v| v.as_i64().unwrap_or(1));
        let metadata = match obj.get("metadata") {
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(EngineError::Validation(
                    "seed metadata must be a JSON object".to_string(),
                ))
            }
            None => StateMap::new(),
        };
        seeds.push(SeedInput {
            repetitions,
            metadata,
        });
    }
    Ok(seeds)
}

/// Load seeds from a file path. `.md` and `.markdown` files become one
/// seed wrapping the file text; anything else is parsed as JSON.
pub fn load_seed_file(path: &Path) -> EngineResult<Vec<SeedInput>> {
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    if extension == "md" || extension == "markdown" {
        let mut metadata = StateMap::new();
        metadata.insert("file_content".to_string(), Value::String(content));
        return Ok(vec![SeedInput {
            repetitions: 1,
            metadata,
        }]);
    }

    let value: Value = serde_json::from_str(&content)?;
    seeds_from_value(value)
}

/// Structural validation: negative repetitions are errors, zero
/// repetitions is a skip surfaced as a warning.
pub fn validate_seeds(seeds: &[SeedInput]) -> SeedValidation {
    let mut validation = SeedValidation::default();
    for (index, seed) in seeds.iter().enumerate() {
        if seed.repetitions < 0 {
            validation.errors.push(format!(
                "seed {}: repetitions must not be negative (got {})",
                index + 1,
                seed.repetitions
            ));
        } else if seed.repetitions == 0 {
            validation.warnings.push(format!(
                "seed {}: repetitions is 0, this seed will be skipped",
                index + 1
            ));
        }
    }
    validation
}

/// Total number of executions a seed list will drive
pub fn total_executions(seeds: &[SeedInput]) -> i64 {
    seeds.iter().map(|s| s.repetitions.max(0)).sum()
}
