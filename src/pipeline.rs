//! Pipeline domain types: definitions, constraints, usage and traces

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// The evolving key/value map a pipeline carries through its blocks
pub type StateMap = serde_json::Map<String, Value>;

/// One block reference inside a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockDefinition {
    /// Block type name as registered in the block registry
    #[serde(rename = "type")]
    pub block_type: String,
    /// Constructor parameters; values may be template strings
    #[serde(default)]
    pub config: StateMap,
}

/// Field ordering hints for the review UI
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldOrder {
    #[serde(default)]
    pub primary: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default)]
    pub hidden: Vec<String>,
}

/// Validation configuration attached to a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationConfig {
    pub field_order: FieldOrder,
}

/// Parsed pipeline definition with type-safe constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,
    #[serde(default, deserialize_with = "deserialize_constraints")]
    pub constraints: Constraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_config: Option<ValidationConfig>,
}

fn deserialize_constraints<'de, D>(deserializer: D) -> Result<Constraints, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Constraints>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

/// Per-pipeline execution limits. `-1` encodes "unlimited".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(default = "unlimited", deserialize_with = "deserialize_limit")]
    pub max_total_tokens: i64,
    #[serde(default = "unlimited", deserialize_with = "deserialize_limit")]
    pub max_total_input_tokens: i64,
    #[serde(default = "unlimited", deserialize_with = "deserialize_limit")]
    pub max_total_output_tokens: i64,
    #[serde(default = "unlimited", deserialize_with = "deserialize_limit")]
    pub max_total_cached_tokens: i64,
    #[serde(default = "unlimited", deserialize_with = "deserialize_limit")]
    pub max_total_execution_time_seconds: i64,
}

fn unlimited() -> i64 {
    -1
}

/// `null` in a stored definition means "unlimited"
fn deserialize_limit<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<i64>::deserialize(deserializer)?;
    Ok(value.unwrap_or(-1))
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_total_tokens: -1,
            max_total_input_tokens: -1,
            max_total_output_tokens: -1,
            max_total_cached_tokens: -1,
            max_total_execution_time_seconds: -1,
        }
    }
}

impl Constraints {
    /// Check every limit against the given usage. Returns the name of the
    /// first exceeded limit, or `None` when all limits hold. A limit is
    /// exceeded when `current >= limit`; negative limits never trigger.
    pub fn is_exceeded(&self, usage: &Usage) -> Option<&'static str> {
        let checks: [(i64, i64, &'static str); 5] = [
            (self.max_total_tokens, usage.total_tokens(), "max_total_tokens"),
            (
                self.max_total_input_tokens,
                usage.input_tokens,
                "max_total_input_tokens",
            ),
            (
                self.max_total_output_tokens,
                usage.output_tokens,
                "max_total_output_tokens",
            ),
            (
                self.max_total_cached_tokens,
                usage.cached_tokens,
                "max_total_cached_tokens",
            ),
            (
                self.max_total_execution_time_seconds,
                usage.elapsed_time() as i64,
                "max_total_execution_time_seconds",
            ),
        ];

        for (limit, current, name) in checks {
            if limit >= 0 && current >= limit {
                return Some(name);
            }
        }
        None
    }
}

/// Token counters extracted from a provider response or a block's
/// reserved `_usage` output key
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
}

impl TokenCounts {
    pub fn add(&mut self, other: &TokenCounts) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

/// Token usage with wall-clock timing for one execution or one job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cached_tokens: i64,
    /// Seconds since the Unix epoch
    #[serde(default = "epoch_now")]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: Option<f64>,
}

pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Default for Usage {
    fn default() -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            start_time: epoch_now(),
            end_time: None,
        }
    }
}

impl Usage {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cached_tokens
    }

    /// Elapsed seconds; clock-now when `end_time` is unset
    pub fn elapsed_time(&self) -> f64 {
        match self.end_time {
            Some(end) => end - self.start_time,
            None => epoch_now() - self.start_time,
        }
    }

    /// Add token counters from a provider call or another execution
    pub fn add_counts(&mut self, counts: &TokenCounts) {
        self.input_tokens += counts.input_tokens;
        self.output_tokens += counts.output_tokens;
        self.cached_tokens += counts.cached_tokens;
    }

    /// Add another usage's token counters (timing is left untouched)
    pub fn add_tokens(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }

    /// Stamp the end of the measured interval
    pub fn finish(&mut self) {
        self.end_time = Some(epoch_now());
    }
}

/// One entry per block invocation within an execution trace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEntry {
    /// Block type name
    pub block_type: String,
    /// Snapshot of accumulated state before the block ran
    pub input: StateMap,
    /// The mapping the block returned (absent on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StateMap>,
    /// Snapshot of accumulated state after the merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_state: Option<StateMap>,
    /// Wall time the block took, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,
    /// Error message when the block failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a single pipeline execution.
///
/// A job is a batch of executions; each execution produces one record.
/// The `trace_id` groups all provider calls made on behalf of this
/// execution for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Final accumulated state
    pub result: StateMap,
    /// Per-block execution history
    pub trace: Vec<TraceEntry>,
    /// Unique identifier of this execution
    pub trace_id: String,
    /// Token usage accumulated during this execution
    pub usage: Usage,
}

/// One input object from a seed file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedInput {
    /// How many times to execute the pipeline for this seed
    #[serde(default = "default_repetitions")]
    pub repetitions: i64,
    /// Starting accumulated state
    #[serde(default)]
    pub metadata: StateMap,
}

fn default_repetitions() -> i64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: i64, output: i64, cached: i64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            cached_tokens: cached,
            ..Usage::default()
        }
    }

    #[test]
    fn all_unlimited_never_exceeds() {
        let constraints = Constraints::default();
        assert_eq!(constraints.is_exceeded(&usage(1_000_000, 1_000_000, 0)), None);
    }

    #[test]
    fn total_token_limit_triggers_at_boundary() {
        let constraints = Constraints {
            max_total_tokens: 16,
            ..Constraints::default()
        };
        assert_eq!(constraints.is_exceeded(&usage(10, 5, 0)), None);
        assert_eq!(
            constraints.is_exceeded(&usage(10, 6, 0)),
            Some("max_total_tokens")
        );
    }

    #[test]
    fn individual_limits_report_their_name() {
        let constraints = Constraints {
            max_total_output_tokens: 3,
            ..Constraints::default()
        };
        assert_eq!(
            constraints.is_exceeded(&usage(100, 3, 0)),
            Some("max_total_output_tokens")
        );
    }

    #[test]
    fn definition_round_trips_with_sentinels() {
        let definition = PipelineDefinition {
            blocks: vec![BlockDefinition {
                block_type: "TextGenerator".to_string(),
                config: StateMap::new(),
            }],
            constraints: Constraints {
                max_total_tokens: 500,
                ..Constraints::default()
            },
            validation_config: None,
        };
        let json = serde_json::to_string(&definition).unwrap();
        let parsed: PipelineDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, definition);
    }

    #[test]
    fn null_constraints_parse_as_unlimited() {
        let parsed: PipelineDefinition =
            serde_json::from_str(r#"{"blocks": [], "constraints": {"max_total_tokens": null}}"#)
                .unwrap();
        assert_eq!(parsed.constraints.max_total_tokens, -1);

        let parsed: PipelineDefinition =
            serde_json::from_str(r#"{"blocks": [], "constraints": null}"#).unwrap();
        assert_eq!(parsed.constraints, Constraints::default());
    }

    #[test]
    fn usage_accumulates_counts() {
        let mut total = Usage::default();
        total.add_counts(&TokenCounts {
            input_tokens: 5,
            output_tokens: 3,
            cached_tokens: 0,
        });
        total.add_counts(&TokenCounts {
            input_tokens: 5,
            output_tokens: 3,
            cached_tokens: 0,
        });
        assert_eq!(total.total_tokens(), 16);
    }

    #[test]
    fn elapsed_uses_end_time_when_set() {
        let mut usage = Usage::default();
        usage.start_time = 100.0;
        usage.end_time = Some(160.0);
        assert!((usage.elapsed_time() - 60.0).abs() < f64::EPSILON);
    }
}
