//! JSONLogic runner.
//!
//! The rule is loaded from an inline string or a file, validated for
//! size, nesting depth, operator allow-list, and total operation count
//! before first use, then applied per message on a blocking thread under
//! the runner timeout. Engine panics surface as evaluation errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_message::RunnerMessage;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{RunnerError, RunnerResult};
use crate::runner::Runner;

/// Default cap on the raw rule text.
const DEFAULT_MAX_RULE_SIZE: usize = 100 * 1024;
/// Maximum rule nesting depth.
const MAX_RULE_DEPTH: usize = 50;
/// Maximum total operations in a rule.
const MAX_RULE_OPS: usize = 1000;

/// Operators a rule may use.
const ALLOWED_OPS: &[&str] = &[
    "var", "missing", "missing_some", "if", "==", "===", "!=", "!==", "!", "!!", "or", "and",
    "<", ">", "<=", ">=", "max", "min", "+", "-", "*", "/", "%", "map", "reduce", "filter",
    "all", "none", "some", "merge", "in", "cat", "substr", "log",
];

/// Configuration for [`JsonLogicRunner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct JsonLogicRunnerConfig {
    /// Inline rule JSON. Exactly one of `rule` and `rulePath`.
    #[serde(default)]
    pub rule: Option<String>,
    /// Path to a rule file.
    #[serde(default)]
    pub rule_path: Option<String>,
    /// Per-message timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Cap on the raw rule text in bytes.
    #[serde(default = "default_max_rule_size")]
    pub max_rule_size: usize,
}

fn default_timeout() -> u64 {
    30_000
}

fn default_max_rule_size() -> usize {
    DEFAULT_MAX_RULE_SIZE
}

/// Applies a pre-validated JSONLogic rule to each message.
///
/// The rule sees `{"data": <parsed payload>, "metadata": {..}}`; a payload
/// that is not valid JSON is exposed as a string. The result replaces the
/// message data: string results as raw bytes, everything else as compact
/// JSON.
pub struct JsonLogicRunner {
    rule: Arc<Value>,
    timeout: Duration,
}

impl JsonLogicRunner {
    /// Load and validate the rule.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for a missing or ambiguous rule
    /// source and validation errors for oversized, too-deep, too-complex,
    /// or disallowed rules.
    pub fn new(config: &JsonLogicRunnerConfig) -> RunnerResult<Self> {
        let raw = match (&config.rule, &config.rule_path) {
            (Some(rule), None) => rule.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| RunnerError::Config(format!("rulePath {path:?}: {e}")))?,
            _ => {
                return Err(RunnerError::Config(
                    "exactly one of rule and rulePath is required".to_string(),
                ));
            },
        };

        if raw.len() > config.max_rule_size {
            return Err(RunnerError::Validation(format!(
                "rule size {} exceeds {}",
                raw.len(),
                config.max_rule_size
            )));
        }

        let rule: Value = serde_json::from_str(&raw)
            .map_err(|e| RunnerError::Validation(format!("rule is not valid JSON: {e}")))?;

        let allowed: HashSet<&str> = ALLOWED_OPS.iter().copied().collect();
        let ops = validate_rule(&rule, &allowed)?;
        if ops > MAX_RULE_OPS {
            return Err(RunnerError::Validation(format!(
                "rule complexity {ops} exceeds {MAX_RULE_OPS} operations"
            )));
        }

        Ok(Self {
            rule: Arc::new(rule),
            timeout: Duration::from_millis(config.timeout),
        })
    }
}

#[async_trait]
impl Runner for JsonLogicRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        let metadata = msg.metadata().await?;
        let data = msg.data().await?;

        let data_value = parse_data(&data);
        let meta_value: Value = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect::<serde_json::Map<_, _>>()
            .into();
        let input = json!({ "data": data_value, "metadata": meta_value });

        let rule = Arc::clone(&self.rule);
        let evaluation =
            tokio::task::spawn_blocking(move || jsonlogic::apply(&rule, &input));

        let result = match tokio::time::timeout(self.timeout, evaluation).await {
            Err(_) => {
                return Err(RunnerError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            },
            Ok(Err(join)) if join.is_panic() => {
                return Err(RunnerError::Expression(
                    "rule evaluation panicked".to_string(),
                ));
            },
            Ok(Err(join)) => return Err(RunnerError::Internal(join.to_string())),
            Ok(Ok(Err(e))) => return Err(RunnerError::Expression(e.to_string())),
            Ok(Ok(Ok(value))) => value,
        };

        msg.set_data(result_to_bytes(&result)?);
        Ok(())
    }

    async fn close(&self) -> RunnerResult<()> {
        Ok(())
    }
}

fn parse_data(data: &[u8]) -> Value {
    serde_json::from_slice(data)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned()))
}

fn result_to_bytes(value: &Value) -> RunnerResult<Bytes> {
    match value {
        Value::String(s) => Ok(Bytes::from(s.clone().into_bytes())),
        other => serde_json::to_vec(other)
            .map(Bytes::from)
            .map_err(|e| RunnerError::Expression(e.to_string())),
    }
}

/// Walk the rule, enforcing depth and the operator allow-list. Returns
/// the number of operations.
fn validate_rule(rule: &Value, allowed: &HashSet<&str>) -> RunnerResult<usize> {
    fn walk(value: &Value, depth: usize, allowed: &HashSet<&str>) -> RunnerResult<usize> {
        if depth > MAX_RULE_DEPTH {
            return Err(RunnerError::Validation(format!(
                "rule nesting exceeds depth {MAX_RULE_DEPTH}"
            )));
        }
        match value {
            Value::Object(map) => {
                let mut ops = 0;
                for (op, args) in map {
                    if !allowed.contains(op.as_str()) {
                        return Err(RunnerError::Validation(format!(
                            "operator {op:?} is not allowed"
                        )));
                    }
                    ops += 1 + walk(args, depth + 1, allowed)?;
                }
                Ok(ops)
            },
            Value::Array(items) => {
                let mut ops = 0;
                for item in items {
                    ops += walk(item, depth + 1, allowed)?;
                }
                Ok(ops)
            },
            _ => Ok(0),
        }
    }
    walk(rule, 1, allowed)
}

#[cfg(test)]
mod tests {
    use bridge_message::{Envelope, Metadata};

    use super::*;

    fn runner(rule: &str) -> JsonLogicRunner {
        JsonLogicRunner::new(&JsonLogicRunnerConfig {
            rule: Some(rule.to_string()),
            rule_path: None,
            timeout: 5_000,
            max_rule_size: DEFAULT_MAX_RULE_SIZE,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_rule_reads_data_field() {
        let runner = runner(r#"{"var": "data.value"}"#);
        let mut msg = RunnerMessage::new(std::sync::Arc::new(Envelope::new(
            Metadata::new(),
            Bytes::from_static(br#"{"value": 41}"#),
        )));
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"41"));
    }

    #[tokio::test]
    async fn test_rule_reads_metadata() {
        let runner = runner(r#"{"var": "metadata.kind"}"#);
        let mut msg = RunnerMessage::new(std::sync::Arc::new(Envelope::new(
            Metadata::try_from_pairs([("kind", "alert")]).unwrap(),
            Bytes::from_static(b"{}"),
        )));
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"alert"));
    }

    #[tokio::test]
    async fn test_non_json_payload_exposed_as_string() {
        let runner = runner(r#"{"cat": [{"var": "data"}, "!"]}"#);
        let mut msg = RunnerMessage::new(std::sync::Arc::new(Envelope::new(
            Metadata::new(),
            Bytes::from_static(b"plain text"),
        )));
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"plain text!"));
    }

    #[test]
    fn test_disallowed_operator() {
        let err = JsonLogicRunner::new(&JsonLogicRunnerConfig {
            rule: Some(r#"{"eval": "gotcha"}"#.to_string()),
            rule_path: None,
            timeout: 5_000,
            max_rule_size: DEFAULT_MAX_RULE_SIZE,
        })
        .unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[test]
    fn test_rule_size_cap() {
        let big = format!(r#"{{"cat": ["{}"]}}"#, "x".repeat(DEFAULT_MAX_RULE_SIZE));
        let err = JsonLogicRunner::new(&JsonLogicRunnerConfig {
            rule: Some(big),
            rule_path: None,
            timeout: 5_000,
            max_rule_size: DEFAULT_MAX_RULE_SIZE,
        })
        .unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[test]
    fn test_rule_source_exclusivity() {
        let err = JsonLogicRunner::new(&JsonLogicRunnerConfig {
            rule: None,
            rule_path: None,
            timeout: 5_000,
            max_rule_size: DEFAULT_MAX_RULE_SIZE,
        })
        .unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }

    #[test]
    fn test_depth_cap() {
        let mut rule = String::new();
        for _ in 0..60 {
            rule.push_str(r#"{"!": "#);
        }
        rule.push_str("true");
        for _ in 0..60 {
            rule.push('}');
        }
        let err = JsonLogicRunner::new(&JsonLogicRunnerConfig {
            rule: Some(rule),
            rule_path: None,
            timeout: 5_000,
            max_rule_size: DEFAULT_MAX_RULE_SIZE,
        })
        .unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }
}
