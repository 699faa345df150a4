//! CEL expression runner.
//!
//! The expression is compiled once; per message it is evaluated on a
//! blocking thread with the payload bound as `data` and, when enabled,
//! the effective metadata bound as `metadata`. Input and output sizes are
//! capped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_message::RunnerMessage;
use bytes::Bytes;
use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Program, Value as CelValue};
use serde::Deserialize;

use crate::error::{RunnerError, RunnerResult};
use crate::runner::Runner;

const DEFAULT_SIZE_CAP: usize = 1024 * 1024;

/// Configuration for [`CelRunner`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CelRunnerConfig {
    /// The CEL expression.
    pub expression: String,
    /// Bind the effective metadata as the `metadata` variable.
    #[serde(default = "default_true")]
    pub expose_metadata: bool,
    /// Per-message timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Cap on the payload fed to the expression.
    #[serde(default = "default_size_cap")]
    pub max_input_size: usize,
    /// Cap on the produced payload.
    #[serde(default = "default_size_cap")]
    pub max_output_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30_000
}

fn default_size_cap() -> usize {
    DEFAULT_SIZE_CAP
}

/// Evaluates a compiled CEL expression against each message.
pub struct CelRunner {
    program: Arc<Program>,
    config: CelRunnerConfig,
    timeout: Duration,
}

impl CelRunner {
    /// Compile the expression.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Config`] when the expression does not parse.
    pub fn new(config: CelRunnerConfig) -> RunnerResult<Self> {
        let program = Program::compile(&config.expression)
            .map_err(|e| RunnerError::Config(format!("expression compile failed: {e}")))?;
        let timeout = Duration::from_millis(config.timeout);
        Ok(Self {
            program: Arc::new(program),
            config,
            timeout,
        })
    }
}

#[async_trait]
impl Runner for CelRunner {
    async fn process(&self, msg: &mut RunnerMessage) -> RunnerResult<()> {
        let data = msg.data().await?;
        if data.len() > self.config.max_input_size {
            return Err(RunnerError::Validation(format!(
                "input size {} exceeds {}",
                data.len(),
                self.config.max_input_size
            )));
        }

        // Binary payloads are exposed in their base64 form so the
        // expression always sees a string.
        let data_text = match std::str::from_utf8(&data) {
            Ok(text) => text.to_string(),
            Err(_) => BASE64.encode(&data),
        };

        let metadata = if self.config.expose_metadata {
            let metadata = msg.metadata().await?;
            Some(
                metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<String, String>>(),
            )
        } else {
            None
        };

        let program = Arc::clone(&self.program);
        let evaluation = tokio::task::spawn_blocking(move || {
            let mut context = Context::default();
            context
                .add_variable("data", data_text)
                .map_err(|e| RunnerError::Expression(e.to_string()))?;
            if let Some(metadata) = metadata {
                context
                    .add_variable("metadata", metadata)
                    .map_err(|e| RunnerError::Expression(e.to_string()))?;
            }
            program
                .execute(&context)
                .map_err(|e| RunnerError::Expression(e.to_string()))
        });

        let value = match tokio::time::timeout(self.timeout, evaluation).await {
            Err(_) => {
                return Err(RunnerError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            },
            Ok(Err(join)) if join.is_panic() => {
                return Err(RunnerError::Expression(
                    "expression evaluation panicked".to_string(),
                ));
            },
            Ok(Err(join)) => return Err(RunnerError::Internal(join.to_string())),
            Ok(Ok(result)) => result?,
        };

        let out = value_to_bytes(&value)?;
        if out.len() > self.config.max_output_size {
            return Err(RunnerError::Validation(format!(
                "output size {} exceeds {}",
                out.len(),
                self.config.max_output_size
            )));
        }
        msg.set_data(out);
        Ok(())
    }

    async fn close(&self) -> RunnerResult<()> {
        Ok(())
    }
}

/// Turn an evaluation result into payload bytes: strings and byte values
/// verbatim, scalars textual, lists and maps as compact JSON.
fn value_to_bytes(value: &CelValue) -> RunnerResult<Bytes> {
    match value {
        CelValue::String(s) => Ok(Bytes::from(s.as_ref().clone().into_bytes())),
        CelValue::Bytes(b) => Ok(Bytes::from(b.as_ref().clone())),
        CelValue::Int(i) => Ok(Bytes::from(i.to_string().into_bytes())),
        CelValue::UInt(u) => Ok(Bytes::from(u.to_string().into_bytes())),
        CelValue::Float(f) => Ok(Bytes::from(f.to_string().into_bytes())),
        CelValue::Bool(b) => Ok(Bytes::from(b.to_string().into_bytes())),
        CelValue::Null => Ok(Bytes::new()),
        other @ (CelValue::List(_) | CelValue::Map(_)) => {
            let json = cel_to_json(other)?;
            serde_json::to_vec(&json)
                .map(Bytes::from)
                .map_err(|e| RunnerError::Expression(e.to_string()))
        },
        other => Err(RunnerError::Expression(format!(
            "unsupported result type: {other:?}"
        ))),
    }
}

fn cel_to_json(value: &CelValue) -> RunnerResult<serde_json::Value> {
    use serde_json::Value;
    match value {
        CelValue::Null => Ok(Value::Null),
        CelValue::Bool(b) => Ok(Value::Bool(*b)),
        CelValue::Int(i) => Ok(Value::from(*i)),
        CelValue::UInt(u) => Ok(Value::from(*u)),
        CelValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| RunnerError::Expression("non-finite float result".to_string())),
        CelValue::String(s) => Ok(Value::String(s.as_ref().clone())),
        CelValue::Bytes(b) => Ok(Value::String(BASE64.encode(b.as_ref()))),
        CelValue::List(items) => items
            .iter()
            .map(cel_to_json)
            .collect::<RunnerResult<Vec<_>>>()
            .map(Value::Array),
        CelValue::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map.map.iter() {
                let key = match key {
                    Key::String(s) => s.as_ref().clone(),
                    Key::Int(i) => i.to_string(),
                    Key::Uint(u) => u.to_string(),
                    Key::Bool(b) => b.to_string(),
                };
                out.insert(key, cel_to_json(val)?);
            }
            Ok(Value::Object(out))
        },
        other => Err(RunnerError::Expression(format!(
            "unsupported value in result: {other:?}"
        ))),
    }
}
