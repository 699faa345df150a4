//! Runner contract, dispatcher, and transformer implementations.
//!
//! A [`Runner`] is a stateless-per-message transformer with a two-method
//! contract: `process` mutates a
//! [`RunnerMessage`](bridge_message::RunnerMessage) in place, `close`
//! releases resources. Implementations in this crate:
//!
//! - [`CliRunner`]: feeds the encoded message to a child process and
//!   applies the decoded reply
//! - [`WasmRunner`]: instantiates a compiled WebAssembly module per
//!   message inside a WASI sandbox
//! - [`JsonLogicRunner`]: applies a pre-validated JSONLogic rule
//! - [`CelRunner`]: evaluates a compiled CEL expression
//! - [`LlmRunner`]: calls an OpenAI-compatible chat completions endpoint
//!
//! The [`Pipeline`] dispatcher drives messages from a source channel
//! through the configured runner chain into a [`Target`], settling each
//! message with exactly one ack or nak.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod cel;
mod cli;
mod error;
mod llm;
mod logic;
mod pipeline;
mod runner;
mod wasm;

pub use cel::{CelRunner, CelRunnerConfig};
pub use cli::{CliRunner, CliRunnerConfig};
pub use error::{RunnerError, RunnerResult};
pub use llm::{LlmRunner, LlmRunnerConfig};
pub use logic::{JsonLogicRunner, JsonLogicRunnerConfig};
pub use pipeline::{Pipeline, Target};
pub use runner::{Health, Runner};
pub use wasm::{WasmRunner, WasmRunnerConfig};
